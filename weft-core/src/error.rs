//! Error types for Weft.
//!
//! Errors carry the identifiers needed to act on them: the flow or node
//! involved, and the cause where one exists. Matching infeasibility is
//! deliberately *not* an error anywhere in this taxonomy; an unmatchable
//! requirement set is deferred to the next refresh pass.

use crate::types::{NodeId, WorkerId};
use thiserror::Error;

/// The main error type for Weft operations.
#[derive(Debug, Error)]
pub enum WeftError {
    /// Flow construction or subflow embedding failed.
    ///
    /// The owning flow's graph is rolled back to its pre-build state
    /// before this error is surfaced.
    #[error("flow '{flow}' build failed: {cause}")]
    Build {
        /// The flow being built.
        flow: String,
        /// What went wrong.
        cause: String,
    },

    /// An embedding introduced a cycle or disconnected a required node.
    #[error("flow '{flow}' graph is not a DAG after embedding")]
    Cycle {
        /// The flow whose graph failed the traversal check.
        flow: String,
    },

    /// A connection sent a message its state machine cannot accept.
    ///
    /// Fatal to that connection only; the connection is invalidated and
    /// all further messages from it are dropped.
    #[error("protocol violation from {worker}: {message}")]
    Protocol {
        /// The offending connection.
        worker: WorkerId,
        /// Description of the violation.
        message: String,
    },

    /// A node exhausted its retry budget.
    #[error("{node} exceeded maximum failed execution limit of {retries} retries")]
    RetryExhausted {
        /// The node that kept failing.
        node: NodeId,
        /// The configured budget.
        retries: u32,
    },

    /// A worker failed to acknowledge within its deadline.
    #[error("{worker} timed out awaiting acknowledgement")]
    Timeout {
        /// The worker that went silent.
        worker: WorkerId,
    },

    /// A node exceeded its execution time limit.
    #[error("maximum execution time limit of {limit_ms} ms exceeded")]
    ExecutionExpired {
        /// The configured limit in milliseconds.
        limit_ms: u64,
    },

    /// A returned parameter document could not be applied.
    #[error("parameter assignment failed: {cause}")]
    Parameter {
        /// What went wrong.
        cause: String,
    },

    /// The processing task has exited; pending requests cannot complete.
    #[error("the processing task has exited")]
    ProcessorExited,

    /// The flow was purged by an administrative request.
    #[error("the flow was purged")]
    Purged,

    /// An internal error crossing the listener boundary.
    ///
    /// Wraps the original cause so a failure is reportable even in a
    /// context without access to the original error value.
    #[error("listener-boundary failure: {message}")]
    Listener {
        /// The original error, rendered.
        message: String,
        /// The original cause, when still available.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl WeftError {
    /// Wraps an arbitrary error for transport across the listener
    /// boundary, preserving its rendered message and cause chain.
    pub fn listener<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        WeftError::Listener {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

/// Result type for Weft operations.
pub type Result<T> = std::result::Result<T, WeftError>;
