//! Worker-side execution contracts.
//!
//! A codelet is the unit of work a worker runs on behalf of the
//! orchestrator. The orchestrator itself never executes one; it only
//! ships [`ResourceDescriptor`](crate::message::ResourceDescriptor)s
//! naming the codelet class and its resources. These traits define
//! what a worker runtime must hand the codelet when it does.

use crate::error::Result;
use crate::message::{HandlePair, ResourceSpec};
use serde_json::Value;
use std::net::SocketAddr;

/// A basic unit of work.
pub trait Codelet: Send + Sync {
    /// Executes against the staged input and output resources.
    ///
    /// An embedding codelet returns the parameter document for its
    /// nested builder; ordinary codelets return `None`.
    fn run(
        &self,
        inputs: &[ResourceView],
        outputs: &mut [ResourceView],
        parameters: &Value,
    ) -> Result<Option<Value>>;
}

/// A codelet's view of one edge resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceView {
    /// A named collection of (handle, stem) pairs. Input views carry
    /// the producer's pairs; output views start empty and collect what
    /// the codelet puts.
    Handle {
        /// The edge name the view was rendered from.
        name: String,
        /// The pairs read (input) or accumulated (output).
        handles: Vec<HandlePair>,
    },
    /// One endpoint of a negotiated byte stream.
    Stream {
        /// The edge name the view was rendered from.
        name: String,
        /// The identifier both endpoints present during negotiation.
        identifier: String,
        /// The peer to connect to, or `None` when this endpoint
        /// expects the incoming connection.
        address: Option<SocketAddr>,
    },
}

impl ResourceView {
    /// Builds the view a worker derives from a wire resource.
    pub fn from_spec(spec: &ResourceSpec) -> Self {
        match spec {
            ResourceSpec::Handle { name, handles } => ResourceView::Handle {
                name: name.clone(),
                handles: handles.clone(),
            },
            ResourceSpec::Stream {
                identifier,
                name,
                address,
                ..
            } => ResourceView::Stream {
                name: name.clone(),
                identifier: identifier.clone(),
                address: *address,
            },
        }
    }

    /// The edge name the view was rendered from.
    pub fn name(&self) -> &str {
        match self {
            ResourceView::Handle { name, .. } => name,
            ResourceView::Stream { name, .. } => name,
        }
    }

    /// Appends a pair to a handle view. No effect on streams.
    pub fn put(&mut self, pair: HandlePair) {
        if let ResourceView::Handle { handles, .. } = self {
            handles.push(pair);
        }
    }

    /// The pairs of a handle view; empty for streams.
    pub fn handles(&self) -> &[HandlePair] {
        match self {
            ResourceView::Handle { handles, .. } => handles,
            ResourceView::Stream { .. } => &[],
        }
    }
}
