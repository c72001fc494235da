//! Weft Core Library
//!
//! This crate provides the graph model, matching engines, and wire
//! types for the Weft distributed job-execution orchestrator.
//!
//! # Overview
//!
//! A Weft flow is a DAG of codelets connected by typed edges. The
//! orchestrator coarsens the DAG into equivalence classes of nodes
//! that must transition in lockstep, resolves dependencies with
//! countdowns, and assigns workers to execute-eligible classes through
//! bipartite matching.
//!
//! # Key Components
//!
//! - **Flow**: arena-based graph of nodes, edges, and classes, with
//!   transactional construction and subflow embedding
//! - **CountDown**: the "wait for all N parties" set driving
//!   dependency resolution, barriers, and flow completion
//! - **Matching**: Hungarian and maximum-flow requirement matchers
//! - **Message**: the tagged control-message wire vocabulary
//!
//! # Example
//!
//! ```ignore
//! use weft_core::prelude::*;
//!
//! let mut flow = Flow::new(FlowId(0), "example");
//! flow.build(vec![EmbedRequest::initial(builder, parameters)])?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codelet;
pub mod countdown;
pub mod error;
pub mod flow;
pub mod matching;
pub mod message;
pub mod prelude;
pub mod types;

pub use countdown::CountDown;
pub use error::{Result, WeftError};
pub use flow::{Flow, FlowEdge, FlowNode, FlowStatus, LogicalNode, LogicalNodeStatus};
pub use message::{ControlMessage, ResourceDescriptor, ResourceSpec};
pub use types::{ClassId, EdgeId, FlowId, NodeId, WorkerId};
