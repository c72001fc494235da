//! Prelude for convenient imports.
//!
//! This module re-exports the most commonly used types and traits.
//!
//! # Example
//!
//! ```ignore
//! use weft_core::prelude::*;
//! ```

// Core types
pub use crate::types::{create_identifier, ClassId, EdgeId, FlowId, NodeId, WorkerId};

// Error handling
pub use crate::error::{Result, WeftError};

// The flow graph
pub use crate::flow::build::{BuildContext, EmbedRequest, FlowBuilder, FnBuilder};
pub use crate::flow::{
    EdgeKind, Flow, FlowEdge, FlowNode, FlowStatus, LogicalEdge, LogicalNode, LogicalNodeStatus,
};

// Synchronization
pub use crate::countdown::CountDown;

// Matching
pub use crate::matching::{match_requirements, MatcherKind, Requirement};

// Wire types
pub use crate::message::{
    ControlMessage, EdgeParameters, HandlePair, ResourceDescriptor, ResourceSpec,
};

// Worker-side contracts
pub use crate::codelet::{Codelet, ResourceView};
