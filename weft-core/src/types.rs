//! Strongly-typed identifiers for Weft entities.
//!
//! Graph structures are arenas keyed by these ids: edges store endpoint
//! ids rather than references, so cloning a flow is a plain map copy and
//! no two clones share mutable graph state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier for a flow registered with an orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowId(pub u64);

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "flow_{}", self.0)
    }
}

/// Identifier for a physical node within a flow.
///
/// Node ids are stable for the lifetime of the node; subflow embedding
/// allocates fresh ids and never reuses a deleted one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node_{}", self.0)
    }
}

/// Identifier for a physical edge within a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeId(pub u32);

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "edge_{}", self.0)
    }
}

/// Identifier for a logical node (equivalence class) within a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClassId(pub u32);

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class_{}", self.0)
    }
}

/// Identifier for a connected worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker_{}", self.0)
    }
}

static IDENTIFIER_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Mints a process-unique identifier string.
///
/// Used for stream edge identifiers, which must be regenerated on every
/// dispatch so that stale stream handshakes from an earlier attempt
/// cannot collide with the current one.
pub fn create_identifier() -> String {
    format!("{:08x}", IDENTIFIER_COUNTER.fetch_add(1, Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_unique() {
        let a = create_identifier();
        let b = create_identifier();
        assert_ne!(a, b);
        assert_eq!(a.len(), 8);
    }

    #[test]
    fn display_forms() {
        assert_eq!(NodeId(3).to_string(), "node_3");
        assert_eq!(ClassId(0).to_string(), "class_0");
        assert_eq!(WorkerId(7).to_string(), "worker_7");
    }
}
