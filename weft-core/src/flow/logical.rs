//! Logical nodes: equivalence classes of flow nodes that transition
//! together.
//!
//! A logical node is the unit the scheduler reasons about. Its members
//! are the flow nodes connected by stream edges, which must all hold
//! their pipeline stage in lockstep: a streaming pair cannot have one
//! end acquiring resources while the other is already executing.

use crate::countdown::CountDown;
use crate::types::{ClassId, NodeId};
use serde::Serialize;
use std::collections::HashSet;

/// Lifecycle status of a logical node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalNodeStatus {
    /// Pending execution on unmet dependencies.
    PendingDependency,
    /// Dependencies met; awaiting worker assignment.
    PendingExecute,
    /// Awaiting RESOURCE_ACK from every member's worker.
    Resource,
    /// Awaiting PREPARE_ACK from every member's worker.
    Prepare,
    /// Awaiting EXECUTE_ACK from every member's worker.
    Execute,
    /// Completed successfully.
    Finished,
    /// Failed to complete.
    Failed,
}

impl LogicalNodeStatus {
    /// Eligible to be picked up by the refresh pass.
    pub fn is_executable(self) -> bool {
        matches!(
            self,
            LogicalNodeStatus::PendingDependency | LogicalNodeStatus::PendingExecute
        )
    }

    /// Mid-flight: workers are bound and acknowledging.
    pub fn is_executing(self) -> bool {
        matches!(
            self,
            LogicalNodeStatus::Resource | LogicalNodeStatus::Prepare | LogicalNodeStatus::Execute
        )
    }

    /// Completed successfully.
    pub fn is_finished(self) -> bool {
        matches!(self, LogicalNodeStatus::Finished)
    }

    /// May be merged into a larger class during subflow embedding.
    /// Mid-flight classes are never merged.
    pub fn is_mergeable(self) -> bool {
        matches!(
            self,
            LogicalNodeStatus::PendingDependency
                | LogicalNodeStatus::PendingExecute
                | LogicalNodeStatus::Finished
        )
    }
}

/// A dependency between two logical nodes.
///
/// Value equality on endpoints: the coarsening pass deduplicates the
/// many physical edges between two classes into one logical edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogicalEdge {
    /// The prerequisite class.
    pub u: ClassId,
    /// The dependent class.
    pub v: ClassId,
}

impl LogicalEdge {
    /// Creates an edge.
    pub fn new(u: ClassId, v: ClassId) -> Self {
        Self { u, v }
    }
}

/// An equivalence class of flow nodes.
#[derive(Debug, Clone)]
pub struct LogicalNode {
    /// This class's id in the owning flow's arena.
    pub id: ClassId,
    /// Member flow nodes.
    pub members: HashSet<NodeId>,
    /// Countdown on predecessor classes; empty means all dependencies
    /// are met.
    pub dependency_count_down: CountDown<ClassId>,
    /// Countdown on member acknowledgements; the barrier for group
    /// stage transitions.
    pub client_count_down: CountDown<NodeId>,
    /// Incoming logical edges.
    pub in_edges: HashSet<LogicalEdge>,
    /// Outgoing logical edges.
    pub out_edges: HashSet<LogicalEdge>,
    /// Lifecycle status.
    pub status: LogicalNodeStatus,
    /// DFS topological order over the coarsened graph.
    pub order: i64,
    /// DFS depth over the coarsened graph.
    pub depth: i64,
}

impl LogicalNode {
    /// Creates an empty class.
    pub fn new(id: ClassId) -> Self {
        Self {
            id,
            members: HashSet::new(),
            dependency_count_down: CountDown::new(),
            client_count_down: CountDown::new(),
            in_edges: HashSet::new(),
            out_edges: HashSet::new(),
            status: LogicalNodeStatus::PendingDependency,
            order: -1,
            depth: -1,
        }
    }

    /// Repopulates the dependency countdown from the in-edges.
    pub fn reset_dependency_count_down(&mut self) {
        let members: Vec<ClassId> = self.in_edges.iter().map(|e| e.u).collect();
        self.dependency_count_down.reset_from(members);
    }

    /// Repopulates the client countdown from the member set.
    pub fn reset_client_count_down(&mut self) {
        let members: Vec<NodeId> = self.members.iter().copied().collect();
        self.client_count_down.reset_from(members);
    }

    /// Number of member flow nodes (the class size used by the
    /// smallest-first scheduling order).
    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// Successor class ids.
    pub fn successors(&self) -> impl Iterator<Item = ClassId> + '_ {
        self.out_edges.iter().map(|e| e.v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classifiers() {
        use LogicalNodeStatus::*;

        for s in [PendingDependency, PendingExecute] {
            assert!(s.is_executable());
            assert!(s.is_mergeable());
            assert!(!s.is_executing());
        }
        for s in [Resource, Prepare, Execute] {
            assert!(s.is_executing());
            assert!(!s.is_mergeable());
        }
        assert!(Finished.is_mergeable());
        assert!(Finished.is_finished());
        assert!(!Failed.is_mergeable());
        assert!(!Failed.is_executable());
    }

    #[test]
    fn client_count_down_covers_members() {
        let mut class = LogicalNode::new(ClassId(0));
        class.members.insert(NodeId(1));
        class.members.insert(NodeId(2));
        class.reset_client_count_down();

        assert!(!class.client_count_down.arrive(&NodeId(1)));
        assert!(class.client_count_down.arrive(&NodeId(2)));
    }

    #[test]
    fn logical_edges_deduplicate() {
        let mut set = HashSet::new();
        set.insert(LogicalEdge::new(ClassId(0), ClassId(1)));
        set.insert(LogicalEdge::new(ClassId(0), ClassId(1)));
        assert_eq!(set.len(), 1);
    }
}
