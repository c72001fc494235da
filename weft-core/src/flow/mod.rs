//! The flow graph.
//!
//! A [`Flow`] owns three arenas: physical nodes, physical edges, and
//! logical nodes (the equivalence classes the scheduler reasons about).
//! Everything references everything else by id, so cloning a flow is a
//! plain map copy and no two clones share mutable graph state. The
//! arenas are rebuilt in place by the build pipeline in [`build`]; the
//! rest of the orchestrator only reads them.

pub mod build;
pub mod edge;
pub mod logical;
pub mod node;

pub use build::{BuildContext, EmbedRequest, FlowBuilder, FnBuilder};
pub use edge::{EdgeKind, FlowEdge};
pub use logical::{LogicalEdge, LogicalNode, LogicalNodeStatus};
pub use node::FlowNode;

use crate::countdown::CountDown;
use crate::error::Result;
use crate::message::{EdgeParameters, ResourceDescriptor};
use crate::types::{ClassId, EdgeId, FlowId, NodeId, WorkerId};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;

/// Lifecycle status of a whole flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    /// Some class has not yet finished.
    Executing,
    /// Every class finished.
    Finished,
    /// The flow was purged or failed fatally.
    Failed,
}

impl FlowStatus {
    /// Whether the flow still has work in flight.
    pub fn is_executing(self) -> bool {
        matches!(self, FlowStatus::Executing)
    }
}

/// A distributed computation: a DAG of codelets and its coarsening into
/// equivalence classes.
#[derive(Debug, Clone)]
pub struct Flow {
    /// This flow's id with the owning orchestrator.
    pub id: FlowId,
    /// Caller-supplied display name.
    pub name: String,
    /// Lifecycle status.
    pub status: FlowStatus,
    /// Opaque caller payload surfaced in lifecycle events.
    pub attachment: Value,
    /// Countdown over classes; empty means the flow is done.
    pub flow_count_down: CountDown<ClassId>,
    nodes: HashMap<NodeId, FlowNode>,
    edges: HashMap<EdgeId, FlowEdge>,
    classes: HashMap<ClassId, LogicalNode>,
    next_node: u32,
    next_edge: u32,
    next_class: u32,
}

impl Flow {
    /// Creates an empty flow.
    pub fn new(id: FlowId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            status: FlowStatus::Executing,
            attachment: Value::Null,
            flow_count_down: CountDown::new(),
            nodes: HashMap::new(),
            edges: HashMap::new(),
            classes: HashMap::new(),
            next_node: 0,
            next_edge: 0,
            next_class: 0,
        }
    }

    /// Runs builder callbacks and subflow embeddings as one transaction.
    ///
    /// The whole graph is snapshotted up front and restored on any
    /// error, so a failed build leaves the flow exactly as it was.
    /// Returns the classes that became execute-eligible, smallest id
    /// first.
    pub fn build(&mut self, requests: Vec<EmbedRequest>) -> Result<Vec<ClassId>> {
        let backup = self.clone();
        match build::embed_subflows(self, requests) {
            Ok(eligible) => Ok(eligible),
            Err(err) => {
                *self = backup;
                Err(err)
            }
        }
    }

    /// Looks up a node. Panics on an id not in this flow's arena.
    pub fn node(&self, id: NodeId) -> &FlowNode {
        &self.nodes[&id]
    }

    /// Looks up a node mutably. Panics on an id not in this flow's
    /// arena.
    pub fn node_mut(&mut self, id: NodeId) -> &mut FlowNode {
        self.nodes
            .get_mut(&id)
            .unwrap_or_else(|| panic!("{id} is not in this flow"))
    }

    /// Looks up an edge. Panics on an id not in this flow's arena.
    pub fn edge(&self, id: EdgeId) -> &FlowEdge {
        &self.edges[&id]
    }

    /// Looks up an edge mutably. Panics on an id not in this flow's
    /// arena.
    pub fn edge_mut(&mut self, id: EdgeId) -> &mut FlowEdge {
        self.edges
            .get_mut(&id)
            .unwrap_or_else(|| panic!("{id} is not in this flow"))
    }

    /// Looks up a class. Panics on an id not in this flow's arena.
    pub fn class(&self, id: ClassId) -> &LogicalNode {
        &self.classes[&id]
    }

    /// Looks up a class mutably. Panics on an id not in this flow's
    /// arena.
    pub fn class_mut(&mut self, id: ClassId) -> &mut LogicalNode {
        self.classes
            .get_mut(&id)
            .unwrap_or_else(|| panic!("{id} is not in this flow"))
    }

    /// Whether the arena still holds this node.
    pub fn contains_node(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Whether the arena still holds this class.
    pub fn contains_class(&self, id: ClassId) -> bool {
        self.classes.contains_key(&id)
    }

    /// All nodes, in arena order.
    pub fn nodes(&self) -> impl Iterator<Item = &FlowNode> {
        self.nodes.values()
    }

    /// All edges, in arena order.
    pub fn edges(&self) -> impl Iterator<Item = &FlowEdge> {
        self.edges.values()
    }

    /// All classes, in arena order.
    pub fn classes(&self) -> impl Iterator<Item = &LogicalNode> {
        self.classes.values()
    }

    /// Node ids, smallest first, for deterministic traversals.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Edge ids, smallest first.
    pub fn edge_ids(&self) -> Vec<EdgeId> {
        let mut ids: Vec<EdgeId> = self.edges.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Class ids, smallest first.
    pub fn class_ids(&self) -> Vec<ClassId> {
        let mut ids: Vec<ClassId> = self.classes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of physical nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of physical edges.
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Number of classes.
    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// Number of classes that have not yet finished.
    pub fn pending_class_count(&self) -> usize {
        self.flow_count_down.len()
    }

    /// Applies the documents a completed codelet returned.
    ///
    /// The embedding document is staged on the node for its eventual
    /// embed request; edge parameters apply positionally over the
    /// node's out-edges.
    pub fn assign_parameters(
        &mut self,
        node: NodeId,
        embedding_parameters: Value,
        edge_parameters: Vec<EdgeParameters>,
    ) -> Result<()> {
        build::assign_parameters(self, node, embedding_parameters, edge_parameters)
    }

    /// Regenerates the stream identifiers of every edge produced by a
    /// member of `class`.
    ///
    /// Stream edges never cross class boundaries, so iterating member
    /// out-edges covers every stream the class is about to negotiate.
    pub fn generate_streams(&mut self, class: ClassId) {
        let members: Vec<NodeId> = self.classes[&class].members.iter().copied().collect();
        for member in members {
            let out_edges = self.nodes[&member].out_edges.clone();
            for edge in out_edges {
                self.edge_mut(edge).generate();
            }
        }
    }

    /// Renders the RESOURCE descriptor for one node.
    ///
    /// `addr_of` resolves a bound worker to its announced stream
    /// address; dummy edges render nothing.
    pub fn resource_descriptor<F>(&self, node_id: NodeId, addr_of: F) -> ResourceDescriptor
    where
        F: Fn(WorkerId) -> Option<SocketAddr>,
    {
        let node = self.node(node_id);
        let mut resource_in = Vec::new();
        for &eid in &node.in_edges {
            let edge = self.edge(eid);
            let peer = self.node(edge.u).worker.and_then(&addr_of);
            if let Some(spec) = edge.v_resource(peer) {
                resource_in.push(spec);
            }
        }
        let mut resource_out = Vec::new();
        for &eid in &node.out_edges {
            let edge = self.edge(eid);
            let peer = self.node(edge.v).worker.and_then(&addr_of);
            if let Some(spec) = edge.u_resource(peer) {
                resource_out.push(spec);
            }
        }
        ResourceDescriptor {
            codelet: node.codelet.clone(),
            parameters: node.parameters.clone(),
            resource_in,
            resource_out,
        }
    }

    /// Adds a node, assigning it a fresh arena id.
    ///
    /// Incidence lists are cleared; edges are the only way to populate
    /// them.
    pub(crate) fn insert_node(&mut self, mut node: FlowNode) -> NodeId {
        let id = NodeId(self.next_node);
        self.next_node += 1;
        node.id = id;
        node.in_edges.clear();
        node.out_edges.clear();
        self.nodes.insert(id, node);
        id
    }

    /// Adds an edge between two nodes already in the arena, assigning
    /// it a fresh id and updating both incidence lists.
    pub(crate) fn insert_edge(&mut self, mut edge: FlowEdge) -> EdgeId {
        let id = EdgeId(self.next_edge);
        self.next_edge += 1;
        edge.id = id;
        self.node_mut(edge.u).out_edges.push(id);
        self.node_mut(edge.v).in_edges.push(id);
        self.edges.insert(id, edge);
        id
    }

    /// Removes an edge, detaching it from both incidence lists.
    pub(crate) fn remove_edge(&mut self, id: EdgeId) -> Option<FlowEdge> {
        let edge = self.edges.remove(&id)?;
        if let Some(u) = self.nodes.get_mut(&edge.u) {
            u.out_edges.retain(|&e| e != id);
        }
        if let Some(v) = self.nodes.get_mut(&edge.v) {
            v.in_edges.retain(|&e| e != id);
        }
        Some(edge)
    }

    /// Removes a node. The caller must have detached its edges first.
    pub(crate) fn remove_node(&mut self, id: NodeId) -> Option<FlowNode> {
        self.nodes.remove(&id)
    }

    /// Allocates a fresh, empty class.
    pub(crate) fn insert_class(&mut self) -> ClassId {
        let id = ClassId(self.next_class);
        self.next_class += 1;
        self.classes.insert(id, LogicalNode::new(id));
        id
    }

    /// Removes a class.
    pub(crate) fn remove_class(&mut self, id: ClassId) -> Option<LogicalNode> {
        self.classes.remove(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FlowId;

    #[test]
    fn clones_share_no_graph_state() {
        let mut flow = Flow::new(FlowId(0), "clone-test");
        let a = flow.insert_node(FlowNode::new("ex.A"));
        let b = flow.insert_node(FlowNode::new("ex.B"));
        flow.insert_edge(FlowEdge::handle(a, b).with_name("h"));

        let snapshot = flow.clone();
        flow.node_mut(a).name = "mutated".into();
        let extra = flow.insert_node(FlowNode::new("ex.C"));

        assert_eq!(snapshot.node(a).name, "");
        assert_eq!(snapshot.node_count(), 2);
        assert!(!snapshot.contains_node(extra));
        assert_eq!(flow.node_count(), 3);
    }

    #[test]
    fn edges_maintain_incidence_lists() {
        let mut flow = Flow::new(FlowId(0), "incidence");
        let a = flow.insert_node(FlowNode::new("ex.A"));
        let b = flow.insert_node(FlowNode::new("ex.B"));
        let e = flow.insert_edge(FlowEdge::stream(a, b));

        assert_eq!(flow.node(a).out_edges, vec![e]);
        assert_eq!(flow.node(b).in_edges, vec![e]);

        flow.remove_edge(e);
        assert!(flow.node(a).out_edges.is_empty());
        assert!(flow.node(b).in_edges.is_empty());
    }

    #[test]
    fn node_ids_are_never_reused() {
        let mut flow = Flow::new(FlowId(0), "ids");
        let a = flow.insert_node(FlowNode::new("ex.A"));
        flow.remove_node(a);
        let b = flow.insert_node(FlowNode::new("ex.B"));
        assert_ne!(a, b);
    }
}
