//! Flow construction and subflow embedding.
//!
//! Builders populate a flow through a [`BuildContext`], which confines
//! every mutation to the current build pass: a builder sees its own
//! nodes, the boundary in-edges it must bind, and the boundary
//! out-nodes it may target, and nothing else of the surrounding graph.
//!
//! After the builders run, the pipeline recomputes everything derived
//! from the physical graph: topological orders, equivalence classes,
//! logical edges, and the countdowns that drive scheduling. The whole
//! pass is transactional; see [`Flow::build`].

use crate::error::{Result, WeftError};
use crate::flow::{EdgeKind, Flow, FlowEdge, FlowNode, FlowStatus, LogicalEdge, LogicalNodeStatus};
use crate::types::{ClassId, EdgeId, NodeId};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// A callback that populates part of a flow.
///
/// Called once per build pass: at flow creation with no boundary, or at
/// subflow embedding with the replaced node's in-edges and downstream
/// out-nodes as the boundary. `parameters` is the caller's document at
/// creation and the worker-returned embedding document at embedding.
pub trait FlowBuilder: Send + Sync {
    /// Adds nodes and edges through `ctx`, binding every edge in
    /// `in_edges` to one of the added nodes.
    fn build(
        &self,
        ctx: &mut BuildContext<'_>,
        parameters: &Value,
        in_edges: &[EdgeId],
        out_nodes: &[NodeId],
    ) -> Result<()>;
}

/// Adapts a closure into a [`FlowBuilder`].
pub struct FnBuilder<F>(pub F);

impl<F> FlowBuilder for FnBuilder<F>
where
    F: Fn(&mut BuildContext<'_>, &Value, &[EdgeId], &[NodeId]) -> Result<()> + Send + Sync,
{
    fn build(
        &self,
        ctx: &mut BuildContext<'_>,
        parameters: &Value,
        in_edges: &[EdgeId],
        out_nodes: &[NodeId],
    ) -> Result<()> {
        (self.0)(ctx, parameters, in_edges, out_nodes)
    }
}

/// One unit of work for a build pass.
#[derive(Clone)]
pub struct EmbedRequest {
    builder: Option<Arc<dyn FlowBuilder>>,
    parameters: Value,
    node: Option<NodeId>,
}

impl EmbedRequest {
    /// A creation-time build: the builder starts from an empty
    /// boundary.
    pub fn initial(builder: Arc<dyn FlowBuilder>, parameters: Value) -> Self {
        Self {
            builder: Some(builder),
            parameters,
            node: None,
        }
    }

    /// A subflow embedding: the node's nested builder replaces it,
    /// parameterized by the document its worker returned.
    pub fn embedding(node: NodeId) -> Self {
        Self {
            builder: None,
            parameters: Value::Null,
            node: Some(node),
        }
    }
}

/// The mutation surface a builder works through.
///
/// Everything a builder adds is tracked; edges may only join nodes
/// added in this pass (or boundary out-nodes), and boundary in-edges
/// must all be bound before the pass completes.
pub struct BuildContext<'a> {
    flow: &'a mut Flow,
    added: HashSet<NodeId>,
    pending_in: HashSet<EdgeId>,
    out_nodes: HashSet<NodeId>,
}

impl BuildContext<'_> {
    /// Adds a node, returning its assigned id.
    pub fn add_node(&mut self, node: FlowNode) -> NodeId {
        let id = self.flow.insert_node(node);
        self.added.insert(id);
        id
    }

    /// Adds an edge between nodes of this pass.
    ///
    /// The producer must have been added in this pass; the consumer may
    /// also be a boundary out-node.
    pub fn add_edge(&mut self, edge: FlowEdge) -> Result<EdgeId> {
        if !self.added.contains(&edge.u) {
            return Err(build_err(
                self.flow,
                format!("edge producer {} was not added in this build pass", edge.u),
            ));
        }
        if !self.added.contains(&edge.v) && !self.out_nodes.contains(&edge.v) {
            return Err(build_err(
                self.flow,
                format!("edge consumer {} is not reachable from this build pass", edge.v),
            ));
        }
        Ok(self.flow.insert_edge(edge))
    }

    /// Binds a dangling boundary in-edge to a node added in this pass.
    pub fn attach_in(&mut self, edge: EdgeId, node: NodeId) -> Result<()> {
        if !self.pending_in.remove(&edge) {
            return Err(build_err(
                self.flow,
                format!("{edge} is not an unbound boundary in-edge"),
            ));
        }
        if !self.added.contains(&node) {
            return Err(build_err(
                self.flow,
                format!("{node} was not added in this build pass"),
            ));
        }
        let old_v = self.flow.edge(edge).v;
        self.flow.edge_mut(edge).v = node;
        self.flow.node_mut(old_v).in_edges.retain(|&e| e != edge);
        self.flow.node_mut(node).in_edges.push(edge);
        Ok(())
    }
}

/// Runs every request, then recomputes the derived state of the graph.
///
/// Returns the classes that became execute-eligible. Callers go through
/// [`Flow::build`] for the transactional wrapper.
pub(crate) fn embed_subflows(flow: &mut Flow, requests: Vec<EmbedRequest>) -> Result<Vec<ClassId>> {
    let mut embedded = Vec::new();
    for request in requests {
        if let Some(node) = request.node {
            embedded.push(node);
        }
        embed_one(flow, request)?;
    }
    remove_embedded_nodes(flow, &embedded);

    assign_physical_order(flow)?;
    rebuild_classes(flow)?;
    rebuild_logical_edges(flow);
    assign_logical_order(flow)?;
    let eligible = build_count_downs(flow);

    debug!(
        flow = %flow.id,
        nodes = flow.node_count(),
        classes = flow.class_count(),
        eligible = eligible.len(),
        "flow graph rebuilt"
    );
    Ok(eligible)
}

/// Runs one builder against its boundary.
fn embed_one(flow: &mut Flow, request: EmbedRequest) -> Result<()> {
    let (builder, parameters, in_edges, out_nodes) = match request.node {
        None => {
            let builder = request
                .builder
                .ok_or_else(|| build_err(flow, "creation request carries no builder"))?;
            (builder, request.parameters, Vec::new(), Vec::new())
        }
        Some(node) => {
            let builder = flow
                .node(node)
                .embedding
                .clone()
                .ok_or_else(|| build_err(flow, format!("{node} has no nested builder")))?;
            let parameters = flow.node(node).embedding_parameters.clone();
            let in_edges = expand_in_edges(flow, node);
            let out_nodes = detach_out_edges(flow, node)?;
            (builder, parameters, in_edges, out_nodes)
        }
    };

    let mut ctx = BuildContext {
        flow,
        added: HashSet::new(),
        pending_in: in_edges.iter().copied().collect(),
        out_nodes: out_nodes.iter().copied().collect(),
    };
    builder.build(&mut ctx, &parameters, &in_edges, &out_nodes)?;

    if !ctx.pending_in.is_empty() {
        return Err(build_err(flow, "an in-edge was not bound"));
    }
    Ok(())
}

/// Expands the node's expand-on-embed handle in-edges into one edge per
/// handle pair, returning the resulting boundary in-edge list in order.
fn expand_in_edges(flow: &mut Flow, node: NodeId) -> Vec<EdgeId> {
    let original = flow.node(node).in_edges.clone();
    let mut boundary = Vec::new();
    for eid in original {
        let expands = match &flow.edge(eid).kind {
            EdgeKind::Handle {
                expand_on_embed: true,
                handles,
            } => Some(handles.clone()),
            _ => None,
        };
        match expands {
            None => boundary.push(eid),
            Some(handles) => {
                let removed = flow
                    .remove_edge(eid)
                    .unwrap_or_else(|| panic!("{eid} is not in this flow"));
                for pair in handles {
                    let replacement = FlowEdge::handle(removed.u, removed.v)
                        .with_name(removed.name.clone())
                        .with_handles(vec![pair]);
                    boundary.push(flow.insert_edge(replacement));
                }
            }
        }
    }
    boundary
}

/// Removes the node's out-edges, returning their consumers in order.
///
/// Out-edges of an embedding node carry no payload; they exist to
/// anchor the downstream boundary and are replaced by whatever edges
/// the builder draws to those consumers.
fn detach_out_edges(flow: &mut Flow, node: NodeId) -> Result<Vec<NodeId>> {
    let original = flow.node(node).out_edges.clone();
    let mut out_nodes = Vec::new();
    for eid in original {
        if !flow.edge(eid).is_dummy() {
            return Err(build_err(
                flow,
                format!("{node} carries a non-dummy out-edge and cannot embed a subflow"),
            ));
        }
        if let Some(edge) = flow.remove_edge(eid) {
            if !out_nodes.contains(&edge.v) {
                out_nodes.push(edge.v);
            }
        }
    }
    Ok(out_nodes)
}

/// Deletes the replaced nodes and dissolves their classes.
fn remove_embedded_nodes(flow: &mut Flow, nodes: &[NodeId]) {
    for &id in nodes {
        if let Some(node) = flow.remove_node(id) {
            if let Some(class_id) = node.class {
                if let Some(class) = flow.classes.get_mut(&class_id) {
                    class.members.remove(&id);
                    if class.members.is_empty() {
                        flow.remove_class(class_id);
                    }
                }
            }
        }
    }
}

const WHITE: u8 = 0;
const GRAY: u8 = 1;
const BLACK: u8 = 2;

/// Post-order DFS over predecessors from every sink.
///
/// A synthetic sink below all real sinks makes the traversal total:
/// the graph is a connected DAG exactly when the visit count reaches
/// node count plus one. Returns `(order, depth)` per node, or `None`
/// on a cycle or an unreachable region.
fn depth_first_order<I, P>(ids: &[I], sinks: &[I], preds: P) -> Option<HashMap<I, (i64, i64)>>
where
    I: Copy + Eq + std::hash::Hash,
    P: Fn(I) -> Vec<I>,
{
    let mut colors: HashMap<I, u8> = ids.iter().map(|&i| (i, WHITE)).collect();
    let mut assigned: HashMap<I, (i64, i64)> = HashMap::new();
    let mut order = 0i64;
    let mut visited = 1usize; // the synthetic sink

    for &sink in sinks {
        if colors[&sink] != WHITE {
            continue;
        }
        // Frame: node, its predecessor list, next index, depth below
        // the synthetic sink.
        let mut stack: Vec<(I, Vec<I>, usize, i64)> = vec![(sink, preds(sink), 0, 1)];
        colors.insert(sink, GRAY);

        while !stack.is_empty() {
            let top = stack.len() - 1;
            let (node, depth) = (stack[top].0, stack[top].3);
            if stack[top].2 < stack[top].1.len() {
                let next = stack[top].1[stack[top].2];
                stack[top].2 += 1;
                match colors[&next] {
                    WHITE => {
                        colors.insert(next, GRAY);
                        let next_preds = preds(next);
                        stack.push((next, next_preds, 0, depth + 1));
                    }
                    GRAY => return None,
                    _ => {}
                }
            } else {
                colors.insert(node, BLACK);
                assigned.insert(node, (order, depth));
                order += 1;
                visited += 1;
                stack.pop();
            }
        }
    }

    if visited == ids.len() + 1 {
        Some(assigned)
    } else {
        None
    }
}

/// Assigns topological order and depth to every physical node.
fn assign_physical_order(flow: &mut Flow) -> Result<()> {
    let ids = flow.node_ids();
    let sinks: Vec<NodeId> = ids
        .iter()
        .copied()
        .filter(|&id| flow.node(id).out_edges.is_empty())
        .collect();
    let assigned = depth_first_order(&ids, &sinks, |id| {
        let mut preds: Vec<NodeId> = flow
            .node(id)
            .in_edges
            .iter()
            .map(|&e| flow.edge(e).u)
            .collect();
        preds.sort_unstable();
        preds.dedup();
        preds
    })
    .ok_or_else(|| WeftError::Cycle {
        flow: flow.name.clone(),
    })?;
    for (id, (order, depth)) in assigned {
        let node = flow.node_mut(id);
        node.order = order;
        node.depth = depth;
    }
    Ok(())
}

/// Assigns topological order and depth over the coarsened graph.
///
/// Class merging can create a coarsened cycle even when the physical
/// graph is acyclic; that flow is unschedulable and the build fails.
fn assign_logical_order(flow: &mut Flow) -> Result<()> {
    let ids = flow.class_ids();
    let sinks: Vec<ClassId> = ids
        .iter()
        .copied()
        .filter(|&id| flow.class(id).out_edges.is_empty())
        .collect();
    let assigned = depth_first_order(&ids, &sinks, |id| {
        let mut preds: Vec<ClassId> = flow.class(id).in_edges.iter().map(|e| e.u).collect();
        preds.sort_unstable();
        preds
    })
    .ok_or_else(|| WeftError::Cycle {
        flow: flow.name.clone(),
    })?;
    for (id, (order, depth)) in assigned {
        let class = flow.class_mut(id);
        class.order = order;
        class.depth = depth;
    }
    Ok(())
}

/// The stream-connected component containing `start`.
///
/// Embedding nodes must be singleton components: a subflow placeholder
/// cannot barrier-synchronize with anything, since its replacement
/// changes the member set out from under the countdown.
fn stream_component(flow: &Flow, start: NodeId) -> Result<HashSet<NodeId>> {
    let mut component = HashSet::new();
    let mut stack = vec![start];
    while let Some(id) = stack.pop() {
        if !component.insert(id) {
            continue;
        }
        let node = flow.node(id);
        for &eid in node.in_edges.iter().chain(node.out_edges.iter()) {
            let edge = flow.edge(eid);
            if edge.is_stream() {
                stack.push(if edge.u == id { edge.v } else { edge.u });
            }
        }
    }
    if component.len() > 1 {
        if let Some(&bad) = component.iter().find(|&&id| flow.node(id).is_embedding()) {
            return Err(build_err(
                flow,
                format!("{bad} embeds a subflow and cannot share a class"),
            ));
        }
    }
    Ok(component)
}

/// Recomputes the equivalence classes from stream connectivity.
///
/// A component whose membership is unchanged keeps its existing class,
/// preserving mid-flight status and countdowns. Anything else becomes
/// a fresh class; classes being merged away must not be mid-flight.
fn rebuild_classes(flow: &mut Flow) -> Result<()> {
    let old_classes = std::mem::take(&mut flow.classes);
    let mut seen: HashSet<NodeId> = HashSet::new();

    for start in flow.node_ids() {
        if seen.contains(&start) {
            continue;
        }
        // Errors leave the arenas torn; the build transaction restores
        // them wholesale.
        let component = stream_component(flow, start)?;
        seen.extend(component.iter().copied());

        let touched: HashSet<ClassId> = component
            .iter()
            .filter_map(|&id| flow.node(id).class)
            .collect();

        let unchanged = touched.len() == 1 && {
            let old = touched.iter().next().expect("non-empty");
            old_classes
                .get(old)
                .map(|c| c.members == component)
                .unwrap_or(false)
        };
        if unchanged {
            let id = *touched.iter().next().expect("non-empty");
            let class = old_classes[&id].clone();
            flow.classes.insert(id, class);
            continue;
        }

        for old in &touched {
            if let Some(class) = old_classes.get(old) {
                if !class.status.is_mergeable() {
                    return Err(build_err(
                        flow,
                        format!("{old} is mid-flight and cannot be restructured"),
                    ));
                }
            }
        }

        let finished = !component.is_empty()
            && component.iter().all(|&id| {
                flow.node(id)
                    .class
                    .and_then(|c| old_classes.get(&c))
                    .map(|c| c.status.is_finished())
                    .unwrap_or(false)
            });

        let id = flow.insert_class();
        let class = flow.class_mut(id);
        class.members = component.clone();
        class.status = if finished {
            LogicalNodeStatus::Finished
        } else {
            LogicalNodeStatus::PendingDependency
        };
        for member in component {
            flow.node_mut(member).class = Some(id);
        }
    }
    Ok(())
}

/// Recomputes the logical edges from the physical ones.
///
/// Many physical edges between the same pair of classes collapse into
/// one logical edge; intra-class edges produce none.
fn rebuild_logical_edges(flow: &mut Flow) {
    for class in flow.classes.values_mut() {
        class.in_edges.clear();
        class.out_edges.clear();
    }
    let pairs: Vec<(ClassId, ClassId)> = flow
        .edges()
        .filter_map(|edge| {
            let cu = flow.node(edge.u).class?;
            let cv = flow.node(edge.v).class?;
            (cu != cv).then_some((cu, cv))
        })
        .collect();
    for (cu, cv) in pairs {
        let logical = LogicalEdge::new(cu, cv);
        flow.class_mut(cu).out_edges.insert(logical);
        flow.class_mut(cv).in_edges.insert(logical);
    }
}

/// Reseeds the countdowns and simulates the already-finished classes.
///
/// Returns the classes whose dependencies are met and which are not
/// yet running, marked pending-execute, smallest id first. The client
/// countdown of a mid-flight class is left untouched; its partial
/// arrivals are still live.
fn build_count_downs(flow: &mut Flow) -> Vec<ClassId> {
    let ids = flow.class_ids();
    flow.flow_count_down.reset_from(ids.iter().copied());
    for &id in &ids {
        let class = flow.class_mut(id);
        class.reset_dependency_count_down();
        if !class.status.is_executing() {
            class.reset_client_count_down();
        }
    }

    let finished: Vec<ClassId> = ids
        .iter()
        .copied()
        .filter(|&id| flow.class(id).status.is_finished())
        .collect();
    for id in finished {
        flow.flow_count_down.arrive(&id);
        let successors: Vec<ClassId> = flow.class(id).successors().collect();
        for successor in successors {
            // Register the arrival unconditionally; gating it behind a
            // status check would skip the removal.
            let _ready = flow
                .class_mut(successor)
                .dependency_count_down
                .arrive(&id);
        }
    }

    flow.status = if flow.flow_count_down.is_empty() {
        FlowStatus::Finished
    } else {
        FlowStatus::Executing
    };

    let mut eligible = Vec::new();
    for &id in &ids {
        let class = flow.class_mut(id);
        if class.status.is_executable() && class.dependency_count_down.is_empty() {
            class.status = LogicalNodeStatus::PendingExecute;
            eligible.push(id);
        }
    }
    eligible
}

/// Applies the documents a completed codelet returned.
///
/// Edge parameters are positional over the node's out-edges; only
/// handle edges take them. The embedding document is staged on the
/// node for its eventual embed request.
pub(crate) fn assign_parameters(
    flow: &mut Flow,
    node: NodeId,
    embedding_parameters: Value,
    edge_parameters: Vec<crate::message::EdgeParameters>,
) -> Result<()> {
    let out_edges = flow.node(node).out_edges.clone();
    if edge_parameters.len() > out_edges.len() {
        return Err(WeftError::Parameter {
            cause: format!(
                "{} parameter documents for {} out-edges of {node}",
                edge_parameters.len(),
                out_edges.len()
            ),
        });
    }
    flow.node_mut(node).embedding_parameters = embedding_parameters;
    for (eid, params) in out_edges.into_iter().zip(edge_parameters) {
        if let EdgeKind::Handle { handles, .. } = &mut flow.edge_mut(eid).kind {
            *handles = params.handles;
        }
    }
    Ok(())
}

fn build_err(flow: &Flow, cause: impl Into<String>) -> WeftError {
    WeftError::Build {
        flow: flow.name.clone(),
        cause: cause.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::HandlePair;
    use crate::types::FlowId;
    use serde_json::Value;

    fn chain() -> Flow {
        let mut flow = Flow::new(FlowId(1), "chain");
        let eligible = flow
            .build(vec![EmbedRequest::initial(
                Arc::new(FnBuilder(|ctx: &mut BuildContext<'_>, _: &Value, _: &[EdgeId], _: &[NodeId]| {
                    let a = ctx.add_node(FlowNode::new("ex.Create"));
                    let b = ctx.add_node(FlowNode::new("ex.Sort"));
                    let c = ctx.add_node(FlowNode::new("ex.Merge"));
                    ctx.add_edge(FlowEdge::stream(a, b).with_name("s"))?;
                    ctx.add_edge(FlowEdge::handle(b, c).with_name("h"))?;
                    Ok(())
                })),
                Value::Null,
            )])
            .expect("chain builds");
        assert_eq!(eligible.len(), 1);
        flow
    }

    fn node_by_codelet(flow: &Flow, codelet: &str) -> NodeId {
        flow.nodes()
            .find(|n| n.codelet == codelet)
            .map(|n| n.id)
            .expect("node exists")
    }

    #[test]
    fn stream_pairs_share_a_class() {
        let flow = chain();
        let a = node_by_codelet(&flow, "ex.Create");
        let b = node_by_codelet(&flow, "ex.Sort");
        let c = node_by_codelet(&flow, "ex.Merge");

        assert_eq!(flow.class_count(), 2);
        assert_eq!(flow.node(a).class, flow.node(b).class);
        assert_ne!(flow.node(a).class, flow.node(c).class);

        let upstream = flow.node(a).class.unwrap();
        let downstream = flow.node(c).class.unwrap();
        assert_eq!(flow.class(upstream).status, LogicalNodeStatus::PendingExecute);
        assert_eq!(
            flow.class(downstream).status,
            LogicalNodeStatus::PendingDependency
        );
        assert!(flow
            .class(downstream)
            .in_edges
            .contains(&LogicalEdge::new(upstream, downstream)));
    }

    #[test]
    fn orders_respect_dependencies() {
        let flow = chain();
        let a = node_by_codelet(&flow, "ex.Create");
        let b = node_by_codelet(&flow, "ex.Sort");
        let c = node_by_codelet(&flow, "ex.Merge");

        assert!(flow.node(a).order < flow.node(b).order);
        assert!(flow.node(b).order < flow.node(c).order);

        let upstream = flow.node(a).class.unwrap();
        let downstream = flow.node(c).class.unwrap();
        assert!(flow.class(upstream).order < flow.class(downstream).order);
    }

    #[test]
    fn cycles_fail_and_roll_back() {
        let mut flow = Flow::new(FlowId(2), "cyclic");
        let err = flow
            .build(vec![EmbedRequest::initial(
                Arc::new(FnBuilder(|ctx: &mut BuildContext<'_>, _: &Value, _: &[EdgeId], _: &[NodeId]| {
                    let a = ctx.add_node(FlowNode::new("ex.A"));
                    let b = ctx.add_node(FlowNode::new("ex.B"));
                    ctx.add_edge(FlowEdge::handle(a, b))?;
                    ctx.add_edge(FlowEdge::handle(b, a))?;
                    Ok(())
                })),
                Value::Null,
            )])
            .unwrap_err();

        assert!(matches!(err, WeftError::Cycle { .. }));
        assert_eq!(flow.node_count(), 0);
        assert_eq!(flow.edge_count(), 0);
    }

    #[test]
    fn edges_may_not_leave_the_build_pass() {
        let mut flow = chain();
        let a = node_by_codelet(&flow, "ex.Create");

        let err = flow
            .build(vec![EmbedRequest::initial(
                Arc::new(FnBuilder(move |ctx: &mut BuildContext<'_>, _: &Value, _: &[EdgeId], _: &[NodeId]| {
                    let d = ctx.add_node(FlowNode::new("ex.D"));
                    ctx.add_edge(FlowEdge::handle(a, d))?;
                    Ok(())
                })),
                Value::Null,
            )])
            .unwrap_err();

        assert!(matches!(err, WeftError::Build { .. }));
        assert_eq!(flow.node_count(), 3);
    }

    fn embeddable() -> (Flow, NodeId) {
        let mut flow = Flow::new(FlowId(3), "embeddable");
        let subflow = Arc::new(FnBuilder(
            |ctx: &mut BuildContext<'_>, _: &Value, in_edges: &[EdgeId], out_nodes: &[NodeId]| {
                assert_eq!(in_edges.len(), 2);
                assert_eq!(out_nodes.len(), 1);
                let x = ctx.add_node(FlowNode::new("ex.Part"));
                let y = ctx.add_node(FlowNode::new("ex.Part"));
                ctx.attach_in(in_edges[0], x)?;
                ctx.attach_in(in_edges[1], y)?;
                ctx.add_edge(FlowEdge::handle(x, out_nodes[0]).with_name("hx"))?;
                ctx.add_edge(FlowEdge::handle(y, out_nodes[0]).with_name("hy"))?;
                Ok(())
            },
        ));
        flow.build(vec![EmbedRequest::initial(
            Arc::new(FnBuilder(move |ctx: &mut BuildContext<'_>, _: &Value, _: &[EdgeId], _: &[NodeId]| {
                let a = ctx.add_node(FlowNode::new("ex.Create"));
                let b = ctx.add_node(
                    FlowNode::new("ex.Split").with_embedding(subflow.clone()),
                );
                let c = ctx.add_node(FlowNode::new("ex.Merge"));
                ctx.add_edge(
                    FlowEdge::handle(a, b)
                        .with_name("h")
                        .with_expand_on_embed(true)
                        .with_handles(vec![
                            HandlePair::new("file:///tmp/0", "0"),
                            HandlePair::new("file:///tmp/1", "1"),
                        ]),
                )?;
                ctx.add_edge(FlowEdge::dummy(b, c))?;
                Ok(())
            })),
            Value::Null,
        )])
        .expect("initial build");
        let b = node_by_codelet(&flow, "ex.Split");
        (flow, b)
    }

    #[test]
    fn embedding_replaces_the_node_and_splices_the_boundary() {
        let (mut flow, b) = embeddable();
        flow.build(vec![EmbedRequest::embedding(b)])
            .expect("embed builds");

        assert!(!flow.contains_node(b));
        assert_eq!(flow.node_count(), 4);

        let a = node_by_codelet(&flow, "ex.Create");
        let c = node_by_codelet(&flow, "ex.Merge");

        // The expanded boundary edges each carry exactly one pair and
        // now terminate at the subflow nodes.
        assert_eq!(flow.node(a).out_edges.len(), 2);
        for &eid in &flow.node(a).out_edges {
            let edge = flow.edge(eid);
            assert_ne!(edge.v, c);
            match &edge.kind {
                EdgeKind::Handle { handles, .. } => assert_eq!(handles.len(), 1),
                other => panic!("unexpected kind: {other:?}"),
            }
        }

        // The downstream consumer is now fed by both subflow nodes.
        assert_eq!(flow.node(c).in_edges.len(), 2);
        for &eid in &flow.node(c).in_edges {
            assert_eq!(flow.node(flow.edge(eid).u).codelet, "ex.Part");
        }
    }

    #[test]
    fn unbound_boundary_edges_roll_back_the_embedding() {
        let mut flow = Flow::new(FlowId(4), "partial");
        let subflow = Arc::new(FnBuilder(
            |ctx: &mut BuildContext<'_>, _: &Value, in_edges: &[EdgeId], _: &[NodeId]| {
                let x = ctx.add_node(FlowNode::new("ex.Part"));
                // Bind only the first of two boundary edges.
                ctx.attach_in(in_edges[0], x)?;
                Ok(())
            },
        ));
        flow.build(vec![EmbedRequest::initial(
            Arc::new(FnBuilder(move |ctx: &mut BuildContext<'_>, _: &Value, _: &[EdgeId], _: &[NodeId]| {
                let a = ctx.add_node(FlowNode::new("ex.Create"));
                let b = ctx.add_node(
                    FlowNode::new("ex.Split").with_embedding(subflow.clone()),
                );
                ctx.add_edge(
                    FlowEdge::handle(a, b)
                        .with_name("h")
                        .with_expand_on_embed(true)
                        .with_handles(vec![
                            HandlePair::new("file:///tmp/0", "0"),
                            HandlePair::new("file:///tmp/1", "1"),
                        ]),
                )?;
                Ok(())
            })),
            Value::Null,
        )])
        .expect("initial build");

        let b = node_by_codelet(&flow, "ex.Split");
        let err = flow.build(vec![EmbedRequest::embedding(b)]).unwrap_err();
        assert!(matches!(err, WeftError::Build { .. }));

        // All-or-nothing: the placeholder and its single boundary edge
        // are back.
        assert!(flow.contains_node(b));
        assert_eq!(flow.node_count(), 2);
        assert_eq!(flow.node(b).in_edges.len(), 1);
    }

    #[test]
    fn finished_classes_seed_their_successors() {
        let mut flow = chain();
        let a = node_by_codelet(&flow, "ex.Create");
        let c = node_by_codelet(&flow, "ex.Merge");
        let upstream = flow.node(a).class.unwrap();
        let downstream = flow.node(c).class.unwrap();

        flow.class_mut(upstream).status = LogicalNodeStatus::Finished;
        let eligible = build_count_downs(&mut flow);

        assert_eq!(eligible, vec![downstream]);
        assert_eq!(
            flow.class(downstream).status,
            LogicalNodeStatus::PendingExecute
        );
        assert_eq!(flow.pending_class_count(), 1);
        assert!(flow.status.is_executing());
    }

    #[test]
    fn fully_finished_flows_are_marked_finished() {
        let mut flow = chain();
        for id in flow.class_ids() {
            flow.class_mut(id).status = LogicalNodeStatus::Finished;
        }
        let eligible = build_count_downs(&mut flow);
        assert!(eligible.is_empty());
        assert_eq!(flow.status, FlowStatus::Finished);
        assert_eq!(flow.pending_class_count(), 0);
    }

    #[test]
    fn edge_parameters_apply_positionally() {
        let mut flow = chain();
        let b = node_by_codelet(&flow, "ex.Sort");

        assign_parameters(
            &mut flow,
            b,
            Value::Null,
            vec![crate::message::EdgeParameters {
                handles: vec![HandlePair::new("file:///tmp/out", "out")],
            }],
        )
        .expect("parameters apply");

        let eid = flow.node(b).out_edges[0];
        match &flow.edge(eid).kind {
            EdgeKind::Handle { handles, .. } => {
                assert_eq!(handles.len(), 1);
                assert_eq!(handles[0].stem, "out");
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }
}
