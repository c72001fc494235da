//! Physical nodes of the flow graph.

use crate::flow::build::FlowBuilder;
use crate::types::{ClassId, EdgeId, NodeId, WorkerId};
use regex::Regex;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default execution time limit for a codelet (one day).
pub const DEFAULT_CODELET_TIMEOUT: Duration = Duration::from_millis(86_400_000);

/// Default retry budget for a codelet.
pub const DEFAULT_CODELET_RETRIES: u32 = 8;

/// One schedulable unit of a flow.
///
/// Carries everything the orchestrator needs to place and supervise one
/// codelet execution: the opaque codelet reference, its parameter
/// document, retry/timeout budgets, the domain predicate workers must
/// satisfy, edge incidence lists, and the worker currently bound (if
/// any).
#[derive(Clone)]
pub struct FlowNode {
    /// This node's id in the owning flow's arena.
    pub id: NodeId,
    /// The codelet class the worker instantiates.
    pub codelet: String,
    /// Nested builder for embedding codelets; `None` for ordinary ones.
    pub embedding: Option<Arc<dyn FlowBuilder>>,
    /// Parameter document shipped with the resource descriptor.
    pub parameters: Value,
    /// Embedding parameter document returned by the worker, staged
    /// until the subflow is built.
    pub embedding_parameters: Value,
    /// Execution time limit.
    pub timeout: Duration,
    /// Allowed retries before the owning flow is purged.
    pub retries: u32,
    /// Retries consumed so far.
    pub current_retries: u32,
    /// Predicate a worker's declared domain must satisfy, or `None`
    /// when any worker will do.
    pub domain_pattern: Option<Regex>,
    /// Optional display name; falls back to the codelet class.
    pub name: String,
    /// Opaque caller payload surfaced in lifecycle events.
    pub attachment: Value,
    /// Incoming edges, ordered.
    pub in_edges: Vec<EdgeId>,
    /// Outgoing edges, ordered.
    pub out_edges: Vec<EdgeId>,
    /// The equivalence class this node belongs to.
    pub class: Option<ClassId>,
    /// The worker currently bound to this node.
    pub worker: Option<WorkerId>,
    /// DFS topological order, assigned after each (re)build.
    pub order: i64,
    /// DFS depth, assigned after each (re)build.
    pub depth: i64,
}

impl FlowNode {
    /// Creates a node for the given codelet class.
    ///
    /// The id is a placeholder until the node is added to a flow through
    /// a build context, which assigns the arena id.
    pub fn new(codelet: impl Into<String>) -> Self {
        Self {
            id: NodeId(u32::MAX),
            codelet: codelet.into(),
            embedding: None,
            parameters: Value::Null,
            embedding_parameters: Value::Null,
            timeout: DEFAULT_CODELET_TIMEOUT,
            retries: DEFAULT_CODELET_RETRIES,
            current_retries: 0,
            domain_pattern: None,
            name: String::new(),
            attachment: Value::Null,
            in_edges: Vec::new(),
            out_edges: Vec::new(),
            class: None,
            worker: None,
            order: -1,
            depth: -1,
        }
    }

    /// Marks this node as an embedding codelet with a nested builder.
    pub fn with_embedding(mut self, builder: Arc<dyn FlowBuilder>) -> Self {
        self.embedding = Some(builder);
        self
    }

    /// Sets the parameter document.
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Sets the domain predicate. The pattern is anchored: a worker's
    /// whole declared domain must match.
    pub fn with_domain(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.domain_pattern = Some(Regex::new(&format!("^(?:{pattern})$"))?);
        Ok(self)
    }

    /// Sets the retry budget.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Sets the execution time limit.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the attachment.
    pub fn with_attachment(mut self, attachment: Value) -> Self {
        self.attachment = attachment;
        self
    }

    /// Whether this node places no constraint on worker choice.
    pub fn is_trivial(&self) -> bool {
        self.domain_pattern.is_none()
    }

    /// Whether a worker with the given declared domain satisfies this
    /// node's predicate. Trivial nodes reject nothing.
    pub fn is_satisfied_by(&self, domain: &str) -> bool {
        match &self.domain_pattern {
            Some(pattern) => pattern.is_match(domain),
            None => true,
        }
    }

    /// Whether this node embeds a subflow on completion.
    pub fn is_embedding(&self) -> bool {
        self.embedding.is_some()
    }

    /// Consumes one retry and reports the total consumed.
    pub fn increment_retries(&mut self) -> u32 {
        self.current_retries += 1;
        self.current_retries
    }

    /// Display name, falling back to the codelet class.
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.codelet
        } else {
            &self.name
        }
    }
}

impl fmt::Debug for FlowNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowNode")
            .field("id", &self.id)
            .field("codelet", &self.codelet)
            .field("embedding", &self.embedding.is_some())
            .field("domain", &self.domain_pattern.as_ref().map(Regex::as_str))
            .field("retries", &self.retries)
            .field("current_retries", &self.current_retries)
            .field("in_edges", &self.in_edges)
            .field("out_edges", &self.out_edges)
            .field("class", &self.class)
            .field("worker", &self.worker)
            .field("order", &self.order)
            .finish()
    }
}
