//! The processor's inbound event vocabulary and the outbound
//! flow-lifecycle event stream.

use crate::transport::Connection;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;
use weft_core::flow::{FlowBuilder, FlowStatus, LogicalNodeStatus};
use weft_core::types::{ClassId, FlowId, WorkerId};
use weft_core::Result;

/// The terminal outcome of a flow, published on its watch channel.
/// `None` while the flow is still executing.
pub type FlowOutcome = Option<std::result::Result<(), String>>;

/// Everything the orchestration loop reacts to, in one queue.
#[derive(Debug)]
pub enum ServerEvent {
    /// A worker transport came up.
    Connected {
        /// The outbound half of the new connection.
        connection: Connection,
    },
    /// A worker sent a control message.
    Message {
        /// The sending worker.
        worker: WorkerId,
        /// The decoded message.
        message: weft_core::message::ControlMessage,
    },
    /// A worker transport closed in an orderly way.
    EndOfStream {
        /// The disconnected worker.
        worker: WorkerId,
    },
    /// A worker transport failed.
    Failed {
        /// The failed worker.
        worker: WorkerId,
        /// Rendered failure cause.
        message: String,
    },
    /// An armed deadline fired. Stale tokens are ignored.
    Timeout {
        /// The worker the deadline was armed for.
        worker: WorkerId,
        /// The arming token, compared against the worker's current one.
        token: u64,
    },
    /// Re-evaluate the execute list against the idle pool.
    Refresh,
    /// Stop assigning work until resumed.
    Suspend,
    /// Resume assigning work, with an immediate refresh.
    Resume,
    /// A request-reply exchange from a handle.
    Query(QueryRequest),
    /// The last proxy for a flow was dropped.
    Release(FlowId),
    /// Stop the processor. Pending queries fail from then on.
    Shutdown,
}

/// A handle request carrying its reply channel.
pub enum QueryRequest {
    /// Builds and enrolls a new flow.
    CreateFlow {
        /// Flow name, for logging and snapshots.
        name: String,
        /// The builder producing the initial subflow.
        builder: Arc<dyn FlowBuilder>,
        /// The builder's parameter document.
        parameters: Value,
        /// Which lifecycle events the flow's subscribers receive.
        flags: FlowFlags,
        /// Caller-owned attachment echoed in events and snapshots.
        attachment: Value,
        /// Delivers the flow id and its outcome channel.
        reply: oneshot::Sender<Result<(FlowId, watch::Receiver<FlowOutcome>)>>,
    },
    /// Reports the state of one flow, or of all flows.
    Snapshot {
        /// Restricts the report to one flow when set.
        flow: Option<FlowId>,
        /// Delivers the snapshots.
        reply: oneshot::Sender<Result<Vec<FlowSnapshot>>>,
    },
    /// Forcibly fails a flow and reclaims its workers.
    Purge {
        /// The flow to purge.
        flow: FlowId,
        /// Delivers confirmation.
        reply: oneshot::Sender<Result<()>>,
    },
    /// Sets whether surplus idle workers are shut down after refresh.
    SetAutoClose {
        /// The new setting.
        value: bool,
        /// Delivers confirmation.
        reply: oneshot::Sender<()>,
    },
    /// Shuts down every currently idle worker.
    CloseIdle {
        /// Delivers the number of workers closed.
        reply: oneshot::Sender<usize>,
    },
    /// Counts classes awaiting workers, globally or for one flow.
    PendingCount {
        /// Restricts the count to one flow when set.
        flow: Option<FlowId>,
        /// Delivers the count.
        reply: oneshot::Sender<Result<usize>>,
    },
    /// Opens a lifecycle-event subscription.
    Subscribe {
        /// Delivers the subscriber's receiving end.
        reply: oneshot::Sender<mpsc::Receiver<FlowEvent>>,
    },
}

impl std::fmt::Debug for QueryRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            QueryRequest::CreateFlow { .. } => "CreateFlow",
            QueryRequest::Snapshot { .. } => "Snapshot",
            QueryRequest::Purge { .. } => "Purge",
            QueryRequest::SetAutoClose { .. } => "SetAutoClose",
            QueryRequest::CloseIdle { .. } => "CloseIdle",
            QueryRequest::PendingCount { .. } => "PendingCount",
            QueryRequest::Subscribe { .. } => "Subscribe",
        };
        f.write_str(name)
    }
}

/// Which lifecycle events a flow's owner wants to hear about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlowFlags {
    /// Deliver flow begin/end/error events.
    pub flow: bool,
    /// Deliver per-node begin/end/error events.
    pub node: bool,
}

impl FlowFlags {
    /// No events.
    pub const NONE: FlowFlags = FlowFlags {
        flow: false,
        node: false,
    };
    /// Flow-level events only.
    pub const FLOW: FlowFlags = FlowFlags {
        flow: true,
        node: false,
    };
    /// Node-level events only.
    pub const NODE: FlowFlags = FlowFlags {
        flow: false,
        node: true,
    };
    /// Everything.
    pub const ALL: FlowFlags = FlowFlags {
        flow: true,
        node: true,
    };
}

/// What happened, in a [`FlowEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowEventKind {
    /// The flow was built and enrolled.
    FlowBegin,
    /// The flow finished successfully.
    FlowEnd,
    /// The flow failed and was purged.
    FlowError,
    /// A node's class began executing.
    NodeBegin,
    /// A node's class finished executing.
    NodeEnd,
    /// A node's class failed an execution attempt.
    NodeError,
}

impl FlowEventKind {
    fn is_node_level(self) -> bool {
        matches!(
            self,
            FlowEventKind::NodeBegin | FlowEventKind::NodeEnd | FlowEventKind::NodeError
        )
    }
}

/// One lifecycle event delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowEvent {
    /// What happened.
    pub kind: FlowEventKind,
    /// The flow concerned.
    pub flow: FlowId,
    /// The flow's caller-owned attachment.
    pub flow_attachment: Value,
    /// The node's attachment, for node-level events.
    pub node_attachment: Option<Value>,
    /// Rendered cause, for error events.
    pub error: Option<String>,
}

/// Fan-out of lifecycle events to bounded subscriber queues.
///
/// Publication never blocks the orchestration loop: a subscriber whose
/// queue is full or whose receiver is gone is dropped.
#[derive(Debug)]
pub struct FlowEventBus {
    subscribers: Vec<mpsc::Sender<FlowEvent>>,
    backlog: usize,
}

impl FlowEventBus {
    /// Creates a bus whose subscribers buffer up to `backlog` events.
    pub fn new(backlog: usize) -> Self {
        Self {
            subscribers: Vec::new(),
            backlog: backlog.max(1),
        }
    }

    /// Opens a new subscription.
    pub fn subscribe(&mut self) -> mpsc::Receiver<FlowEvent> {
        let (tx, rx) = mpsc::channel(self.backlog);
        self.subscribers.push(tx);
        rx
    }

    /// Delivers an event to every live subscriber, honoring the flow's
    /// interest flags.
    pub fn publish(&mut self, flags: FlowFlags, event: FlowEvent) {
        let wanted = if event.kind.is_node_level() {
            flags.node
        } else {
            flags.flow
        };
        if !wanted || self.subscribers.is_empty() {
            return;
        }
        self.subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(cause) => {
                debug!(kind = ?event.kind, %cause, "dropping event subscriber");
                false
            }
        });
    }
}

/// A point-in-time report of one enrolled flow.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowSnapshot {
    /// The flow's id.
    pub id: FlowId,
    /// The flow's name.
    pub name: String,
    /// Executing, finished, or failed.
    pub status: FlowStatus,
    /// The flow's caller-owned attachment.
    pub attachment: Value,
    /// Per-class state, in id order.
    pub classes: Vec<ClassSnapshot>,
}

/// One equivalence class within a [`FlowSnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassSnapshot {
    /// The class id.
    pub id: ClassId,
    /// Where the class is in its lifecycle.
    pub status: LogicalNodeStatus,
    /// How many nodes the class contains.
    pub size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(kind: FlowEventKind) -> FlowEvent {
        FlowEvent {
            kind,
            flow: FlowId(1),
            flow_attachment: json!("job-1"),
            node_attachment: None,
            error: None,
        }
    }

    #[test]
    fn flags_gate_delivery_by_level() {
        let mut bus = FlowEventBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(FlowFlags::FLOW, event(FlowEventKind::NodeBegin));
        assert!(rx.try_recv().is_err());

        bus.publish(FlowFlags::FLOW, event(FlowEventKind::FlowEnd));
        assert_eq!(rx.try_recv().unwrap().kind, FlowEventKind::FlowEnd);
    }

    #[test]
    fn full_subscribers_are_dropped_not_awaited() {
        let mut bus = FlowEventBus::new(1);
        let mut rx = bus.subscribe();

        bus.publish(FlowFlags::ALL, event(FlowEventKind::FlowBegin));
        bus.publish(FlowFlags::ALL, event(FlowEventKind::FlowEnd));

        // The first event is still there; the overflow dropped the
        // subscription rather than the loop.
        assert_eq!(rx.try_recv().unwrap().kind, FlowEventKind::FlowBegin);
        bus.publish(FlowFlags::ALL, event(FlowEventKind::FlowError));
        assert!(rx.try_recv().is_err());
    }
}
