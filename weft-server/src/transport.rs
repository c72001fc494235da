//! The seam between the orchestration loop and worker I/O.
//!
//! The processor never touches sockets. Each worker is represented by
//! a [`Connection`]: an outbound queue of control messages that some
//! transport task drains toward the actual worker. Inbound traffic
//! arrives as [`ServerEvent`](crate::events::ServerEvent)s on the
//! processor queue. [`InMemoryTransport`] wires both directions up
//! without a network and doubles as the test harness for the protocol.

use crate::events::ServerEvent;
use crate::processor::ServerHandle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;
use weft_core::message::ControlMessage;
use weft_core::types::WorkerId;

/// The outbound half of a worker connection.
#[derive(Debug, Clone)]
pub struct Connection {
    worker: WorkerId,
    tx: UnboundedSender<ControlMessage>,
}

impl Connection {
    /// Wraps an outbound queue for the given worker.
    pub fn new(worker: WorkerId, tx: UnboundedSender<ControlMessage>) -> Self {
        Self { worker, tx }
    }

    /// The worker this connection leads to.
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Queues a message toward the worker. A closed transport is not
    /// an error here; the transport task reports it as an end of
    /// stream through the event queue.
    pub fn send(&self, message: ControlMessage) {
        if self.tx.send(message).is_err() {
            debug!(worker = %self.worker, "transport gone, dropping outbound message");
        }
    }
}

/// A loopback transport joining a simulated worker to a processor.
#[derive(Debug)]
pub struct InMemoryTransport {
    worker: WorkerId,
    events: UnboundedSender<ServerEvent>,
    outbound: UnboundedReceiver<ControlMessage>,
}

impl InMemoryTransport {
    /// Connects a new simulated worker to the processor behind the
    /// handle and announces it with an ADDRESS message. An empty
    /// domain means the worker declared none.
    pub fn connect(handle: &ServerHandle, host: &str, port: u16, domain: &str) -> Self {
        let worker = handle.allocate_worker();
        let (tx, outbound) = mpsc::unbounded_channel();
        let events = handle.event_sender();
        let _ = events.send(ServerEvent::Connected {
            connection: Connection::new(worker, tx),
        });
        let transport = Self {
            worker,
            events,
            outbound,
        };
        transport.send(ControlMessage::Address {
            host: host.to_owned(),
            port,
            domain: domain.to_owned(),
        });
        transport
    }

    /// The identity the processor assigned this worker.
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Injects a message as if the worker had sent it.
    pub fn send(&self, message: ControlMessage) {
        let _ = self.events.send(ServerEvent::Message {
            worker: self.worker,
            message,
        });
    }

    /// Injects a transport-level failure.
    pub fn fail(&self, message: impl Into<String>) {
        let _ = self.events.send(ServerEvent::Failed {
            worker: self.worker,
            message: message.into(),
        });
    }

    /// Injects an orderly end of stream, as on worker disconnect.
    pub fn end_of_stream(&self) {
        let _ = self.events.send(ServerEvent::EndOfStream {
            worker: self.worker,
        });
    }

    /// Receives the next message the processor sent this worker.
    pub async fn recv(&mut self) -> Option<ControlMessage> {
        self.outbound.recv().await
    }

    /// Receives without waiting; `None` when the queue is empty.
    pub fn try_recv(&mut self) -> Option<ControlMessage> {
        self.outbound.try_recv().ok()
    }
}
