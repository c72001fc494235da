//! Per-worker connection state.

use crate::timer::{TimerHandle, TimerService};
use crate::transport::Connection;
use std::net::SocketAddr;
use std::time::Duration;
use weft_core::types::{FlowId, NodeId, WorkerId};

/// Where a worker is in the control protocol, as seen by the server.
///
/// The worker side additionally passes through connect and shutdown
/// states the server never observes; a connection only becomes visible
/// here once its transport is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    /// Connected, awaiting the ADDRESS announcement.
    Idle,
    /// Enrolled in the wait pool, available for assignment.
    Wait,
    /// RESOURCE sent, awaiting RESOURCE_ACK.
    Resource,
    /// PREPARE sent, awaiting PREPARE_ACK.
    Prepare,
    /// EXECUTE sent, awaiting EXECUTE_ACK.
    Execute,
    /// Protocol violation or transport failure; messages are dropped.
    Invalid,
}

/// The server-side record of one connected worker.
#[derive(Debug)]
pub struct ClientState {
    /// The worker's identity.
    pub worker: WorkerId,
    /// Protocol position.
    pub status: ClientStatus,
    /// Effective capability domain, assigned at enrollment.
    pub domain: String,
    /// The address peers connect to for streams, once announced.
    pub address: Option<SocketAddr>,
    /// The outbound half of the transport.
    pub connection: Connection,
    /// The node this worker is currently bound to, if any.
    pub assignment: Option<(FlowId, NodeId)>,
    timeout_token: u64,
    timeout_handle: Option<TimerHandle>,
}

impl ClientState {
    /// Records a freshly connected worker.
    pub fn new(connection: Connection) -> Self {
        Self {
            worker: connection.worker(),
            status: ClientStatus::Idle,
            domain: String::new(),
            address: None,
            connection,
            assignment: None,
            timeout_token: 0,
            timeout_handle: None,
        }
    }

    /// Arms a fresh deadline for this worker, superseding any armed
    /// one. Earlier firings become stale by token.
    pub fn arm_timeout(&mut self, timers: &TimerService, delay: Duration) {
        self.disarm_timeout();
        self.timeout_handle = Some(timers.schedule(self.worker, self.timeout_token, delay));
    }

    /// Cancels any armed deadline and invalidates its token.
    pub fn disarm_timeout(&mut self) {
        self.timeout_token += 1;
        if let Some(handle) = self.timeout_handle.take() {
            handle.cancel();
        }
    }

    /// Whether a fired deadline is the one currently armed.
    pub fn timeout_is_current(&self, token: u64) -> bool {
        self.timeout_handle.is_some() && token == self.timeout_token
    }
}
