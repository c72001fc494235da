//! The processing task and its handles.
//!
//! All server state lives inside one task draining one queue; handles
//! talk to it exclusively through [`ServerEvent`]s, with oneshot reply
//! channels for request-reply exchanges. Once the task exits, every
//! pending and future query fails with
//! [`WeftError::ProcessorExited`].

use crate::config::ServerConfig;
use crate::events::{FlowEvent, FlowFlags, FlowOutcome, FlowSnapshot, QueryRequest, ServerEvent};
use crate::logic::ServerLogic;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::{oneshot, watch};
use tracing::debug;
use weft_core::flow::FlowBuilder;
use weft_core::types::{FlowId, WorkerId};
use weft_core::{Result, WeftError};

/// Spawns the orchestration loop.
pub struct ServerProcessor;

impl ServerProcessor {
    /// Starts a processor task and returns the handle that drives it.
    /// The task runs until a shutdown is requested or every handle and
    /// transport is gone.
    pub fn spawn(config: ServerConfig) -> ServerHandle {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let loop_tx = tx.clone();
        tokio::spawn(async move {
            let mut logic = ServerLogic::new(config, loop_tx);
            while let Some(event) = rx.recv().await {
                if !logic.process(event) {
                    break;
                }
            }
            debug!("processing task exited");
        });
        ServerHandle {
            tx,
            next_worker: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// A cloneable handle onto a running processor.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    tx: UnboundedSender<ServerEvent>,
    next_worker: Arc<AtomicU64>,
}

impl ServerHandle {
    /// Mints an identity for a connecting worker. Transports call this
    /// before injecting their `Connected` event.
    pub fn allocate_worker(&self) -> WorkerId {
        WorkerId(self.next_worker.fetch_add(1, Ordering::Relaxed))
    }

    /// The processor's event queue, for transports feeding it.
    pub fn event_sender(&self) -> UnboundedSender<ServerEvent> {
        self.tx.clone()
    }

    async fn query<T, F>(&self, request: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<T>) -> QueryRequest,
    {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ServerEvent::Query(request(reply)))
            .map_err(|_| WeftError::ProcessorExited)?;
        rx.await.map_err(|_| WeftError::ProcessorExited)
    }

    /// Builds and enrolls a flow, returning its proxy.
    ///
    /// The flow starts executing as soon as enough workers enroll; the
    /// proxy observes its outcome and purges it on drop of the last
    /// clone.
    pub async fn create_flow(
        &self,
        name: impl Into<String>,
        builder: Arc<dyn FlowBuilder>,
        parameters: Value,
        flags: FlowFlags,
        attachment: Value,
    ) -> Result<FlowProxy> {
        let (id, done) = self
            .query(|reply| QueryRequest::CreateFlow {
                name: name.into(),
                builder,
                parameters,
                flags,
                attachment,
                reply,
            })
            .await??;
        Ok(FlowProxy {
            id,
            handle: self.clone(),
            done,
        })
    }

    /// Reports every enrolled flow, or one of them.
    pub async fn snapshot(&self, flow: Option<FlowId>) -> Result<Vec<FlowSnapshot>> {
        self.query(|reply| QueryRequest::Snapshot { flow, reply })
            .await?
    }

    /// Forcibly fails a flow.
    pub async fn purge(&self, flow: FlowId) -> Result<()> {
        self.query(|reply| QueryRequest::Purge { flow, reply })
            .await?
    }

    /// Sets whether surplus idle workers are shut down after refresh.
    pub async fn set_auto_close(&self, value: bool) -> Result<()> {
        self.query(|reply| QueryRequest::SetAutoClose { value, reply })
            .await
    }

    /// Shuts down every currently idle worker, returning how many.
    pub async fn close_idle(&self) -> Result<usize> {
        self.query(|reply| QueryRequest::CloseIdle { reply }).await
    }

    /// Total members of classes awaiting workers, globally or for one
    /// flow.
    pub async fn pending_count(&self, flow: Option<FlowId>) -> Result<usize> {
        self.query(|reply| QueryRequest::PendingCount { flow, reply })
            .await?
    }

    /// Opens a lifecycle-event subscription.
    pub async fn subscribe(&self) -> Result<mpsc::Receiver<FlowEvent>> {
        self.query(|reply| QueryRequest::Subscribe { reply }).await
    }

    /// Requests an immediate scheduling pass.
    pub fn refresh(&self) {
        let _ = self.tx.send(ServerEvent::Refresh);
    }

    /// Stops assigning work until resumed.
    pub fn suspend(&self) {
        let _ = self.tx.send(ServerEvent::Suspend);
    }

    /// Resumes assigning work.
    pub fn resume(&self) {
        let _ = self.tx.send(ServerEvent::Resume);
    }

    /// Stops the processor, shutting every worker down.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ServerEvent::Shutdown);
    }
}

/// A caller's stake in one enrolled flow.
///
/// Dropping the proxy releases the flow: the server reclaims its entry
/// once it settles. Purge explicitly to abort it instead.
#[derive(Debug)]
pub struct FlowProxy {
    id: FlowId,
    handle: ServerHandle,
    done: watch::Receiver<FlowOutcome>,
}

impl FlowProxy {
    /// The flow's id with its orchestrator.
    pub fn id(&self) -> FlowId {
        self.id
    }

    /// Waits for the flow to finish or fail.
    ///
    /// A failure is reported as rendered text; the original error
    /// stayed on the server side of the listener boundary.
    pub async fn await_done(&mut self) -> Result<()> {
        loop {
            let outcome = self.done.borrow().clone();
            if let Some(outcome) = outcome {
                return outcome.map_err(|message| WeftError::Listener {
                    message,
                    source: None,
                });
            }
            if self.done.changed().await.is_err() {
                return Err(WeftError::ProcessorExited);
            }
        }
    }

    /// Forcibly fails the flow.
    pub async fn purge(&self) -> Result<()> {
        self.handle.purge(self.id).await
    }

    /// Reports the flow's current state.
    pub async fn snapshot(&self) -> Result<FlowSnapshot> {
        let mut snapshots = self.handle.snapshot(Some(self.id)).await?;
        snapshots.pop().ok_or(WeftError::Purged)
    }

    /// Total members of this flow's classes awaiting workers.
    pub async fn pending_count(&self) -> Result<usize> {
        self.handle.pending_count(Some(self.id)).await
    }
}

impl Drop for FlowProxy {
    fn drop(&mut self) {
        let _ = self.handle.tx.send(ServerEvent::Release(self.id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queries_fail_once_the_processor_exits() {
        let handle = ServerProcessor::spawn(ServerConfig::default());
        handle.shutdown();

        // The loop drains the shutdown before this query; either the
        // send fails or the dropped reply channel surfaces the exit.
        let err = loop {
            match handle.pending_count(None).await {
                Err(err) => break err,
                Ok(_) => tokio::task::yield_now().await,
            }
        };
        assert!(matches!(err, WeftError::ProcessorExited));
    }
}
