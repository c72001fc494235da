//! Deadline scheduling for the orchestration loop.
//!
//! The processor arms a deadline whenever a worker owes an
//! acknowledgement or is executing under a time limit. A timer fires by
//! injecting a [`ServerEvent::Timeout`] back into the processor queue;
//! staleness is resolved there by token comparison, so cancelling a
//! handle is an optimization rather than a correctness requirement.

use crate::events::ServerEvent;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use weft_core::types::WorkerId;

/// Schedules timeout events against the processor queue.
#[derive(Debug, Clone)]
pub struct TimerService {
    tx: UnboundedSender<ServerEvent>,
}

impl TimerService {
    /// Creates a service that delivers into the given processor queue.
    pub fn new(tx: UnboundedSender<ServerEvent>) -> Self {
        Self { tx }
    }

    /// Arms a deadline for a worker. The token is echoed back in the
    /// resulting event so the processor can discard stale firings.
    pub fn schedule(&self, worker: WorkerId, token: u64, delay: Duration) -> TimerHandle {
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // The processor may already be gone; nothing to do then.
            let _ = tx.send(ServerEvent::Timeout { worker, token });
        });
        TimerHandle { task }
    }
}

/// An armed deadline. Dropping the handle does not cancel the timer;
/// call [`cancel`](TimerHandle::cancel) or rely on token staleness.
#[derive(Debug)]
pub struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Aborts the pending firing.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn deadlines_fire_with_their_token() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timers = TimerService::new(tx);
        let _handle = timers.schedule(WorkerId(7), 3, Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(61)).await;
        match rx.recv().await {
            Some(ServerEvent::Timeout { worker, token }) => {
                assert_eq!(worker, WorkerId(7));
                assert_eq!(token, 3);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_deadlines_stay_silent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timers = TimerService::new(tx);
        let handle = timers.schedule(WorkerId(7), 3, Duration::from_secs(60));
        handle.cancel();

        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(rx.try_recv().is_err());
    }
}
