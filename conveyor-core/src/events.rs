//! Job lifecycle event stream.

use std::time::Duration;

use tokio::sync::broadcast;

use crate::cancel::CancelReason;
use crate::holder::JobId;

/// Lifecycle transitions published by the manager.
#[derive(Clone, Debug)]
pub enum JobEvent {
    /// Committed to a queue; `on_added` has run.
    Added {
        /// The new job.
        id: JobId,
        /// Whether it went to the durable queue.
        persistent: bool,
    },
    /// Claimed by a consumer; `run` is about to execute.
    Started {
        /// The claimed job.
        id: JobId,
        /// Dequeue count including this run.
        run_count: u32,
    },
    /// Finished successfully and left its queue.
    Completed {
        /// The finished job.
        id: JobId,
    },
    /// Failed and re-queued by its retry policy.
    Retrying {
        /// The re-queued job.
        id: JobId,
        /// Dequeue count of the failed run.
        run_count: u32,
        /// Backoff applied to the re-queue, if any.
        delay: Option<Duration>,
    },
    /// Terminally dropped; `on_cancel` has been invoked.
    Cancelled {
        /// The dropped job.
        id: JobId,
        /// Why it was dropped.
        reason: CancelReason,
    },
}

/// Best-effort broadcast fan-out; events are dropped when nobody listens.
#[derive(Debug)]
pub(crate) struct EventBus {
    tx: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub(crate) fn publish(&self, event: JobEvent) {
        // A send error only means no subscriber is connected.
        let _ = self.tx.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}
