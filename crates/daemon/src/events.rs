//! Lifecycle event emission.
//!
//! The manager reports job lifecycle transitions through the
//! [`EncodeEventEmitter`] trait. [`EncodeEventBus`] is the default
//! implementation, fanning events out to any number of subscribers.
//!
//! A cancelled job intentionally emits neither a finish nor an error event;
//! its terminal state is visible only in the logs.

use tokio::sync::broadcast;
use tracing::trace;

use crate::job::{FinishedEncode, JobId};

/// A job lifecycle event.
#[derive(Debug, Clone, PartialEq)]
pub enum EncodeEvent {
    /// A job was admitted to the wait queue
    Added(JobId),
    /// A job completed successfully
    Finished(FinishedEncode),
    /// A job failed to start or its encoder exited non-zero
    Errored,
}

/// Sink for job lifecycle events.
pub trait EncodeEventEmitter: Send + Sync {
    fn emit_add_encode(&self, job_id: JobId);
    fn emit_finish_encode(&self, finished: FinishedEncode);
    fn emit_error_encode(&self);
}

/// Broadcast-backed event emitter.
pub struct EncodeEventBus {
    tx: broadcast::Sender<EncodeEvent>,
}

impl EncodeEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all future lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<EncodeEvent> {
        self.tx.subscribe()
    }

    fn publish(&self, event: EncodeEvent) {
        trace!(?event, "publishing encode event");
        // A send error only means there are currently no subscribers.
        let _ = self.tx.send(event);
    }
}

impl Default for EncodeEventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EncodeEventEmitter for EncodeEventBus {
    fn emit_add_encode(&self, job_id: JobId) {
        self.publish(EncodeEvent::Added(job_id));
    }

    fn emit_finish_encode(&self, finished: FinishedEncode) {
        self.publish(EncodeEvent::Finished(finished));
    }

    fn emit_error_encode(&self) {
        self.publish(EncodeEvent::Errored);
    }
}
