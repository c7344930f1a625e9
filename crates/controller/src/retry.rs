//! What happens to a key after a reconcile attempt.

use metrics::counter;
use skiff_core::ResourceKey;
use skiff_queue::WorkQueue;
use tracing::{error, warn};

use crate::reconciler::ReconcileError;

/// A key given up on, either out of retries or failed while the queue was shutting down.
#[derive(Debug)]
pub struct TerminalFailure {
    pub key: ResourceKey,
    /// Requeues already spent on this key before it was dropped.
    pub requeues: u32,
    pub error: ReconcileError,
}

/// Receives terminal failures. The key can still come back with a later watch event.
pub trait ErrorSink: Send + Sync {
    fn report(&self, failure: TerminalFailure);
}

/// Logs terminal failures.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, failure: TerminalFailure) {
        error!(key = %failure.key, requeues = failure.requeues, error = %failure.error, "dropping key out of the queue");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Synced,
    /// Requeued for retry number `attempt` (1-based).
    Requeued { attempt: u32 },
    Dropped,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_requeues: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self { Self { max_requeues: 5 } }
}

impl RetryPolicy {
    pub fn handle(
        &self,
        queue: &WorkQueue<ResourceKey>,
        key: &ResourceKey,
        result: Result<(), ReconcileError>,
        sink: &dyn ErrorSink,
    ) -> Outcome {
        let err = match result {
            Ok(()) => {
                // retry history starts over after a success
                queue.forget(key);
                return Outcome::Synced;
            }
            Err(err) => err,
        };

        let requeues = queue.num_requeues(key);
        if queue.is_shutting_down() {
            warn!(key = %key, requeues, error = %err, "reconcile failed while shutting down; not requeueing");
            return self.drop_key(queue, key, requeues, err, sink);
        }
        if requeues < self.max_requeues {
            warn!(key = %key, attempt = requeues + 1, error = %err, "reconcile failed; requeueing");
            queue.add_rate_limited(key.clone());
            return Outcome::Requeued { attempt: requeues + 1 };
        }

        self.drop_key(queue, key, requeues, err, sink)
    }

    fn drop_key(
        &self,
        queue: &WorkQueue<ResourceKey>,
        key: &ResourceKey,
        requeues: u32,
        error: ReconcileError,
        sink: &dyn ErrorSink,
    ) -> Outcome {
        queue.forget(key);
        counter!("skiff_reconcile_dropped_total", 1u64);
        sink.report(TerminalFailure { key: key.clone(), requeues, error });
        Outcome::Dropped
    }
}
