//! Worker loop: queue → cache → reconciler → retry policy.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use metrics::histogram;
use skiff_core::{EventHandler, ResourceKey, ResourceSnapshot};
use skiff_queue::WorkQueue;
use skiff_store::CacheReader;
use tracing::{debug, info};

use crate::reconciler::{ReconcileError, Reconciler};
use crate::retry::{ErrorSink, RetryPolicy};

/// Event handler the watcher drives: every notification just enqueues the key.
pub(crate) struct EnqueueHandler {
    pub(crate) queue: WorkQueue<ResourceKey>,
}

impl<K> EventHandler<K> for EnqueueHandler {
    fn on_add(&self, key: &ResourceKey, _: &Arc<ResourceSnapshot<K>>) { self.queue.add(key.clone()) }
    fn on_update(&self, key: &ResourceKey, _: &Arc<ResourceSnapshot<K>>) { self.queue.add(key.clone()) }
    fn on_delete(&self, key: &ResourceKey) { self.queue.add(key.clone()) }
}

/// Calls `done` for a key handed out by `get`, however processing ends.
struct DoneGuard<'a> {
    queue: &'a WorkQueue<ResourceKey>,
    key: &'a ResourceKey,
}

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) { self.queue.done(self.key) }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

pub(crate) struct Worker<K: Send + Sync + 'static> {
    pub(crate) queue: WorkQueue<ResourceKey>,
    pub(crate) cache: CacheReader<K>,
    pub(crate) reconciler: Arc<dyn Reconciler<K>>,
    pub(crate) retry: RetryPolicy,
    pub(crate) sink: Arc<dyn ErrorSink>,
}

impl<K: Send + Sync + 'static> Worker<K> {
    pub(crate) async fn run(self: Arc<Self>, id: usize) {
        debug!(worker = id, "worker started");
        while self.process_next_item().await {}
        info!(worker = id, "worker stopped");
    }

    async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        let _done = DoneGuard { queue: &self.queue, key: &key };

        let started = Instant::now();
        let result = self.sync(&key).await;
        histogram!("skiff_reconcile_duration_seconds", started.elapsed().as_secs_f64());
        self.retry.handle(&self.queue, &key, result, self.sink.as_ref());
        true
    }

    /// Reconcile against the cache as it is now, not as it was when the key was queued.
    async fn sync(&self, key: &ResourceKey) -> Result<(), ReconcileError> {
        let attempt = match self.cache.get(key) {
            Some(snapshot) => self.reconciler.apply(key, snapshot),
            None => self.reconciler.cleanup(key),
        };
        match AssertUnwindSafe(attempt).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(ReconcileError::Panicked(panic_message(panic.as_ref()))),
        }
    }
}
