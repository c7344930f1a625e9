//! Skiff controller: watch → cache → work queue → workers → reconciler.
//!
//! A [`Controller`] owns one watcher, one local cache, one work queue and a pool of workers.
//! Workers only start once the watcher has put the complete initial listing into the cache.

#![forbid(unsafe_code)]

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use kube::core::DynamicObject;
use kube::runtime::watcher::Event;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use skiff_core::{ResourceKey, ResourceSnapshot};
use skiff_kubehub::{ReadyHandle, SubscribeError, WatchScope, Watcher};
use skiff_queue::WorkQueue;
use skiff_store::{local_cache, CacheReader, CacheView};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub mod config;
pub mod reconciler;
pub mod retry;
mod worker;

pub use config::ControllerConfig;
pub use reconciler::{MirrorReconciler, ReconcileError, Reconciler};
pub use retry::{ErrorSink, Outcome, RetryPolicy, TerminalFailure, TracingErrorSink};

use worker::{EnqueueHandler, Worker};

/// Errors that abort a controller before it starts processing.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("timed out after {0:?} waiting for caches to sync")]
    SyncTimeout(Duration),
    #[error("watcher stopped before the initial list was synced")]
    WatcherStopped,
    #[error(transparent)]
    Subscribe(#[from] SubscribeError),
}

/// Read side of a running controller, for whoever displays state.
pub struct ControllerHandle<K> {
    ready: ReadyHandle,
    cache: CacheReader<K>,
    queue: WorkQueue<ResourceKey>,
}

impl<K> Clone for ControllerHandle<K> {
    fn clone(&self) -> Self {
        Self { ready: self.ready.clone(), cache: self.cache.clone(), queue: self.queue.clone() }
    }
}

impl<K> ControllerHandle<K> {
    pub fn has_synced(&self) -> bool { self.ready.has_synced() }

    /// Resolve once the initial list is cached; false if the watcher stopped first.
    pub async fn wait_synced(&self) -> bool { self.ready.wait().await }

    pub fn get(&self, key: &ResourceKey) -> Option<Arc<ResourceSnapshot<K>>> { self.cache.get(key) }
    pub fn view(&self) -> Arc<CacheView<K>> { self.cache.view() }
    pub fn cache(&self) -> &CacheReader<K> { &self.cache }

    /// Keys waiting in the queue plus keys being reconciled right now.
    pub fn pending(&self) -> usize { self.queue.len() + self.queue.in_flight() }
}

pub struct Controller<K: Send + Sync + 'static> {
    name: String,
    config: ControllerConfig,
    queue: WorkQueue<ResourceKey>,
    cache: CacheReader<K>,
    watcher: Watcher<K>,
    ready: ReadyHandle,
    reconciler: Arc<dyn Reconciler<K>>,
    sink: Arc<dyn ErrorSink>,
}

impl<K> Controller<K>
where
    K: DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, config: ControllerConfig, reconciler: Arc<dyn Reconciler<K>>) -> Self {
        let name = name.into();
        let queue = WorkQueue::new(name.clone(), config.rate_limiter());
        let (writer, cache) = local_cache();
        let handler = Arc::new(EnqueueHandler { queue: queue.clone() });
        let (watcher, ready) = Watcher::new(name.clone(), writer, handler);
        Self { name, config, queue, cache, watcher, ready, reconciler, sink: Arc::new(TracingErrorSink) }
    }

    pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn handle(&self) -> ControllerHandle<K> {
        ControllerHandle { ready: self.ready.clone(), cache: self.cache.clone(), queue: self.queue.clone() }
    }

    /// Subscribe to the API resource of `K` and run until `shutdown` fires.
    pub async fn run_with_client(self, client: Client, scope: WatchScope, shutdown: CancellationToken) -> Result<(), ControllerError>
    where
        K: Resource<DynamicType = ()>,
    {
        let events = skiff_kubehub::subscribe::<K>(client, scope).await?;
        self.run(events, shutdown).await
    }

    /// Run over an already established list/watch stream until `shutdown` fires.
    ///
    /// Returns an error only when startup fails; reconcile failures never end the run. On
    /// shutdown, reconciles already in progress are allowed to finish.
    pub async fn run<S, E>(self, events: S, shutdown: CancellationToken) -> Result<(), ControllerError>
    where
        S: Stream<Item = Result<Event<DynamicObject>, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let Self { name, config, queue, cache, watcher, ready, reconciler, sink } = self;
        let watch_token = shutdown.child_token();
        let watcher_task = tokio::spawn(watcher.run(events, watch_token.clone()));

        info!(controller = %name, timeout = ?config.sync_timeout, "waiting for cache sync");
        let synced = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            res = tokio::time::timeout(config.sync_timeout, ready.wait()) => Some(res),
        };
        let failure = match synced {
            None => {
                info!(controller = %name, "shutdown requested before cache sync");
                None
            }
            Some(Err(_)) => Some(ControllerError::SyncTimeout(config.sync_timeout)),
            Some(Ok(false)) => Some(ControllerError::WatcherStopped),
            Some(Ok(true)) => {
                info!(controller = %name, objects = cache.len(), "cache synced");
                let workers = spawn_workers(&config, Worker { queue: queue.clone(), cache, reconciler, retry: RetryPolicy { max_requeues: config.max_requeues }, sink });
                shutdown.cancelled().await;
                info!(controller = %name, "shutting down workers");
                queue.shut_down();
                for (id, handle) in workers.into_iter().enumerate() {
                    if let Err(e) = handle.await {
                        warn!(controller = %name, worker = id, error = %e, "worker task failed");
                    }
                }
                None
            }
        };

        queue.shut_down();
        watch_token.cancel();
        if let Err(e) = watcher_task.await {
            warn!(controller = %name, error = %e, "watcher task failed");
        }
        match failure {
            Some(err) => {
                error!(controller = %name, error = %err, "controller startup failed");
                Err(err)
            }
            None => {
                info!(controller = %name, "controller stopped");
                Ok(())
            }
        }
    }
}

fn spawn_workers<K: Send + Sync + 'static>(config: &ControllerConfig, worker: Worker<K>) -> Vec<JoinHandle<()>> {
    let worker = Arc::new(worker);
    (0..config.workers.max(1)).map(|id| tokio::spawn(Arc::clone(&worker).run(id))).collect()
}
