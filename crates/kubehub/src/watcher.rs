//! Resource watcher: applies list/watch events to the local cache, then notifies a handler.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use kube::core::DynamicObject;
use kube::runtime::watcher::Event;
use metrics::counter;
use serde::de::DeserializeOwned;
use skiff_core::{DecodeError, EventHandler, ResourceSnapshot};
use skiff_store::CacheWriter;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::decode::{decode, key_of};

/// Readiness of a watcher: true once the initial listing is in the cache and enqueued.
#[derive(Clone)]
pub struct ReadyHandle {
    rx: watch::Receiver<bool>,
}

impl ReadyHandle {
    pub fn has_synced(&self) -> bool { *self.rx.borrow() }

    /// Resolve once synced. Returns false if the watcher went away before ever syncing.
    pub async fn wait(&self) -> bool {
        let mut rx = self.rx.clone();
        let synced = rx.wait_for(|synced| *synced).await.is_ok();
        synced
    }
}

pub struct Watcher<K> {
    name: String,
    cache: CacheWriter<K>,
    handler: Arc<dyn EventHandler<K>>,
    ready: watch::Sender<bool>,
}

impl<K> Watcher<K>
where
    K: DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, cache: CacheWriter<K>, handler: Arc<dyn EventHandler<K>>) -> (Self, ReadyHandle) {
        let (ready, rx) = watch::channel(false);
        (Self { name: name.into(), cache, handler, ready }, ReadyHandle { rx })
    }

    pub fn ready_handle(&self) -> ReadyHandle { ReadyHandle { rx: self.ready.subscribe() } }

    /// Apply one event: cache first, handler second.
    pub fn apply(&self, event: Event<DynamicObject>) {
        counter!("skiff_watch_events_total", 1u64, "watcher" => self.name.clone());
        match event {
            Event::Applied(obj) => match decode::<K>(&obj) {
                Ok(snap) => {
                    let snap = Arc::new(snap);
                    let key = snap.key.clone();
                    match self.cache.upsert(Arc::clone(&snap)) {
                        None => self.handler.on_add(&key, &snap),
                        Some(_) => self.handler.on_update(&key, &snap),
                    }
                }
                Err(e) => self.rejected(e),
            },
            Event::Deleted(obj) => match key_of(&obj.metadata) {
                Ok(key) => {
                    if self.cache.remove(&key).is_none() {
                        debug!(watcher = %self.name, key = %key, "delete for key not in cache");
                    }
                    self.handler.on_delete(&key);
                }
                Err(e) => self.rejected(e),
            },
            Event::Restarted(list) => {
                let listed = list.len();
                let snaps: Vec<Arc<ResourceSnapshot<K>>> = list
                    .iter()
                    .filter_map(|obj| match decode::<K>(obj) {
                        Ok(snap) => Some(Arc::new(snap)),
                        Err(e) => {
                            self.rejected(e);
                            None
                        }
                    })
                    .collect();
                let out = self.cache.replace(snaps);
                for snap in &out.added {
                    self.handler.on_add(&snap.key, snap);
                }
                for snap in &out.updated {
                    self.handler.on_update(&snap.key, snap);
                }
                for key in &out.removed {
                    self.handler.on_delete(key);
                }
                debug!(watcher = %self.name, listed, added = out.added.len(), updated = out.updated.len(), removed = out.removed.len(), "relist applied");
                if !*self.ready.borrow() {
                    self.ready.send_replace(true);
                    info!(watcher = %self.name, objects = listed, "initial list synced");
                }
            }
        }
    }

    fn rejected(&self, err: DecodeError) {
        counter!("skiff_decode_errors_total", 1u64, "watcher" => self.name.clone());
        warn!(watcher = %self.name, error = %err, "dropping object that failed to decode");
    }

    /// Consume the list/watch stream until it ends or `shutdown` fires.
    ///
    /// Stream errors are transient: the underlying watcher relists after them, so they are only
    /// logged here.
    pub async fn run<S, E>(self, stream: S, shutdown: CancellationToken)
    where
        S: Stream<Item = Result<Event<DynamicObject>, E>>,
        E: std::fmt::Display,
    {
        futures::pin_mut!(stream);
        info!(watcher = %self.name, "watcher started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!(watcher = %self.name, "watcher stopping");
                    break;
                }
                next = stream.next() => match next {
                    Some(Ok(ev)) => self.apply(ev),
                    Some(Err(e)) => {
                        counter!("skiff_watch_errors_total", 1u64, "watcher" => self.name.clone());
                        warn!(watcher = %self.name, error = %e, "watch stream error");
                    }
                    None => {
                        warn!(watcher = %self.name, "watcher stream ended");
                        break;
                    }
                },
            }
        }
    }
}
