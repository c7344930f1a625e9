//! Skiff kubehub: list/watch subscription and the resource watcher feeding the local cache

#![forbid(unsafe_code)]

use futures::Stream;
use kube::{
    api::{Api, ListParams},
    core::{ApiResource, DynamicObject},
    runtime::{
        watcher::{self as kube_watcher, Event},
        WatchStreamExt,
    },
    Client, Resource,
};
use serde::{Deserialize, Serialize};
use tracing::info;

pub mod decode;
pub mod watcher;

pub use decode::{decode, key_of};
pub use watcher::{ReadyHandle, Watcher};

/// Which objects of a kind to watch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchScope {
    /// Restrict to one namespace; all namespaces when unset.
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    #[error("cannot list {resource}")]
    Probe {
        resource: String,
        #[source]
        source: kube::Error,
    },
}

/// Open a list/watch stream over the API resource of `K`.
///
/// A one-item list is issued first so that an unreachable API or missing RBAC fails here, once,
/// instead of turning into an endless relist loop. After that the stream reconnects on its own
/// with backoff.
pub async fn subscribe<K>(
    client: Client,
    scope: WatchScope,
) -> Result<impl Stream<Item = Result<Event<DynamicObject>, kube_watcher::Error>> + Send + 'static, SubscribeError>
where
    K: Resource<DynamicType = ()> + 'static,
{
    let ar = ApiResource::erase::<K>(&());
    let api: Api<DynamicObject> = match scope.namespace.as_deref() {
        Some(ns) => Api::namespaced_with(client, ns, &ar),
        None => Api::all_with(client, &ar),
    };

    let mut probe = ListParams::default().limit(1);
    let mut cfg = kube_watcher::Config::default();
    if let Some(labels) = scope.label_selector.as_deref() {
        probe = probe.labels(labels);
        cfg = cfg.labels(labels);
    }
    if let Some(fields) = scope.field_selector.as_deref() {
        probe = probe.fields(fields);
        cfg = cfg.fields(fields);
    }
    api.list(&probe)
        .await
        .map_err(|source| SubscribeError::Probe { resource: ar.plural.clone(), source })?;

    info!(resource = %ar.plural, ns = ?scope.namespace, labels = ?scope.label_selector, fields = ?scope.field_selector, "subscribed");
    Ok(kube_watcher::watcher(api, cfg).default_backoff())
}
