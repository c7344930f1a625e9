//! The reconcile contract and the bookkeeping reconciler.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use skiff_core::{ResourceKey, ResourceSnapshot};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
    #[error("reconciler panicked: {0}")]
    Panicked(String),
}

/// Converges one key towards its cached state.
///
/// Workers call `apply` when the cache holds a snapshot for the key and `cleanup` when it does
/// not, which includes keys that were never seen at all. Neither is ever called concurrently
/// for the same key.
#[async_trait]
pub trait Reconciler<K: Send + Sync + 'static>: Send + Sync {
    async fn apply(&self, key: &ResourceKey, snapshot: Arc<ResourceSnapshot<K>>) -> Result<(), ReconcileError>;
    async fn cleanup(&self, key: &ResourceKey) -> Result<(), ReconcileError>;
}

/// Keeps the latest reconciled snapshot of every live key.
pub struct MirrorReconciler<K> {
    seen: RwLock<FxHashMap<ResourceKey, Arc<ResourceSnapshot<K>>>>,
}

impl<K> Default for MirrorReconciler<K> {
    fn default() -> Self { Self { seen: RwLock::new(FxHashMap::default()) } }
}

impl<K> MirrorReconciler<K> {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.seen.read().unwrap_or_else(PoisonError::into_inner).len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn get(&self, key: &ResourceKey) -> Option<Arc<ResourceSnapshot<K>>> {
        self.seen.read().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }

    /// Reconciled keys, sorted.
    pub fn keys(&self) -> Vec<ResourceKey> {
        let mut keys: Vec<_> = self.seen.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect();
        keys.sort_unstable();
        keys
    }
}

#[async_trait]
impl<K: Send + Sync + 'static> Reconciler<K> for MirrorReconciler<K> {
    async fn apply(&self, key: &ResourceKey, snapshot: Arc<ResourceSnapshot<K>>) -> Result<(), ReconcileError> {
        debug!(key = %key, rv = ?snapshot.resource_version, "mirror apply");
        self.seen.write().unwrap_or_else(PoisonError::into_inner).insert(key.clone(), snapshot);
        Ok(())
    }

    async fn cleanup(&self, key: &ResourceKey) -> Result<(), ReconcileError> {
        let existed = self.seen.write().unwrap_or_else(PoisonError::into_inner).remove(key).is_some();
        debug!(key = %key, existed, "mirror cleanup");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mirror_tracks_apply_and_cleanup() {
        let m = MirrorReconciler::<u32>::new();
        let a: ResourceKey = "ns/a".parse().unwrap();
        m.apply(&a, Arc::new(ResourceSnapshot::new(a.clone(), 1))).await.unwrap();
        m.apply(&a, Arc::new(ResourceSnapshot::new(a.clone(), 2))).await.unwrap();
        assert_eq!(m.get(&a).map(|s| s.object), Some(2));
        m.cleanup(&a).await.unwrap();
        assert!(m.is_empty());
    }

    #[tokio::test]
    async fn cleanup_of_unknown_key_is_fine() {
        let m = MirrorReconciler::<u32>::new();
        assert!(m.cleanup(&"ns/never".parse().unwrap()).await.is_ok());
    }
}
