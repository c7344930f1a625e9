//! Skiff core types: resource identity, snapshots, and the watch-event capability

#![forbid(unsafe_code)]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use smallvec::SmallVec;

mod key;

pub use key::ResourceKey;

pub type Uid = [u8; 16];

/// Labels carried on a snapshot, as `(key, value)` pairs.
pub type Labels = SmallVec<[(String, String); 8]>;

/// Immutable state of one resource as last observed by the watcher.
///
/// Snapshots are never mutated in place: an update replaces the `Arc` held by the cache.
#[derive(Debug, Clone)]
pub struct ResourceSnapshot<K> {
    pub key: ResourceKey,
    pub uid: Option<Uid>,
    pub resource_version: Option<String>,
    /// Seconds since epoch, 0 when the object carries no creation timestamp.
    pub creation_ts: i64,
    pub labels: Labels,
    pub observed_at: DateTime<Utc>,
    pub object: K,
}

impl<K> ResourceSnapshot<K> {
    pub fn new(key: ResourceKey, object: K) -> Self {
        Self {
            key,
            uid: None,
            resource_version: None,
            creation_ts: 0,
            labels: Labels::new(),
            observed_at: Utc::now(),
            object,
        }
    }

    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }
}

/// Capability the watcher drives after every cache write.
///
/// The cache has already been updated when any of these is called.
pub trait EventHandler<K>: Send + Sync {
    fn on_add(&self, key: &ResourceKey, snapshot: &Arc<ResourceSnapshot<K>>);
    fn on_update(&self, key: &ResourceKey, snapshot: &Arc<ResourceSnapshot<K>>);
    fn on_delete(&self, key: &ResourceKey);
}

/// Failure to turn a watched object into a typed snapshot.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("object has no metadata.name")]
    MissingName,
    #[error("invalid resource key {0:?}")]
    InvalidKey(String),
    #[error("invalid metadata.uid {uid:?} on {key}")]
    InvalidUid {
        key: ResourceKey,
        uid: String,
        #[source]
        source: uuid::Error,
    },
    #[error("could not decode {key} as {kind}")]
    Malformed {
        key: ResourceKey,
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Parse a `metadata.uid` string into raw bytes.
pub fn parse_uid(key: &ResourceKey, uid: &str) -> Result<Uid, DecodeError> {
    uuid::Uuid::parse_str(uid)
        .map(|u| *u.as_bytes())
        .map_err(|source| DecodeError::InvalidUid { key: key.clone(), uid: uid.to_string(), source })
}

pub mod prelude {
    pub use super::{DecodeError, EventHandler, Labels, ResourceKey, ResourceSnapshot, Uid};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_parses_into_bytes() {
        let key = ResourceKey::from_parts(Some("ns"), "a").unwrap();
        let uid = parse_uid(&key, "00000000-0000-0000-0000-000000000001").unwrap();
        assert_eq!(uid[15], 1);
        assert!(uid[..15].iter().all(|b| *b == 0));
    }

    #[test]
    fn bad_uid_names_the_key() {
        let key = ResourceKey::from_parts(Some("ns"), "a").unwrap();
        let err = parse_uid(&key, "not-a-uid").unwrap_err();
        assert!(err.to_string().contains("ns/a"));
    }

    #[test]
    fn label_lookup() {
        let key = ResourceKey::from_parts(Some("ns"), "a").unwrap();
        let mut snap = ResourceSnapshot::new(key, ());
        snap.labels.push(("app".into(), "web".into()));
        assert_eq!(snap.label("app"), Some("web"));
        assert_eq!(snap.label("tier"), None);
    }
}
