//! Typed decode at the watch boundary.
//!
//! Everything the cache and queue see has been through here; an object that does not decode
//! into `K` is rejected before it can reach either.

use kube::core::{DynamicObject, ObjectMeta};
use serde::de::DeserializeOwned;
use skiff_core::{parse_uid, DecodeError, ResourceKey, ResourceSnapshot};

/// `namespace/name` for namespaced objects, `name` for cluster-scoped ones.
pub fn key_of(meta: &ObjectMeta) -> Result<ResourceKey, DecodeError> {
    let name = meta.name.as_deref().ok_or(DecodeError::MissingName)?;
    ResourceKey::from_parts(meta.namespace.as_deref(), name)
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if !cfg!(feature = "strip-managed-fields") {
        return;
    }
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}

fn kind_name<K>() -> &'static str {
    let full = std::any::type_name::<K>();
    full.rsplit("::").next().unwrap_or(full)
}

/// Decode a watched object into a typed snapshot.
pub fn decode<K: DeserializeOwned>(obj: &DynamicObject) -> Result<ResourceSnapshot<K>, DecodeError> {
    let key = key_of(&obj.metadata)?;
    let malformed = |key: &ResourceKey, source: serde_json::Error| DecodeError::Malformed { key: key.clone(), kind: kind_name::<K>(), source };

    let mut raw = serde_json::to_value(obj).map_err(|e| malformed(&key, e))?;
    strip_managed_fields(&mut raw);
    let object: K = serde_json::from_value(raw).map_err(|e| malformed(&key, e))?;

    let meta = &obj.metadata;
    let uid = meta.uid.as_deref().map(|u| parse_uid(&key, u)).transpose()?;
    let mut snap = ResourceSnapshot::new(key, object);
    snap.uid = uid;
    snap.resource_version = meta.resource_version.clone();
    snap.creation_ts = meta.creation_timestamp.as_ref().map(|t| t.0.timestamp()).unwrap_or(0);
    snap.labels = meta.labels.iter().flatten().map(|(k, v)| (k.clone(), v.clone())).collect();
    Ok(snap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::Deployment;

    fn dynamic(v: serde_json::Value) -> DynamicObject { serde_json::from_value(v).unwrap() }

    fn deployment(ns: &str, name: &str, replicas: serde_json::Value) -> DynamicObject {
        dynamic(serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": name,
                "namespace": ns,
                "uid": "00000000-0000-0000-0000-000000000007",
                "resourceVersion": "42",
                "creationTimestamp": "2020-01-01T00:00:00Z",
                "labels": { "app": "web" },
                "managedFields": [{ "manager": "kubectl" }],
            },
            "spec": {
                "replicas": replicas,
                "selector": { "matchLabels": { "app": "web" } },
                "template": { "metadata": { "labels": { "app": "web" } } },
            },
        }))
    }

    #[test]
    fn decodes_typed_deployment_with_metadata() {
        let snap = decode::<Deployment>(&deployment("prod", "web", serde_json::json!(3))).unwrap();
        assert_eq!(snap.key.as_str(), "prod/web");
        assert_eq!(snap.resource_version.as_deref(), Some("42"));
        assert_eq!(snap.creation_ts, 1_577_836_800);
        assert_eq!(snap.uid.map(|u| u[15]), Some(7));
        assert_eq!(snap.label("app"), Some("web"));
        assert_eq!(snap.object.spec.as_ref().and_then(|s| s.replicas), Some(3));
    }

    #[cfg(feature = "strip-managed-fields")]
    #[test]
    fn managed_fields_are_dropped() {
        let snap = decode::<Deployment>(&deployment("prod", "web", serde_json::json!(1))).unwrap();
        assert!(snap.object.metadata.managed_fields.is_none());
    }

    #[test]
    fn wrong_shape_is_a_decode_error() {
        let err = decode::<Deployment>(&deployment("prod", "web", serde_json::json!("three"))).unwrap_err();
        match err {
            DecodeError::Malformed { key, kind, .. } => {
                assert_eq!(key.as_str(), "prod/web");
                assert_eq!(kind, "Deployment");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn nameless_object_has_no_key() {
        let obj = dynamic(serde_json::json!({ "apiVersion": "apps/v1", "kind": "Deployment", "metadata": {} }));
        assert!(matches!(decode::<Deployment>(&obj), Err(DecodeError::MissingName)));
    }

    #[test]
    fn cluster_scoped_key_is_bare_name() {
        let meta = ObjectMeta { name: Some("node-1".into()), ..Default::default() };
        assert_eq!(key_of(&meta).unwrap().as_str(), "node-1");
    }
}
