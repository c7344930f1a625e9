use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::DecodeError;

/// Identity of a watched object: `namespace/name`, or just `name` when cluster-scoped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn from_parts(namespace: Option<&str>, name: &str) -> Result<Self, DecodeError> {
        if name.is_empty() {
            return Err(DecodeError::MissingName);
        }
        if name.contains('/') {
            return Err(DecodeError::InvalidKey(name.to_string()));
        }
        match namespace.filter(|ns| !ns.is_empty()) {
            Some(ns) if ns.contains('/') => Err(DecodeError::InvalidKey(format!("{}/{}", ns, name))),
            Some(ns) => Ok(Self(format!("{}/{}", ns, name))),
            None => Ok(Self(name.to_string())),
        }
    }

    pub fn as_str(&self) -> &str { &self.0 }

    pub fn namespace(&self) -> Option<&str> {
        self.0.split_once('/').map(|(ns, _)| ns)
    }

    pub fn name(&self) -> &str {
        self.0.split_once('/').map(|(_, n)| n).unwrap_or(&self.0)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl FromStr for ResourceKey {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Self::from_parts(Some(ns), name)
            }
            Some(_) => Err(DecodeError::InvalidKey(s.to_string())),
            None => Self::from_parts(None, s),
        }
    }
}

impl TryFrom<String> for ResourceKey {
    type Error = DecodeError;
    fn try_from(s: String) -> Result<Self, Self::Error> { s.parse() }
}

impl From<ResourceKey> for String {
    fn from(k: ResourceKey) -> Self { k.0 }
}

impl AsRef<str> for ResourceKey {
    fn as_ref(&self) -> &str { &self.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaced_key() {
        let k = ResourceKey::from_parts(Some("prod"), "web").unwrap();
        assert_eq!(k.as_str(), "prod/web");
        assert_eq!(k.namespace(), Some("prod"));
        assert_eq!(k.name(), "web");
    }

    #[test]
    fn cluster_scoped_key_has_no_namespace() {
        let k = ResourceKey::from_parts(None, "node-1").unwrap();
        assert_eq!(k.to_string(), "node-1");
        assert_eq!(k.namespace(), None);
        // empty namespace is treated as cluster-scoped
        assert_eq!(ResourceKey::from_parts(Some(""), "node-1").unwrap(), k);
    }

    #[test]
    fn empty_name_is_rejected() {
        assert!(matches!(ResourceKey::from_parts(Some("ns"), ""), Err(DecodeError::MissingName)));
    }

    #[test]
    fn parse_round_trips_display() {
        for s in ["ns/a", "a"] {
            let k: ResourceKey = s.parse().unwrap();
            assert_eq!(k.to_string(), s);
        }
        for bad in ["", "/a", "ns/", "a/b/c"] {
            assert!(bad.parse::<ResourceKey>().is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn serde_uses_plain_string() {
        let k = ResourceKey::from_parts(Some("ns"), "a").unwrap();
        assert_eq!(serde_json::to_string(&k).unwrap(), "\"ns/a\"");
        let back: ResourceKey = serde_json::from_str("\"ns/a\"").unwrap();
        assert_eq!(back, k);
        assert!(serde_json::from_str::<ResourceKey>("\"a/b/c\"").is_err());
    }
}
