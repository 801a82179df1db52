//! Storage key derivation.
//!
//! Keys look like `<root>/<resource>/<namespace>/<name>` for namespaced kinds
//! and `<root>/<resource>/<name>` for cluster-scoped ones. Collection prefixes
//! always end with `/` so that a namespace never matches another namespace it
//! happens to prefix (`default` vs `default2`).

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const SEP: char = '/';

/// A fully derived storage key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageKey(String);

impl StorageKey {
    pub fn as_str(&self) -> &str { &self.0 }

    pub fn into_string(self) -> String { self.0 }
}

impl std::fmt::Display for StorageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(&self.0) }
}

impl AsRef<str> for StorageKey {
    fn as_ref(&self) -> &str { &self.0 }
}

/// Derives keys and list prefixes for one resource kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBuilder {
    base: String,
    namespaced: bool,
}

impl KeyBuilder {
    /// Builder for a namespaced kind stored under `<root>/<resource>`.
    pub fn namespaced(root: &str, resource: &str) -> Self {
        Self { base: join_base(root, resource), namespaced: true }
    }

    /// Builder for a cluster-scoped kind stored under `<root>/<resource>`.
    pub fn cluster(root: &str, resource: &str) -> Self {
        Self { base: join_base(root, resource), namespaced: false }
    }

    pub fn is_namespaced(&self) -> bool { self.namespaced }

    /// Collection root for this kind, without trailing separator.
    pub fn base(&self) -> &str { &self.base }

    /// Key for a single object.
    pub fn key_for(&self, namespace: Option<&str>, name: &str) -> Result<StorageKey> {
        validate_segment("name", name)?;
        match (self.namespaced, non_empty(namespace)) {
            (true, Some(ns)) => {
                validate_segment("namespace", ns)?;
                Ok(StorageKey(format!("{}{SEP}{}{SEP}{}", self.base, ns, name)))
            }
            (true, None) => Err(Error::InvalidKey(format!("namespace required for {}", name))),
            (false, None) => Ok(StorageKey(format!("{}{SEP}{}", self.base, name))),
            (false, Some(ns)) => Err(Error::InvalidKey(format!(
                "cluster-scoped object {} cannot carry namespace {}",
                name, ns
            ))),
        }
    }

    /// Prefix covering every object of this kind in `namespace`, or in all
    /// namespaces when `namespace` is empty/absent.
    pub fn prefix_for(&self, namespace: Option<&str>) -> Result<StorageKey> {
        match (self.namespaced, non_empty(namespace)) {
            (true, Some(ns)) => {
                validate_segment("namespace", ns)?;
                Ok(StorageKey(format!("{}{SEP}{}{SEP}", self.base, ns)))
            }
            (_, None) => Ok(StorageKey(format!("{}{SEP}", self.base))),
            (false, Some(ns)) => Err(Error::InvalidKey(format!("cluster-scoped kind cannot be listed in namespace {}", ns))),
        }
    }
}

fn join_base(root: &str, resource: &str) -> String {
    let root = root.trim_end_matches(SEP);
    let resource = resource.trim_matches(SEP);
    format!("{}{SEP}{}", root, resource)
}

fn non_empty(s: Option<&str>) -> Option<&str> { s.filter(|s| !s.is_empty()) }

/// Rejects values that cannot be used as a single path segment.
fn validate_segment(what: &str, s: &str) -> Result<()> {
    if s.is_empty() {
        return Err(Error::InvalidKey(format!("{} must not be empty", what)));
    }
    if s == "." || s == ".." {
        return Err(Error::InvalidKey(format!("{} may not be {:?}", what, s)));
    }
    if let Some(bad) = s.chars().find(|c| *c == SEP || *c == '%') {
        return Err(Error::InvalidKey(format!("{} {:?} may not contain {:?}", what, s, bad)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaced_keys() {
        let kb = KeyBuilder::namespaced("/registry", "horizontalpodautoscalers");
        let k = kb.key_for(Some("default"), "foo").unwrap();
        assert_eq!(k.as_str(), "/registry/horizontalpodautoscalers/default/foo");
        assert_eq!(kb.prefix_for(Some("default")).unwrap().as_str(), "/registry/horizontalpodautoscalers/default/");
        assert_eq!(kb.prefix_for(None).unwrap().as_str(), "/registry/horizontalpodautoscalers/");
        assert_eq!(kb.prefix_for(Some("")).unwrap().as_str(), "/registry/horizontalpodautoscalers/");
        assert!(kb.key_for(None, "foo").is_err());
    }

    #[test]
    fn cluster_keys() {
        let kb = KeyBuilder::cluster("/registry/", "/namespaces/");
        assert_eq!(kb.key_for(None, "kube-system").unwrap().as_str(), "/registry/namespaces/kube-system");
        assert_eq!(kb.key_for(Some(""), "a").unwrap().as_str(), "/registry/namespaces/a");
        assert!(matches!(kb.key_for(Some("x"), "a"), Err(Error::InvalidKey(_))));
        assert!(kb.prefix_for(Some("x")).is_err());
    }

    #[test]
    fn empty_root_still_yields_absolute_keys() {
        let kb = KeyBuilder::namespaced("", "pods");
        assert_eq!(kb.key_for(Some("ns"), "p").unwrap().as_str(), "/pods/ns/p");
    }

    #[test]
    fn rejects_bad_segments() {
        let kb = KeyBuilder::namespaced("/registry", "things");
        for bad in ["", ".", "..", "a/b", "50%"] {
            assert!(matches!(kb.key_for(Some("default"), bad), Err(Error::InvalidKey(_))), "name {:?}", bad);
        }
        assert!(matches!(kb.key_for(Some("a/b"), "ok"), Err(Error::InvalidKey(_))));
    }

    #[test]
    fn distinct_identities_map_to_distinct_keys() {
        let kb = KeyBuilder::namespaced("/r", "things");
        let a = kb.key_for(Some("default"), "x").unwrap();
        let b = kb.key_for(Some("default2"), "x").unwrap();
        let c = kb.key_for(Some("default"), "x2").unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
        let p = kb.prefix_for(Some("default")).unwrap();
        assert!(a.as_str().starts_with(p.as_str()));
        assert!(!b.as_str().starts_with(p.as_str()));
    }
}
