//! Untyped cluster objects and their identity.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use super::scope;

/// Identity of a cluster object: (group, kind, namespace, name).
///
/// Cluster-scoped objects carry an empty namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(
        group: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn namespace_key(name: impl Into<String>) -> Self {
        Self::new("", "Namespace", "", name)
    }

    pub fn is_cluster_scoped(&self) -> bool {
        self.namespace.is_empty()
    }

    pub fn is_namespace(&self) -> bool {
        self.group.is_empty() && self.kind == "Namespace"
    }

    pub fn is_application(&self) -> bool {
        self.group == super::GROUP && self.kind == "Application"
    }

    /// `group/kind`, with the core group spelled `core`.
    pub fn group_kind(&self) -> String {
        let group = if self.group.is_empty() {
            "core"
        } else {
            &self.group
        };
        format!("{}/{}", group, self.kind)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.group_kind(), self.name)
        } else {
            write!(f, "{}/{}/{}", self.group_kind(), self.namespace, self.name)
        }
    }
}

/// Returns the API group of an `apiVersion` string (`apps/v1` -> `apps`).
pub fn api_group(api_version: &str) -> &str {
    match api_version.split_once('/') {
        Some((group, _)) => group,
        None => "",
    }
}

/// A cluster object as a JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest(Value);

impl Manifest {
    /// Wraps a JSON object, checking it carries `apiVersion`, `kind` and
    /// `metadata.name`.
    pub fn from_value(value: Value) -> Result<Self, String> {
        let obj = value
            .as_object()
            .ok_or_else(|| "manifest is not an object".to_string())?;
        for field in ["apiVersion", "kind"] {
            match obj.get(field).and_then(Value::as_str) {
                Some(s) if !s.is_empty() => {}
                _ => return Err(format!("manifest is missing '{}'", field)),
            }
        }
        match value.pointer("/metadata/name").and_then(Value::as_str) {
            Some(s) if !s.is_empty() => {}
            _ => return Err("manifest is missing 'metadata.name'".to_string()),
        }
        Ok(Self(value))
    }

    /// A bare Namespace object.
    pub fn namespace_object(name: &str) -> Self {
        Self(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {"name": name},
        }))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn as_value_mut(&mut self) -> &mut Value {
        &mut self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn api_version(&self) -> &str {
        self.str_at("/apiVersion").unwrap_or_default()
    }

    pub fn group(&self) -> &str {
        api_group(self.api_version())
    }

    pub fn kind(&self) -> &str {
        self.str_at("/kind").unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        self.str_at("/metadata/name").unwrap_or_default()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.str_at("/metadata/namespace").filter(|s| !s.is_empty())
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(
            self.group(),
            self.kind(),
            self.namespace().unwrap_or_default(),
            self.name(),
        )
    }

    pub fn is_cluster_scoped(&self) -> bool {
        scope::is_cluster_scoped(self.group(), self.kind())
    }

    /// Fills in `metadata.namespace` for namespaced kinds without one and
    /// strips it from cluster-scoped kinds.
    pub fn default_namespace(&mut self, namespace: &str) {
        let cluster_scoped = self.is_cluster_scoped();
        let meta = self.metadata_mut();
        if cluster_scoped {
            meta.remove("namespace");
        } else if !namespace.is_empty()
            && meta
                .get("namespace")
                .and_then(Value::as_str)
                .is_none_or(str::is_empty)
        {
            meta.insert("namespace".into(), Value::String(namespace.to_string()));
        }
    }

    pub fn pointer(&self, path: &str) -> Option<&Value> {
        self.0.pointer(path)
    }

    pub fn str_at(&self, path: &str) -> Option<&str> {
        self.0.pointer(path).and_then(Value::as_str)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.0
            .get("metadata")
            .and_then(|m| m.get("annotations"))
            .and_then(|a| a.get(key))
            .and_then(Value::as_str)
    }

    pub fn set_annotation(&mut self, key: &str, value: impl Into<String>) {
        let meta = self.metadata_mut();
        let annotations = meta
            .entry("annotations")
            .or_insert_with(|| Value::Object(Map::new()));
        if !annotations.is_object() {
            *annotations = Value::Object(Map::new());
        }
        if let Some(map) = annotations.as_object_mut() {
            map.insert(key.to_string(), Value::String(value.into()));
        }
    }

    pub fn remove_annotation(&mut self, key: &str) -> Option<String> {
        let meta = self.metadata_mut();
        let annotations = meta.get_mut("annotations")?.as_object_mut()?;
        let removed = annotations.remove(key);
        if annotations.is_empty() {
            meta.remove("annotations");
        }
        removed.and_then(|v| v.as_str().map(String::from))
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.0
            .pointer("/metadata/labels")
            .and_then(|l| l.get(key))
            .and_then(Value::as_str)
    }

    pub fn finalizers(&self) -> Vec<String> {
        self.0
            .pointer("/metadata/finalizers")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_deleting(&self) -> bool {
        self.pointer("/metadata/deletionTimestamp")
            .is_some_and(|v| !v.is_null())
    }

    pub fn resource_version(&self) -> Option<u64> {
        self.str_at("/metadata/resourceVersion")
            .and_then(|v| v.parse().ok())
    }

    pub fn generation(&self) -> i64 {
        self.pointer("/metadata/generation")
            .and_then(Value::as_i64)
            .unwrap_or(0)
    }

    pub fn status(&self) -> Option<&Value> {
        self.0.get("status")
    }

    pub fn metadata_mut(&mut self) -> &mut Map<String, Value> {
        let obj = match self.0.as_object_mut() {
            Some(obj) => obj,
            None => unreachable!("Manifest always wraps an object"),
        };
        let meta = obj
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if !meta.is_object() {
            *meta = Value::Object(Map::new());
        }
        match meta.as_object_mut() {
            Some(m) => m,
            None => unreachable!("metadata was just made an object"),
        }
    }
}

impl fmt::Display for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment() -> Manifest {
        Manifest::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web"},
            "spec": {"replicas": 2}
        }))
        .unwrap()
    }

    #[test]
    fn test_from_value_requires_identity() {
        assert!(Manifest::from_value(json!({"kind": "Pod"})).is_err());
        assert!(Manifest::from_value(json!([1, 2])).is_err());
        assert!(Manifest::from_value(
            json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": ""}})
        )
        .is_err());
    }

    #[test]
    fn test_key_and_group() {
        let m = deployment();
        assert_eq!(m.group(), "apps");
        assert_eq!(m.key(), ResourceKey::new("apps", "Deployment", "", "web"));
        assert_eq!(api_group("v1"), "");
    }

    #[test]
    fn test_default_namespace() {
        let mut m = deployment();
        m.default_namespace("shop");
        assert_eq!(m.namespace(), Some("shop"));

        let mut ns = Manifest::from_value(json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {"name": "shop", "namespace": "oops"}
        }))
        .unwrap();
        ns.default_namespace("shop");
        assert_eq!(ns.namespace(), None);
    }

    #[test]
    fn test_annotations_set_and_remove() {
        let mut m = deployment();
        assert_eq!(m.annotation("keel.io/sync-wave"), None);
        m.set_annotation("keel.io/sync-wave", "3");
        assert_eq!(m.annotation("keel.io/sync-wave"), Some("3"));
        assert_eq!(m.remove_annotation("keel.io/sync-wave"), Some("3".into()));
        assert!(m.pointer("/metadata/annotations").is_none());
    }

    #[test]
    fn test_key_display() {
        let key = ResourceKey::new("", "ConfigMap", "shop", "settings");
        assert_eq!(key.to_string(), "core/ConfigMap/shop/settings");
        let ns = ResourceKey::namespace_key("shop");
        assert_eq!(ns.to_string(), "core/Namespace/shop");
        assert!(ns.is_namespace());
    }
}
