//! Normalization of manifests before comparison.

use serde_json::Value;

use super::pointer;
use crate::resource::annotations::BOOKKEEPING;
use crate::resource::Manifest;

/// Metadata written by the API server.
const SERVER_METADATA: &[&str] = &[
    "uid",
    "resourceVersion",
    "generation",
    "creationTimestamp",
    "deletionTimestamp",
    "deletionGracePeriodSeconds",
    "managedFields",
    "selfLink",
    "generateName",
    "ownerReferences",
];

/// Returns the comparable form of a manifest: server-managed metadata,
/// status, controller bookkeeping annotations and ignored paths removed.
pub fn normalize(manifest: &Manifest, ignore: &[String]) -> Value {
    let mut value = manifest.as_value().clone();
    if let Some(obj) = value.as_object_mut() {
        obj.remove("status");
        if let Some(meta) = obj.get_mut("metadata").and_then(Value::as_object_mut) {
            for field in SERVER_METADATA {
                meta.remove(*field);
            }
            for key in ["annotations", "labels"] {
                let empty = match meta.get_mut(key).and_then(Value::as_object_mut) {
                    Some(map) => {
                        if key == "annotations" {
                            for a in BOOKKEEPING {
                                map.remove(*a);
                            }
                        }
                        map.is_empty()
                    }
                    None => meta.get(key).is_some_and(Value::is_null),
                };
                if empty {
                    meta.remove(key);
                }
            }
        }
    }
    for path in ignore {
        pointer::remove(&mut value, path);
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strips_server_fields_and_status() {
        let live = Manifest::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "a",
                "namespace": "shop",
                "uid": "123",
                "resourceVersion": "9",
                "managedFields": [],
                "annotations": {"keel.io/tracking-id": "x", "keel.io/last-applied": "{}"}
            },
            "data": {"k": "v"},
            "status": {"phase": "Ready"}
        }))
        .unwrap();
        assert_eq!(
            normalize(&live, &[]),
            json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": "a", "namespace": "shop"},
                "data": {"k": "v"}
            })
        );
    }

    #[test]
    fn test_ignored_paths_removed() {
        let m = Manifest::from_value(json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": {"name": "web", "labels": {"app": "web"}},
            "spec": {"replicas": 5, "paused": false}
        }))
        .unwrap();
        let normalized = normalize(&m, &["/spec/replicas".to_string()]);
        assert_eq!(normalized.pointer("/spec/replicas"), None);
        assert_eq!(normalized.pointer("/spec/paused"), Some(&json!(false)));
        assert_eq!(normalized.pointer("/metadata/labels/app"), Some(&json!("web")));
    }
}
