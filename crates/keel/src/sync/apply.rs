//! Writing desired manifests to the cluster.

use crate::diff::{ignore_paths_for, pointer, ResourceDiff};
use crate::error::{ClusterError, SyncError};
use crate::resource::annotations::{BOOKKEEPING, LAST_APPLIED, TRACKING_ID};
use crate::resource::{Application, Manifest, ResourceKey, ResourceSyncOptions};
use crate::retry::retry_with_backoff;

use super::Syncer;

/// Builds the manifest that is written for `desired`.
///
/// The tracking id and last-applied annotations are set. With
/// `respect_ignore` the live values of ignored paths are carried over so
/// an apply never resets fields the Application ignores.
pub fn prepare_manifest(
    app: &Application,
    desired: &Manifest,
    live: Option<&Manifest>,
    respect_ignore: bool,
) -> Manifest {
    let key = desired.key();
    let mut manifest = desired.clone();
    for annotation in BOOKKEEPING {
        manifest.remove_annotation(annotation);
    }
    let last_applied = serde_json::to_string(manifest.as_value()).unwrap_or_default();

    if respect_ignore {
        if let Some(live) = live {
            for path in ignore_paths_for(app, &key, desired) {
                match live.pointer(&path) {
                    Some(value) => pointer::set(manifest.as_value_mut(), &path, value.clone()),
                    None => {
                        pointer::remove(manifest.as_value_mut(), &path);
                    }
                }
            }
        }
    }

    manifest.set_annotation(TRACKING_ID, app.tracking_id().annotation_value(&key));
    manifest.set_annotation(LAST_APPLIED, last_applied);
    manifest
}

impl Syncer<'_> {
    /// Creates or updates one resource of a wave. Returns the
    /// resourceVersion of the write.
    pub(super) async fn apply_resource(&self, diff: &ResourceDiff) -> Result<u64, SyncError> {
        let Some(desired) = diff.desired.as_ref() else {
            return Err(SyncError::Cluster(ClusterError::Rejected {
                key: diff.key.clone(),
                message: "no desired manifest to apply".into(),
            }));
        };
        let manifest = prepare_manifest(
            self.app,
            desired,
            diff.live.as_ref(),
            self.options.respect_ignore_differences,
        );

        if self.options.create_namespace && !diff.key.is_cluster_scoped() {
            self.ensure_namespace(&diff.key.namespace).await?;
        }

        let replace = self.options.replace || ResourceSyncOptions::from_manifest(desired).replace;
        if replace && diff.live.is_some() {
            log::info!("Replacing {}", diff.key);
            self.delete_and_wait(&diff.key).await?;
        }

        let version = self.write(&manifest).await?;
        log::debug!("Applied {} at resourceVersion {}", diff.key, version);
        Ok(version)
    }

    /// Applies `manifest` under the write retry policy.
    pub(super) async fn write(&self, manifest: &Manifest) -> Result<u64, SyncError> {
        let key = manifest.key();
        let api = self.api;
        let attempted = retry_with_backoff(
            &self.write_retry,
            &format!("apply {}", key),
            &self.write_cancel,
            ClusterError::is_retryable,
            move || api.apply(manifest),
        )
        .await;
        match attempted.result {
            Ok(live) => {
                let version = live.resource_version().unwrap_or(0);
                self.note_version(version);
                Ok(version)
            }
            Err(source) => Err(SyncError::Apply {
                key,
                attempts: attempted.attempts,
                source,
            }),
        }
    }

    /// Requests deletion under the write retry policy. An object that is
    /// already gone counts as deleted.
    pub(super) async fn delete(&self, key: &ResourceKey) -> Result<(), SyncError> {
        let api = self.api;
        let attempted = retry_with_backoff(
            &self.write_retry,
            &format!("delete {}", key),
            &self.write_cancel,
            ClusterError::is_retryable,
            move || api.delete(key),
        )
        .await;
        match attempted.result {
            Ok(version) => {
                self.note_version(version);
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(source) => Err(SyncError::Apply {
                key: key.clone(),
                attempts: attempted.attempts,
                source,
            }),
        }
    }

    /// Deletes `key` and waits until the cache no longer holds it.
    pub(super) async fn delete_and_wait(&self, key: &ResourceKey) -> Result<(), SyncError> {
        self.delete(key).await?;
        let gone = self
            .poll_until(self.settings.wave_timeout, || {
                self.cache.get(key).is_none().then_some(())
            })
            .await?;
        match gone {
            Some(()) => Ok(()),
            None => Err(SyncError::Cluster(ClusterError::Timeout(format!(
                "{} was not removed in time",
                key
            )))),
        }
    }

    /// Creates `namespace` with `CreateNamespace=true` when it is missing.
    /// The namespace is not tracked, so it is never pruned.
    async fn ensure_namespace(&self, namespace: &str) -> Result<(), SyncError> {
        let key = ResourceKey::namespace_key(namespace);
        if self.cache.get(&key).is_some() || self.api.get(&key).await?.is_some() {
            return Ok(());
        }
        log::info!("Creating namespace {} for {}", namespace, self.app.key());
        let version = self.write(&Manifest::namespace_object(namespace)).await?;
        self.cache
            .wait_for_version(version, self.settings.wave_timeout)
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::annotations::IGNORE_DIFF;
    use crate::resource::{
        ApplicationDestination, ApplicationSource, ApplicationSpec, ResourceKind, TrackingId,
    };
    use serde_json::{json, Value};

    fn app() -> Application {
        let mut app = Application::new(
            ResourceKind::Application,
            "shop",
            ApplicationSpec {
                project: "default".into(),
                source: ApplicationSource::new("https://git.example.com/shop.git", "deploy"),
                destination: ApplicationDestination::in_cluster("shop"),
                sync_policy: None,
                ignore_differences: Vec::new(),
            },
        );
        app.metadata.namespace = Some("keel".into());
        app
    }

    fn deployment(replicas: i64) -> Manifest {
        Manifest::from_value(json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "shop", "annotations": {IGNORE_DIFF: "/spec/replicas"}},
            "spec": {"replicas": replicas, "template": {"spec": {"containers": [{"name": "web", "image": "web:1"}]}}}
        }))
        .unwrap()
    }

    #[test]
    fn test_tracking_and_last_applied_written() {
        let app = app();
        let desired = deployment(1);
        let prepared = prepare_manifest(&app, &desired, None, false);
        assert_eq!(TrackingId::of(&prepared), Some(app.tracking_id()));

        let last: Value = serde_json::from_str(prepared.annotation(LAST_APPLIED).unwrap()).unwrap();
        assert_eq!(last["spec"]["replicas"], 1);
        assert!(last["metadata"]["annotations"].get(TRACKING_ID).is_none());
    }

    #[test]
    fn test_respect_ignore_differences_keeps_live_values() {
        let app = app();
        let desired = deployment(1);
        let live = deployment(5);
        let kept = prepare_manifest(&app, &desired, Some(&live), true);
        assert_eq!(kept.pointer("/spec/replicas"), Some(&json!(5)));

        let reset = prepare_manifest(&app, &desired, Some(&live), false);
        assert_eq!(reset.pointer("/spec/replicas"), Some(&json!(1)));
    }

    #[test]
    fn test_stale_bookkeeping_is_replaced() {
        let app = app();
        let mut desired = deployment(1);
        desired.set_annotation(TRACKING_ID, "other_app:apps/Deployment:shop/web");
        let prepared = prepare_manifest(&app, &desired, None, false);
        assert_eq!(TrackingId::of(&prepared), Some(app.tracking_id()));
    }

    #[tokio::test]
    async fn test_cancel_does_not_abandon_a_started_write() {
        use crate::cache::LiveStateCache;
        use crate::cluster::MemoryCluster;
        use crate::config::ControllerSettings;
        use crate::events::{CancelToken, OperationProgress};
        use crate::health::{HealthRegistry, HealthTracker};
        use crate::retry::RetryPolicy;
        use std::sync::Arc;
        use std::time::Duration;

        let app = app();
        let cluster = MemoryCluster::new();
        cluster
            .insert(&Manifest::namespace_object("shop"))
            .unwrap();
        let desired = deployment(1);
        cluster.fail_next(
            Some(desired.key()),
            ClusterError::Unavailable("connection reset".into()),
            2,
        );

        let cache = LiveStateCache::new();
        let registry = HealthRegistry::with_builtins();
        let tracker = HealthTracker::new();
        let settings = ControllerSettings::default();
        let (tx, _rx) = tokio::sync::broadcast::channel(16);
        let cancel = CancelToken::new();
        cancel.cancel("new revision");
        let progress = OperationProgress::new("keel/shop", "abc", Arc::new(tx), cancel);
        let syncer = Syncer::new(&app, &cluster, &cache, &registry, &tracker, &settings, &progress)
            .with_write_retry(RetryPolicy {
                limit: 3,
                initial_delay: Duration::from_millis(5),
                factor: 1.0,
                max_delay: Duration::from_millis(5),
            });

        let manifest = prepare_manifest(&app, &desired, None, false);
        assert!(syncer.write(&manifest).await.is_ok());
        assert!(cluster.contains(&desired.key()));
    }
}
