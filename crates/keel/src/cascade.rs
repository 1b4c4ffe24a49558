//! Cascade deletion of Applications.
//!
//! An Application marked for deletion that carries
//! [`RESOURCES_FINALIZER`] is torn down in the foreground: child
//! Applications first (each runs its own cascade), then the remaining
//! resources in prune order. Resources marked `Delete=false` are orphaned
//! by stripping their tracking id. The finalizer is removed last, which
//! lets the API server drop the Application object.
//!
//! One call makes as much progress as it can within `deletion_timeout`;
//! the next reconcile cycle resumes where it stopped.

use serde_json::json;
use std::time::Duration;

use crate::cache::LiveStateCache;
use crate::cluster::ClusterApi;
use crate::config::ControllerSettings;
use crate::error::SyncError;
use crate::events::CancelToken;
use crate::resource::annotations::{self, LAST_APPLIED, TRACKING_ID};
use crate::resource::{Application, Manifest, ResourceKey, ResourceSyncOptions, RESOURCES_FINALIZER};
use crate::sync::plan::deletion_rank;

/// Where a cascade stands after one call.
#[derive(Debug, Clone, PartialEq)]
pub enum CascadeOutcome {
    /// The finalizer was removed.
    Finalized { deleted: usize, orphaned: usize },
    /// Owned resources still exist when the deletion timeout elapsed.
    Waiting { remaining: Vec<ResourceKey> },
    /// No resources finalizer: owned resources are left in place.
    Orphaned,
}

pub struct CascadeDeleter<'a> {
    app: &'a Application,
    api: &'a dyn ClusterApi,
    cache: &'a LiveStateCache,
    settings: &'a ControllerSettings,
    cancel: &'a CancelToken,
}

impl<'a> CascadeDeleter<'a> {
    pub fn new(
        app: &'a Application,
        api: &'a dyn ClusterApi,
        cache: &'a LiveStateCache,
        settings: &'a ControllerSettings,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            app,
            api,
            cache,
            settings,
            cancel,
        }
    }

    pub async fn run(&self) -> Result<CascadeOutcome, SyncError> {
        if !self.app.has_resources_finalizer() {
            log::info!(
                "{} has no {} finalizer; leaving its resources in place",
                self.app.key(),
                RESOURCES_FINALIZER
            );
            return Ok(CascadeOutcome::Orphaned);
        }
        let owner = self.app.tracking_id();
        let deadline = tokio::time::Instant::now() + self.settings.deletion_timeout;

        let orphaned = self.orphan_retained().await?;

        let children: Vec<Manifest> = self
            .cache
            .owned_by(&owner)
            .into_values()
            .filter(|m| m.key().is_application())
            .collect();
        let mut deleted = 0;
        for child in &children {
            if self.delete_child(child).await? {
                deleted += 1;
            }
        }
        if !children.is_empty() {
            let remaining = self
                .wait_until(deadline, || {
                    let left: Vec<ResourceKey> = self
                        .cache
                        .owned_by(&owner)
                        .into_keys()
                        .filter(ResourceKey::is_application)
                        .collect();
                    left
                })
                .await?;
            if !remaining.is_empty() {
                log::info!(
                    "Waiting for {} child Application(s) of {} to be deleted",
                    remaining.len(),
                    self.app.key()
                );
                return Ok(CascadeOutcome::Waiting { remaining });
            }
        }

        let mut rest: Vec<Manifest> = self.cache.owned_by(&owner).into_values().collect();
        rest.sort_by_key(|m| deletion_rank(&m.key(), annotations::sync_wave(m)));
        for manifest in rest.iter().filter(|m| !m.is_deleting()) {
            self.cancel_point()?;
            let key = manifest.key();
            match self.api.delete(&key).await {
                Ok(_) => {
                    log::info!("Deleted {} of {}", key, self.app.key());
                    deleted += 1;
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }

        let remaining = self
            .wait_until(deadline, || self.cache.owned_by(&owner).into_keys().collect())
            .await?;
        if !remaining.is_empty() {
            return Ok(CascadeOutcome::Waiting { remaining });
        }

        self.api
            .remove_finalizer(&self.app.key(), RESOURCES_FINALIZER)
            .await?;
        log::info!(
            "Cascade deletion of {} finished ({} deleted, {} orphaned)",
            self.app.key(),
            deleted,
            orphaned
        );
        Ok(CascadeOutcome::Finalized { deleted, orphaned })
    }

    /// Strips the tracking id from resources that opt out of deletion.
    async fn orphan_retained(&self) -> Result<usize, SyncError> {
        let mut versions = 0;
        let mut count = 0;
        for manifest in self.cache.owned_by(&self.app.tracking_id()).into_values() {
            if manifest.is_deleting() || !ResourceSyncOptions::from_manifest(&manifest).delete_disabled {
                continue;
            }
            let mut released = manifest.clone();
            released.remove_annotation(TRACKING_ID);
            released.remove_annotation(LAST_APPLIED);
            let live = self.api.apply(&released).await?;
            versions = versions.max(live.resource_version().unwrap_or(0));
            log::info!("Orphaned {} (Delete=false)", manifest.key());
            count += 1;
        }
        if versions > 0 {
            self.cache
                .wait_for_version(versions, self.settings.deletion_timeout)
                .await;
        }
        Ok(count)
    }

    /// Requests deletion of a child Application, adding the finalizer first
    /// so the child cascades too. Returns false if it was already deleting.
    async fn delete_child(&self, child: &Manifest) -> Result<bool, SyncError> {
        if child.is_deleting() {
            return Ok(false);
        }
        let key = child.key();
        let mut finalizers = child.finalizers();
        if !finalizers.iter().any(|f| f == RESOURCES_FINALIZER) {
            finalizers.push(RESOURCES_FINALIZER.to_string());
            let mut marked = child.clone();
            marked
                .metadata_mut()
                .insert("finalizers".into(), json!(finalizers));
            self.api.apply(&marked).await?;
        }
        match self.api.delete(&key).await {
            Ok(_) => {
                log::info!("Deleting child Application {} of {}", key, self.app.key());
                Ok(true)
            }
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Waits until `remaining` yields nothing or `deadline` passes; returns
    /// what is left.
    async fn wait_until(
        &self,
        deadline: tokio::time::Instant,
        remaining: impl Fn() -> Vec<ResourceKey>,
    ) -> Result<Vec<ResourceKey>, SyncError> {
        loop {
            let left = remaining();
            let now = tokio::time::Instant::now();
            if left.is_empty() || now >= deadline {
                return Ok(left);
            }
            self.cancel_point()?;
            let wait = self
                .settings
                .health_poll_interval
                .min(deadline - now)
                .max(Duration::from_millis(1));
            tokio::select! {
                _ = self.cache.wait_for_change(wait) => {}
                _ = self.cancel.cancelled() => {}
            }
        }
    }

    fn cancel_point(&self) -> Result<(), SyncError> {
        if self.cancel.is_cancelled() {
            Err(SyncError::cancelled(self.cancel.reason()))
        } else {
            Ok(())
        }
    }
}
