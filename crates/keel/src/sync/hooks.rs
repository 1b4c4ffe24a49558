//! Hook execution.
//!
//! Hooks of one phase run grouped by their wave, concurrently within a
//! wave. A hook is done when its health turns Healthy and has failed when
//! it turns Degraded; a Job therefore succeeds on `Complete` and fails on
//! `Failed`.

use futures_util::future::join_all;

use super::plan::{hooks_by_wave, HookTask};
use super::{prepare_manifest, SyncOutcome, SyncRequest, Syncer};
use crate::config::format_duration;
use crate::error::SyncError;
use crate::events::SyncEventPhase;
use crate::health::HealthStatus;
use crate::resource::{
    ApplicationStatus, HookDeletePolicy, HookRecord, ResourceResult, ResourceResultCode,
};

impl Syncer<'_> {
    /// Runs one phase's hooks. Stops after the first wave with a failure.
    pub(super) async fn run_hooks(
        &self,
        hooks: &[HookTask],
        request: &SyncRequest,
        previous: &ApplicationStatus,
        outcome: &mut SyncOutcome,
    ) -> Result<(), SyncError> {
        for group in hooks_by_wave(hooks) {
            self.check_cancelled()?;
            let runnable: Vec<&HookTask> = group
                .iter()
                .filter(|hook| {
                    let done = previous.hook_succeeded(&request.revision, &hook.key, hook.phase);
                    let skip = done && !request.rerun_hooks && !hook.rerun;
                    if skip {
                        log::debug!(
                            "{} hook {} already succeeded for this revision",
                            hook.phase,
                            hook.key
                        );
                    }
                    !skip
                })
                .collect();
            if runnable.is_empty() {
                continue;
            }

            let results = join_all(runnable.iter().map(|hook| self.run_hook(hook))).await;
            let mut failure = None;
            for (hook, result) in runnable.iter().zip(results) {
                self.record_hook(hook, &request.revision, &result, outcome);
                if let Err(e) = result {
                    failure.get_or_insert(e);
                }
            }
            if let Some(e) = failure {
                return Err(e);
            }
        }
        Ok(())
    }

    /// Runs SyncFail hooks after a failed operation. Their own failures are
    /// recorded but do not change the operation's outcome.
    pub(super) async fn run_sync_fail(
        &self,
        hooks: &[HookTask],
        request: &SyncRequest,
        outcome: &mut SyncOutcome,
    ) {
        self.progress.phase(
            SyncEventPhase::SyncFail,
            format!("Running {} SyncFail hook(s)", hooks.len()),
        );
        for group in hooks_by_wave(hooks) {
            let results = join_all(group.iter().map(|hook| self.run_hook(hook))).await;
            for (hook, result) in group.iter().zip(results) {
                if let Err(e) = &result {
                    log::warn!("SyncFail hook {} failed: {}", hook.key, e);
                }
                self.record_hook(hook, &request.revision, &result, outcome);
            }
        }
    }

    fn record_hook(
        &self,
        hook: &HookTask,
        revision: &str,
        result: &Result<(), SyncError>,
        outcome: &mut SyncOutcome,
    ) {
        let (status, message) = match result {
            Ok(()) => (ResourceResultCode::Synced, "hook succeeded".to_string()),
            Err(e) => (ResourceResultCode::SyncFailed, e.to_string()),
        };
        outcome.hooks.retain(|h| !(h.key == hook.key && h.phase == hook.phase));
        outcome.hooks.push(HookRecord {
            revision: revision.to_string(),
            key: hook.key.clone(),
            phase: hook.phase,
            succeeded: result.is_ok(),
        });
        outcome.record(ResourceResult {
            key: hook.key.clone(),
            status,
            message,
            hook_phase: Some(hook.phase),
            wave: hook.wave,
        });
    }

    async fn run_hook(&self, hook: &HookTask) -> Result<(), SyncError> {
        let failure = |message: String| SyncError::HookFailure {
            hook: hook.key.clone(),
            phase: hook.phase,
            message,
        };

        if self.cache.get(&hook.key).is_some() && hook.deletes_on(HookDeletePolicy::BeforeHookCreation) {
            log::debug!("Deleting previous {} before re-creating it", hook.key);
            self.delete_and_wait(&hook.key)
                .await
                .map_err(|e| failure(e.to_string()))?;
        }

        log::info!("Running {} hook {}", hook.phase, hook.key);
        self.progress.resource(
            SyncEventPhase::from(hook.phase),
            &hook.key,
            format!("Running {} hook", hook.phase),
        );
        let manifest = prepare_manifest(self.app, &hook.manifest, None, false);
        let version = self
            .write(&manifest)
            .await
            .map_err(|e| failure(e.to_string()))?;
        self.cache
            .wait_for_version(version, self.settings.hook_timeout)
            .await;

        let finished = self
            .poll_until(self.settings.hook_timeout, || {
                let assessment = self.health.evaluate(self.cache.get(&hook.key).as_ref());
                self.tracker.observe(&hook.key, &assessment);
                match assessment.status {
                    HealthStatus::Healthy => Some(Ok(())),
                    HealthStatus::Degraded => Some(Err(assessment
                        .message
                        .unwrap_or_else(|| "hook reported failure".to_string()))),
                    _ => None,
                }
            })
            .await?;

        let result = match finished {
            Some(Ok(())) => Ok(()),
            Some(Err(message)) => Err(failure(message)),
            None => Err(failure(format!(
                "did not complete within {}",
                format_duration(self.settings.hook_timeout)
            ))),
        };

        let policy = match result {
            Ok(()) => HookDeletePolicy::HookSucceeded,
            Err(_) => HookDeletePolicy::HookFailed,
        };
        if hook.deletes_on(policy) {
            if let Err(e) = self.delete(&hook.key).await {
                log::warn!("Failed to delete hook {}: {}", hook.key, e);
            }
        }
        result
    }
}
