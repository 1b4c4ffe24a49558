//! Sync operations.
//!
//! One operation drives a single revision through PreSync hooks, the waves
//! in ascending order (each gated on the health of its resources), PostSync
//! hooks and finally the pruner. A failure runs the SyncFail hooks. A wave
//! that does not become healthy in time holds the operation in `Running`
//! so the next cycle resumes it.

pub mod apply;
pub mod hooks;
pub mod plan;
pub mod prune;
pub mod waves;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::cache::LiveStateCache;
use crate::cluster::ClusterApi;
use crate::config::ControllerSettings;
use crate::diff::{DiffAction, DiffResult};
use crate::error::SyncError;
use crate::events::{CancelToken, OperationProgress, SyncEventPhase};
use crate::health::{HealthRegistry, HealthTracker};
use crate::resource::{
    Application, ApplicationStatus, AutomatedSync, HookRecord, InitiatedBy, Manifest,
    OperationPhase, ResourceKey, ResourceResult, SyncOptions,
};
use crate::retry::RetryPolicy;

pub use apply::prepare_manifest;
pub use plan::{build_plan, HookTask, SyncPlan, Wave, WaveMember};

/// What a sync operation is asked to do.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRequest {
    pub revision: String,
    pub initiated_by: InitiatedBy,
    /// Delete prune candidates instead of only reporting them.
    pub prune: bool,
    pub allow_empty: bool,
    /// Run hooks that already succeeded for this revision again.
    pub rerun_hooks: bool,
}

impl SyncRequest {
    pub fn automated(revision: impl Into<String>, policy: AutomatedSync) -> Self {
        Self {
            revision: revision.into(),
            initiated_by: InitiatedBy::Automated,
            prune: policy.prune,
            allow_empty: policy.allow_empty,
            rerun_hooks: false,
        }
    }

    /// A user-requested sync. Manual syncs rerun hooks and may prune an
    /// Application down to nothing.
    pub fn manual(revision: impl Into<String>, prune: bool) -> Self {
        Self {
            revision: revision.into(),
            initiated_by: InitiatedBy::Manual,
            prune,
            allow_empty: true,
            rerun_hooks: true,
        }
    }
}

/// Result of one sync operation.
#[derive(Debug)]
pub struct SyncOutcome {
    pub phase: OperationPhase,
    pub message: String,
    pub results: Vec<ResourceResult>,
    pub hooks: Vec<HookRecord>,
    pub error: Option<SyncError>,
    /// Protected prune candidates left in place.
    pub prune_skipped: Vec<ResourceKey>,
    /// Highest resourceVersion produced by this operation's writes.
    pub last_version: u64,
}

impl Default for SyncOutcome {
    fn default() -> Self {
        Self {
            phase: OperationPhase::Running,
            message: String::new(),
            results: Vec::new(),
            hooks: Vec::new(),
            error: None,
            prune_skipped: Vec::new(),
            last_version: 0,
        }
    }
}

impl SyncOutcome {
    /// A wave timed out; later waves have not started.
    pub fn is_held(&self) -> bool {
        matches!(self.error, Some(SyncError::HealthTimeout { .. }))
    }

    pub fn succeeded(&self) -> bool {
        self.phase == OperationPhase::Succeeded
    }

    /// Records a per-resource result, replacing an earlier one for the
    /// same resource and hook phase.
    pub(crate) fn record(&mut self, result: ResourceResult) {
        self.results
            .retain(|r| !(r.key == result.key && r.hook_phase == result.hook_phase));
        self.results.push(result);
    }
}

/// True if an automated sync has anything to do for `diff`.
///
/// Prune candidates count only when pruning is enabled and the object is
/// not already being deleted.
pub fn needs_sync(diff: &DiffResult, prune: bool) -> bool {
    diff.items.iter().any(|d| match d.action {
        DiffAction::Create | DiffAction::Update => true,
        DiffAction::Prune => prune && !d.live.as_ref().is_some_and(Manifest::is_deleting),
        DiffAction::Unchanged | DiffAction::PruneProtected => false,
    })
}

/// Executes sync operations for one Application.
pub struct Syncer<'a> {
    app: &'a Application,
    api: &'a dyn ClusterApi,
    cache: &'a LiveStateCache,
    health: &'a HealthRegistry,
    tracker: &'a HealthTracker,
    settings: &'a ControllerSettings,
    progress: &'a OperationProgress,
    options: SyncOptions,
    write_retry: RetryPolicy,
    /// Never cancelled: a started write runs its retries to completion.
    write_cancel: CancelToken,
    written: AtomicU64,
}

impl<'a> Syncer<'a> {
    pub fn new(
        app: &'a Application,
        api: &'a dyn ClusterApi,
        cache: &'a LiveStateCache,
        health: &'a HealthRegistry,
        tracker: &'a HealthTracker,
        settings: &'a ControllerSettings,
        progress: &'a OperationProgress,
    ) -> Self {
        let write_retry = settings.retry_policy_for(app.sync_policy().retry.as_ref());
        Self {
            app,
            api,
            cache,
            health,
            tracker,
            settings,
            progress,
            options: app.sync_options(),
            write_retry,
            write_cancel: CancelToken::new(),
            written: AtomicU64::new(0),
        }
    }

    /// Overrides the retry policy wrapped around each cluster write.
    pub fn with_write_retry(mut self, policy: RetryPolicy) -> Self {
        self.write_retry = policy;
        self
    }

    /// Runs `plan` to completion, to a held wave, or to a failure.
    ///
    /// `previous` is the Application's status before the operation; it
    /// tells which hooks already succeeded for the revision.
    pub async fn run(
        &self,
        plan: &SyncPlan,
        request: &SyncRequest,
        previous: &ApplicationStatus,
    ) -> SyncOutcome {
        let mut outcome = SyncOutcome::default();
        self.progress.phase(
            SyncEventPhase::Starting,
            format!(
                "Syncing {} to {} ({} resource(s) to apply, {} to prune)",
                self.app.key(),
                short_revision(&request.revision),
                plan.apply_count(),
                plan.prune.len()
            ),
        );

        let result = self.execute(plan, request, previous, &mut outcome).await;
        outcome.last_version = self.written.load(Ordering::SeqCst);

        match result {
            Ok(()) => {
                outcome.phase = OperationPhase::Succeeded;
                outcome.message = format!(
                    "Successfully synced {} to {}",
                    self.app.key(),
                    short_revision(&request.revision)
                );
                log::info!("{}", outcome.message);
                self.progress.completed(&outcome.message);
            }
            Err(e @ SyncError::HealthTimeout { .. }) => {
                outcome.phase = OperationPhase::Running;
                outcome.message = e.to_string();
                log::warn!("Sync of {} held: {}", self.app.key(), e);
                outcome.error = Some(e);
            }
            Err(e @ SyncError::Cancelled { .. }) => {
                outcome.phase = OperationPhase::Terminated;
                outcome.message = e.to_string();
                log::info!("Sync of {} cancelled: {}", self.app.key(), e);
                self.progress.phase(SyncEventPhase::Cancelled, &outcome.message);
                outcome.error = Some(e);
            }
            Err(e) => {
                outcome.phase = match e {
                    SyncError::Unavailable(_) | SyncError::Cluster(_) => OperationPhase::Error,
                    _ => OperationPhase::SyncFailed,
                };
                outcome.message = e.to_string();
                log::error!("Sync of {} failed: {}", self.app.key(), e);
                if !plan.sync_fail.is_empty() {
                    self.run_sync_fail(&plan.sync_fail, request, &mut outcome).await;
                    outcome.last_version = self.written.load(Ordering::SeqCst);
                }
                self.progress.failed(&outcome.message);
                outcome.error = Some(e);
            }
        }
        outcome
    }

    async fn execute(
        &self,
        plan: &SyncPlan,
        request: &SyncRequest,
        previous: &ApplicationStatus,
        outcome: &mut SyncOutcome,
    ) -> Result<(), SyncError> {
        self.check_cancelled()?;
        if !plan.pre_sync.is_empty() {
            self.progress.phase(
                SyncEventPhase::PreSync,
                format!("Running {} PreSync hook(s)", plan.pre_sync.len()),
            );
            self.run_hooks(&plan.pre_sync, request, previous, outcome)
                .await?;
        }

        for wave in &plan.waves {
            self.check_cancelled()?;
            self.run_wave(wave, request, previous, outcome).await?;
        }

        self.check_cancelled()?;
        if !plan.post_sync.is_empty() {
            self.progress.phase(
                SyncEventPhase::PostSync,
                format!("Running {} PostSync hook(s)", plan.post_sync.len()),
            );
            self.run_hooks(&plan.post_sync, request, previous, outcome)
                .await?;
        }

        self.prune(plan, request, outcome).await
    }

    fn check_cancelled(&self) -> Result<(), SyncError> {
        if self.progress.is_cancelled() {
            Err(SyncError::cancelled(self.progress.cancel_token().reason()))
        } else {
            Ok(())
        }
    }

    fn note_version(&self, version: u64) {
        self.written.fetch_max(version, Ordering::SeqCst);
    }

    /// Polls `done` against the cache until it yields a result, `timeout`
    /// elapses, or the operation is cancelled.
    async fn poll_until<T>(
        &self,
        timeout: Duration,
        mut done: impl FnMut() -> Option<T>,
    ) -> Result<Option<T>, SyncError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(value) = done() {
                return Ok(Some(value));
            }
            self.check_cancelled()?;
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = self.settings.health_poll_interval.min(deadline - now);
            tokio::select! {
                _ = self.cache.wait_for_change(wait) => {}
                _ = self.progress.cancel_token().cancelled() => {}
            }
        }
    }
}

pub(crate) fn short_revision(revision: &str) -> &str {
    revision.get(..12).unwrap_or(revision)
}
