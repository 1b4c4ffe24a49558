//! One reconciliation cycle of one Application.
//!
//! render → gate → diff → (sync) → re-diff → status. A cycle never writes
//! to the live state cache; it reads the cache and waits for its own
//! writes to show up there. RBAC and render failures end the cycle before
//! any mutation and only touch the Application's status.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::Instrument;

use crate::cache::LiveStateCache;
use crate::cascade::{CascadeDeleter, CascadeOutcome};
use crate::cluster::ClusterApi;
use crate::config::ControllerSettings;
use crate::diff::{self, DiffResult};
use crate::error::{KeelError, Result, SyncError};
use crate::events::{CancelToken, EventBroadcaster};
use crate::health::{HealthRegistry, HealthTracker};
use crate::rbac;
use crate::resource::{
    Application, ApplicationStatus, InitiatedBy, Manifest, OperationPhase, OperationState,
    Project, ResourceKey, ResourceResultCode,
};
use crate::source::{prepare_desired, RenderContext, RenderError, Renderer};
use crate::status::{needs_write, StatusBuilder};
use crate::sync::{build_plan, needs_sync, short_revision, SyncOutcome, SyncRequest, Syncer};

/// What the caller asks a cycle to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncIntent {
    /// Follow the Application's sync policy.
    Auto,
    /// Sync now regardless of policy.
    Manual { prune: bool },
}

/// Handle shared between the controller and one in-flight cycle.
#[derive(Debug, Clone, Default)]
pub struct Cycle {
    cancel: CancelToken,
    revision: Arc<Mutex<Option<String>>>,
}

impl Cycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn cancel(&self, reason: impl Into<String>) {
        self.cancel.cancel(reason);
    }

    /// Revision the cycle is working on, once resolved.
    pub fn revision(&self) -> Option<String> {
        self.revision.lock().ok().and_then(|r| r.clone())
    }

    fn set_revision(&self, revision: &str) {
        if let Ok(mut r) = self.revision.lock() {
            *r = Some(revision.to_string());
        }
    }
}

/// Summary of one cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileOutcome {
    pub revision: Option<String>,
    /// Phase of the sync operation run in this cycle, if any.
    pub operation: Option<OperationPhase>,
    pub status_written: bool,
    /// The Application is gone or was released by its cascade.
    pub deleted: bool,
    /// Ask for another cycle after this delay.
    pub requeue_after: Option<Duration>,
}

/// An automated or manual sync decided for this cycle.
struct Decision {
    request: SyncRequest,
    retry_count: u32,
    started_at: DateTime<Utc>,
}

enum Verdict {
    Sync(Decision),
    Skip { requeue_after: Option<Duration> },
}

pub struct Reconciler {
    api: Arc<dyn ClusterApi>,
    renderer: Arc<dyn Renderer>,
    cache: Arc<LiveStateCache>,
    registry: HealthRegistry,
    tracker: HealthTracker,
    settings: ControllerSettings,
    events: EventBroadcaster,
}

impl Reconciler {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        renderer: Arc<dyn Renderer>,
        cache: Arc<LiveStateCache>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            registry: settings.health_registry(),
            tracker: HealthTracker::new(),
            events: EventBroadcaster::default(),
            api,
            renderer,
            cache,
            settings,
        }
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub fn events(&self) -> &EventBroadcaster {
        &self.events
    }

    pub fn cache(&self) -> &Arc<LiveStateCache> {
        &self.cache
    }

    /// Resolves the revision `app` currently targets.
    pub async fn resolve_revision(&self, app: &Application) -> std::result::Result<String, RenderError> {
        self.renderer.resolve_revision(&app.spec.source).await
    }

    pub async fn reconcile(
        &self,
        key: &ResourceKey,
        intent: SyncIntent,
        cycle: &Cycle,
    ) -> Result<ReconcileOutcome> {
        let Some(manifest) = self.cache.get(key) else {
            log::debug!("{} is gone; nothing to reconcile", key);
            return Ok(ReconcileOutcome {
                deleted: true,
                ..Default::default()
            });
        };
        let app = Application::from_manifest(&manifest).map_err(KeelError::InvalidManifest)?;

        let span = tracing::info_span!("reconcile", app = %key);
        async {
            if app.metadata.is_deleting() {
                self.finalize(&app, cycle).await
            } else {
                self.reconcile_app(&app, intent, cycle).await
            }
        }
        .instrument(span)
        .await
    }

    async fn reconcile_app(
        &self,
        app: &Application,
        intent: SyncIntent,
        cycle: &Cycle,
    ) -> Result<ReconcileOutcome> {
        let previous = app.status_or_default();
        let builder = StatusBuilder::from_previous(&previous).clear_deletion_error();

        if !same_server(&app.spec.destination.server, self.api.server()) {
            let message = format!(
                "destination server '{}' is not managed by this controller ({})",
                app.spec.destination.server,
                self.api.server()
            );
            log::warn!("{}: {}", app.key(), message);
            return self.finish(app, builder.comparison_error(message), None).await;
        }

        let project = self.project(app);
        if let Err(e) = rbac::authorize(app, project.as_ref(), &[]) {
            return self.deny(app, builder, e).await;
        }

        let revision = match self.resolve_revision(app).await {
            Ok(revision) => revision,
            Err(e) => return self.render_failed(app, builder, None, e).await,
        };
        cycle.set_revision(&revision);
        let rendered = match self
            .renderer
            .render(&app.spec.source, &revision, &RenderContext::for_app(app))
            .await
        {
            Ok(rendered) => rendered,
            Err(e) => return self.render_failed(app, builder, Some(&revision), e).await,
        };
        let desired = prepare_desired(app, rendered);

        if let Err(e) = rbac::authorize(app, project.as_ref(), &desired) {
            return self.deny(app, builder, e).await;
        }

        let diff = self.compare(app, &desired);
        log::debug!(
            "{} at {}: {} item(s), synced={}",
            app.key(),
            short_revision(&revision),
            diff.items.len(),
            diff.is_synced()
        );

        let decision = match self.decide(app, &previous, &revision, &diff, intent) {
            Verdict::Sync(decision) => decision,
            Verdict::Skip { requeue_after } => {
                let builder = builder.comparison(&revision, &diff, &self.registry, &self.tracker);
                let mut outcome = self.finish(app, builder, Some(&revision)).await?;
                outcome.requeue_after = requeue_after;
                return Ok(outcome);
            }
        };

        let plan = build_plan(&desired, &diff);
        let progress = self.events.start_operation(
            &app.key().to_string(),
            &revision,
            cycle.cancel_token().clone(),
        );
        let syncer = Syncer::new(
            app,
            self.api.as_ref(),
            &self.cache,
            &self.registry,
            &self.tracker,
            &self.settings,
            &progress,
        );
        let sync = syncer.run(&plan, &decision.request, &previous).await;
        self.forget_pruned(&sync);

        if sync.last_version > 0
            && !self
                .cache
                .wait_for_version(sync.last_version, self.settings.wave_timeout)
                .await
        {
            log::warn!(
                "Cache did not observe resourceVersion {} after syncing {}",
                sync.last_version,
                app.key()
            );
        }
        let after = self.compare(app, &desired);

        let state = OperationState {
            phase: sync.phase,
            message: String::new(),
            revision: revision.clone(),
            initiated_by: decision.request.initiated_by,
            retry_count: decision.retry_count,
            started_at: decision.started_at,
            finished_at: None,
            resources: Vec::new(),
        };
        let requeue_after = self.requeue_after(app, &sync, decision.retry_count);
        let builder = builder
            .comparison(&revision, &after, &self.registry, &self.tracker)
            .operation(state, &sync);
        let mut outcome = self.finish(app, builder, Some(&revision)).await?;
        outcome.operation = Some(sync.phase);
        outcome.requeue_after = requeue_after;
        Ok(outcome)
    }

    /// Cascade path of an Application that is being deleted.
    async fn finalize(&self, app: &Application, cycle: &Cycle) -> Result<ReconcileOutcome> {
        let deleter = CascadeDeleter::new(
            app,
            self.api.as_ref(),
            &self.cache,
            &self.settings,
            cycle.cancel_token(),
        );
        let builder = StatusBuilder::from_previous(&app.status_or_default());
        match deleter.run().await {
            Ok(CascadeOutcome::Finalized { .. }) | Ok(CascadeOutcome::Orphaned) => {
                Ok(ReconcileOutcome {
                    deleted: true,
                    ..Default::default()
                })
            }
            Ok(CascadeOutcome::Waiting { remaining }) => {
                let names: Vec<String> = remaining.iter().take(5).map(|k| k.to_string()).collect();
                let message = format!(
                    "waiting for {} resource(s) to be deleted: {}",
                    remaining.len(),
                    names.join(", ")
                );
                log::info!("{}: {}", app.key(), message);
                let mut outcome = self.finish(app, builder.deletion_error(message), None).await?;
                outcome.requeue_after = Some(self.settings.health_poll_interval);
                Ok(outcome)
            }
            Err(SyncError::Cancelled { reason }) => {
                log::info!("Cascade of {} interrupted: {}", app.key(), reason);
                Ok(ReconcileOutcome::default())
            }
            Err(e) => {
                log::error!("Cascade deletion of {} failed: {}", app.key(), e);
                let mut outcome = self
                    .finish(app, builder.deletion_error(e.to_string()), None)
                    .await?;
                outcome.requeue_after = Some(self.settings.health_poll_interval);
                Ok(outcome)
            }
        }
    }

    fn project(&self, app: &Application) -> Option<Project> {
        let manifest = self.cache.get(&rbac::project_key(app))?;
        match Project::from_manifest(&manifest) {
            Ok(project) => Some(project),
            Err(e) => {
                log::warn!("Ignoring invalid Project: {}", e);
                None
            }
        }
    }

    /// Diffs `desired` against everything the Application owns plus
    /// whatever currently sits at the desired keys.
    fn compare(&self, app: &Application, desired: &[Manifest]) -> DiffResult {
        let mut live: BTreeMap<ResourceKey, Manifest> = self.cache.owned_by(&app.tracking_id());
        for manifest in desired {
            let key = manifest.key();
            if !live.contains_key(&key) {
                if let Some(existing) = self.cache.get(&key) {
                    live.insert(key, existing);
                }
            }
        }
        diff::diff(app, desired, &live)
    }

    fn decide(
        &self,
        app: &Application,
        previous: &ApplicationStatus,
        revision: &str,
        diff: &DiffResult,
        intent: SyncIntent,
    ) -> Verdict {
        let last = previous
            .operation_state
            .as_ref()
            .filter(|op| op.revision == revision);
        let automated = app.automated();

        if let SyncIntent::Manual { prune } = intent {
            log::info!("Manual sync of {} to {}", app.key(), short_revision(revision));
            return Verdict::Sync(Decision {
                request: SyncRequest::manual(revision, prune),
                retry_count: 0,
                started_at: Utc::now(),
            });
        }

        // A held operation resumes where it stopped, whatever the policy.
        if let Some(op) = last.filter(|op| op.phase == OperationPhase::Running) {
            let prune = automated.map(|a| a.prune).unwrap_or(false);
            let mut request = match automated {
                Some(policy) if op.initiated_by == InitiatedBy::Automated => {
                    SyncRequest::automated(revision, policy)
                }
                _ => SyncRequest::manual(revision, prune),
            };
            request.rerun_hooks = false;
            return Verdict::Sync(Decision {
                request,
                retry_count: op.retry_count,
                started_at: op.started_at,
            });
        }

        let Some(policy) = automated else {
            return Verdict::Skip { requeue_after: None };
        };
        if !needs_sync(diff, policy.prune) {
            return Verdict::Skip { requeue_after: None };
        }
        let request = SyncRequest::automated(revision, policy);

        let Some(op) = last else {
            return Verdict::Sync(Decision {
                request,
                retry_count: 0,
                started_at: Utc::now(),
            });
        };

        match op.phase {
            OperationPhase::Succeeded if !policy.self_heal => {
                log::info!(
                    "{} drifted from {}; selfHeal is disabled",
                    app.key(),
                    short_revision(revision)
                );
                Verdict::Skip { requeue_after: None }
            }
            OperationPhase::Succeeded | OperationPhase::Terminated | OperationPhase::Running => {
                log::info!("Self-healing {}", app.key());
                Verdict::Sync(Decision {
                    request,
                    retry_count: 0,
                    started_at: Utc::now(),
                })
            }
            OperationPhase::SyncFailed | OperationPhase::Error => {
                let policy = self.retry_policy(app);
                let exhausted = policy
                    .max_attempts()
                    .is_some_and(|max| op.retry_count.saturating_add(1) >= max);
                if exhausted {
                    log::debug!(
                        "{}: retry limit reached for {}",
                        app.key(),
                        short_revision(revision)
                    );
                    return Verdict::Skip { requeue_after: None };
                }
                let delay = policy.delay_for(op.retry_count);
                let since = op
                    .finished_at
                    .map(|t| (Utc::now() - t).to_std().unwrap_or_default())
                    .unwrap_or(delay);
                if since < delay {
                    return Verdict::Skip {
                        requeue_after: Some(delay - since),
                    };
                }
                log::info!(
                    "Retrying sync of {} (retry {})",
                    app.key(),
                    op.retry_count + 1
                );
                Verdict::Sync(Decision {
                    request,
                    retry_count: op.retry_count + 1,
                    started_at: Utc::now(),
                })
            }
        }
    }

    fn retry_policy(&self, app: &Application) -> crate::retry::RetryPolicy {
        self.settings
            .retry_policy_for(app.sync_policy().retry.as_ref())
    }

    fn requeue_after(&self, app: &Application, sync: &SyncOutcome, retry_count: u32) -> Option<Duration> {
        match sync.phase {
            OperationPhase::Running => Some(self.settings.health_poll_interval),
            OperationPhase::Terminated => Some(Duration::ZERO),
            OperationPhase::SyncFailed | OperationPhase::Error => {
                let policy = self.retry_policy(app);
                let more = policy
                    .max_attempts()
                    .is_none_or(|max| retry_count.saturating_add(1) < max);
                more.then(|| policy.delay_for(retry_count))
            }
            OperationPhase::Succeeded => None,
        }
    }

    fn forget_pruned(&self, sync: &SyncOutcome) {
        for result in &sync.results {
            if result.status == ResourceResultCode::Pruned {
                self.tracker.forget(&result.key);
            }
        }
    }

    async fn deny(
        &self,
        app: &Application,
        builder: StatusBuilder,
        error: SyncError,
    ) -> Result<ReconcileOutcome> {
        log::warn!("{}: {}", app.key(), error);
        self.finish(app, builder.permission_denied(error.to_string()), None)
            .await
    }

    async fn render_failed(
        &self,
        app: &Application,
        builder: StatusBuilder,
        revision: Option<&str>,
        error: RenderError,
    ) -> Result<ReconcileOutcome> {
        log::error!("Failed to render {}: {}", app.key(), error);
        let retryable = error.is_retryable();
        let mut outcome = self
            .finish(app, builder.comparison_error(error.to_string()), revision)
            .await?;
        if retryable {
            outcome.requeue_after = Some(self.settings.health_poll_interval.max(Duration::from_secs(1)));
        }
        Ok(outcome)
    }

    /// Writes the built status if it differs from the stored one.
    async fn finish(
        &self,
        app: &Application,
        builder: StatusBuilder,
        revision: Option<&str>,
    ) -> Result<ReconcileOutcome> {
        let status = builder.build();
        let status_written = needs_write(app.status.as_ref(), &status);
        if status_written {
            let value = serde_json::to_value(&status)
                .map_err(|e| KeelError::InvalidManifest(e.to_string()))?;
            match self.api.update_status(&app.key(), value).await {
                Ok(_) => log::debug!("Updated status of {}", app.key()),
                Err(e) if e.is_not_found() => {
                    log::debug!("{} disappeared before its status was written", app.key());
                    return Ok(ReconcileOutcome {
                        deleted: true,
                        ..Default::default()
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(ReconcileOutcome {
            revision: revision.map(String::from),
            status_written,
            ..Default::default()
        })
    }
}

fn same_server(a: &str, b: &str) -> bool {
    a.trim_end_matches('/') == b.trim_end_matches('/')
}
