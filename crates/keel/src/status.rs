//! Application status assembly.
//!
//! A [`StatusBuilder`] starts from the status currently stored on the
//! Application and folds in the results of one cycle. Conditions keep
//! their transition time while the message is unchanged and timestamps
//! of an untouched operation are carried over, so a cycle that observed
//! nothing new yields a status equal to the stored one and no write.

use crate::diff::{DiffAction, DiffResult};
use crate::error::SyncError;
use crate::health::{HealthRegistry, HealthStatus, HealthTracker};
use crate::resource::{
    AppHealth, ApplicationStatus, ConditionType, OperationState, ResourceStatus, SyncStatusCode,
};
use crate::sync::SyncOutcome;

pub struct StatusBuilder {
    status: ApplicationStatus,
    /// Wave the operation is held at, with the hold message.
    held: Option<(i32, String)>,
}

impl StatusBuilder {
    pub fn from_previous(previous: &ApplicationStatus) -> Self {
        Self {
            status: previous.clone(),
            held: None,
        }
    }

    /// The source could not be rendered or compared.
    pub fn comparison_error(mut self, message: impl Into<String>) -> Self {
        self.status.sync.status = SyncStatusCode::Unknown;
        self.status.set_condition(ConditionType::ComparisonError, message);
        self
    }

    /// The Project denied the Application or its desired set.
    pub fn permission_denied(mut self, message: impl Into<String>) -> Self {
        self.status.set_condition(ConditionType::PermissionDenied, message);
        self
    }

    pub fn deletion_error(mut self, message: impl Into<String>) -> Self {
        self.status.set_condition(ConditionType::DeletionError, message);
        self
    }

    pub fn clear_deletion_error(mut self) -> Self {
        self.status.clear_condition(ConditionType::DeletionError);
        self
    }

    /// Records the comparison of `revision` against live state.
    pub fn comparison(
        mut self,
        revision: &str,
        diff: &DiffResult,
        registry: &HealthRegistry,
        tracker: &HealthTracker,
    ) -> Self {
        self.status.clear_condition(ConditionType::ComparisonError);
        self.status.clear_condition(ConditionType::PermissionDenied);
        self.status.sync.revision = Some(revision.to_string());
        self.status.sync.status = if diff.is_synced() {
            SyncStatusCode::Synced
        } else {
            SyncStatusCode::OutOfSync
        };

        let mut resources = Vec::with_capacity(diff.items.len());
        let mut worst: Option<(HealthStatus, String)> = None;
        for item in &diff.items {
            let in_desired = matches!(
                item.action,
                DiffAction::Create | DiffAction::Update | DiffAction::Unchanged
            );
            let assessment = registry.evaluate(item.live.as_ref());
            if in_desired {
                tracker.observe(&item.key, &assessment);
                let worse = worst
                    .as_ref()
                    .is_none_or(|(status, _)| assessment.status.is_worse_than(*status));
                if worse && assessment.status != HealthStatus::Healthy {
                    let message = match &assessment.message {
                        Some(m) => format!("{}: {}", item.key, m),
                        None => format!("{} is {}", item.key, assessment.status),
                    };
                    worst = Some((assessment.status, message));
                }
            }
            resources.push(ResourceStatus {
                key: item.key.clone(),
                status: if item.action == DiffAction::Unchanged {
                    SyncStatusCode::Synced
                } else {
                    SyncStatusCode::OutOfSync
                },
                health: in_desired.then_some(assessment.status),
                health_message: if in_desired { assessment.message } else { None },
                wave: item.wave,
                requires_pruning: matches!(item.action, DiffAction::Prune | DiffAction::PruneProtected),
                prune_protected: item.action == DiffAction::PruneProtected,
                diff: item.changed.clone(),
            });
        }
        self.status.resources = resources;
        self.status.health = match worst {
            Some((status, message)) => AppHealth {
                status,
                message: Some(message),
            },
            None => AppHealth {
                status: HealthStatus::Healthy,
                message: None,
            },
        };

        let protected: Vec<String> = diff
            .with_action(DiffAction::PruneProtected)
            .map(|d| d.key.to_string())
            .collect();
        if protected.is_empty() {
            self.status.clear_condition(ConditionType::PruneSkipped);
        } else {
            self.status.set_condition(
                ConditionType::PruneSkipped,
                format!(
                    "{} resource(s) protected from pruning: {}",
                    protected.len(),
                    protected.join(", ")
                ),
            );
        }
        self
    }

    /// Records a sync operation's outcome. `state` carries the identity of
    /// the operation; its phase, message and results come from `outcome`.
    pub fn operation(mut self, mut state: OperationState, outcome: &SyncOutcome) -> Self {
        state.phase = outcome.phase;
        state.message = outcome.message.clone();
        state.resources = outcome.results.clone();
        if state.phase.is_completed() {
            state.finished_at.get_or_insert_with(chrono::Utc::now);
        } else {
            state.finished_at = None;
        }

        for hook in &outcome.hooks {
            self.status
                .record_hook(&hook.revision, &hook.key, hook.phase, hook.succeeded);
        }

        match &outcome.error {
            None => {
                self.status.clear_condition(ConditionType::SyncError);
                self.status.clear_condition(ConditionType::HookFailed);
                self.status.clear_condition(ConditionType::HealthTimeout);
            }
            Some(SyncError::HealthTimeout { wave, .. }) => {
                self.status
                    .set_condition(ConditionType::HealthTimeout, &outcome.message);
                self.held = Some((*wave, outcome.message.clone()));
            }
            Some(SyncError::HookFailure { .. }) => {
                self.status.clear_condition(ConditionType::HealthTimeout);
                self.status
                    .set_condition(ConditionType::HookFailed, &outcome.message);
                self.status
                    .set_condition(ConditionType::SyncError, &outcome.message);
            }
            Some(SyncError::Cancelled { .. }) => {
                self.status.clear_condition(ConditionType::HealthTimeout);
            }
            Some(_) => {
                self.status.clear_condition(ConditionType::HealthTimeout);
                self.status
                    .set_condition(ConditionType::SyncError, &outcome.message);
            }
        }

        if outcome.succeeded() {
            self.status.push_history(&state.revision, state.initiated_by);
        }
        self.status.operation_state = Some(state);
        self
    }

    /// A held operation reports Progressing unless a resource in an applied
    /// wave is Degraded. Later waves are not created yet and do not count.
    pub fn build(mut self) -> ApplicationStatus {
        if let Some((wave, message)) = self.held {
            let degraded = self
                .status
                .resources
                .iter()
                .find(|r| r.wave <= wave && r.health == Some(HealthStatus::Degraded));
            self.status.health = match degraded {
                Some(r) => AppHealth {
                    status: HealthStatus::Degraded,
                    message: Some(match &r.health_message {
                        Some(m) => format!("{}: {}", r.key, m),
                        None => format!("{} is {}", r.key, HealthStatus::Degraded),
                    }),
                },
                None => AppHealth {
                    status: HealthStatus::Progressing,
                    message: Some(message),
                },
            };
        }
        self.status
    }
}

/// True if `next` must be written over `current`.
pub fn needs_write(current: Option<&ApplicationStatus>, next: &ApplicationStatus) -> bool {
    match current {
        Some(current) => current != next,
        None => *next != ApplicationStatus::default(),
    }
}
