//! The Application resource: a source locator, a destination and a sync policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::annotations::{HookPhase, SyncOptions, TrackingId};
use super::manifest::ResourceKey;
use super::Resource;
use crate::health::HealthStatus;

/// Finalizer that requests cascade deletion of an Application's resources.
pub const RESOURCES_FINALIZER: &str = "resources-finalizer.keel.io";

/// Number of history entries kept in an Application's status.
pub const HISTORY_LIMIT: usize = 10;

pub type Application = Resource<ApplicationSpec, ApplicationStatus>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    #[serde(default = "default_project")]
    pub project: String,

    pub source: ApplicationSource,

    pub destination: ApplicationDestination,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_policy: Option<SyncPolicy>,

    /// Fields excluded when comparing this Application's resources.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore_differences: Vec<ResourceIgnoreDifferences>,
}

fn default_project() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSource {
    #[serde(rename = "repoURL")]
    pub repo_url: String,

    #[serde(default = "default_revision")]
    pub target_revision: String,

    #[serde(default = "default_path")]
    pub path: String,

    /// Chart name when the repository is a Helm chart repository.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<DirectorySource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm: Option<HelmSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kustomize: Option<KustomizeSource>,
}

fn default_revision() -> String {
    "HEAD".to_string()
}

fn default_path() -> String {
    ".".to_string()
}

impl ApplicationSource {
    pub fn new(repo_url: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            repo_url: repo_url.into(),
            target_revision: default_revision(),
            path: path.into(),
            chart: None,
            directory: None,
            helm: None,
            kustomize: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectorySource {
    #[serde(default)]
    pub recurse: bool,

    /// Glob of files to include, relative to the source path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<String>,

    /// Glob of files to exclude, relative to the source path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub value_files: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<HelmParameter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelmParameter {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KustomizeSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_prefix: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationDestination {
    #[serde(default = "default_server")]
    pub server: String,

    #[serde(default)]
    pub namespace: String,
}

pub fn default_server() -> String {
    "https://kubernetes.default.svc".to_string()
}

impl ApplicationDestination {
    pub fn in_cluster(namespace: impl Into<String>) -> Self {
        Self {
            server: default_server(),
            namespace: namespace.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPolicy {
    /// Absent means the Application is only compared, never synced automatically.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automated: Option<AutomatedSync>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sync_options: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomatedSync {
    #[serde(default)]
    pub prune: bool,

    #[serde(default)]
    pub self_heal: bool,

    #[serde(default)]
    pub allow_empty: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySpec {
    #[serde(default = "default_retry_limit")]
    pub limit: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffSpec>,
}

fn default_retry_limit() -> i64 {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffSpec {
    /// Initial delay, e.g. `5s`.
    #[serde(default = "default_backoff_duration")]
    pub duration: String,

    #[serde(default = "default_backoff_factor")]
    pub factor: f64,

    #[serde(default = "default_backoff_max")]
    pub max_duration: String,
}

fn default_backoff_duration() -> String {
    "5s".to_string()
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_backoff_max() -> String {
    "3m".to_string()
}

impl Default for BackoffSpec {
    fn default() -> Self {
        Self {
            duration: default_backoff_duration(),
            factor: default_backoff_factor(),
            max_duration: default_backoff_max(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceIgnoreDifferences {
    #[serde(default)]
    pub group: String,

    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default)]
    pub json_pointers: Vec<String>,
}

impl ResourceIgnoreDifferences {
    pub fn matches(&self, key: &ResourceKey) -> bool {
        self.group == key.group
            && self.kind == key.kind
            && self.name.as_ref().is_none_or(|n| *n == key.name)
            && self.namespace.as_ref().is_none_or(|ns| *ns == key.namespace)
    }
}

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStatus {
    #[serde(default)]
    pub sync: SyncStatus,

    #[serde(default)]
    pub health: AppHealth,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceStatus>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ApplicationCondition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_state: Option<OperationState>,

    /// Hooks executed per revision, used to avoid re-running succeeded hooks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<HookRecord>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<RevisionHistory>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    #[serde(default)]
    pub status: SyncStatusCode,

    /// Revision the desired set was last compared at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatusCode {
    Synced,
    OutOfSync,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppHealth {
    #[serde(default)]
    pub status: HealthStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    #[serde(flatten)]
    pub key: ResourceKey,

    pub status: SyncStatusCode,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_message: Option<String>,

    #[serde(default)]
    pub wave: i32,

    #[serde(default)]
    pub requires_pruning: bool,

    /// Present in the cluster and absent from the desired set, but protected.
    #[serde(default)]
    pub prune_protected: bool,

    /// JSON pointers that differ between desired and live state.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diff: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    ComparisonError,
    PermissionDenied,
    SyncError,
    HealthTimeout,
    HookFailed,
    PruneSkipped,
    DeletionError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationCondition {
    #[serde(rename = "type")]
    pub type_: ConditionType,

    pub message: String,

    pub last_transition_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationPhase {
    Running,
    Succeeded,
    SyncFailed,
    Error,
    Terminated,
}

impl OperationPhase {
    pub fn is_completed(&self) -> bool {
        !matches!(self, OperationPhase::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitiatedBy {
    Automated,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationState {
    pub phase: OperationPhase,

    pub message: String,

    pub revision: String,

    pub initiated_by: InitiatedBy,

    /// Automated attempts made for this revision.
    #[serde(default)]
    pub retry_count: u32,

    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceResultCode {
    Synced,
    SyncFailed,
    Pruned,
    PruneSkipped,
    Running,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceResult {
    #[serde(flatten)]
    pub key: ResourceKey,

    pub status: ResourceResultCode,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook_phase: Option<HookPhase>,

    #[serde(default)]
    pub wave: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookRecord {
    pub revision: String,

    #[serde(flatten)]
    pub key: ResourceKey,

    pub phase: HookPhase,

    pub succeeded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionHistory {
    pub id: u64,

    pub revision: String,

    pub deployed_at: DateTime<Utc>,

    pub initiated_by: InitiatedBy,
}

impl ApplicationStatus {
    pub fn condition(&self, type_: ConditionType) -> Option<&ApplicationCondition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Sets a condition, keeping its transition time if the message is unchanged.
    pub fn set_condition(&mut self, type_: ConditionType, message: impl Into<String>) {
        let message = message.into();
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.message != message {
                existing.message = message;
                existing.last_transition_time = Utc::now();
            }
            return;
        }
        self.conditions.push(ApplicationCondition {
            type_,
            message,
            last_transition_time: Utc::now(),
        });
    }

    pub fn clear_condition(&mut self, type_: ConditionType) {
        self.conditions.retain(|c| c.type_ != type_);
    }

    pub fn hook_succeeded(&self, revision: &str, key: &ResourceKey, phase: HookPhase) -> bool {
        self.hooks
            .iter()
            .any(|h| h.revision == revision && &h.key == key && h.phase == phase && h.succeeded)
    }

    /// Records a hook outcome, dropping records of older revisions.
    pub fn record_hook(&mut self, revision: &str, key: &ResourceKey, phase: HookPhase, ok: bool) {
        self.hooks.retain(|h| h.revision == revision);
        self.hooks.retain(|h| !(&h.key == key && h.phase == phase));
        self.hooks.push(HookRecord {
            revision: revision.to_string(),
            key: key.clone(),
            phase,
            succeeded: ok,
        });
    }

    pub fn push_history(&mut self, revision: &str, initiated_by: InitiatedBy) {
        let id = self.history.last().map(|h| h.id + 1).unwrap_or(0);
        self.history.push(RevisionHistory {
            id,
            revision: revision.to_string(),
            deployed_at: Utc::now(),
            initiated_by,
        });
        if self.history.len() > HISTORY_LIMIT {
            let excess = self.history.len() - HISTORY_LIMIT;
            self.history.drain(..excess);
        }
    }
}

impl Application {
    pub fn sync_policy(&self) -> SyncPolicy {
        self.spec.sync_policy.clone().unwrap_or_default()
    }

    pub fn automated(&self) -> Option<AutomatedSync> {
        self.spec.sync_policy.as_ref().and_then(|p| p.automated)
    }

    pub fn sync_options(&self) -> SyncOptions {
        self.spec
            .sync_policy
            .as_ref()
            .map(|p| SyncOptions::parse(&p.sync_options))
            .unwrap_or_default()
    }

    pub fn has_resources_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .iter()
            .any(|f| f == RESOURCES_FINALIZER)
    }

    pub fn tracking_id(&self) -> TrackingId {
        TrackingId::new(self.namespace(), self.name())
    }

    pub fn status_or_default(&self) -> ApplicationStatus {
        self.status.clone().unwrap_or_default()
    }
}
