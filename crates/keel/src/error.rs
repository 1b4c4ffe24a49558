use std::path::PathBuf;
use thiserror::Error;

use crate::resource::{HookPhase, ResourceKey};
use crate::source::RenderError;

#[derive(Error, Debug)]
pub enum KeelError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),
}

impl KeelError {
    /// Returns true if the error is transient and the caller may try again.
    pub fn is_retryable(&self) -> bool {
        match self {
            KeelError::Render(e) => e.is_retryable(),
            KeelError::Cluster(e) => e.is_retryable(),
            KeelError::Sync(e) => e.is_retryable(),
            KeelError::Config(_) | KeelError::InvalidManifest(_) => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config YAML in '{path}': {message}")]
    ParseYaml { path: PathBuf, message: String },

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Invalid duration '{value}': {reason}")]
    InvalidDuration { value: String, reason: String },
}

/// Errors returned by the cluster API seam.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("Conflict writing {key}: {message}")]
    Conflict { key: ResourceKey, message: String },

    #[error("API server rejected {key}: {message}")]
    Rejected { key: ResourceKey, message: String },

    #[error("Resource not found: {0}")]
    NotFound(ResourceKey),

    #[error("Namespace '{0}' not found")]
    NamespaceNotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("API server unavailable: {0}")]
    Unavailable(String),

    #[error("API request timed out: {0}")]
    Timeout(String),
}

impl ClusterError {
    /// Conflicts, outages and timeouts are transient. A missing namespace is
    /// too, since it may be created by a sibling in the same wave.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClusterError::Conflict { .. }
                | ClusterError::Unavailable(_)
                | ClusterError::Timeout(_)
                | ClusterError::NamespaceNotFound(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }
}

/// Failure taxonomy of a reconciliation cycle.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("{0}")]
    Render(#[from] RenderError),

    #[error("Permission denied: {reason}")]
    RbacDenied { reason: String },

    #[error("Failed to apply {key} after {attempts} attempt(s): {source}")]
    Apply {
        key: ResourceKey,
        attempts: u32,
        #[source]
        source: ClusterError,
    },

    #[error("Wave {wave} did not become healthy in time ({} resource(s) pending)", pending.len())]
    HealthTimeout {
        wave: i32,
        pending: Vec<ResourceKey>,
    },

    #[error("{phase} hook {hook} failed: {message}")]
    HookFailure {
        hook: ResourceKey,
        phase: HookPhase,
        message: String,
    },

    #[error("Refusing to delete protected resource {0}")]
    PruneProtection(ResourceKey),

    #[error("Refusing to prune all {count} resource(s): the desired set is empty and allowEmpty is not set")]
    EmptyPrune { count: usize },

    #[error("API server unavailable: {0}")]
    Unavailable(String),

    #[error("Operation cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("{0}")]
    Cluster(#[from] ClusterError),
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Render(e) => e.is_retryable(),
            SyncError::Unavailable(_) | SyncError::HealthTimeout { .. } => true,
            SyncError::Cluster(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Cycle-level errors abort before any cluster mutation.
    pub fn aborts_before_mutation(&self) -> bool {
        matches!(self, SyncError::Render(_) | SyncError::RbacDenied { .. })
    }

    pub fn rbac(reason: impl Into<String>) -> Self {
        SyncError::RbacDenied {
            reason: reason.into(),
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        SyncError::Cancelled {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, KeelError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ResourceKey {
        ResourceKey::new("apps", "Deployment", "web", "frontend")
    }

    #[test]
    fn test_cluster_error_retryable() {
        assert!(ClusterError::Conflict {
            key: key(),
            message: "stale".into()
        }
        .is_retryable());
        assert!(ClusterError::Unavailable("down".into()).is_retryable());
        assert!(ClusterError::NamespaceNotFound("web".into()).is_retryable());
        assert!(!ClusterError::Rejected {
            key: key(),
            message: "invalid".into()
        }
        .is_retryable());
        assert!(!ClusterError::Forbidden("no".into()).is_retryable());
    }

    #[test]
    fn test_sync_error_mutation_classification() {
        assert!(SyncError::rbac("destination not permitted").aborts_before_mutation());
        assert!(!SyncError::cancelled("new revision").aborts_before_mutation());
        let apply = SyncError::Apply {
            key: key(),
            attempts: 3,
            source: ClusterError::Unavailable("down".into()),
        };
        assert!(!apply.aborts_before_mutation());
        assert!(apply.to_string().contains("after 3 attempt(s)"));
    }

    #[test]
    fn test_health_timeout_message_counts_pending() {
        let err = SyncError::HealthTimeout {
            wave: -1,
            pending: vec![key()],
        };
        assert_eq!(
            err.to_string(),
            "Wave -1 did not become healthy in time (1 resource(s) pending)"
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn test_keel_error_from_cluster() {
        let err: KeelError = ClusterError::Timeout("list".into()).into();
        assert!(err.is_retryable());
        assert!(err.to_string().starts_with("Cluster error:"));
    }
}
