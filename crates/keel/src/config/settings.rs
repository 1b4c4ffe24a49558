//! The ControllerConfig resource.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::duration::{parse_duration, serde_string};
use crate::error::ConfigError;
use crate::health::{HealthRegistry, HealthRuleSpec};
use crate::resource::{GroupKind, Resource, ResourceKind, RetrySpec};
use crate::retry::RetryPolicy;
use crate::source::git::RepoCredential;

pub const ENV_POLL_INTERVAL: &str = "KEEL_POLL_INTERVAL";
pub const ENV_WAVE_TIMEOUT: &str = "KEEL_WAVE_TIMEOUT";

pub type ControllerConfig = Resource<ControllerSettings>;

/// Controller-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerSettings {
    /// Interval of the self-heal poll over all Applications.
    #[serde(default = "default_poll_interval", with = "serde_string")]
    pub poll_interval: Duration,

    /// Time a wave may take to become healthy before the sync holds.
    #[serde(default = "default_five_minutes", with = "serde_string")]
    pub wave_timeout: Duration,

    #[serde(default = "default_five_minutes", with = "serde_string")]
    pub hook_timeout: Duration,

    #[serde(default = "default_health_poll_interval", with = "serde_string")]
    pub health_poll_interval: Duration,

    #[serde(default = "default_deletion_timeout", with = "serde_string")]
    pub deletion_timeout: Duration,

    /// Lets Progressing resources pass the wave gate.
    #[serde(default)]
    pub accept_progressing: bool,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_reconciles: usize,

    /// Namespaces Applications are read from; empty means all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub application_namespaces: Vec<String>,

    /// Retry policy for Applications that declare none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_retry: Option<RetrySpec>,

    #[serde(default)]
    pub health: HealthSettings,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_cache_dir: Option<PathBuf>,

    /// Credentials for git repositories, matched by URL prefix.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repositories: Vec<RepoCredential>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSettings {
    #[serde(default)]
    pub rules: Vec<HealthRuleSpec>,

    /// Kinds that report Unknown instead of Healthy when no rule exists.
    #[serde(default)]
    pub require_rule: Vec<GroupKind>,
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(180)
}

fn default_five_minutes() -> Duration {
    Duration::from_secs(300)
}

fn default_health_poll_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_deletion_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_max_concurrent() -> usize {
    num_cpus::get().max(1)
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            wave_timeout: default_five_minutes(),
            hook_timeout: default_five_minutes(),
            health_poll_interval: default_health_poll_interval(),
            deletion_timeout: default_deletion_timeout(),
            accept_progressing: false,
            max_concurrent_reconciles: default_max_concurrent(),
            application_namespaces: Vec::new(),
            default_retry: None,
            health: HealthSettings::default(),
            repo_cache_dir: None,
            repositories: Vec::new(),
        }
    }
}

impl ControllerSettings {
    /// Applies `KEEL_POLL_INTERVAL` and `KEEL_WAVE_TIMEOUT` when set.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(value) = std::env::var(ENV_POLL_INTERVAL) {
            self.poll_interval = parse_duration(&value)?;
            log::info!("Poll interval overridden from environment: {}", value);
        }
        if let Ok(value) = std::env::var(ENV_WAVE_TIMEOUT) {
            self.wave_timeout = parse_duration(&value)?;
            log::info!("Wave timeout overridden from environment: {}", value);
        }
        Ok(())
    }

    pub fn default_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::resolve(self.default_retry.as_ref(), &RetryPolicy::default())
    }

    /// Policy for one Application, falling back to the controller default.
    pub fn retry_policy_for(&self, spec: Option<&RetrySpec>) -> RetryPolicy {
        RetryPolicy::resolve(spec, &self.default_retry_policy())
    }

    pub fn health_registry(&self) -> HealthRegistry {
        HealthRegistry::from_rules(&self.health.rules, &self.health.require_rule)
    }

    pub fn watches_namespace(&self, namespace: &str) -> bool {
        self.application_namespaces.is_empty()
            || self.application_namespaces.iter().any(|ns| ns == namespace)
    }

    /// Checkout cache for git sources.
    pub fn repo_cache_dir(&self) -> PathBuf {
        self.repo_cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("keel")
                .join("repos")
        })
    }
}

impl ControllerConfig {
    pub fn with_settings(name: impl Into<String>, settings: ControllerSettings) -> Self {
        Resource::new(ResourceKind::ControllerConfig, name, settings)
    }
}
