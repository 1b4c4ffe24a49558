//! Health assessment of live resources.
//!
//! Evaluators are registered per (group, kind) in a [`HealthRegistry`].
//! Built-in evaluators cover the common workload kinds; user rules loaded
//! from configuration replace them. Kinds without any rule are assumed
//! stateless and reported Healthy, unless configured to require a rule.

pub mod builtin;
pub mod rules;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::resource::{GroupKind, Manifest, ResourceKey};

pub use rules::{FieldCheck, FieldRuleEvaluator, HealthRuleSpec};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Suspended,
    Progressing,
    Missing,
    Degraded,
    #[default]
    Unknown,
}

impl HealthStatus {
    fn severity(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Suspended => 1,
            HealthStatus::Progressing => 2,
            HealthStatus::Missing => 3,
            HealthStatus::Degraded => 4,
            HealthStatus::Unknown => 5,
        }
    }

    pub fn is_worse_than(&self, other: HealthStatus) -> bool {
        self.severity() > other.severity()
    }

    /// Worst status of a set; Healthy when empty.
    pub fn aggregate(statuses: impl IntoIterator<Item = HealthStatus>) -> HealthStatus {
        statuses
            .into_iter()
            .fold(HealthStatus::Healthy, |worst, s| {
                if s.is_worse_than(worst) {
                    s
                } else {
                    worst
                }
            })
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "Healthy",
            HealthStatus::Suspended => "Suspended",
            HealthStatus::Progressing => "Progressing",
            HealthStatus::Missing => "Missing",
            HealthStatus::Degraded => "Degraded",
            HealthStatus::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for HealthStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Healthy" => Ok(HealthStatus::Healthy),
            "Suspended" => Ok(HealthStatus::Suspended),
            "Progressing" => Ok(HealthStatus::Progressing),
            "Missing" => Ok(HealthStatus::Missing),
            "Degraded" => Ok(HealthStatus::Degraded),
            "Unknown" => Ok(HealthStatus::Unknown),
            _ => Err(format!("Unknown health status: {}", s)),
        }
    }
}

/// Result of evaluating one live resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthAssessment {
    pub status: HealthStatus,
    pub message: Option<String>,
}

impl HealthAssessment {
    pub fn new(status: HealthStatus) -> Self {
        Self {
            status,
            message: None,
        }
    }

    pub fn healthy() -> Self {
        Self::new(HealthStatus::Healthy)
    }

    pub fn with_message(status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: Some(message.into()),
        }
    }
}

/// Maps a live resource to a health assessment.
pub trait HealthEvaluator: Send + Sync {
    fn evaluate(&self, live: &Manifest) -> HealthAssessment;
}

impl<F> HealthEvaluator for F
where
    F: Fn(&Manifest) -> HealthAssessment + Send + Sync,
{
    fn evaluate(&self, live: &Manifest) -> HealthAssessment {
        self(live)
    }
}

/// Registry of evaluators keyed by (group, kind).
#[derive(Clone)]
pub struct HealthRegistry {
    evaluators: HashMap<(String, String), Arc<dyn HealthEvaluator>>,
    require_rule: Vec<GroupKind>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl HealthRegistry {
    /// An empty registry: every kind falls back to the default rule.
    pub fn empty() -> Self {
        Self {
            evaluators: HashMap::new(),
            require_rule: Vec::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        builtin::register_all(&mut registry);
        registry
    }

    /// Builds the registry from built-ins plus configured rules, which win.
    pub fn from_rules(rules: &[HealthRuleSpec], require_rule: &[GroupKind]) -> Self {
        let mut registry = Self::with_builtins();
        for rule in rules {
            registry.register(
                &rule.group,
                &rule.kind,
                FieldRuleEvaluator::new(rule.clone()),
            );
        }
        registry.require_rule = require_rule.to_vec();
        registry
    }

    pub fn register(
        &mut self,
        group: &str,
        kind: &str,
        evaluator: impl HealthEvaluator + 'static,
    ) {
        self.evaluators
            .insert((group.to_string(), kind.to_string()), Arc::new(evaluator));
    }

    pub fn has_rule(&self, group: &str, kind: &str) -> bool {
        self.evaluators
            .contains_key(&(group.to_string(), kind.to_string()))
    }

    /// Assesses a resource; `None` means it is absent from the cluster.
    pub fn evaluate(&self, live: Option<&Manifest>) -> HealthAssessment {
        let Some(live) = live else {
            return HealthAssessment::new(HealthStatus::Missing);
        };
        if live.is_deleting() {
            return HealthAssessment::with_message(
                HealthStatus::Progressing,
                "Pending deletion",
            );
        }
        let group = live.group();
        let kind = live.kind();
        match self.evaluators.get(&(group.to_string(), kind.to_string())) {
            Some(evaluator) => evaluator.evaluate(live),
            None if self.require_rule.iter().any(|gk| gk.matches(group, kind)) => {
                HealthAssessment::with_message(
                    HealthStatus::Unknown,
                    format!("No health rule defined for {}/{}", group, kind),
                )
            }
            None => HealthAssessment::healthy(),
        }
    }
}

impl fmt::Debug for HealthRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.evaluators.keys().collect();
        kinds.sort();
        f.debug_struct("HealthRegistry")
            .field("kinds", &kinds)
            .field("require_rule", &self.require_rule)
            .finish()
    }
}

/// Tracks the last observed health of each resource.
///
/// A resource that has never been observed is `Unknown`.
#[derive(Debug, Default)]
pub struct HealthTracker {
    states: Mutex<HashMap<ResourceKey, HealthStatus>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, key: &ResourceKey) -> HealthStatus {
        self.states
            .lock()
            .ok()
            .and_then(|s| s.get(key).copied())
            .unwrap_or(HealthStatus::Unknown)
    }

    /// Records an observation and returns the previous state.
    pub fn observe(&self, key: &ResourceKey, assessment: &HealthAssessment) -> HealthStatus {
        let Ok(mut states) = self.states.lock() else {
            return HealthStatus::Unknown;
        };
        let previous = states
            .insert(key.clone(), assessment.status)
            .unwrap_or(HealthStatus::Unknown);
        if previous != assessment.status {
            log::debug!(
                "Health of {} changed {} -> {}{}",
                key,
                previous,
                assessment.status,
                assessment
                    .message
                    .as_deref()
                    .map(|m| format!(" ({})", m))
                    .unwrap_or_default()
            );
        }
        previous
    }

    pub fn forget(&self, key: &ResourceKey) {
        if let Ok(mut states) = self.states.lock() {
            states.remove(key);
        }
    }
}
