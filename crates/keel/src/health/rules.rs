//! Declarative health rules supplied through configuration.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{HealthAssessment, HealthEvaluator, HealthStatus};
use crate::resource::Manifest;

/// A user rule for one (group, kind). Checks are tried in order and the
/// first match decides; otherwise `default` applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRuleSpec {
    #[serde(default)]
    pub group: String,

    pub kind: String,

    #[serde(default)]
    pub checks: Vec<FieldCheck>,

    #[serde(default = "default_status", rename = "default")]
    pub default_status: HealthStatus,
}

fn default_status() -> HealthStatus {
    HealthStatus::Progressing
}

/// Matches a JSON pointer against a value, a set of values or existence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldCheck {
    pub path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equals: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub one_of: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exists: Option<bool>,

    pub status: HealthStatus,

    /// Static message, or the pointer's string value when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl FieldCheck {
    fn matches(&self, live: &Manifest) -> bool {
        let value = live.pointer(&self.path).filter(|v| !v.is_null());
        if let Some(expect) = self.exists {
            if value.is_some() != expect {
                return false;
            }
        }
        let text = value.map(scalar_text);
        if let Some(equals) = &self.equals {
            if text.as_deref() != Some(equals.as_str()) {
                return false;
            }
        }
        if !self.one_of.is_empty() {
            match &text {
                Some(t) if self.one_of.iter().any(|v| v == t) => {}
                _ => return false,
            }
        }
        self.exists.is_some() || self.equals.is_some() || !self.one_of.is_empty()
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct FieldRuleEvaluator {
    rule: HealthRuleSpec,
}

impl FieldRuleEvaluator {
    pub fn new(rule: HealthRuleSpec) -> Self {
        Self { rule }
    }
}

impl HealthEvaluator for FieldRuleEvaluator {
    fn evaluate(&self, live: &Manifest) -> HealthAssessment {
        for check in &self.rule.checks {
            if check.matches(live) {
                let message = check.message.clone().or_else(|| {
                    live.pointer(&check.path)
                        .and_then(Value::as_str)
                        .map(String::from)
                });
                return HealthAssessment {
                    status: check.status,
                    message,
                };
            }
        }
        HealthAssessment::new(self.rule.default_status)
    }
}
