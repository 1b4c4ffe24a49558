//! Validation of controller configuration.

use std::collections::HashSet;
use std::time::Duration;

use super::settings::ControllerConfig;
use crate::config::duration::parse_duration;
use crate::error::ConfigError;
use crate::resource::{ResourceKind, API_VERSION};

/// Collects every problem in a configuration before failing.
pub struct ConfigValidator {
    errors: Vec<String>,
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigValidator {
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    pub fn validate(&mut self, config: &ControllerConfig) -> Result<(), ConfigError> {
        self.errors.clear();

        if config.api_version != API_VERSION {
            self.errors.push(format!(
                "ControllerConfig: apiVersion must be '{}', got '{}'",
                API_VERSION, config.api_version
            ));
        }
        if config.kind != ResourceKind::ControllerConfig {
            self.errors.push(format!(
                "ControllerConfig: unexpected kind '{}'",
                config.kind
            ));
        }
        if config.metadata.name.is_empty() {
            self.errors
                .push("ControllerConfig: metadata.name is required".to_string());
        }

        let spec = &config.spec;
        for (field, value) in [
            ("pollInterval", spec.poll_interval),
            ("waveTimeout", spec.wave_timeout),
            ("hookTimeout", spec.hook_timeout),
            ("healthPollInterval", spec.health_poll_interval),
            ("deletionTimeout", spec.deletion_timeout),
        ] {
            if value == Duration::ZERO {
                self.errors
                    .push(format!("ControllerConfig: {} must be greater than 0", field));
            }
        }
        if spec.health_poll_interval > spec.wave_timeout {
            self.errors.push(
                "ControllerConfig: healthPollInterval must not exceed waveTimeout".to_string(),
            );
        }
        if spec.max_concurrent_reconciles == 0 {
            self.errors.push(
                "ControllerConfig: maxConcurrentReconciles must be greater than 0".to_string(),
            );
        }

        let mut seen = HashSet::new();
        for ns in &spec.application_namespaces {
            if ns.is_empty() {
                self.errors
                    .push("ControllerConfig: applicationNamespaces entries must not be empty".to_string());
            } else if !seen.insert(ns.as_str()) {
                self.errors.push(format!(
                    "ControllerConfig: duplicate application namespace '{}'",
                    ns
                ));
            }
        }

        if let Some(retry) = &spec.default_retry {
            if let Some(backoff) = &retry.backoff {
                for (field, value) in [
                    ("duration", &backoff.duration),
                    ("maxDuration", &backoff.max_duration),
                ] {
                    if let Err(e) = parse_duration(value) {
                        self.errors
                            .push(format!("ControllerConfig: defaultRetry.backoff.{}: {}", field, e));
                    }
                }
                if backoff.factor < 1.0 {
                    self.errors.push(
                        "ControllerConfig: defaultRetry.backoff.factor must be at least 1".to_string(),
                    );
                }
            }
        }

        let mut rule_keys = HashSet::new();
        for (i, rule) in spec.health.rules.iter().enumerate() {
            if rule.kind.is_empty() {
                self.errors
                    .push(format!("ControllerConfig: health.rules[{}].kind is required", i));
            }
            if !rule_keys.insert((rule.group.as_str(), rule.kind.as_str())) {
                self.errors.push(format!(
                    "ControllerConfig: duplicate health rule for {}/{}",
                    rule.group, rule.kind
                ));
            }
            for (j, check) in rule.checks.iter().enumerate() {
                if !check.path.starts_with('/') {
                    self.errors.push(format!(
                        "ControllerConfig: health.rules[{}].checks[{}].path must be a JSON pointer",
                        i, j
                    ));
                }
            }
        }

        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation {
                message: self.errors.join("; "),
            })
        }
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }
}
