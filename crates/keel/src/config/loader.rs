//! Loading of ControllerConfig files.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::settings::{ControllerConfig, ControllerSettings};
use super::validation::ConfigValidator;
use crate::error::ConfigError;
use crate::resource::ResourceKind;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Header {
    kind: Option<String>,
}

/// Finds and parses the controller configuration.
pub struct ConfigLoader {
    path: PathBuf,
}

impl ConfigLoader {
    /// `path` is either a single YAML file or a directory searched for
    /// exactly one ControllerConfig document.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads, applies environment overrides and validates.
    pub fn load(&self) -> Result<ControllerSettings, ConfigError> {
        let mut config = if self.path.is_dir() {
            self.find_in_dir()?
        } else {
            load_file(&self.path)?
        };
        config.spec.apply_env_overrides()?;
        ConfigValidator::new().validate(&config)?;
        log::info!(
            "Loaded controller config '{}' (poll every {:?}, wave timeout {:?})",
            config.metadata.name,
            config.spec.poll_interval,
            config.spec.wave_timeout
        );
        Ok(config.spec)
    }

    fn find_in_dir(&self) -> Result<ControllerConfig, ConfigError> {
        let mut found: Option<(PathBuf, ControllerConfig)> = None;
        for entry in WalkDir::new(&self.path)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !path.is_file() || is_hidden(&self.path, path) {
                continue;
            }
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if ext != "yaml" && ext != "yml" {
                continue;
            }
            let content = read(path)?;
            for doc in serde_yaml::Deserializer::from_str(&content) {
                let value = match serde_yaml::Value::deserialize(doc) {
                    Ok(v) => v,
                    Err(e) => {
                        log::debug!("Skipping unparsable document in {}: {}", path.display(), e);
                        continue;
                    }
                };
                let header: Header = match serde_yaml::from_value(value.clone()) {
                    Ok(h) => h,
                    Err(_) => continue,
                };
                if header.kind.as_deref() != Some(ResourceKind::ControllerConfig.as_str()) {
                    continue;
                }
                if let Some((first, _)) = &found {
                    return Err(ConfigError::Validation {
                        message: format!(
                            "multiple ControllerConfig resources found ({} and {})",
                            first.display(),
                            path.display()
                        ),
                    });
                }
                let config = parse_value(value, path)?;
                found = Some((path.to_path_buf(), config));
            }
        }
        match found {
            Some((path, config)) => {
                log::debug!("Using controller config from {}", path.display());
                Ok(config)
            }
            None => {
                log::info!(
                    "No ControllerConfig found under {}, using defaults",
                    self.path.display()
                );
                Ok(ControllerConfig::with_settings("default", ControllerSettings::default()))
            }
        }
    }
}

/// Parses one ControllerConfig file.
pub fn load_file(path: &Path) -> Result<ControllerConfig, ConfigError> {
    parse_str(&read(path)?, path)
}

pub fn parse_str(content: &str, path: &Path) -> Result<ControllerConfig, ConfigError> {
    serde_yaml::from_str(content).map_err(|e| ConfigError::ParseYaml {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn parse_value(value: serde_yaml::Value, path: &Path) -> Result<ControllerConfig, ConfigError> {
    serde_yaml::from_value(value).map_err(|e| ConfigError::ParseYaml {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn read(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })
}

fn is_hidden(root: &Path, path: &Path) -> bool {
    path.strip_prefix(root)
        .map(|relative| {
            relative.components().any(|c| {
                c.as_os_str()
                    .to_str()
                    .map(|s| s.starts_with('.'))
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::time::Duration;
    use tempfile::TempDir;

    const CONFIG: &str = r#"
apiVersion: keel.io/v1
kind: ControllerConfig
metadata:
  name: keel
spec:
  pollInterval: 1m
  waveTimeout: 90s
  acceptProgressing: true
  health:
    requireRule:
      - group: example.com
        kind: Widget
"#;

    #[test]
    #[serial]
    fn test_load_single_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keel.yaml");
        fs::write(&path, CONFIG).unwrap();
        let settings = ConfigLoader::new(&path).load().unwrap();
        assert_eq!(settings.poll_interval, Duration::from_secs(60));
        assert_eq!(settings.wave_timeout, Duration::from_secs(90));
        assert!(settings.accept_progressing);
        assert_eq!(settings.health.require_rule.len(), 1);
    }

    #[test]
    #[serial]
    fn test_find_in_directory_among_other_manifests() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("apps.yaml"),
            "apiVersion: keel.io/v1\nkind: Application\nmetadata:\n  name: root\n---\n",
        )
        .unwrap();
        fs::create_dir(dir.path().join("controller")).unwrap();
        fs::write(dir.path().join("controller/config.yml"), CONFIG).unwrap();
        fs::create_dir(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git/config.yaml"), CONFIG).unwrap();

        let settings = ConfigLoader::new(dir.path()).load().unwrap();
        assert_eq!(settings.poll_interval, Duration::from_secs(60));
    }

    #[test]
    #[serial]
    fn test_directory_without_config_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = ConfigLoader::new(dir.path()).load().unwrap();
        assert_eq!(settings, {
            let mut d = ControllerSettings::default();
            d.apply_env_overrides().unwrap();
            d
        });
    }

    #[test]
    fn test_duplicate_config_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.yaml"), CONFIG).unwrap();
        fs::write(dir.path().join("b.yaml"), CONFIG).unwrap();
        let err = ConfigLoader::new(dir.path()).load().unwrap_err();
        assert!(err.to_string().contains("multiple ControllerConfig"));
    }

    #[test]
    fn test_parse_error_names_file() {
        let err = parse_str("kind: [", Path::new("broken.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::ParseYaml { .. }));
        assert!(err.to_string().contains("broken.yaml"));
    }

    #[test]
    fn test_missing_file() {
        let err = load_file(Path::new("/nonexistent/keel.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }
}
