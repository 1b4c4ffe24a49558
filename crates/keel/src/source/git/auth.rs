//! Credentials for git repositories.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::secrets::{expand_home, resolve_secret};
use crate::source::RenderError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CredentialType {
    #[default]
    None,
    Token,
    SshKey,
}

/// Credentials used for every repository URL starting with `url_prefix`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoCredential {
    pub url_prefix: String,

    #[serde(default, rename = "type")]
    pub credential_type: CredentialType,

    /// Inline token, for local testing only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_insecure: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_file: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_env_var: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key_path: Option<String>,
}

/// Picks the credential with the longest matching prefix.
pub fn credential_for<'a>(credentials: &'a [RepoCredential], url: &str) -> Option<&'a RepoCredential> {
    credentials
        .iter()
        .filter(|c| url.starts_with(&c.url_prefix))
        .max_by_key(|c| c.url_prefix.len())
}

/// Single-quote escaping for the askpass script.
pub fn shell_escape_token(token: &str) -> String {
    token.replace('\'', "'\\''")
}

/// Deletes the askpass script when dropped.
#[derive(Debug)]
pub struct AskpassCleanup {
    path: Option<PathBuf>,
}

impl Drop for AskpassCleanup {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                log::warn!("Failed to clean up askpass script: {}", e);
            }
        }
    }
}

/// Environment for one git invocation. Must outlive the command.
#[derive(Debug)]
pub struct AuthEnv {
    pub env_vars: Vec<(String, String)>,
    pub _cleanup: AskpassCleanup,
}

impl AuthEnv {
    /// No credentials; prompts disabled.
    pub fn none() -> Self {
        Self::plain(vec![("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())])
    }

    fn plain(env_vars: Vec<(String, String)>) -> Self {
        Self {
            env_vars,
            _cleanup: AskpassCleanup { path: None },
        }
    }
}

pub fn build_auth_env(credential: Option<&RepoCredential>) -> Result<AuthEnv, RenderError> {
    use secrecy::ExposeSecret;

    let mut env = vec![("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())];
    let Some(credential) = credential else {
        return Ok(AuthEnv::plain(env));
    };

    match credential.credential_type {
        CredentialType::None => Ok(AuthEnv::plain(env)),
        CredentialType::Token => {
            let token = resolve_secret(
                credential.token_insecure.as_deref(),
                credential.token_file.as_deref(),
                credential.token_env_var.as_deref(),
            )
            .map_err(|e| {
                RenderError::GitAuth(format!(
                    "Failed to resolve token for {}: {}",
                    credential.url_prefix, e
                ))
            })?;
            let escaped = shell_escape_token(token.expose_secret());
            let path = std::env::temp_dir().join(format!(".keel-askpass-{}.sh", uuid::Uuid::new_v4()));
            write_askpass(&path, &format!("#!/bin/sh\necho '{}'\n", escaped))?;
            let cleanup = AskpassCleanup {
                path: Some(path.clone()),
            };
            let path_str = path
                .to_str()
                .ok_or_else(|| {
                    RenderError::GitAuth("Temp directory path contains non-UTF8 characters".into())
                })?
                .to_string();
            env.push(("GIT_ASKPASS".to_string(), path_str));
            Ok(AuthEnv {
                env_vars: env,
                _cleanup: cleanup,
            })
        }
        CredentialType::SshKey => {
            let key_path = match credential.ssh_key_path.as_deref() {
                Some(p) if !p.is_empty() => PathBuf::from(expand_home(p)),
                _ => dirs::home_dir()
                    .map(|h| h.join(".ssh").join("id_ed25519"))
                    .unwrap_or_else(|| PathBuf::from(".ssh/id_ed25519")),
            };
            if !key_path.exists() {
                return Err(RenderError::GitAuth(format!(
                    "SSH key file not found: {}",
                    key_path.display()
                )));
            }
            let escaped = key_path.display().to_string().replace('\'', "'\\''");
            env.push((
                "GIT_SSH_COMMAND".to_string(),
                format!("ssh -i '{}' -o StrictHostKeyChecking=accept-new", escaped),
            ));
            Ok(AuthEnv::plain(env))
        }
    }
}

#[cfg(unix)]
fn write_askpass(path: &std::path::Path, script: &str) -> Result<(), RenderError> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o700)
        .open(path)
        .map_err(|e| RenderError::GitAuth(format!("Failed to write askpass script: {}", e)))?;
    file.write_all(script.as_bytes())
        .map_err(|e| RenderError::GitAuth(format!("Failed to write askpass script: {}", e)))
}

#[cfg(not(unix))]
fn write_askpass(path: &std::path::Path, script: &str) -> Result<(), RenderError> {
    std::fs::write(path, script)
        .map_err(|e| RenderError::GitAuth(format!("Failed to write askpass script: {}", e)))
}
