use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while resolving or rendering an Application source.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Source path not found: {0}")]
    PathNotFound(PathBuf),

    #[error("Failed to read '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse '{path}': {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid manifest in '{path}': {message}")]
    InvalidManifest { path: PathBuf, message: String },

    #[error("Invalid source: {0}")]
    InvalidSource(String),

    #[error("'{tool}' is not installed or not on PATH")]
    ToolMissing { tool: String },

    #[error("'{tool}' failed: {message}")]
    ToolFailed { tool: String, message: String },

    #[error("Revision '{revision}' not found in {repo}")]
    RevisionNotFound { repo: String, revision: String },

    #[error("Repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("Git operation failed: {0}")]
    Git(String),

    #[error("Git network error: {0}")]
    GitNetwork(String),

    #[error("Git operation timed out after {0}s")]
    GitTimeout(u64),

    #[error("Git authentication failed: {0}")]
    GitAuth(String),

    #[error("Failed to watch sources: {0}")]
    Watch(String),
}

impl RenderError {
    /// Network failures and timeouts may succeed on the next poll without
    /// any change to the source.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RenderError::GitNetwork(_) | RenderError::GitTimeout(_))
    }
}

/// Classifies git stderr into a more specific error.
pub fn classify_git_error(stderr: &str) -> RenderError {
    let lower = stderr.to_lowercase();
    let message = stderr.trim().to_string();

    if lower.contains("could not resolve host")
        || lower.contains("connection refused")
        || lower.contains("connection timed out")
        || lower.contains("network is unreachable")
        || lower.contains("unable to access")
        || lower.contains("failed to connect")
        || lower.contains("couldn't connect to server")
        || lower.contains("the remote end hung up unexpectedly")
    {
        return RenderError::GitNetwork(message);
    }

    if lower.contains("authentication failed")
        || lower.contains("permission denied")
        || lower.contains("invalid credentials")
    {
        return RenderError::GitAuth(message);
    }

    if lower.contains("does not appear to be a git repository")
        || lower.contains("repository not found")
    {
        return RenderError::RepositoryNotFound(message);
    }

    RenderError::Git(message)
}
