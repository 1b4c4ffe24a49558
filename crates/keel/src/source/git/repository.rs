//! A bare clone of one remote plus detached worktrees per commit.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;

use super::auth::AuthEnv;
use super::parse::format_git_error;
use crate::source::{classify_git_error, RenderError};

const GIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Git operations on the local cache of one repository.
#[derive(Debug, Clone)]
pub struct GitRepository {
    url: String,
    repo_path: PathBuf,
    worktree_root: PathBuf,
}

impl GitRepository {
    pub fn new(url: impl Into<String>, cache_dir: &Path, cache_key: &str) -> Self {
        Self {
            url: url.into(),
            repo_path: cache_dir.join(format!("{}.git", cache_key)),
            worktree_root: cache_dir.join(format!("{}.worktrees", cache_key)),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn is_cloned(&self) -> bool {
        self.repo_path.join("HEAD").is_file()
    }

    /// Clones the repository as a bare repository if it is not cached yet.
    pub async fn ensure_cloned(&self, auth: &AuthEnv) -> Result<(), RenderError> {
        if self.is_cloned() {
            return Ok(());
        }
        if let Some(parent) = self.repo_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RenderError::Git(format!("Failed to create repo cache: {}", e)))?;
        }
        log::info!("Cloning {} into {}", self.url, self.repo_path.display());
        let target = self.repo_path.to_string_lossy().into_owned();
        let output = run_git(None, &["clone", "--bare", "--quiet", &self.url, &target], auth).await?;
        if output.status.success() {
            Ok(())
        } else {
            // A partial clone would look cached on the next attempt.
            let _ = tokio::fs::remove_dir_all(&self.repo_path).await;
            Err(classify_git_error(&format_git_error(&output)))
        }
    }

    /// Fetches all branches and tags, pruning deleted refs.
    pub async fn fetch(&self, auth: &AuthEnv) -> Result<(), RenderError> {
        log::debug!("Fetching {}", self.url);
        let output = self
            .git(
                &[
                    "fetch",
                    "--quiet",
                    "--prune",
                    "--force",
                    "origin",
                    "+refs/heads/*:refs/heads/*",
                    "+refs/tags/*:refs/tags/*",
                ],
                auth,
            )
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(classify_git_error(&format_git_error(&output)))
        }
    }

    /// Resolves a branch, tag, `HEAD` or commit id to a commit id.
    pub async fn rev_parse(&self, revision: &str) -> Result<Option<String>, RenderError> {
        let revision = revision.trim();
        let candidates: Vec<String> = if revision.is_empty() || revision == "HEAD" {
            vec!["HEAD".to_string()]
        } else {
            vec![
                revision.to_string(),
                format!("refs/tags/{}", revision),
                format!("refs/heads/{}", revision),
            ]
        };
        let auth = AuthEnv::none();
        for candidate in candidates {
            let spec = format!("{}^{{commit}}", candidate);
            let output = self
                .git(&["rev-parse", "--verify", "--quiet", &spec], &auth)
                .await?;
            if output.status.success() {
                let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !sha.is_empty() {
                    return Ok(Some(sha));
                }
            }
        }
        Ok(None)
    }

    pub fn worktree_path(&self, commit: &str) -> PathBuf {
        self.worktree_root.join(commit)
    }

    /// Materializes `commit` in its own detached worktree.
    pub async fn worktree(&self, commit: &str) -> Result<PathBuf, RenderError> {
        let path = self.worktree_path(commit);
        if path.join(".git").exists() {
            return Ok(path);
        }
        tokio::fs::create_dir_all(&self.worktree_root)
            .await
            .map_err(|e| RenderError::Git(format!("Failed to create worktree dir: {}", e)))?;
        let target = path.to_string_lossy().into_owned();
        let output = self
            .git(
                &["worktree", "add", "--detach", "--force", &target, commit],
                &AuthEnv::none(),
            )
            .await?;
        if output.status.success() {
            log::debug!("Checked out {} at {}", commit, path.display());
            Ok(path)
        } else {
            Err(RenderError::Git(format_git_error(&output)))
        }
    }

    pub async fn remove_worktree(&self, commit: &str) -> Result<(), RenderError> {
        let target = self.worktree_path(commit).to_string_lossy().into_owned();
        let output = self
            .git(&["worktree", "remove", "--force", &target], &AuthEnv::none())
            .await?;
        if !output.status.success() {
            log::warn!(
                "Failed to remove worktree {}: {}",
                target,
                format_git_error(&output)
            );
            let _ = self.git(&["worktree", "prune"], &AuthEnv::none()).await;
        }
        Ok(())
    }

    async fn git(&self, args: &[&str], auth: &AuthEnv) -> Result<Output, RenderError> {
        run_git(Some(&self.repo_path), args, auth).await
    }
}

async fn run_git(dir: Option<&Path>, args: &[&str], auth: &AuthEnv) -> Result<Output, RenderError> {
    let mut cmd = Command::new("git");
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in &auth.env_vars {
        cmd.env(key, value);
    }
    match tokio::time::timeout(GIT_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(RenderError::ToolMissing { tool: "git".into() })
        }
        Ok(Err(e)) => Err(RenderError::Git(e.to_string())),
        Err(_) => Err(RenderError::GitTimeout(GIT_TIMEOUT.as_secs())),
    }
}
