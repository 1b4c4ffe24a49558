//! In-process repositories.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use super::{RenderContext, RenderError, Renderer};
use crate::resource::{ApplicationSource, Manifest};

#[derive(Debug, Clone, Default)]
struct Commit {
    /// Manifests per source path.
    trees: BTreeMap<String, Vec<Manifest>>,
    /// Paths that fail to render with the given message.
    broken: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct Repo {
    commits: HashMap<String, Commit>,
    refs: HashMap<String, String>,
    head: Option<String>,
    seq: u64,
}

/// A renderer backed by in-memory commits, one per change.
///
/// Every mutation creates a new commit on `HEAD` holding the previous
/// commit's trees plus the change, so revisions behave like git history.
#[derive(Debug, Default)]
pub struct MemoryRenderer {
    repos: Mutex<HashMap<String, Repo>>,
}

impl MemoryRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Repo>> {
        match self.repos.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn commit_with(&self, repo_url: &str, change: impl FnOnce(&mut Commit)) -> String {
        let mut repos = self.lock();
        let repo = repos.entry(repo_url.to_string()).or_default();
        let mut commit = repo
            .head
            .as_ref()
            .and_then(|h| repo.commits.get(h))
            .cloned()
            .unwrap_or_default();
        change(&mut commit);
        repo.seq += 1;
        let revision = format!("{:040x}", repo.seq);
        repo.commits.insert(revision.clone(), commit);
        repo.head = Some(revision.clone());
        revision
    }

    /// Replaces the manifests at `path` and returns the new revision.
    pub fn set_path(&self, repo_url: &str, path: &str, manifests: Vec<Manifest>) -> String {
        let path = normalize_path(path);
        self.commit_with(repo_url, |c| {
            c.broken.remove(&path);
            c.trees.insert(path, manifests);
        })
    }

    /// Makes `path` fail to render from the next revision on.
    pub fn break_path(&self, repo_url: &str, path: &str, message: &str) -> String {
        let path = normalize_path(path);
        let message = message.to_string();
        self.commit_with(repo_url, |c| {
            c.broken.insert(path, message);
        })
    }

    pub fn remove_path(&self, repo_url: &str, path: &str) -> String {
        let path = normalize_path(path);
        self.commit_with(repo_url, |c| {
            c.trees.remove(&path);
            c.broken.remove(&path);
        })
    }

    /// Points a branch or tag at an existing revision.
    pub fn set_ref(&self, repo_url: &str, name: &str, revision: &str) {
        let mut repos = self.lock();
        let repo = repos.entry(repo_url.to_string()).or_default();
        repo.refs.insert(name.to_string(), revision.to_string());
    }

    pub fn head(&self, repo_url: &str) -> Option<String> {
        self.lock().get(repo_url).and_then(|r| r.head.clone())
    }
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    let trimmed = trimmed.strip_prefix("./").unwrap_or(trimmed);
    if trimmed.is_empty() {
        ".".to_string()
    } else {
        trimmed.to_string()
    }
}

fn is_below(path: &str, dir: &str) -> bool {
    dir == "." || path.strip_prefix(dir).is_some_and(|rest| rest.starts_with('/'))
}

#[async_trait]
impl Renderer for MemoryRenderer {
    async fn resolve_revision(&self, source: &ApplicationSource) -> Result<String, RenderError> {
        let repos = self.lock();
        let repo = repos
            .get(&source.repo_url)
            .ok_or_else(|| RenderError::RepositoryNotFound(source.repo_url.clone()))?;
        let target = source.target_revision.as_str();
        let resolved = match target {
            "" | "HEAD" => repo.head.clone(),
            other if repo.commits.contains_key(other) => Some(other.to_string()),
            other => repo.refs.get(other).cloned(),
        };
        resolved.ok_or_else(|| RenderError::RevisionNotFound {
            repo: source.repo_url.clone(),
            revision: target.to_string(),
        })
    }

    async fn render(
        &self,
        source: &ApplicationSource,
        revision: &str,
        _ctx: &RenderContext,
    ) -> Result<Vec<Manifest>, RenderError> {
        let repos = self.lock();
        let repo = repos
            .get(&source.repo_url)
            .ok_or_else(|| RenderError::RepositoryNotFound(source.repo_url.clone()))?;
        let commit = repo
            .commits
            .get(revision)
            .ok_or_else(|| RenderError::RevisionNotFound {
                repo: source.repo_url.clone(),
                revision: revision.to_string(),
            })?;
        let path = normalize_path(&source.path);
        if let Some(message) = commit.broken.get(&path) {
            return Err(RenderError::Parse {
                path: PathBuf::from(&path),
                message: message.clone(),
            });
        }
        let recurse = source.directory.as_ref().is_some_and(|d| d.recurse);
        let mut found = false;
        let mut manifests = Vec::new();
        for (tree_path, items) in &commit.trees {
            if *tree_path == path || (recurse && is_below(tree_path, &path)) {
                found = true;
                manifests.extend(items.iter().cloned());
            }
        }
        if !found {
            return Err(RenderError::PathNotFound(PathBuf::from(path)));
        }
        Ok(manifests)
    }
}
