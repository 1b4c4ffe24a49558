//! Git-backed renderer.
//!
//! Each repository URL is cached once as a bare clone. Revisions are
//! resolved against the clone after a throttled fetch and every resolved
//! commit is rendered from its own detached worktree, so concurrent
//! Applications on different revisions of one repository never share a
//! checkout.

pub mod auth;
pub mod parse;
pub mod repository;

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::{directory, render_tree, RenderContext, RenderError, Renderer};
use crate::resource::{ApplicationSource, Manifest};

pub use auth::{build_auth_env, credential_for, AuthEnv, CredentialType, RepoCredential};
pub use repository::GitRepository;

const DEFAULT_FETCH_INTERVAL: Duration = Duration::from_secs(10);
const WORKTREES_PER_REPO: usize = 8;

#[derive(Default)]
struct RepoState {
    last_fetch: Option<Instant>,
    worktrees: VecDeque<String>,
}

struct CachedRepo {
    repo: GitRepository,
    state: tokio::sync::Mutex<RepoState>,
}

pub struct GitRenderer {
    cache_dir: PathBuf,
    credentials: Vec<RepoCredential>,
    fetch_interval: Duration,
    repos: Mutex<HashMap<String, Arc<CachedRepo>>>,
}

impl GitRenderer {
    pub fn new(cache_dir: impl Into<PathBuf>, credentials: Vec<RepoCredential>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            credentials,
            fetch_interval: DEFAULT_FETCH_INTERVAL,
            repos: Mutex::new(HashMap::new()),
        }
    }

    /// Minimum time between fetches of one repository.
    pub fn with_fetch_interval(mut self, interval: Duration) -> Self {
        self.fetch_interval = interval;
        self
    }

    fn repo(&self, url: &str) -> Arc<CachedRepo> {
        let mut repos = match self.repos.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(repos.entry(url.to_string()).or_insert_with(|| {
            Arc::new(CachedRepo {
                repo: GitRepository::new(url, &self.cache_dir, &parse::cache_key(url)),
                state: tokio::sync::Mutex::new(RepoState::default()),
            })
        }))
    }

    fn auth(&self, url: &str) -> Result<AuthEnv, RenderError> {
        build_auth_env(credential_for(&self.credentials, url))
    }

    async fn refresh(
        &self,
        cached: &CachedRepo,
        state: &mut RepoState,
        force: bool,
    ) -> Result<(), RenderError> {
        let fresh = state
            .last_fetch
            .is_some_and(|t| t.elapsed() < self.fetch_interval);
        if fresh && !force {
            return Ok(());
        }
        let auth = self.auth(cached.repo.url())?;
        if cached.repo.is_cloned() {
            cached.repo.fetch(&auth).await?;
        } else {
            cached.repo.ensure_cloned(&auth).await?;
        }
        state.last_fetch = Some(Instant::now());
        Ok(())
    }

    async fn checkout(
        &self,
        cached: &CachedRepo,
        state: &mut RepoState,
        commit: &str,
    ) -> Result<PathBuf, RenderError> {
        let path = cached.repo.worktree(commit).await?;
        state.worktrees.retain(|c| c != commit);
        state.worktrees.push_back(commit.to_string());
        while state.worktrees.len() > WORKTREES_PER_REPO {
            if let Some(old) = state.worktrees.pop_front() {
                cached.repo.remove_worktree(&old).await?;
            }
        }
        Ok(path)
    }
}

#[async_trait]
impl Renderer for GitRenderer {
    async fn resolve_revision(&self, source: &ApplicationSource) -> Result<String, RenderError> {
        let cached = self.repo(&source.repo_url);
        let mut state = cached.state.lock().await;
        let target = source.target_revision.trim();

        // Commit ids are immutable: no fetch when already present.
        if parse::is_commit_sha(target) && cached.repo.is_cloned() {
            if let Some(sha) = cached.repo.rev_parse(target).await? {
                return Ok(sha);
            }
        }
        self.refresh(&cached, &mut state, false).await?;
        cached
            .repo
            .rev_parse(target)
            .await?
            .ok_or_else(|| RenderError::RevisionNotFound {
                repo: source.repo_url.clone(),
                revision: target.to_string(),
            })
    }

    async fn render(
        &self,
        source: &ApplicationSource,
        revision: &str,
        ctx: &RenderContext,
    ) -> Result<Vec<Manifest>, RenderError> {
        let cached = self.repo(&source.repo_url);
        let mut state = cached.state.lock().await;
        if cached.repo.rev_parse(revision).await?.is_none() {
            self.refresh(&cached, &mut state, true).await?;
        }
        let commit = cached
            .repo
            .rev_parse(revision)
            .await?
            .ok_or_else(|| RenderError::RevisionNotFound {
                repo: source.repo_url.clone(),
                revision: revision.to_string(),
            })?;
        let root = self.checkout(&cached, &mut state, &commit).await?;
        let dir = directory::safe_join(&root, &source.path)?;
        drop(state);
        render_tree(&dir, source, ctx).await
    }
}
