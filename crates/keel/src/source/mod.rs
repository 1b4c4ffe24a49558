//! Rendering of Application sources into desired sets.
//!
//! A [`Renderer`] turns a source locator at a resolved revision into an
//! ordered list of manifests. Rendering is deterministic for a fixed
//! (repoURL, revision, path, parameters) tuple: files are read in sorted
//! walk order and documents in file order.

pub mod directory;
pub mod error;
pub mod git;
pub mod memory;
pub mod tool;
pub mod watcher;

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::resource::{Application, ApplicationSource, Manifest};

pub use error::{classify_git_error, RenderError};
pub use git::GitRenderer;
pub use memory::MemoryRenderer;
pub use tool::SourceType;
pub use watcher::{AsyncSourceWatcher, SourceChange, SourceWatcher};

/// Identity of the Application a source is rendered for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderContext {
    pub app_namespace: String,
    pub app_name: String,
    pub destination_namespace: String,
}

impl RenderContext {
    pub fn new(
        app_namespace: impl Into<String>,
        app_name: impl Into<String>,
        destination_namespace: impl Into<String>,
    ) -> Self {
        Self {
            app_namespace: app_namespace.into(),
            app_name: app_name.into(),
            destination_namespace: destination_namespace.into(),
        }
    }

    pub fn for_app(app: &Application) -> Self {
        Self::new(app.namespace(), app.name(), &app.spec.destination.namespace)
    }
}

/// Produces desired sets from source locators.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Resolves `targetRevision` to an immutable revision id.
    async fn resolve_revision(&self, source: &ApplicationSource) -> Result<String, RenderError>;

    /// Renders `source` at a revision returned by `resolve_revision`.
    async fn render(
        &self,
        source: &ApplicationSource,
        revision: &str,
        ctx: &RenderContext,
    ) -> Result<Vec<Manifest>, RenderError>;
}

/// Renders a checked-out tree, choosing helm, kustomize or plain files.
pub async fn render_tree(
    dir: &Path,
    source: &ApplicationSource,
    ctx: &RenderContext,
) -> Result<Vec<Manifest>, RenderError> {
    if !dir.is_dir() {
        return Err(RenderError::PathNotFound(dir.to_path_buf()));
    }
    match tool::detect(dir, source.helm.as_ref(), source.kustomize.as_ref()) {
        SourceType::Helm => tool::helm_template(dir, &source.helm.clone().unwrap_or_default(), ctx).await,
        SourceType::Kustomize => tool::kustomize_build(dir, source.kustomize.as_ref()).await,
        SourceType::Directory => {
            let opts = source.directory.clone().unwrap_or_default();
            let dir = dir.to_path_buf();
            tokio::task::spawn_blocking(move || directory::render_directory(&dir, &opts))
                .await
                .map_err(|e| RenderError::InvalidSource(format!("render task failed: {}", e)))?
        }
    }
}

/// Renders sources that live on the local filesystem.
///
/// `repoURL` is a path or a `file://` URL; the revision is a fingerprint
/// of the rendered directory's contents.
#[derive(Debug, Clone, Default)]
pub struct DirectoryRenderer {
    base: Option<PathBuf>,
}

impl DirectoryRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Relative repository paths are resolved against `base`.
    pub fn with_base(base: impl Into<PathBuf>) -> Self {
        Self {
            base: Some(base.into()),
        }
    }

    pub fn is_local(repo_url: &str) -> bool {
        repo_url.starts_with("file://") || repo_url.starts_with('/') || repo_url.starts_with('.')
    }

    pub fn repo_root(&self, repo_url: &str) -> PathBuf {
        let raw = repo_url.strip_prefix("file://").unwrap_or(repo_url);
        let path = PathBuf::from(crate::secrets::expand_home(raw));
        match &self.base {
            Some(base) if path.is_relative() => base.join(path),
            _ => path,
        }
    }

    fn source_dir(&self, source: &ApplicationSource) -> Result<PathBuf, RenderError> {
        let root = self.repo_root(&source.repo_url);
        if !root.is_dir() {
            return Err(RenderError::RepositoryNotFound(source.repo_url.clone()));
        }
        directory::safe_join(&root, &source.path)
    }
}

#[async_trait]
impl Renderer for DirectoryRenderer {
    async fn resolve_revision(&self, source: &ApplicationSource) -> Result<String, RenderError> {
        let dir = self.source_dir(source)?;
        if !dir.exists() {
            return Err(RenderError::PathNotFound(dir));
        }
        tokio::task::spawn_blocking(move || directory::content_revision(&dir))
            .await
            .map_err(|e| RenderError::InvalidSource(format!("revision task failed: {}", e)))?
    }

    async fn render(
        &self,
        source: &ApplicationSource,
        _revision: &str,
        ctx: &RenderContext,
    ) -> Result<Vec<Manifest>, RenderError> {
        let dir = self.source_dir(source)?;
        render_tree(&dir, source, ctx).await
    }
}

/// Dispatches local sources to a [`DirectoryRenderer`] and everything else
/// to a remote renderer.
pub struct SourceRouter {
    local: DirectoryRenderer,
    remote: Box<dyn Renderer>,
}

impl SourceRouter {
    pub fn new(local: DirectoryRenderer, remote: impl Renderer + 'static) -> Self {
        Self {
            local,
            remote: Box::new(remote),
        }
    }

    fn pick(&self, source: &ApplicationSource) -> &dyn Renderer {
        if DirectoryRenderer::is_local(&source.repo_url) {
            &self.local
        } else {
            self.remote.as_ref()
        }
    }
}

#[async_trait]
impl Renderer for SourceRouter {
    async fn resolve_revision(&self, source: &ApplicationSource) -> Result<String, RenderError> {
        self.pick(source).resolve_revision(source).await
    }

    async fn render(
        &self,
        source: &ApplicationSource,
        revision: &str,
        ctx: &RenderContext,
    ) -> Result<Vec<Manifest>, RenderError> {
        self.pick(source).render(source, revision, ctx).await
    }
}

/// Turns rendered manifests into an Application's desired set.
///
/// The Application's own manifest is dropped so an App of Apps can keep
/// itself in the tree it renders. Namespaced resources without a
/// namespace receive the destination namespace.
pub fn prepare_desired(app: &Application, rendered: Vec<Manifest>) -> Vec<Manifest> {
    let own_key = app.key();
    rendered
        .into_iter()
        .filter_map(|mut manifest| {
            manifest.default_namespace(&app.spec.destination.namespace);
            if manifest.key().is_application() && manifest.name() == app.name() {
                let ns = manifest.namespace().unwrap_or_default();
                if ns == app.namespace() || ns.is_empty() || manifest.key() == own_key {
                    log::warn!(
                        "Skipping own manifest {}/{} in rendered source",
                        app.namespace(),
                        app.name()
                    );
                    return None;
                }
            }
            Some(manifest)
        })
        .collect()
}
