//! Project RBAC gate.
//!
//! Runs before anything touches the cluster. An Application is permitted
//! only if its Project allows its source repository, its destination and
//! every resource of its desired set.

use glob::Pattern;

use crate::error::SyncError;
use crate::resource::{Application, GroupKind, Manifest, Project, ResourceKey, GROUP};

/// Key of the Project an Application references. Projects live next to
/// the Applications that use them.
pub fn project_key(app: &Application) -> ResourceKey {
    ResourceKey::new(GROUP, "Project", app.namespace(), &app.spec.project)
}

/// Checks against one Project.
pub struct ProjectGate<'a> {
    project: &'a Project,
}

impl<'a> ProjectGate<'a> {
    pub fn new(project: &'a Project) -> Self {
        Self { project }
    }

    /// Patterns prefixed with `!` deny and take precedence.
    pub fn permits_source(&self, repo_url: &str) -> bool {
        let repo = normalize_repo(repo_url);
        let mut allowed = false;
        for raw in &self.project.spec.source_repos {
            match raw.strip_prefix('!') {
                Some(deny) if glob_matches(&normalize_repo(deny), &repo) => return false,
                Some(_) => {}
                None => allowed |= glob_matches(&normalize_repo(raw), &repo),
            }
        }
        allowed
    }

    pub fn permits_destination(&self, server: &str, namespace: &str) -> bool {
        self.project
            .spec
            .destinations
            .iter()
            .any(|d| glob_matches(&d.server, server) && glob_matches(&d.namespace, namespace))
    }

    pub fn permits_kind(&self, group: &str, kind: &str, cluster_scoped: bool) -> bool {
        if cluster_scoped {
            self.project
                .spec
                .cluster_resource_whitelist
                .iter()
                .any(|gk| gk.matches(group, kind))
        } else {
            !self
                .project
                .spec
                .namespace_resource_blacklist
                .iter()
                .any(|gk: &GroupKind| gk.matches(group, kind))
        }
    }

    /// Source and destination checks, available before rendering.
    pub fn check_application(&self, app: &Application) -> Result<(), SyncError> {
        let mut violations = Vec::new();
        if !self.permits_source(&app.spec.source.repo_url) {
            violations.push(format!(
                "source repository '{}' is not permitted in project '{}'",
                app.spec.source.repo_url,
                self.project.name()
            ));
        }
        let dest = &app.spec.destination;
        if !self.permits_destination(&dest.server, &dest.namespace) {
            violations.push(format!(
                "destination {} namespace '{}' is not permitted in project '{}'",
                dest.server,
                dest.namespace,
                self.project.name()
            ));
        }
        into_result(violations)
    }

    /// Checks every resource of the desired set.
    pub fn check_resources(&self, app: &Application, desired: &[Manifest]) -> Result<(), SyncError> {
        let server = &app.spec.destination.server;
        let mut violations = Vec::new();
        for manifest in desired {
            let key = manifest.key();
            let cluster_scoped = manifest.is_cluster_scoped();
            if !self.permits_kind(&key.group, &key.kind, cluster_scoped) {
                violations.push(if cluster_scoped {
                    format!(
                        "cluster-scoped {} is not in the cluster resource whitelist",
                        key.group_kind()
                    )
                } else {
                    format!("{} is blacklisted", key.group_kind())
                });
                continue;
            }
            if !cluster_scoped && !self.permits_destination(server, &key.namespace) {
                violations.push(format!(
                    "{} targets namespace '{}' which is not permitted",
                    key, key.namespace
                ));
            }
        }
        into_result(violations)
    }
}

/// Full gate for one cycle. A missing Project denies.
pub fn authorize(
    app: &Application,
    project: Option<&Project>,
    desired: &[Manifest],
) -> Result<(), SyncError> {
    let Some(project) = project else {
        return Err(SyncError::rbac(format!(
            "project '{}' does not exist in namespace '{}'",
            app.spec.project,
            app.namespace()
        )));
    };
    let gate = ProjectGate::new(project);
    gate.check_application(app)?;
    gate.check_resources(app, desired)
}

fn into_result(violations: Vec<String>) -> Result<(), SyncError> {
    if violations.is_empty() {
        Ok(())
    } else {
        Err(SyncError::rbac(violations.join("; ")))
    }
}

fn glob_matches(pattern: &str, value: &str) -> bool {
    if pattern == "*" || pattern == value {
        return true;
    }
    match Pattern::new(pattern) {
        Ok(p) => p.matches(value),
        Err(e) => {
            log::warn!("Ignoring invalid project pattern '{}': {}", pattern, e);
            false
        }
    }
}

/// Trailing `.git` and `/` do not change repository identity.
fn normalize_repo(url: &str) -> String {
    url.trim()
        .trim_end_matches('/')
        .trim_end_matches(".git")
        .to_string()
}
