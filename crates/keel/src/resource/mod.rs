//! K8s-style resource types consumed and produced by the reconciler.
//!
//! Two families live here:
//! - typed keel resources (`Application`, `Project`, `ControllerConfig`,
//!   `ComponentList`) wrapped in [`Resource`]
//! - untyped cluster objects ([`Manifest`]) identified by [`ResourceKey`]

pub mod annotations;
pub mod application;
pub mod manifest;
pub mod project;
pub mod scope;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use annotations::{
    HealthGate, HookDeletePolicy, HookPhase, ResourceSyncOptions, SyncOptions, TrackingId,
};
pub use application::{
    AppHealth, Application, ApplicationCondition, ApplicationDestination, ApplicationSource,
    ApplicationSpec, ApplicationStatus, AutomatedSync, ConditionType, DirectorySource,
    HelmParameter, HelmSource, HookRecord, InitiatedBy, KustomizeSource, OperationPhase,
    OperationState, ResourceIgnoreDifferences, ResourceResult, ResourceResultCode,
    ResourceStatus, RetrySpec, BackoffSpec, RevisionHistory, HISTORY_LIMIT, SyncPolicy, SyncStatus,
    SyncStatusCode, RESOURCES_FINALIZER,
};
pub use manifest::{Manifest, ResourceKey};
pub use project::{GroupKind, Project, ProjectDestination, ProjectSpec};

/// The API version for all keel resources.
pub const API_VERSION: &str = "keel.io/v1";

/// The API group for all keel resources.
pub const GROUP: &str = "keel.io";

/// The kind of keel resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Application,
    Project,
    ControllerConfig,
    ComponentList,
}

impl ResourceKind {
    pub fn all() -> &'static [ResourceKind] {
        &[
            ResourceKind::Application,
            ResourceKind::Project,
            ResourceKind::ControllerConfig,
            ResourceKind::ComponentList,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Application => "Application",
            ResourceKind::Project => "Project",
            ResourceKind::ControllerConfig => "ControllerConfig",
            ResourceKind::ComponentList => "ComponentList",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "application" | "app" => Ok(ResourceKind::Application),
            "project" | "appproject" => Ok(ResourceKind::Project),
            "controllerconfig" => Ok(ResourceKind::ControllerConfig),
            "componentlist" => Ok(ResourceKind::ComponentList),
            _ => Err(format!("Unknown resource kind: {}", s)),
        }
    }
}

/// Metadata for a resource, following K8s conventions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Finalizers block removal of the object until they are cleared.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,

    /// Set by the API server once deletion has been requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
}

impl ObjectMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn with_finalizer(mut self, finalizer: impl Into<String>) -> Self {
        self.finalizers.push(finalizer.into());
        self
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

/// A generic K8s-style resource wrapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource<S, T = ()> {
    /// API version, should always be `keel.io/v1`.
    pub api_version: String,

    pub kind: ResourceKind,

    pub metadata: ObjectMeta,

    pub spec: S,

    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    pub status: Option<T>,
}

impl<S, T> Resource<S, T> {
    pub fn new(kind: ResourceKind, name: impl Into<String>, spec: S) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind,
            metadata: ObjectMeta::new(name),
            spec,
            status: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }

    /// The cluster identity of this resource.
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(GROUP, self.kind.as_str(), self.namespace(), self.name())
    }
}

impl<S, T> Resource<S, T>
where
    S: Serialize + DeserializeOwned,
    T: Serialize + DeserializeOwned,
{
    /// Decodes a typed resource from a cluster object.
    pub fn from_manifest(manifest: &Manifest) -> Result<Self, String> {
        serde_json::from_value(manifest.as_value().clone())
            .map_err(|e| format!("{}: {}", manifest.key(), e))
    }

    pub fn to_manifest(&self) -> Result<Manifest, String> {
        let value = serde_json::to_value(self).map_err(|e| e.to_string())?;
        Manifest::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_kind_display() {
        assert_eq!(ResourceKind::Application.to_string(), "Application");
        assert_eq!(ResourceKind::ComponentList.to_string(), "ComponentList");
    }

    #[test]
    fn test_resource_kind_from_str() {
        assert_eq!(
            "application".parse::<ResourceKind>().unwrap(),
            ResourceKind::Application
        );
        assert_eq!(
            "AppProject".parse::<ResourceKind>().unwrap(),
            ResourceKind::Project
        );
        assert!("Deployment".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn test_object_meta_builders() {
        let meta = ObjectMeta::new("root")
            .with_namespace("keel")
            .with_label("tier", "infra")
            .with_finalizer(RESOURCES_FINALIZER);
        assert_eq!(meta.namespace.as_deref(), Some("keel"));
        assert_eq!(meta.labels.get("tier"), Some(&"infra".to_string()));
        assert_eq!(meta.finalizers, vec![RESOURCES_FINALIZER.to_string()]);
        assert!(!meta.is_deleting());
    }

    #[test]
    fn test_resource_key_uses_keel_group() {
        let mut project = Project::new(ResourceKind::Project, "default", ProjectSpec::default());
        project.metadata.namespace = Some("keel".into());
        assert_eq!(
            project.key(),
            ResourceKey::new("keel.io", "Project", "keel", "default")
        );
    }

    #[test]
    fn test_manifest_round_trip_keeps_unknown_status_absent() {
        let project = Project::new(ResourceKind::Project, "default", ProjectSpec::default());
        let manifest = project.to_manifest().unwrap();
        assert!(manifest.pointer("/status").is_none());
        let decoded = Project::from_manifest(&manifest).unwrap();
        assert_eq!(decoded.name(), "default");
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Phase {
        phase: String,
    }

    #[test]
    fn test_status_type_without_default_decodes() {
        let mut resource: Resource<ProjectSpec, Phase> =
            Resource::new(ResourceKind::Project, "default", ProjectSpec::default());
        let manifest = resource.to_manifest().unwrap();
        let decoded = Resource::<ProjectSpec, Phase>::from_manifest(&manifest).unwrap();
        assert_eq!(decoded.status, None);

        resource.status = Some(Phase {
            phase: "Ready".into(),
        });
        let decoded =
            Resource::<ProjectSpec, Phase>::from_manifest(&resource.to_manifest().unwrap()).unwrap();
        assert_eq!(decoded.status.unwrap().phase, "Ready");
    }
}
