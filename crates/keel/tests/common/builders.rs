//! Builder patterns for creating test data programmatically.
//!
//! These builders allow creating Applications and manifests without
//! repetitive boilerplate code.

#![allow(dead_code)]

use serde_json::{json, Map, Value};

use keel::resource::annotations::{HOOK, HOOK_DELETE_POLICY, SYNC_OPTIONS, SYNC_WAVE};
use keel::resource::{
    Application, ApplicationDestination, ApplicationSource, ApplicationSpec, AutomatedSync,
    BackoffSpec, ProjectDestination, ProjectSpec, ResourceKind, RetrySpec, SyncPolicy,
    RESOURCES_FINALIZER,
};
use keel::{Manifest, Project};

pub const REPO: &str = "https://git.example.com/platform.git";
pub const APP_NAMESPACE: &str = "keel";

/// Builder for creating `Application` instances.
pub struct AppBuilder {
    name: String,
    project: String,
    repo_url: String,
    path: String,
    destination: ApplicationDestination,
    automated: Option<AutomatedSync>,
    sync_options: Vec<String>,
    retry: Option<RetrySpec>,
    finalizer: bool,
}

impl AppBuilder {
    /// Create a new builder for an Application rendering `path` of the test repo
    /// into the `default` namespace.
    pub fn new(name: &str, path: &str) -> Self {
        Self {
            name: name.to_string(),
            project: "default".to_string(),
            repo_url: REPO.to_string(),
            path: path.to_string(),
            destination: ApplicationDestination::in_cluster("default"),
            automated: None,
            sync_options: Vec::new(),
            retry: None,
            finalizer: false,
        }
    }

    pub fn project(mut self, project: &str) -> Self {
        self.project = project.to_string();
        self
    }

    pub fn repo(mut self, repo_url: &str) -> Self {
        self.repo_url = repo_url.to_string();
        self
    }

    pub fn namespace(mut self, namespace: &str) -> Self {
        self.destination.namespace = namespace.to_string();
        self
    }

    pub fn server(mut self, server: &str) -> Self {
        self.destination.server = server.to_string();
        self
    }

    /// Enable automated sync.
    pub fn automated(mut self, prune: bool, self_heal: bool) -> Self {
        self.automated = Some(AutomatedSync {
            prune,
            self_heal,
            allow_empty: false,
        });
        self
    }

    pub fn sync_option(mut self, option: &str) -> Self {
        self.sync_options.push(option.to_string());
        self
    }

    /// Set a retry limit with a fixed backoff.
    pub fn retry(mut self, limit: i64, backoff: &str) -> Self {
        self.retry = Some(RetrySpec {
            limit,
            backoff: Some(BackoffSpec {
                duration: backoff.to_string(),
                factor: 1.0,
                max_duration: backoff.to_string(),
            }),
        });
        self
    }

    /// Request cascade deletion of the Application's resources.
    pub fn finalizer(mut self) -> Self {
        self.finalizer = true;
        self
    }

    pub fn build(self) -> Application {
        let sync_policy = (self.automated.is_some()
            || !self.sync_options.is_empty()
            || self.retry.is_some())
        .then(|| SyncPolicy {
            automated: self.automated,
            sync_options: self.sync_options,
            retry: self.retry,
        });
        let mut app = Application::new(
            ResourceKind::Application,
            &self.name,
            ApplicationSpec {
                project: self.project,
                source: ApplicationSource::new(self.repo_url, self.path),
                destination: self.destination,
                sync_policy,
                ignore_differences: Vec::new(),
            },
        );
        app.metadata.namespace = Some(APP_NAMESPACE.to_string());
        if self.finalizer {
            app.metadata.finalizers.push(RESOURCES_FINALIZER.to_string());
        }
        app
    }

    /// The Application as a manifest, for placing inside a parent's source.
    pub fn build_manifest(self) -> Manifest {
        self.build().to_manifest().expect("Failed to encode Application")
    }
}

/// Builder for creating `Project` instances.
pub struct ProjectBuilder {
    name: String,
    spec: ProjectSpec,
}

impl ProjectBuilder {
    /// A project permitting any repository and destination.
    pub fn permissive(name: &str) -> Self {
        Self {
            name: name.to_string(),
            spec: ProjectSpec {
                description: None,
                source_repos: vec!["*".to_string()],
                destinations: vec![ProjectDestination {
                    server: "*".to_string(),
                    namespace: "*".to_string(),
                }],
                cluster_resource_whitelist: Vec::new(),
                namespace_resource_blacklist: Vec::new(),
            },
        }
    }

    /// Replace the permitted destination namespaces.
    pub fn destination_namespaces(mut self, namespaces: &[&str]) -> Self {
        self.spec.destinations = namespaces
            .iter()
            .map(|ns| ProjectDestination {
                server: "*".to_string(),
                namespace: ns.to_string(),
            })
            .collect();
        self
    }

    pub fn build(self) -> Project {
        let mut project = Project::new(ResourceKind::Project, &self.name, self.spec);
        project.metadata.namespace = Some(APP_NAMESPACE.to_string());
        project
    }
}

/// Builder for plain resource manifests.
pub struct ManifestBuilder {
    api_version: String,
    kind: String,
    name: String,
    namespace: Option<String>,
    annotations: Map<String, Value>,
    body: Map<String, Value>,
}

impl ManifestBuilder {
    pub fn new(api_version: &str, kind: &str, name: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: None,
            annotations: Map::new(),
            body: Map::new(),
        }
    }

    pub fn config_map(name: &str) -> Self {
        Self::new("v1", "ConfigMap", name)
    }

    pub fn deployment(name: &str) -> Self {
        Self::new("apps/v1", "Deployment", name).field(
            "spec",
            json!({
                "replicas": 1,
                "selector": {"matchLabels": {"app": name}},
                "template": {
                    "metadata": {"labels": {"app": name}},
                    "spec": {"containers": [{"name": name, "image": format!("{}:1.0", name)}]}
                }
            }),
        )
    }

    pub fn job(name: &str) -> Self {
        Self::new("batch/v1", "Job", name).field(
            "spec",
            json!({
                "template": {"spec": {
                    "restartPolicy": "Never",
                    "containers": [{"name": name, "image": "busybox"}]
                }}
            }),
        )
    }

    pub fn namespace(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    pub fn annotation(mut self, key: &str, value: &str) -> Self {
        self.annotations
            .insert(key.to_string(), Value::String(value.to_string()));
        self
    }

    pub fn wave(self, wave: i32) -> Self {
        self.annotation(SYNC_WAVE, &wave.to_string())
    }

    pub fn hook(self, phase: &str) -> Self {
        self.annotation(HOOK, phase)
    }

    pub fn hook_delete_policy(self, policy: &str) -> Self {
        self.annotation(HOOK_DELETE_POLICY, policy)
    }

    pub fn sync_options(self, options: &str) -> Self {
        self.annotation(SYNC_OPTIONS, options)
    }

    /// Set a top-level field such as `data` or `spec`.
    pub fn field(mut self, key: &str, value: Value) -> Self {
        self.body.insert(key.to_string(), value);
        self
    }

    pub fn data(mut self, key: &str, value: &str) -> Self {
        let data = self
            .body
            .entry("data".to_string())
            .or_insert_with(|| json!({}));
        if let Some(map) = data.as_object_mut() {
            map.insert(key.to_string(), Value::String(value.to_string()));
        }
        self
    }

    pub fn build(self) -> Manifest {
        let mut metadata = Map::new();
        metadata.insert("name".to_string(), Value::String(self.name));
        if let Some(ns) = self.namespace {
            metadata.insert("namespace".to_string(), Value::String(ns));
        }
        if !self.annotations.is_empty() {
            metadata.insert("annotations".to_string(), Value::Object(self.annotations));
        }
        let mut object = Map::new();
        object.insert("apiVersion".to_string(), Value::String(self.api_version));
        object.insert("kind".to_string(), Value::String(self.kind));
        object.insert("metadata".to_string(), Value::Object(metadata));
        object.extend(self.body);
        Manifest::from_value(Value::Object(object)).expect("Failed to build manifest")
    }
}

/// Status of a Deployment whose rollout has finished.
pub fn rolled_out(generation: i64) -> Value {
    json!({
        "observedGeneration": generation,
        "replicas": 1,
        "updatedReplicas": 1,
        "readyReplicas": 1,
        "availableReplicas": 1
    })
}

/// Status of a finished Job.
pub fn job_finished(succeeded: bool) -> Value {
    let type_ = if succeeded { "Complete" } else { "Failed" };
    json!({
        "conditions": [{
            "type": type_,
            "status": "True",
            "message": if succeeded { "" } else { "BackoffLimitExceeded" }
        }]
    })
}
