//! The Project resource: the RBAC boundary for Applications.

use serde::{Deserialize, Serialize};

use super::Resource;

pub type Project = Resource<ProjectSpec>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Glob patterns of permitted repository URLs.
    #[serde(default)]
    pub source_repos: Vec<String>,

    #[serde(default)]
    pub destinations: Vec<ProjectDestination>,

    /// Cluster-scoped kinds an Application may deploy. Empty denies all.
    #[serde(default)]
    pub cluster_resource_whitelist: Vec<GroupKind>,

    /// Namespaced kinds an Application may not deploy.
    #[serde(default)]
    pub namespace_resource_blacklist: Vec<GroupKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectDestination {
    /// Glob of permitted cluster endpoints.
    #[serde(default = "any")]
    pub server: String,

    /// Glob of permitted namespaces.
    #[serde(default = "any")]
    pub namespace: String,
}

fn any() -> String {
    "*".to_string()
}

/// A (group, kind) pair where either side may be `*`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupKind {
    #[serde(default)]
    pub group: String,
    pub kind: String,
}

impl GroupKind {
    pub fn new(group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
        }
    }

    pub fn matches(&self, group: &str, kind: &str) -> bool {
        (self.group == "*" || self.group == group) && (self.kind == "*" || self.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_project() {
        let yaml = r#"
apiVersion: keel.io/v1
kind: Project
metadata:
  name: platform
  namespace: keel
spec:
  sourceRepos: ["https://git.example.com/*"]
  destinations:
    - namespace: "platform-*"
  clusterResourceWhitelist:
    - group: ""
      kind: Namespace
"#;
        let project: Project = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(project.spec.destinations[0].server, "*");
        assert_eq!(project.spec.destinations[0].namespace, "platform-*");
        assert!(project.spec.cluster_resource_whitelist[0].matches("", "Namespace"));
    }

    #[test]
    fn test_group_kind_wildcards() {
        assert!(GroupKind::new("*", "*").matches("apps", "Deployment"));
        assert!(GroupKind::new("", "*").matches("", "Namespace"));
        assert!(!GroupKind::new("", "*").matches("rbac.authorization.k8s.io", "ClusterRole"));
    }
}
