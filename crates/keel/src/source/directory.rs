//! Plain-manifest directories.

use glob::Pattern;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use super::RenderError;
use crate::resource::{DirectorySource, Manifest, Resource, ResourceKind};

/// File that selects which entries of a directory are rendered.
pub const COMPONENTS_FILE: &str = "components.yaml";

const MANIFEST_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentListSpec {
    /// Files or sub-directories relative to the list's directory.
    #[serde(default)]
    pub components: Vec<String>,
}

pub type ComponentList = Resource<ComponentListSpec>;

/// Renders every manifest below `root`, in sorted walk order.
pub fn render_directory(root: &Path, opts: &DirectorySource) -> Result<Vec<Manifest>, RenderError> {
    if !root.is_dir() {
        return Err(RenderError::PathNotFound(root.to_path_buf()));
    }
    let include = opts.include.as_deref().map(compile_globs).transpose()?;
    let exclude = opts.exclude.as_deref().map(compile_globs).transpose()?;

    if let Some(components) = load_component_list(root)? {
        log::debug!(
            "Rendering {} listed component(s) in {}",
            components.spec.components.len(),
            root.display()
        );
        let mut manifests = Vec::new();
        for entry in &components.spec.components {
            let path = safe_join(root, entry)?;
            if path.is_dir() {
                manifests.extend(walk(root, &path, true, &include, &exclude)?);
            } else if path.is_file() {
                manifests.extend(load_file(&path)?);
            } else {
                return Err(RenderError::PathNotFound(path));
            }
        }
        return Ok(manifests);
    }

    walk(root, root, opts.recurse, &include, &exclude)
}

fn walk(
    root: &Path,
    dir: &Path,
    recurse: bool,
    include: &Option<Vec<Pattern>>,
    exclude: &Option<Vec<Pattern>>,
) -> Result<Vec<Manifest>, RenderError> {
    let mut walker = WalkDir::new(dir).follow_links(true).sort_by_file_name();
    if !recurse {
        walker = walker.max_depth(1);
    }
    let mut manifests = Vec::new();
    for entry in walker.into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let relative = path.strip_prefix(root).unwrap_or(path);
        if is_hidden(relative) || !has_manifest_extension(path) {
            continue;
        }
        if relative == Path::new(COMPONENTS_FILE) {
            continue;
        }
        let rel = relative.to_string_lossy();
        if let Some(patterns) = include {
            if !patterns.iter().any(|p| p.matches(&rel)) {
                continue;
            }
        }
        if let Some(patterns) = exclude {
            if patterns.iter().any(|p| p.matches(&rel)) {
                log::trace!("Excluded {}", rel);
                continue;
            }
        }
        manifests.extend(load_file(path)?);
    }
    Ok(manifests)
}

/// Parses one manifest file.
pub fn load_file(path: &Path) -> Result<Vec<Manifest>, RenderError> {
    let content = fs::read_to_string(path).map_err(|e| RenderError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;
    let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
    if is_json {
        let value: Value = serde_json::from_str(&content).map_err(|e| RenderError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let mut out = Vec::new();
        push_document(value, path, &mut out)?;
        Ok(out)
    } else {
        parse_documents(&content, path)
    }
}

/// Splits multi-document YAML into manifests, dropping empty documents and
/// flattening `List` kinds.
pub fn parse_documents(content: &str, path: &Path) -> Result<Vec<Manifest>, RenderError> {
    let mut out = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(content) {
        let yaml = serde_yaml::Value::deserialize(doc).map_err(|e| RenderError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        if yaml.is_null() {
            continue;
        }
        let value = serde_json::to_value(yaml).map_err(|e| RenderError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        push_document(value, path, &mut out)?;
    }
    Ok(out)
}

fn push_document(value: Value, path: &Path, out: &mut Vec<Manifest>) -> Result<(), RenderError> {
    if value.is_null() {
        return Ok(());
    }
    if value.get("kind").and_then(Value::as_str) == Some("List") {
        if let Some(Value::Array(items)) = value.get("items") {
            for item in items {
                push_document(item.clone(), path, out)?;
            }
        }
        return Ok(());
    }
    let manifest = Manifest::from_value(value).map_err(|message| RenderError::InvalidManifest {
        path: path.to_path_buf(),
        message,
    })?;
    out.push(manifest);
    Ok(())
}

fn load_component_list(root: &Path) -> Result<Option<ComponentList>, RenderError> {
    let path = root.join(COMPONENTS_FILE);
    if !path.is_file() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path).map_err(|e| RenderError::ReadFile {
        path: path.clone(),
        source: e,
    })?;
    let list: ComponentList = serde_yaml::from_str(&content).map_err(|e| RenderError::Parse {
        path: path.clone(),
        message: e.to_string(),
    })?;
    if list.kind != ResourceKind::ComponentList {
        return Err(RenderError::InvalidManifest {
            path,
            message: format!("expected kind ComponentList, found {}", list.kind),
        });
    }
    Ok(Some(list))
}

/// Joins a relative path below `root`, refusing absolute paths and `..`.
pub fn safe_join(root: &Path, relative: &str) -> Result<PathBuf, RenderError> {
    let rel = Path::new(relative);
    if rel.is_absolute()
        || rel
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
    {
        return Err(RenderError::InvalidSource(format!(
            "path '{}' escapes the source root",
            relative
        )));
    }
    Ok(root.join(rel))
}

/// `{a,b}` expands to both globs.
fn compile_globs(raw: &str) -> Result<Vec<Pattern>, RenderError> {
    let trimmed = raw.trim();
    let parts: Vec<&str> = match trimmed.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
        Some(inner) => inner.split(',').map(str::trim).collect(),
        None => vec![trimmed],
    };
    parts
        .into_iter()
        .filter(|p| !p.is_empty())
        .map(|p| {
            Pattern::new(p)
                .map_err(|e| RenderError::InvalidSource(format!("invalid glob '{}': {}", p, e)))
        })
        .collect()
}

fn is_hidden(relative: &Path) -> bool {
    relative.components().any(|c| {
        c.as_os_str()
            .to_str()
            .map(|s| s.starts_with('.') && s != "." && s != "..")
            .unwrap_or(false)
    })
}

fn has_manifest_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| MANIFEST_EXTENSIONS.contains(&e))
}

/// Fingerprint of every file below `root`, used as the revision of local
/// sources.
pub fn content_revision(root: &Path) -> Result<String, RenderError> {
    if !root.exists() {
        return Err(RenderError::PathNotFound(root.to_path_buf()));
    }
    let mut hasher = DefaultHasher::new();
    for entry in WalkDir::new(root)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        if !path.is_file() || is_hidden(relative) {
            continue;
        }
        relative.hash(&mut hasher);
        let bytes = fs::read(path).map_err(|e| RenderError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        bytes.hash(&mut hasher);
    }
    Ok(format!("{:016x}", hasher.finish()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    const CM_A: &str = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n";
    const CM_B: &str = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: b\n";

    fn names(manifests: &[Manifest]) -> Vec<String> {
        manifests.iter().map(|m| m.name().to_string()).collect()
    }

    #[test]
    fn test_multi_document_and_list() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "all.yaml",
            &format!(
                "{}---\n---\n{}---\napiVersion: v1\nkind: List\nitems:\n- apiVersion: v1\n  kind: Secret\n  metadata:\n    name: c\n",
                CM_A, CM_B
            ),
        );
        let manifests = render_directory(dir.path(), &DirectorySource::default()).unwrap();
        assert_eq!(names(&manifests), vec!["a", "b", "c"]);
        assert_eq!(manifests[2].kind(), "Secret");
    }

    #[test]
    fn test_recurse_include_exclude_and_hidden() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.yaml", CM_A);
        write(dir.path(), "nested/b.yml", CM_B);
        write(dir.path(), "nested/skip.json", r#"{"apiVersion":"v1","kind":"ConfigMap","metadata":{"name":"skip"}}"#);
        write(dir.path(), ".hidden/c.yaml", CM_A);
        write(dir.path(), "README.md", "# not a manifest");

        let flat = render_directory(dir.path(), &DirectorySource::default()).unwrap();
        assert_eq!(names(&flat), vec!["a"]);

        let opts = DirectorySource {
            recurse: true,
            include: None,
            exclude: Some("{*.json,other/*}".into()),
        };
        assert_eq!(names(&render_directory(dir.path(), &opts).unwrap()), vec!["a", "b"]);

        let opts = DirectorySource {
            recurse: true,
            include: Some("nested/*".into()),
            exclude: None,
        };
        assert_eq!(
            names(&render_directory(dir.path(), &opts).unwrap()),
            vec!["b", "skip"]
        );
    }

    #[test]
    fn test_component_list_selects_entries() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "cert-manager/app.yaml", CM_A);
        write(dir.path(), "ingress/app.yaml", CM_B);
        write(
            dir.path(),
            COMPONENTS_FILE,
            "apiVersion: keel.io/v1\nkind: ComponentList\nmetadata:\n  name: infra\nspec:\n  components:\n  # - ingress\n  - cert-manager\n",
        );
        let manifests = render_directory(dir.path(), &DirectorySource::default()).unwrap();
        assert_eq!(names(&manifests), vec!["a"]);
    }

    #[test]
    fn test_component_list_rejects_traversal() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            COMPONENTS_FILE,
            "apiVersion: keel.io/v1\nkind: ComponentList\nmetadata:\n  name: x\nspec:\n  components: [\"../etc\"]\n",
        );
        let err = render_directory(dir.path(), &DirectorySource::default()).unwrap_err();
        assert!(matches!(err, RenderError::InvalidSource(_)));
    }

    #[test]
    fn test_invalid_manifest_names_file() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "bad.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n");
        let err = render_directory(dir.path(), &DirectorySource::default()).unwrap_err();
        assert!(matches!(err, RenderError::InvalidManifest { .. }));
        assert!(err.to_string().contains("bad.yaml"));

        write(dir.path(), "bad.yaml", "kind: [unclosed");
        assert!(matches!(
            render_directory(dir.path(), &DirectorySource::default()).unwrap_err(),
            RenderError::Parse { .. }
        ));
    }

    #[test]
    fn test_missing_directory() {
        let err = render_directory(Path::new("/nonexistent/keel"), &DirectorySource::default())
            .unwrap_err();
        assert!(matches!(err, RenderError::PathNotFound(_)));
    }

    #[test]
    fn test_content_revision_tracks_changes() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.yaml", CM_A);
        let first = content_revision(dir.path()).unwrap();
        assert_eq!(first, content_revision(dir.path()).unwrap());
        write(dir.path(), "a.yaml", CM_B);
        assert_ne!(first, content_revision(dir.path()).unwrap());
    }
}
