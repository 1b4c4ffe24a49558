//! Helm and kustomize sources, rendered by their own binaries.

use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use super::directory::parse_documents;
use super::{RenderContext, RenderError};
use crate::diff::pointer;
use crate::resource::{HelmSource, KustomizeSource, Manifest};

const TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// Directory layout that decides how a source path is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    Directory,
    Helm,
    Kustomize,
}

pub fn detect(dir: &Path, helm: Option<&HelmSource>, kustomize: Option<&KustomizeSource>) -> SourceType {
    if helm.is_some() || dir.join("Chart.yaml").is_file() {
        SourceType::Helm
    } else if kustomize.is_some()
        || ["kustomization.yaml", "kustomization.yml", "Kustomization"]
            .iter()
            .any(|f| dir.join(f).is_file())
    {
        SourceType::Kustomize
    } else {
        SourceType::Directory
    }
}

/// Runs `helm template` for the chart in `dir`.
pub async fn helm_template(
    dir: &Path,
    helm: &HelmSource,
    ctx: &RenderContext,
) -> Result<Vec<Manifest>, RenderError> {
    let release = helm
        .release_name
        .clone()
        .unwrap_or_else(|| ctx.app_name.clone());
    let mut args: Vec<String> = vec![
        "template".into(),
        release,
        ".".into(),
        "--namespace".into(),
        ctx.destination_namespace.clone(),
    ];
    for file in &helm.value_files {
        super::directory::safe_join(dir, file)?;
        args.push("--values".into());
        args.push(file.clone());
    }
    for param in &helm.parameters {
        args.push("--set".into());
        args.push(format!("{}={}", param.name, param.value));
    }
    let output = run_tool("helm", &args, dir).await?;
    parse_documents(&output, &dir.join("Chart.yaml"))
}

/// Runs `kustomize build` in `dir` and applies the name prefix and image
/// overrides to the output.
pub async fn kustomize_build(
    dir: &Path,
    kustomize: Option<&KustomizeSource>,
) -> Result<Vec<Manifest>, RenderError> {
    let output = run_tool("kustomize", &["build".to_string(), ".".to_string()], dir).await?;
    let mut manifests = parse_documents(&output, &dir.join("kustomization.yaml"))?;
    if let Some(k) = kustomize {
        for manifest in &mut manifests {
            if let Some(prefix) = &k.name_prefix {
                let name = format!("{}{}", prefix, manifest.name());
                manifest
                    .metadata_mut()
                    .insert("name".into(), Value::String(name));
            }
            for image in &k.images {
                override_image(manifest, image);
            }
        }
    }
    Ok(manifests)
}

/// Applies an override in `name=newName:tag` or `name:tag` form to every
/// container using image `name`.
pub fn override_image(manifest: &mut Manifest, spec: &str) {
    let (name, replacement) = match spec.split_once('=') {
        Some((name, replacement)) => (name.to_string(), replacement.to_string()),
        None => (image_name(spec).to_string(), spec.to_string()),
    };
    for base in ["/spec/template/spec", "/spec/jobTemplate/spec/template/spec", "/spec"] {
        for list in ["containers", "initContainers"] {
            let path = format!("{}/{}", base, list);
            let count = manifest
                .pointer(&path)
                .and_then(Value::as_array)
                .map(Vec::len)
                .unwrap_or(0);
            for i in 0..count {
                let image_path = format!("{}/{}/image", path, i);
                let matches = manifest
                    .str_at(&image_path)
                    .is_some_and(|current| image_name(current) == name);
                if matches {
                    pointer::set(manifest.as_value_mut(), &image_path, Value::String(replacement.clone()));
                }
            }
        }
    }
}

/// Image reference without tag or digest.
fn image_name(image: &str) -> &str {
    let without_digest = image.split('@').next().unwrap_or(image);
    match without_digest.rfind(':') {
        Some(idx) if !without_digest[idx..].contains('/') => &without_digest[..idx],
        _ => without_digest,
    }
}

async fn run_tool(tool: &str, args: &[String], dir: &Path) -> Result<String, RenderError> {
    log::debug!("Running {} {} in {}", tool, args.join(" "), dir.display());
    let child = Command::new(tool)
        .args(args)
        .current_dir(dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => RenderError::ToolMissing {
                tool: tool.to_string(),
            },
            _ => RenderError::ToolFailed {
                tool: tool.to_string(),
                message: e.to_string(),
            },
        })?;
    let output = tokio::time::timeout(TOOL_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| RenderError::ToolFailed {
            tool: tool.to_string(),
            message: format!("timed out after {}s", TOOL_TIMEOUT.as_secs()),
        })?
        .map_err(|e| RenderError::ToolFailed {
            tool: tool.to_string(),
            message: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(RenderError::ToolFailed {
            tool: tool.to_string(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
