//! Context resolution
//!
//! Expands a Task's ordered `ContextItem` sequence into a concrete, ordered
//! set of workspace files. Inline content (text, ConfigMap data, runtime
//! values) is resolved here; git checkouts and URL fetches are validated
//! here but realized by the pod's init container so clone time never blocks
//! the control loop.

use crate::crds::{ContextItem, Task};
use crate::tasks::types::{Error, Result};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use std::collections::BTreeMap;

/// Reserved path the Task description is staged at
pub const DESCRIPTION_PATH: &str = ".task/description.md";

/// Where a resolved file's bytes come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextSource {
    /// Content known at resolution time, shipped via the context ConfigMap
    Inline(String),
    /// Shallow clone performed by the init container
    GitClone { repository: String, revision: String },
    /// HTTP fetch performed by the init container with bounded retries
    UrlFetch { url: String },
}

/// One resolved `(relative path, source)` pair, in declaration order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFile {
    pub path: String,
    pub source: ContextSource,
}

impl ResolvedFile {
    pub fn is_inline(&self) -> bool {
        matches!(self.source, ContextSource::Inline(_))
    }
}

/// Reject absolute paths, parent traversal and empty segments. Returns the
/// normalized relative path.
fn validate_path(raw: &str) -> Result<String> {
    if raw.is_empty() {
        return Err(Error::ResolutionError("context path is empty".to_string()));
    }
    if raw.starts_with('/') {
        return Err(Error::ResolutionError(format!(
            "context path '{raw}' must be relative"
        )));
    }
    for segment in raw.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(Error::ResolutionError(format!(
                "context path '{raw}' contains an invalid segment"
            )));
        }
    }
    Ok(raw.to_string())
}

/// Remote references end up interpolated into the init container's shell
/// script, so anything that could escape a word is rejected outright.
fn validate_remote_ref(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::ResolutionError(format!("{kind} is empty")));
    }
    if value.chars().any(|c| {
        c.is_whitespace()
            || matches!(
                c,
                '\'' | '"' | '`' | '$' | ';' | '&' | '|' | '<' | '>' | '\\' | '(' | ')'
            )
    }) {
        return Err(Error::ResolutionError(format!(
            "{kind} '{value}' contains characters that are not allowed"
        )));
    }
    Ok(())
}

fn validate_url(url: &str) -> Result<()> {
    validate_remote_ref("url", url)?;
    if !url.starts_with("https://") && !url.starts_with("http://") {
        return Err(Error::ResolutionError(format!(
            "url '{url}' must use http or https"
        )));
    }
    Ok(())
}

/// Runtime values are a pure function of the Task's observed state. The
/// creation timestamp is used instead of the wall clock so re-resolving the
/// same Task yields byte-identical content.
fn render_runtime(task: &Task) -> String {
    let created = task
        .metadata
        .creation_timestamp
        .as_ref()
        .map(|t| t.0.to_rfc3339())
        .unwrap_or_default();
    let value = json!({
        "taskName": task.name_any(),
        "taskNamespace": task.namespace().unwrap_or_default(),
        "taskUid": task.metadata.uid.clone().unwrap_or_default(),
        "agentName": task.spec.agent_ref.name,
        "createdAt": created,
    });
    // json! never produces unserializable values
    serde_json::to_string_pretty(&value).unwrap_or_default()
}

/// Insert `file`, honoring the shadowing rules: a later item may deliberately
/// re-declare an earlier path (the earlier entry is dropped), but two items
/// of the same variant colliding on a path is an error, not an overwrite.
fn push_resolved(
    resolved: &mut Vec<(ResolvedFile, &'static str)>,
    file: ResolvedFile,
    variant: &'static str,
) -> Result<()> {
    if let Some(pos) = resolved.iter().position(|(f, _)| f.path == file.path) {
        if resolved[pos].1 == variant {
            return Err(Error::ResolutionError(format!(
                "duplicate {variant} context path '{}'",
                file.path
            )));
        }
        resolved.remove(pos);
    }
    resolved.push((file, variant));
    Ok(())
}

/// Resolve one item that needs no cluster access. `ConfigMapRef` is the only
/// variant handled elsewhere.
fn resolve_pure_item(item: &ContextItem, task: &Task) -> Result<(ResolvedFile, &'static str)> {
    match item {
        ContextItem::Text { path, content } => Ok((
            ResolvedFile {
                path: validate_path(path)?,
                source: ContextSource::Inline(content.clone()),
            },
            "text",
        )),
        ContextItem::GitRepo {
            path,
            repository,
            revision,
        } => {
            validate_remote_ref("repository", repository)?;
            validate_remote_ref("revision", revision)?;
            Ok((
                ResolvedFile {
                    path: validate_path(path)?,
                    source: ContextSource::GitClone {
                        repository: repository.clone(),
                        revision: revision.clone(),
                    },
                },
                "gitRepo",
            ))
        }
        ContextItem::Runtime { path } => Ok((
            ResolvedFile {
                path: validate_path(path)?,
                source: ContextSource::Inline(render_runtime(task)),
            },
            "runtime",
        )),
        ContextItem::Url { path, url } => {
            validate_url(url)?;
            Ok((
                ResolvedFile {
                    path: validate_path(path)?,
                    source: ContextSource::UrlFetch { url: url.clone() },
                },
                "url",
            ))
        }
        ContextItem::ConfigMapRef { name, .. } => Err(Error::ResolutionError(format!(
            "ConfigMap '{name}' requires cluster access"
        ))),
    }
}

fn configmap_not_found(name: &str, namespace: &str) -> Error {
    Error::ResolutionError(format!(
        "ConfigMap '{name}' not found in namespace '{namespace}'"
    ))
}

/// Project a fetched ConfigMap's data into resolved files: one file when a
/// key is named, one file per key under `path` otherwise. Missing key or an
/// empty data map is a resolution error naming what was missing.
fn project_configmap(
    data: BTreeMap<String, String>,
    path: &str,
    name: &str,
    key: Option<&str>,
) -> Result<Vec<ResolvedFile>> {
    match key {
        Some(key) => {
            let content = data.get(key).ok_or_else(|| {
                Error::ResolutionError(format!("key '{key}' not found in ConfigMap '{name}'"))
            })?;
            Ok(vec![ResolvedFile {
                path: validate_path(path)?,
                source: ContextSource::Inline(content.clone()),
            }])
        }
        None => {
            if data.is_empty() {
                return Err(Error::ResolutionError(format!(
                    "ConfigMap '{name}' has no data"
                )));
            }
            let dir = validate_path(path)?;
            data.into_iter()
                .map(|(k, v)| {
                    Ok(ResolvedFile {
                        path: validate_path(&format!("{dir}/{k}"))?,
                        source: ContextSource::Inline(v),
                    })
                })
                .collect()
        }
    }
}

/// Fetch one ConfigMap item's files from the Task's namespace.
async fn resolve_configmap(
    client: &Client,
    task_namespace: &str,
    path: &str,
    name: &str,
    key: Option<&str>,
) -> Result<Vec<ResolvedFile>> {
    let configmaps: Api<ConfigMap> = Api::namespaced(client.clone(), task_namespace);
    let cm = match configmaps.get(name).await {
        Ok(cm) => cm,
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            return Err(configmap_not_found(name, task_namespace));
        }
        Err(e) => return Err(e.into()),
    };

    project_configmap(cm.data.unwrap_or_default(), path, name, key)
}

/// The instruction payload is always staged first; user items may shadow it
/// deliberately.
fn seed_description(task: &Task) -> (ResolvedFile, &'static str) {
    (
        ResolvedFile {
            path: DESCRIPTION_PATH.to_string(),
            source: ContextSource::Inline(task.spec.description.clone()),
        },
        "description",
    )
}

/// Resolve the full context of a Task into an ordered file set.
///
/// Deterministic in iteration order: source order is preserved, so the init
/// container materializes files exactly as declared. The first resolution
/// error aborts the whole resolution; nothing partial is returned.
pub async fn resolve_context(client: &Client, task: &Task) -> Result<Vec<ResolvedFile>> {
    let task_namespace = task.namespace().ok_or(Error::MissingObjectKey)?;
    let mut resolved: Vec<(ResolvedFile, &'static str)> = Vec::new();

    let (seed, variant) = seed_description(task);
    push_resolved(&mut resolved, seed, variant)?;

    for item in &task.spec.context {
        if let ContextItem::ConfigMapRef { path, name, key } = item {
            for file in
                resolve_configmap(client, &task_namespace, path, name, key.as_deref()).await?
            {
                push_resolved(&mut resolved, file, "configMap")?;
            }
        } else {
            let (file, variant) = resolve_pure_item(item, task)?;
            push_resolved(&mut resolved, file, variant)?;
        }
    }

    Ok(resolved.into_iter().map(|(f, _)| f).collect())
}
