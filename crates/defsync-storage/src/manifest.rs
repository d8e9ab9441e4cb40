//! Schema-validated manifest persistence.
//!
//! Reads are fail-closed: any parse or validation problem yields no manifest
//! at all, never a partially valid one. Writes serialize an in-memory
//! manifest without re-validating it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::DateTime;
use defsync_core::{DefinitionKind, KeyResolver, Manifest};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("reading manifest {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing manifest {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("manifest {path} failed validation: {}", .problems.join("; "))]
    Validation { path: String, problems: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct ManifestStore {
    path: PathBuf,
}

impl ManifestStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `None` when the manifest is missing, unparseable or invalid.
    /// Callers must treat `None` as "cannot proceed", not as an empty manifest.
    pub async fn read(&self) -> Option<Manifest> {
        match self.read_checked().await {
            Ok(manifest) => Some(manifest),
            Err(err) => {
                warn!(error = %err, "manifest rejected");
                None
            }
        }
    }

    pub async fn read_checked(&self) -> Result<Manifest, ManifestError> {
        let display = self.path.display().to_string();
        let text = fs::read_to_string(&self.path)
            .await
            .map_err(|source| ManifestError::Io {
                path: display.clone(),
                source,
            })?;
        parse_manifest(&text).map_err(|err| match err {
            ManifestError::Parse { source, .. } => ManifestError::Parse {
                path: display.clone(),
                source,
            },
            ManifestError::Validation { problems, .. } => ManifestError::Validation {
                path: display.clone(),
                problems,
            },
            other => other,
        })
    }

    /// Serializes via a sibling temp file and an atomic rename.
    pub async fn write(&self, manifest: &Manifest) -> anyhow::Result<()> {
        let mut bytes = serde_json::to_vec_pretty(manifest).context("serializing manifest")?;
        bytes.push(b'\n');

        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating manifest directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.manifest.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp manifest {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp manifest {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp manifest {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp manifest {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }
        Ok(())
    }
}

/// Parses and validates manifest text. The returned error's `path` is empty.
pub fn parse_manifest(text: &str) -> Result<Manifest, ManifestError> {
    let value: Value = serde_json::from_str(text).map_err(|source| ManifestError::Parse {
        path: String::new(),
        source,
    })?;
    let problems = validate_manifest_value(&value);
    if !problems.is_empty() {
        return Err(ManifestError::Validation {
            path: String::new(),
            problems,
        });
    }
    serde_json::from_value(value).map_err(|source| ManifestError::Parse {
        path: String::new(),
        source,
    })
}

/// Structural validation of a raw manifest. Returns every problem found.
pub fn validate_manifest_value(value: &Value) -> Vec<String> {
    let mut problems = Vec::new();
    let Some(root) = value.as_object() else {
        problems.push("manifest: expected an object".to_string());
        return problems;
    };

    match root.get("pipelineVersion") {
        None | Some(Value::Null) => {}
        Some(v) if v.as_u64().is_some_and(|n| n <= u64::from(u32::MAX)) => {}
        Some(_) => problems.push("pipelineVersion: expected a non-negative integer".to_string()),
    }

    // Source id to its in-repository root.
    let source_roots = match root.get("sources").and_then(Value::as_object) {
        Some(sources) => {
            for (id, source) in sources {
                let ctx = format!("sources.{id}");
                match source.as_object() {
                    Some(obj) => {
                        for field in ["repo", "branch", "url"] {
                            require_string(obj, field, &ctx, &mut problems);
                        }
                        optional_string(obj, "root", &ctx, &mut problems);
                    }
                    None => problems.push(format!("{ctx}: expected an object")),
                }
            }
            sources
                .iter()
                .map(|(id, source)| {
                    let root = source.get("root").and_then(Value::as_str).unwrap_or_default();
                    (id.clone(), root.to_string())
                })
                .collect::<BTreeMap<_, _>>()
        }
        None => {
            problems.push("sources: expected an object".to_string());
            BTreeMap::new()
        }
    };

    match root.get("definitions").and_then(Value::as_object) {
        Some(definitions) => {
            for (key, entry) in definitions {
                validate_definition(key, entry, &source_roots, &mut problems);
            }
        }
        None => problems.push("definitions: expected an object".to_string()),
    }

    problems
}

fn validate_definition(
    key: &str,
    entry: &Value,
    source_roots: &BTreeMap<String, String>,
    problems: &mut Vec<String>,
) {
    let ctx = format!("definitions.{key}");
    let conventional = key_follows_convention(key);
    if !conventional {
        problems.push(format!("{ctx}: key does not follow a definition convention"));
    }
    let Some(obj) = entry.as_object() else {
        problems.push(format!("{ctx}: expected an object"));
        return;
    };

    for field in ["source", "upstreamPath", "upstreamCommitRef", "notes"] {
        require_string(obj, field, &ctx, problems);
    }
    require_timestamp(obj, "lastSyncedAt", &ctx, problems);
    optional_string(obj, "upstreamContentHash", &ctx, problems);

    if let Some(source) = obj.get("source").and_then(Value::as_str) {
        match source_roots.get(source) {
            Some(root) => {
                if conventional {
                    check_upstream_path(key, obj, root, &ctx, problems);
                }
            }
            None => problems.push(format!("{ctx}.source: unknown source `{source}`")),
        }
    }

    let directory_based = DefinitionKind::from_key(key).is_some_and(DefinitionKind::is_directory_based);
    match obj.get("declaredFiles") {
        None | Some(Value::Null) => {
            if directory_based {
                problems.push(format!(
                    "{ctx}.declaredFiles: required for a directory-based definition"
                ));
            }
        }
        Some(Value::Array(_)) if !directory_based => problems.push(format!(
            "{ctx}.declaredFiles: only directory-based definitions declare files"
        )),
        Some(Value::Array(files)) if files.is_empty() => problems.push(format!(
            "{ctx}.declaredFiles: expected at least one file"
        )),
        Some(Value::Array(files)) => {
            for (i, file) in files.iter().enumerate() {
                match file.as_str() {
                    Some(f) if is_relative_member(f) => {}
                    _ => problems.push(format!(
                        "{ctx}.declaredFiles[{i}]: expected a relative path string"
                    )),
                }
            }
        }
        Some(_) => problems.push(format!("{ctx}.declaredFiles: expected an array")),
    }

    if let Some(items) = optional_array(obj, "rewrites", &ctx, problems) {
        for (i, item) in items.iter().enumerate() {
            let item_ctx = format!("{ctx}.rewrites[{i}]");
            match item.as_object() {
                Some(rewrite) => {
                    require_string(rewrite, "field", &item_ctx, problems);
                    require_string(rewrite, "reason", &item_ctx, problems);
                }
                None => problems.push(format!(
                    "{item_ctx}: expected an object with field and reason"
                )),
            }
        }
    }

    if let Some(items) = optional_array(obj, "manualOverrides", &ctx, problems) {
        let mut seen_fields: Vec<&str> = Vec::new();
        for (i, item) in items.iter().enumerate() {
            let item_ctx = format!("{ctx}.manualOverrides[{i}]");
            let Some(ov) = item.as_object() else {
                let found = if item.is_string() { "legacy string entry" } else { "non-object" };
                problems.push(format!(
                    "{item_ctx}: expected an object with field, reason and overriddenAt, found {found}"
                ));
                continue;
            };
            require_string(ov, "field", &item_ctx, problems);
            require_string(ov, "reason", &item_ctx, problems);
            require_timestamp(ov, "overriddenAt", &item_ctx, problems);
            if let Some(field) = ov.get("field").and_then(Value::as_str) {
                if seen_fields.contains(&field) {
                    problems.push(format!("{item_ctx}: duplicate override for field `{field}`"));
                }
                seen_fields.push(field);
            }
        }
    }
}

/// The recorded `upstreamPath` must be the one path the key derives from.
fn check_upstream_path(
    key: &str,
    obj: &Map<String, Value>,
    root: &str,
    ctx: &str,
    problems: &mut Vec<String>,
) {
    let Some(recorded) = obj.get("upstreamPath").and_then(Value::as_str) else {
        return;
    };
    if let Some(expected) = KeyResolver::new(root).upstream_path(key) {
        if recorded != expected {
            problems.push(format!(
                "{ctx}.upstreamPath: `{recorded}` does not match key, expected `{expected}`"
            ));
        }
    }
}

fn key_follows_convention(key: &str) -> bool {
    let Some(kind) = DefinitionKind::from_key(key) else {
        return false;
    };
    let segments: Vec<&str> = key.split('/').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return false;
    }
    if kind.is_directory_based() {
        segments.len() == 2
    } else {
        segments.len() >= 2
    }
}

fn is_relative_member(path: &str) -> bool {
    !path.is_empty()
        && !path.starts_with('/')
        && path.split('/').all(|s| !s.is_empty() && s != "." && s != "..")
}

fn require_string(obj: &Map<String, Value>, field: &str, ctx: &str, problems: &mut Vec<String>) {
    match obj.get(field) {
        Some(Value::String(_)) => {}
        Some(_) => problems.push(format!("{ctx}.{field}: expected a string")),
        None => problems.push(format!("{ctx}.{field}: missing")),
    }
}

fn optional_string(obj: &Map<String, Value>, field: &str, ctx: &str, problems: &mut Vec<String>) {
    match obj.get(field) {
        None | Some(Value::Null) | Some(Value::String(_)) => {}
        Some(_) => problems.push(format!("{ctx}.{field}: expected a string")),
    }
}

fn require_timestamp(obj: &Map<String, Value>, field: &str, ctx: &str, problems: &mut Vec<String>) {
    match obj.get(field) {
        Some(Value::String(s)) if DateTime::parse_from_rfc3339(s).is_ok() => {}
        Some(_) => problems.push(format!("{ctx}.{field}: expected an RFC 3339 timestamp")),
        None => problems.push(format!("{ctx}.{field}: missing")),
    }
}

fn optional_array<'a>(
    obj: &'a Map<String, Value>,
    field: &str,
    ctx: &str,
    problems: &mut Vec<String>,
) -> Option<&'a Vec<Value>> {
    match obj.get(field) {
        None | Some(Value::Null) => None,
        Some(Value::Array(items)) => Some(items),
        Some(_) => {
            problems.push(format!("{ctx}.{field}: expected an array"));
            None
        }
    }
}
