//! Merge matrix between upstream drift and recorded manual overrides.
//!
//! Every function here is pure. A conflict is a reported decision state,
//! never an error, and is never resolved automatically.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use defsync_core::{ChangeSummary, Manifest, ManifestEntry, Rewrite, SKILL_PRIMARY_FILE};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::hash::member_path;
use crate::UpstreamSnapshot;

/// Upstream fields of one definition, by name.
pub type FieldMap = BTreeMap<String, JsonValue>;

pub const BODY_FIELD: &str = "body";
pub const FILES_FIELD_PREFIX: &str = "files/";
pub const HASH_FIELD: &str = "upstreamContentHash";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldConflict {
    pub field: String,
    pub override_reason: String,
    pub override_original_value: Option<JsonValue>,
    pub overridden_at: DateTime<Utc>,
    /// `None` when upstream no longer carries the field.
    pub upstream_value: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Reconciliation {
    Unchanged,
    PreserveOverrides {
        fields: Vec<String>,
    },
    ApplyUpstream {
        fields: Vec<String>,
        rewrite: Rewrite,
    },
    MergeNonOverridden {
        applied_fields: Vec<String>,
        preserved_fields: Vec<String>,
        rewrite: Rewrite,
    },
    Conflict {
        conflicts: Vec<FieldConflict>,
        preserved_fields: Vec<String>,
    },
    Skip,
}

impl Reconciliation {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Splits a document into its YAML front matter and body.
fn split_front_matter(text: &str) -> Option<(&str, &str)> {
    let rest = text
        .strip_prefix("---\n")
        .or_else(|| text.strip_prefix("---\r\n"))?;
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            return Some((&rest[..offset], &rest[offset + line.len()..]));
        }
        offset += line.len();
    }
    None
}

/// Front-matter keys of the primary document, its `body`, and one
/// `files/<relative>` field per non-primary member.
pub fn extract_fields(entry: &ManifestEntry, contents: &BTreeMap<String, Vec<u8>>) -> FieldMap {
    let mut fields = FieldMap::new();
    let primary = if entry.is_multi_file() {
        member_path(entry, SKILL_PRIMARY_FILE)
    } else {
        entry.upstream_path.clone()
    };

    if let Some(bytes) = contents.get(&primary) {
        let text = String::from_utf8_lossy(bytes);
        let body = match split_front_matter(&text) {
            Some((front, body)) => {
                if let Ok(JsonValue::Object(map)) = serde_yaml::from_str::<JsonValue>(front) {
                    fields.extend(map);
                }
                body.to_string()
            }
            None => text.to_string(),
        };
        fields.insert(BODY_FIELD.to_string(), JsonValue::String(body));
    }

    if entry.is_multi_file() {
        for rel in entry.declared_files.iter().flatten() {
            if rel == SKILL_PRIMARY_FILE {
                continue;
            }
            if let Some(bytes) = contents.get(&member_path(entry, rel)) {
                fields.insert(
                    format!("{FILES_FIELD_PREFIX}{rel}"),
                    JsonValue::String(String::from_utf8_lossy(bytes).into_owned()),
                );
            }
        }
    }
    fields
}

fn hash_rewrite(entry: &ManifestEntry) -> Rewrite {
    Rewrite {
        field: HASH_FIELD.to_string(),
        reason: "upstream content changed".to_string(),
        original_value: entry.upstream_content_hash.clone().map(JsonValue::String),
    }
}

/// Applies the merge matrix to one definition.
///
/// An overridden field counts as changed upstream when its current upstream
/// value differs from its original: the override's recorded `originalValue`,
/// else the field in `baseline` (the definition at `upstreamCommitRef`).
/// With neither, the field cannot be compared and is treated as changed.
pub fn reconcile(
    entry: &ManifestEntry,
    upstream_changed: bool,
    upstream: &FieldMap,
    baseline: Option<&FieldMap>,
) -> Reconciliation {
    if entry.has_wildcard_override() {
        return Reconciliation::Skip;
    }
    let preserved: Vec<String> = entry
        .manual_overrides
        .iter()
        .map(|o| o.field.clone())
        .collect();

    if !upstream_changed {
        return if preserved.is_empty() {
            Reconciliation::Unchanged
        } else {
            Reconciliation::PreserveOverrides { fields: preserved }
        };
    }

    if preserved.is_empty() {
        return Reconciliation::ApplyUpstream {
            fields: upstream.keys().cloned().collect(),
            rewrite: hash_rewrite(entry),
        };
    }

    let conflicts: Vec<FieldConflict> = entry
        .manual_overrides
        .iter()
        .filter_map(|ov| {
            let current = upstream.get(&ov.field);
            let original = match (&ov.original_value, baseline) {
                (Some(recorded), _) => Some(Some(recorded)),
                (None, Some(baseline)) => Some(baseline.get(&ov.field)),
                (None, None) => None,
            };
            let untouched = original.is_some_and(|original| original == current);
            (!untouched).then(|| FieldConflict {
                field: ov.field.clone(),
                override_reason: ov.reason.clone(),
                override_original_value: original.flatten().cloned(),
                overridden_at: ov.overridden_at,
                upstream_value: current.cloned(),
            })
        })
        .collect();

    if !conflicts.is_empty() {
        return Reconciliation::Conflict {
            conflicts,
            preserved_fields: preserved,
        };
    }

    let overridden: BTreeSet<&str> = preserved.iter().map(String::as_str).collect();
    Reconciliation::MergeNonOverridden {
        applied_fields: upstream
            .keys()
            .filter(|f| !overridden.contains(f.as_str()))
            .cloned()
            .collect(),
        preserved_fields: preserved,
        rewrite: hash_rewrite(entry),
    }
}

/// Whether reconciling `entry` needs its fields at `upstreamCommitRef`.
pub fn needs_baseline(entry: &ManifestEntry) -> bool {
    !entry.has_wildcard_override()
        && entry.manual_overrides.iter().any(|o| o.original_value.is_none())
}

/// Reconciles every hash-changed and skipped definition of a run.
pub fn reconcile_all(
    manifest: &Manifest,
    summary: &ChangeSummary,
    upstream: &UpstreamSnapshot,
) -> BTreeMap<String, Reconciliation> {
    let mut out = BTreeMap::new();
    for key in &summary.skipped {
        out.insert(key.clone(), Reconciliation::Skip);
    }
    for key in &summary.hash_changes {
        let Some(entry) = manifest.definitions.get(key) else {
            continue;
        };
        let fields = upstream
            .sources
            .get(&entry.source)
            .map(|s| extract_fields(entry, &s.contents))
            .unwrap_or_default();
        out.insert(
            key.clone(),
            reconcile(entry, true, &fields, upstream.baselines.get(key)),
        );
    }
    out
}
