//! Core domain model and provenance types for upstream definition sync.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

mod key;

pub use key::{KeyResolver, AGENTS_DIR, COMMANDS_DIR, SKILLS_DIR, SKILL_PRIMARY_FILE};

pub const CRATE_NAME: &str = "defsync-core";

/// Override field that marks a whole definition as locally owned.
pub const WILDCARD_FIELD: &str = "*";

/// One remote content origin, resolved from static configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    /// `owner/name` repository location.
    pub repo: String,
    pub branch: String,
    pub url: Option<String>,
    /// In-repository prefix under which the definition conventions live.
    pub root: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionKind {
    Agent,
    Command,
    Skill,
}

impl DefinitionKind {
    pub fn from_key(key: &str) -> Option<Self> {
        match key.split('/').next()? {
            AGENTS_DIR => Some(Self::Agent),
            COMMANDS_DIR => Some(Self::Command),
            SKILLS_DIR => Some(Self::Skill),
            _ => None,
        }
    }

    pub fn is_directory_based(self) -> bool {
        matches!(self, Self::Skill)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestSource {
    pub repo: String,
    pub branch: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
}

/// Persisted provenance record for every imported definition.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_version: Option<u32>,
    pub sources: BTreeMap<String, ManifestSource>,
    pub definitions: BTreeMap<String, ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub source: String,
    pub upstream_path: String,
    pub upstream_commit_ref: String,
    pub last_synced_at: DateTime<Utc>,
    pub notes: String,
    /// Relative sub-files of a directory-based definition, in recorded order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declared_files: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rewrites: Vec<Rewrite>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manual_overrides: Vec<ManualOverride>,
}

/// Automated transformation applied to a field during conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rewrite {
    pub field: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_value: Option<JsonValue>,
}

/// Human customization that must survive re-synchronization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualOverride {
    pub field: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_value: Option<JsonValue>,
    pub overridden_at: DateTime<Utc>,
}

impl ManualOverride {
    pub fn is_wildcard(&self) -> bool {
        self.field == WILDCARD_FIELD
    }
}

impl ManifestEntry {
    /// Multi-file entries hash their declared files beneath `upstream_path`.
    pub fn is_multi_file(&self) -> bool {
        self.declared_files
            .as_ref()
            .is_some_and(|files| !files.is_empty())
    }

    pub fn has_wildcard_override(&self) -> bool {
        self.manual_overrides.iter().any(ManualOverride::is_wildcard)
    }

    pub fn override_for(&self, field: &str) -> Option<&ManualOverride> {
        self.manual_overrides.iter().find(|o| o.field == field)
    }

    /// Records a rewrite unless one already exists for the same field.
    pub fn record_rewrite(&mut self, rewrite: Rewrite) -> bool {
        if self.rewrites.iter().any(|r| r.field == rewrite.field) {
            return false;
        }
        self.rewrites.push(rewrite);
        true
    }

    /// Records a manual override, keeping the first-ever original value of the field.
    pub fn record_override(
        &mut self,
        field: &str,
        reason: &str,
        original_value: Option<JsonValue>,
        overridden_at: DateTime<Utc>,
    ) {
        if let Some(existing) = self.manual_overrides.iter_mut().find(|o| o.field == field) {
            existing.reason = reason.to_string();
            existing.overridden_at = overridden_at;
            if existing.original_value.is_none() {
                existing.original_value = original_value;
            }
            return;
        }
        self.manual_overrides.push(ManualOverride {
            field: field.to_string(),
            reason: reason.to_string(),
            original_value,
            overridden_at,
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionErrorKind {
    /// A blob fetch exhausted its retries.
    Fetch,
    /// A declared sub-file is absent upstream.
    MissingContent,
    /// The definition's source was not part of this run's snapshot.
    SourceUnavailable,
}

/// Failure scoped to one definition; unrelated definitions are still classified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionError {
    pub key: String,
    pub kind: DefinitionErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub message: String,
}

/// Drift between the manifest and the current upstream state. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSummary {
    pub hash_changes: Vec<String>,
    pub new_upstream: Vec<String>,
    pub new_upstream_files: BTreeMap<String, Vec<String>>,
    pub deletions: Vec<String>,
    pub skipped: Vec<String>,
    pub errors: Vec<DefinitionError>,
    pub pipeline_version_changed: bool,
    /// Fresh fingerprint of every definition hashed this run.
    #[serde(default)]
    pub computed_hashes: BTreeMap<String, String>,
}

impl ChangeSummary {
    pub fn has_drift(&self) -> bool {
        !self.hash_changes.is_empty()
            || !self.new_upstream.is_empty()
            || !self.deletions.is_empty()
            || self.pipeline_version_changed
    }
}
