//! Drift classification over an already-fetched upstream snapshot. No I/O.

use std::collections::{BTreeMap, BTreeSet};

use defsync_adapters::Inventory;
use defsync_core::{ChangeSummary, DefinitionError, DefinitionErrorKind, KeyResolver, Manifest};

use crate::hash::{compute_hash, HashError};
use crate::{SourceSnapshot, UpstreamSnapshot};

/// Lists the files of keys that have no manifest entry yet, relative to the
/// definition: every blob under a directory-based key's prefix, or the single
/// file name of a single-file key. Keys with no files are omitted.
pub fn collect_new_files(
    inventory: &Inventory,
    resolver: &KeyResolver,
    keys: &[String],
) -> BTreeMap<String, Vec<String>> {
    let mut out = BTreeMap::new();
    for key in keys {
        let files: Vec<String> = match resolver.directory_prefix(key) {
            Some(prefix) => {
                let mut files: Vec<String> = inventory
                    .blob_paths()
                    .filter_map(|p| p.strip_prefix(prefix.as_str()))
                    .filter(|rel| !rel.is_empty())
                    .map(str::to_string)
                    .collect();
                files.sort();
                files
            }
            None => resolver
                .upstream_path(key)
                .filter(|path| inventory.contains_blob(path))
                .and_then(|path| path.rsplit('/').next().map(str::to_string))
                .into_iter()
                .collect(),
        };
        if !files.is_empty() {
            out.insert(key.clone(), files);
        }
    }
    out
}

fn hash_error(key: &str, err: HashError, snapshot: &SourceSnapshot) -> DefinitionError {
    let HashError::MissingContent { path } = err;
    match snapshot.fetch_failures.get(&path) {
        Some(message) => DefinitionError {
            key: key.to_string(),
            kind: DefinitionErrorKind::Fetch,
            message: message.clone(),
            path: Some(path),
        },
        None => DefinitionError {
            key: key.to_string(),
            kind: DefinitionErrorKind::MissingContent,
            message: format!("missing upstream content for {path}"),
            path: Some(path),
        },
    }
}

/// Diffs the manifest against the upstream snapshot.
///
/// Wildcard-owned definitions go to `skipped` and are never hashed. A hashing
/// failure moves the definition to `errors` and out of every other list.
pub fn classify(
    manifest: &Manifest,
    upstream: &UpstreamSnapshot,
    pipeline_version: u32,
) -> ChangeSummary {
    let mut summary = ChangeSummary {
        pipeline_version_changed: manifest.pipeline_version != Some(pipeline_version),
        ..Default::default()
    };

    for (key, entry) in &manifest.definitions {
        if entry.has_wildcard_override() {
            summary.skipped.push(key.clone());
            continue;
        }
        let Some(snapshot) = upstream.sources.get(&entry.source) else {
            summary.errors.push(DefinitionError {
                key: key.clone(),
                kind: DefinitionErrorKind::SourceUnavailable,
                path: None,
                message: format!("source `{}` was not fetched this run", entry.source),
            });
            continue;
        };
        if !snapshot.keys.contains(key) {
            summary.deletions.push(key.clone());
            continue;
        }
        match compute_hash(entry, &snapshot.contents) {
            Ok(hash) => {
                if entry.upstream_content_hash.as_deref() != Some(hash.as_str()) {
                    summary.hash_changes.push(key.clone());
                }
                summary.computed_hashes.insert(key.clone(), hash);
            }
            Err(err) => summary.errors.push(hash_error(key, err, snapshot)),
        }
    }

    // A key offered by several sources is attributed to the first by id.
    let mut seen = BTreeSet::new();
    for snapshot in upstream.sources.values() {
        let mut fresh = Vec::new();
        for key in &snapshot.keys {
            if !manifest.definitions.contains_key(key) && seen.insert(key.clone()) {
                fresh.push(key.clone());
            }
        }
        summary
            .new_upstream_files
            .extend(collect_new_files(&snapshot.inventory, &snapshot.resolver, &fresh));
    }
    summary.new_upstream = seen.into_iter().collect();

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use defsync_adapters::MemorySource;
    use defsync_core::{ManifestEntry, ManualOverride, WILDCARD_FIELD};

    fn entry(path: &str, declared: Option<&[&str]>, hash: Option<&str>) -> ManifestEntry {
        ManifestEntry {
            source: "upstream".into(),
            upstream_path: path.into(),
            upstream_commit_ref: "abc".into(),
            last_synced_at: Utc::now(),
            notes: String::new(),
            declared_files: declared.map(|d| d.iter().map(|s| s.to_string()).collect()),
            upstream_content_hash: hash.map(str::to_string),
            rewrites: vec![],
            manual_overrides: vec![],
        }
    }

    fn snapshot_of(memory: &MemorySource) -> UpstreamSnapshot {
        let mut snap = SourceSnapshot::new("", memory.inventory());
        for path in memory.paths() {
            if let Some(bytes) = memory.file(path) {
                snap.contents.insert(path.to_string(), bytes.to_vec());
            }
        }
        UpstreamSnapshot {
            sources: BTreeMap::from([("upstream".to_string(), snap)]),
            ..Default::default()
        }
    }

    #[test]
    fn collector_gathers_nested_members_only() {
        let memory = MemorySource::new()
            .with_file("skills/alpha/SKILL.md", "a")
            .with_file("skills/alpha/refs/deep/x.md", "x")
            .with_file("skills/alphabet/SKILL.md", "other")
            .with_file("agents/review/beta.md", "b");
        let inventory = memory.inventory();
        let resolver = KeyResolver::new("");
        let files = collect_new_files(
            &inventory,
            &resolver,
            &["skills/alpha".into(), "agents/review/beta".into(), "commands/none".into()],
        );
        assert_eq!(files["skills/alpha"], vec!["SKILL.md", "refs/deep/x.md"]);
        assert_eq!(files["agents/review/beta"], vec!["beta.md"]);
        assert!(!files.contains_key("commands/none"));
    }

    #[test]
    fn fetch_failure_is_attributed_separately_from_missing_content() {
        let memory = MemorySource::new()
            .with_file("skills/alpha/SKILL.md", "a")
            .with_file("skills/alpha/refs/a.md", "x")
            .with_file("agents/beta.md", "b");
        let mut upstream = snapshot_of(&memory);
        let snap = upstream.sources.get_mut("upstream").unwrap();
        snap.contents.remove("skills/alpha/refs/a.md");
        snap.contents.remove("agents/beta.md");
        snap.fetch_failures
            .insert("agents/beta.md".into(), "retries exhausted".into());

        let mut manifest = Manifest {
            pipeline_version: Some(1),
            ..Default::default()
        };
        manifest.definitions.insert(
            "skills/alpha".into(),
            entry("skills/alpha", Some(&["SKILL.md", "refs/a.md"]), Some("h")),
        );
        manifest
            .definitions
            .insert("agents/beta".into(), entry("agents/beta.md", None, Some("h")));

        let summary = classify(&manifest, &upstream, 1);
        assert!(summary.hash_changes.is_empty());
        assert_eq!(summary.errors.len(), 2);
        assert_eq!(summary.errors[0].key, "agents/beta");
        assert_eq!(summary.errors[0].kind, DefinitionErrorKind::Fetch);
        assert_eq!(summary.errors[1].kind, DefinitionErrorKind::MissingContent);
        assert_eq!(summary.errors[1].path.as_deref(), Some("skills/alpha/refs/a.md"));
        assert!(summary.computed_hashes.is_empty());
    }

    #[test]
    fn wildcard_is_skipped_even_when_gone_upstream() {
        let upstream = snapshot_of(&MemorySource::new());
        let mut manifest = Manifest {
            pipeline_version: Some(1),
            ..Default::default()
        };
        let mut owned = entry("skills/gamma", Some(&["SKILL.md"]), Some("h"));
        owned.manual_overrides.push(ManualOverride {
            field: WILDCARD_FIELD.into(),
            reason: "ours".into(),
            original_value: None,
            overridden_at: Utc::now(),
        });
        manifest.definitions.insert("skills/gamma".into(), owned);

        let summary = classify(&manifest, &upstream, 1);
        assert_eq!(summary.skipped, vec!["skills/gamma"]);
        assert!(summary.deletions.is_empty());
    }

    #[test]
    fn absent_pipeline_version_counts_as_changed() {
        let upstream = snapshot_of(&MemorySource::new());
        let manifest = Manifest::default();
        assert!(classify(&manifest, &upstream, 1).pipeline_version_changed);

        let current = Manifest {
            pipeline_version: Some(1),
            ..Default::default()
        };
        assert!(!classify(&current, &upstream, 1).pipeline_version_changed);
        assert!(classify(&current, &upstream, 2).pipeline_version_changed);
    }

    #[test]
    fn unknown_snapshot_source_is_an_error_not_a_deletion() {
        let mut manifest = Manifest::default();
        let mut e = entry("agents/x.md", None, Some("h"));
        e.source = "elsewhere".into();
        manifest.definitions.insert("agents/x".into(), e);

        let summary = classify(&manifest, &UpstreamSnapshot::default(), 1);
        assert!(summary.deletions.is_empty());
        assert_eq!(summary.errors[0].kind, DefinitionErrorKind::SourceUnavailable);
    }
}
