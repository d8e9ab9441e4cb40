//! Order-independent content fingerprints per definition.

use std::collections::BTreeMap;

use defsync_core::ManifestEntry;
use defsync_storage::sha256_hex;
use thiserror::Error;

/// Separator between documents of a multi-file definition.
pub const DOCUMENT_SEPARATOR: u8 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HashError {
    #[error("missing upstream content for {path}")]
    MissingContent { path: String },
}

/// Declared sub-files of a multi-file entry, sorted and deduplicated.
fn sorted_declared(entry: &ManifestEntry) -> Vec<&str> {
    let mut files: Vec<&str> = entry
        .declared_files
        .iter()
        .flatten()
        .map(String::as_str)
        .collect();
    files.sort_unstable();
    files.dedup();
    files
}

pub fn member_path(entry: &ManifestEntry, relative: &str) -> String {
    format!("{}/{relative}", entry.upstream_path.trim_end_matches('/'))
}

/// Upstream paths whose content is needed to fingerprint `entry`.
pub fn required_paths(entry: &ManifestEntry) -> Vec<String> {
    if entry.is_multi_file() {
        sorted_declared(entry)
            .into_iter()
            .map(|rel| member_path(entry, rel))
            .collect()
    } else {
        vec![entry.upstream_path.clone()]
    }
}

/// Fingerprints one definition from already-fetched contents.
///
/// Any absent document aborts the computation. No hash is ever produced
/// over a partial set of files.
pub fn compute_hash(
    entry: &ManifestEntry,
    contents: &BTreeMap<String, Vec<u8>>,
) -> Result<String, HashError> {
    let mut buf = Vec::new();
    for (i, path) in required_paths(entry).into_iter().enumerate() {
        let Some(content) = contents.get(&path) else {
            return Err(HashError::MissingContent { path });
        };
        if i > 0 {
            buf.push(DOCUMENT_SEPARATOR);
        }
        buf.extend_from_slice(content);
    }
    Ok(sha256_hex(&buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(path: &str, declared: Option<&[&str]>) -> ManifestEntry {
        ManifestEntry {
            source: "upstream".into(),
            upstream_path: path.into(),
            upstream_commit_ref: "abc".into(),
            last_synced_at: Utc::now(),
            notes: String::new(),
            declared_files: declared.map(|d| d.iter().map(|s| s.to_string()).collect()),
            upstream_content_hash: None,
            rewrites: vec![],
            manual_overrides: vec![],
        }
    }

    fn contents(files: &[(&str, &str)]) -> BTreeMap<String, Vec<u8>> {
        files
            .iter()
            .map(|(p, c)| (p.to_string(), c.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn single_file_hash_is_digest_of_the_blob() {
        let e = entry("agents/review/beta.md", None);
        let c = contents(&[("agents/review/beta.md", "hello")]);
        assert_eq!(
            compute_hash(&e, &c).unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn declared_order_does_not_change_the_fingerprint() {
        let c = contents(&[
            ("skills/alpha/SKILL.md", "primary"),
            ("skills/alpha/refs/a.md", "a"),
            ("skills/alpha/refs/b.md", "b"),
        ]);
        let forward = entry("skills/alpha", Some(&["SKILL.md", "refs/a.md", "refs/b.md"]));
        let shuffled = entry("skills/alpha", Some(&["refs/b.md", "SKILL.md", "refs/a.md"]));
        let reversed = entry("skills/alpha/", Some(&["refs/b.md", "refs/a.md", "SKILL.md"]));

        let h = compute_hash(&forward, &c).unwrap();
        assert_eq!(compute_hash(&shuffled, &c).unwrap(), h);
        assert_eq!(compute_hash(&reversed, &c).unwrap(), h);
    }

    #[test]
    fn separator_distinguishes_document_boundaries() {
        let a = entry("skills/x", Some(&["a.md", "b.md"]));
        let joined = compute_hash(&a, &contents(&[("skills/x/a.md", "ab"), ("skills/x/b.md", "c")]));
        let split = compute_hash(&a, &contents(&[("skills/x/a.md", "a"), ("skills/x/b.md", "bc")]));
        assert_ne!(joined.unwrap(), split.unwrap());
    }

    #[test]
    fn missing_member_aborts_without_a_hash() {
        let e = entry("skills/alpha", Some(&["SKILL.md", "refs/gone.md"]));
        let c = contents(&[("skills/alpha/SKILL.md", "primary")]);
        assert_eq!(
            compute_hash(&e, &c),
            Err(HashError::MissingContent {
                path: "skills/alpha/refs/gone.md".into()
            })
        );
    }

    #[test]
    fn empty_declared_files_hash_the_single_path() {
        let e = entry("commands/plan.md", Some(&[]));
        assert_eq!(required_paths(&e), vec!["commands/plan.md"]);
    }
}
