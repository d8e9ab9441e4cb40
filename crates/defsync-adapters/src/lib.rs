//! Remote content source contracts + GitHub and fixture-first implementations.

use async_trait::async_trait;
use defsync_core::Source;
use defsync_storage::FetchError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod github;
mod memory;

pub use github::{parse_tree_response, raw_blob_url, GitHubConfig, GitHubSource};
pub use memory::MemorySource;

pub const CRATE_NAME: &str = "defsync-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Blob,
    Tree,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub path: String,
    pub kind: EntryKind,
    /// Content-addressed object id when the remote exposes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
}

/// Full recursive listing of one source at one revision.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Inventory {
    pub revision: Option<String>,
    pub entries: Vec<InventoryEntry>,
}

impl Inventory {
    pub fn blob_paths(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|e| e.kind == EntryKind::Blob)
            .map(|e| e.path.as_str())
    }

    pub fn contains_blob(&self, path: &str) -> bool {
        self.blob_paths().any(|p| p == path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobFetch {
    Found(Vec<u8>),
    NotFound,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{what} not found at {url}")]
    NotFound { what: String, url: String },
    #[error("decoding {what}: {message}")]
    Decode { what: String, message: String },
    #[error("inventory of {repo} at {revision} is truncated")]
    TruncatedInventory { repo: String, revision: String },
    #[error("{0}")]
    Message(String),
}

#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Lists every path in the source. Failure here is fatal to a run.
    async fn fetch_inventory(&self, source: &Source) -> Result<Inventory, SourceError>;

    /// Reads one file; an absent file is `BlobFetch::NotFound`, not an error.
    async fn fetch_blob(&self, source: &Source, path: &str) -> Result<BlobFetch, SourceError>;

    /// Reads one file as it was at `revision`, bypassing the run's pinned head.
    async fn fetch_blob_at(
        &self,
        source: &Source,
        revision: &str,
        path: &str,
    ) -> Result<BlobFetch, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_paths_skip_tree_entries() {
        let inventory = Inventory {
            revision: Some("abc".into()),
            entries: vec![
                InventoryEntry {
                    path: "skills".into(),
                    kind: EntryKind::Tree,
                    object_id: None,
                },
                InventoryEntry {
                    path: "skills/alpha/SKILL.md".into(),
                    kind: EntryKind::Blob,
                    object_id: Some("1".into()),
                },
            ],
        };
        assert_eq!(
            inventory.blob_paths().collect::<Vec<_>>(),
            vec!["skills/alpha/SKILL.md"]
        );
        assert!(inventory.contains_blob("skills/alpha/SKILL.md"));
        assert!(!inventory.contains_blob("skills"));
    }
}
