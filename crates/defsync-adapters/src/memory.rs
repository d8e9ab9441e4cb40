use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use defsync_core::Source;

use crate::{BlobFetch, ContentSource, EntryKind, Inventory, InventoryEntry, SourceError};

/// Fixture-first content source backed by an in-memory file tree.
///
/// Serves the same tree for every source id. Older revisions of individual
/// files can be seeded for historical reads. Blob and inventory failures can
/// be scripted to exercise partial-failure paths, and every blob request is
/// recorded.
#[derive(Debug, Default)]
pub struct MemorySource {
    revision: Option<String>,
    files: BTreeMap<String, Vec<u8>>,
    history: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    failing_blobs: BTreeSet<String>,
    inventory_failure: Option<String>,
    requests: Mutex<Vec<String>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every file under `dir` as upstream content, keyed by its
    /// `/`-separated path relative to `dir`. Dot-directories are skipped.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut source = Self::new().with_revision(&format!("fixture:{}", dir.display()));
        load_dir(dir, dir, &mut source.files)?;
        Ok(source)
    }

    pub fn with_revision(mut self, revision: &str) -> Self {
        self.revision = Some(revision.to_string());
        self
    }

    pub fn with_file(mut self, path: &str, content: impl Into<Vec<u8>>) -> Self {
        self.insert_file(path, content);
        self
    }

    /// Seeds `path` as it was at an earlier `revision`.
    pub fn with_file_at(mut self, revision: &str, path: &str, content: impl Into<Vec<u8>>) -> Self {
        self.history
            .entry(revision.to_string())
            .or_default()
            .insert(path.to_string(), content.into());
        self
    }

    pub fn with_failing_blob(mut self, path: &str) -> Self {
        self.failing_blobs.insert(path.to_string());
        self
    }

    pub fn with_inventory_failure(mut self, message: &str) -> Self {
        self.inventory_failure = Some(message.to_string());
        self
    }

    pub fn insert_file(&mut self, path: &str, content: impl Into<Vec<u8>>) {
        self.files.insert(path.to_string(), content.into());
    }

    pub fn file(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn blob_requests(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, request: String) {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
    }

    pub fn inventory(&self) -> Inventory {
        let mut trees = BTreeSet::new();
        for path in self.files.keys() {
            let mut prefix = path.as_str();
            while let Some((parent, _)) = prefix.rsplit_once('/') {
                trees.insert(parent.to_string());
                prefix = parent;
            }
        }

        let mut entries: Vec<InventoryEntry> = trees
            .into_iter()
            .map(|path| InventoryEntry {
                path,
                kind: EntryKind::Tree,
                object_id: None,
            })
            .chain(self.files.iter().map(|(path, content)| InventoryEntry {
                path: path.clone(),
                kind: EntryKind::Blob,
                object_id: Some(defsync_storage::sha256_hex(content)),
            }))
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        Inventory {
            revision: self.revision.clone(),
            entries,
        }
    }
}

fn load_dir(root: &Path, dir: &Path, files: &mut BTreeMap<String, Vec<u8>>) -> Result<()> {
    let entries = fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("listing {}", dir.display()))?;
        let path = entry.path();
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let file_type = entry
            .file_type()
            .with_context(|| format!("inspecting {}", path.display()))?;
        if file_type.is_dir() {
            load_dir(root, &path, files)?;
        } else if file_type.is_file() {
            let relative = path
                .strip_prefix(root)
                .with_context(|| format!("relativizing {}", path.display()))?
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect::<Vec<_>>()
                .join("/");
            let bytes = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            files.insert(relative, bytes);
        }
    }
    Ok(())
}

#[async_trait]
impl ContentSource for MemorySource {
    async fn fetch_inventory(&self, _source: &Source) -> Result<Inventory, SourceError> {
        if let Some(message) = &self.inventory_failure {
            return Err(SourceError::Message(message.clone()));
        }
        Ok(self.inventory())
    }

    async fn fetch_blob(&self, _source: &Source, path: &str) -> Result<BlobFetch, SourceError> {
        self.record(path.to_string());
        if self.failing_blobs.contains(path) {
            return Err(SourceError::Message(format!("retries exhausted for {path}")));
        }
        Ok(match self.files.get(path) {
            Some(content) => BlobFetch::Found(content.clone()),
            None => BlobFetch::NotFound,
        })
    }

    async fn fetch_blob_at(
        &self,
        _source: &Source,
        revision: &str,
        path: &str,
    ) -> Result<BlobFetch, SourceError> {
        self.record(format!("{path}@{revision}"));
        if self.failing_blobs.contains(path) {
            return Err(SourceError::Message(format!("retries exhausted for {path}@{revision}")));
        }
        let tree = if self.revision.as_deref() == Some(revision) {
            Some(&self.files)
        } else {
            self.history.get(revision)
        };
        Ok(match tree.and_then(|files| files.get(path)) {
            Some(content) => BlobFetch::Found(content.clone()),
            None => BlobFetch::NotFound,
        })
    }
}
