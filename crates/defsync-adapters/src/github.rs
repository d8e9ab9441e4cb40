use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use defsync_core::Source;
use defsync_storage::{ContentCache, FetchOutcome, HttpFetcher, NoopCache};
use reqwest::Url;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{BlobFetch, ContentSource, EntryKind, Inventory, InventoryEntry, SourceError};

const SHA_MEDIA_TYPE: &str = "application/vnd.github.sha";
const JSON_MEDIA_TYPE: &str = "application/vnd.github+json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitHubConfig {
    pub api_base: String,
    pub raw_base: String,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.github.com".to_string(),
            raw_base: "https://raw.githubusercontent.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct RevisionPin {
    revision: String,
    object_ids: HashMap<String, String>,
}

/// Reads a GitHub repository pinned to the branch head observed at inventory
/// time, so every blob of a run comes from the same commit.
#[derive(Debug)]
pub struct GitHubSource {
    http: Arc<HttpFetcher>,
    config: GitHubConfig,
    run_id: Uuid,
    cache: Arc<dyn ContentCache>,
    pins: Mutex<HashMap<String, RevisionPin>>,
}

impl GitHubSource {
    pub fn new(http: Arc<HttpFetcher>, config: GitHubConfig, run_id: Uuid) -> Self {
        Self {
            http,
            config,
            run_id,
            cache: Arc::new(NoopCache),
            pins: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn ContentCache>) -> Self {
        self.cache = cache;
        self
    }

    fn api_url(&self, repo: &str, tail: &str) -> String {
        format!(
            "{}/repos/{repo}/{tail}",
            self.config.api_base.trim_end_matches('/')
        )
    }

    async fn fetch_required(
        &self,
        source: &Source,
        url: &str,
        accept: &str,
        what: &str,
    ) -> Result<Vec<u8>, SourceError> {
        match self
            .http
            .fetch_bytes(self.run_id, &source.id, url, Some(accept))
            .await?
        {
            FetchOutcome::Found(resp) => Ok(resp.body),
            FetchOutcome::NotFound { url } => Err(SourceError::NotFound {
                what: what.to_string(),
                url,
            }),
        }
    }
}

#[async_trait]
impl ContentSource for GitHubSource {
    async fn fetch_inventory(&self, source: &Source) -> Result<Inventory, SourceError> {
        let commit_url = self.api_url(&source.repo, &format!("commits/{}", source.branch));
        let body = self
            .fetch_required(
                source,
                &commit_url,
                SHA_MEDIA_TYPE,
                &format!("branch {}", source.branch),
            )
            .await?;
        let revision = String::from_utf8(body)
            .map_err(|e| SourceError::Decode {
                what: "branch head".to_string(),
                message: e.to_string(),
            })?
            .trim()
            .to_string();
        if revision.is_empty() {
            return Err(SourceError::Decode {
                what: "branch head".to_string(),
                message: "empty commit sha".to_string(),
            });
        }

        let tree_url = self.api_url(&source.repo, &format!("git/trees/{revision}?recursive=1"));
        let body = self
            .fetch_required(source, &tree_url, JSON_MEDIA_TYPE, "tree")
            .await?;
        let inventory = parse_tree_response(&body, &source.repo, &revision)?;
        info!(
            source_id = %source.id,
            revision = %revision,
            entries = inventory.entries.len(),
            "fetched inventory"
        );

        let object_ids = inventory
            .entries
            .iter()
            .filter(|e| e.kind == EntryKind::Blob)
            .filter_map(|e| e.object_id.clone().map(|oid| (e.path.clone(), oid)))
            .collect();
        self.pins.lock().await.insert(
            source.id.clone(),
            RevisionPin {
                revision,
                object_ids,
            },
        );

        Ok(inventory)
    }

    async fn fetch_blob(&self, source: &Source, path: &str) -> Result<BlobFetch, SourceError> {
        let (revision, object_id) = {
            let pins = self.pins.lock().await;
            match pins.get(&source.id) {
                Some(pin) => (pin.revision.clone(), pin.object_ids.get(path).cloned()),
                None => (source.branch.clone(), None),
            }
        };

        let cache_key = object_id.map(|oid| format!("{}@{oid}", source.repo));
        if let Some(key) = &cache_key {
            if let Some(hit) = self.cache.get(key) {
                debug!(source_id = %source.id, path, "blob cache hit");
                return Ok(BlobFetch::Found(hit));
            }
        }

        let url = raw_blob_url(&self.config.raw_base, &source.repo, &revision, path)?;
        match self.http.fetch_bytes(self.run_id, &source.id, &url, None).await? {
            FetchOutcome::Found(resp) => {
                if let Some(key) = &cache_key {
                    self.cache.set(key, resp.body.clone());
                }
                Ok(BlobFetch::Found(resp.body))
            }
            FetchOutcome::NotFound { .. } => Ok(BlobFetch::NotFound),
        }
    }

    async fn fetch_blob_at(
        &self,
        source: &Source,
        revision: &str,
        path: &str,
    ) -> Result<BlobFetch, SourceError> {
        let url = raw_blob_url(&self.config.raw_base, &source.repo, revision, path)?;
        match self.http.fetch_bytes(self.run_id, &source.id, &url, None).await? {
            FetchOutcome::Found(resp) => Ok(BlobFetch::Found(resp.body)),
            FetchOutcome::NotFound { .. } => Ok(BlobFetch::NotFound),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TreeResponse {
    #[serde(default)]
    truncated: bool,
    tree: Vec<TreeItem>,
}

#[derive(Debug, Deserialize)]
struct TreeItem {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    sha: Option<String>,
}

/// Decodes a recursive git tree listing. A truncated listing is an error:
/// missing entries would be misread as upstream deletions.
pub fn parse_tree_response(body: &[u8], repo: &str, revision: &str) -> Result<Inventory, SourceError> {
    let response: TreeResponse = serde_json::from_slice(body).map_err(|e| SourceError::Decode {
        what: "tree listing".to_string(),
        message: e.to_string(),
    })?;
    if response.truncated {
        return Err(SourceError::TruncatedInventory {
            repo: repo.to_string(),
            revision: revision.to_string(),
        });
    }

    let mut entries: Vec<InventoryEntry> = response
        .tree
        .into_iter()
        .filter_map(|item| {
            let kind = match item.kind.as_str() {
                "blob" => EntryKind::Blob,
                "tree" => EntryKind::Tree,
                _ => return None,
            };
            Some(InventoryEntry {
                path: item.path,
                kind,
                object_id: item.sha,
            })
        })
        .collect();
    entries.sort_by(|a, b| a.path.cmp(&b.path));

    Ok(Inventory {
        revision: Some(revision.to_string()),
        entries,
    })
}

pub fn raw_blob_url(raw_base: &str, repo: &str, revision: &str, path: &str) -> Result<String, SourceError> {
    let invalid = |message: String| SourceError::Decode {
        what: format!("raw url for {path}"),
        message,
    };
    let mut url = Url::parse(raw_base).map_err(|e| invalid(e.to_string()))?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| invalid("base url cannot carry a path".to_string()))?;
        segments.pop_if_empty();
        segments.extend(repo.split('/'));
        segments.push(revision);
        segments.extend(path.split('/'));
    }
    Ok(url.to_string())
}
