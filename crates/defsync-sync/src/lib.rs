//! Drift detection pipeline: source registry, upstream snapshot, classification,
//! reconciliation and reporting.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use defsync_adapters::{
    BlobFetch, ContentSource, GitHubConfig, GitHubSource, Inventory, MemorySource, SourceError,
};
use defsync_core::{KeyResolver, Manifest, Source};
use defsync_storage::{
    BackoffPolicy, HttpClientConfig, HttpFetcher, ManifestStore, MemoryCache, RequestBudgetConfig,
};
use serde::Deserialize;
use thiserror::Error;
use tokio::fs;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

pub mod classify;
pub mod hash;
pub mod reconcile;
pub mod report;

pub use classify::{classify, collect_new_files};
pub use hash::{compute_hash, required_paths, HashError};
pub use reconcile::{
    extract_fields, needs_baseline, reconcile, reconcile_all, FieldConflict, FieldMap, Reconciliation,
};
pub use report::{render_brief, write_reports, DriftReport, DriftStatus};

pub const CRATE_NAME: &str = "defsync-sync";

/// Version of the downstream output format. Bumping it forces re-processing.
pub const PIPELINE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("definition {key} references unknown source `{source_id}`")]
    UnknownSource { key: String, source_id: String },
    #[error("manifest {path} is missing or failed validation")]
    ManifestUnavailable { path: String },
    #[error("inventory fetch for source `{source_id}` failed: {error}")]
    Inventory {
        source_id: String,
        #[source]
        error: SourceError,
    },
}

#[derive(Debug, Clone)]
pub struct DetectConfig {
    pub manifest_path: PathBuf,
    pub sources_file: Option<PathBuf>,
    pub reports_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_retries: usize,
    /// Client-side request budget; `None` leaves pacing to server hints alone.
    pub rate_limit_burst: Option<u32>,
    pub rate_limit_refill_ms: u64,
    pub pipeline_version: u32,
    pub github_api: String,
    pub raw_base: String,
    pub github_token: Option<String>,
}

impl DetectConfig {
    pub fn from_env() -> Self {
        let github = GitHubConfig::default();
        Self {
            manifest_path: std::env::var("DEFSYNC_MANIFEST")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("upstream-manifest.json")),
            sources_file: std::env::var("DEFSYNC_SOURCES_FILE").ok().map(PathBuf::from),
            reports_dir: std::env::var("DEFSYNC_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            user_agent: std::env::var("DEFSYNC_USER_AGENT")
                .unwrap_or_else(|_| "defsync/0.1".to_string()),
            http_timeout_secs: std::env::var("DEFSYNC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            max_retries: std::env::var("DEFSYNC_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            rate_limit_burst: std::env::var("DEFSYNC_RATE_LIMIT_BURST")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|burst: &u32| *burst > 0),
            rate_limit_refill_ms: std::env::var("DEFSYNC_RATE_LIMIT_REFILL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1000),
            pipeline_version: std::env::var("DEFSYNC_PIPELINE_VERSION")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(PIPELINE_VERSION),
            github_api: std::env::var("DEFSYNC_GITHUB_API").unwrap_or(github.api_base),
            raw_base: std::env::var("DEFSYNC_RAW_BASE").unwrap_or(github.raw_base),
            github_token: std::env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty()),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            bearer_token: self.github_token.clone(),
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                ..Default::default()
            },
            request_budget: self.rate_limit_burst.map(|burst| RequestBudgetConfig {
                burst,
                refill_every: Duration::from_millis(self.rate_limit_refill_ms),
            }),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SourcesFile {
    sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub repo: String,
    pub branch: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub root: Option<String>,
}

impl From<SourceConfig> for Source {
    fn from(c: SourceConfig) -> Self {
        Source {
            id: c.source_id,
            repo: c.repo,
            branch: c.branch,
            url: c.url,
            root: c.root.unwrap_or_default(),
        }
    }
}

/// Static `id -> Source` table for one run.
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    sources: BTreeMap<String, Source>,
}

impl SourceRegistry {
    pub fn from_manifest(manifest: &Manifest) -> Self {
        let sources = manifest
            .sources
            .iter()
            .map(|(id, s)| {
                (
                    id.clone(),
                    Source {
                        id: id.clone(),
                        repo: s.repo.clone(),
                        branch: s.branch.clone(),
                        url: Some(s.url.clone()),
                        root: s.root.clone().unwrap_or_default(),
                    },
                )
            })
            .collect();
        Self { sources }
    }

    /// Adds or replaces sources from a YAML table (`sources: [{source_id, repo, branch, url?, root?}]`).
    pub fn overlay_yaml(&mut self, text: &str) -> Result<usize> {
        let file: SourcesFile = serde_yaml::from_str(text).context("parsing sources table")?;
        let count = file.sources.len();
        for config in file.sources {
            let source = Source::from(config);
            self.sources.insert(source.id.clone(), source);
        }
        Ok(count)
    }

    pub async fn overlay_file(&mut self, path: &Path) -> Result<usize> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        self.overlay_yaml(&text)
            .with_context(|| format!("loading sources from {}", path.display()))
    }

    pub fn insert(&mut self, source: Source) {
        self.sources.insert(source.id.clone(), source);
    }

    pub fn get(&self, id: &str) -> Option<&Source> {
        self.sources.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Source> {
        self.sources.values()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Fails on the first definition whose source id is not registered.
    pub fn require_all(&self, manifest: &Manifest) -> Result<(), SyncError> {
        for (key, entry) in &manifest.definitions {
            if !self.sources.contains_key(&entry.source) {
                return Err(SyncError::UnknownSource {
                    key: key.clone(),
                    source_id: entry.source.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Everything fetched from one source during a run.
#[derive(Debug, Clone, Default)]
pub struct SourceSnapshot {
    pub resolver: KeyResolver,
    pub inventory: Inventory,
    /// Definition keys resolved from the inventory.
    pub keys: BTreeSet<String>,
    /// Blob contents by upstream path. Paths that were not found are absent.
    pub contents: BTreeMap<String, Vec<u8>>,
    /// Blob fetches that exhausted their retries, with the failure message.
    pub fetch_failures: BTreeMap<String, String>,
}

impl SourceSnapshot {
    pub fn new(root: &str, inventory: Inventory) -> Self {
        let resolver = KeyResolver::new(root);
        let keys = inventory
            .blob_paths()
            .filter_map(|path| resolver.resolve(path))
            .collect();
        Self {
            resolver,
            inventory,
            keys,
            contents: BTreeMap::new(),
            fetch_failures: BTreeMap::new(),
        }
    }

    pub fn revision(&self) -> Option<&str> {
        self.inventory.revision.as_deref()
    }
}

#[derive(Debug, Clone, Default)]
pub struct UpstreamSnapshot {
    pub sources: BTreeMap<String, SourceSnapshot>,
    /// Fields of a definition at its `upstreamCommitRef`, by key. Only
    /// fetched for changed definitions whose overrides lack an original.
    pub baselines: BTreeMap<String, FieldMap>,
}

impl UpstreamSnapshot {
    pub fn revisions(&self) -> BTreeMap<String, String> {
        self.sources
            .iter()
            .filter_map(|(id, s)| s.revision().map(|r| (id.clone(), r.to_string())))
            .collect()
    }
}

/// Wires registry, content sources and the pure classification stages.
pub struct DriftDetector {
    registry: SourceRegistry,
    default_content: Arc<dyn ContentSource>,
    per_source: BTreeMap<String, Arc<dyn ContentSource>>,
    pipeline_version: u32,
    run_id: Uuid,
}

impl DriftDetector {
    pub fn new(registry: SourceRegistry, content: Arc<dyn ContentSource>) -> Self {
        Self {
            registry,
            default_content: content,
            per_source: BTreeMap::new(),
            pipeline_version: PIPELINE_VERSION,
            run_id: Uuid::new_v4(),
        }
    }

    /// Routes one source id to a different content source.
    pub fn with_source(mut self, source_id: &str, content: Arc<dyn ContentSource>) -> Self {
        self.per_source.insert(source_id.to_string(), content);
        self
    }

    pub fn with_pipeline_version(mut self, version: u32) -> Self {
        self.pipeline_version = version;
        self
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    fn content_for(&self, source_id: &str) -> Arc<dyn ContentSource> {
        self.per_source
            .get(source_id)
            .cloned()
            .unwrap_or_else(|| self.default_content.clone())
    }

    /// Fetches every inventory, then the blobs needed to fingerprint the
    /// manifest's definitions. Any inventory failure aborts the run; blob
    /// failures are recorded per path.
    pub async fn snapshot(&self, manifest: &Manifest) -> Result<UpstreamSnapshot, SyncError> {
        self.registry.require_all(manifest)?;

        let mut snapshot = UpstreamSnapshot::default();
        for source in self.registry.iter() {
            let inventory = self
                .content_for(&source.id)
                .fetch_inventory(source)
                .await
                .map_err(|error| SyncError::Inventory {
                    source_id: source.id.clone(),
                    error,
                })?;
            let source_snapshot = SourceSnapshot::new(&source.root, inventory);
            info!(
                source_id = %source.id,
                entries = source_snapshot.inventory.entries.len(),
                keys = source_snapshot.keys.len(),
                "resolved upstream inventory"
            );
            snapshot.sources.insert(source.id.clone(), source_snapshot);
        }

        let mut wanted: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (key, entry) in &manifest.definitions {
            // Locally owned definitions are never fingerprinted, so never fetched.
            if entry.has_wildcard_override() {
                continue;
            }
            let Some(source_snapshot) = snapshot.sources.get(&entry.source) else {
                continue;
            };
            if source_snapshot.keys.contains(key) {
                wanted
                    .entry(entry.source.clone())
                    .or_default()
                    .extend(required_paths(entry));
            }
        }

        let mut tasks = JoinSet::new();
        for (source_id, paths) in &wanted {
            let Some(source) = self.registry.get(source_id) else {
                continue;
            };
            for path in paths {
                let content = self.content_for(source_id);
                let source = source.clone();
                let path = path.clone();
                tasks.spawn(async move {
                    let result = content.fetch_blob(&source, &path).await;
                    (source.id, path, result)
                });
            }
        }

        let mut settled: BTreeSet<(String, String)> = BTreeSet::new();
        while let Some(joined) = tasks.join_next().await {
            let (source_id, path, result) = match joined {
                Ok(done) => done,
                Err(err) => {
                    warn!(error = %err, "blob fetch task aborted");
                    continue;
                }
            };
            let Some(source_snapshot) = snapshot.sources.get_mut(&source_id) else {
                continue;
            };
            match result {
                Ok(BlobFetch::Found(bytes)) => {
                    source_snapshot.contents.insert(path.clone(), bytes);
                }
                Ok(BlobFetch::NotFound) => {}
                Err(err) => {
                    warn!(source_id = %source_id, path = %path, error = %err, "blob fetch failed");
                    source_snapshot.fetch_failures.insert(path.clone(), err.to_string());
                }
            }
            settled.insert((source_id, path));
        }

        for (source_id, paths) in wanted {
            let Some(source_snapshot) = snapshot.sources.get_mut(&source_id) else {
                continue;
            };
            for path in paths {
                if !settled.contains(&(source_id.clone(), path.clone())) {
                    source_snapshot
                        .fetch_failures
                        .insert(path, "blob fetch task aborted".to_string());
                }
            }
        }

        Ok(snapshot)
    }

    /// Reads each listed definition's files at its `upstreamCommitRef`. A
    /// definition whose baseline cannot be read completely gets none.
    pub async fn baselines(&self, manifest: &Manifest, keys: &[String]) -> BTreeMap<String, FieldMap> {
        let mut tasks = JoinSet::new();
        for key in keys {
            let Some(entry) = manifest.definitions.get(key) else {
                continue;
            };
            let Some(source) = self.registry.get(&entry.source) else {
                continue;
            };
            if entry.upstream_commit_ref.is_empty() {
                continue;
            }
            let content = self.content_for(&source.id);
            let source = source.clone();
            let key = key.clone();
            let entry = entry.clone();
            tasks.spawn(async move {
                let mut contents = BTreeMap::new();
                for path in required_paths(&entry) {
                    match content
                        .fetch_blob_at(&source, &entry.upstream_commit_ref, &path)
                        .await
                    {
                        Ok(BlobFetch::Found(bytes)) => {
                            contents.insert(path, bytes);
                        }
                        Ok(BlobFetch::NotFound) => {
                            warn!(key = %key, path = %path, revision = %entry.upstream_commit_ref, "baseline file missing");
                            return (key, None);
                        }
                        Err(err) => {
                            warn!(key = %key, path = %path, error = %err, "baseline fetch failed");
                            return (key, None);
                        }
                    }
                }
                let fields = extract_fields(&entry, &contents);
                (key, Some(fields))
            });
        }

        let mut out = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((key, Some(fields))) => {
                    out.insert(key, fields);
                }
                Ok((_, None)) => {}
                Err(err) => warn!(error = %err, "baseline fetch task aborted"),
            }
        }
        out
    }

    pub async fn detect(&self, manifest: &Manifest) -> Result<DriftReport, SyncError> {
        let mut upstream = self.snapshot(manifest).await?;
        let summary = classify(manifest, &upstream, self.pipeline_version);
        let wanted: Vec<String> = summary
            .hash_changes
            .iter()
            .filter(|key| manifest.definitions.get(*key).is_some_and(needs_baseline))
            .cloned()
            .collect();
        upstream.baselines = self.baselines(manifest, &wanted).await;
        let reconciliation = reconcile_all(manifest, &summary, &upstream);
        info!(
            run_id = %self.run_id,
            hash_changes = summary.hash_changes.len(),
            new_upstream = summary.new_upstream.len(),
            deletions = summary.deletions.len(),
            skipped = summary.skipped.len(),
            errors = summary.errors.len(),
            "classified upstream drift"
        );
        Ok(DriftReport::new(
            self.run_id,
            Utc::now(),
            self.pipeline_version,
            upstream.revisions(),
            summary,
            reconciliation,
        ))
    }
}

/// Local directory served as the upstream tree, for offline runs.
#[derive(Debug, Clone)]
pub struct FixtureOverride {
    pub dir: PathBuf,
    /// Only this source reads the fixture; `None` routes every source to it.
    pub source_id: Option<String>,
}

/// Reads the manifest fail-closed: any problem means the run cannot proceed.
pub async fn load_manifest(path: &Path) -> Result<Manifest, SyncError> {
    ManifestStore::new(path)
        .read()
        .await
        .ok_or_else(|| SyncError::ManifestUnavailable {
            path: path.display().to_string(),
        })
}

pub async fn load_registry(config: &DetectConfig, manifest: &Manifest) -> Result<SourceRegistry> {
    let mut registry = SourceRegistry::from_manifest(manifest);
    if let Some(path) = &config.sources_file {
        registry.overlay_file(path).await?;
    }
    Ok(registry)
}

pub fn build_detector(
    config: &DetectConfig,
    registry: SourceRegistry,
    fixture: Option<&FixtureOverride>,
) -> Result<DriftDetector> {
    let run_id = Uuid::new_v4();
    let github = || -> Result<Arc<dyn ContentSource>> {
        let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let github_config = GitHubConfig {
            api_base: config.github_api.clone(),
            raw_base: config.raw_base.clone(),
        };
        let source: Arc<dyn ContentSource> = Arc::new(
            GitHubSource::new(http, github_config, run_id).with_cache(Arc::new(MemoryCache::new())),
        );
        Ok(source)
    };

    let detector = match fixture {
        None => DriftDetector::new(registry, github()?),
        Some(fixture) => {
            let memory: Arc<dyn ContentSource> = Arc::new(MemorySource::from_dir(&fixture.dir)?);
            match &fixture.source_id {
                None => DriftDetector::new(registry, memory),
                Some(id) => DriftDetector::new(registry, github()?).with_source(id, memory),
            }
        }
    };
    Ok(detector
        .with_run_id(run_id)
        .with_pipeline_version(config.pipeline_version))
}

/// Loads, detects and writes the report files. Returns the report and its directory.
pub async fn run_detect(
    config: &DetectConfig,
    fixture: Option<&FixtureOverride>,
) -> Result<(DriftReport, PathBuf)> {
    let manifest = load_manifest(&config.manifest_path).await?;
    let registry = load_registry(config, &manifest).await?;
    let detector = build_detector(config, registry, fixture)?;
    let report = detector.detect(&manifest).await?;
    let dir = write_reports(&config.reports_dir, &report).await?;
    Ok((report, dir))
}
