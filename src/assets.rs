//! Asset download stage.
//!
//! For every complete record, downloads each URL in the configured list
//! field to `<dir>/<sanitized id>/<n>.<ext>` and writes the local paths back
//! to the record. Files already on disk are not fetched again, so the stage
//! can be re-run after an interruption.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::checkpoint::CheckpointStore;
use crate::config::{HarvestConfig, HttpConfig};
use crate::error::HarvestError;
use crate::http_client::{Fetched, HttpClient};
use crate::models::{FieldValue, Record, WorkItem};
use crate::pipeline::{Events, HarvestEvent};
use crate::pool::{ItemHandler, PoolOptions, ResourceFactory, WorkerPool};
use crate::retry::{Attempt, RetryExecutor, TaskError};
use crate::source::SourceError;

/// Fetches one asset.
#[async_trait]
pub trait AssetClient: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Fetched, SourceError>;
}

#[async_trait]
impl AssetClient for HttpClient {
    async fn fetch(&self, url: &str) -> Result<Fetched, SourceError> {
        self.get(url).await
    }
}

/// One HTTP session per worker, recycled by the pool.
#[derive(Debug, Clone)]
pub struct HttpSessionFactory {
    config: HttpConfig,
}

impl HttpSessionFactory {
    pub fn new(config: HttpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ResourceFactory for HttpSessionFactory {
    type Resource = HttpClient;

    async fn create(&self, worker_id: usize) -> Result<HttpClient, HarvestError> {
        debug!("Creating HTTP session for asset worker {}", worker_id);
        let client = HttpClient::new(self.config.timeout(), self.config.user_agent.as_deref())?;
        Ok(client.with_referer(self.config.referer.clone()))
    }
}

/// An asset that could not be downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetFailure {
    pub id: String,
    pub url: String,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct AssetReport {
    /// Complete records with at least one asset URL.
    pub records: usize,
    pub downloaded: usize,
    /// Assets already present on disk.
    pub existing: usize,
    pub failed: Vec<AssetFailure>,
    pub not_processed: usize,
    pub cancelled: bool,
}

impl AssetReport {
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.failed.is_empty() && self.not_processed == 0
    }
}

#[derive(Debug, Default)]
struct RecordAssets {
    paths: Vec<String>,
    downloaded: usize,
    existing: usize,
    failed: Vec<AssetFailure>,
}

struct AssetSettings {
    field: String,
    output_field: String,
    dir: PathBuf,
}

/// One asset fetch, retried through [`RetryExecutor::run`].
struct FetchAsset<'a, R> {
    client: &'a R,
    url: &'a str,
}

#[async_trait]
impl<R: AssetClient> Attempt for FetchAsset<'_, R> {
    type Output = Fetched;

    async fn attempt(&mut self, _attempt: u32) -> Result<Fetched, TaskError> {
        self.client.fetch(self.url).await.map_err(TaskError::from)
    }
}

struct AssetHandler {
    settings: Arc<AssetSettings>,
    urls: Arc<HashMap<String, Vec<String>>>,
    store: Arc<CheckpointStore>,
    retry: RetryExecutor,
    events: Events,
}

#[async_trait]
impl<R> ItemHandler<R> for AssetHandler
where
    R: AssetClient + Send + 'static,
{
    type Output = RecordAssets;

    async fn handle(
        &self,
        worker_id: usize,
        client: &mut R,
        item: WorkItem,
    ) -> Result<RecordAssets, HarvestError> {
        self.events
            .emit(HarvestEvent::ItemStarted {
                worker_id,
                id: item.id.clone(),
            })
            .await;

        let urls = self.urls.get(&item.id).cloned().unwrap_or_default();
        let dir = self.settings.dir.join(sanitize_id(&item.id));
        tokio::fs::create_dir_all(&dir).await?;
        let on_disk = existing_files(&dir).await;

        let client: &R = client;
        let mut outcome = RecordAssets::default();
        for (index, url) in urls.iter().enumerate() {
            let stem = (index + 1).to_string();
            if let Some(path) = on_disk.get(&stem) {
                outcome.existing += 1;
                outcome.paths.push(path.display().to_string());
                continue;
            }

            let fetched = self
                .retry
                .run(&mut FetchAsset { client, url })
                .await;
            let fetched = match fetched {
                Ok(fetched) => fetched,
                Err(failure) => {
                    warn!("Asset {} for {} failed: {}", url, item.id, failure.last_error);
                    outcome.failed.push(AssetFailure {
                        id: item.id.clone(),
                        url: url.clone(),
                        error: failure.last_error,
                    });
                    continue;
                }
            };

            let ext = extension_for(url, fetched.content_type.as_deref());
            let path = dir.join(format!("{}.{}", stem, ext));
            if let Err(e) = write_atomic(&path, &fetched.body).await {
                warn!("Could not write {}: {}", path.display(), e);
                outcome.failed.push(AssetFailure {
                    id: item.id.clone(),
                    url: url.clone(),
                    error: e.to_string(),
                });
                continue;
            }
            outcome.downloaded += 1;
            outcome.paths.push(path.display().to_string());
        }

        let error = (!outcome.failed.is_empty())
            .then(|| format!("{} of {} assets failed", outcome.failed.len(), urls.len()));
        let record = Record::new(&item.id)
            .with_field(&self.settings.output_field, FieldValue::List(outcome.paths.clone()));
        // Only the output field is written. The new list replaces the stored
        // one unless it is a strict subset of it (files lost, refetch failed).
        let stored: Vec<String> = self
            .store
            .get(&item.id)
            .and_then(|entry| {
                entry
                    .record
                    .get(&self.settings.output_field)
                    .map(|v| v.values().into_iter().map(str::to_string).collect())
            })
            .unwrap_or_default();
        let shrinks = outcome.paths.len() < stored.len()
            && outcome.paths.iter().all(|p| stored.contains(p));
        self.store.upsert_with(&record, 0, error.as_deref(), !shrinks)?;

        let event = match error {
            None => HarvestEvent::ItemCompleted {
                worker_id,
                id: item.id,
                attempts: 1,
            },
            Some(error) => HarvestEvent::ItemFailed {
                worker_id,
                id: item.id,
                attempts: 1,
                error,
            },
        };
        self.events.emit(event).await;
        Ok(outcome)
    }
}

/// Downloads assets for checkpointed records.
pub struct AssetFetcher<F> {
    factory: Arc<F>,
    settings: Arc<AssetSettings>,
    pool: PoolOptions,
    retry: RetryExecutor,
    cancel: CancellationToken,
    events: Events,
}

impl<F> AssetFetcher<F>
where
    F: ResourceFactory,
    F::Resource: AssetClient,
{
    pub fn new(factory: Arc<F>, config: &HarvestConfig, cancel: CancellationToken) -> Self {
        Self {
            factory,
            settings: Arc::new(AssetSettings {
                field: config.assets.field.clone(),
                output_field: config.assets.output_field.clone(),
                dir: config.resolve_path(&config.assets.dir),
            }),
            pool: PoolOptions {
                workers: config.assets.workers,
                restart_after: config.assets.restart_after,
                item_delay: config.pool.item_delay(),
            },
            retry: RetryExecutor::new(
                config.retry.max_attempts,
                config.retry.policy(),
                cancel.clone(),
            ),
            cancel,
            events: Events::default(),
        }
    }

    pub fn with_events(mut self, tx: tokio::sync::mpsc::Sender<HarvestEvent>) -> Self {
        self.events = Events::new(tx);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.settings.dir
    }

    /// Download assets for every complete record in `store`.
    pub async fn run(&self, store: Arc<CheckpointStore>) -> Result<AssetReport, HarvestError> {
        let mut urls = HashMap::new();
        let mut items = Vec::new();
        for record in store.complete_records() {
            let list: Vec<String> = match record.get(&self.settings.field) {
                Some(value) => value
                    .values()
                    .into_iter()
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
                    .collect(),
                None => continue,
            };
            if list.is_empty() {
                continue;
            }
            items.push(WorkItem {
                id: record.id.clone(),
                payload: record.id.clone(),
            });
            urls.insert(record.id, list);
        }

        let mut report = AssetReport {
            records: items.len(),
            ..Default::default()
        };
        info!(
            "Fetching {} assets for {} records into {}",
            urls.values().map(Vec::len).sum::<usize>(),
            report.records,
            self.settings.dir.display()
        );

        let handler = Arc::new(AssetHandler {
            settings: self.settings.clone(),
            urls: Arc::new(urls),
            store,
            retry: self.retry.clone(),
            events: self.events.clone(),
        });
        let pool = WorkerPool::new(self.factory.clone(), self.pool.clone(), self.cancel.clone());
        let summary = pool.run(items, handler).await?;

        for outcome in summary.outputs {
            report.downloaded += outcome.downloaded;
            report.existing += outcome.existing;
            report.failed.extend(outcome.failed);
        }
        report.not_processed = summary.remaining.len();
        report.cancelled = summary.cancelled;

        info!(
            "Assets: {} downloaded, {} already present, {} failed",
            report.downloaded,
            report.existing,
            report.failed.len()
        );
        Ok(report)
    }
}

/// Longest readable part of a directory name.
const MAX_DIR_PREFIX: usize = 80;

/// Directory name for an id.
///
/// A readable prefix (anything outside `[A-Za-z0-9._-]` becomes `_`) plus a
/// short SHA-256 of the full id, so ids that sanitize or truncate to the same
/// prefix still get their own directory.
pub fn sanitize_id(id: &str) -> String {
    let readable = id
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let mut out: String = readable
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    out.truncate(MAX_DIR_PREFIX);
    let trimmed = out.trim_matches(|c| c == '_' || c == '.');
    let prefix = if trimmed.is_empty() { "item" } else { trimmed };

    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}-{}", prefix, &digest[..12])
}

/// File extension from the URL path, else from the content type.
fn extension_for(url: &str, content_type: Option<&str>) -> String {
    let from_path = Url::parse(url).ok().and_then(|u| {
        let name = u.path_segments()?.next_back()?.to_string();
        let (_, ext) = name.rsplit_once('.')?;
        let valid = !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric());
        valid.then(|| ext.to_ascii_lowercase())
    });
    if let Some(ext) = from_path {
        return ext;
    }

    let mime = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|m| m.trim().to_ascii_lowercase())
        .unwrap_or_default();
    match mime.as_str() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "image/avif" => "avif",
        "image/svg+xml" => "svg",
        "application/pdf" => "pdf",
        _ => "bin",
    }
    .to_string()
}

/// Files in `dir` keyed by stem. A missing directory is empty.
async fn existing_files(dir: &Path) -> HashMap<String, PathBuf> {
    let mut found = HashMap::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return found;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "part") {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            found.insert(stem.to_string(), path.clone());
        }
    }
    found
}

async fn write_atomic(path: &Path, body: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("part");
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::models::RecordSchema;

    struct FakeClient {
        fetches: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AssetClient for FakeClient {
        async fn fetch(&self, url: &str) -> Result<Fetched, SourceError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if url.contains("missing") {
                return Err(SourceError::Http {
                    status: 404,
                    url: url.to_string(),
                });
            }
            Ok(Fetched {
                final_url: url.to_string(),
                content_type: Some("image/webp".to_string()),
                body: url.as_bytes().to_vec(),
            })
        }
    }

    struct FakeSessions {
        fetches: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ResourceFactory for FakeSessions {
        type Resource = FakeClient;

        async fn create(&self, _worker_id: usize) -> Result<FakeClient, HarvestError> {
            Ok(FakeClient {
                fetches: self.fetches.clone(),
            })
        }
    }

    fn config(dir: &Path) -> HarvestConfig {
        let mut config = HarvestConfig::default();
        config.assets.dir = dir.join("assets").display().to_string();
        config.assets.workers = 2;
        config.retry.base_delay_ms = 0;
        config
    }

    #[test]
    fn ids_become_safe_directory_names() {
        assert!(sanitize_id("https://shop.test/p/wool-coat").starts_with("shop.test_p_wool-coat-"));
        assert!(sanitize_id("sku 42/b").starts_with("sku_42_b-"));
        assert!(sanitize_id("///").starts_with("item-"));
        assert_eq!(sanitize_id("sku 42/b"), sanitize_id("sku 42/b"));
        assert_eq!(sanitize_id("sku 42/b").len(), "sku_42_b-".len() + 12);
    }

    #[test]
    fn distinct_ids_never_share_a_directory() {
        let base = format!("https://www.shop.test/shopping/women/{}", "gucci-".repeat(30));
        let a = format!("{}shoulder-bag-item-111.aspx", base);
        let b = format!("{}shoulder-bag-item-222.aspx", base);
        assert_ne!(sanitize_id(&a), sanitize_id(&b));
        // Same readable prefix, different digests.
        assert_eq!(sanitize_id(&a)[..MAX_DIR_PREFIX], sanitize_id(&b)[..MAX_DIR_PREFIX]);

        assert_ne!(sanitize_id("sku 42"), sanitize_id("sku/42"));
        assert_ne!(sanitize_id("https://shop.test/p/1"), sanitize_id("http://shop.test/p/1"));
    }

    #[test]
    fn extension_prefers_url_then_content_type() {
        assert_eq!(extension_for("https://cdn.test/a/b.JPG?w=300", None), "jpg");
        assert_eq!(extension_for("https://cdn.test/a/b", Some("image/png; q=1")), "png");
        assert_eq!(extension_for("https://cdn.test/a/b", None), "bin");
    }

    #[tokio::test]
    async fn downloads_once_and_records_local_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());
        let schema = RecordSchema::new(&["title"]).with_list_fields(&["images", "local_images"]);
        let store = Arc::new(CheckpointStore::open(tmp.path().join("cp.csv"), schema).unwrap());
        store
            .upsert(
                &Record::new("a")
                    .with_field("title", "Coat")
                    .with_field(
                        "images",
                        vec![
                            "https://cdn.test/a/1.jpg".to_string(),
                            "https://cdn.test/a/missing.jpg".to_string(),
                            "https://cdn.test/a/3".to_string(),
                        ],
                    ),
                1,
                None,
            )
            .unwrap();
        // Incomplete records are skipped.
        store
            .upsert(
                &Record::new("b").with_field("images", vec!["https://cdn.test/b/1.jpg".to_string()]),
                1,
                None,
            )
            .unwrap();

        let fetches = Arc::new(AtomicUsize::new(0));
        let factory = Arc::new(FakeSessions {
            fetches: fetches.clone(),
        });
        let fetcher = AssetFetcher::new(factory, &config, CancellationToken::new());

        let report = fetcher.run(store.clone()).await.unwrap();
        assert_eq!(report.records, 1);
        assert_eq!(report.downloaded, 2);
        assert_eq!(report.failed.len(), 1);
        // 404 is terminal: one fetch, not three.
        assert_eq!(fetches.load(Ordering::SeqCst), 3);

        let entry = store.get("a").unwrap();
        let local = entry.record.get("local_images").unwrap().values();
        assert_eq!(local.len(), 2);
        let record_dir = fetcher.dir().join(sanitize_id("a"));
        assert_eq!(local[0], record_dir.join("1.jpg").display().to_string());
        assert_eq!(local[1], record_dir.join("3.webp").display().to_string());
        assert!(entry.last_error.is_some());

        let again = fetcher.run(store.clone()).await.unwrap();
        assert_eq!(again.existing, 2);
        assert_eq!(again.downloaded, 0);
        assert_eq!(fetches.load(Ordering::SeqCst), 4);
    }

    fn complete(id: &str, images: &[&str]) -> Record {
        Record::new(id).with_field("title", "Bag").with_field(
            "images",
            images.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn long_ids_with_a_shared_prefix_keep_their_own_files() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());
        let schema = RecordSchema::new(&["title"]).with_list_fields(&["images", "local_images"]);
        let store = Arc::new(CheckpointStore::open(tmp.path().join("cp.csv"), schema).unwrap());
        let base = format!("https://www.shop.test/shopping/women/{}", "gucci-".repeat(30));
        let a = format!("{}shoulder-bag-item-111.aspx", base);
        let b = format!("{}shoulder-bag-item-222.aspx", base);
        store.upsert(&complete(&a, &["https://cdn.test/a/1.jpg"]), 1, None).unwrap();
        store.upsert(&complete(&b, &["https://cdn.test/b/1.jpg"]), 1, None).unwrap();

        let fetches = Arc::new(AtomicUsize::new(0));
        let factory = Arc::new(FakeSessions {
            fetches: fetches.clone(),
        });
        let fetcher = AssetFetcher::new(factory, &config, CancellationToken::new());

        let report = fetcher.run(store.clone()).await.unwrap();
        assert_eq!(report.downloaded, 2);
        assert_eq!(report.existing, 0);
        assert_eq!(fetches.load(Ordering::SeqCst), 2);

        // The fake client writes the URL as the body.
        for (id, url) in [(&a, "https://cdn.test/a/1.jpg"), (&b, "https://cdn.test/b/1.jpg")] {
            let entry = store.get(id).unwrap();
            let local = entry.record.get("local_images").unwrap().values();
            assert_eq!(local.len(), 1);
            assert_eq!(std::fs::read_to_string(local[0]).unwrap(), url);
        }
    }

    #[tokio::test]
    async fn failed_refetch_keeps_the_fuller_recorded_list() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());
        let schema = RecordSchema::new(&["title"]).with_list_fields(&["images", "local_images"]);
        let store = Arc::new(CheckpointStore::open(tmp.path().join("cp.csv"), schema).unwrap());

        let fetches = Arc::new(AtomicUsize::new(0));
        let factory = Arc::new(FakeSessions {
            fetches: fetches.clone(),
        });
        let fetcher = AssetFetcher::new(factory, &config, CancellationToken::new());
        let record_dir = fetcher.dir().join(sanitize_id("a"));
        let first = record_dir.join("1.jpg").display().to_string();
        let second = record_dir.join("2.jpg").display().to_string();

        // An earlier run downloaded both; the second file has since been lost
        // and its URL no longer resolves.
        let seeded = complete("a", &["https://cdn.test/a/1.jpg", "https://cdn.test/a/missing.jpg"])
            .with_field("local_images", vec![first.clone(), second.clone()]);
        store.upsert(&seeded, 1, None).unwrap();

        let report = fetcher.run(store.clone()).await.unwrap();
        assert_eq!(report.downloaded, 1);
        assert_eq!(report.failed.len(), 1);

        let entry = store.get("a").unwrap();
        let local = entry.record.get("local_images").unwrap().values();
        assert_eq!(local, vec![first.as_str(), second.as_str()]);
        assert!(entry.last_error.is_some());
    }
}
