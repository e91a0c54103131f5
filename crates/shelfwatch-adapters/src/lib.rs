//! Observation sources: each one yields a complete batch for a single entity kind.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shelfwatch_core::{EntityKind, ObservationBatch, RawFile, RawProduct};
use shelfwatch_storage::AssetDownloader;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "shelfwatch-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    /// Scraper output dumped as a JSON array.
    Snapshot,
    /// Asset URLs fetched and stored content-addressed.
    Download,
}

/// One entry of `sources.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub kind: EntityKind,
    pub mode: SourceMode,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub urls: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("source {source_id}: {failed} of {total} downloads failed")]
    Download {
        source_id: String,
        failed: usize,
        total: usize,
    },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait ObservationSource: Send + Sync {
    fn source_id(&self) -> &str;
    fn kind(&self) -> EntityKind;

    /// The whole batch or an error; never a partial batch.
    async fn collect(&self) -> Result<ObservationBatch, AdapterError>;
}

pub struct SnapshotFileSource {
    source_id: String,
    kind: EntityKind,
    path: PathBuf,
}

impl SnapshotFileSource {
    pub fn new(source_id: impl Into<String>, kind: EntityKind, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            kind,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ObservationSource for SnapshotFileSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> EntityKind {
        self.kind
    }

    async fn collect(&self) -> Result<ObservationBatch, AdapterError> {
        let records: Vec<Value> = read_json_file(&self.path)?;
        let batch = match self.kind {
            EntityKind::Product => {
                ObservationBatch::Products(self.decode_each(records, RawProduct::malformed))
            }
            EntityKind::File => ObservationBatch::Files(self.decode_each(records, RawFile::malformed)),
        };
        info!(
            source_id = %self.source_id,
            kind = %self.kind,
            records = batch.len(),
            "loaded snapshot"
        );
        Ok(batch)
    }
}

impl SnapshotFileSource {
    /// A record that does not decode keeps its slot as a malformed placeholder,
    /// so one bad entry cannot void the rest of the snapshot.
    fn decode_each<T: DeserializeOwned>(
        &self,
        records: Vec<Value>,
        malformed: impl Fn(String) -> T,
    ) -> Vec<T> {
        records
            .into_iter()
            .enumerate()
            .map(|(index, value)| {
                serde_json::from_value(value).unwrap_or_else(|err| {
                    warn!(source_id = %self.source_id, index, error = %err, "undecodable snapshot record");
                    malformed(err.to_string())
                })
            })
            .collect()
    }
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

pub struct AssetDownloadSource {
    source_id: String,
    urls: Vec<String>,
    downloader: Arc<AssetDownloader>,
}

impl AssetDownloadSource {
    pub fn new(source_id: impl Into<String>, urls: Vec<String>, downloader: Arc<AssetDownloader>) -> Self {
        Self {
            source_id: source_id.into(),
            urls,
            downloader,
        }
    }
}

#[async_trait]
impl ObservationSource for AssetDownloadSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> EntityKind {
        EntityKind::File
    }

    async fn collect(&self) -> Result<ObservationBatch, AdapterError> {
        let mut tasks = JoinSet::new();
        for (index, url) in self.urls.iter().cloned().enumerate() {
            let downloader = Arc::clone(&self.downloader);
            let source_id = self.source_id.clone();
            tasks.spawn(async move {
                let result = downloader.download(&source_id, &url).await;
                (index, url, result)
            });
        }

        let mut files = Vec::with_capacity(self.urls.len());
        let mut failed = 0;
        while let Some(joined) = tasks.join_next().await {
            let (index, url, result) = joined
                .map_err(|err| AdapterError::Message(format!("download task aborted: {err}")))?;
            match result {
                Ok(asset) => files.push((index, asset.into_raw_file())),
                Err(err) => {
                    warn!(source_id = %self.source_id, %url, error = %format!("{err:#}"), "asset download failed");
                    failed += 1;
                }
            }
        }

        // A missing file would be swept as deactivated, so any failure voids the batch.
        if failed > 0 {
            return Err(AdapterError::Download {
                source_id: self.source_id.clone(),
                failed,
                total: self.urls.len(),
            });
        }

        files.sort_by_key(|(index, _)| *index);
        info!(source_id = %self.source_id, files = files.len(), "downloaded assets");
        Ok(ObservationBatch::Files(
            files.into_iter().map(|(_, file)| file).collect(),
        ))
    }
}

/// Build the source described by one registry entry. Relative snapshot paths
/// resolve against `root`.
pub fn source_for_config(
    config: &SourceConfig,
    root: &Path,
    downloader: &Arc<AssetDownloader>,
) -> Result<Box<dyn ObservationSource>, AdapterError> {
    match config.mode {
        SourceMode::Snapshot => {
            let path = config.path.as_ref().ok_or_else(|| {
                AdapterError::Message(format!(
                    "snapshot source {} has no path",
                    config.source_id
                ))
            })?;
            let path = if path.is_absolute() {
                path.clone()
            } else {
                root.join(path)
            };
            Ok(Box::new(SnapshotFileSource::new(
                config.source_id.clone(),
                config.kind,
                path,
            )))
        }
        SourceMode::Download => {
            if config.kind != EntityKind::File {
                return Err(AdapterError::Message(format!(
                    "download source {} must have kind file, not {}",
                    config.source_id, config.kind
                )));
            }
            Ok(Box::new(AssetDownloadSource::new(
                config.source_id.clone(),
                config.urls.clone(),
                Arc::clone(downloader),
            )))
        }
    }
}

/// Concatenate batches of one kind. Errors on a kind mismatch.
pub fn merge_batches(
    kind: EntityKind,
    batches: impl IntoIterator<Item = ObservationBatch>,
) -> Result<ObservationBatch, AdapterError> {
    let mut merged = ObservationBatch::empty(kind);
    for batch in batches {
        match (&mut merged, batch) {
            (ObservationBatch::Products(all), ObservationBatch::Products(items)) => all.extend(items),
            (ObservationBatch::Files(all), ObservationBatch::Files(items)) => all.extend(items),
            (_, other) => {
                return Err(AdapterError::Message(format!(
                    "cannot merge a {} batch into {}",
                    other.kind(),
                    kind
                )))
            }
        }
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelfwatch_storage::{AssetStore, BackoffPolicy, HttpClientConfig, HttpFetcher};
    use std::time::Duration;

    fn downloader(root: &Path) -> Arc<AssetDownloader> {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(2),
            backoff: BackoffPolicy {
                max_retries: 0,
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
            },
            ..HttpClientConfig::default()
        })
        .unwrap();
        Arc::new(AssetDownloader::new(fetcher, AssetStore::new(root)))
    }

    #[tokio::test]
    async fn snapshot_source_reads_product_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("products.json");
        fs::write(
            &path,
            r#"[
                {"url": "https://shop.example/p/1", "name": "Widget", "price": 100},
                {"url": "https://shop.example/p/2", "name": "Gadget", "currency": "usd", "page": 2}
            ]"#,
        )
        .unwrap();

        let source = SnapshotFileSource::new("shop", EntityKind::Product, &path);
        let ObservationBatch::Products(items) = source.collect().await.unwrap() else {
            panic!("expected products");
        };
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].price, Some(100.0));
        assert_eq!(items[1].page, Some(2));
        assert_eq!(items[1].brand, None);
    }

    #[tokio::test]
    async fn one_undecodable_record_keeps_the_rest_of_the_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("products.json");
        fs::write(
            &path,
            r#"[
                {"url": "https://s.example/a", "name": "Widget", "price": 100},
                {"url": "https://s.example/b", "name": "Gadget", "price": "12.990"},
                {"url": 123, "name": "Gizmo"}
            ]"#,
        )
        .unwrap();

        let source = SnapshotFileSource::new("shop", EntityKind::Product, &path);
        let ObservationBatch::Products(items) = source.collect().await.unwrap() else {
            panic!("expected products");
        };
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].malformed, None);
        assert_eq!(items[0].name.as_deref(), Some("Widget"));
        assert!(items[1].malformed.as_deref().is_some_and(|e| e.contains("invalid type")));
        assert!(items[2].malformed.is_some());
    }

    #[tokio::test]
    async fn snapshot_source_fails_on_missing_or_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = SnapshotFileSource::new("shop", EntityKind::File, dir.path().join("nope.json"));
        assert!(missing.collect().await.is_err());

        let path = dir.path().join("broken.json");
        fs::write(&path, "{ not json").unwrap();
        let broken = SnapshotFileSource::new("shop", EntityKind::File, &path);
        let err = broken.collect().await.unwrap_err();
        assert!(err.to_string().contains("parsing"));

        // The file itself must still be an array.
        fs::write(&path, r#"{"url": "https://s.example/a"}"#).unwrap();
        assert!(broken.collect().await.is_err());
    }

    #[tokio::test]
    async fn download_source_with_no_urls_is_an_empty_file_batch() {
        let dir = tempfile::tempdir().unwrap();
        let source = AssetDownloadSource::new("assets", Vec::new(), downloader(dir.path()));
        assert_eq!(source.collect().await.unwrap(), ObservationBatch::Files(Vec::new()));
    }

    #[tokio::test]
    async fn any_failed_download_voids_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let source = AssetDownloadSource::new(
            "assets",
            vec!["http://127.0.0.1:9/catalog.pdf".to_string()],
            downloader(dir.path()),
        );
        let err = source.collect().await.unwrap_err();
        assert!(matches!(err, AdapterError::Download { failed: 1, total: 1, .. }));
    }

    #[test]
    fn registry_entries_build_matching_sources() {
        let dir = tempfile::tempdir().unwrap();
        let yaml_like = SourceConfig {
            source_id: "shop".into(),
            kind: EntityKind::Product,
            mode: SourceMode::Snapshot,
            enabled: true,
            path: Some(PathBuf::from("fixtures/products.json")),
            urls: vec![],
        };
        let source = source_for_config(&yaml_like, dir.path(), &downloader(dir.path())).unwrap();
        assert_eq!(source.kind(), EntityKind::Product);
        assert_eq!(source.source_id(), "shop");

        let bad = SourceConfig {
            mode: SourceMode::Download,
            ..yaml_like.clone()
        };
        assert!(source_for_config(&bad, dir.path(), &downloader(dir.path())).is_err());

        let no_path = SourceConfig {
            path: None,
            ..yaml_like
        };
        assert!(source_for_config(&no_path, dir.path(), &downloader(dir.path())).is_err());
    }

    #[test]
    fn merge_rejects_mixed_kinds() {
        let merged = merge_batches(
            EntityKind::Product,
            vec![
                ObservationBatch::Products(vec![RawProduct::default()]),
                ObservationBatch::Products(vec![RawProduct::default(), RawProduct::default()]),
            ],
        )
        .unwrap();
        assert_eq!(merged.len(), 3);

        assert!(merge_batches(
            EntityKind::Product,
            vec![ObservationBatch::Files(vec![RawFile::default()])]
        )
        .is_err());
    }
}
