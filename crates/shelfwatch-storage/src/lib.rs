//! Content-addressed asset storage + HTTP download utilities for shelfwatch.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use shelfwatch_core::RawFile;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, Instrument};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "shelfwatch-storage";

#[derive(Debug, Clone)]
pub struct StoredAsset {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Downloads directory where every asset lives under its sha256.
#[derive(Debug, Clone)]
pub struct AssetStore {
    root: PathBuf,
}

impl AssetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// `<source>/<first two hash chars>/<hash>.<ext>`
    pub fn asset_relative_path(&self, source_id: &str, content_hash: &str, extension: &str) -> PathBuf {
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        let shard = content_hash.get(..2).unwrap_or("00");
        PathBuf::from(source_id)
            .join(shard)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Store bytes under their content hash. Identical content is written once.
    pub async fn store_bytes(
        &self,
        source_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredAsset> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.asset_relative_path(source_id, &content_hash, extension);
        let shard_dir = self
            .root
            .join(&relative_path)
            .parent()
            .map(Path::to_path_buf)
            .with_context(|| format!("asset path {} has no parent", relative_path.display()))?;

        fs::create_dir_all(&shard_dir)
            .await
            .with_context(|| format!("creating asset directory {}", shard_dir.display()))?;
        // Recorded paths must stay valid whatever the working directory.
        let parent = fs::canonicalize(&shard_dir)
            .await
            .with_context(|| format!("resolving asset directory {}", shard_dir.display()))?;
        let absolute_path = match relative_path.file_name() {
            Some(name) => parent.join(name),
            None => anyhow::bail!("asset path {} has no file name", relative_path.display()),
        };

        let stored = |deduplicated| StoredAsset {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking asset path {}", absolute_path.display()))?
        {
            return Ok(stored(true));
        }

        let written = write_via_temp(&parent, &absolute_path, bytes).await?;
        Ok(stored(!written))
    }
}

/// Write to a temp file next to `target`, then rename into place.
/// Returns false when another writer got there first.
async fn write_via_temp(parent: &Path, target: &Path, bytes: &[u8]) -> anyhow::Result<bool> {
    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp asset file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp asset file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp asset file {}", temp_path.display()))?;
    drop(file);

    match fs::rename(&temp_path, target).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            let _ = fs::remove_file(&temp_path).await;
            Ok(false)
        }
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| {
                format!(
                    "renaming temp asset {} -> {}",
                    temp_path.display(),
                    target.display()
                )
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
            per_host_concurrency: 2,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

/// Download pacing: at most `capacity` requests in a burst, one more every `refill_every`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    config: TokenBucketConfig,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: u32,
    // Advanced in whole refill steps so partial progress is not lost.
    refilled_at: Instant,
}

impl SimpleTokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        let config = TokenBucketConfig {
            capacity: config.capacity.max(1),
            ..config
        };
        Self {
            state: Mutex::new(BucketState {
                tokens: config.capacity,
                refilled_at: Instant::now(),
            }),
            config,
        }
    }

    pub fn config(&self) -> TokenBucketConfig {
        self.config
    }

    /// Wait until a request may go out.
    pub async fn take(&self) {
        let step = self.config.refill_every;
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                if step.is_zero() {
                    return;
                }
                let elapsed = state.refilled_at.elapsed();
                let steps = (elapsed.as_nanos() / step.as_nanos()).min(u128::from(u32::MAX)) as u32;
                if steps > 0 {
                    state.tokens = state.tokens.saturating_add(steps).min(self.config.capacity);
                    state.refilled_at += step * steps;
                }
                if state.tokens > 0 {
                    state.tokens -= 1;
                    return;
                }
                step.saturating_sub(state.refilled_at.elapsed())
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shutting down")]
    Closed,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_host_limit: usize,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config.token_bucket.map(|c| Arc::new(SimpleTokenBucket::new(c)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_host_limit: config.per_host_concurrency.max(1),
            per_host: Mutex::new(HashMap::new()),
            token_bucket,
            backoff: config.backoff,
        })
    }

    async fn per_host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        let mut map = self.per_host.lock().await;
        map.entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone()
    }

    pub fn rate_limit(&self) -> Option<TokenBucketConfig> {
        self.token_bucket.as_ref().map(|bucket| bucket.config())
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let host = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(ToString::to_string))
            .unwrap_or_default();

        let _global = self.global_limit.acquire().await.map_err(|_| FetchError::Closed)?;
        let per_host = self.per_host_semaphore(&host).await;
        let _host = per_host.acquire().await.map_err(|_| FetchError::Closed)?;

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        self.fetch_with_retries(url)
            .instrument(info_span!("http_fetch", url, host = %host))
            .await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let content_type = resp
                            .headers()
                            .get(CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            content_type,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tracing::debug!(attempt, error = %err, "retrying asset fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

/// An asset fetched over HTTP and persisted into the [`AssetStore`].
#[derive(Debug, Clone)]
pub struct DownloadedAsset {
    pub url: String,
    pub filename: String,
    pub mime_type: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub stored: StoredAsset,
}

impl DownloadedAsset {
    pub fn into_raw_file(self) -> RawFile {
        RawFile {
            url: Some(self.url),
            filename: Some(self.filename),
            local_path: Some(self.stored.absolute_path.display().to_string()),
            mime_type: self.mime_type,
            hash: Some(self.stored.content_hash),
            malformed: None,
        }
    }
}

pub struct AssetDownloader {
    fetcher: HttpFetcher,
    store: AssetStore,
}

impl AssetDownloader {
    pub fn new(fetcher: HttpFetcher, store: AssetStore) -> Self {
        Self { fetcher, store }
    }

    pub fn store(&self) -> &AssetStore {
        &self.store
    }

    pub fn fetcher(&self) -> &HttpFetcher {
        &self.fetcher
    }

    pub async fn download(&self, source_id: &str, url: &str) -> anyhow::Result<DownloadedAsset> {
        let fetched_at = Utc::now();
        let response = self
            .fetcher
            .fetch_bytes(url)
            .await
            .with_context(|| format!("downloading {url}"))?;
        let filename = filename_from_url(url);
        let extension = extension_for(&filename, response.content_type.as_deref());
        let stored = self
            .store
            .store_bytes(source_id, &extension, &response.body)
            .await?;

        Ok(DownloadedAsset {
            url: url.to_string(),
            filename,
            mime_type: response.content_type,
            fetched_at,
            stored,
        })
    }
}

/// Last non-empty path segment, or `download` when the URL has none.
pub fn filename_from_url(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.rfind(|s| !s.is_empty()).map(ToString::to_string))
        })
        .unwrap_or_else(|| "download".to_string())
}

pub fn extension_for(filename: &str, content_type: Option<&str>) -> String {
    if let Some((_, ext)) = filename.rsplit_once('.') {
        if !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric()) {
            return ext.to_ascii_lowercase();
        }
    }
    match content_type {
        Some("application/pdf") => "pdf",
        Some("image/jpeg") => "jpg",
        Some("image/png") => "png",
        Some("image/webp") => "webp",
        Some("text/csv") => "csv",
        Some("application/json") => "json",
        Some("text/html") => "html",
        _ => "bin",
    }
    .to_string()
}
