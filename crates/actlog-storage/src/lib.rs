//! Record store, upload archive and upstream HTTP fetch utilities for the activity ledger.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use actlog_core::{sha256_hex, ErrorClass, IngestError};
use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, RETRY_AFTER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub mod postgres;
pub mod store;

pub use postgres::PgStore;
pub use store::{CreateOutcome, EventFilter, MemoryStore, RecordStore, StoreError};

pub const CRATE_NAME: &str = "actlog-storage";

#[derive(Debug, Clone)]
pub struct ArchivedUpload {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable, content-addressed copies of uploaded spreadsheets.
#[derive(Debug, Clone)]
pub struct UploadArchive {
    root: PathBuf,
}

impl UploadArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn upload_relative_path(
        &self,
        received_at: DateTime<Utc>,
        channel: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let day = received_at.format("%Y%m%d").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(day)
            .join(channel)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Store bytes under a hash-addressed path via an atomic temp-file rename.
    pub async fn store_bytes(
        &self,
        received_at: DateTime<Utc>,
        channel: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedUpload> {
        let content_hash = sha256_hex(bytes);
        let relative_path = self.upload_relative_path(received_at, channel, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        let archived = |deduplicated| ArchivedUpload {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(archived(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp archive file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(archived(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(archived(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp archive {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    RateLimited,
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::RateLimited
    } else if status.is_server_error() {
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

/// Rate-limit responses draw from their own, larger retry budget than server errors.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub max_rate_limit_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_rate_limit_retries: 6,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub bearer_token: Option<String>,
    pub extra_headers: Vec<(String, String)>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub rate_limit: Option<RequestRateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            bearer_token: None,
            extra_headers: Vec::new(),
            global_concurrency: 16,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
            rate_limit: None,
        }
    }
}

/// Burst of `capacity` upstream requests, then one more per `refill_every`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestRateLimit {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
struct RequestBucket {
    limit: RequestRateLimit,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    available: u32,
    refilled_at: Instant,
}

impl RequestBucket {
    fn new(limit: RequestRateLimit) -> Self {
        let limit = RequestRateLimit {
            capacity: limit.capacity.max(1),
            ..limit
        };
        Self {
            limit,
            state: Mutex::new(BucketState {
                available: limit.capacity,
                refilled_at: Instant::now(),
            }),
        }
    }

    async fn acquire(&self) {
        let step = self.limit.refill_every;
        if step.is_zero() {
            return;
        }
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let gained = (state.refilled_at.elapsed().as_nanos() / step.as_nanos())
                    .min(u128::from(self.limit.capacity)) as u32;
                if gained > 0 {
                    state.available = state.available.saturating_add(gained).min(self.limit.capacity);
                    state.refilled_at = if state.available == self.limit.capacity {
                        Instant::now()
                    } else {
                        state.refilled_at + step * gained
                    };
                }
                if state.available > 0 {
                    state.available -= 1;
                    return;
                }
                step.saturating_sub(state.refilled_at.elapsed())
            };
            debug!(?wait, "request budget spent; waiting for refill");
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    rate_limit: Option<RequestBucket>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub attempts: usize,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("rate limited {attempts} times by {url}")]
    RateLimited { url: String, attempts: usize },
    #[error("invalid response body from {url}: {reason}")]
    Decode { url: String, reason: String },
}

impl FetchError {
    pub fn class(&self) -> ErrorClass {
        match self {
            FetchError::Request(_) | FetchError::RateLimited { .. } => ErrorClass::UpstreamTransient,
            FetchError::HttpStatus { status, .. } if *status >= 500 => ErrorClass::UpstreamTransient,
            FetchError::HttpStatus { .. } => ErrorClass::UpstreamPermanent,
            FetchError::Decode { .. } => ErrorClass::MalformedInput,
        }
    }
}

impl From<FetchError> for IngestError {
    fn from(err: FetchError) -> Self {
        match err.class() {
            ErrorClass::UpstreamTransient => IngestError::UpstreamTransient(err.to_string()),
            ErrorClass::MalformedInput => IngestError::Malformed(err.to_string()),
            _ => IngestError::UpstreamPermanent(err.to_string()),
        }
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &config.bearer_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .context("building authorization header")?;
            headers.insert(AUTHORIZATION, value);
        }
        for (name, value) in &config.extra_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name {name}"))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid value for header {name}"))?;
            headers.insert(name, value);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            rate_limit: config.rate_limit.map(RequestBucket::new),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    fn rate_limit_delay(&self, headers: &HeaderMap, attempt: usize) -> Duration {
        let backoff = self.backoff.delay_for_attempt(attempt);
        let hinted = headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        match hinted {
            Some(hint) => hint.max(backoff).min(self.backoff.max_delay),
            None => backoff,
        }
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url);
        self.fetch_bytes_inner(source_id, url, query).instrument(span).await
    }

    async fn fetch_bytes_inner(
        &self,
        source_id: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        // Permits are released on every return path, so a sleeping retry holds its slot.
        let _global = self.global_limit.acquire().await.ok();
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.ok();

        let mut server_retries = 0usize;
        let mut rate_limit_retries = 0usize;
        let mut attempts = 0usize;

        loop {
            if let Some(bucket) = &self.rate_limit {
                bucket.acquire().await;
            }
            attempts += 1;

            match self.client.get(url).query(query).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                            attempts,
                        });
                    }

                    match classify_status(status) {
                        RetryDisposition::RateLimited
                            if rate_limit_retries < self.backoff.max_rate_limit_retries =>
                        {
                            let delay = self.rate_limit_delay(resp.headers(), rate_limit_retries);
                            rate_limit_retries += 1;
                            debug!(?delay, attempts, "upstream rate limited; backing off");
                            tokio::time::sleep(delay).await;
                        }
                        RetryDisposition::RateLimited => {
                            return Err(FetchError::RateLimited {
                                url: final_url,
                                attempts,
                            });
                        }
                        RetryDisposition::Retryable if server_retries < self.backoff.max_retries => {
                            let delay = self.backoff.delay_for_attempt(server_retries);
                            server_retries += 1;
                            warn!(status = status.as_u16(), ?delay, "upstream server error; retrying");
                            tokio::time::sleep(delay).await;
                        }
                        _ => {
                            return Err(FetchError::HttpStatus {
                                status: status.as_u16(),
                                url: final_url,
                            });
                        }
                    }
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && server_retries < self.backoff.max_retries
                    {
                        let delay = self.backoff.delay_for_attempt(server_retries);
                        server_retries += 1;
                        warn!(error = %err, ?delay, "upstream request failed; retrying");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }

    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let resp = self.fetch_bytes(run_id, source_id, url, query).await?;
        serde_json::from_slice(&resp.body).map_err(|e| FetchError::Decode {
            url: resp.final_url,
            reason: e.to_string(),
        })
    }
}
