//! Outbound HTTP fetching, raw page capture and the remote record store client for bidscout.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bidscout_core::ErrorKind;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub mod store;

pub use store::{
    AirtableConfig, AirtableStore, FieldValue, RecordStore, StoreError, StoreRecord,
};

pub const CRATE_NAME: &str = "bidscout-storage";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed store for raw pages captured in debug mode.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
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

    pub fn artifact_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        portal_id: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(stamp)
            .join(portal_id)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Store bytes immutably using a hash-addressed path and atomic temp-file rename.
    pub async fn store_page(
        &self,
        fetched_at: DateTime<Utc>,
        portal_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path =
            self.artifact_relative_path(fetched_at, portal_id, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating artifact directory {}", parent.display()))?;

        let artifact = |deduplicated| StoredArtifact {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?
        {
            return Ok(artifact(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(artifact(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(artifact(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp artifact {} -> {}",
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
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
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

/// Map an HTTP status onto the failure taxonomy.
pub fn error_kind_for_status(status: u16) -> ErrorKind {
    match status {
        401 | 403 => ErrorKind::AuthenticationRequired,
        408 | 504 => ErrorKind::RenderTimeout,
        429 => ErrorKind::RateLimit,
        500..=599 => ErrorKind::TransientNetwork,
        _ => ErrorKind::UnrecoverableParse,
    }
}

/// Capped exponential backoff with optional random jitter.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            jitter: Duration::from_millis(250),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn jittered_delay(&self, attempt_index: usize) -> Duration {
        let base = self.delay_for_attempt(attempt_index);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Cap on concurrent outbound connections across all portals.
    pub global_concurrency: usize,
    /// Concurrent requests allowed per origin host; 1 serializes a host.
    pub per_host_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 8,
            per_host_concurrency: 1,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Run-wide connection cap plus one semaphore per origin host.
#[derive(Debug)]
struct ConnectionLimits {
    global: Arc<Semaphore>,
    per_host: usize,
    hosts: Mutex<HashMap<String, Arc<Semaphore>>>,
}

/// Held for the duration of one request, never across a backoff sleep.
#[derive(Debug)]
struct ConnectionPermits {
    _global: OwnedSemaphorePermit,
    _host: OwnedSemaphorePermit,
}

impl ConnectionLimits {
    fn new(global: usize, per_host: usize) -> Self {
        Self {
            global: Arc::new(Semaphore::new(global.max(1))),
            per_host: per_host.max(1),
            hosts: Mutex::new(HashMap::new()),
        }
    }

    async fn host(&self, host: &str) -> Arc<Semaphore> {
        self.hosts
            .lock()
            .await
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host)))
            .clone()
    }

    /// Global slot first, then the host slot, so a request queued on the global cap
    /// does not block other requests to its host.
    async fn acquire(&self, host: &str) -> ConnectionPermits {
        let global = self
            .global
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore not closed");
        let host = self
            .host(host)
            .await
            .acquire_owned()
            .await
            .expect("semaphore not closed");
        ConnectionPermits {
            _global: global,
            _host: host,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limits: ConnectionLimits,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Request(err) if err.is_timeout() => ErrorKind::RenderTimeout,
            FetchError::Request(_) => ErrorKind::TransientNetwork,
            FetchError::HttpStatus { status, .. } => error_kind_for_status(*status),
            FetchError::InvalidUrl { .. } => ErrorKind::UnrecoverableParse,
        }
    }

    fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            FetchError::InvalidUrl { .. } => RetryDisposition::NonRetryable,
        }
    }
}

pub fn host_of(url: &str) -> Result<String, FetchError> {
    url::Url::parse(url)
        .map_err(|e| FetchError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?
        .host_str()
        .map(str::to_ascii_lowercase)
        .ok_or_else(|| FetchError::InvalidUrl {
            url: url.to_string(),
            reason: "missing host".to_string(),
        })
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

        Ok(Self {
            client,
            limits: ConnectionLimits::new(config.global_concurrency, config.per_host_concurrency),
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        portal_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let host = host_of(url)?;
        let span = info_span!("http_fetch", %run_id, portal_id, url);
        self.fetch_with_backoff(&host, url).instrument(span).await
    }

    async fn fetch_with_backoff(&self, host: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            let result = {
                let _permits = self.limits.acquire(host).await;
                self.send_once(url).await
            };
            match result {
                Err(err)
                    if err.disposition() == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries =>
                {
                    debug!(error = %err, attempt, "retryable fetch failure");
                    tokio::time::sleep(self.backoff.jittered_delay(attempt)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn send_once(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
            fetched_at: Utc::now(),
        })
    }
}
