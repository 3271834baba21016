//! Shelter persistence, atomic local files and throttled HTTP fetch utilities.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info_span, Instrument};
use uuid::Uuid;

mod shelters;

pub use shelters::{
    FindNearbyError, InMemoryShelterStore, PgShelterStore, PgStoreOptions, ProximityQueryEngine,
    RowRejection, ShelterStore, StoreError, UpsertSummary,
};

pub const CRATE_NAME: &str = "shelter-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct WrittenFile {
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
    /// The file already held identical bytes and was left untouched.
    pub unchanged: bool,
}

/// Replace `path` with `bytes` through a temp file in the same directory and an
/// atomic rename, so readers never observe a partially written file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<WrittenFile> {
    let content_hash = sha256_hex(bytes);
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    if let Ok(existing) = fs::read(path).await {
        if sha256_hex(&existing) == content_hash {
            return Ok(WrittenFile {
                path: path.to_path_buf(),
                content_hash,
                byte_size: bytes.len(),
                unchanged: true,
            });
        }
    }

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }

    Ok(WrittenFile {
        path: path.to_path_buf(),
        content_hash,
        byte_size: bytes.len(),
        unchanged: false,
    })
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
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

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
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Spacing applied before outbound calls to a rate-limited provider.
#[async_trait]
pub trait RequestThrottle: Send + Sync {
    async fn wait(&self);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoThrottle;

#[async_trait]
impl RequestThrottle for NoThrottle {
    async fn wait(&self) {}
}

/// Guarantees at least `min_interval` between the starts of consecutive calls.
/// The first call never waits.
#[derive(Debug)]
pub struct MinIntervalThrottle {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl MinIntervalThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: Mutex::new(None),
        }
    }
}

#[async_trait]
impl RequestThrottle for MinIntervalThrottle {
    async fn wait(&self) {
        let mut last_call = self.last_call.lock().await;
        if let Some(previous) = *last_call {
            tokio::time::sleep_until(previous + self.min_interval).await;
        }
        *last_call = Some(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
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
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// GET with query parameters, retrying transient failures per the backoff policy.
    pub async fn fetch_bytes(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_with_retries(url, query).instrument(span).await
    }

    async fn fetch_with_retries(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            let can_retry = attempt < self.backoff.max_retries;
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
                        });
                    }

                    if !(can_retry && classify_status(status) == RetryDisposition::Retryable) {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    tracing::warn!(%status, attempt, "retrying after http status");
                }
                Err(err) => {
                    if !(can_retry && classify_reqwest_error(&err) == RetryDisposition::Retryable) {
                        return Err(FetchError::Request(err));
                    }
                    tracing::warn!(error = %err, attempt, "retrying after request error");
                }
            }
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn content_hashing_is_stable() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn atomic_writes_replace_and_detect_identical_content() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("snapshot.csv");

        let first = write_atomic(&path, b"a,b\n1,2\n").await.expect("first write");
        let second = write_atomic(&path, b"a,b\n1,2\n").await.expect("second write");
        let third = write_atomic(&path, b"a,b\n3,4\n").await.expect("third write");

        assert!(!first.unchanged);
        assert!(second.unchanged);
        assert!(!third.unchanged);
        assert_eq!(first.content_hash, second.content_hash);
        assert_ne!(first.content_hash, third.content_hash);
        assert_eq!(std::fs::read(&path).unwrap(), b"a,b\n3,4\n");

        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[tokio::test(start_paused = true)]
    async fn min_interval_throttle_spaces_consecutive_calls() {
        let throttle = MinIntervalThrottle::new(Duration::from_millis(500));
        let started = Instant::now();

        throttle.wait().await;
        assert!(started.elapsed() < Duration::from_millis(1));

        throttle.wait().await;
        throttle.wait().await;
        assert!(started.elapsed() >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_does_not_wait_when_interval_already_elapsed() {
        let throttle = MinIntervalThrottle::new(Duration::from_millis(500));
        throttle.wait().await;
        tokio::time::sleep(Duration::from_millis(800)).await;

        let before = Instant::now();
        throttle.wait().await;
        assert!(before.elapsed() < Duration::from_millis(1));
    }
}
