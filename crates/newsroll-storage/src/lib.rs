//! Durable per-user documents, rotation-index persistence and HTTP fetch utilities for Newsroll.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use newsroll_core::{StatePatch, UserDocument};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore, SemaphorePermit};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "newsroll-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt document at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("serializing document: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type DocumentUpdate = Box<dyn FnOnce(&mut UserDocument) + Send>;

/// Durable per-user state. Writes merge into the existing document.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, user_id: &str) -> Result<Option<UserDocument>, StoreError>;

    /// Read-modify-write one user's document under the store's lock; missing documents start empty.
    async fn update(&self, user_id: &str, apply: DocumentUpdate) -> Result<UserDocument, StoreError>;

    async fn set(&self, user_id: &str, patch: StatePatch) -> Result<(), StoreError> {
        self.update(user_id, Box::new(move |doc: &mut UserDocument| patch.apply(&mut doc.state)))
            .await
            .map(|_| ())
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError {
    let path = path.to_path_buf();
    move |source| StoreError::Io { path, source }
}

/// Write `bytes` to `path` through a temp file in the same directory and an atomic rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await.map_err(io_err(parent))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(io_err(&temp_path))?;
    file.write_all(bytes).await.map_err(io_err(&temp_path))?;
    file.flush().await.map_err(io_err(&temp_path))?;
    drop(file);

    if let Err(source) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}

/// One JSON file per user under `<root>/users/`, named by the hash of the user id.
#[derive(Debug)]
pub struct JsonFileStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn document_path(&self, user_id: &str) -> PathBuf {
        self.root
            .join("users")
            .join(format!("{}.json", sha256_hex(user_id.as_bytes())))
    }

    async fn read_document(&self, path: &Path) -> Result<Option<UserDocument>, StoreError> {
        match fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|source| StoreError::Corrupt {
                    path: path.to_path_buf(),
                    source,
                }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

#[async_trait]
impl DocumentStore for JsonFileStore {
    async fn get(&self, user_id: &str) -> Result<Option<UserDocument>, StoreError> {
        self.read_document(&self.document_path(user_id)).await
    }

    async fn update(&self, user_id: &str, apply: DocumentUpdate) -> Result<UserDocument, StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.document_path(user_id);
        let mut doc = self.read_document(&path).await?.unwrap_or_default();
        apply(&mut doc);
        let bytes = serde_json::to_vec_pretty(&doc)?;
        write_atomic(&path, &bytes).await?;
        debug!(user_id, path = %path.display(), "document written");
        Ok(doc)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<String, UserDocument>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, user_id: &str, doc: UserDocument) {
        self.docs.lock().await.insert(user_id.to_string(), doc);
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, user_id: &str) -> Result<Option<UserDocument>, StoreError> {
        Ok(self.docs.lock().await.get(user_id).cloned())
    }

    async fn update(&self, user_id: &str, apply: DocumentUpdate) -> Result<UserDocument, StoreError> {
        let mut docs = self.docs.lock().await;
        let doc = docs.entry(user_id.to_string()).or_default();
        apply(doc);
        Ok(doc.clone())
    }
}

/// Long-lived pointer into the API key pool, kept outside any user's document.
#[async_trait]
pub trait RotationStore: Send + Sync {
    async fn load(&self) -> Result<u64, StoreError>;
    async fn persist(&self, index: u64) -> Result<(), StoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct RotationFile {
    index: u64,
}

#[derive(Debug, Clone)]
pub struct FileRotationStore {
    path: PathBuf,
}

impl FileRotationStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            path: root.as_ref().join("rotation_index.json"),
        }
    }
}

#[async_trait]
impl RotationStore for FileRotationStore {
    async fn load(&self) -> Result<u64, StoreError> {
        match fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice::<RotationFile>(&bytes)
                .map(|f| f.index)
                .map_err(|source| StoreError::Corrupt {
                    path: self.path.clone(),
                    source,
                }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(source) => Err(StoreError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    async fn persist(&self, index: u64) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(&RotationFile { index })?;
        write_atomic(&self.path, &bytes).await
    }
}

#[derive(Debug, Default)]
pub struct MemoryRotationStore {
    index: AtomicU64,
}

impl MemoryRotationStore {
    pub fn starting_at(index: u64) -> Self {
        Self {
            index: AtomicU64::new(index),
        }
    }
}

#[async_trait]
impl RotationStore for MemoryRotationStore {
    async fn load(&self) -> Result<u64, StoreError> {
        Ok(self.index.load(Ordering::SeqCst))
    }

    async fn persist(&self, index: u64) -> Result<(), StoreError> {
        self.index.store(index, Ordering::SeqCst);
        Ok(())
    }
}

/// How a failed request should affect the fetch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    ClientConfig,
    ServiceUnavailable,
    Transient,
}

pub fn classify_status(status: StatusCode) -> FailureClass {
    if status.is_client_error() {
        FailureClass::ClientConfig
    } else if status.is_server_error() {
        FailureClass::ServiceUnavailable
    } else {
        FailureClass::Transient
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
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
    pub concurrency: usize,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            concurrency: 8,
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
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
    #[error("fetcher is shutting down")]
    Closed,
}

impl FetchError {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(FailureClass::Transient),
            Self::Request(_) | Self::Closed => FailureClass::Transient,
        }
    }
}

/// Single-shot GETs with a client-wide timeout; retry policy belongs to the caller.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
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
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            token_bucket,
        })
    }

    pub async fn fetch_bytes(&self, url: reqwest::Url) -> Result<FetchedResponse, FetchError> {
        let _permit = self.admit().await?;
        let span = info_span!("http_fetch", host = url.host_str().unwrap_or_default());
        async {
            let resp = self.send_get(url).await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            let body = resp.bytes().await?.to_vec();
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }

    /// Streams the body until `complete` accepts the buffered prefix or `max_bytes` are held.
    pub async fn fetch_prefix<F>(
        &self,
        url: reqwest::Url,
        max_bytes: usize,
        mut complete: F,
    ) -> Result<FetchedResponse, FetchError>
    where
        F: FnMut(&[u8]) -> bool + Send,
    {
        let _permit = self.admit().await?;
        let span = info_span!("http_fetch_prefix", host = url.host_str().unwrap_or_default());
        async {
            let mut resp = self.send_get(url).await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            let mut body = Vec::new();
            while let Some(chunk) = resp.chunk().await? {
                let full = append_capped(&mut body, &chunk, max_bytes);
                if full || complete(&body) {
                    break;
                }
            }
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }

    async fn admit(&self) -> Result<SemaphorePermit<'_>, FetchError> {
        let permit = self.limit.acquire().await.map_err(|_| FetchError::Closed)?;
        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }
        Ok(permit)
    }

    async fn send_get(&self, url: reqwest::Url) -> Result<reqwest::Response, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(resp)
    }
}

/// Appends at most `max_bytes - buf.len()` bytes of `chunk`; `true` once the buffer is full.
pub fn append_capped(buf: &mut Vec<u8>, chunk: &[u8], max_bytes: usize) -> bool {
    let room = max_bytes.saturating_sub(buf.len());
    buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
    buf.len() >= max_bytes
}
