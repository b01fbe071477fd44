//! News feed API contract, the newsdata.io client, fixture pages and image-dimension probing.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use newsroll_core::Article;
use newsroll_storage::{FailureClass, FetchError, HttpFetcher};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "newsroll-feed";

pub const DEFAULT_FEED_BASE_URL: &str = "https://newsdata.io/api/1";

/// One page of feed results plus the opaque continuation cursor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedPage {
    #[serde(default)]
    pub results: Option<Vec<Article>>,
    #[serde(rename = "nextPage", default)]
    pub next_page: Option<String>,
}

impl FeedPage {
    pub fn is_empty(&self) -> bool {
        self.results.as_ref().map_or(true, Vec::is_empty)
    }
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed answered http {status}")]
    Status { status: u16 },
    #[error("feed transport error: {0}")]
    Transport(String),
    #[error("feed response could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
}

impl FeedError {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Status { status } => FetchError::HttpStatus {
                status: *status,
                url: String::new(),
            }
            .class(),
            Self::Transport(_) | Self::Decode(_) => FailureClass::Transient,
        }
    }
}

impl From<FetchError> for FeedError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::HttpStatus { status, .. } => Self::Status { status },
            other => Self::Transport(other.to_string()),
        }
    }
}

/// Paginated news feed keyed by an API credential.
#[async_trait]
pub trait FeedApi: Send + Sync {
    async fn fetch_page(&self, api_key: &str, cursor: Option<&str>) -> Result<FeedPage, FeedError>;
}

pub fn decode_page(bytes: &[u8]) -> Result<FeedPage, FeedError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// `GET {base}/news?apikey=K[&page=P]`.
#[derive(Debug, Clone)]
pub struct NewsDataFeed {
    http: HttpFetcher,
    base_url: String,
}

impl NewsDataFeed {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub fn page_url(&self, api_key: &str, cursor: Option<&str>) -> Result<Url, FeedError> {
        let endpoint = format!("{}/news", self.base_url.trim_end_matches('/'));
        let mut params = vec![("apikey", api_key)];
        if let Some(page) = cursor {
            params.push(("page", page));
        }
        Url::parse_with_params(&endpoint, &params).map_err(|e| FeedError::Transport(e.to_string()))
    }
}

#[async_trait]
impl FeedApi for NewsDataFeed {
    async fn fetch_page(&self, api_key: &str, cursor: Option<&str>) -> Result<FeedPage, FeedError> {
        let url = self.page_url(api_key, cursor)?;
        let response = self.http.fetch_bytes(url).await?;
        let page = decode_page(&response.body)?;
        debug!(
            results = page.results.as_ref().map_or(0, Vec::len),
            has_next = page.next_page.is_some(),
            "feed page decoded"
        );
        Ok(page)
    }
}

pub fn load_fixture_page(path: impl AsRef<Path>) -> Result<FeedPage> {
    let path = path.as_ref();
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    decode_page(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Serves pages from `<dir>/<cursor>.json`; the first request reads `page-1.json`.
#[derive(Debug, Clone)]
pub struct FixtureFeed {
    dir: PathBuf,
}

impl FixtureFeed {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl FeedApi for FixtureFeed {
    async fn fetch_page(&self, _api_key: &str, cursor: Option<&str>) -> Result<FeedPage, FeedError> {
        let name = format!("{}.json", cursor.unwrap_or("page-1"));
        let path = self.dir.join(name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => decode_page(&bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(FeedError::Status { status: 404 })
            }
            Err(err) => Err(FeedError::Transport(format!("{}: {err}", path.display()))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDimensions {
    pub width: u32,
    pub height: u32,
}

impl ImageDimensions {
    pub fn covers(&self, minimum: ImageDimensions) -> bool {
        self.width >= minimum.width && self.height >= minimum.height
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("image download failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("invalid image url: {0}")]
    Url(String),
    #[error("unrecognised image data: {0}")]
    Format(String),
}

/// Resolves an image URL to its natural pixel dimensions.
#[async_trait]
pub trait ImageProbe: Send + Sync {
    async fn probe(&self, url: &str) -> Result<ImageDimensions, ProbeError>;
}

pub fn dimensions_from_bytes(bytes: &[u8]) -> Result<ImageDimensions, ProbeError> {
    let size = imagesize::blob_size(bytes).map_err(|e| ProbeError::Format(e.to_string()))?;
    Ok(ImageDimensions {
        width: u32::try_from(size.width).unwrap_or(u32::MAX),
        height: u32::try_from(size.height).unwrap_or(u32::MAX),
    })
}

/// Upper bound on how much of an image is buffered while looking for its dimensions.
pub const MAX_HEADER_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct HttpImageProbe {
    http: HttpFetcher,
}

impl HttpImageProbe {
    pub fn new(http: HttpFetcher) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ImageProbe for HttpImageProbe {
    async fn probe(&self, url: &str) -> Result<ImageDimensions, ProbeError> {
        let url = Url::parse(url).map_err(|e| ProbeError::Url(e.to_string()))?;
        let response = self
            .http
            .fetch_prefix(url, MAX_HEADER_BYTES, |prefix| imagesize::blob_size(prefix).is_ok())
            .await?;
        dimensions_from_bytes(&response.body)
    }
}
