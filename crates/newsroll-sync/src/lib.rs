//! Hourly refresh orchestration: key rotation, the paginated fetch loop, dedup, the refresh
//! gate and the per-user library operations built on the same document store.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use newsroll_feed::{HttpImageProbe, NewsDataFeed};
use newsroll_storage::{
    DocumentStore, FileRotationStore, HttpClientConfig, HttpFetcher, JsonFileStore, TokenBucketConfig,
};
use tracing::info;

pub mod config;
pub mod dedup;
pub mod fetch_loop;
pub mod gate;
pub mod library;
pub mod rotator;
pub mod session;

#[cfg(test)]
mod testing;

pub use config::{FeedRules, FetchLoopConfig, RefreshConfig, SyncConfig};
pub use dedup::{article_fingerprint, fingerprint, Deduplicator};
pub use fetch_loop::{CycleStatus, FetchCycleResult, FetchLoop};
pub use gate::{decide, GateDecision, RefreshEvent, RefreshGate, RefreshOutcome};
pub use library::{LibraryError, SearchCriterion};
pub use rotator::{KeyRotator, RotatorError};
pub use session::{AuthEvent, IdentityProvider, LocalIdentity, SessionHandle, SessionListener};

pub const CRATE_NAME: &str = "newsroll-sync";

/// Pacing for the concurrent image probes of one page.
const PROBE_PACING: TokenBucketConfig = TokenBucketConfig {
    capacity: 10,
    refill_every: Duration::from_millis(100),
};
const PROBE_CONCURRENCY: usize = 6;

/// Everything a front end needs, wired from one [`SyncConfig`].
pub struct Services {
    pub config: SyncConfig,
    pub store: Arc<dyn DocumentStore>,
    pub gate: Arc<RefreshGate>,
}

impl Services {
    pub fn from_config(config: SyncConfig) -> Result<Self> {
        let rules = FeedRules::from_workspace_root(&config.workspace_root)?;
        let refresh = config.refresh_config(rules)?;
        let http_config = HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        };
        let feed_http = HttpFetcher::new(HttpClientConfig {
            concurrency: 1,
            ..http_config.clone()
        })?;
        let probe_http = HttpFetcher::new(HttpClientConfig {
            concurrency: PROBE_CONCURRENCY,
            token_bucket: Some(PROBE_PACING),
            ..http_config
        })?;

        let store: Arc<dyn DocumentStore> = Arc::new(JsonFileStore::new(config.data_dir.clone()));
        let rotator = KeyRotator::new(
            config.api_keys.clone(),
            Arc::new(FileRotationStore::new(&config.data_dir)),
        )
        .context("NEWSDATA_API_KEYS must name at least one key")?;
        let gate = RefreshGate::new(
            Arc::clone(&store),
            Arc::new(NewsDataFeed::new(feed_http, config.feed_base_url.clone())),
            Arc::new(HttpImageProbe::new(probe_http)),
            rotator,
            refresh,
        );
        info!(
            data_dir = %config.data_dir.display(),
            keys = config.api_keys.len(),
            "refresh services ready"
        );
        Ok(Self {
            config,
            store,
            gate: Arc::new(gate),
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::from_config(SyncConfig::from_env())
    }
}

pub async fn refresh_once_from_env(user_id: &str) -> Result<RefreshOutcome> {
    let services = Services::from_env()?;
    services
        .gate
        .run_refresh_cycle(user_id, Utc::now(), &SessionHandle::detached())
        .await
}

pub async fn register_from_env(user_id: &str) -> Result<()> {
    let config = SyncConfig::from_env();
    let store = JsonFileStore::new(config.data_dir.clone());
    library::register_user(&store, user_id, config.registration_settle())
        .await
        .with_context(|| format!("registering user {user_id}"))
}
