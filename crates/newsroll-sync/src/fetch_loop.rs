//! Paginated fetch loop, driven as an explicit state machine.
//!
//! ```text
//! Requesting --page--------------> Accepted --target/exhausted--> Done(completed)
//!     |                                |----budget spent-------> Done(aborted-budget)
//!     |                                `----otherwise-----------> Requesting
//!     |--timeout/network/decode--> Retrying --budget spent-----> Done(aborted-budget)
//!     |                                `----otherwise-----------> Requesting
//!     |--4xx-----------------------> AbortedClient -------------> Done(aborted-client-error)
//!     |--5xx-----------------------> AbortedServer -------------> Done(aborted-server-error)
//!     `--session ended-------------------------------------------> Done(cancelled)
//! ```

use futures::future::join_all;
use newsroll_core::Article;
use newsroll_feed::{FeedApi, FeedPage, ImageProbe};
use newsroll_storage::FailureClass;
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, warn, Instrument};

use crate::config::FetchLoopConfig;
use crate::dedup::{article_fingerprint, Deduplicator};
use crate::rotator::KeyRotator;
use crate::session::SessionHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CycleStatus {
    Completed,
    AbortedClientError,
    AbortedServerError,
    AbortedBudget,
    Cancelled,
}

impl CycleStatus {
    /// The failure worth surfacing to the user, if any.
    pub fn failure_class(&self) -> Option<FailureClass> {
        match self {
            Self::AbortedClientError => Some(FailureClass::ClientConfig),
            Self::AbortedServerError => Some(FailureClass::ServiceUnavailable),
            _ => None,
        }
    }
}

/// Outcome of one fetch cycle. `articles` keeps fetch order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchCycleResult {
    pub articles: Vec<Article>,
    pub requests: usize,
    pub transient_failures: usize,
    pub status: CycleStatus,
}

#[derive(Debug)]
pub enum RequestOutcome {
    Page(FeedPage),
    Failed(FailureClass),
    TimedOut,
}

#[derive(Debug)]
pub enum LoopState {
    Requesting,
    Accepted(FeedPage),
    Retrying,
    AbortedClient,
    AbortedServer,
    Done(CycleStatus),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Progress {
    pub requests: usize,
    pub accepted: usize,
    pub consecutive_failures: usize,
}

impl LoopState {
    pub fn before_request(progress: &Progress, config: &FetchLoopConfig) -> Self {
        if progress.accepted >= config.target_valid {
            Self::Done(CycleStatus::Completed)
        } else if progress.requests >= config.max_requests {
            Self::Done(CycleStatus::AbortedBudget)
        } else {
            Self::Requesting
        }
    }

    pub fn on_outcome(outcome: RequestOutcome) -> Self {
        match outcome {
            RequestOutcome::Page(page) => Self::Accepted(page),
            RequestOutcome::Failed(FailureClass::ClientConfig) => Self::AbortedClient,
            RequestOutcome::Failed(FailureClass::ServiceUnavailable) => Self::AbortedServer,
            RequestOutcome::Failed(FailureClass::Transient) | RequestOutcome::TimedOut => {
                Self::Retrying
            }
        }
    }

    pub fn after_accept(progress: &Progress, exhausted: bool, config: &FetchLoopConfig) -> Self {
        if progress.accepted >= config.target_valid || exhausted {
            Self::Done(CycleStatus::Completed)
        } else {
            Self::before_request(progress, config)
        }
    }
}

/// One cycle's collaborators; the loop itself holds no state between cycles.
pub struct FetchLoop<'a> {
    pub feed: &'a dyn FeedApi,
    pub probe: &'a dyn ImageProbe,
    pub rotator: &'a KeyRotator,
    pub config: &'a FetchLoopConfig,
}

impl FetchLoop<'_> {
    pub async fn run(&self, mut seen: Deduplicator, session: &SessionHandle) -> FetchCycleResult {
        let mut progress = Progress::default();
        let mut articles = Vec::new();
        let mut transient_failures = 0usize;
        // Drawn on the first request and again after each transient failure.
        let mut key: Option<String> = None;
        let mut cursor: Option<String> = None;
        let mut state = LoopState::before_request(&progress, self.config);

        let status = loop {
            state = match state {
                LoopState::Requesting if !session.is_active() => {
                    LoopState::Done(CycleStatus::Cancelled)
                }
                LoopState::Requesting => {
                    let api_key = match key.take() {
                        Some(api_key) => api_key,
                        None => self.rotator.next().await,
                    };
                    progress.requests += 1;
                    let span = info_span!("feed_request", request_no = progress.requests);
                    let outcome = self
                        .request(&api_key, cursor.as_deref())
                        .instrument(span)
                        .await;
                    key = Some(api_key);
                    LoopState::on_outcome(outcome)
                }
                LoopState::Accepted(page) => {
                    progress.consecutive_failures = 0;
                    let exhausted = page.is_empty() || page.next_page.is_none();
                    cursor = page.next_page;
                    let room = self.config.target_valid.saturating_sub(progress.accepted);
                    let accepted = self
                        .accept_page(page.results.unwrap_or_default(), &mut seen, room)
                        .await;
                    progress.accepted += accepted.len();
                    debug!(
                        accepted = accepted.len(),
                        total = progress.accepted,
                        exhausted,
                        "page processed"
                    );
                    articles.extend(accepted);
                    LoopState::after_accept(&progress, exhausted, self.config)
                }
                LoopState::Retrying => {
                    transient_failures += 1;
                    key = None;
                    cursor = None;
                    let delay = self
                        .config
                        .backoff
                        .delay_for_attempt(progress.consecutive_failures);
                    progress.consecutive_failures += 1;
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    LoopState::before_request(&progress, self.config)
                }
                LoopState::AbortedClient => LoopState::Done(CycleStatus::AbortedClientError),
                LoopState::AbortedServer => LoopState::Done(CycleStatus::AbortedServerError),
                LoopState::Done(status) => break status,
            };
        };

        FetchCycleResult {
            articles,
            requests: progress.requests,
            transient_failures,
            status,
        }
    }

    async fn request(&self, key: &str, cursor: Option<&str>) -> RequestOutcome {
        let fetch = self.feed.fetch_page(key, cursor);
        match tokio::time::timeout(self.config.request_timeout, fetch).await {
            Ok(Ok(page)) => RequestOutcome::Page(page),
            Ok(Err(err)) => {
                let class = err.class();
                warn!(error = %err, ?class, "feed request failed");
                RequestOutcome::Failed(class)
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.config.request_timeout.as_secs(),
                    "feed request timed out"
                );
                RequestOutcome::TimedOut
            }
        }
    }

    /// Validates one page; image probes run concurrently, acceptance follows page order.
    async fn accept_page(
        &self,
        results: Vec<Article>,
        seen: &mut Deduplicator,
        room: usize,
    ) -> Vec<Article> {
        let candidates = results
            .into_iter()
            .filter_map(|article| {
                let fp = article_fingerprint(&article)?;
                if seen.contains(&fp) || !self.config.allows_language(article.language.as_deref()) {
                    return None;
                }
                let url = article
                    .image_url
                    .as_deref()
                    .map(str::trim)
                    .filter(|u| !u.is_empty())?
                    .to_string();
                Some((article, fp, url))
            })
            .collect::<Vec<_>>();

        let probes = join_all(candidates.iter().map(|(_, _, url)| self.probe.probe(url))).await;

        let mut accepted = Vec::new();
        for ((article, fp, url), probe) in candidates.into_iter().zip(probes) {
            if accepted.len() >= room {
                break;
            }
            match probe {
                Ok(dims) if dims.covers(self.config.min_image) => {
                    if seen.insert(fp) {
                        accepted.push(article);
                    }
                }
                Ok(dims) => debug!(url, width = dims.width, height = dims.height, "image too small"),
                Err(err) => debug!(url, error = %err, "image probe failed"),
            }
        }
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use newsroll_feed::{FeedError, FixtureFeed};
    use newsroll_storage::{BackoffPolicy, MemoryRotationStore, RotationStore};

    use crate::testing::{page, valid_article, ScriptedFeed, SizedProbe, Step};

    /// Every page carries one fresh valid article and another cursor.
    #[derive(Default)]
    struct EndlessFeed {
        served: Mutex<usize>,
    }

    #[async_trait]
    impl FeedApi for EndlessFeed {
        async fn fetch_page(&self, _api_key: &str, _cursor: Option<&str>) -> Result<FeedPage, FeedError> {
            let served = {
                let mut served = self.served.lock().unwrap();
                *served += 1;
                *served
            };
            Ok(FeedPage {
                results: Some(vec![valid_article(&format!("endless-{served}"))]),
                next_page: Some(format!("cursor-{served}")),
            })
        }
    }

    fn rotator(keys: &[&str]) -> KeyRotator {
        KeyRotator::new(
            keys.iter().map(ToString::to_string).collect(),
            Arc::new(MemoryRotationStore::default()),
        )
        .unwrap()
    }

    fn config() -> FetchLoopConfig {
        FetchLoopConfig {
            backoff: BackoffPolicy::none(),
            ..FetchLoopConfig::default()
        }
    }

    async fn run(feed: &dyn FeedApi, keys: &KeyRotator, config: &FetchLoopConfig) -> FetchCycleResult {
        FetchLoop {
            feed,
            probe: &SizedProbe,
            rotator: keys,
            config,
        }
        .run(Deduplicator::default(), &SessionHandle::detached())
        .await
    }

    #[test]
    fn transition_table() {
        let config = FetchLoopConfig {
            target_valid: 2,
            max_requests: 3,
            ..FetchLoopConfig::default()
        };
        let mut progress = Progress::default();
        assert!(matches!(LoopState::before_request(&progress, &config), LoopState::Requesting));
        assert!(matches!(
            LoopState::on_outcome(RequestOutcome::Failed(FailureClass::ClientConfig)),
            LoopState::AbortedClient
        ));
        assert!(matches!(
            LoopState::on_outcome(RequestOutcome::Failed(FailureClass::ServiceUnavailable)),
            LoopState::AbortedServer
        ));
        assert!(matches!(LoopState::on_outcome(RequestOutcome::TimedOut), LoopState::Retrying));
        assert!(matches!(
            LoopState::after_accept(&progress, true, &config),
            LoopState::Done(CycleStatus::Completed)
        ));

        progress.requests = 3;
        assert!(matches!(
            LoopState::after_accept(&progress, false, &config),
            LoopState::Done(CycleStatus::AbortedBudget)
        ));
        progress.accepted = 2;
        assert!(matches!(
            LoopState::after_accept(&progress, false, &config),
            LoopState::Done(CycleStatus::Completed)
        ));
    }

    #[tokio::test]
    async fn fixture_page_yields_twenty_valid_articles() {
        let feed = FixtureFeed::new(Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/newsdata"));
        let keys = rotator(&["k1"]);
        let result = run(&feed, &keys, &config()).await;

        assert_eq!(result.status, CycleStatus::Completed);
        assert_eq!(result.requests, 1);
        assert_eq!(result.articles.len(), 20);
        let ids = result.articles.iter().map(|a| a.article_id.as_str()).collect::<Vec<_>>();
        assert!(!ids.contains(&"nd-021"), "german article accepted");
        assert!(!ids.contains(&"nd-024"), "small image accepted");
        assert!(!ids.contains(&"nd-025"), "duplicate description accepted");
    }

    #[tokio::test]
    async fn acceptance_stops_at_target() {
        let feed = ScriptedFeed::new(vec![Step::Page(page(
            (0..5).map(|i| valid_article(&format!("a{i}"))).collect(),
            Some("next"),
        ))]);
        let keys = rotator(&["k1"]);
        let config = FetchLoopConfig {
            target_valid: 3,
            ..config()
        };
        let result = run(&feed, &keys, &config).await;
        assert_eq!(result.status, CycleStatus::Completed);
        assert_eq!(result.articles.len(), 3);
        assert_eq!(feed.calls().len(), 1);
    }

    #[tokio::test]
    async fn invalid_candidates_are_rejected() {
        let mut no_image = valid_article("no-image");
        no_image.image_url = Some("  ".into());
        let mut blank = valid_article("blank");
        blank.description = Some(" \t ".into());
        let mut broken = valid_article("broken");
        broken.image_url = Some("https://img.example.com/broken.jpg".into());
        let mut twin = valid_article("twin");
        twin.description = valid_article("keep").description.map(|d| d.to_uppercase());

        let feed = ScriptedFeed::new(vec![Step::Page(page(
            vec![valid_article("keep"), no_image, blank, broken, twin],
            None,
        ))]);
        let keys = rotator(&["k1"]);
        let result = run(&feed, &keys, &config()).await;
        let ids = result.articles.iter().map(|a| a.article_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, ["keep"]);
        assert_eq!(result.status, CycleStatus::Completed);
    }

    #[tokio::test]
    async fn client_error_aborts_without_retry() {
        let feed = ScriptedFeed::new(vec![Step::Status(401), Step::Page(page(vec![valid_article("x")], None))]);
        let keys = rotator(&["k1", "k2"]);
        let result = run(&feed, &keys, &config()).await;
        assert_eq!(result.status, CycleStatus::AbortedClientError);
        assert_eq!(result.requests, 1);
        assert!(result.articles.is_empty());
        assert_eq!(feed.calls().len(), 1);
    }

    #[tokio::test]
    async fn server_error_keeps_articles_gathered_so_far() {
        let feed = ScriptedFeed::new(vec![
            Step::Page(page(vec![valid_article("first")], Some("p2"))),
            Step::Status(503),
        ]);
        let keys = rotator(&["k1"]);
        let result = run(&feed, &keys, &config()).await;
        assert_eq!(result.status, CycleStatus::AbortedServerError);
        assert_eq!(result.requests, 2);
        assert_eq!(result.articles.len(), 1);
        assert_eq!(feed.calls()[1].1.as_deref(), Some("p2"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_rotates_key_and_resets_cursor() {
        let feed = ScriptedFeed::new(vec![
            Step::Page(page(vec![valid_article("first")], Some("p2"))),
            Step::Hang,
            Step::Page(page(vec![valid_article("second")], None)),
        ]);
        let keys = rotator(&["k1", "k2"]);
        let config = FetchLoopConfig {
            request_timeout: Duration::from_secs(60),
            ..config()
        };
        let result = run(&feed, &keys, &config).await;

        assert_eq!(result.status, CycleStatus::Completed);
        assert_eq!(result.transient_failures, 1);
        assert_eq!(result.requests, 3);
        let calls = feed.calls();
        assert_eq!(calls[0], ("k1".to_string(), None));
        assert_eq!(calls[1], ("k1".to_string(), Some("p2".to_string())));
        assert_eq!(calls[2], ("k2".to_string(), None));
        assert_eq!(result.articles.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn decode_errors_back_off_between_retries() {
        let feed = ScriptedFeed::new(vec![Step::Garbage, Step::Garbage, Step::Page(page(vec![], None))]);
        let keys = rotator(&["k1", "k2", "k3"]);
        let config = FetchLoopConfig {
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(1),
            },
            ..FetchLoopConfig::default()
        };
        let started = tokio::time::Instant::now();
        let result = run(&feed, &keys, &config).await;
        assert_eq!(result.status, CycleStatus::Completed);
        assert_eq!(result.transient_failures, 2);
        assert!(started.elapsed() >= Duration::from_millis(300));
        let keys_used = feed.calls().into_iter().map(|(k, _)| k).collect::<Vec<_>>();
        assert_eq!(keys_used, ["k1", "k2", "k3"]);
    }

    #[tokio::test]
    async fn loop_terminates_within_request_budget() {
        let feed = EndlessFeed::default();
        let keys = rotator(&["k1"]);
        let result = run(&feed, &keys, &config()).await;
        assert_eq!(result.status, CycleStatus::AbortedBudget);
        assert_eq!(result.requests, 15);
        assert_eq!(result.articles.len(), 15);
    }

    #[tokio::test]
    async fn transient_failures_count_against_budget() {
        let feed = ScriptedFeed::new((0..20).map(|_| Step::Garbage).collect());
        let keys = rotator(&["k1", "k2"]);
        let result = run(&feed, &keys, &config()).await;
        assert_eq!(result.status, CycleStatus::AbortedBudget);
        assert_eq!(result.requests, 15);
        assert_eq!(result.transient_failures, 15);
    }

    #[tokio::test]
    async fn ended_session_stops_before_requesting() {
        let feed = ScriptedFeed::new(vec![]);
        let keys = rotator(&["k1"]);
        let (control, handle) = crate::session::session_pair();
        control.end();
        let result = FetchLoop {
            feed: &feed,
            probe: &SizedProbe,
            rotator: &keys,
            config: &config(),
        }
        .run(Deduplicator::default(), &handle)
        .await;
        assert_eq!(result.status, CycleStatus::Cancelled);
        assert_eq!(result.requests, 0);
    }

    #[tokio::test]
    async fn key_is_not_drawn_without_a_request() {
        let store = Arc::new(MemoryRotationStore::starting_at(3));
        let keys = KeyRotator::new(vec!["k1".into(), "k2".into()], store.clone()).unwrap();
        let feed = ScriptedFeed::new(vec![]);
        let no_budget = FetchLoopConfig {
            max_requests: 0,
            ..config()
        };

        let exhausted = run(&feed, &keys, &no_budget).await;
        assert_eq!(exhausted.status, CycleStatus::AbortedBudget);

        let (control, handle) = crate::session::session_pair();
        control.end();
        let cancelled = FetchLoop {
            feed: &feed,
            probe: &SizedProbe,
            rotator: &keys,
            config: &config(),
        }
        .run(Deduplicator::default(), &handle)
        .await;
        assert_eq!(cancelled.status, CycleStatus::Cancelled);

        assert!(feed.calls().is_empty());
        assert_eq!(store.load().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn successful_pages_reuse_one_key() {
        let feed = ScriptedFeed::new(vec![
            Step::Page(page(vec![valid_article("a")], Some("p2"))),
            Step::Page(page(vec![valid_article("b")], None)),
        ]);
        let keys = rotator(&["k1", "k2"]);
        let result = run(&feed, &keys, &config()).await;
        assert_eq!(result.articles.len(), 2);
        let keys_used = feed.calls().into_iter().map(|(k, _)| k).collect::<Vec<_>>();
        assert_eq!(keys_used, ["k1", "k1"]);
    }

    #[tokio::test]
    async fn seeded_fingerprints_block_known_content() {
        let existing = vec![valid_article("old")];
        let mut repeat = valid_article("new-id");
        repeat.description = existing[0].description.clone();
        let feed = ScriptedFeed::new(vec![Step::Page(page(vec![repeat], None))]);
        let keys = rotator(&["k1"]);
        let config = config();
        let result = FetchLoop {
            feed: &feed,
            probe: &SizedProbe,
            rotator: &keys,
            config: &config,
        }
        .run(Deduplicator::from_articles(&existing), &SessionHandle::detached())
        .await;
        assert!(result.articles.is_empty());
    }
}
