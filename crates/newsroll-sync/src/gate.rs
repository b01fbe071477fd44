use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use newsroll_core::{Article, FetchKey, Slides, UserDocument, UserRefreshState};
use newsroll_feed::{FeedApi, ImageProbe};
use newsroll_storage::{DocumentStore, FailureClass};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::RefreshConfig;
use crate::dedup::{article_fingerprint, Deduplicator};
use crate::fetch_loop::{CycleStatus, FetchCycleResult, FetchLoop};
use crate::rotator::KeyRotator;
use crate::session::SessionHandle;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GateDecision {
    Run,
    SkipThisHour,
    SkipRegistering,
}

/// Run iff the bucket changed or this is the first login, and never while registering.
pub fn decide(state: &UserRefreshState, fetch_key: &FetchKey) -> GateDecision {
    if state.registering {
        GateDecision::SkipRegistering
    } else if state.first_login || state.last_fetch_key.as_deref() != Some(fetch_key.as_str()) {
        GateDecision::Run
    } else {
        GateDecision::SkipThisHour
    }
}

/// Notifications for whoever presents refresh progress to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RefreshEvent {
    FetchStarted {
        user_id: String,
        fetch_key: String,
    },
    FetchFinished {
        user_id: String,
        accepted: usize,
        requests: usize,
        status: CycleStatus,
    },
    FetchSkippedThisHour {
        user_id: String,
        fetch_key: String,
    },
    FetchFailed {
        user_id: String,
        kind: FailureClass,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub accepted: usize,
    pub requests: usize,
    pub transient_failures: usize,
    pub status: CycleStatus,
}

impl From<&FetchCycleResult> for CycleSummary {
    fn from(result: &FetchCycleResult) -> Self {
        Self {
            accepted: result.articles.len(),
            requests: result.requests,
            transient_failures: result.transient_failures,
            status: result.status,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshOutcome {
    pub fetch_key: String,
    pub decision: GateDecision,
    pub slides: Slides,
    pub cycle: Option<CycleSummary>,
    /// Articles actually appended to the stored collection.
    pub added: usize,
    pub committed: bool,
}

/// Key for the per-article sub-collection; falls back to the content fingerprint.
pub fn article_doc_id(article: &Article) -> String {
    let id = article.article_id.trim();
    if !id.is_empty() {
        return id.to_string();
    }
    match article_fingerprint(article) {
        Some(fp) => format!("fp:{fp}"),
        None => String::from("fp:"),
    }
}

pub struct RefreshGate {
    store: Arc<dyn DocumentStore>,
    feed: Arc<dyn FeedApi>,
    probe: Arc<dyn ImageProbe>,
    rotator: KeyRotator,
    config: RefreshConfig,
    events: broadcast::Sender<RefreshEvent>,
}

impl RefreshGate {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        feed: Arc<dyn FeedApi>,
        probe: Arc<dyn ImageProbe>,
        rotator: KeyRotator,
        config: RefreshConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            feed,
            probe,
            rotator,
            config,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RefreshEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn config(&self) -> &RefreshConfig {
        &self.config
    }

    pub fn fetch_key(&self, now: DateTime<Utc>) -> FetchKey {
        FetchKey::for_instant(now, self.config.reference)
    }

    fn emit(&self, event: RefreshEvent) {
        // No subscribers is the normal headless case.
        let _ = self.events.send(event);
    }

    pub async fn run_refresh_cycle(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        session: &SessionHandle,
    ) -> Result<RefreshOutcome> {
        let fetch_key = self.fetch_key(now);
        let span = info_span!("refresh_cycle", user_id, fetch_key = %fetch_key);
        self.cycle(user_id, fetch_key, session).instrument(span).await
    }

    async fn cycle(
        &self,
        user_id: &str,
        fetch_key: FetchKey,
        session: &SessionHandle,
    ) -> Result<RefreshOutcome> {
        let doc = self
            .store
            .get(user_id)
            .await
            .with_context(|| format!("loading refresh state for user {user_id}"))?
            .unwrap_or_default();

        let decision = decide(&doc.state, &fetch_key);
        if decision != GateDecision::Run {
            if decision == GateDecision::SkipThisHour {
                debug!("already refreshed this hour");
                self.emit(RefreshEvent::FetchSkippedThisHour {
                    user_id: user_id.to_string(),
                    fetch_key: fetch_key.to_string(),
                });
            } else {
                info!("registration still in progress; refresh skipped");
            }
            return Ok(RefreshOutcome {
                fetch_key: fetch_key.into_string(),
                decision,
                slides: Slides::from_articles(&doc.state.articles),
                cycle: None,
                added: 0,
                committed: false,
            });
        }

        self.emit(RefreshEvent::FetchStarted {
            user_id: user_id.to_string(),
            fetch_key: fetch_key.to_string(),
        });
        info!(
            stored = doc.state.articles.len(),
            first_login = doc.state.first_login,
            "running fetch cycle"
        );

        let result = FetchLoop {
            feed: self.feed.as_ref(),
            probe: self.probe.as_ref(),
            rotator: &self.rotator,
            config: &self.config.fetch,
        }
        .run(Deduplicator::from_articles(&doc.state.articles), session)
        .await;
        let summary = CycleSummary::from(&result);
        self.report_failures(user_id, &result);

        if !session.is_active() {
            info!(accepted = summary.accepted, "session ended before commit; cycle discarded");
            self.finished(user_id, &summary);
            return Ok(RefreshOutcome {
                fetch_key: fetch_key.into_string(),
                decision,
                slides: Slides::from_articles(&doc.state.articles),
                cycle: Some(summary),
                added: 0,
                committed: false,
            });
        }

        let (committed, added) = self
            .commit(user_id, &fetch_key, result.articles)
            .await
            .with_context(|| format!("committing refresh cycle for user {user_id}"))?;
        info!(
            added,
            total = committed.state.articles.len(),
            status = ?summary.status,
            "refresh cycle committed"
        );
        self.finished(user_id, &summary);

        let stored = &committed.state.articles;
        let slides = if added > 0 {
            Slides::from_articles(&stored[stored.len() - added..])
        } else {
            Slides::from_articles(stored)
        };
        Ok(RefreshOutcome {
            fetch_key: fetch_key.into_string(),
            decision,
            slides,
            cycle: Some(summary),
            added,
            committed: true,
        })
    }

    fn report_failures(&self, user_id: &str, result: &FetchCycleResult) {
        if result.transient_failures > 0 {
            warn!(
                retries = result.transient_failures,
                "transient feed failures during cycle"
            );
            self.emit(RefreshEvent::FetchFailed {
                user_id: user_id.to_string(),
                kind: FailureClass::Transient,
            });
        }
        if let Some(kind) = result.status.failure_class() {
            warn!(?kind, "fetch cycle aborted");
            self.emit(RefreshEvent::FetchFailed {
                user_id: user_id.to_string(),
                kind,
            });
        }
    }

    fn finished(&self, user_id: &str, summary: &CycleSummary) {
        self.emit(RefreshEvent::FetchFinished {
            user_id: user_id.to_string(),
            accepted: summary.accepted,
            requests: summary.requests,
            status: summary.status,
        });
    }

    /// Merges `incoming` into the stored collection and advances the bucket in one update.
    async fn commit(
        &self,
        user_id: &str,
        fetch_key: &FetchKey,
        incoming: Vec<Article>,
    ) -> Result<(UserDocument, usize)> {
        let key = fetch_key.to_string();
        let added = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&added);
        let doc = self
            .store
            .update(
                user_id,
                Box::new(move |doc: &mut UserDocument| {
                    let mut seen = Deduplicator::from_articles(&doc.state.articles);
                    let count = seen.merge_into(&mut doc.state.articles, incoming);
                    let start = doc.state.articles.len() - count;
                    for article in &doc.state.articles[start..] {
                        doc.article_docs
                            .insert(article_doc_id(article), article.clone());
                    }
                    doc.state.last_fetch_key = Some(key);
                    doc.state.first_login = false;
                    counter.store(count, Ordering::Relaxed);
                }),
            )
            .await?;
        Ok((doc, added.load(Ordering::Relaxed)))
    }
}
