//! Identity events and the single subscription that turns sign-ins into refresh cycles.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::gate::RefreshGate;

const AUTH_EVENT_CAPACITY: usize = 16;

/// Read side of a session's liveness flag.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    active: watch::Receiver<bool>,
}

impl SessionHandle {
    pub fn is_active(&self) -> bool {
        *self.active.borrow()
    }

    /// A session nobody can end, for one-shot callers such as the CLI.
    pub fn detached() -> Self {
        let (_control, handle) = session_pair();
        handle
    }
}

#[derive(Debug)]
pub struct SessionControl {
    active: watch::Sender<bool>,
}

impl SessionControl {
    pub fn end(&self) {
        self.active.send_replace(false);
    }
}

pub fn session_pair() -> (SessionControl, SessionHandle) {
    let (tx, rx) = watch::channel(true);
    (SessionControl { active: tx }, SessionHandle { active: rx })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn { user_id: String },
    SignedOut,
}

pub trait IdentityProvider: Send + Sync {
    fn current_user(&self) -> Option<String>;
    fn on_auth_change(&self) -> broadcast::Receiver<AuthEvent>;
}

/// Process-local identity, driven by whoever authenticates users.
#[derive(Debug)]
pub struct LocalIdentity {
    current: watch::Sender<Option<String>>,
    events: broadcast::Sender<AuthEvent>,
}

impl Default for LocalIdentity {
    fn default() -> Self {
        let (current, _) = watch::channel(None);
        let (events, _) = broadcast::channel(AUTH_EVENT_CAPACITY);
        Self { current, events }
    }
}

impl LocalIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sign_in(&self, user_id: impl Into<String>) {
        let user_id = user_id.into();
        self.current.send_replace(Some(user_id.clone()));
        let _ = self.events.send(AuthEvent::SignedIn { user_id });
    }

    pub fn sign_out(&self) {
        self.current.send_replace(None);
        let _ = self.events.send(AuthEvent::SignedOut);
    }
}

impl IdentityProvider for LocalIdentity {
    fn current_user(&self) -> Option<String> {
        self.current.borrow().clone()
    }

    fn on_auth_change(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }
}

struct ActiveSession {
    user_id: String,
    control: SessionControl,
    task: JoinHandle<()>,
}

/// Owns the one subscription that triggers refresh cycles; at most one cycle per user runs at a time.
pub struct SessionListener {
    gate: Arc<RefreshGate>,
}

impl SessionListener {
    pub fn new(gate: Arc<RefreshGate>) -> Self {
        Self { gate }
    }

    /// Subscribes to `identity` and runs until its event stream closes.
    pub fn spawn(self, identity: &dyn IdentityProvider) -> JoinHandle<()> {
        let events = identity.on_auth_change();
        let initial = identity.current_user();
        tokio::spawn(self.run(initial, events))
    }

    pub async fn run(self, initial: Option<String>, mut events: broadcast::Receiver<AuthEvent>) {
        let mut active: Option<ActiveSession> = None;
        let mut draining: Vec<JoinHandle<()>> = Vec::new();

        if let Some(user_id) = initial {
            active = Some(self.start(user_id));
        }

        loop {
            match events.recv().await {
                Ok(AuthEvent::SignedIn { user_id }) => {
                    if let Some(current) = &active {
                        if current.user_id == user_id && !current.task.is_finished() {
                            debug!(user_id = %user_id, "refresh already in flight; sign-in ignored");
                            continue;
                        }
                    }
                    if let Some(previous) = active.take() {
                        previous.control.end();
                        draining.push(previous.task);
                    }
                    active = Some(self.start(user_id));
                }
                Ok(AuthEvent::SignedOut) => {
                    if let Some(previous) = active.take() {
                        info!(user_id = %previous.user_id, "signed out; ending session");
                        previous.control.end();
                        draining.push(previous.task);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "auth events dropped; listener fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
            draining.retain(|task| !task.is_finished());
        }

        draining.extend(active.map(|session| session.task));
        for task in draining {
            if let Err(err) = task.await {
                error!(error = %err, "refresh task panicked");
            }
        }
    }

    fn start(&self, user_id: String) -> ActiveSession {
        let (control, handle) = session_pair();
        let gate = Arc::clone(&self.gate);
        let task_user = user_id.clone();
        let task = tokio::spawn(async move {
            match gate.run_refresh_cycle(&task_user, Utc::now(), &handle).await {
                Ok(outcome) => debug!(
                    user_id = %task_user,
                    decision = ?outcome.decision,
                    added = outcome.added,
                    "refresh finished"
                ),
                Err(err) => error!(user_id = %task_user, error = ?err, "refresh cycle failed"),
            }
        });
        ActiveSession {
            user_id,
            control,
            task,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use newsroll_core::UserDocument;
    use newsroll_feed::{FeedApi, FeedError, FeedPage};
    use newsroll_storage::{BackoffPolicy, DocumentStore, MemoryRotationStore, MemoryStore};

    use crate::config::{FetchLoopConfig, RefreshConfig};
    use crate::rotator::KeyRotator;
    use crate::testing::{page, valid_article, ScriptedFeed, SizedProbe, Step};

    /// Answers after a fixed delay so a cycle stays in flight.
    struct SlowFeed {
        delay: Duration,
        inner: ScriptedFeed,
    }

    #[async_trait]
    impl FeedApi for SlowFeed {
        async fn fetch_page(&self, api_key: &str, cursor: Option<&str>) -> Result<FeedPage, FeedError> {
            tokio::time::sleep(self.delay).await;
            self.inner.fetch_page(api_key, cursor).await
        }
    }

    fn gate(store: Arc<MemoryStore>, feed: Arc<dyn FeedApi>) -> Arc<RefreshGate> {
        let rotator =
            KeyRotator::new(vec!["k1".into()], Arc::new(MemoryRotationStore::default())).unwrap();
        let config = RefreshConfig {
            fetch: FetchLoopConfig {
                backoff: BackoffPolicy::none(),
                ..FetchLoopConfig::default()
            },
            ..RefreshConfig::default()
        };
        Arc::new(RefreshGate::new(store, feed, Arc::new(SizedProbe), rotator, config))
    }

    fn slow_feed(steps: Vec<Step>) -> Arc<SlowFeed> {
        Arc::new(SlowFeed {
            delay: Duration::from_secs(5),
            inner: ScriptedFeed::new(steps),
        })
    }

    #[test]
    fn ending_a_session_is_visible_to_its_handles() {
        let (control, handle) = session_pair();
        let copy = handle.clone();
        assert!(handle.is_active());
        control.end();
        assert!(!handle.is_active());
        assert!(!copy.is_active());
        assert!(SessionHandle::detached().is_active());
    }

    #[test]
    fn local_identity_tracks_current_user() {
        let identity = LocalIdentity::new();
        let mut events = identity.on_auth_change();
        identity.sign_in("u1");
        assert_eq!(identity.current_user().as_deref(), Some("u1"));
        identity.sign_out();
        assert_eq!(identity.current_user(), None);
        assert_eq!(events.try_recv().unwrap(), AuthEvent::SignedIn { user_id: "u1".into() });
        assert_eq!(events.try_recv().unwrap(), AuthEvent::SignedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_sign_in_runs_one_cycle() {
        let store = Arc::new(MemoryStore::new());
        let feed = slow_feed(vec![Step::Page(page(vec![valid_article("n1")], None))]);
        let gate = gate(store.clone(), feed.clone());
        let (tx, rx) = broadcast::channel(8);
        let listener = tokio::spawn(SessionListener::new(gate).run(None, rx));

        tx.send(AuthEvent::SignedIn { user_id: "u1".into() }).unwrap();
        tx.send(AuthEvent::SignedIn { user_id: "u1".into() }).unwrap();
        drop(tx);
        listener.await.unwrap();

        assert_eq!(feed.inner.calls().len(), 1);
        let doc = store.get("u1").await.unwrap().unwrap();
        assert_eq!(doc.state.articles.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sign_out_mid_cycle_discards_commit() {
        let store = Arc::new(MemoryStore::new());
        store.insert("u1", UserDocument::default()).await;
        let feed = slow_feed(vec![Step::Page(page(vec![valid_article("n1")], None))]);
        let gate = gate(store.clone(), feed);
        let (tx, rx) = broadcast::channel(8);
        let listener = tokio::spawn(SessionListener::new(gate).run(None, rx));

        tx.send(AuthEvent::SignedIn { user_id: "u1".into() }).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(AuthEvent::SignedOut).unwrap();
        drop(tx);
        listener.await.unwrap();

        assert_eq!(store.get("u1").await.unwrap().unwrap(), UserDocument::default());
    }

    #[tokio::test]
    async fn initial_user_is_refreshed_on_attach() {
        let store = Arc::new(MemoryStore::new());
        let feed = Arc::new(ScriptedFeed::new(vec![Step::Page(page(vec![valid_article("n1")], None))]));
        let gate = gate(store.clone(), feed.clone());
        let identity = LocalIdentity::new();
        identity.sign_in("u1");

        let listener = SessionListener::new(gate).spawn(&identity);
        drop(identity);
        listener.await.unwrap();

        assert_eq!(feed.calls().len(), 1);
        assert!(store.get("u1").await.unwrap().is_some());
    }
}
