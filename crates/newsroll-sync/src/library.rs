//! Per-user library operations layered on the document store: registration, feed view,
//! favorites, read tracking, metrics and search.

use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use newsroll_core::{Article, ReadRecord, Slides, StatePatch, UserDocument};
use newsroll_storage::{DocumentStore, StoreError};
use thiserror::Error;
use tracing::{debug, info};

use crate::gate::article_doc_id;

const MIN_SINGLE_WORD_LEN: usize = 4;
const UNKNOWN_CATEGORY: &str = "Unknown";

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("article {0} is already a favorite")]
    AlreadyFavorite(String),
    #[error("there are no favorites to remove")]
    NoFavorites,
    #[error("search query cannot be empty")]
    EmptyQuery,
    #[error("a single search word must be at least 4 characters long")]
    QueryTooShort,
    #[error("invalid date {0:?}; expected DD-MM-YYYY")]
    InvalidDate(String),
    #[error("unknown search criterion {0:?}")]
    UnknownCriterion(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub async fn begin_registration(store: &dyn DocumentStore, user_id: &str) -> Result<(), StoreError> {
    store
        .set(
            user_id,
            StatePatch {
                first_login: Some(true),
                registering: Some(true),
                ..StatePatch::default()
            },
        )
        .await
}

pub async fn finish_registration(store: &dyn DocumentStore, user_id: &str) -> Result<(), StoreError> {
    store
        .set(
            user_id,
            StatePatch {
                registering: Some(false),
                ..StatePatch::default()
            },
        )
        .await
}

/// Creates the refresh record, waits `settle`, then lets the gate see the user.
pub async fn register_user(
    store: &dyn DocumentStore,
    user_id: &str,
    settle: Duration,
) -> Result<(), StoreError> {
    begin_registration(store, user_id).await?;
    tokio::time::sleep(settle).await;
    finish_registration(store, user_id).await?;
    info!(user_id, "registration finished");
    Ok(())
}

/// Stored slides with the bottom slice narrowed to `category`.
pub async fn feed_slides(
    store: &dyn DocumentStore,
    user_id: &str,
    category: &str,
) -> Result<Slides, StoreError> {
    let articles = store
        .get(user_id)
        .await?
        .map(|doc| doc.state.articles)
        .unwrap_or_default();
    Ok(Slides::from_articles(&articles).filter_bottom_by_category(category))
}

pub async fn add_favorite(
    store: &dyn DocumentStore,
    user_id: &str,
    article: Article,
) -> Result<(), LibraryError> {
    let id = article_doc_id(&article);
    let duplicate = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&duplicate);
    let key = id.clone();
    store
        .update(
            user_id,
            Box::new(move |doc: &mut UserDocument| {
                if doc.favorites.contains_key(&key) {
                    flag.store(true, Ordering::Relaxed);
                } else {
                    doc.favorites.insert(key, article);
                }
            }),
        )
        .await?;
    if duplicate.load(Ordering::Relaxed) {
        return Err(LibraryError::AlreadyFavorite(id));
    }
    Ok(())
}

/// Returns whether a favorite was removed.
pub async fn remove_favorite(
    store: &dyn DocumentStore,
    user_id: &str,
    article_id: &str,
) -> Result<bool, StoreError> {
    let removed = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&removed);
    let key = article_id.to_string();
    store
        .update(
            user_id,
            Box::new(move |doc: &mut UserDocument| {
                flag.store(doc.favorites.remove(&key).is_some(), Ordering::Relaxed);
            }),
        )
        .await?;
    Ok(removed.load(Ordering::Relaxed))
}

pub async fn list_favorites(store: &dyn DocumentStore, user_id: &str) -> Result<Vec<Article>, StoreError> {
    Ok(store
        .get(user_id)
        .await?
        .map(|doc| doc.favorites.into_values().collect())
        .unwrap_or_default())
}

pub async fn clear_favorites(store: &dyn DocumentStore, user_id: &str) -> Result<usize, LibraryError> {
    let cleared = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&cleared);
    store
        .update(
            user_id,
            Box::new(move |doc: &mut UserDocument| {
                counter.store(doc.favorites.len(), Ordering::Relaxed);
                doc.favorites.clear();
            }),
        )
        .await?;
    match cleared.load(Ordering::Relaxed) {
        0 => Err(LibraryError::NoFavorites),
        n => Ok(n),
    }
}

/// Records that the user opened `article`; at most one record per article id.
pub async fn track_read(
    store: &dyn DocumentStore,
    user_id: &str,
    article: &Article,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let record = ReadRecord {
        article_id: article.article_id.clone(),
        title: article.title.clone(),
        category: article
            .category
            .clone()
            .unwrap_or_else(|| UNKNOWN_CATEGORY.into()),
        timestamp: now,
    };
    let added = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&added);
    store
        .update(
            user_id,
            Box::new(move |doc: &mut UserDocument| {
                if !doc.reads.iter().any(|r| r.article_id == record.article_id) {
                    doc.reads.push(record);
                    flag.store(true, Ordering::Relaxed);
                }
            }),
        )
        .await?;
    Ok(added.load(Ordering::Relaxed))
}

/// Reads per lower-cased category; list categories count once per entry.
pub async fn category_metrics(
    store: &dyn DocumentStore,
    user_id: &str,
) -> Result<BTreeMap<String, usize>, StoreError> {
    let mut counts = BTreeMap::new();
    let Some(doc) = store.get(user_id).await? else {
        return Ok(counts);
    };
    for read in &doc.reads {
        for category in read.category.values() {
            *counts.entry(category.trim().to_lowercase()).or_insert(0) += 1;
        }
    }
    Ok(counts)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchCriterion {
    Title,
    Language,
    Keywords,
    Category,
    PubDate,
}

impl FromStr for SearchCriterion {
    type Err = LibraryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "title" => Ok(Self::Title),
            "language" => Ok(Self::Language),
            "keywords" => Ok(Self::Keywords),
            "category" => Ok(Self::Category),
            "pubDate" | "pub_date" => Ok(Self::PubDate),
            other => Err(LibraryError::UnknownCriterion(other.to_string())),
        }
    }
}

impl SearchCriterion {
    fn requires_long_single_word(self) -> bool {
        matches!(self, Self::Title | Self::Keywords | Self::Category)
    }

    fn field(self, article: &Article) -> Option<String> {
        match self {
            Self::Title => Some(article.title.clone()),
            Self::Language => article.language.clone(),
            Self::Keywords => article.keywords.as_ref().map(|k| k.joined(" ")),
            Self::Category => article.category.as_ref().map(|c| c.joined(" ")),
            Self::PubDate => Some(article.pub_date.chars().take(10).collect()),
        }
    }
}

/// Validates and normalizes a query: lower-cased, dates rewritten from DD-MM-YYYY to YYYY-MM-DD.
pub fn normalize_query(criterion: SearchCriterion, raw: &str) -> Result<String, LibraryError> {
    let query = raw.trim().to_lowercase();
    if query.is_empty() {
        return Err(LibraryError::EmptyQuery);
    }
    let words = query
        .split(|c: char| c.is_whitespace() || ",.;!?".contains(c))
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>();
    if criterion.requires_long_single_word()
        && words.len() == 1
        && words[0].chars().count() < MIN_SINGLE_WORD_LEN
    {
        return Err(LibraryError::QueryTooShort);
    }
    if criterion == SearchCriterion::PubDate {
        let date = NaiveDate::parse_from_str(&query, "%d-%m-%Y")
            .map_err(|_| LibraryError::InvalidDate(raw.trim().to_string()))?;
        return Ok(date.format("%Y-%m-%d").to_string());
    }
    Ok(query)
}

/// Matches every query word against the chosen field; one result per distinct title.
pub fn search_articles<'a>(
    articles: impl IntoIterator<Item = &'a Article>,
    criterion: SearchCriterion,
    query: &str,
) -> Vec<Article> {
    let mut titles = HashSet::new();
    articles
        .into_iter()
        .filter(|article| {
            let Some(field) = criterion.field(article) else {
                return false;
            };
            let field = field.to_lowercase();
            query.split_whitespace().all(|word| field.contains(word))
        })
        .filter(|article| titles.insert(article.title.trim().to_string()))
        .cloned()
        .collect()
}

pub async fn search(
    store: &dyn DocumentStore,
    user_id: &str,
    criterion: SearchCriterion,
    raw_query: &str,
) -> Result<Vec<Article>, LibraryError> {
    let query = normalize_query(criterion, raw_query)?;
    let Some(doc) = store.get(user_id).await? else {
        return Ok(Vec::new());
    };
    let results = search_articles(doc.article_docs.values(), criterion, &query);
    debug!(user_id, ?criterion, hits = results.len(), "search finished");
    Ok(results)
}
