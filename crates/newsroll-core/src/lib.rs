//! Core domain model for Newsroll: articles, per-user refresh state and hour buckets.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "newsroll-core";

/// `YYYY-MM-DD-HH`, compared for equality across sessions and devices.
pub const FETCH_KEY_FORMAT: &str = "%Y-%m-%d-%H";

pub const DEFAULT_REFERENCE_TIMEZONE: &str = "Europe/Helsinki";

/// Number of articles in each presentation slice.
pub const SLIDE_PAGE_SIZE: usize = 10;

#[derive(Debug, Error)]
pub enum FetchKeyError {
    #[error("unknown reference timezone `{0}`")]
    UnknownTimezone(String),
}

pub fn parse_timezone(name: &str) -> Result<Tz, FetchKeyError> {
    name.parse::<Tz>()
        .map_err(|_| FetchKeyError::UnknownTimezone(name.to_string()))
}

/// Hour bucket key for one hour-long window in the reference timezone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FetchKey(String);

impl FetchKey {
    pub fn for_instant(now: DateTime<Utc>, reference: Tz) -> Self {
        Self(now.with_timezone(&reference).format(FETCH_KEY_FORMAT).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for FetchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Feed fields that arrive either as a scalar string or as a list of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

pub type Category = OneOrMany;
pub type Keywords = OneOrMany;

impl OneOrMany {
    pub fn values(&self) -> Vec<&str> {
        match self {
            Self::One(value) => vec![value.as_str()],
            Self::Many(values) => values.iter().map(String::as_str).collect(),
        }
    }

    pub fn joined(&self, separator: &str) -> String {
        self.values().join(separator)
    }
}

impl From<&str> for OneOrMany {
    fn from(value: &str) -> Self {
        Self::One(value.to_string())
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// A single feed item as stored in a user's collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub article_id: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub title: String,
    #[serde(rename = "pubDate", default, deserialize_with = "null_as_empty")]
    pub pub_date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keywords: Option<Keywords>,
}

impl Article {
    /// Publish instant; the feed sends `YYYY-MM-DD HH:MM:SS` in UTC, older data may be RFC 3339.
    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.pub_date.trim();
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
            return Some(naive.and_utc());
        }
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Lower-cased category text with list entries joined by `", "`.
    pub fn category_text(&self) -> String {
        self.category
            .as_ref()
            .map(|c| c.joined(", "))
            .unwrap_or_default()
            .to_lowercase()
    }
}

/// Stable sort by publish time, newest first; unparseable dates go last.
pub fn sort_newest_first(articles: &mut [Article]) {
    articles.sort_by(|a, b| b.published_at().cmp(&a.published_at()));
}

/// Top and bottom presentation slices.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Slides {
    pub top: Vec<Article>,
    pub bottom: Vec<Article>,
}

impl Slides {
    pub fn from_articles(articles: &[Article]) -> Self {
        let mut sorted = articles.to_vec();
        sort_newest_first(&mut sorted);
        let bottom = sorted
            .iter()
            .skip(SLIDE_PAGE_SIZE)
            .take(SLIDE_PAGE_SIZE)
            .cloned()
            .collect();
        sorted.truncate(SLIDE_PAGE_SIZE);
        Self {
            top: sorted,
            bottom,
        }
    }

    /// Keep only bottom-slice articles whose category matches `selected` (`all` keeps everything).
    pub fn filter_bottom_by_category(mut self, selected: &str) -> Self {
        let selected = selected.trim().to_lowercase();
        if selected.is_empty() || selected == "all" {
            return self;
        }
        self.bottom
            .retain(|article| article.category_text().contains(&selected));
        self
    }
}

/// Per-user record consulted and committed by the refresh gate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRefreshState {
    #[serde(default)]
    pub last_fetch_key: Option<String>,
    #[serde(default)]
    pub first_login: bool,
    #[serde(default)]
    pub registering: bool,
    #[serde(default)]
    pub articles: Vec<Article>,
}

/// Partial update merged into a stored [`UserRefreshState`]; `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch {
    pub last_fetch_key: Option<String>,
    pub first_login: Option<bool>,
    pub registering: Option<bool>,
    pub articles: Option<Vec<Article>>,
}

impl StatePatch {
    pub fn apply(self, state: &mut UserRefreshState) {
        if let Some(key) = self.last_fetch_key {
            state.last_fetch_key = Some(key);
        }
        if let Some(first_login) = self.first_login {
            state.first_login = first_login;
        }
        if let Some(registering) = self.registering {
            state.registering = registering;
        }
        if let Some(articles) = self.articles {
            state.articles = articles;
        }
    }
}

/// One article a user opened, kept for reading metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadRecord {
    pub article_id: String,
    pub title: String,
    pub category: Category,
    pub timestamp: DateTime<Utc>,
}

/// Everything the document store keeps for one user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserDocument {
    #[serde(flatten)]
    pub state: UserRefreshState,
    /// Per-article sub-collection keyed by document id.
    #[serde(default, rename = "articleDocs")]
    pub article_docs: BTreeMap<String, Article>,
    #[serde(default)]
    pub favorites: BTreeMap<String, Article>,
    #[serde(default)]
    pub reads: Vec<ReadRecord>,
}
