use std::collections::HashSet;

use newsroll_core::Article;

/// Content identity of a description: lower-cased with all whitespace removed.
///
/// Punctuation is kept, so "1.5%" and "15%" stay distinct. Returns `None` for blank input.
pub fn fingerprint(description: &str) -> Option<String> {
    let normalized = description
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect::<String>();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

pub fn article_fingerprint(article: &Article) -> Option<String> {
    article.description.as_deref().and_then(fingerprint)
}

/// Set of fingerprints already present in a user's collection or accepted this cycle.
#[derive(Debug, Clone, Default)]
pub struct Deduplicator {
    seen: HashSet<String>,
}

impl Deduplicator {
    pub fn from_articles<'a>(articles: impl IntoIterator<Item = &'a Article>) -> Self {
        Self {
            seen: articles.into_iter().filter_map(article_fingerprint).collect(),
        }
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.seen.contains(fingerprint)
    }

    /// Records the fingerprint; `false` means it was already seen.
    pub fn insert(&mut self, fingerprint: String) -> bool {
        self.seen.insert(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Appends `incoming` articles whose fingerprint is new, skipping blanks. Returns how many were added.
    pub fn merge_into(&mut self, collection: &mut Vec<Article>, incoming: Vec<Article>) -> usize {
        let before = collection.len();
        for article in incoming {
            if let Some(fp) = article_fingerprint(&article) {
                if self.insert(fp) {
                    collection.push(article);
                }
            }
        }
        collection.len() - before
    }
}
