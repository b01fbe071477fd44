//! In-memory feed and probe doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use newsroll_core::Article;
use newsroll_feed::{FeedApi, FeedError, FeedPage, ImageDimensions, ImageProbe, ProbeError};

pub enum Step {
    Page(FeedPage),
    Status(u16),
    Garbage,
    Hang,
}

/// Replays `steps` in order, then answers with empty pages.
#[derive(Default)]
pub struct ScriptedFeed {
    steps: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<(String, Option<String>)>>,
}

impl ScriptedFeed {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            calls: Mutex::default(),
        }
    }

    pub fn calls(&self) -> Vec<(String, Option<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl FeedApi for ScriptedFeed {
    async fn fetch_page(&self, api_key: &str, cursor: Option<&str>) -> Result<FeedPage, FeedError> {
        self.calls
            .lock()
            .unwrap()
            .push((api_key.to_string(), cursor.map(ToString::to_string)));
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(Step::Page(page)) => Ok(page),
            Some(Step::Status(status)) => Err(FeedError::Status { status }),
            Some(Step::Garbage) => Err(newsroll_feed::decode_page(b"<html>").unwrap_err()),
            Some(Step::Hang) => std::future::pending().await,
            None => Ok(FeedPage::default()),
        }
    }
}

/// Images whose URL mentions `thumb` are 150x100, `broken` fails, everything else is 640x360.
pub struct SizedProbe;

#[async_trait]
impl ImageProbe for SizedProbe {
    async fn probe(&self, url: &str) -> Result<ImageDimensions, ProbeError> {
        if url.contains("broken") {
            return Err(ProbeError::Format("not an image".into()));
        }
        Ok(if url.contains("thumb") {
            ImageDimensions { width: 150, height: 100 }
        } else {
            ImageDimensions { width: 640, height: 360 }
        })
    }
}

pub fn valid_article(id: &str) -> Article {
    Article {
        article_id: id.to_string(),
        title: format!("Title {id}"),
        pub_date: "2024-01-01 09:00:00".into(),
        description: Some(format!("Unique description for {id}")),
        image_url: Some(format!("https://img.example.com/{id}.jpg")),
        link: Some(format!("https://news.example.com/{id}")),
        language: Some("english".into()),
        category: Some("top".into()),
        keywords: None,
    }
}

pub fn page(articles: Vec<Article>, next: Option<&str>) -> FeedPage {
    FeedPage {
        results: Some(articles),
        next_page: next.map(ToString::to_string),
    }
}
