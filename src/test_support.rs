//! Fixtures and test doubles shared by the unit tests.

use crate::api::TextGenerator;
use crate::error::{Result, RobotError};
use crate::images::{GeneratedImage, ImageBackend};
use crate::models::{Article, ContentScores, DraftArticle, DraftStatus, ParseTier};
use crate::publisher::Cms;
use crate::sources::ArticleSource;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

pub fn sample_article(url: &str) -> Article {
    Article {
        url: url.to_string(),
        title: "Central Bank Holds Rates Steady".to_string(),
        body: "The central bank left its benchmark rate unchanged on Wednesday, \
               citing cooling inflation and a resilient labour market."
            .to_string(),
        published_at: Utc.with_ymd_and_hms(2025, 6, 11, 12, 0, 0).unwrap(),
        feed_id: "test-feed".to_string(),
    }
}

pub fn sample_draft(article_id: &str) -> DraftArticle {
    let now = Utc::now();
    DraftArticle {
        id: Uuid::new_v4().to_string(),
        article_id: article_id.to_string(),
        source_url: format!("https://x.com/{article_id}"),
        source_title: "Central Bank Holds Rates Steady".to_string(),
        source_feed: "test-feed".to_string(),
        title: "Rates Stay Put".to_string(),
        body: "<p>Rewritten body</p>".to_string(),
        meta_description: None,
        keywords: Vec::new(),
        variant_id: "journalistic".to_string(),
        parse_tier: ParseTier::Structured,
        scores: ContentScores::default(),
        image: None,
        status: DraftStatus::Pending,
        post_id: None,
        reviewer_notes: None,
        reviewed_at: None,
        created_at: now,
        updated_at: now,
    }
}

/// Replies from a fixed script; the last reply repeats.
pub struct ScriptedGenerator {
    replies: Vec<String>,
    unreachable: bool,
    calls: AtomicUsize,
    last_prompt: Mutex<Option<String>>,
}

impl ScriptedGenerator {
    pub fn always(reply: &str) -> Self {
        Self::sequence(&[reply])
    }

    pub fn sequence(replies: &[&str]) -> Self {
        Self {
            replies: replies.iter().map(|r| r.to_string()).collect(),
            unreachable: false,
            calls: AtomicUsize::new(0),
            last_prompt: Mutex::new(None),
        }
    }

    /// Every call fails the way a timed-out request does.
    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::sequence(&[])
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.last_prompt.lock().unwrap().clone()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_prompt.lock().unwrap() = Some(prompt.to_string());
        if self.unreachable {
            return Err(RobotError::Backend {
                backend: "scripted".into(),
                message: "request timed out".into(),
            });
        }
        let reply = self
            .replies
            .get(n)
            .or_else(|| self.replies.last())
            .cloned()
            .unwrap_or_default();
        Ok(reply)
    }
}

enum CmsBehaviour {
    Succeed(u64),
    Unauthorized,
    Transient,
}

pub struct MockCms {
    behaviour: CmsBehaviour,
    calls: AtomicUsize,
}

impl MockCms {
    fn with(behaviour: CmsBehaviour) -> Self {
        Self {
            behaviour,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn succeeding(post_id: u64) -> Self {
        Self::with(CmsBehaviour::Succeed(post_id))
    }

    pub fn unauthorized() -> Self {
        Self::with(CmsBehaviour::Unauthorized)
    }

    pub fn transient() -> Self {
        Self::with(CmsBehaviour::Transient)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Cms for MockCms {
    fn name(&self) -> &str {
        "mock"
    }

    async fn publish(&self, _draft: &DraftArticle) -> Result<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behaviour {
            CmsBehaviour::Succeed(id) => Ok(id),
            CmsBehaviour::Unauthorized => Err(RobotError::PublishAuth {
                status: 401,
                message: "invalid application password".into(),
            }),
            CmsBehaviour::Transient => Err(RobotError::PublishTransient("HTTP 503".into())),
        }
    }
}

pub struct StaticImageBackend {
    result: Option<GeneratedImage>,
}

impl StaticImageBackend {
    pub fn bytes(bytes: Vec<u8>) -> Self {
        Self {
            result: Some(GeneratedImage::Bytes(bytes)),
        }
    }

    pub fn url(url: &str) -> Self {
        Self {
            result: Some(GeneratedImage::Url(url.to_string())),
        }
    }

    pub fn failing() -> Self {
        Self { result: None }
    }
}

#[async_trait]
impl ImageBackend for StaticImageBackend {
    fn name(&self) -> &str {
        "static"
    }

    async fn generate_image(&self, _prompt: &str) -> Result<GeneratedImage> {
        self.result
            .clone()
            .ok_or_else(|| RobotError::Image("HTTP 500: backend down".into()))
    }
}

pub struct StaticSource {
    articles: Vec<Article>,
}

impl StaticSource {
    pub fn new(articles: Vec<Article>) -> Self {
        Self { articles }
    }
}

#[async_trait]
impl ArticleSource for StaticSource {
    async fn fetch_articles(&self) -> Result<Vec<Article>> {
        Ok(self.articles.clone())
    }
}
