//! Article sources.
//!
//! The pipeline only sees the [`ArticleSource`] trait. The production source
//! is [`FeedFetcher`], which works in two phases per configured feed:
//!
//! 1. **Indexing**: download the feed and parse its items ([`rss`])
//! 2. **Fetching**: download each item's page and extract the text ([`extract`])
//!
//! A failing feed or page is logged and skipped; it never fails the batch.

use crate::config::{FeedConfig, RobotConfig};
use crate::error::{Result, RobotError};
use crate::models::Article;
use crate::utils::blocked_domain;
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use itertools::Itertools;
use reqwest::Client;
use tracing::{debug, error, info, instrument, warn};

pub mod extract;
pub mod rss;

use extract::{choose_body, extract_article_text};
use rss::{FeedItem, parse_feed};

#[async_trait]
pub trait ArticleSource: Send + Sync {
    /// Candidate articles for this run, without duplicates by URL.
    async fn fetch_articles(&self) -> Result<Vec<Article>>;
}

pub struct FeedFetcher {
    client: Client,
    feeds: Vec<FeedConfig>,
    max_items_per_feed: usize,
    min_content_chars: usize,
    blocked_domains: Vec<String>,
}

impl FeedFetcher {
    pub fn from_config(client: Client, config: &RobotConfig) -> Self {
        Self {
            client,
            feeds: config.feeds.clone(),
            max_items_per_feed: config.max_items_per_feed,
            min_content_chars: config.min_content_chars,
            blocked_domains: config.blocked_domains.clone(),
        }
    }

    #[instrument(level = "info", skip_all, fields(feed = %feed.id))]
    async fn fetch_feed(&self, feed: &FeedConfig) -> Result<Vec<FeedItem>> {
        let response = self
            .client
            .get(&feed.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| RobotError::Feed(format!("{}: {e}", feed.url)))?;
        let xml = response
            .text()
            .await
            .map_err(|e| RobotError::Feed(format!("{}: {e}", feed.url)))?;
        let items = parse_feed(&xml)?;
        info!(count = items.len(), "Indexed feed items");
        Ok(items)
    }

    async fn fetch_page_text(&self, url: &str) -> Result<String> {
        let html = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| RobotError::Feed(e.to_string()))?
            .text()
            .await
            .map_err(|e| RobotError::Feed(e.to_string()))?;
        Ok(extract_article_text(&html))
    }

    #[instrument(level = "debug", skip_all, fields(url = %item.link))]
    async fn build_article(&self, feed: &FeedConfig, item: FeedItem) -> Option<Article> {
        if item.link.is_empty() || item.title.is_empty() {
            warn!(feed = %feed.id, "Feed item without link or title");
            return None;
        }
        if let Some(domain) = blocked_domain(&item.link, &self.blocked_domains) {
            warn!(%domain, "Skipping blocked domain");
            return None;
        }

        let page_text = match self.fetch_page_text(&item.link).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Page fetch failed; falling back to feed text");
                String::new()
            }
        };
        let Some(body) = choose_body(
            &page_text,
            &item.content,
            &item.summary,
            self.min_content_chars,
        ) else {
            warn!(
                chars = page_text.chars().count(),
                min = self.min_content_chars,
                "Article too short; skipping"
            );
            return None;
        };

        Some(Article {
            url: item.link,
            title: item.title,
            body,
            published_at: item.published.unwrap_or_else(Utc::now),
            feed_id: feed.id.clone(),
        })
    }

    async fn articles_for_feed(&self, feed: &FeedConfig) -> Vec<Article> {
        let items = match self.fetch_feed(feed).await {
            Ok(items) => items,
            Err(e) => {
                error!(feed = %feed.id, stage = "fetch", error = %e, "Feed fetch failed");
                return Vec::new();
            }
        };

        let mut articles = Vec::new();
        for item in items.into_iter().take(self.max_items_per_feed) {
            if let Some(article) = self.build_article(feed, item).await {
                debug!(url = %article.url, chars = article.body.len(), "Fetched article");
                articles.push(article);
            }
        }
        articles
    }
}

#[async_trait]
impl ArticleSource for FeedFetcher {
    #[instrument(level = "info", skip_all, fields(feeds = self.feeds.len()))]
    async fn fetch_articles(&self) -> Result<Vec<Article>> {
        let per_feed: Vec<Vec<Article>> = stream::iter(self.feeds.iter())
            .then(|feed| self.articles_for_feed(feed))
            .collect()
            .await;

        let articles: Vec<Article> = per_feed
            .into_iter()
            .flatten()
            .unique_by(|a| a.url.clone())
            .collect();
        info!(count = articles.len(), "Fetched candidate articles");
        Ok(articles)
    }
}
