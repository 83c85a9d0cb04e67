//! One run of the robot, end to end.
//!
//! # Stages
//!
//! For each candidate article, strictly one after another:
//!
//! 1. **Dedup**: skip articles already finalised or already queued
//! 2. **Style**: pick a prompt variant
//! 3. **Rewrite**: call the AI backend and parse its reply
//! 4. **Image**: optional cover image, failures ignored
//! 5. **Approval**: store the draft, auto-approving in auto mode
//! 6. **Publish**: push approved drafts to the CMS
//!
//! Before new articles are handled, drafts left `approved` by an earlier
//! failed publish are retried.
//!
//! # Errors
//!
//! A failing article never stops the run. Each failure is logged with the
//! article identifier and stage and counted in [`RunSummary`]. The one
//! run-wide reaction is to a CMS authentication failure: publishing is
//! switched off for the rest of the run.

use crate::approval::ApprovalGate;
use crate::dedup::{DuplicateFilter, article_identifier};
use crate::error::RobotError;
use crate::images::ImageGenerator;
use crate::models::{Article, DraftStatus};
use crate::notify::{Level, Notifier};
use crate::prompts::PromptSelector;
use crate::publisher::Publisher;
use crate::rewriter::Rewriter;
use crate::sources::ArticleSource;
use crate::store::RecordStore;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};

/// Counters for one run.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub fetched: usize,
    pub duplicates: usize,
    /// Articles skipped after reaching the rewrite attempt limit.
    pub exhausted: usize,
    pub storage_skipped: usize,
    pub rewrite_failed: usize,
    pub images: usize,
    pub drafted: usize,
    pub pending: usize,
    pub published: usize,
    pub publish_failed: usize,
    pub auth_failed: bool,
}

impl RunSummary {
    pub fn headline(&self) -> String {
        format!(
            "Run finished: {} fetched, {} duplicates, {} drafted ({} pending), {} published, \
             {} rewrite failures, {} publish failures",
            self.fetched,
            self.duplicates,
            self.drafted,
            self.pending,
            self.published,
            self.rewrite_failed,
            self.publish_failed
        )
    }
}

pub struct Pipeline {
    source: Arc<dyn ArticleSource>,
    store: Arc<dyn RecordStore>,
    dedup: DuplicateFilter,
    selector: Arc<PromptSelector>,
    rewriter: Rewriter,
    gate: ApprovalGate,
    images: Option<ImageGenerator>,
    publisher: Option<Publisher>,
    notifier: Option<Notifier>,
    max_generation_attempts: Option<u32>,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn ArticleSource>,
        store: Arc<dyn RecordStore>,
        selector: Arc<PromptSelector>,
        rewriter: Rewriter,
        gate: ApprovalGate,
    ) -> Self {
        Self {
            source,
            dedup: DuplicateFilter::new(store.clone()),
            store,
            selector,
            rewriter,
            gate,
            images: None,
            publisher: None,
            notifier: None,
            max_generation_attempts: None,
        }
    }

    pub fn with_images(mut self, images: Option<ImageGenerator>) -> Self {
        self.images = images;
        self
    }

    pub fn with_publisher(mut self, publisher: Option<Publisher>) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn with_notifier(mut self, notifier: Option<Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_generation_limit(mut self, limit: Option<u32>) -> Self {
        self.max_generation_attempts = limit;
        self
    }

    async fn notify(&self, message: &str, level: Level) {
        if let Some(notifier) = &self.notifier {
            notifier.send(message, level).await;
        }
    }

    /// Execute one full cycle.
    #[instrument(level = "info", skip_all)]
    pub async fn run_cycle(&self) -> RunSummary {
        let t0 = Instant::now();
        let mut summary = RunSummary::default();
        let mut publishing = self.publisher.is_some();
        info!(mode = ?self.gate.mode(), publishing, "Cycle started");
        self.notify("Cycle started", Level::Info).await;

        if let Some(publisher) = &self.publisher {
            match publisher.publish_approved().await {
                Ok(batch) => {
                    if batch.published + batch.failed > 0 {
                        info!(
                            published = batch.published,
                            failed = batch.failed,
                            "Retried approved drafts"
                        );
                    }
                    summary.published += batch.published;
                    summary.publish_failed += batch.failed;
                    if batch.auth_failed {
                        summary.auth_failed = true;
                        publishing = false;
                    }
                }
                Err(e) => error!(stage = "publish", error = %e, "Could not list approved drafts"),
            }
        }

        let articles = match self.source.fetch_articles().await {
            Ok(articles) => articles,
            Err(e) => {
                error!(stage = "fetch", error = %e, "Article fetch failed");
                Vec::new()
            }
        };
        summary.fetched = articles.len();

        for article in &articles {
            self.process_article(article, &mut summary, &mut publishing)
                .await;
        }

        info!(
            elapsed_ms = t0.elapsed().as_millis() as u64,
            fetched = summary.fetched,
            duplicates = summary.duplicates,
            drafted = summary.drafted,
            published = summary.published,
            rewrite_failed = summary.rewrite_failed,
            publish_failed = summary.publish_failed,
            "Cycle complete"
        );
        let level = if summary.auth_failed {
            Level::Error
        } else {
            Level::Success
        };
        self.notify(&summary.headline(), level).await;
        summary
    }

    #[instrument(level = "info", skip_all, fields(url = %article.url, feed = %article.feed_id))]
    async fn process_article(
        &self,
        article: &Article,
        summary: &mut RunSummary,
        publishing: &mut bool,
    ) {
        let article_id = article_identifier(article);

        match self.dedup.is_duplicate(article).await {
            Ok(true) => {
                summary.duplicates += 1;
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(
                    %article_id,
                    stage = "dedup",
                    error = %e,
                    "Record store unavailable; skipping article"
                );
                summary.storage_skipped += 1;
                return;
            }
        }

        if let Some(limit) = self.max_generation_attempts {
            match self.store.generation_failures(&article_id).await {
                Ok(attempts) if attempts >= limit => {
                    info!(%article_id, attempts, limit, "Rewrite attempts exhausted; skipping");
                    summary.exhausted += 1;
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        %article_id,
                        stage = "dedup",
                        error = %e,
                        "Record store unavailable; skipping article"
                    );
                    summary.storage_skipped += 1;
                    return;
                }
            }
        }

        let variant = self.selector.select_style();
        let mut draft = match self.rewriter.rewrite(article, variant).await {
            Ok(draft) => draft,
            Err(e) => {
                error!(
                    %article_id,
                    stage = "rewrite",
                    variant = %variant.id,
                    error = %e,
                    "Rewrite failed; will retry next run"
                );
                summary.rewrite_failed += 1;
                let unusable = matches!(e, RobotError::Generation(_));
                if unusable && self.max_generation_attempts.is_some() {
                    if let Err(store_err) = self.store.bump_generation_failures(&article_id).await {
                        warn!(%article_id, error = %store_err, "Failed to count rewrite failure");
                    }
                }
                return;
            }
        };

        if let Some(images) = &self.images {
            match images.illustrate(&draft.id, &draft.title, &draft.keywords).await {
                Ok(image) => {
                    draft.image = Some(image);
                    summary.images += 1;
                }
                Err(e) => warn!(
                    %article_id,
                    stage = "image",
                    error = %e,
                    "Image generation failed; continuing without image"
                ),
            }
        }

        let draft = match self.gate.submit(draft).await {
            Ok(draft) => draft,
            Err(e) => {
                error!(%article_id, stage = "approval", error = %e, "Could not store draft");
                summary.storage_skipped += 1;
                return;
            }
        };
        summary.drafted += 1;
        if let Err(e) = self.selector.record_use(&draft.variant_id, &draft.scores).await {
            warn!(%article_id, error = %e, "Failed to count prompt variant use");
        }

        if draft.status == DraftStatus::Pending {
            info!(%article_id, draft_id = %draft.id, "Draft awaiting review");
            summary.pending += 1;
            return;
        }

        let Some(publisher) = &self.publisher else {
            info!(
                %article_id,
                draft_id = %draft.id,
                "No CMS configured; approved draft kept for later"
            );
            return;
        };
        if !*publishing {
            info!(%article_id, draft_id = %draft.id, "Publishing disabled for this run");
            return;
        }

        match publisher.publish(draft).await {
            Ok(published) => {
                summary.published += 1;
                self.notify(&format!("Published: {}", published.title), Level::Success)
                    .await;
            }
            Err(e) => {
                summary.publish_failed += 1;
                if e.is_fatal_for_run() {
                    summary.auth_failed = true;
                    *publishing = false;
                    self.notify(&format!("CMS rejected credentials: {e}"), Level::Error)
                        .await;
                }
            }
        }
    }
}
