//! # Awful Content Robot
//!
//! Pulls articles from RSS/Atom feeds, rewrites them with an LLM, optionally
//! illustrates them, and publishes them to WordPress once they pass the
//! approval gate.
//!
//! ## Usage
//!
//! ```sh
//! awful_content_robot run            # scheduled loop
//! awful_content_robot run --once     # single cycle
//! awful_content_robot pending
//! awful_content_robot approve <draft-id> --notes "ok"
//! awful_content_robot stats
//! ```
//!
//! ## Architecture
//!
//! One cycle runs these stages for every fetched article:
//! 1. **Dedup**: skip anything already seen or waiting in the queue
//! 2. **Rewrite**: render the selected prompt style and parse the reply
//! 3. **Illustrate**: optional cover image
//! 4. **Gate**: store as `pending`, or `approved` in auto mode
//! 5. **Publish**: push approved drafts to the CMS
//!
//! All state lives in a SQLite file so drafts, seen articles and prompt
//! statistics survive restarts.

use clap::Parser;
use reqwest::Client;
use std::error::Error;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod api;
mod approval;
mod cli;
mod config;
mod dedup;
mod error;
mod images;
mod models;
mod notify;
mod pipeline;
mod prompts;
mod publisher;
mod rewriter;
mod sources;
mod store;
mod utils;

#[cfg(test)]
mod test_support;

use api::MeteredGenerator;
use approval::{ApprovalGate, ApprovalMode};
use cli::{Cli, Command, Credentials};
use config::{RobotConfig, load_config};
use dedup::DuplicateFilter;
use error::{Result, RobotError};
use images::{ImageGenerator, StabilityBackend};
use models::DraftArticle;
use notify::Notifier;
use pipeline::Pipeline;
use prompts::{BEST_VARIANT_MIN_USES, PromptSelector};
use publisher::{Publisher, WordPress};
use rewriter::Rewriter;
use sources::FeedFetcher;
use store::{RecordStore, SqliteStore};
use utils::{http_client, truncate_for_log};

/// Shared handles every subcommand needs.
struct App {
    config: RobotConfig,
    credentials: Credentials,
    client: Client,
    store: Arc<dyn RecordStore>,
    selector: Arc<PromptSelector>,
}

impl App {
    fn dedup(&self) -> DuplicateFilter {
        DuplicateFilter::new(self.store.clone())
    }

    fn gate(&self, mode: ApprovalMode) -> ApprovalGate {
        ApprovalGate::new(self.store.clone(), self.dedup(), self.selector.clone(), mode)
    }

    /// WordPress publisher, or `None` when credentials are missing or rejected.
    ///
    /// A site that cannot be reached right now is still returned; the
    /// publish attempt will fail transiently and be retried.
    async fn publisher(&self) -> Option<Publisher> {
        let Some((url, user, password)) = self.credentials.wordpress() else {
            info!("WordPress credentials not set; drafts stay in the queue");
            return None;
        };
        let wordpress = WordPress::new(
            self.client.clone(),
            url,
            user.to_string(),
            password.to_string(),
        );
        match wordpress.verify_credentials().await {
            Ok(()) => {}
            Err(e) if e.is_fatal_for_run() => {
                error!(error = %e, "WordPress rejected credentials; publishing disabled");
                return None;
            }
            Err(e) => warn!(error = %e, "Could not verify WordPress credentials; will try anyway"),
        }
        Some(Publisher::new(
            Arc::new(wordpress),
            self.store.clone(),
            self.dedup(),
            self.selector.clone(),
        ))
    }

    fn images(&self) -> Option<ImageGenerator> {
        if !self.config.generate_images {
            return None;
        }
        match self
            .credentials
            .stability_api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
        {
            Some(key) => Some(
                ImageGenerator::new(
                    Arc::new(StabilityBackend::new(self.client.clone(), key.to_string())),
                    self.config.images_dir.clone(),
                )
                .with_usage(self.store.clone()),
            ),
            None => {
                warn!("generate_images is on but STABILITY_API_KEY is not set; skipping images");
                None
            }
        }
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(path) = cli.database {
        config.database_path = path;
    }
    info!(
        feeds = config.feeds.len(),
        database = %config.database_path.display(),
        ab_testing = config.ab_testing,
        auto_publish = config.auto_publish,
        "Configuration loaded"
    );

    let store: Arc<dyn RecordStore> = Arc::new(SqliteStore::open(&config.database_path).await?);
    let client = http_client(&config)?;
    let selector = Arc::new(PromptSelector::from_config(&config, store.clone()));
    let app = App {
        config,
        credentials: cli.credentials,
        client,
        store,
        selector,
    };

    match cli.command {
        Command::Run { once } => run(&app, once).await?,
        Command::Pending => list_pending(&app).await?,
        Command::Approve { draft_id, notes } => approve(&app, &draft_id, notes).await?,
        Command::Reject { draft_id, notes } => {
            let draft = app.gate(ApprovalMode::Manual).reject(&draft_id, notes).await?;
            println!("rejected {} \"{}\"", draft.id, draft.title);
        }
        Command::PublishApproved => publish_approved(&app).await?,
        Command::Stats => print_stats(&app).await?,
    }
    Ok(())
}

/// Run the pipeline once, or every `interval_minutes` until Ctrl-C.
#[instrument(level = "info", skip_all, fields(once))]
async fn run(app: &App, once: bool) -> Result<()> {
    if app.config.feeds.is_empty() {
        return Err(RobotError::Config("no feeds configured".into()));
    }
    let generator = Arc::new(MeteredGenerator::new(
        api::select_backend(&app.credentials, app.client.clone())?,
        app.store.clone(),
    ));
    let publisher = app.publisher().await;

    let mode = match (app.config.auto_publish, publisher.is_some()) {
        (true, true) => ApprovalMode::Auto,
        (true, false) => {
            warn!("auto_publish requested without a working CMS; falling back to manual review");
            ApprovalMode::Manual
        }
        (false, _) => ApprovalMode::Manual,
    };

    let pipeline = Pipeline::new(
        Arc::new(FeedFetcher::from_config(app.client.clone(), &app.config)),
        app.store.clone(),
        app.selector.clone(),
        Rewriter::new(
            generator,
            app.config.content_char_limit,
            app.config.min_quality_score,
        ),
        app.gate(mode),
    )
    .with_images(app.images())
    .with_publisher(publisher)
    .with_notifier(Notifier::from_url(
        app.client.clone(),
        app.credentials.notification_webhook_url.as_deref(),
    ))
    .with_generation_limit(app.config.max_generation_attempts);

    let interval = app.config.interval();
    loop {
        let start_time = Instant::now();
        let summary = pipeline.run_cycle().await;
        let elapsed = start_time.elapsed();
        info!(
            secs = elapsed.as_secs(),
            summary = %summary.headline(),
            "Cycle complete"
        );

        if once {
            break;
        }
        info!(minutes = app.config.interval_minutes, "Sleeping until next cycle");
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted; shutting down");
                break;
            }
        }
    }
    Ok(())
}

fn describe(draft: &DraftArticle) -> String {
    format!(
        "{}  [{}|{}]  {}\n    source: {}\n    {}",
        draft.id,
        draft.variant_id,
        draft.parse_tier.as_str(),
        draft.title,
        draft.source_url,
        truncate_for_log(&draft.body, 200)
    )
}

async fn list_pending(app: &App) -> Result<()> {
    let gate = app.gate(ApprovalMode::Manual);
    let drafts = gate.pending().await?;
    if drafts.is_empty() {
        println!("No drafts waiting for review.");
    } else {
        for draft in &drafts {
            println!("{}\n", describe(draft));
        }
        println!("{} pending draft(s)", drafts.len());
    }
    let approved = gate.approved().await?;
    if !approved.is_empty() {
        println!("{} approved draft(s) waiting to be published", approved.len());
    }
    Ok(())
}

/// Approve a draft, then publish it straight away when a CMS is available.
async fn approve(app: &App, draft_id: &str, notes: Option<String>) -> Result<()> {
    let draft = app.gate(ApprovalMode::Manual).approve(draft_id, notes).await?;
    println!("approved {} \"{}\"", draft.id, draft.title);

    let Some(publisher) = app.publisher().await else {
        return Ok(());
    };
    match publisher.publish(draft).await {
        Ok(published) => {
            println!(
                "published {} as post {}",
                published.id,
                published.post_id.unwrap_or_default()
            );
            Ok(())
        }
        Err(e) if e.is_retryable() => {
            warn!(error = %e, "Publish failed; draft stays approved for the next run");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn publish_approved(app: &App) -> Result<()> {
    let Some(publisher) = app.publisher().await else {
        return Err(RobotError::Config(
            "publishing needs WORDPRESS_URL, WORDPRESS_USERNAME and WORDPRESS_PASSWORD".into(),
        ));
    };
    let batch = publisher.publish_approved().await?;
    println!(
        "published {}, failed {}{}",
        batch.published,
        batch.failed,
        if batch.auth_failed { " (credentials rejected)" } else { "" }
    );
    Ok(())
}

async fn print_stats(app: &App) -> Result<()> {
    let mut stats: Vec<_> = app.selector.get_stats().await?.into_values().collect();
    stats.sort_by(|a, b| b.performance_score().total_cmp(&a.performance_score()));
    let best = app.selector.best_variant(BEST_VARIANT_MIN_USES).await?;
    let drafts: serde_json::Map<String, serde_json::Value> = app
        .store
        .draft_counts()
        .await?
        .into_iter()
        .map(|(status, count)| (status.as_str().to_string(), count.into()))
        .collect();
    let usage = app.store.api_usage().await?;

    let report = serde_json::json!({
        "ab_testing": app.selector.ab_enabled(),
        "variants": stats
            .iter()
            .map(|s| serde_json::json!({
                "variant_id": s.variant_id,
                "uses": s.uses,
                "approvals": s.approvals,
                "rejections": s.rejections,
                "published": s.published,
                "approval_rate": s.approval_rate(),
                "avg_quality": s.avg_quality(),
                "avg_originality": s.avg_originality(),
                "avg_seo": s.avg_seo(),
                "performance_score": s.performance_score(),
            }))
            .collect::<Vec<_>>(),
        "best_variant": best.map(|b| b.variant_id),
        "drafts": drafts,
        "api_usage": usage
            .iter()
            .map(|u| serde_json::json!({
                "service": u.service,
                "day": u.day.to_string(),
                "calls": u.calls,
            }))
            .collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
