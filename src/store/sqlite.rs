//! SQLite record store.
//!
//! The pipeline and the approval commands open the same database file from
//! separate processes. WAL journaling lets readers proceed while a writer is
//! active, and the busy timeout makes a second writer wait instead of failing.

use super::RecordStore;
use crate::error::{Result, RobotError};
use crate::models::{
    ApiUsage, ContentScores, DraftArticle, DraftStatus, ImageRef, Outcome, ProcessedRecord,
    PromptVariantStat,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::Row;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, instrument};

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS processed_records (
        identifier TEXT PRIMARY KEY,
        url TEXT NOT NULL,
        outcome TEXT NOT NULL,
        first_seen TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS drafts (
        id TEXT PRIMARY KEY,
        article_id TEXT NOT NULL,
        source_url TEXT NOT NULL,
        source_title TEXT NOT NULL,
        source_feed TEXT NOT NULL,
        title TEXT NOT NULL,
        body TEXT NOT NULL,
        meta_description TEXT,
        keywords TEXT NOT NULL,
        variant_id TEXT NOT NULL,
        parse_tier TEXT NOT NULL,
        quality_score INTEGER,
        originality_score INTEGER,
        seo_score INTEGER,
        image TEXT,
        status TEXT NOT NULL,
        post_id INTEGER,
        reviewer_notes TEXT,
        reviewed_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_drafts_article_id ON drafts (article_id)",
    "CREATE INDEX IF NOT EXISTS idx_drafts_status ON drafts (status)",
    r#"
    CREATE TABLE IF NOT EXISTS prompt_stats (
        variant_id TEXT PRIMARY KEY,
        uses INTEGER NOT NULL DEFAULT 0,
        approvals INTEGER NOT NULL DEFAULT 0,
        rejections INTEGER NOT NULL DEFAULT 0,
        published INTEGER NOT NULL DEFAULT 0,
        scored INTEGER NOT NULL DEFAULT 0,
        quality_total INTEGER NOT NULL DEFAULT 0,
        originality_total INTEGER NOT NULL DEFAULT 0,
        seo_total INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS generation_failures (
        identifier TEXT PRIMARY KEY,
        attempts INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS api_usage (
        service TEXT NOT NULL,
        day TEXT NOT NULL,
        calls INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (service, day)
    )
    "#,
];

pub struct SqliteStore {
    pool: SqlitePool,
    db_path: PathBuf,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `db_path` and run migrations.
    ///
    /// # Errors
    ///
    /// Returns [`RobotError::Storage`] if the parent directory cannot be
    /// created, the file cannot be opened, or a migration fails.
    #[instrument(level = "info", fields(path = %db_path.display()))]
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    RobotError::Storage(format!("failed to create database directory: {e}"))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| RobotError::Storage(format!("failed to connect to database: {e}")))?;

        for (i, migration) in MIGRATIONS.iter().enumerate() {
            sqlx::query(migration)
                .execute(&pool)
                .await
                .map_err(|e| RobotError::Storage(format!("failed to run migration {i}: {e}")))?;
        }
        info!("Record store ready");

        Ok(Self {
            pool,
            db_path: db_path.to_path_buf(),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| RobotError::Storage(format!("bad timestamp '{raw}': {e}")))
}

fn draft_from_row(row: &SqliteRow) -> Result<DraftArticle> {
    let keywords: String = row.try_get("keywords")?;
    let image: Option<String> = row.try_get("image")?;
    let image = match image {
        Some(raw) => Some(serde_json::from_str::<ImageRef>(&raw)?),
        None => None,
    };
    let status: String = row.try_get("status")?;
    let tier: String = row.try_get("parse_tier")?;
    let post_id: Option<i64> = row.try_get("post_id")?;
    let reviewed_at: Option<String> = row.try_get("reviewed_at")?;
    let score = |column: &str| -> Result<Option<u32>> {
        Ok(row.try_get::<Option<i64>, _>(column)?.map(|v| v as u32))
    };

    Ok(DraftArticle {
        id: row.try_get("id")?,
        article_id: row.try_get("article_id")?,
        source_url: row.try_get("source_url")?,
        source_title: row.try_get("source_title")?,
        source_feed: row.try_get("source_feed")?,
        title: row.try_get("title")?,
        body: row.try_get("body")?,
        meta_description: row.try_get("meta_description")?,
        keywords: serde_json::from_str(&keywords)?,
        variant_id: row.try_get("variant_id")?,
        parse_tier: tier.parse().map_err(RobotError::Storage)?,
        scores: ContentScores {
            quality: score("quality_score")?,
            originality: score("originality_score")?,
            seo: score("seo_score")?,
        },
        image,
        status: status.parse().map_err(RobotError::Storage)?,
        post_id: post_id.map(|id| id as u64),
        reviewer_notes: row.try_get("reviewer_notes")?,
        reviewed_at: reviewed_at.as_deref().map(parse_time).transpose()?,
        created_at: parse_time(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_time(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn outcome_column(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Approved => "approvals",
        Outcome::Rejected => "rejections",
        Outcome::Published => "published",
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn is_seen(&self, identifier: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM processed_records WHERE identifier = ?")
            .bind(identifier)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn record_seen(&self, record: &ProcessedRecord) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO processed_records (identifier, url, outcome, first_seen)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&record.identifier)
        .bind(&record.url)
        .bind(record.outcome.as_str())
        .bind(record.first_seen.to_rfc3339())
        .execute(&self.pool)
        .await?;
        debug!(identifier = %record.identifier, inserted = result.rows_affected(), "record_seen");
        Ok(result.rows_affected() == 1)
    }

    async fn has_draft_for(&self, article_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM drafts WHERE article_id = ? LIMIT 1")
            .bind(article_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn save_draft(&self, draft: &DraftArticle) -> Result<()> {
        let keywords = serde_json::to_string(&draft.keywords)?;
        let image = draft.image.as_ref().map(serde_json::to_string).transpose()?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO drafts
            (id, article_id, source_url, source_title, source_feed, title, body,
             meta_description, keywords, variant_id, parse_tier, quality_score,
             originality_score, seo_score, image, status, post_id, reviewer_notes,
             reviewed_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&draft.id)
        .bind(&draft.article_id)
        .bind(&draft.source_url)
        .bind(&draft.source_title)
        .bind(&draft.source_feed)
        .bind(&draft.title)
        .bind(&draft.body)
        .bind(draft.meta_description.as_deref())
        .bind(keywords)
        .bind(&draft.variant_id)
        .bind(draft.parse_tier.as_str())
        .bind(draft.scores.quality.map(i64::from))
        .bind(draft.scores.originality.map(i64::from))
        .bind(draft.scores.seo.map(i64::from))
        .bind(image)
        .bind(draft.status.as_str())
        .bind(draft.post_id.map(|id| id as i64))
        .bind(draft.reviewer_notes.as_deref())
        .bind(draft.reviewed_at.map(|t| t.to_rfc3339()))
        .bind(draft.created_at.to_rfc3339())
        .bind(draft.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_draft(&self, id: &str) -> Result<Option<DraftArticle>> {
        let row = sqlx::query("SELECT * FROM drafts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(draft_from_row).transpose()
    }

    async fn drafts_with_status(&self, status: DraftStatus) -> Result<Vec<DraftArticle>> {
        let rows = sqlx::query("SELECT * FROM drafts WHERE status = ? ORDER BY created_at, id")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(draft_from_row).collect()
    }

    async fn record_variant_use(&self, variant_id: &str, scores: &ContentScores) -> Result<()> {
        let scored = i64::from(!scores.is_empty());
        sqlx::query(
            r#"
            INSERT INTO prompt_stats
            (variant_id, uses, scored, quality_total, originality_total, seo_total)
            VALUES (?1, 1, ?2, ?3, ?4, ?5)
            ON CONFLICT(variant_id) DO UPDATE SET
                uses = uses + 1,
                scored = scored + ?2,
                quality_total = quality_total + ?3,
                originality_total = originality_total + ?4,
                seo_total = seo_total + ?5
            "#,
        )
        .bind(variant_id)
        .bind(scored)
        .bind(i64::from(scores.quality.unwrap_or(0)))
        .bind(i64::from(scores.originality.unwrap_or(0)))
        .bind(i64::from(scores.seo.unwrap_or(0)))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_variant_outcome(&self, variant_id: &str, outcome: Outcome) -> Result<()> {
        let column = outcome_column(outcome);
        let sql = format!(
            "INSERT INTO prompt_stats (variant_id, {column}) VALUES (?, 1) \
             ON CONFLICT(variant_id) DO UPDATE SET {column} = {column} + 1"
        );
        sqlx::query(&sql).bind(variant_id).execute(&self.pool).await?;
        Ok(())
    }

    async fn variant_stats(&self) -> Result<Vec<PromptVariantStat>> {
        let rows = sqlx::query("SELECT * FROM prompt_stats ORDER BY variant_id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let count =
                    |column: &str| -> Result<u64> { Ok(row.try_get::<i64, _>(column)? as u64) };
                Ok(PromptVariantStat {
                    variant_id: row.try_get("variant_id")?,
                    uses: count("uses")?,
                    approvals: count("approvals")?,
                    rejections: count("rejections")?,
                    published: count("published")?,
                    scored: count("scored")?,
                    quality_total: count("quality_total")?,
                    originality_total: count("originality_total")?,
                    seo_total: count("seo_total")?,
                })
            })
            .collect()
    }

    async fn draft_counts(&self) -> Result<Vec<(DraftStatus, u64)>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM drafts GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut counts: Vec<(DraftStatus, u64)> =
            DraftStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for row in &rows {
            let status: String = row.try_get("status")?;
            let status: DraftStatus = status.parse().map_err(RobotError::Storage)?;
            let n: i64 = row.try_get("n")?;
            if let Some(slot) = counts.iter_mut().find(|(s, _)| *s == status) {
                slot.1 = n as u64;
            }
        }
        Ok(counts)
    }

    async fn record_api_call(&self, service: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO api_usage (service, day, calls) VALUES (?, ?, 1)
            ON CONFLICT(service, day) DO UPDATE SET calls = calls + 1
            "#,
        )
        .bind(service)
        .bind(Utc::now().date_naive().to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn api_usage(&self) -> Result<Vec<ApiUsage>> {
        let rows =
            sqlx::query("SELECT service, day, calls FROM api_usage ORDER BY day DESC, service")
                .fetch_all(&self.pool)
                .await?;
        rows.iter()
            .map(|row| {
                let day: String = row.try_get("day")?;
                Ok(ApiUsage {
                    service: row.try_get("service")?,
                    day: day
                        .parse::<NaiveDate>()
                        .map_err(|e| RobotError::Storage(format!("bad day '{day}': {e}")))?,
                    calls: row.try_get::<i64, _>("calls")? as u64,
                })
            })
            .collect()
    }

    async fn generation_failures(&self, identifier: &str) -> Result<u32> {
        let attempts: Option<i64> =
            sqlx::query_scalar("SELECT attempts FROM generation_failures WHERE identifier = ?")
                .bind(identifier)
                .fetch_optional(&self.pool)
                .await?;
        Ok(attempts.unwrap_or(0) as u32)
    }

    async fn bump_generation_failures(&self, identifier: &str) -> Result<u32> {
        let attempts: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO generation_failures (identifier, attempts) VALUES (?, 1)
            ON CONFLICT(identifier) DO UPDATE SET attempts = attempts + 1
            RETURNING attempts
            "#,
        )
        .bind(identifier)
        .fetch_one(&self.pool)
        .await?;
        Ok(attempts as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ParseTier;
    use crate::test_support::sample_draft;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_sqlite_store_persists_across_reopen() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("nested").join("robot.db");

        let mut draft = sample_draft("h1");
        draft.image = Some(ImageRef::Local(PathBuf::from("images/x.png")));
        draft.keywords = vec!["rust".into(), "news".into()];
        draft.parse_tier = ParseTier::Heuristic;
        draft.scores.quality = Some(77);

        {
            let store = SqliteStore::open(&db_path).await.unwrap();
            store.save_draft(&draft).await.unwrap();
            let record = ProcessedRecord {
                identifier: "h0".into(),
                url: "https://x/0".into(),
                outcome: Outcome::Rejected,
                first_seen: Utc::now(),
            };
            assert!(store.record_seen(&record).await.unwrap());
            assert!(!store.record_seen(&record).await.unwrap());
        }

        let store = SqliteStore::open(&db_path).await.unwrap();
        assert!(store.is_seen("h0").await.unwrap());
        assert!(!store.is_seen("h1").await.unwrap());
        assert!(store.has_draft_for("h1").await.unwrap());

        let loaded = store.get_draft(&draft.id).await.unwrap().unwrap();
        assert_eq!(loaded.title, draft.title);
        assert_eq!(loaded.keywords, draft.keywords);
        assert_eq!(loaded.image, draft.image);
        assert_eq!(loaded.parse_tier, ParseTier::Heuristic);
        assert_eq!(loaded.status, DraftStatus::Pending);
        assert_eq!(loaded.scores.quality, Some(77));
        assert_eq!(loaded.scores.seo, None);
    }

    #[tokio::test]
    async fn test_save_draft_overwrites_by_id() {
        let temp_dir = tempdir().unwrap();
        let store = SqliteStore::open(&temp_dir.path().join("robot.db"))
            .await
            .unwrap();

        let mut draft = sample_draft("h1");
        store.save_draft(&draft).await.unwrap();
        draft.status = DraftStatus::Published;
        draft.post_id = Some(42);
        store.save_draft(&draft).await.unwrap();

        assert!(
            store
                .drafts_with_status(DraftStatus::Pending)
                .await
                .unwrap()
                .is_empty()
        );
        let published = store
            .drafts_with_status(DraftStatus::Published)
            .await
            .unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].post_id, Some(42));
    }

    #[tokio::test]
    async fn test_variant_counters_increment() {
        let temp_dir = tempdir().unwrap();
        let store = SqliteStore::open(&temp_dir.path().join("robot.db"))
            .await
            .unwrap();

        let scores = ContentScores {
            quality: Some(80),
            originality: None,
            seo: Some(60),
        };
        store.record_variant_use("seo", &scores).await.unwrap();
        store
            .record_variant_use("seo", &ContentScores::default())
            .await
            .unwrap();
        store
            .record_variant_outcome("seo", Outcome::Approved)
            .await
            .unwrap();
        store
            .record_variant_outcome("viral", Outcome::Rejected)
            .await
            .unwrap();

        let stats = store.variant_stats().await.unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].variant_id, "seo");
        assert_eq!(stats[0].uses, 2);
        assert_eq!(stats[0].approvals, 1);
        assert_eq!(stats[0].scored, 1);
        assert_eq!(stats[0].avg_quality(), Some(80.0));
        assert_eq!(stats[0].avg_originality(), Some(0.0));
        assert_eq!(stats[1].variant_id, "viral");
        assert_eq!(stats[1].uses, 0);
        assert_eq!(stats[1].rejections, 1);
    }

    #[tokio::test]
    async fn test_draft_counts_and_api_usage() {
        let temp_dir = tempdir().unwrap();
        let store = SqliteStore::open(&temp_dir.path().join("robot.db"))
            .await
            .unwrap();

        let mut rejected = sample_draft("h1");
        rejected.status = DraftStatus::Rejected;
        store.save_draft(&rejected).await.unwrap();
        store.save_draft(&sample_draft("h2")).await.unwrap();
        let counts = store.draft_counts().await.unwrap();
        assert_eq!(counts[0], (DraftStatus::Pending, 1));
        assert_eq!(counts[2], (DraftStatus::Rejected, 1));
        assert_eq!(counts[3], (DraftStatus::Published, 0));

        store.record_api_call("openai").await.unwrap();
        store.record_api_call("openai").await.unwrap();
        let usage = store.api_usage().await.unwrap();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].calls, 2);
        assert_eq!(usage[0].day, Utc::now().date_naive());
    }

    #[tokio::test]
    async fn test_generation_failures_returning_count() {
        let temp_dir = tempdir().unwrap();
        let store = SqliteStore::open(&temp_dir.path().join("robot.db"))
            .await
            .unwrap();

        assert_eq!(store.generation_failures("h9").await.unwrap(), 0);
        assert_eq!(store.bump_generation_failures("h9").await.unwrap(), 1);
        assert_eq!(store.bump_generation_failures("h9").await.unwrap(), 2);
        assert_eq!(store.generation_failures("h9").await.unwrap(), 2);
    }
}
