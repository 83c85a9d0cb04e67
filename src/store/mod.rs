//! Durable state shared by the pipeline and the approval commands.
//!
//! The [`RecordStore`] trait is the only mutable resource the robot shares
//! between processes. It holds four things:
//!
//! - processed identifiers ([`ProcessedRecord`]), insert-if-absent and never
//!   updated or deleted
//! - drafts ([`DraftArticle`]), written whole and keyed by draft id
//! - prompt statistics ([`PromptVariantStat`]), updated with atomic increments
//! - per-service API call counts ([`ApiUsage`]), one row per service and day
//!
//! Every write touches exactly one row keyed by an identifier, so concurrent
//! writers never corrupt each other; the last writer of a given draft wins.
//!
//! # Backends
//!
//! - [`sqlite::SqliteStore`]: the production store, one SQLite file in WAL mode
//! - [`memory::MemoryStore`]: in-process maps, used by tests

use crate::error::Result;
use crate::models::{
    ApiUsage, ContentScores, DraftArticle, DraftStatus, Outcome, ProcessedRecord,
    PromptVariantStat,
};
use async_trait::async_trait;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Whether `identifier` has been finalised (published or rejected).
    async fn is_seen(&self, identifier: &str) -> Result<bool>;

    /// Insert the record unless the identifier already exists.
    ///
    /// # Returns
    ///
    /// `true` if the record was new, `false` if it was already present.
    async fn record_seen(&self, record: &ProcessedRecord) -> Result<bool>;

    /// Whether any draft was created for the article with this identifier.
    async fn has_draft_for(&self, article_id: &str) -> Result<bool>;

    /// Insert or overwrite a draft by id.
    async fn save_draft(&self, draft: &DraftArticle) -> Result<()>;

    async fn get_draft(&self, id: &str) -> Result<Option<DraftArticle>>;

    /// Drafts in `status`, oldest first.
    async fn drafts_with_status(&self, status: DraftStatus) -> Result<Vec<DraftArticle>>;

    /// Count one more draft created with `variant_id` and add its scores.
    async fn record_variant_use(&self, variant_id: &str, scores: &ContentScores) -> Result<()>;

    async fn record_variant_outcome(&self, variant_id: &str, outcome: Outcome) -> Result<()>;

    /// Statistics for every variant used so far, ordered by variant id.
    async fn variant_stats(&self) -> Result<Vec<PromptVariantStat>>;

    /// Number of drafts in each status, in [`DraftStatus::ALL`] order.
    async fn draft_counts(&self) -> Result<Vec<(DraftStatus, u64)>>;

    /// Count one call to `service` today (UTC).
    async fn record_api_call(&self, service: &str) -> Result<()>;

    /// Call counts per service and day, most recent day first.
    async fn api_usage(&self) -> Result<Vec<ApiUsage>>;

    /// Number of failed rewrite attempts for an article.
    async fn generation_failures(&self, identifier: &str) -> Result<u32>;

    /// Count one more failed rewrite attempt and return the new total.
    async fn bump_generation_failures(&self, identifier: &str) -> Result<u32>;
}
