//! In-process record store.

use super::RecordStore;
use crate::error::{Result, RobotError};
use crate::models::{
    ApiUsage, ContentScores, DraftArticle, DraftStatus, Outcome, ProcessedRecord,
    PromptVariantStat,
};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;

#[derive(Default)]
struct Inner {
    seen: HashMap<String, ProcessedRecord>,
    drafts: HashMap<String, DraftArticle>,
    stats: BTreeMap<String, PromptVariantStat>,
    failures: HashMap<String, u32>,
    usage: BTreeMap<(NaiveDate, String), u64>,
}

/// [`RecordStore`] backed by maps behind a `tokio` lock.
///
/// Counts every mutating call so callers can assert that a code path wrote
/// nothing.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    writes: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mutating calls served so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every subsequent call fail with a storage error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(RobotError::Storage("memory store marked unavailable".into()))
        } else {
            Ok(())
        }
    }

    fn wrote(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn is_seen(&self, identifier: &str) -> Result<bool> {
        self.check()?;
        Ok(self.inner.read().await.seen.contains_key(identifier))
    }

    async fn record_seen(&self, record: &ProcessedRecord) -> Result<bool> {
        self.check()?;
        let mut inner = self.inner.write().await;
        if inner.seen.contains_key(&record.identifier) {
            return Ok(false);
        }
        inner.seen.insert(record.identifier.clone(), record.clone());
        self.wrote();
        Ok(true)
    }

    async fn has_draft_for(&self, article_id: &str) -> Result<bool> {
        self.check()?;
        Ok(self
            .inner
            .read()
            .await
            .drafts
            .values()
            .any(|d| d.article_id == article_id))
    }

    async fn save_draft(&self, draft: &DraftArticle) -> Result<()> {
        self.check()?;
        self.inner
            .write()
            .await
            .drafts
            .insert(draft.id.clone(), draft.clone());
        self.wrote();
        Ok(())
    }

    async fn get_draft(&self, id: &str) -> Result<Option<DraftArticle>> {
        self.check()?;
        Ok(self.inner.read().await.drafts.get(id).cloned())
    }

    async fn drafts_with_status(&self, status: DraftStatus) -> Result<Vec<DraftArticle>> {
        self.check()?;
        let inner = self.inner.read().await;
        let mut drafts: Vec<DraftArticle> = inner
            .drafts
            .values()
            .filter(|d| d.status == status)
            .cloned()
            .collect();
        drafts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(drafts)
    }

    async fn record_variant_use(&self, variant_id: &str, scores: &ContentScores) -> Result<()> {
        self.check()?;
        let mut inner = self.inner.write().await;
        let stat = inner
            .stats
            .entry(variant_id.to_string())
            .or_insert_with(|| PromptVariantStat::new(variant_id));
        stat.uses += 1;
        stat.record_scores(scores);
        self.wrote();
        Ok(())
    }

    async fn record_variant_outcome(&self, variant_id: &str, outcome: Outcome) -> Result<()> {
        self.check()?;
        self.inner
            .write()
            .await
            .stats
            .entry(variant_id.to_string())
            .or_insert_with(|| PromptVariantStat::new(variant_id))
            .apply(outcome);
        self.wrote();
        Ok(())
    }

    async fn variant_stats(&self) -> Result<Vec<PromptVariantStat>> {
        self.check()?;
        Ok(self.inner.read().await.stats.values().cloned().collect())
    }

    async fn draft_counts(&self) -> Result<Vec<(DraftStatus, u64)>> {
        self.check()?;
        let inner = self.inner.read().await;
        Ok(DraftStatus::ALL
            .iter()
            .map(|status| {
                let count = inner.drafts.values().filter(|d| d.status == *status).count();
                (*status, count as u64)
            })
            .collect())
    }

    async fn record_api_call(&self, service: &str) -> Result<()> {
        self.check()?;
        let day = Utc::now().date_naive();
        *self
            .inner
            .write()
            .await
            .usage
            .entry((day, service.to_string()))
            .or_insert(0) += 1;
        self.wrote();
        Ok(())
    }

    async fn api_usage(&self) -> Result<Vec<ApiUsage>> {
        self.check()?;
        let inner = self.inner.read().await;
        let mut usage: Vec<ApiUsage> = inner
            .usage
            .iter()
            .map(|((day, service), calls)| ApiUsage {
                service: service.clone(),
                day: *day,
                calls: *calls,
            })
            .collect();
        usage.sort_by(|a, b| b.day.cmp(&a.day).then(a.service.cmp(&b.service)));
        Ok(usage)
    }

    async fn generation_failures(&self, identifier: &str) -> Result<u32> {
        self.check()?;
        Ok(self
            .inner
            .read()
            .await
            .failures
            .get(identifier)
            .copied()
            .unwrap_or(0))
    }

    async fn bump_generation_failures(&self, identifier: &str) -> Result<u32> {
        self.check()?;
        let mut inner = self.inner.write().await;
        let count = inner.failures.entry(identifier.to_string()).or_insert(0);
        *count += 1;
        let total = *count;
        self.wrote();
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_draft;

    #[tokio::test]
    async fn test_record_seen_is_insert_if_absent() {
        let store = MemoryStore::new();
        let record = ProcessedRecord {
            identifier: "h1".into(),
            url: "https://x/a".into(),
            outcome: Outcome::Published,
            first_seen: Utc::now(),
        };
        assert!(store.record_seen(&record).await.unwrap());
        assert!(!store.record_seen(&record).await.unwrap());
        assert!(store.is_seen("h1").await.unwrap());
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_drafts_filtered_by_status() {
        let store = MemoryStore::new();
        let mut a = sample_draft("a1");
        let b = sample_draft("a2");
        a.status = DraftStatus::Approved;
        store.save_draft(&a).await.unwrap();
        store.save_draft(&b).await.unwrap();

        let approved = store.drafts_with_status(DraftStatus::Approved).await.unwrap();
        assert_eq!(approved.len(), 1);
        assert_eq!(approved[0].article_id, "a1");
        assert!(store.has_draft_for("a2").await.unwrap());
        assert!(!store.has_draft_for("a3").await.unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.is_seen("h1").await,
            Err(RobotError::Storage(_))
        ));
        assert!(store.variant_stats().await.is_err());
    }

    #[tokio::test]
    async fn test_draft_counts_cover_every_status() {
        let store = MemoryStore::new();
        let mut approved = sample_draft("a1");
        approved.status = DraftStatus::Approved;
        store.save_draft(&approved).await.unwrap();
        store.save_draft(&sample_draft("a2")).await.unwrap();
        store.save_draft(&sample_draft("a3")).await.unwrap();

        let counts = store.draft_counts().await.unwrap();
        assert_eq!(
            counts,
            vec![
                (DraftStatus::Pending, 2),
                (DraftStatus::Approved, 1),
                (DraftStatus::Rejected, 0),
                (DraftStatus::Published, 0),
            ]
        );
    }

    #[tokio::test]
    async fn test_api_calls_counted_per_service() {
        let store = MemoryStore::new();
        store.record_api_call("gemini").await.unwrap();
        store.record_api_call("gemini").await.unwrap();
        store.record_api_call("stability").await.unwrap();

        let usage = store.api_usage().await.unwrap();
        assert_eq!(usage.len(), 2);
        assert_eq!(usage[0].service, "gemini");
        assert_eq!(usage[0].calls, 2);
        assert_eq!(usage[0].day, Utc::now().date_naive());
        assert_eq!(usage[1].calls, 1);
    }

    #[tokio::test]
    async fn test_generation_failure_counter() {
        let store = MemoryStore::new();
        assert_eq!(store.generation_failures("h1").await.unwrap(), 0);
        assert_eq!(store.bump_generation_failures("h1").await.unwrap(), 1);
        assert_eq!(store.bump_generation_failures("h1").await.unwrap(), 2);
        assert_eq!(store.generation_failures("h1").await.unwrap(), 2);
    }
}
