//! Duplicate filtering.
//!
//! An article is identified by the SHA-256 of its normalised URL. The filter
//! only reads on [`DuplicateFilter::is_duplicate`]; the identifier is written
//! by [`DuplicateFilter::record`], which the approval gate and the publisher
//! call once an article reaches a final outcome. A failure anywhere earlier
//! leaves the article eligible for the next run.

use crate::error::Result;
use crate::models::{Article, Outcome, ProcessedRecord};
use crate::store::RecordStore;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, instrument};
use url::Url;

/// Normalise a URL so trivially different links hash the same.
///
/// Lower-cases scheme and host (done by the parser), drops the fragment and
/// any `utm_*` tracking parameters, and trims a trailing `/` from the path.
///
/// # Returns
///
/// `None` when `raw` is empty or not an absolute URL.
pub fn normalize_url(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let mut url = Url::parse(raw).ok()?;
    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !k.starts_with("utm_"))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }

    let mut normalized = url.to_string();
    if url.path() == "/" && url.query().is_none() && normalized.ends_with('/') {
        normalized.pop();
    }
    Some(normalized)
}

fn sha256_hex(input: &str) -> String {
    Sha256::digest(input.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Stable identifier for an article.
///
/// Hash of the normalised URL, or of the title and body when the article has
/// no usable URL.
pub fn article_identifier(article: &Article) -> String {
    match normalize_url(&article.url) {
        Some(url) => sha256_hex(&url),
        None => sha256_hex(&format!("{}\n{}", article.title, article.body)),
    }
}

#[derive(Clone)]
pub struct DuplicateFilter {
    store: Arc<dyn RecordStore>,
}

impl DuplicateFilter {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Whether the article was already finalised or is already in the draft queue.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::RobotError::Storage`] if the store is unreachable.
    /// Callers skip the article for this run.
    #[instrument(level = "debug", skip_all, fields(url = %article.url))]
    pub async fn is_duplicate(&self, article: &Article) -> Result<bool> {
        let identifier = article_identifier(article);
        if self.store.is_seen(&identifier).await? {
            debug!(%identifier, "Already processed");
            return Ok(true);
        }
        if self.store.has_draft_for(&identifier).await? {
            debug!(%identifier, "Draft already queued");
            return Ok(true);
        }
        Ok(false)
    }

    /// Mark an identifier as seen for good. Idempotent.
    pub async fn record(&self, identifier: &str, url: &str, outcome: Outcome) -> Result<()> {
        let inserted = self
            .store
            .record_seen(&ProcessedRecord {
                identifier: identifier.to_string(),
                url: url.to_string(),
                outcome,
                first_seen: Utc::now(),
            })
            .await?;
        info!(%identifier, outcome = outcome.as_str(), inserted, "Recorded processed article");
        Ok(())
    }
}
