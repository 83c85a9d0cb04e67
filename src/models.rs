//! Data models shared by every stage of the pipeline.
//!
//! - [`Article`]: a fetched source article, immutable once built
//! - [`DraftArticle`]: the rewritten article moving through the approval queue
//! - [`ProcessedRecord`]: append-only "seen" entry in the record store
//! - [`PromptVariantStat`]: usage, outcome and score counters for one prompt style
//! - [`ApiUsage`]: calls made to one external service on one day
//!
//! Draft state lives in [`DraftStatus`]; the legal moves between states are
//! defined in [`crate::approval::transition`].

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// A news article as pulled from a feed and its landing page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    /// Canonical link of the article.
    pub url: String,
    pub title: String,
    /// Plain-text body, either extracted from the page or taken from the feed summary.
    pub body: String,
    pub published_at: DateTime<Utc>,
    /// Id of the configured feed that yielded this article.
    pub feed_id: String,
}

/// Lifecycle of a [`DraftArticle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DraftStatus {
    Pending,
    Approved,
    Rejected,
    Published,
}

impl DraftStatus {
    pub const ALL: [DraftStatus; 4] = [
        DraftStatus::Pending,
        DraftStatus::Approved,
        DraftStatus::Rejected,
        DraftStatus::Published,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DraftStatus::Pending => "pending",
            DraftStatus::Approved => "approved",
            DraftStatus::Rejected => "rejected",
            DraftStatus::Published => "published",
        }
    }
}

impl fmt::Display for DraftStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DraftStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DraftStatus::Pending),
            "approved" => Ok(DraftStatus::Approved),
            "rejected" => Ok(DraftStatus::Rejected),
            "published" => Ok(DraftStatus::Published),
            other => Err(format!("unknown draft status '{other}'")),
        }
    }
}

/// Things that can happen to a draft.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DraftEvent {
    Approve,
    Reject,
    PublishSucceeded,
    PublishFailed,
}

impl DraftEvent {
    pub const ALL: [DraftEvent; 4] = [
        DraftEvent::Approve,
        DraftEvent::Reject,
        DraftEvent::PublishSucceeded,
        DraftEvent::PublishFailed,
    ];
}

/// Which response parser produced a draft.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseTier {
    Structured,
    Heuristic,
    Raw,
}

impl ParseTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseTier::Structured => "structured",
            ParseTier::Heuristic => "heuristic",
            ParseTier::Raw => "raw",
        }
    }
}

impl FromStr for ParseTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "structured" => Ok(ParseTier::Structured),
            "heuristic" => Ok(ParseTier::Heuristic),
            "raw" => Ok(ParseTier::Raw),
            other => Err(format!("unknown parse tier '{other}'")),
        }
    }
}

/// Cover image attached to a draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "location", rename_all = "lowercase")]
pub enum ImageRef {
    /// Image bytes saved on disk.
    Local(PathBuf),
    /// Image hosted by the image backend.
    Remote(String),
}

/// Self-assessed 0-100 scores the model attaches to a rewrite.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentScores {
    pub quality: Option<u32>,
    pub originality: Option<u32>,
    pub seo: Option<u32>,
}

impl ContentScores {
    pub fn is_empty(&self) -> bool {
        self.quality.is_none() && self.originality.is_none() && self.seo.is_none()
    }
}

/// A rewritten article awaiting review or publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftArticle {
    pub id: String,
    /// Dedup identifier of the source article.
    pub article_id: String,
    pub source_url: String,
    pub source_title: String,
    pub source_feed: String,
    pub title: String,
    /// HTML or plain-text body as returned by the rewriter.
    pub body: String,
    pub meta_description: Option<String>,
    pub keywords: Vec<String>,
    pub variant_id: String,
    pub parse_tier: ParseTier,
    #[serde(default)]
    pub scores: ContentScores,
    pub image: Option<ImageRef>,
    pub status: DraftStatus,
    /// Post id assigned by the CMS once published.
    pub post_id: Option<u64>,
    pub reviewer_notes: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Final outcome of a draft, used for both seen-records and prompt statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Approved,
    Rejected,
    Published,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Approved => "approved",
            Outcome::Rejected => "rejected",
            Outcome::Published => "published",
        }
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" => Ok(Outcome::Approved),
            "rejected" => Ok(Outcome::Rejected),
            "published" => Ok(Outcome::Published),
            other => Err(format!("unknown outcome '{other}'")),
        }
    }
}

/// An identifier the robot must never process again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedRecord {
    pub identifier: String,
    pub url: String,
    pub outcome: Outcome,
    pub first_seen: DateTime<Utc>,
}

/// Counters for one prompt variant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptVariantStat {
    pub variant_id: String,
    /// Drafts created with this variant.
    pub uses: u64,
    pub approvals: u64,
    pub rejections: u64,
    pub published: u64,
    /// Drafts that carried at least one score; the divisor of the averages.
    pub scored: u64,
    pub quality_total: u64,
    pub originality_total: u64,
    pub seo_total: u64,
}

impl PromptVariantStat {
    pub fn new(variant_id: &str) -> Self {
        Self {
            variant_id: variant_id.to_string(),
            ..Default::default()
        }
    }

    /// Share of reviewed drafts that were approved, `0.0` when nothing was reviewed.
    pub fn approval_rate(&self) -> f64 {
        let reviewed = self.approvals + self.rejections;
        if reviewed == 0 {
            0.0
        } else {
            self.approvals as f64 / reviewed as f64
        }
    }

    fn average(&self, total: u64) -> Option<f64> {
        (self.scored > 0).then(|| total as f64 / self.scored as f64)
    }

    pub fn avg_quality(&self) -> Option<f64> {
        self.average(self.quality_total)
    }

    pub fn avg_originality(&self) -> Option<f64> {
        self.average(self.originality_total)
    }

    pub fn avg_seo(&self) -> Option<f64> {
        self.average(self.seo_total)
    }

    /// Ranking key: the three score averages plus the approval rate as a percentage.
    ///
    /// A score the model never reported counts as zero.
    pub fn performance_score(&self) -> f64 {
        self.avg_quality().unwrap_or(0.0)
            + self.avg_originality().unwrap_or(0.0)
            + self.avg_seo().unwrap_or(0.0)
            + self.approval_rate() * 100.0
    }

    /// Add one draft's scores. Drafts without any score leave the averages alone.
    pub fn record_scores(&mut self, scores: &ContentScores) {
        if scores.is_empty() {
            return;
        }
        self.scored += 1;
        self.quality_total += u64::from(scores.quality.unwrap_or(0));
        self.originality_total += u64::from(scores.originality.unwrap_or(0));
        self.seo_total += u64::from(scores.seo.unwrap_or(0));
    }

    pub fn apply(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Approved => self.approvals += 1,
            Outcome::Rejected => self.rejections += 1,
            Outcome::Published => self.published += 1,
        }
    }
}

/// Calls made to one external service on one UTC day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiUsage {
    pub service: String,
    pub day: NaiveDate,
    pub calls: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in DraftStatus::ALL {
            assert_eq!(status.as_str().parse::<DraftStatus>(), Ok(status));
        }
        assert!("archived".parse::<DraftStatus>().is_err());
    }

    #[test]
    fn test_approval_rate() {
        let mut stat = PromptVariantStat::new("viral");
        assert_eq!(stat.approval_rate(), 0.0);
        stat.apply(Outcome::Approved);
        stat.apply(Outcome::Approved);
        stat.apply(Outcome::Approved);
        stat.apply(Outcome::Rejected);
        stat.apply(Outcome::Published);
        assert_eq!(stat.approvals, 3);
        assert_eq!(stat.rejections, 1);
        assert_eq!(stat.published, 1);
        assert!((stat.approval_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_score_averages_and_ranking() {
        let mut stat = PromptVariantStat::new("seo");
        assert_eq!(stat.avg_quality(), None);

        stat.record_scores(&ContentScores::default());
        assert_eq!(stat.scored, 0);

        stat.record_scores(&ContentScores {
            quality: Some(80),
            originality: Some(60),
            seo: None,
        });
        stat.record_scores(&ContentScores {
            quality: Some(90),
            originality: Some(70),
            seo: Some(50),
        });
        assert_eq!(stat.scored, 2);
        assert_eq!(stat.avg_quality(), Some(85.0));
        assert_eq!(stat.avg_originality(), Some(65.0));
        assert_eq!(stat.avg_seo(), Some(25.0));

        stat.apply(Outcome::Approved);
        assert!((stat.performance_score() - 275.0).abs() < 1e-9);
    }

    #[test]
    fn test_image_ref_serialization() {
        let local = ImageRef::Local(PathBuf::from("images/a.png"));
        let json = serde_json::to_string(&local).unwrap();
        assert_eq!(json, r#"{"kind":"local","location":"images/a.png"}"#);
        let back: ImageRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, local);
    }
}
