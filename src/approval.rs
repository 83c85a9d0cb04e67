//! Approval gate: the draft state machine and the review actions.
//!
//! ```text
//!   pending ──approve──▶ approved ──publish ok──▶ published
//!      │                   │   ▲
//!      └──reject──▶ rejected  └─publish failed─┘
//! ```
//!
//! In auto-publish mode [`ApprovalGate::submit`] approves a draft as soon as
//! it is stored; otherwise it waits for [`ApprovalGate::approve`] or
//! [`ApprovalGate::reject`] from the operator CLI.

use crate::dedup::DuplicateFilter;
use crate::error::{Result, RobotError};
use crate::models::{DraftArticle, DraftEvent, DraftStatus, Outcome};
use crate::prompts::PromptSelector;
use crate::store::RecordStore;
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Apply `event` to a draft in state `from`.
///
/// # Errors
///
/// [`RobotError::InvalidTransition`] for every pair not drawn in the module
/// diagram.
pub fn transition(from: DraftStatus, event: DraftEvent) -> Result<DraftStatus> {
    use DraftEvent::*;
    use DraftStatus::*;
    match (from, event) {
        (Pending, Approve) => Ok(Approved),
        (Pending, Reject) => Ok(Rejected),
        (Approved, PublishSucceeded) => Ok(Published),
        (Approved, PublishFailed) => Ok(Approved),
        _ => Err(RobotError::InvalidTransition { from, event }),
    }
}

/// Move `draft` along `event`, stamping `updated_at`.
pub fn apply_event(draft: &mut DraftArticle, event: DraftEvent) -> Result<()> {
    draft.status = transition(draft.status, event)?;
    draft.updated_at = Utc::now();
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalMode {
    /// Drafts wait for a reviewer.
    Manual,
    /// Drafts are approved as soon as they are stored.
    Auto,
}

pub struct ApprovalGate {
    store: Arc<dyn RecordStore>,
    dedup: DuplicateFilter,
    selector: Arc<PromptSelector>,
    mode: ApprovalMode,
}

impl ApprovalGate {
    pub fn new(
        store: Arc<dyn RecordStore>,
        dedup: DuplicateFilter,
        selector: Arc<PromptSelector>,
        mode: ApprovalMode,
    ) -> Self {
        Self {
            store,
            dedup,
            selector,
            mode,
        }
    }

    pub fn mode(&self) -> ApprovalMode {
        self.mode
    }

    /// Store a freshly rewritten draft and, in auto mode, approve it.
    ///
    /// # Returns
    ///
    /// The draft as persisted, `pending` or `approved`.
    #[instrument(
        level = "info",
        skip_all,
        fields(draft_id = %draft.id, article_id = %draft.article_id)
    )]
    pub async fn submit(&self, mut draft: DraftArticle) -> Result<DraftArticle> {
        if draft.status != DraftStatus::Pending {
            return Err(RobotError::InvalidTransition {
                from: draft.status,
                event: DraftEvent::Approve,
            });
        }
        if self.mode == ApprovalMode::Auto {
            apply_event(&mut draft, DraftEvent::Approve)?;
        }
        self.store.save_draft(&draft).await?;
        info!(status = %draft.status, variant = %draft.variant_id, "Draft stored");

        if draft.status == DraftStatus::Approved {
            self.count_outcome(&draft, Outcome::Approved).await;
        }
        Ok(draft)
    }

    async fn load(&self, draft_id: &str) -> Result<DraftArticle> {
        self.store
            .get_draft(draft_id)
            .await?
            .ok_or_else(|| RobotError::DraftNotFound(draft_id.to_string()))
    }

    async fn count_outcome(&self, draft: &DraftArticle, outcome: Outcome) {
        if let Err(e) = self.selector.record_outcome(&draft.variant_id, outcome).await {
            warn!(
                draft_id = %draft.id,
                variant = %draft.variant_id,
                error = %e,
                "Failed to update prompt statistics"
            );
        }
    }

    /// Reviewer accepts a pending draft.
    #[instrument(level = "info", skip(self, notes))]
    pub async fn approve(&self, draft_id: &str, notes: Option<String>) -> Result<DraftArticle> {
        let mut draft = self.load(draft_id).await?;
        apply_event(&mut draft, DraftEvent::Approve)?;
        draft.reviewer_notes = notes;
        draft.reviewed_at = Some(Utc::now());
        self.store.save_draft(&draft).await?;
        info!(article_id = %draft.article_id, "Draft approved");

        self.count_outcome(&draft, Outcome::Approved).await;
        Ok(draft)
    }

    /// Reviewer discards a pending draft; its article is never processed again.
    #[instrument(level = "info", skip(self, notes))]
    pub async fn reject(&self, draft_id: &str, notes: Option<String>) -> Result<DraftArticle> {
        let mut draft = self.load(draft_id).await?;
        apply_event(&mut draft, DraftEvent::Reject)?;
        draft.reviewer_notes = notes;
        draft.reviewed_at = Some(Utc::now());
        self.store.save_draft(&draft).await?;
        info!(article_id = %draft.article_id, "Draft rejected");

        if let Err(e) = self
            .dedup
            .record(&draft.article_id, &draft.source_url, Outcome::Rejected)
            .await
        {
            error!(
                article_id = %draft.article_id,
                stage = "approval",
                error = %e,
                "Failed to record rejected article"
            );
            return Err(e);
        }
        self.count_outcome(&draft, Outcome::Rejected).await;
        Ok(draft)
    }

    pub async fn pending(&self) -> Result<Vec<DraftArticle>> {
        self.store.drafts_with_status(DraftStatus::Pending).await
    }

    pub async fn approved(&self) -> Result<Vec<DraftArticle>> {
        self.store.drafts_with_status(DraftStatus::Approved).await
    }
}
