//! Crate-wide error type.
//!
//! Every fallible operation in the robot returns [`Result<T>`]. The variants
//! mirror how the pipeline reacts to a failure:
//!
//! - [`RobotError::Storage`]: the record store could not be read or written.
//!   The current article is skipped and the run continues.
//! - [`RobotError::Generation`]: the AI backend answered, but no parser tier
//!   produced a usable rewrite. Skipped until the next scheduled run.
//! - [`RobotError::Backend`]: the AI backend could not be reached or timed out.
//! - [`RobotError::BackendRejected`]: the AI vendor refused the request
//!   (bad key or bad request). Not retried.
//! - [`RobotError::PublishAuth`]: the CMS rejected our credentials. Fatal for
//!   the rest of the run.
//! - [`RobotError::PublishTransient`]: any other CMS failure. The draft stays
//!   `approved` and is retried later.

use crate::models::{DraftEvent, DraftStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RobotError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("{backend} backend request failed: {message}")]
    Backend { backend: String, message: String },

    #[error("{backend} backend refused the request (HTTP {status}): {message}")]
    BackendRejected {
        backend: String,
        status: u16,
        message: String,
    },

    #[error("CMS rejected credentials (HTTP {status}): {message}")]
    PublishAuth { status: u16, message: String },

    #[error("publish failed, will retry: {0}")]
    PublishTransient(String),

    #[error("feed error: {0}")]
    Feed(String),

    #[error("image generation failed: {0}")]
    Image(String),

    #[error("cannot apply {event:?} to a draft in state {from}")]
    InvalidTransition { from: DraftStatus, event: DraftEvent },

    #[error("draft not found: {0}")]
    DraftNotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl From<sqlx::Error> for RobotError {
    fn from(e: sqlx::Error) -> Self {
        RobotError::Storage(e.to_string())
    }
}

impl RobotError {
    /// Whether a later run can reasonably succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RobotError::Backend { .. } | RobotError::PublishTransient(_) | RobotError::Storage(_)
        )
    }

    /// Whether the failure should stop further publishing in the current run.
    pub fn is_fatal_for_run(&self) -> bool {
        matches!(self, RobotError::PublishAuth { .. })
    }
}

pub type Result<T> = std::result::Result<T, RobotError>;
