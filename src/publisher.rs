//! Publishing approved drafts to the CMS.
//!
//! [`Cms`] is the seam to the content-management system; [`WordPress`] is
//! the production implementation over the WP REST API. [`Publisher`] wraps a
//! CMS with the bookkeeping around a publish: the status transition, the
//! post id, the seen-record and the prompt statistics.
//!
//! # Failure handling
//!
//! - HTTP 401/403 become [`RobotError::PublishAuth`]; no further publish is
//!   attempted until the operator fixes the credentials.
//! - Everything else (other statuses, timeouts, connection errors) becomes
//!   [`RobotError::PublishTransient`].
//!
//! In both cases the draft stays `approved` and its article is not recorded
//! as seen, so a later run picks it up again.
//!
//! Once the CMS has returned a post id the post exists. If the draft cannot
//! be stored afterwards, the publisher keeps the post id and a later attempt
//! finishes the bookkeeping without posting again.

use crate::approval::apply_event;
use crate::dedup::DuplicateFilter;
use crate::error::{Result, RobotError};
use crate::models::{DraftArticle, DraftEvent, DraftStatus, ImageRef, Outcome};
use crate::prompts::PromptSelector;
use crate::store::RecordStore;
use crate::utils::truncate_for_log;
use async_trait::async_trait;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{error, info, instrument, warn};

const SAVE_ATTEMPTS: u32 = 3;
const SAVE_RETRY_DELAY: Duration = Duration::from_millis(100);

#[async_trait]
pub trait Cms: Send + Sync {
    fn name(&self) -> &str;

    /// Publish the draft's title, body and optional image.
    ///
    /// # Returns
    ///
    /// The post id assigned by the CMS.
    async fn publish(&self, draft: &DraftArticle) -> Result<u64>;
}

/// Map a failed HTTP status onto the publish error taxonomy.
pub fn classify_status(status: StatusCode, body: &str) -> RobotError {
    let message = truncate_for_log(body, 300);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RobotError::PublishAuth {
            status: status.as_u16(),
            message,
        },
        _ => RobotError::PublishTransient(format!("HTTP {}: {message}", status.as_u16())),
    }
}

fn transport_error(e: reqwest::Error) -> RobotError {
    RobotError::PublishTransient(e.to_string())
}

#[derive(Debug, Serialize)]
struct PostRequest<'a> {
    title: &'a str,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    excerpt: Option<&'a str>,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    featured_media: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CreatedResponse {
    id: u64,
}

/// WordPress REST client using application-password basic auth.
pub struct WordPress {
    client: Client,
    base_url: String,
    username: String,
    password: String,
}

impl WordPress {
    pub fn new(client: Client, base_url: &str, username: String, password: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            username,
            password,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/wp-json/wp/v2/{path}", self.base_url)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(classify_status(status, &body))
        }
    }

    /// Confirm the credentials against `/users/me`.
    ///
    /// # Errors
    ///
    /// [`RobotError::PublishAuth`] on 401/403, [`RobotError::PublishTransient`]
    /// if the site cannot be reached.
    #[instrument(level = "info", skip_all, fields(site = %self.base_url))]
    pub async fn verify_credentials(&self) -> Result<()> {
        let response = self
            .client
            .get(self.endpoint("users/me"))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(transport_error)?;
        Self::check(response).await?;
        info!("WordPress credentials accepted");
        Ok(())
    }

    async fn image_bytes(&self, image: &ImageRef) -> Result<(Vec<u8>, String)> {
        match image {
            ImageRef::Local(path) => {
                let bytes = tokio::fs::read(path).await?;
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "cover.png".to_string());
                Ok((bytes, name))
            }
            ImageRef::Remote(url) => {
                let response = self
                    .client
                    .get(url)
                    .send()
                    .await
                    .map_err(transport_error)?
                    .error_for_status()
                    .map_err(transport_error)?;
                let bytes = response.bytes().await.map_err(transport_error)?;
                let name = url
                    .rsplit('/')
                    .next()
                    .filter(|n| !n.is_empty() && !n.contains('?'))
                    .unwrap_or("cover.png")
                    .to_string();
                Ok((bytes.to_vec(), name))
            }
        }
    }

    #[instrument(level = "info", skip_all)]
    async fn upload_media(&self, image: &ImageRef) -> Result<u64> {
        let (bytes, file_name) = self.image_bytes(image).await?;
        let response = self
            .client
            .post(self.endpoint("media"))
            .basic_auth(&self.username, Some(&self.password))
            .header(CONTENT_TYPE, "image/png")
            .header(
                CONTENT_DISPOSITION,
                format!("attachment; filename=\"{file_name}\""),
            )
            .body(bytes)
            .send()
            .await
            .map_err(transport_error)?;
        let created: CreatedResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(transport_error)?;
        info!(media_id = created.id, "Uploaded featured image");
        Ok(created.id)
    }
}

impl fmt::Debug for WordPress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WordPress")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl Cms for WordPress {
    fn name(&self) -> &str {
        "wordpress"
    }

    #[instrument(level = "info", skip_all, fields(draft_id = %draft.id))]
    async fn publish(&self, draft: &DraftArticle) -> Result<u64> {
        let featured_media = match &draft.image {
            None => None,
            Some(image) => match self.upload_media(image).await {
                Ok(id) => Some(id),
                Err(e) if e.is_fatal_for_run() => return Err(e),
                Err(e) => {
                    warn!(error = %e, "Image upload failed; publishing without featured image");
                    None
                }
            },
        };

        let request = PostRequest {
            title: &draft.title,
            content: &draft.body,
            excerpt: draft.meta_description.as_deref(),
            status: "publish",
            featured_media,
        };
        let response = self
            .client
            .post(self.endpoint("posts"))
            .basic_auth(&self.username, Some(&self.password))
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;
        let created: CreatedResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(transport_error)?;
        Ok(created.id)
    }
}

/// Result of publishing every approved draft.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishBatch {
    pub published: usize,
    pub failed: usize,
    /// Set when the CMS rejected the credentials; remaining drafts were left alone.
    pub auth_failed: bool,
}

pub struct Publisher {
    cms: Arc<dyn Cms>,
    store: Arc<dyn RecordStore>,
    dedup: DuplicateFilter,
    selector: Arc<PromptSelector>,
    /// Post ids created by the CMS whose draft has not been stored yet.
    posted: Mutex<HashMap<String, u64>>,
}

impl Publisher {
    pub fn new(
        cms: Arc<dyn Cms>,
        store: Arc<dyn RecordStore>,
        dedup: DuplicateFilter,
        selector: Arc<PromptSelector>,
    ) -> Self {
        Self {
            cms,
            store,
            dedup,
            selector,
            posted: Mutex::new(HashMap::new()),
        }
    }

    async fn save_published(&self, draft: &DraftArticle) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.save_draft(draft).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= SAVE_ATTEMPTS => return Err(e),
                Err(e) => {
                    warn!(attempt, error = %e, "Storing published draft failed; retrying");
                    sleep(SAVE_RETRY_DELAY * attempt).await;
                }
            }
        }
    }

    /// Push an approved draft to the CMS.
    ///
    /// On success the draft becomes `published` with its post id, and the
    /// article identifier is recorded as seen.
    ///
    /// # Errors
    ///
    /// [`RobotError::InvalidTransition`] if the draft is not `approved`;
    /// otherwise the CMS error, with the draft left `approved`.
    #[instrument(
        level = "info",
        skip_all,
        fields(draft_id = %draft.id, article_id = %draft.article_id, cms = %self.cms.name())
    )]
    pub async fn publish(&self, mut draft: DraftArticle) -> Result<DraftArticle> {
        if draft.status != DraftStatus::Approved {
            return Err(RobotError::InvalidTransition {
                from: draft.status,
                event: DraftEvent::PublishSucceeded,
            });
        }

        let known = self.posted.lock().await.get(&draft.id).copied();
        let result = match known {
            Some(post_id) => {
                info!(post_id, "Post already exists; finishing bookkeeping");
                Ok(post_id)
            }
            None => self.cms.publish(&draft).await,
        };

        match result {
            Ok(post_id) => {
                self.posted.lock().await.insert(draft.id.clone(), post_id);
                apply_event(&mut draft, DraftEvent::PublishSucceeded)?;
                draft.post_id = Some(post_id);
                if let Err(e) = self.save_published(&draft).await {
                    error!(
                        post_id,
                        stage = "publish",
                        error = %e,
                        "Published but failed to store draft state"
                    );
                    return Err(e);
                }
                self.posted.lock().await.remove(&draft.id);
                if let Err(e) = self
                    .dedup
                    .record(&draft.article_id, &draft.source_url, Outcome::Published)
                    .await
                {
                    error!(stage = "publish", error = %e, "Failed to record published article");
                }
                if let Err(e) = self
                    .selector
                    .record_outcome(&draft.variant_id, Outcome::Published)
                    .await
                {
                    warn!(error = %e, "Failed to update prompt statistics");
                }
                info!(post_id, title = %draft.title, "Draft published");
                Ok(draft)
            }
            Err(e) => {
                apply_event(&mut draft, DraftEvent::PublishFailed)?;
                if let Err(store_err) = self.store.save_draft(&draft).await {
                    warn!(error = %store_err, "Failed to touch draft after publish failure");
                }
                if e.is_fatal_for_run() {
                    error!(stage = "publish", error = %e, "CMS rejected credentials");
                } else {
                    warn!(stage = "publish", error = %e, "Publish failed; draft stays approved");
                }
                Err(e)
            }
        }
    }

    /// Publish every draft currently `approved`, oldest first.
    ///
    /// Stops at the first authentication failure.
    ///
    /// # Errors
    ///
    /// Only if the approved drafts cannot be listed.
    pub async fn publish_approved(&self) -> Result<PublishBatch> {
        let mut batch = PublishBatch::default();
        for draft in self.store.drafts_with_status(DraftStatus::Approved).await? {
            match self.publish(draft).await {
                Ok(_) => batch.published += 1,
                Err(e) if e.is_fatal_for_run() => {
                    batch.failed += 1;
                    batch.auth_failed = true;
                    break;
                }
                Err(_) => batch.failed += 1,
            }
        }
        Ok(batch)
    }
}
