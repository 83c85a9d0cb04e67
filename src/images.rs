//! Optional cover images.
//!
//! An [`ImageBackend`] turns a prompt into PNG bytes or a hosted URL. The
//! [`ImageGenerator`] builds the prompt from the draft, stores returned bytes
//! under the images directory and hands back an [`ImageRef`]. Image failures
//! never stop a draft; the pipeline logs them and moves on without a cover.

use crate::error::{Result, RobotError};
use crate::models::ImageRef;
use crate::store::RecordStore;
use crate::utils::{ensure_writable_dir, slugify_title};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// What an image backend returned.
#[derive(Debug, Clone, PartialEq)]
pub enum GeneratedImage {
    Bytes(Vec<u8>),
    Url(String),
}

#[async_trait]
pub trait ImageBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn generate_image(&self, prompt: &str) -> Result<GeneratedImage>;
}

#[derive(Serialize)]
struct TextPrompt {
    text: String,
    weight: f32,
}

#[derive(Serialize)]
struct TextToImageRequest {
    text_prompts: Vec<TextPrompt>,
    cfg_scale: u32,
    height: u32,
    width: u32,
    samples: u32,
    steps: u32,
}

/// Stability AI text-to-image, asking for raw PNG bytes.
pub struct StabilityBackend {
    client: Client,
    api_key: String,
    engine: String,
}

impl StabilityBackend {
    pub fn new(client: Client, api_key: String) -> Self {
        Self {
            client,
            api_key,
            engine: "stable-diffusion-xl-1024-v1-0".to_string(),
        }
    }
}

impl fmt::Debug for StabilityBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StabilityBackend")
            .field("api_key", &"<redacted>")
            .field("engine", &self.engine)
            .finish()
    }
}

#[async_trait]
impl ImageBackend for StabilityBackend {
    fn name(&self) -> &str {
        "stability"
    }

    #[instrument(level = "info", skip_all, fields(engine = %self.engine))]
    async fn generate_image(&self, prompt: &str) -> Result<GeneratedImage> {
        let request = TextToImageRequest {
            text_prompts: vec![TextPrompt {
                text: prompt.to_string(),
                weight: 1.0,
            }],
            cfg_scale: 7,
            height: 1024,
            width: 1024,
            samples: 1,
            steps: 30,
        };
        let response = self
            .client
            .post(format!(
                "https://api.stability.ai/v1/generation/{}/text-to-image",
                self.engine
            ))
            .bearer_auth(&self.api_key)
            .header(reqwest::header::ACCEPT, "image/png")
            .json(&request)
            .send()
            .await
            .map_err(|e| RobotError::Image(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RobotError::Image(format!(
                "HTTP {}: {}",
                status.as_u16(),
                crate::utils::truncate_for_log(&body, 300)
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| RobotError::Image(e.to_string()))?;
        if bytes.is_empty() {
            return Err(RobotError::Image("empty image body".into()));
        }
        Ok(GeneratedImage::Bytes(bytes.to_vec()))
    }
}

/// Prompt sent to the image backend for a draft.
pub fn image_prompt(title: &str, keywords: &[String]) -> String {
    let mut prompt = format!("Editorial illustration: {}", title.trim());
    let extra: Vec<&str> = keywords.iter().map(String::as_str).take(3).collect();
    if !extra.is_empty() {
        prompt.push_str(&format!(". Themes: {}", extra.join(", ")));
    }
    prompt.push_str(". Clean, modern, no text.");
    prompt
}

pub struct ImageGenerator {
    backend: Arc<dyn ImageBackend>,
    images_dir: PathBuf,
    usage: Option<Arc<dyn RecordStore>>,
}

impl ImageGenerator {
    pub fn new(backend: Arc<dyn ImageBackend>, images_dir: PathBuf) -> Self {
        Self {
            backend,
            images_dir,
            usage: None,
        }
    }

    /// Count every backend request in the store's API usage log.
    pub fn with_usage(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.usage = Some(store);
        self
    }

    /// Produce a cover image for the draft `draft_id` titled `title`.
    ///
    /// # Returns
    ///
    /// [`ImageRef::Local`] for bytes saved as `<slug>-<draft_id>.png`, or
    /// [`ImageRef::Remote`] when the backend only returned a URL.
    #[instrument(level = "info", skip_all, fields(backend = %self.backend.name(), %draft_id))]
    pub async fn illustrate(
        &self,
        draft_id: &str,
        title: &str,
        keywords: &[String],
    ) -> Result<ImageRef> {
        let prompt = image_prompt(title, keywords);
        if let Some(store) = &self.usage {
            if let Err(e) = store.record_api_call(self.backend.name()).await {
                warn!(error = %e, "Failed to log image API call");
            }
        }
        match self.backend.generate_image(&prompt).await? {
            GeneratedImage::Url(url) => {
                info!(%url, "Image hosted by backend");
                Ok(ImageRef::Remote(url))
            }
            GeneratedImage::Bytes(bytes) => {
                ensure_writable_dir(&self.images_dir).await?;
                let path = self
                    .images_dir
                    .join(format!("{}-{draft_id}.png", slugify_title(title)));
                tokio::fs::write(&path, &bytes).await?;
                info!(path = %path.display(), bytes = bytes.len(), "Image saved");
                Ok(ImageRef::Local(path))
            }
        }
    }
}
