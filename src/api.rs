//! AI text-generation backends with exponential backoff retry logic.
//!
//! Every backend implements [`TextGenerator`]: a prompt goes in, text comes
//! out. Which one is used is decided once at start-up by
//! [`select_backend`], based on which credential is configured, so nothing
//! downstream ever branches on the vendor.
//!
//! # Architecture
//!
//! - [`TextGenerator`]: the capability trait
//! - [`OpenAiCompatible`]: OpenAI chat completions, also used for DeepSeek
//! - [`Gemini`]: Google `generateContent`
//! - [`RetryGenerator`]: decorator adding retries to any generator
//! - [`MeteredGenerator`]: decorator logging each request per service
//!
//! # Retry Strategy
//!
//! - Only transport failures ([`RobotError::Backend`]) are retried; a
//!   refused request ([`RobotError::BackendRejected`]) is returned at once
//! - Exponential backoff starting at 1 second, capped at 30 seconds
//! - Random jitter (0-250ms) added to each delay

use crate::cli::Credentials;
use crate::error::{Result, RobotError};
use crate::store::RecordStore;
use crate::utils::truncate_for_log;
use async_trait::async_trait;
use rand::{Rng, rng};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

/// A vendor-neutral text generation capability.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Send `prompt` and return the model's text reply.
    ///
    /// # Errors
    ///
    /// [`RobotError::Backend`] when the request fails or times out,
    /// [`RobotError::Generation`] when the reply carries no text.
    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// Wrapper that adds exponential backoff retry logic to any [`TextGenerator`].
///
/// ```text
/// delay = min(base_delay * 2^(attempt-1), max_delay) + random_jitter(0..250ms)
/// ```
pub struct RetryGenerator<T> {
    inner: T,
    max_retries: usize,
    base_delay: StdDuration,
    max_delay: StdDuration,
}

impl<T: TextGenerator> RetryGenerator<T> {
    pub fn new(inner: T, max_retries: usize, base_delay: StdDuration) -> Self {
        Self {
            inner,
            max_retries,
            base_delay,
            max_delay: StdDuration::from_secs(30),
        }
    }

    fn backoff(&self, attempt: usize) -> StdDuration {
        let shift = (attempt.saturating_sub(1)).min(16) as u32;
        let delay = self.base_delay.saturating_mul(1 << shift);
        delay.min(self.max_delay)
    }
}

impl<T> fmt::Debug for RetryGenerator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryGenerator")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish()
    }
}

#[async_trait]
impl<T: TextGenerator> TextGenerator for RetryGenerator<T> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    #[instrument(level = "info", skip_all, fields(backend = %self.inner.name()))]
    async fn generate(&self, prompt: &str) -> Result<String> {
        let total_t0 = Instant::now();
        let mut attempt = 0usize;

        loop {
            let attempt_t0 = Instant::now();
            match self.inner.generate(prompt).await {
                Ok(text) => return Ok(text),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    attempt += 1;
                    let attempt_dt = attempt_t0.elapsed();
                    let total_dt = total_t0.elapsed();

                    if attempt > self.max_retries {
                        error!(
                            attempt,
                            max = self.max_retries,
                            elapsed_ms_attempt = attempt_dt.as_millis() as u64,
                            elapsed_ms_total = total_dt.as_millis() as u64,
                            error = %e,
                            "generate() exhausted retries"
                        );
                        return Err(e);
                    }

                    let jitter_ms: u64 = rng().random_range(0..=250);
                    let delay = self.backoff(attempt) + StdDuration::from_millis(jitter_ms);

                    warn!(
                        attempt,
                        max = self.max_retries,
                        elapsed_ms_attempt = attempt_dt.as_millis() as u64,
                        ?delay,
                        error = %e,
                        "generate() attempt failed; backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

/// Counts every request in the record store's API usage log.
///
/// A failure to log is only a warning; the request still goes out.
pub struct MeteredGenerator {
    inner: Arc<dyn TextGenerator>,
    store: Arc<dyn RecordStore>,
}

impl MeteredGenerator {
    pub fn new(inner: Arc<dyn TextGenerator>, store: Arc<dyn RecordStore>) -> Self {
        Self { inner, store }
    }
}

#[async_trait]
impl TextGenerator for MeteredGenerator {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        if let Err(e) = self.store.record_api_call(self.inner.name()).await {
            warn!(backend = %self.inner.name(), error = %e, "Failed to log API call");
        }
        self.inner.generate(prompt).await
    }
}

fn backend_error(backend: &str, message: impl fmt::Display) -> RobotError {
    RobotError::Backend {
        backend: backend.to_string(),
        message: message.to_string(),
    }
}

/// Map a failed vendor response onto the error taxonomy.
///
/// A bad request or a refused key will not get better on retry, so 400,
/// 401 and 403 become [`RobotError::BackendRejected`]. Everything else is a
/// retryable [`RobotError::Backend`].
fn classify_backend_status(backend: &str, status: StatusCode, body: &str) -> RobotError {
    let message = truncate_for_log(body, 300);
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            RobotError::BackendRejected {
                backend: backend.to_string(),
                status: status.as_u16(),
                message,
            }
        }
        _ => backend_error(backend, format!("HTTP {}: {message}", status.as_u16())),
    }
}

async fn ensure_success(backend: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_backend_status(backend, status, &body))
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct Message {
    content: Option<String>,
}

fn chat_text(response: ChatResponse) -> Result<String> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| RobotError::Generation("chat completion returned no content".into()))
}

/// OpenAI chat-completions client. DeepSeek speaks the same protocol.
pub struct OpenAiCompatible {
    client: Client,
    name: String,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiCompatible {
    pub fn openai(client: Client, api_key: String, model: Option<String>) -> Self {
        Self {
            client,
            name: "openai".to_string(),
            api_key,
            base_url: "https://api.openai.com/v1".to_string(),
            model: model.unwrap_or_else(|| "gpt-4o-mini".to_string()),
        }
    }

    pub fn deepseek(client: Client, api_key: String, model: Option<String>) -> Self {
        Self {
            client,
            name: "deepseek".to_string(),
            api_key,
            base_url: "https://api.deepseek.com/v1".to_string(),
            model: model.unwrap_or_else(|| "deepseek-chat".to_string()),
        }
    }
}

impl fmt::Debug for OpenAiCompatible {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiCompatible")
            .field("name", &self.name)
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

#[async_trait]
impl TextGenerator for OpenAiCompatible {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(level = "debug", skip_all, fields(backend = %self.name, model = %self.model))]
    async fn generate(&self, prompt: &str) -> Result<String> {
        let t0 = Instant::now();
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            temperature: 0.7,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| backend_error(&self.name, e))?;
        let response = ensure_success(&self.name, response).await?;
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| backend_error(&self.name, e))?;

        debug!(elapsed_ms = t0.elapsed().as_millis() as u64, "chat completion received");
        chat_text(parsed)
    }
}

#[derive(Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: u32,
    max_output_tokens: u32,
}

#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

fn gemini_text(response: GeminiResponse) -> Result<String> {
    let text: String = response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| c.parts.into_iter().map(|p| p.text).collect())
        .unwrap_or_default();
    if text.trim().is_empty() {
        Err(RobotError::Generation("gemini returned no text".into()))
    } else {
        Ok(text)
    }
}

/// Google Gemini client. Calls are spaced at least `min_interval` apart.
pub struct Gemini {
    client: Client,
    api_key: String,
    model: String,
    min_interval: StdDuration,
    last_call: Mutex<Option<Instant>>,
}

impl Gemini {
    pub fn new(client: Client, api_key: String, model: Option<String>) -> Self {
        Self {
            client,
            api_key,
            model: model.unwrap_or_else(|| "gemini-2.0-flash-exp".to_string()),
            min_interval: StdDuration::from_secs(2),
            last_call: Mutex::new(None),
        }
    }

    async fn pace(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(at) = *last {
            let since = at.elapsed();
            if since < self.min_interval {
                sleep(self.min_interval - since).await;
            }
        }
        *last = Some(Instant::now());
    }
}

impl fmt::Debug for Gemini {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gemini")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("min_interval", &self.min_interval)
            .finish()
    }
}

#[async_trait]
impl TextGenerator for Gemini {
    fn name(&self) -> &str {
        "gemini"
    }

    #[instrument(level = "debug", skip_all, fields(backend = "gemini", model = %self.model))]
    async fn generate(&self, prompt: &str) -> Result<String> {
        self.pace().await;
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model,
            urlencoding::encode(&self.api_key)
        );
        let request = GeminiRequest {
            contents: vec![GeminiContent {
                parts: vec![GeminiPart {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.7,
                top_p: 0.95,
                top_k: 40,
                max_output_tokens: 8192,
            },
        };

        let response = self
            .client
            .post(url)
            .json(&request)
            .send()
            .await
            .map_err(|e| backend_error("gemini", e.without_url()))?;
        let response = ensure_success("gemini", response).await?;
        let parsed: GeminiResponse = response
            .json()
            .await
            .map_err(|e| backend_error("gemini", e.without_url()))?;
        gemini_text(parsed)
    }
}

/// Pick the single active backend from the configured credentials.
///
/// Precedence: Gemini, then OpenAI, then DeepSeek. The chosen backend is
/// wrapped in a [`RetryGenerator`] with two retries.
///
/// # Errors
///
/// [`RobotError::Config`] when no AI credential is set.
pub fn select_backend(credentials: &Credentials, client: Client) -> Result<Arc<dyn TextGenerator>> {
    let model = credentials.ai_model.clone();
    let retries = 2;
    let base = StdDuration::from_secs(1);

    let backend: Arc<dyn TextGenerator> = if let Some(key) =
        non_empty(&credentials.google_api_key)
    {
        Arc::new(RetryGenerator::new(Gemini::new(client, key, model), retries, base))
    } else if let Some(key) = non_empty(&credentials.openai_api_key) {
        Arc::new(RetryGenerator::new(
            OpenAiCompatible::openai(client, key, model),
            retries,
            base,
        ))
    } else if let Some(key) = non_empty(&credentials.deepseek_api_key) {
        Arc::new(RetryGenerator::new(
            OpenAiCompatible::deepseek(client, key, model),
            retries,
            base,
        ))
    } else {
        return Err(RobotError::Config(
            "no AI backend configured: set GOOGLE_API_KEY, OPENAI_API_KEY or DEEPSEEK_API_KEY"
                .into(),
        ));
    };
    info!(backend = backend.name(), "AI backend selected");
    Ok(backend)
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.trim().is_empty()).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flaky {
        calls: AtomicUsize,
        fail_first: usize,
        error: fn() -> RobotError,
    }

    #[async_trait]
    impl TextGenerator for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn generate(&self, _prompt: &str) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err((self.error)())
            } else {
                Ok("ok".to_string())
            }
        }
    }

    fn timeout() -> RobotError {
        backend_error("flaky", "timed out")
    }

    fn empty() -> RobotError {
        RobotError::Generation("empty".into())
    }

    fn refused() -> RobotError {
        classify_backend_status("flaky", StatusCode::UNAUTHORIZED, "invalid api key")
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_errors() {
        let flaky = Flaky {
            calls: AtomicUsize::new(0),
            fail_first: 2,
            error: timeout,
        };
        let retry = RetryGenerator::new(flaky, 2, StdDuration::from_millis(1));
        assert_eq!(retry.generate("p").await.unwrap(), "ok");
        assert_eq!(retry.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max() {
        let flaky = Flaky {
            calls: AtomicUsize::new(0),
            fail_first: 10,
            error: timeout,
        };
        let retry = RetryGenerator::new(flaky, 1, StdDuration::from_millis(1));
        assert!(matches!(
            retry.generate("p").await,
            Err(RobotError::Backend { .. })
        ));
        assert_eq!(retry.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_generation_errors_are_not_retried() {
        let flaky = Flaky {
            calls: AtomicUsize::new(0),
            fail_first: 10,
            error: empty,
        };
        let retry = RetryGenerator::new(flaky, 3, StdDuration::from_millis(1));
        assert!(retry.generate("p").await.is_err());
        assert_eq!(retry.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refused_key_is_not_retried() {
        let flaky = Flaky {
            calls: AtomicUsize::new(0),
            fail_first: 10,
            error: refused,
        };
        let retry = RetryGenerator::new(flaky, 3, StdDuration::from_millis(1));
        assert!(matches!(
            retry.generate("p").await,
            Err(RobotError::BackendRejected { status: 401, .. })
        ));
        assert_eq!(retry.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_classify_backend_status() {
        for status in [StatusCode::BAD_REQUEST, StatusCode::FORBIDDEN] {
            let e = classify_backend_status("openai", status, "");
            assert!(matches!(e, RobotError::BackendRejected { .. }));
            assert!(!e.is_retryable());
        }
        for status in [StatusCode::TOO_MANY_REQUESTS, StatusCode::BAD_GATEWAY] {
            let e = classify_backend_status("openai", status, "busy");
            assert!(matches!(e, RobotError::Backend { .. }));
            assert!(e.is_retryable());
        }
    }

    #[tokio::test]
    async fn test_metered_generator_counts_calls() {
        let store = Arc::new(crate::store::MemoryStore::new());
        let flaky = Flaky {
            calls: AtomicUsize::new(0),
            fail_first: 1,
            error: timeout,
        };
        let metered = MeteredGenerator::new(Arc::new(flaky), store.clone());
        assert!(metered.generate("p").await.is_err());
        assert_eq!(metered.generate("p").await.unwrap(), "ok");

        let usage = store.api_usage().await.unwrap();
        assert_eq!(usage[0].service, "flaky");
        assert_eq!(usage[0].calls, 2);
    }

    #[test]
    fn test_backoff_is_capped() {
        let flaky = Flaky {
            calls: AtomicUsize::new(0),
            fail_first: 0,
            error: timeout,
        };
        let retry = RetryGenerator::new(flaky, 10, StdDuration::from_secs(1));
        assert_eq!(retry.backoff(1), StdDuration::from_secs(1));
        assert_eq!(retry.backoff(3), StdDuration::from_secs(4));
        assert_eq!(retry.backoff(9), StdDuration::from_secs(30));
    }

    #[test]
    fn test_chat_text_extraction() {
        let parsed: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"role":"assistant","content":"hi"}}]}"#)
                .unwrap();
        assert_eq!(chat_text(parsed).unwrap(), "hi");

        let parsed: ChatResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(matches!(chat_text(parsed), Err(RobotError::Generation(_))));
    }

    #[test]
    fn test_gemini_text_joins_parts() {
        let parsed: GeminiResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"Hello "},{"text":"world"}],"role":"model"}}]}"#,
        )
        .unwrap();
        assert_eq!(gemini_text(parsed).unwrap(), "Hello world");

        let blocked: GeminiResponse =
            serde_json::from_str(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#).unwrap();
        assert!(gemini_text(blocked).is_err());
    }

    #[test]
    fn test_select_backend_precedence() {
        let client = Client::new();
        let mut creds = Credentials::default();
        assert!(matches!(
            select_backend(&creds, client.clone()),
            Err(RobotError::Config(_))
        ));

        creds.deepseek_api_key = Some("d".into());
        assert_eq!(select_backend(&creds, client.clone()).unwrap().name(), "deepseek");

        creds.openai_api_key = Some("o".into());
        assert_eq!(select_backend(&creds, client.clone()).unwrap().name(), "openai");

        creds.google_api_key = Some("g".into());
        assert_eq!(select_backend(&creds, client.clone()).unwrap().name(), "gemini");

        creds.google_api_key = Some("   ".into());
        assert_eq!(select_backend(&creds, client).unwrap().name(), "openai");
    }

    #[test]
    fn test_debug_redacts_keys() {
        let backend = OpenAiCompatible::openai(Client::new(), "sk-secret".into(), None);
        let rendered = format!("{backend:?}");
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
