//! Helpers for logging, file naming, HTTP and file system checks.

use crate::config::RobotConfig;
use crate::error::{Result, RobotError};
use reqwest::Client;
use std::fs as stdfs;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{info, instrument};

/// Truncate a string for logging purposes.
///
/// Long strings are cut to at most `max` bytes (on a character boundary)
/// with an ellipsis and the number of dropped bytes appended.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(truncate_for_log("short", 100), "short");
/// assert_eq!(truncate_for_log(&"a".repeat(500), 10), "aaaaaaaaaa…(+490 bytes)");
/// ```
pub fn truncate_for_log(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…(+{} bytes)", &s[..cut], s.len() - cut)
}

/// Whether a serde_json error means the input ended early.
///
/// Model replies cut off by a token limit fail this way.
pub fn looks_truncated(e: &serde_json::Error) -> bool {
    use serde_json::error::Category;
    matches!(e.classify(), Category::Eof)
}

/// Convert a title to a file-name friendly slug.
///
/// Lowercases, keeps ASCII alphanumerics, collapses everything else into
/// single hyphens, and caps the result at 60 characters.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(slugify_title("Hello World"), "hello-world");
/// assert_eq!(slugify_title("Fed: Rates -- Held!"), "fed-rates-held");
/// ```
pub fn slugify_title(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    for c in title.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug: String = slug.trim_end_matches('-').chars().take(60).collect();
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() { "article".to_string() } else { slug }
}

/// Domain of `url` if it matches one of `blocked`, including subdomains.
pub fn blocked_domain<'a>(url: &str, blocked: &'a [String]) -> Option<&'a str> {
    let host = url::Url::parse(url).ok()?.host_str()?.to_ascii_lowercase();
    blocked
        .iter()
        .map(|d| d.as_str())
        .find(|d| host == *d || host.ends_with(&format!(".{d}")))
}

/// Shared HTTP client with the configured timeout and user agent.
pub fn http_client(config: &RobotConfig) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .user_agent(config.user_agent.clone())
        .build()
        .map_err(|e| RobotError::Config(format!("cannot build HTTP client: {e}")))
}

/// Ensure a directory exists and is writable.
///
/// Creates the directory if needed, then writes and removes a probe file.
///
/// # Errors
///
/// [`RobotError::Io`] if the directory cannot be created or written to.
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub async fn ensure_writable_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).await?;
    let probe_path = path.join("..__probe_write__");
    stdfs::File::create(&probe_path)?;
    let _ = stdfs::remove_file(&probe_path);
    info!("Directory is writable");
    Ok(())
}
