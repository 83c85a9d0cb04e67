//! YAML configuration.
//!
//! Everything that is not a secret lives in `config.yaml`. Secrets (API keys,
//! CMS credentials, webhook URL) come from the environment through
//! [`crate::cli::Credentials`] and never from this file.
//!
//! Every field has a default, so an empty or missing file is a valid
//! configuration apart from the feed list.
//!
//! ```yaml
//! feeds:
//!   - id: techcrunch
//!     url: https://techcrunch.com/feed/
//! ab_testing: true
//! selection_policy: weighted
//! variant_weights:
//!   seo: 3
//!   viral: 1
//! auto_publish: false
//! generate_images: true
//! ```

use crate::error::{Result, RobotError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Short name used in logs and on drafts.
    pub id: String,
    pub url: String,
}

/// How the prompt selector picks a variant in A/B mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicyKind {
    #[default]
    RoundRobin,
    Weighted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotConfig {
    pub feeds: Vec<FeedConfig>,
    /// Entries considered per feed, newest first as the feed lists them.
    pub max_items_per_feed: usize,
    /// Articles with less extracted text than this are skipped.
    pub min_content_chars: usize,
    /// Article text is clipped to this many characters in prompts.
    pub content_char_limit: usize,
    pub blocked_domains: Vec<String>,
    pub ab_testing: bool,
    pub selection_policy: SelectionPolicyKind,
    /// Weights for [`SelectionPolicyKind::Weighted`]; missing variants weigh 1.
    pub variant_weights: BTreeMap<String, u32>,
    /// Replaces the built-in default style when A/B testing is off.
    pub custom_prompt: Option<String>,
    /// Drafts below this self-reported quality score are discarded.
    pub min_quality_score: Option<u32>,
    pub auto_publish: bool,
    pub generate_images: bool,
    pub images_dir: PathBuf,
    pub database_path: PathBuf,
    pub request_timeout_secs: u64,
    pub interval_minutes: u64,
    /// Stop retrying an article after this many failed rewrites. Unset retries forever.
    pub max_generation_attempts: Option<u32>,
    pub user_agent: String,
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            feeds: Vec::new(),
            max_items_per_feed: 3,
            min_content_chars: 150,
            content_char_limit: 4000,
            blocked_domains: vec![
                "fastcompany.com".to_string(),
                "medium.com".to_string(),
                "substack.com".to_string(),
            ],
            ab_testing: false,
            selection_policy: SelectionPolicyKind::RoundRobin,
            variant_weights: BTreeMap::new(),
            custom_prompt: None,
            min_quality_score: None,
            auto_publish: false,
            generate_images: false,
            images_dir: PathBuf::from("images"),
            database_path: PathBuf::from("content_robot.db"),
            request_timeout_secs: 60,
            interval_minutes: 120,
            max_generation_attempts: None,
            user_agent: "Mozilla/5.0 (compatible; awful_content_robot/0.1)".to_string(),
        }
    }
}

/// One week.
pub const MAX_INTERVAL_MINUTES: u64 = 7 * 24 * 60;

impl RobotConfig {
    /// Time between two scheduled cycles.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes.saturating_mul(60))
    }

    /// Reject values that would make the pipeline misbehave.
    ///
    /// # Errors
    ///
    /// [`RobotError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.max_items_per_feed == 0 {
            return Err(RobotError::Config("max_items_per_feed must be > 0".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(RobotError::Config("request_timeout_secs must be > 0".into()));
        }
        if self.interval_minutes == 0 || self.interval_minutes > MAX_INTERVAL_MINUTES {
            return Err(RobotError::Config(format!(
                "interval_minutes must be between 1 and {MAX_INTERVAL_MINUTES}"
            )));
        }
        if self.content_char_limit == 0 {
            return Err(RobotError::Config("content_char_limit must be > 0".into()));
        }
        if self.max_generation_attempts == Some(0) {
            return Err(RobotError::Config(
                "max_generation_attempts must be > 0 when set".into(),
            ));
        }
        if let Some(feed) = self.feeds.iter().find(|f| url::Url::parse(&f.url).is_err()) {
            return Err(RobotError::Config(format!(
                "feed '{}' has an invalid url: {}",
                feed.id, feed.url
            )));
        }
        if self.selection_policy == SelectionPolicyKind::Weighted
            && !self.variant_weights.is_empty()
            && self.variant_weights.values().all(|w| *w == 0)
        {
            return Err(RobotError::Config("variant_weights are all zero".into()));
        }
        Ok(())
    }
}

/// Load the configuration file.
///
/// With `path` set, the file must exist. Without it, `config.yaml` in the
/// working directory is used if present and defaults otherwise.
///
/// # Errors
///
/// I/O and YAML errors, plus anything [`RobotConfig::validate`] rejects.
pub fn load_config(path: Option<&Path>) -> Result<RobotConfig> {
    let config = match path {
        Some(path) => parse_file(path)?,
        None => {
            let default_path = Path::new("config.yaml");
            if default_path.exists() {
                parse_file(default_path)?
            } else {
                warn!("No config.yaml found; using defaults");
                RobotConfig::default()
            }
        }
    };
    config.validate()?;
    info!(
        feeds = config.feeds.len(),
        ab_testing = config.ab_testing,
        auto_publish = config.auto_publish,
        generate_images = config.generate_images,
        "Loaded configuration"
    );
    Ok(config)
}

fn parse_file(path: &Path) -> Result<RobotConfig> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        RobotError::Config(format!("cannot read {}: {e}", path.display()))
    })?;
    parse_str(&raw)
}

pub fn parse_str(raw: &str) -> Result<RobotConfig> {
    if raw.trim().is_empty() {
        return Ok(RobotConfig::default());
    }
    Ok(serde_yaml::from_str(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = RobotConfig::default();
        assert_eq!(config.max_items_per_feed, 3);
        assert_eq!(config.min_content_chars, 150);
        assert_eq!(config.content_char_limit, 4000);
        assert_eq!(config.interval_minutes, 120);
        assert!(config.blocked_domains.contains(&"medium.com".to_string()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = parse_str(
            r#"
feeds:
  - id: techcrunch
    url: https://techcrunch.com/feed/
ab_testing: true
selection_policy: weighted
variant_weights:
  seo: 3
"#,
        )
        .unwrap();
        assert_eq!(config.feeds.len(), 1);
        assert_eq!(config.feeds[0].id, "techcrunch");
        assert!(config.ab_testing);
        assert_eq!(config.selection_policy, SelectionPolicyKind::Weighted);
        assert_eq!(config.variant_weights.get("seo"), Some(&3));
        assert_eq!(config.max_items_per_feed, 3);
        assert!(!config.auto_publish);
    }

    #[test]
    fn test_empty_file_is_default() {
        assert_eq!(parse_str("  \n").unwrap(), RobotConfig::default());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = RobotConfig::default();
        config.max_generation_attempts = Some(0);
        assert!(config.validate().is_err());

        let mut config = RobotConfig::default();
        config.feeds.push(FeedConfig {
            id: "broken".into(),
            url: "not a url".into(),
        });
        assert!(matches!(config.validate(), Err(RobotError::Config(_))));
    }

    #[test]
    fn test_interval_is_bounded() {
        let mut config = RobotConfig::default();
        assert_eq!(config.interval(), Duration::from_secs(120 * 60));

        config.interval_minutes = u64::MAX;
        assert!(config.validate().is_err());
        assert_eq!(config.interval(), Duration::from_secs(u64::MAX));

        config.interval_minutes = MAX_INTERVAL_MINUTES;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "interval_minutes: 30\nauto_publish: true").unwrap();
        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.interval_minutes, 30);
        assert!(config.auto_publish);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_config(Some(&dir.path().join("absent.yaml")));
        assert!(matches!(result, Err(RobotError::Config(_))));
    }
}
