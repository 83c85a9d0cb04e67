//! Command-line interface for the content robot.
//!
//! Secrets are accepted as flags but normally come from the environment
//! variables named on each option.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Rewrite RSS articles with an LLM and publish them behind an approval queue.
///
/// # Examples
///
/// ```sh
/// # Run forever, one cycle every `interval_minutes`
/// awful_content_robot run
///
/// # Review the queue
/// awful_content_robot pending
/// awful_content_robot approve 3f1c... --notes "good angle"
/// awful_content_robot reject 9a0b... --notes "off-topic"
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to config.yaml (defaults to ./config.yaml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the SQLite database path from the config file
    #[arg(long, global = true, env = "CONTENT_ROBOT_DB")]
    pub database: Option<PathBuf>,

    #[command(flatten)]
    pub credentials: Credentials,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Fetch, rewrite and publish articles
    Run {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },
    /// List drafts waiting for review
    Pending,
    /// Approve a pending draft (and publish it when a CMS is configured)
    Approve {
        draft_id: String,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Reject a pending draft; its article is never processed again
    Reject {
        draft_id: String,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Retry publishing every approved draft
    PublishApproved,
    /// Print prompt variant statistics as JSON
    Stats,
}

/// API keys and CMS credentials.
#[derive(Args, Debug, Default, Clone)]
pub struct Credentials {
    /// Google Gemini API key
    #[arg(long, env = "GOOGLE_API_KEY", hide_env_values = true, global = true)]
    pub google_api_key: Option<String>,

    /// OpenAI API key
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true, global = true)]
    pub openai_api_key: Option<String>,

    /// DeepSeek API key
    #[arg(long, env = "DEEPSEEK_API_KEY", hide_env_values = true, global = true)]
    pub deepseek_api_key: Option<String>,

    /// Model name for the selected AI backend
    #[arg(long, env = "AI_MODEL", global = true)]
    pub ai_model: Option<String>,

    /// Stability AI key; enables cover images when `generate_images` is on
    #[arg(long, env = "STABILITY_API_KEY", hide_env_values = true, global = true)]
    pub stability_api_key: Option<String>,

    /// WordPress site URL, e.g. https://blog.example.com
    #[arg(long, env = "WORDPRESS_URL", global = true)]
    pub wordpress_url: Option<String>,

    /// WordPress user name
    #[arg(long, env = "WORDPRESS_USERNAME", global = true)]
    pub wordpress_username: Option<String>,

    /// WordPress application password
    #[arg(long, env = "WORDPRESS_PASSWORD", hide_env_values = true, global = true)]
    pub wordpress_password: Option<String>,

    /// Discord-compatible webhook for operator notifications
    #[arg(long, env = "NOTIFICATION_WEBHOOK_URL", hide_env_values = true, global = true)]
    pub notification_webhook_url: Option<String>,
}

impl Credentials {
    /// WordPress URL, user and password when all three are set.
    pub fn wordpress(&self) -> Option<(&str, &str, &str)> {
        let url = self.wordpress_url.as_deref().filter(|s| !s.trim().is_empty())?;
        let user = self
            .wordpress_username
            .as_deref()
            .filter(|s| !s.trim().is_empty())?;
        let password = self
            .wordpress_password
            .as_deref()
            .filter(|s| !s.is_empty())?;
        Some((url, user, password))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_once() {
        let cli = Cli::parse_from(["awful_content_robot", "run", "--once"]);
        assert_eq!(cli.command, Command::Run { once: true });
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_approve_with_notes_and_global_config() {
        let cli = Cli::parse_from([
            "awful_content_robot",
            "approve",
            "abc-123",
            "--notes",
            "looks good",
            "--config",
            "/etc/robot.yaml",
        ]);
        assert_eq!(
            cli.command,
            Command::Approve {
                draft_id: "abc-123".into(),
                notes: Some("looks good".into())
            }
        );
        assert_eq!(cli.config, Some(PathBuf::from("/etc/robot.yaml")));
    }

    #[test]
    fn test_credentials_flags() {
        let cli = Cli::parse_from([
            "awful_content_robot",
            "--wordpress-url",
            "https://blog.example",
            "--wordpress-username",
            "bot",
            "--wordpress-password",
            "secret",
            "publish-approved",
        ]);
        assert_eq!(cli.command, Command::PublishApproved);
        assert_eq!(
            cli.credentials.wordpress(),
            Some(("https://blog.example", "bot", "secret"))
        );
    }

    #[test]
    fn test_partial_wordpress_credentials() {
        let creds = Credentials {
            wordpress_url: Some("https://blog.example".into()),
            ..Credentials::default()
        };
        assert!(creds.wordpress().is_none());
    }

    #[test]
    fn test_subcommand_is_required() {
        assert!(Cli::try_parse_from(["awful_content_robot"]).is_err());
    }
}
