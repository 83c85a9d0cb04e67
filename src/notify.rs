//! Operator notifications over a chat webhook (Discord-compatible payload).
//!
//! Delivery is best effort: failures are logged at `warn` and swallowed.

use reqwest::Client;
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Success,
    Error,
}

impl Level {
    fn icon(&self) -> &'static str {
        match self {
            Level::Info => "ℹ️",
            Level::Success => "✅",
            Level::Error => "❌",
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
struct WebhookPayload {
    content: String,
    username: &'static str,
}

fn payload(message: &str, level: Level) -> WebhookPayload {
    WebhookPayload {
        content: format!("{} {message}", level.icon()),
        username: "Content Robot",
    }
}

#[derive(Debug, Clone)]
pub struct Notifier {
    client: Client,
    webhook_url: String,
}

impl Notifier {
    /// `None` when no webhook is configured.
    pub fn from_url(client: Client, webhook_url: Option<&str>) -> Option<Self> {
        webhook_url
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(|u| Self {
                client,
                webhook_url: u.to_string(),
            })
    }

    pub async fn send(&self, message: &str, level: Level) {
        let result = self
            .client
            .post(&self.webhook_url)
            .json(&payload(message, level))
            .send()
            .await
            .and_then(|r| r.error_for_status());
        match result {
            Ok(_) => debug!(?level, "Notification sent"),
            Err(e) => warn!(error = %e.without_url(), "Notification failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_shape() {
        let json = serde_json::to_value(payload("3 published", Level::Success)).unwrap();
        assert_eq!(json["content"], "✅ 3 published");
        assert_eq!(json["username"], "Content Robot");
    }

    #[test]
    fn test_blank_url_disables_notifier() {
        assert!(Notifier::from_url(Client::new(), None).is_none());
        assert!(Notifier::from_url(Client::new(), Some("  ")).is_none());
        assert!(Notifier::from_url(Client::new(), Some("https://hooks.example/x")).is_some());
    }
}
