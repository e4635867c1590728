use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Delivery outcome. A disabled channel is not a failure: callers that
/// record delivery must keep the two distinct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NotifyOutcome {
    Sent,
    ChannelDisabled,
    Failed { reason: String },
}

impl NotifyOutcome {
    pub fn delivered(&self) -> bool {
        matches!(self, NotifyOutcome::Sent)
    }
}

/// Outbound notification port (chat webhook, email relay, …).
#[async_trait]
pub trait Notifier: Send + Sync {
    fn channel_name(&self) -> &str;

    async fn send(&self, subject: &str, body: &str) -> NotifyOutcome;
}

/// Incoming-webhook notifier for chat channels. An unset URL means the
/// channel is configured off, which is reported as `ChannelDisabled`.
pub struct WebhookNotifier {
    http: Client,
    channel: String,
    url: Option<String>,
}

impl WebhookNotifier {
    pub fn new(channel: &str, url: Option<String>) -> Self {
        Self {
            http: Client::new(),
            channel: channel.to_string(),
            url: url.filter(|u| !u.trim().is_empty()),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn channel_name(&self) -> &str {
        &self.channel
    }

    async fn send(&self, subject: &str, body: &str) -> NotifyOutcome {
        let Some(url) = &self.url else {
            return NotifyOutcome::ChannelDisabled;
        };
        let payload = json!({ "text": format!("*{subject}*\n{body}") });
        match self.http.post(url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => NotifyOutcome::Sent,
            Ok(response) => NotifyOutcome::Failed {
                reason: format!("webhook returned {}", response.status()),
            },
            Err(err) => NotifyOutcome::Failed {
                reason: err.to_string(),
            },
        }
    }
}

/// Always-disabled notifier for deployments without a channel.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    fn channel_name(&self) -> &str {
        "noop"
    }

    async fn send(&self, _subject: &str, _body: &str) -> NotifyOutcome {
        NotifyOutcome::ChannelDisabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unset_url_reports_disabled_not_failed() {
        let notifier = WebhookNotifier::new("slack", None);
        let outcome = notifier.send("subject", "body").await;
        assert_eq!(outcome, NotifyOutcome::ChannelDisabled);
        assert!(!outcome.delivered());
    }

    #[tokio::test]
    async fn blank_url_counts_as_disabled() {
        let notifier = WebhookNotifier::new("slack", Some("   ".to_string()));
        assert_eq!(
            notifier.send("s", "b").await,
            NotifyOutcome::ChannelDisabled
        );
    }
}
