use anyhow::Context;
use serde::Serialize;

use crate::alert::AlertSink;
use crate::models::alert::Alert;

/// Posts a formatted message to a Slack incoming-webhook URL for every
/// dispatched alert. A `None` URL means the sink is configured but disabled
/// — `send` becomes a silent no-op rather than an error, since an operator
/// may legitimately run without Slack wired up.
#[derive(Clone)]
pub struct SlackNotifier {
    client: reqwest::Client,
    webhook_url: Option<String>,
}

impl SlackNotifier {
    pub fn new(webhook_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url,
        }
    }
}

#[async_trait::async_trait]
impl AlertSink for SlackNotifier {
    async fn send(&self, alert: &Alert) -> anyhow::Result<()> {
        let url = match &self.webhook_url {
            Some(u) => u,
            None => {
                tracing::debug!("no slack webhook configured, skipping notification");
                return Ok(());
            }
        };

        let emoji = match alert.severity {
            crate::models::alert::Severity::Critical => "🔴",
            crate::models::alert::Severity::High => "🟠",
            crate::models::alert::Severity::Medium => "🟡",
            crate::models::alert::Severity::Low => "⚪",
        };

        let message = SlackMessage {
            text: format!(
                "{emoji} *{}* ({})\nagent: `{}` session: `{}`\n{}",
                alert.kind,
                alert.severity.as_str(),
                alert.agent_id,
                alert.session_id,
                alert.message,
            ),
        };

        let resp = self
            .client
            .post(url)
            .json(&message)
            .send()
            .await
            .context("failed to send slack notification")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("slack returned error: status={status}, body={body}");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "slack"
    }
}

#[derive(Serialize)]
struct SlackMessage {
    text: String,
}
