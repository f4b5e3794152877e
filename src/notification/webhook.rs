use anyhow::Result;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::time::Duration;
use tracing::{info, warn};

use crate::alert::AlertSink;
use crate::models::alert::Alert;

/// The JSON body posted to a generic webhook URL for one dispatched alert.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookEvent {
    pub event_type: String,
    pub timestamp: String,
    pub alert_id: String,
    pub kind: String,
    pub severity: String,
    pub agent_id: String,
    pub session_id: String,
    pub policy_name: Option<String>,
    pub message: String,
}

impl From<&Alert> for WebhookEvent {
    fn from(alert: &Alert) -> Self {
        Self {
            event_type: format!("agentwarden.{}", alert.kind),
            timestamp: alert.time.to_rfc3339(),
            alert_id: alert.id.clone(),
            kind: alert.kind.clone(),
            severity: alert.severity.as_str().to_string(),
            agent_id: alert.agent_id.clone(),
            session_id: alert.session_id.clone(),
            policy_name: alert.policy_name.clone(),
            message: alert.message.clone(),
        }
    }
}

fn hmac_sha256_hex(secret: &str, payload: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Dispatches alert events to one or more configured webhook URLs, with up
/// to 3 retries on a `[0, 1, 5, 25]` second exponential back-off and an
/// optional per-URL HMAC-SHA256 signature in `X-AgentWarden-Signature`.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    targets: Vec<(String, Option<String>)>,
}

impl WebhookNotifier {
    pub fn new(targets: Vec<(String, Option<String>)>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .user_agent("AgentWarden-Webhook/1.0")
                .build()
                .expect("failed to build webhook HTTP client"),
            targets,
        }
    }

    async fn send_signed(&self, url: &str, event: &WebhookEvent, signing_secret: Option<&str>) -> Result<()> {
        let payload = serde_json::to_vec(event)?;
        let delivery_id = uuid::Uuid::new_v4().to_string();
        let signature = signing_secret.map(|s| hmac_sha256_hex(s, &payload));

        let backoff_secs: &[u64] = &[0, 1, 5, 25];
        for (attempt, &delay) in backoff_secs.iter().enumerate() {
            if delay > 0 {
                tracing::debug!(url, attempt, delay_secs = delay, "retrying webhook delivery");
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }

            let mut req = self
                .client
                .post(url)
                .header("content-type", "application/json")
                .header("x-agentwarden-delivery-id", &delivery_id)
                .header("x-agentwarden-event", &event.event_type);
            if let Some(ref sig) = signature {
                req = req.header("x-agentwarden-signature", sig.as_str());
            }

            match req.body(payload.clone()).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!(url, event_type = %event.event_type, delivery_id, attempt, "webhook delivered");
                    return Ok(());
                }
                Ok(resp) => {
                    let status = resp.status();
                    warn!(url, event_type = %event.event_type, attempt, %status, "webhook delivery failed, will retry");
                }
                Err(e) => {
                    warn!(url, event_type = %event.event_type, attempt, error = %e, "webhook request error, will retry");
                }
            }
        }

        Err(anyhow::anyhow!("webhook delivery failed after retries: {url}"))
    }
}

#[async_trait::async_trait]
impl AlertSink for WebhookNotifier {
    async fn send(&self, alert: &Alert) -> anyhow::Result<()> {
        if self.targets.is_empty() {
            return Ok(());
        }
        let event = WebhookEvent::from(alert);
        let mut last_err = None;
        for (url, secret) in &self.targets {
            if let Err(e) = self.send_signed(url, &event, secret.as_deref()).await {
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::alert::Severity;
    use chrono::Utc;

    fn sample_alert() -> Alert {
        Alert {
            id: "alt_1".to_string(),
            kind: "loop".to_string(),
            severity: Severity::High,
            agent_id: "agent-1".to_string(),
            session_id: "ses-1".to_string(),
            policy_name: None,
            action_type: None,
            message: "repeated action".to_string(),
            time: Utc::now(),
        }
    }

    #[test]
    fn event_conversion_prefixes_kind() {
        let alert = sample_alert();
        let event = WebhookEvent::from(&alert);
        assert_eq!(event.event_type, "agentwarden.loop");
        assert_eq!(event.severity, "high");
    }

    #[test]
    fn event_serializes_to_json() {
        let event = WebhookEvent::from(&sample_alert());
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("agentwarden.loop"));
        assert!(json.contains("timestamp"));
    }

    #[test]
    fn hmac_signature_is_deterministic_and_secret_sensitive() {
        let sig1 = hmac_sha256_hex("secret123", b"payload");
        let sig2 = hmac_sha256_hex("secret123", b"payload");
        assert_eq!(sig1, sig2);
        assert!(sig1.starts_with("sha256="));

        let sig3 = hmac_sha256_hex("other", b"payload");
        assert_ne!(sig1, sig3);
    }

    #[tokio::test]
    async fn send_with_no_targets_is_a_no_op() {
        let notifier = WebhookNotifier::new(vec![]);
        notifier.send(&sample_alert()).await.unwrap();
    }
}
