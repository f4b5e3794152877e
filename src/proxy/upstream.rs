//! HTTP client for forwarding governed requests to upstream providers, and
//! the model → provider [`Router`] that picks which base URL to forward to
//! (spec §4.1.1).

use std::time::Duration;

use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};

use crate::config::Config;
use crate::errors::AppError;

/// Ordered, case-insensitive prefix table mapping a model name to a
/// provider key. Order matters only in that every prefix here is
/// unambiguous; first match wins.
const OPENAI_PREFIXES: &[&str] = &[
    "gpt-", "o1-", "o3-", "o4-", "chatgpt-", "text-embedding-", "text-moderation-", "dall-e-",
    "whisper-", "tts-",
];
const ANTHROPIC_PREFIXES: &[&str] = &["claude-"];
const GEMINI_PREFIXES: &[&str] = &["gemini-", "gemma-"];

/// Resolves a model string to an upstream base URL (spec §4.1.1).
///
/// Case-insensitive throughout: first an exact provider-key match, then a
/// prefix match against the ordered tables, then a substring match against
/// the provider name itself, finally the configured default.
pub struct Router {
    default: String,
    openai: String,
    anthropic: String,
    gemini: String,
}

impl Router {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            default: cfg.upstream_default.clone(),
            openai: cfg.upstream_openai.clone(),
            anthropic: cfg.upstream_anthropic.clone(),
            gemini: cfg.upstream_gemini.clone(),
        }
    }

    pub fn resolve(&self, model: Option<&str>) -> &str {
        let Some(model) = model else {
            return &self.default;
        };
        let lower = model.to_ascii_lowercase();

        if lower == "openai" {
            return &self.openai;
        }
        if lower == "anthropic" {
            return &self.anthropic;
        }
        if lower == "gemini" {
            return &self.gemini;
        }

        if OPENAI_PREFIXES.iter().any(|p| lower.starts_with(p)) {
            return &self.openai;
        }
        if ANTHROPIC_PREFIXES.iter().any(|p| lower.starts_with(p)) {
            return &self.anthropic;
        }
        if GEMINI_PREFIXES.iter().any(|p| lower.starts_with(p)) {
            return &self.gemini;
        }

        if lower.contains("openai") {
            return &self.openai;
        }
        if lower.contains("anthropic") || lower.contains("claude") {
            return &self.anthropic;
        }
        if lower.contains("gemini") || lower.contains("gemma") {
            return &self.gemini;
        }

        &self.default
    }
}

/// HTTP client used to forward a governed request to its resolved
/// upstream. Wrapped with a bounded exponential-backoff retry for
/// transient connection/5xx failures.
pub struct UpstreamClient {
    client: ClientWithMiddleware,
}

impl UpstreamClient {
    pub fn new(timeout: Duration) -> Self {
        let reqwest_client = reqwest::Client::builder()
            .use_rustls_tls()
            .pool_max_idle_per_host(32)
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("failed to build HTTP client");

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let client = ClientBuilder::new(reqwest_client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Self { client }
    }

    pub async fn forward(
        &self,
        method: reqwest::Method,
        url: &str,
        headers: reqwest::header::HeaderMap,
        body: Vec<u8>,
    ) -> Result<reqwest::Response, AppError> {
        self.client
            .request(method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, url, "upstream request failed after retries");
                AppError::UpstreamError(e.to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> Router {
        Router {
            default: "https://default.example".into(),
            openai: "https://openai.example".into(),
            anthropic: "https://anthropic.example".into(),
            gemini: "https://gemini.example".into(),
        }
    }

    #[test]
    fn routes_openai_prefix() {
        assert_eq!(router().resolve(Some("gpt-4o-mini")), "https://openai.example");
    }

    #[test]
    fn routes_anthropic_prefix_case_insensitive() {
        assert_eq!(router().resolve(Some("Claude-3-5-Sonnet")), "https://anthropic.example");
    }

    #[test]
    fn routes_gemini_prefix() {
        assert_eq!(router().resolve(Some("gemini-2.0-flash")), "https://gemini.example");
    }

    #[test]
    fn falls_back_to_default_for_unknown_model() {
        assert_eq!(router().resolve(Some("llama-3.1-70b")), "https://default.example");
    }

    #[test]
    fn falls_back_to_default_when_no_model() {
        assert_eq!(router().resolve(None), "https://default.example");
    }
}
