use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::models::policy::{AiJudgeConfig, TimeoutEffect};

/// Verdict parsed out of the judge model's response.
#[derive(Debug, Clone, Deserialize)]
pub struct JudgeVerdict {
    pub deny: bool,
    pub reason: String,
    #[serde(default)]
    pub confidence: f64,
}

/// Action details rendered into the judge's user prompt.
pub struct JudgeRequest<'a> {
    pub action_type: &'a str,
    pub action_name: &'a str,
    pub action_target: &'a str,
    pub action_params: &'a serde_json::Value,
}

fn strip_markdown_fence(s: &str) -> &str {
    let s = s.trim();
    let s = s.strip_prefix("```json").or_else(|| s.strip_prefix("```")).unwrap_or(s);
    s.strip_suffix("```").unwrap_or(s).trim()
}

/// Calls an OpenAI-compatible chat endpoint with a low temperature and a
/// small `max_tokens` budget, asking it to render a strict JSON verdict. On
/// timeout or malformed output the caller applies `timeout_effect` (spec
/// §4.2) — this function itself never guesses a verdict.
pub async fn judge(
    client: &reqwest::Client,
    base_url: &str,
    api_key: Option<&str>,
    cfg: &AiJudgeConfig,
    request: JudgeRequest<'_>,
) -> anyhow::Result<JudgeVerdict> {
    let system_prompt = format!(
        "You are a policy enforcement judge for an AI agent governance system. \
         Evaluate the following action against this policy context and respond \
         with a strict JSON object of the form {{\"deny\": bool, \"reason\": string, \
         \"confidence\": number between 0 and 1}}. Do not include any other text.\n\n\
         Policy context:\n{}",
        cfg.context
    );
    let user_prompt = json!({
        "action_type": request.action_type,
        "action_name": request.action_name,
        "action_target": request.action_target,
        "action_params": request.action_params,
    })
    .to_string();

    let body = json!({
        "model": cfg.model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string()),
        "temperature": 0.0,
        "max_tokens": 200,
        "messages": [
            {"role": "system", "content": system_prompt},
            {"role": "user", "content": user_prompt},
        ],
    });

    let mut req = client
        .post(format!("{}/v1/chat/completions", base_url.trim_end_matches('/')))
        .json(&body)
        .timeout(cfg.timeout);
    if let Some(key) = api_key {
        req = req.bearer_auth(key);
    }

    let response = req.send().await?.error_for_status()?;
    let value: serde_json::Value = response.json().await?;
    let content = value
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| anyhow::anyhow!("judge response missing choices[0].message.content"))?;

    let cleaned = strip_markdown_fence(content);
    let mut verdict: JudgeVerdict = serde_json::from_str(cleaned)?;
    verdict.confidence = verdict.confidence.clamp(0.0, 1.0);
    Ok(verdict)
}

/// Resolves a judge call's outcome once it times out or fails to parse,
/// per the policy's configured `timeout_effect`.
pub fn on_failure(timeout_effect: TimeoutEffect) -> JudgeVerdict {
    JudgeVerdict {
        deny: timeout_effect == TimeoutEffect::Deny,
        reason: "ai-judge call failed or timed out".to_string(),
        confidence: 0.0,
    }
}

/// Helper used by the evaluation pipeline to race the judge call against its
/// configured timeout explicitly (in addition to the request-level
/// `reqwest` timeout, which guards against a hung connection).
pub async fn judge_with_timeout(
    client: &reqwest::Client,
    base_url: &str,
    api_key: Option<&str>,
    cfg: &AiJudgeConfig,
    request: JudgeRequest<'_>,
) -> JudgeVerdict {
    match tokio::time::timeout(
        cfg.timeout + Duration::from_millis(50),
        judge(client, base_url, api_key, cfg, request),
    )
    .await
    {
        Ok(Ok(verdict)) => verdict,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "ai-judge call failed");
            on_failure(cfg.timeout_effect)
        }
        Err(_) => {
            tracing::warn!("ai-judge call timed out");
            on_failure(cfg.timeout_effect)
        }
    }
}
