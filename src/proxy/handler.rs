//! The governed request path (spec §4.1): every proxied call to an upstream
//! LLM provider passes through here. Order of operations —
//!
//! 1. extract the AgentWarden-private headers (agent/session/metadata),
//!    falling back to an anonymous agent and a fresh session;
//! 2. resolve or create the session;
//! 3. capture the request body and classify the action;
//! 4. check the session pause flag, then the kill switch;
//! 5. run the policy engine and act on its verdict;
//! 6. forward to the resolved upstream, buffered or via SSE passthrough;
//! 7. finalize: compute cost, bump counters, persist the trace, and feed the
//!    detection engine.
//!
//! Every disposition below writes exactly one trace row — the audit record
//! is the point of the sidecar, not an afterthought bolted onto the happy
//! path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use rust_decimal::prelude::ToPrimitive;

use crate::errors::AppError;
use crate::models::cost;
use crate::models::session::Session;
use crate::models::trace::{new_trace_id, truncate_for_storage, ActionType, Trace, TraceStatus};
use crate::policy::expr::EvalContext;
use crate::policy::Verdict;
use crate::proxy::stream;
use crate::AppState;

const HDR_AGENT_ID: &str = "x-agentwarden-agent-id";
const HDR_SESSION_ID: &str = "x-agentwarden-session-id";
const HDR_METADATA: &str = "x-agentwarden-metadata";
const HDR_TRACE_ID: &str = "x-trace-id";

/// How long the request task waits on a pending approval before handing the
/// client a `202` and letting the approval resolve in the background (spec
/// §4.1.3, "pending beyond request timeout"). Distinct from a policy's own
/// `approval_timeout`, which governs how long the approval stays pending at
/// all before `timeout_effect` applies.
const SYNC_APPROVAL_WAIT: Duration = Duration::from_secs(20);

const CLASSIFY_RULES: &[(&str, ActionType, &str)] = &[
    ("/chat/completions", ActionType::LlmChat, "chat_completion"),
    ("/completions", ActionType::LlmChat, "completion"),
    ("/messages", ActionType::LlmChat, "messages"),
    (":generateContent", ActionType::LlmChat, "generate_content"),
    (
        ":streamGenerateContent",
        ActionType::LlmChat,
        "stream_generate_content",
    ),
    ("/embeddings", ActionType::LlmEmbedding, "embeddings"),
    (
        "/images/generations",
        ActionType::ApiRequest,
        "image_generation",
    ),
    (
        "/audio/transcriptions",
        ActionType::ApiRequest,
        "audio_transcription",
    ),
    ("/audio/speech", ActionType::ApiRequest, "audio_speech"),
    ("/moderations", ActionType::ApiRequest, "moderation"),
];

/// Ordered path-suffix classification (spec §4.1, step 5). Falls back to
/// `api.request`, named `api_request:<model>` when a model is present in the
/// body, else the bare `api_request`.
fn classify(path: &str, model: Option<&str>) -> (ActionType, String) {
    for (suffix, action_type, name) in CLASSIFY_RULES {
        if path.ends_with(suffix) {
            return (*action_type, (*name).to_string());
        }
    }
    match model {
        Some(m) => (ActionType::ApiRequest, format!("api_request:{m}")),
        None => (ActionType::ApiRequest, "api_request".to_string()),
    }
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Parses the metadata header as JSON, dropping it silently on a parse
/// failure rather than rejecting the request.
fn parse_metadata(headers: &HeaderMap) -> serde_json::Value {
    match header_str(headers, HDR_METADATA) {
        Some(raw) => serde_json::from_str(raw).unwrap_or(serde_json::Value::Null),
        None => serde_json::Value::Null,
    }
}

fn pricing_provider(model: &str) -> &'static str {
    let lower = model.to_ascii_lowercase();
    if lower.starts_with("claude-") {
        "anthropic"
    } else if lower.starts_with("gemini-") || lower.starts_with("gemma-") {
        "google"
    } else {
        "openai"
    }
}

pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let start = Instant::now();
    let trace_id = new_trace_id();

    let agent_id = header_str(&headers, HDR_AGENT_ID).unwrap_or_default().to_string();
    let session_id_hdr = header_str(&headers, HDR_SESSION_ID).map(|s| s.to_string());
    let metadata = parse_metadata(&headers);

    let session = state
        .sessions
        .get_or_create(&agent_id, session_id_hdr.as_deref(), metadata)
        .await;

    let path = uri.path().to_string();
    let body_json: serde_json::Value =
        serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    let model = cost::extract_model(&body);
    let (action_type, action_name) = classify(&path, model.as_deref());
    let target = model.clone().unwrap_or_else(|| path.clone());
    let request_body = truncate_for_storage(&body);

    let finalize = {
        let trace_id = trace_id.clone();
        let session_id = session.id.clone();
        let agent_id = session.agent_id.clone();
        let action_name = action_name.clone();
        let body_json = body_json.clone();
        let target = target.clone();
        let request_body = request_body.clone();
        let model = model.clone();
        move |status: TraceStatus,
              matched_policy: Option<String>,
              policy_reason: Option<String>,
              response_body: String,
              tokens_in: u32,
              tokens_out: u32,
              cost_usd: f64| Trace {
            id: trace_id.clone(),
            session_id: session_id.clone(),
            agent_id: agent_id.clone(),
            timestamp: chrono::Utc::now(),
            action_type,
            action_name: action_name.clone(),
            action_params: body_json.clone(),
            target: target.clone(),
            request_body: request_body.clone(),
            response_body,
            status,
            model: model.clone(),
            tokens_in,
            tokens_out,
            cost_usd,
            latency_ms: start.elapsed().as_millis() as u64,
            matched_policy,
            policy_reason,
            prev_hash: String::new(),
            hash: String::new(),
        }
    };

    if state.sessions.is_paused(&session.id) {
        state.sessions.increment_actions(&session.id, action_type);
        let trace = finalize(
            TraceStatus::Terminated,
            None,
            Some("session paused".into()),
            String::new(),
            0,
            0,
            0.0,
        );
        return persist_and_respond(&state, trace, AppError::SessionPaused).await;
    }

    if state.killswitch.is_tripped(&session.agent_id, &session.id) {
        state.sessions.increment_actions(&session.id, action_type);
        let trace = finalize(
            TraceStatus::Terminated,
            None,
            Some("kill switch active".into()),
            String::new(),
            0,
            0,
            0.0,
        );
        return persist_and_respond(
            &state,
            trace,
            AppError::KillSwitchActive("request blocked: kill switch active".into()),
        )
        .await;
    }

    let agent_daily_cost = state
        .store
        .agent_daily_cost(&session.agent_id)
        .await
        .unwrap_or(0.0);
    let window_fn = state.sessions.count_in_window_fn(&session.id);
    let ctx = EvalContext {
        action_type: action_type.as_str(),
        action_name: &action_name,
        action_target: &target,
        action_params: &body_json,
        session_id: &session.id,
        session_agent_id: &session.agent_id,
        session_cost: session.total_cost,
        session_action_count: session.action_count as i64,
        agent_id: &session.agent_id,
        agent_name: &session.agent_id,
        agent_daily_cost,
        count_in_window: &window_fn,
    };

    let verdict = state.policy.evaluate(&ctx).await;

    match verdict {
        Verdict::Deny { policy, message } => {
            state.sessions.increment_actions(&session.id, action_type);
            let trace = finalize(
                TraceStatus::Denied,
                Some(policy.clone()),
                Some(message.clone()),
                String::new(),
                0,
                0,
                0.0,
            );
            persist_and_respond(
                &state,
                trace,
                AppError::PolicyDenied { policy, reason: message },
            )
            .await
        }
        Verdict::Terminate { policy, message } => {
            state.sessions.increment_actions(&session.id, action_type);
            state.sessions.terminate(&session.id).await;
            state
                .alerts
                .raise(crate::models::alert::Violation {
                    kind: "policy_terminate".to_string(),
                    severity: crate::models::alert::Severity::Critical,
                    agent_id: session.agent_id.clone(),
                    session_id: session.id.clone(),
                    policy_name: Some(policy.clone()),
                    action_type: Some(action_type),
                    message: message.clone(),
                })
                .await;
            let trace = finalize(
                TraceStatus::Terminated,
                Some(policy.clone()),
                Some(message.clone()),
                String::new(),
                0,
                0,
                0.0,
            );
            persist_and_respond(
                &state,
                trace,
                AppError::PolicyTerminated { policy, reason: message },
            )
            .await
        }
        Verdict::Approve {
            policy,
            message,
            approvers,
            timeout,
            timeout_effect,
        } => {
            let summary = serde_json::json!({
                "action_type": action_type.as_str(),
                "action_name": action_name,
                "target": target,
                "approvers": approvers,
            });
            let record = match state
                .approvals
                .create(&session.id, &trace_id, &policy, summary, timeout, timeout_effect)
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    let trace = finalize(
                        TraceStatus::Denied,
                        Some(policy.clone()),
                        Some("failed to create approval record".into()),
                        String::new(),
                        0,
                        0,
                        0.0,
                    );
                    return persist_and_respond(&state, trace, AppError::Database(e)).await;
                }
            };

            let queue = state.approvals.clone();
            let wait_record = record.clone();
            let wait_handle = tokio::spawn(async move { queue.wait(&wait_record).await });

            match tokio::time::timeout(SYNC_APPROVAL_WAIT, wait_handle).await {
                Ok(Ok(crate::approval::ApprovalOutcome::Approved)) => {
                    forward_and_finalize(
                        &state,
                        &session,
                        action_type,
                        model,
                        &trace_id,
                        &method,
                        &uri,
                        &headers,
                        body,
                        finalize,
                        Some(policy),
                        Some("approved".to_string()),
                        TraceStatus::Approved,
                    )
                    .await
                }
                Ok(Ok(_)) => {
                    let trace = finalize(
                        TraceStatus::Denied,
                        Some(policy.clone()),
                        Some(message),
                        String::new(),
                        0,
                        0,
                        0.0,
                    );
                    persist_and_respond(&state, trace, AppError::ApprovalRejected).await
                }
                Ok(Err(_join_err)) => {
                    let trace = finalize(
                        TraceStatus::Denied,
                        Some(policy.clone()),
                        Some("approval wait task failed".into()),
                        String::new(),
                        0,
                        0,
                        0.0,
                    );
                    persist_and_respond(&state, trace, AppError::ApprovalRejected).await
                }
                Err(_elapsed) => {
                    let remaining = (record.timeout_deadline - chrono::Utc::now())
                        .num_seconds()
                        .max(0);
                    let trace = finalize(
                        TraceStatus::Pending,
                        Some(policy.clone()),
                        Some(message),
                        String::new(),
                        0,
                        0,
                        0.0,
                    );
                    spawn_persist(&state, trace);
                    (
                        StatusCode::ACCEPTED,
                        axum::Json(serde_json::json!({
                            "approval_id": record.id,
                            "timeout_seconds": remaining,
                        })),
                    )
                        .into_response()
                }
            }
        }
        Verdict::Allow { throttle_delay } => {
            if let Some(delay) = throttle_delay {
                tokio::time::sleep(delay).await;
            }
            forward_and_finalize(
                &state,
                &session,
                action_type,
                model,
                &trace_id,
                &method,
                &uri,
                &headers,
                body,
                finalize,
                None,
                None,
                TraceStatus::Allowed,
            )
            .await
        }
    }
}

/// Strips AgentWarden-private and hop-by-hop headers before forwarding.
fn strip_private_headers(headers: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut out = reqwest::header::HeaderMap::new();
    for (name, value) in headers.iter() {
        let lower = name.as_str().to_ascii_lowercase();
        if matches!(
            lower.as_str(),
            "x-agentwarden-agent-id"
                | "x-agentwarden-session-id"
                | "x-agentwarden-metadata"
                | "host"
                | "content-length"
        ) {
            continue;
        }
        let Ok(rname) = reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()) else {
            continue;
        };
        let Ok(rvalue) = reqwest::header::HeaderValue::from_bytes(value.as_bytes()) else {
            continue;
        };
        out.insert(rname, rvalue);
    }
    out
}

fn reqwest_method(method: &Method) -> reqwest::Method {
    reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::POST)
}

/// Forwards the governed request upstream, then finalizes the trace. Shared
/// by the plain-allow path and the post-approval path — both reach here only
/// once the decision to forward has already been made.
#[allow(clippy::too_many_arguments)]
async fn forward_and_finalize(
    state: &Arc<AppState>,
    session: &Session,
    action_type: ActionType,
    model: Option<String>,
    trace_id: &str,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: Bytes,
    finalize: impl Fn(TraceStatus, Option<String>, Option<String>, String, u32, u32, f64) -> Trace
        + Send
        + 'static,
    matched_policy: Option<String>,
    policy_reason: Option<String>,
    base_status: TraceStatus,
) -> Response {
    let base_url = state.router.resolve(model.as_deref());
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let url = format!("{}{}", base_url.trim_end_matches('/'), path_and_query);
    let forward_headers = strip_private_headers(headers);

    let upstream_response = match state
        .upstream
        .forward(reqwest_method(method), &url, forward_headers, body.to_vec())
        .await
    {
        Ok(r) => r,
        Err(e) => {
            let trace = finalize(
                TraceStatus::UpstreamError(502),
                matched_policy,
                policy_reason,
                String::new(),
                0,
                0,
                0.0,
            );
            state.sessions.increment_actions(&session.id, action_type);
            return persist_and_respond(state, trace, e).await;
        }
    };

    let status = upstream_response.status();
    let is_sse = upstream_response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/event-stream"));

    let response_headers: Vec<(String, String)> = upstream_response
        .headers()
        .iter()
        .filter(|(name, _)| {
            !matches!(
                name.as_str(),
                "connection" | "transfer-encoding" | "keep-alive" | "content-length"
            )
        })
        .filter_map(|(name, value)| Some((name.to_string(), value.to_str().ok()?.to_string())))
        .collect();

    let trace_status = if status.is_success() {
        base_status
    } else {
        TraceStatus::UpstreamError(status.as_u16())
    };
    let axum_status = StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::OK);

    if is_sse {
        let (client_stream, done_rx) = stream::spawn(upstream_response);
        let mut builder = Response::builder().status(axum_status);
        for (name, value) in &response_headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                builder = builder.header(n, v);
            }
        }
        for (name, value) in stream::sse_headers() {
            builder = builder.header(name, value);
        }
        let response = builder
            .body(Body::from_stream(client_stream))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());

        let state = state.clone();
        let session = session.clone();
        tokio::spawn(async move {
            let result = done_rx.await.ok();
            let response_body = result
                .as_ref()
                .map(stream::SseResult::body_string)
                .unwrap_or_default();
            let (tokens_in, tokens_out) = result
                .as_ref()
                .and_then(|r| cost::extract_usage("", &r.accumulated).ok().flatten())
                .unwrap_or((0, 0));
            let cost_usd = model
                .as_deref()
                .map(|m| {
                    cost::calculate_cost(pricing_provider(m), m, tokens_in, tokens_out)
                        .to_f64()
                        .unwrap_or(0.0)
                })
                .unwrap_or(0.0);

            state.sessions.increment_actions(&session.id, action_type);
            state.sessions.add_cost(&session.id, cost_usd);
            let trace = finalize(
                trace_status,
                matched_policy,
                policy_reason,
                response_body,
                tokens_in,
                tokens_out,
                cost_usd,
            );
            spawn_persist_and_detect(&state, trace);
        });

        return with_trace_header(response, trace_id);
    }

    let response_bytes = match upstream_response.bytes().await {
        Ok(b) => b,
        Err(e) => {
            let trace = finalize(
                TraceStatus::UpstreamError(502),
                matched_policy,
                policy_reason,
                String::new(),
                0,
                0,
                0.0,
            );
            state.sessions.increment_actions(&session.id, action_type);
            return persist_and_respond(state, trace, AppError::UpstreamError(e.to_string())).await;
        }
    };

    let (tokens_in, tokens_out) = cost::extract_usage("", &response_bytes)
        .ok()
        .flatten()
        .unwrap_or((0, 0));
    let cost_usd = model
        .as_deref()
        .map(|m| {
            cost::calculate_cost(pricing_provider(m), m, tokens_in, tokens_out)
                .to_f64()
                .unwrap_or(0.0)
        })
        .unwrap_or(0.0);

    state.sessions.increment_actions(&session.id, action_type);
    state.sessions.add_cost(&session.id, cost_usd);

    let trace = finalize(
        trace_status,
        matched_policy,
        policy_reason,
        truncate_for_storage(&response_bytes),
        tokens_in,
        tokens_out,
        cost_usd,
    );
    let trace_id = trace.id.clone();

    let mut builder = Response::builder().status(axum_status);
    for (name, value) in &response_headers {
        if let (Ok(n), Ok(v)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            builder = builder.header(n, v);
        }
    }
    let response = builder
        .body(Body::from(response_bytes))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());

    spawn_persist_and_detect(state, trace);
    with_trace_header(response, &trace_id)
}

fn with_trace_header(mut response: Response, trace_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(trace_id) {
        response.headers_mut().insert(HDR_TRACE_ID, value);
    }
    response
}

/// Persists a trace and turns an [`AppError`] into the client response,
/// tagging it with the trace id.
async fn persist_and_respond(state: &Arc<AppState>, trace: Trace, error: AppError) -> Response {
    let trace_id = trace.id.clone();
    spawn_persist(state, trace);
    let (response, _) = error.with_trace(trace_id);
    response
}

fn spawn_persist(state: &Arc<AppState>, trace: Trace) {
    let store = state.store.clone();
    tokio::spawn(async move {
        if let Err(e) = store.insert_trace(trace).await {
            tracing::error!(error = %e, "failed to persist trace");
        }
    });
}

/// Persists the trace, broadcasts it to the live WS feed, and feeds it to
/// the detection engine — all off the request's critical path (spec §4.6,
/// "execute in background tasks").
fn spawn_persist_and_detect(state: &Arc<AppState>, trace: Trace) {
    let store = state.store.clone();
    let detection = state.detection.clone();
    let alerts = state.alerts.clone();
    let trace_tx = state.trace_tx.clone();
    tokio::spawn(async move {
        match store.insert_trace(trace).await {
            Ok(stored) => {
                let _ = trace_tx.send(stored.clone());
                for violation in detection.analyze(&stored) {
                    alerts.raise(violation).await;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to persist trace");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_prefers_chat_completions_over_bare_completions() {
        let (action_type, name) = classify("/v1/chat/completions", None);
        assert_eq!(action_type, ActionType::LlmChat);
        assert_eq!(name, "chat_completion");
    }

    #[test]
    fn classify_matches_embeddings() {
        let (action_type, name) = classify("/v1/embeddings", None);
        assert_eq!(action_type, ActionType::LlmEmbedding);
        assert_eq!(name, "embeddings");
    }

    #[test]
    fn classify_falls_back_to_api_request_with_model() {
        let (action_type, name) = classify("/v1/custom/endpoint", Some("gpt-4o"));
        assert_eq!(action_type, ActionType::ApiRequest);
        assert_eq!(name, "api_request:gpt-4o");
    }

    #[test]
    fn classify_falls_back_to_bare_api_request() {
        let (action_type, name) = classify("/v1/custom/endpoint", None);
        assert_eq!(action_type, ActionType::ApiRequest);
        assert_eq!(name, "api_request");
    }

    #[test]
    fn pricing_provider_routes_claude_to_anthropic() {
        assert_eq!(pricing_provider("claude-3-5-sonnet-20240620"), "anthropic");
    }

    #[test]
    fn pricing_provider_defaults_to_openai() {
        assert_eq!(pricing_provider("gpt-4o-mini"), "openai");
    }
}
