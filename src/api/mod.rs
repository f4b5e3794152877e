//! The management plane (spec §6): introspection and control endpoints for
//! sessions, traces, agents, policies, approvals, and a live trace feed,
//! plus the Event API an SDK uses to report actions it governs itself
//! without going through the proxy's interception pipeline.
//!
//! Nested under `/api` (management) and `/v1` (events) by `main.rs` — both
//! share the same [`AppState`] and therefore the same session/policy/trace
//! subsystems the proxy path uses, so an SDK-reported event is audited and
//! policed identically to a proxied HTTP call.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::errors::AppError;
use crate::models::trace::{new_trace_id, ActionType, Trace, TraceStatus};
use crate::policy::expr::EvalContext;
use crate::policy::Verdict;
use crate::trace_store::{SessionFilter, TraceFilter};
use crate::AppState;

pub fn management_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/sessions", get(list_sessions))
        .route("/sessions/:id", get(get_session).delete(end_session))
        .route("/traces", get(list_traces))
        .route("/traces/search", get(search_traces))
        .route("/agents", get(list_agents))
        .route("/agents/:id/stats", get(agent_stats))
        .route("/policies", get(list_policies))
        .route("/policies/reload", post(reload_policies))
        .route("/policies/dryrun", post(dryrun_policy))
        .route("/approvals", get(list_approvals))
        .route("/approvals/:id/approve", post(approve_approval))
        .route("/approvals/:id/deny", post(deny_approval))
        .route("/ws/traces", get(ws_traces))
        .with_state(state)
}

pub fn event_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/sessions/start", post(start_session))
        .route("/sessions/:id/end", post(end_session_event))
        .route("/sessions/:id/score", post(score_session))
        .route("/events/evaluate", post(evaluate_event))
        .route("/events/trace", post(record_trace_event))
        .with_state(state)
}

// ── Management: health / stats ─────────────────────────────────

async fn health() -> &'static str {
    "ok"
}

async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, AppError> {
    let stats = state.store.get_system_stats().await?;
    Ok(Json(serde_json::json!(stats)))
}

// ── Management: sessions ─────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SessionQuery {
    agent_id: Option<String>,
    status: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    50
}

async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SessionQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let filter = SessionFilter {
        agent_id: q.agent_id,
        status: q.status,
        limit: q.limit,
        offset: q.offset,
    };
    let (sessions, total) = state.store.list_sessions(&filter).await?;
    Ok(Json(serde_json::json!({ "sessions": sessions, "total": total })))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<crate::models::session::Session>, AppError> {
    state
        .store
        .get_session(&id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::SessionNotFound(id))
}

async fn end_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state
        .sessions
        .end(&id)
        .await
        .map_err(|_| AppError::SessionNotFound(id))?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Management: traces ───────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TraceQuery {
    session_id: Option<String>,
    agent_id: Option<String>,
    status: Option<String>,
    since: Option<chrono::DateTime<chrono::Utc>>,
    until: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

async fn list_traces(
    State(state): State<Arc<AppState>>,
    Query(q): Query<TraceQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let filter = TraceFilter {
        session_id: q.session_id,
        agent_id: q.agent_id,
        status: q.status,
        since: q.since,
        until: q.until,
        limit: q.limit,
        offset: q.offset,
    };
    let (traces, total) = state.store.list_traces(&filter).await?;
    Ok(Json(serde_json::json!({ "traces": traces, "total": total })))
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    q: String,
    #[serde(default = "default_limit")]
    limit: i64,
}

async fn search_traces(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SearchQuery>,
) -> Result<Json<Vec<Trace>>, AppError> {
    let traces = state.store.search_traces(&q.q, q.limit).await?;
    Ok(Json(traces))
}

// ── Management: agents ───────────────────────────────────────

async fn list_agents(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<crate::models::session::Agent>>, AppError> {
    Ok(Json(state.store.list_agents().await?))
}

async fn agent_stats(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let stats = state.store.get_agent_stats(&id).await?;
    Ok(Json(serde_json::json!(stats)))
}

// ── Management: policies ─────────────────────────────────────

async fn list_policies(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let snapshot = state.policy.current();
    Json(serde_json::json!({ "policies": snapshot.policies }))
}

async fn reload_policies(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let count = state
        .policy
        .reload()
        .map_err(|e| AppError::InvalidRequest(e.to_string()))?;
    Ok(Json(serde_json::json!({ "policies_loaded": count })))
}

#[derive(Debug, Deserialize)]
struct DryRunRequest {
    action_type: String,
    action_name: String,
    #[serde(default)]
    action_target: String,
    #[serde(default = "serde_json::Value::default")]
    action_params: serde_json::Value,
    #[serde(default)]
    agent_id: String,
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    session_cost: f64,
    #[serde(default)]
    session_action_count: i64,
    #[serde(default)]
    agent_daily_cost: f64,
}

#[derive(Debug, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
enum DryRunVerdict {
    Allow { throttle_delay_ms: Option<u64> },
    Deny { policy: String, message: String },
    Terminate { policy: String, message: String },
    Approve { policy: String, message: String, approvers: Vec<String> },
}

impl From<Verdict> for DryRunVerdict {
    fn from(v: Verdict) -> Self {
        match v {
            Verdict::Allow { throttle_delay } => DryRunVerdict::Allow {
                throttle_delay_ms: throttle_delay.map(|d| d.as_millis() as u64),
            },
            Verdict::Deny { policy, message } => DryRunVerdict::Deny { policy, message },
            Verdict::Terminate { policy, message } => DryRunVerdict::Terminate { policy, message },
            Verdict::Approve {
                policy,
                message,
                approvers,
                ..
            } => DryRunVerdict::Approve {
                policy,
                message,
                approvers,
            },
        }
    }
}

/// Evaluates the policy set against a synthetic action without touching any
/// session state or persisting a trace — a dry run for writing and
/// validating policy files.
async fn dryrun_policy(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DryRunRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let no_window = crate::policy::expr::empty_window_fn();
    let ctx = EvalContext {
        action_type: &req.action_type,
        action_name: &req.action_name,
        action_target: &req.action_target,
        action_params: &req.action_params,
        session_id: &req.session_id,
        session_agent_id: &req.agent_id,
        session_cost: req.session_cost,
        session_action_count: req.session_action_count,
        agent_id: &req.agent_id,
        agent_name: &req.agent_id,
        agent_daily_cost: req.agent_daily_cost,
        count_in_window: &no_window,
    };
    let verdict: DryRunVerdict = state.policy.evaluate(&ctx).await.into();
    Ok(Json(serde_json::json!(verdict)))
}

// ── Management: approvals ─────────────────────────────────────

async fn list_approvals(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<crate::models::approval::ApprovalRecord>>, AppError> {
    Ok(Json(state.approvals.list_all().await?))
}

#[derive(Debug, Deserialize, Default)]
struct ApprovalDecision {
    approver: Option<String>,
}

async fn approve_approval(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<ApprovalDecision>>,
) -> Result<StatusCode, AppError> {
    let approver = body.and_then(|b| b.0.approver);
    state
        .approvals
        .resolve(&id, true, approver.as_deref())
        .await
        .map_err(|_| AppError::ApprovalNotPending(id))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn deny_approval(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<ApprovalDecision>>,
) -> Result<StatusCode, AppError> {
    let approver = body.and_then(|b| b.0.approver);
    state
        .approvals
        .resolve(&id, false, approver.as_deref())
        .await
        .map_err(|_| AppError::ApprovalNotPending(id))?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Management: live trace feed ──────────────────────────────

async fn ws_traces(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_trace_socket(socket, state))
}

async fn handle_trace_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let mut rx = state.trace_tx.subscribe();
    loop {
        tokio::select! {
            trace = rx.recv() => {
                let trace = match trace {
                    Ok(t) => t,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                let Ok(text) = serde_json::to_string(&trace) else { continue };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break,
                }
            }
        }
    }
}

// ── Event API ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct StartSessionRequest {
    #[serde(default)]
    agent_id: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default = "serde_json::Value::default")]
    metadata: serde_json::Value,
}

async fn start_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartSessionRequest>,
) -> Json<serde_json::Value> {
    let session = state
        .sessions
        .get_or_create(&req.agent_id, req.session_id.as_deref(), req.metadata)
        .await;
    Json(serde_json::json!({ "session_id": session.id }))
}

async fn end_session_event(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let session = state
        .sessions
        .get(&id)
        .ok_or_else(|| AppError::SessionNotFound(id.clone()))?;
    let duration_ms = (chrono::Utc::now() - session.start_time).num_milliseconds().max(0);
    state
        .sessions
        .end(&id)
        .await
        .map_err(|_| AppError::SessionNotFound(id))?;
    Ok(Json(serde_json::json!({
        "cost": session.total_cost,
        "action_count": session.action_count,
        "duration_ms": duration_ms,
    })))
}

async fn score_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(score): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.store.score_session(&id, &score).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct EvaluateRequest {
    #[serde(default)]
    agent_id: String,
    #[serde(default)]
    session_id: Option<String>,
    action_type: String,
    action_name: String,
    #[serde(default)]
    action_target: String,
    #[serde(default = "serde_json::Value::default")]
    action_params: serde_json::Value,
}

/// The evaluate-only half of the Event API: an SDK asks whether an action it
/// is about to take itself (not proxied through AgentWarden) would be
/// allowed, without AgentWarden performing the action. Runs the same
/// session/policy pipeline as the proxy path and persists a trace for every
/// disposition; the caller is responsible for recording the actual outcome
/// via `/v1/events/trace` afterward.
async fn evaluate_event(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EvaluateRequest>,
) -> Result<Response, AppError> {
    let session = state
        .sessions
        .get_or_create(&req.agent_id, req.session_id.as_deref(), serde_json::Value::Null)
        .await;

    let Some(action_type) = ActionType::parse(&req.action_type) else {
        return Err(AppError::InvalidRequest(format!(
            "unknown action_type '{}'",
            req.action_type
        )));
    };

    if state.sessions.is_paused(&session.id) {
        return Err(AppError::SessionPaused);
    }
    if state.killswitch.is_tripped(&session.agent_id, &session.id) {
        return Err(AppError::KillSwitchActive("request blocked: kill switch active".into()));
    }

    let agent_daily_cost = state.store.agent_daily_cost(&session.agent_id).await.unwrap_or(0.0);
    let window_fn = state.sessions.count_in_window_fn(&session.id);
    let ctx = EvalContext {
        action_type: action_type.as_str(),
        action_name: &req.action_name,
        action_target: &req.action_target,
        action_params: &req.action_params,
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

    let trace_id = new_trace_id();
    let base_trace = |status: TraceStatus, matched_policy: Option<String>, policy_reason: Option<String>| Trace {
        id: trace_id.clone(),
        session_id: session.id.clone(),
        agent_id: session.agent_id.clone(),
        timestamp: chrono::Utc::now(),
        action_type,
        action_name: req.action_name.clone(),
        action_params: req.action_params.clone(),
        target: req.action_target.clone(),
        request_body: String::new(),
        response_body: String::new(),
        status,
        model: None,
        tokens_in: 0,
        tokens_out: 0,
        cost_usd: 0.0,
        latency_ms: 0,
        matched_policy,
        policy_reason,
        prev_hash: String::new(),
        hash: String::new(),
    };

    match verdict {
        Verdict::Allow { throttle_delay } => {
            if let Some(delay) = throttle_delay {
                tokio::time::sleep(delay).await;
            }
            state.sessions.increment_actions(&session.id, action_type);
            persist(&state, base_trace(TraceStatus::Allowed, None, None));
            Ok(Json(serde_json::json!({ "effect": "allow" })).into_response())
        }
        Verdict::Deny { policy, message } => {
            state.sessions.increment_actions(&session.id, action_type);
            persist(
                &state,
                base_trace(TraceStatus::Denied, Some(policy.clone()), Some(message.clone())),
            );
            Ok(Json(serde_json::json!({
                "effect": "deny",
                "policy_name": policy,
                "message": message,
            }))
            .into_response())
        }
        Verdict::Terminate { policy, message } => {
            state.sessions.increment_actions(&session.id, action_type);
            state.sessions.terminate(&session.id).await;
            persist(
                &state,
                base_trace(TraceStatus::Terminated, Some(policy.clone()), Some(message.clone())),
            );
            Ok(Json(serde_json::json!({
                "effect": "terminate",
                "policy_name": policy,
                "message": message,
            }))
            .into_response())
        }
        Verdict::Approve {
            policy,
            message,
            timeout,
            timeout_effect,
            ..
        } => {
            let summary = serde_json::json!({
                "action_type": action_type.as_str(),
                "action_name": req.action_name,
            });
            let record = state
                .approvals
                .create(&session.id, &trace_id, &policy, summary, timeout, timeout_effect)
                .await?;
            persist(
                &state,
                base_trace(TraceStatus::Pending, Some(policy.clone()), Some(message.clone())),
            );
            Ok(Json(serde_json::json!({
                "effect": "approve",
                "policy_name": policy,
                "message": message,
                "approval_id": record.id,
                "timeout_seconds": timeout.as_secs(),
            }))
            .into_response())
        }
    }
}

fn persist(state: &Arc<AppState>, trace: Trace) {
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
            Err(e) => tracing::error!(error = %e, "failed to persist trace"),
        }
    });
}

#[derive(Debug, Deserialize)]
struct TraceEventRequest {
    #[serde(default)]
    agent_id: String,
    session_id: String,
    action_type: String,
    action_name: String,
    #[serde(default)]
    action_target: String,
    #[serde(default = "serde_json::Value::default")]
    action_params: serde_json::Value,
    #[serde(default)]
    request_body: String,
    #[serde(default)]
    response_body: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    tokens_in: u32,
    #[serde(default)]
    tokens_out: u32,
    #[serde(default)]
    cost_usd: f64,
    #[serde(default)]
    latency_ms: u64,
    #[serde(default = "default_status")]
    status: String,
}

fn default_status() -> String {
    "allowed".to_string()
}

/// Records a trace for an action the SDK already took itself (post-hoc
/// audit) — no policy is evaluated, the SDK is reporting what happened, not
/// asking permission.
async fn record_trace_event(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TraceEventRequest>,
) -> Result<Json<Trace>, AppError> {
    let Some(action_type) = ActionType::parse(&req.action_type) else {
        return Err(AppError::InvalidRequest(format!(
            "unknown action_type '{}'",
            req.action_type
        )));
    };
    let status = TraceStatus::parse(&req.status)
        .ok_or_else(|| AppError::InvalidRequest(format!("unknown status '{}'", req.status)))?;

    let trace = Trace {
        id: new_trace_id(),
        session_id: req.session_id.clone(),
        agent_id: req.agent_id,
        timestamp: chrono::Utc::now(),
        action_type,
        action_name: req.action_name,
        action_params: req.action_params,
        target: req.action_target,
        request_body: req.request_body,
        response_body: req.response_body,
        status,
        model: req.model,
        tokens_in: req.tokens_in,
        tokens_out: req.tokens_out,
        cost_usd: req.cost_usd,
        latency_ms: req.latency_ms,
        matched_policy: None,
        policy_reason: None,
        prev_hash: String::new(),
        hash: String::new(),
    };

    state.sessions.increment_actions(&req.session_id, action_type);
    if req.cost_usd > 0.0 {
        state.sessions.add_cost(&req.session_id, req.cost_usd);
    }

    let stored = state.store.insert_trace(trace).await?;
    let _ = state.trace_tx.send(stored.clone());
    for violation in state.detection.analyze(&stored) {
        state.alerts.raise(violation).await;
    }
    Ok(Json(stored))
}
