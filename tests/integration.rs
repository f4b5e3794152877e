//! Scenario-level integration tests wiring several governance subsystems
//! together through the library's public API, without going through the
//! binary's axum router (see `src/lib.rs`'s module doc for why).
//!
//! Each test below exercises one of the scenarios from the system's
//! testable-properties table: budget denial, rate throttling, loop
//! detection with alert dedup, kill-switch precedence, and
//! approval-timeout fallback. Hash-chain tamper detection has its own
//! white-box test alongside `TraceStore` itself, where the connection pool
//! is actually reachable.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use agentwarden::alert::{AlertManager, AlertSink};
use agentwarden::killswitch::KillSwitch;
use agentwarden::models::alert::Alert;
use agentwarden::models::policy::TimeoutEffect;
use agentwarden::models::trace::{ActionType, Trace, TraceStatus};
use agentwarden::policy::expr::EvalContext;
use agentwarden::policy::{PolicyEngine, Verdict};
use agentwarden::session::SessionManager;
use agentwarden::trace_store::{TraceFilter, TraceStore};
use parking_lot::Mutex;

fn sample_trace(session_id: &str, agent_id: &str, action_name: &str, cost: f64) -> Trace {
    Trace {
        id: agentwarden::models::trace::new_trace_id(),
        session_id: session_id.to_string(),
        agent_id: agent_id.to_string(),
        timestamp: chrono::Utc::now(),
        action_type: ActionType::ToolCall,
        action_name: action_name.to_string(),
        action_params: serde_json::json!({}),
        target: "".to_string(),
        request_body: "{}".to_string(),
        response_body: "{}".to_string(),
        status: TraceStatus::Allowed,
        model: None,
        tokens_in: 0,
        tokens_out: 0,
        cost_usd: cost,
        latency_ms: 5,
        matched_policy: None,
        policy_reason: None,
        prev_hash: String::new(),
        hash: String::new(),
    }
}

fn write_policy_file(dir: &std::path::Path, name: &str, contents: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path.to_str().unwrap().to_string()
}

fn temp_dir(label: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("agentwarden-integration-{label}-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn empty_params() -> serde_json::Value {
    serde_json::json!({})
}

/// A CEL budget policy over three sequential actions: the third request,
/// which would push cumulative cost past the cap, is denied before any
/// trace is marked `allowed`.
#[tokio::test]
async fn s1_third_action_over_budget_is_denied() {
    let dir = temp_dir("s1");
    let policy_path = write_policy_file(
        &dir,
        "policies.toml",
        r#"
        [[policies]]
        name = "budget"
        condition = "session.cost > 0.50"
        effect = "deny"
        message = "session budget exceeded"
        "#,
    );
    let engine = PolicyEngine::new(policy_path, String::new(), None).unwrap();
    let store = TraceStore::connect(":memory:").await.unwrap();

    let params = empty_params();
    let count_fn = |_t: &str, _w: StdDuration| -> i64 { 0 };
    let mut running_cost = 0.0;
    let mut statuses = Vec::new();
    for _ in 0..2 {
        let ctx = EvalContext {
            action_type: "llm.chat",
            action_name: "chat_completion",
            action_target: "gpt-4o",
            action_params: &params,
            session_id: "ses-s1",
            session_agent_id: "agent-1",
            session_cost: running_cost,
            session_action_count: 0,
            agent_id: "agent-1",
            agent_name: "agent-1",
            agent_daily_cost: running_cost,
            count_in_window: &count_fn,
        };
        let verdict = engine.evaluate(&ctx).await;
        assert!(matches!(verdict, Verdict::Allow { .. }));
        running_cost += 0.30;
        let mut trace = sample_trace("ses-s1", "agent-1", "chat_completion", 0.30);
        trace.status = TraceStatus::Allowed;
        store.insert_trace(trace).await.unwrap();
        statuses.push("allowed");
    }

    let ctx = EvalContext {
        action_type: "llm.chat",
        action_name: "chat_completion",
        action_target: "gpt-4o",
        action_params: &params,
        session_id: "ses-s1",
        session_agent_id: "agent-1",
        session_cost: running_cost,
        session_action_count: 0,
        agent_id: "agent-1",
        agent_name: "agent-1",
        agent_daily_cost: running_cost,
        count_in_window: &count_fn,
    };
    let verdict = engine.evaluate(&ctx).await;
    match verdict {
        Verdict::Deny { policy, .. } => assert_eq!(policy, "budget"),
        other => panic!("expected deny, got {other:?}"),
    }
    let mut trace = sample_trace("ses-s1", "agent-1", "chat_completion", 0.0);
    trace.status = TraceStatus::Denied;
    trace.matched_policy = Some("budget".to_string());
    store.insert_trace(trace).await.unwrap();
    statuses.push("denied");

    assert_eq!(statuses, vec!["allowed", "allowed", "denied"]);
    let (traces, total) = store
        .list_traces(&TraceFilter {
            session_id: Some("ses-s1".to_string()),
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(total, 3);
    assert_eq!(traces.len(), 3);
}

/// A throttle policy over `action_count_in_window` does not short-circuit:
/// the 6th and 7th `tool.call` within the window are still `Allow`, just
/// carrying a throttle delay, with the window counted by the real
/// `SessionManager` sliding window rather than a stub closure.
#[tokio::test]
async fn s2_throttle_accumulates_via_real_session_window() {
    let dir = temp_dir("s2");
    let policy_path = write_policy_file(
        &dir,
        "policies.toml",
        r#"
        [[policies]]
        name = "rate_limit"
        condition = "action_count_in_window(\"tool.call\", \"60s\") > 5"
        effect = "throttle"
        delay = "500ms"
        message = "too many tool calls"
        "#,
    );
    let engine = PolicyEngine::new(policy_path, String::new(), None).unwrap();
    let store = Arc::new(TraceStore::connect(":memory:").await.unwrap());
    let sessions = SessionManager::new(store.clone());
    sessions
        .get_or_create("agent-1", Some("ses-s2"), serde_json::json!({}))
        .await;

    let params = empty_params();
    let mut delays = Vec::new();
    for _ in 0..7 {
        let window_fn = sessions.count_in_window_fn("ses-s2");
        let ctx = EvalContext {
            action_type: "tool.call",
            action_name: "search",
            action_target: "",
            action_params: &params,
            session_id: "ses-s2",
            session_agent_id: "agent-1",
            session_cost: 0.0,
            session_action_count: 0,
            agent_id: "agent-1",
            agent_name: "agent-1",
            agent_daily_cost: 0.0,
            count_in_window: &window_fn,
        };
        let verdict = engine.evaluate(&ctx).await;
        match verdict {
            Verdict::Allow { throttle_delay } => delays.push(throttle_delay),
            other => panic!("throttle must never deny or terminate, got {other:?}"),
        }
        sessions.increment_actions("ses-s2", ActionType::ToolCall);
    }

    assert_eq!(delays[..5], [None, None, None, None, None]);
    assert_eq!(delays[5], Some(StdDuration::from_millis(500)));
    assert_eq!(delays[6], Some(StdDuration::from_millis(500)));
}

struct RecordingSink {
    alerts: Mutex<Vec<Alert>>,
}

#[async_trait::async_trait]
impl AlertSink for RecordingSink {
    async fn send(&self, alert: &Alert) -> anyhow::Result<()> {
        self.alerts.lock().push(alert.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

/// Five identical `tool.call action=search` traces in quick succession
/// cross the loop detector's threshold on the 3rd trace and keep firing on
/// the 4th and 5th, but the alert manager's dedup window collapses all
/// three violations into a single dispatched alert.
#[tokio::test]
async fn s3_loop_violations_dedup_to_one_alert() {
    let store = Arc::new(TraceStore::connect(":memory:").await.unwrap());
    let sink = Arc::new(RecordingSink {
        alerts: Mutex::new(Vec::new()),
    });
    let alerts = AlertManager::new(
        store.clone(),
        vec![sink.clone() as Arc<dyn AlertSink>],
        StdDuration::from_secs(300),
    );
    let detector = agentwarden::detection::LoopDetector::new(3, StdDuration::from_secs(60));

    for _ in 0..5 {
        let trace = sample_trace("ses-s3", "agent-1", "search", 0.0);
        if let Some(violation) = detector.observe(&trace) {
            alerts.raise(violation).await;
        }
    }

    assert_eq!(sink.alerts.lock().len(), 1);
    assert_eq!(sink.alerts.lock()[0].kind, "loop");
}

/// A global kill-switch trip blocks every agent and session, and its
/// violation is dispatched through the alert manager exactly like any
/// other governance event.
#[tokio::test]
async fn s5_global_killswitch_blocks_everything_and_alerts() {
    let store = Arc::new(TraceStore::connect(":memory:").await.unwrap());
    let sink = Arc::new(RecordingSink {
        alerts: Mutex::new(Vec::new()),
    });
    let alerts = AlertManager::new(
        store.clone(),
        vec![sink.clone() as Arc<dyn AlertSink>],
        StdDuration::from_secs(300),
    );
    let killswitch = KillSwitch::new(None);

    assert!(!killswitch.is_tripped("agent-1", "ses-s5"));
    assert!(!killswitch.is_tripped("agent-2", "ses-other"));

    let violation = killswitch.trigger_global("incident response drill");
    alerts.raise(violation).await;

    assert!(killswitch.is_tripped("agent-1", "ses-s5"));
    assert!(killswitch.is_tripped("agent-2", "ses-other"));
    assert_eq!(sink.alerts.lock().len(), 1);
    assert_eq!(sink.alerts.lock()[0].kind, "killswitch");
}

/// An `approve` policy with a 1s timeout and `timeout_effect = deny`:
/// nobody resolves the approval, so after the deadline the queue applies
/// the configured effect and the persisted record ends up `timeout`.
#[tokio::test]
async fn s6_unresolved_approval_times_out_to_configured_effect() {
    let dir = temp_dir("s6");
    let policy_path = write_policy_file(
        &dir,
        "policies.toml",
        r#"
        [[policies]]
        name = "wire_transfer"
        condition = "action.name == \"wire_transfer\""
        effect = "approve"
        approvers = ["ops-oncall"]
        timeout = "1s"
        timeout_effect = "deny"
        message = "wire transfers require approval"
        "#,
    );
    let engine = PolicyEngine::new(policy_path, String::new(), None).unwrap();
    let store = Arc::new(TraceStore::connect(":memory:").await.unwrap());
    let approvals = agentwarden::approval::ApprovalQueue::new(store.clone());

    let params = empty_params();
    let count_fn = |_t: &str, _w: StdDuration| -> i64 { 0 };
    let ctx = EvalContext {
        action_type: "tool.call",
        action_name: "wire_transfer",
        action_target: "",
        action_params: &params,
        session_id: "ses-s6",
        session_agent_id: "agent-1",
        session_cost: 0.0,
        session_action_count: 0,
        agent_id: "agent-1",
        agent_name: "agent-1",
        agent_daily_cost: 0.0,
        count_in_window: &count_fn,
    };
    let verdict = engine.evaluate(&ctx).await;
    let (policy, timeout, timeout_effect) = match verdict {
        Verdict::Approve {
            policy,
            timeout,
            timeout_effect,
            ..
        } => (policy, timeout, timeout_effect),
        other => panic!("expected an approval verdict, got {other:?}"),
    };
    assert_eq!(policy, "wire_transfer");
    assert_eq!(timeout_effect, TimeoutEffect::Deny);

    let record = approvals
        .create(
            "ses-s6",
            "trc-s6",
            &policy,
            serde_json::json!({"action": "wire_transfer"}),
            timeout,
            timeout_effect,
        )
        .await
        .unwrap();

    let outcome = approvals.wait(&record).await;
    assert_eq!(outcome, agentwarden::approval::ApprovalOutcome::TimedOut);

    let persisted = store.get_approval(&record.id).await.unwrap().unwrap();
    assert_eq!(
        persisted.status,
        agentwarden::models::approval::ApprovalStatus::Timeout
    );
}
