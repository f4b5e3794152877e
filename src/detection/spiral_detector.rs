//! Flags an agent stuck producing near-identical responses in a row — a
//! "spiral" (spec §4.6, "Spiral detection"). Similarity between consecutive
//! responses is token-level Jaccard; a run of `min_run` or more consecutive
//! highly-similar pairs fires once per run (it resets after firing so a
//! stuck agent doesn't re-alert on every single subsequent call).

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::models::alert::{Severity, Violation};
use crate::models::trace::Trace;

const DEFAULT_THRESHOLD: f64 = 0.9;
const DEFAULT_MIN_RUN: usize = 3;
const MAX_TRACKED_TOKENS: usize = 500;

#[derive(Default)]
struct SessionState {
    last_tokens: Option<std::collections::HashSet<String>>,
    run_length: usize,
}

pub struct SpiralDetector {
    threshold: f64,
    min_run: usize,
    sessions: Mutex<HashMap<String, SessionState>>,
}

impl Default for SpiralDetector {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD, DEFAULT_MIN_RUN)
    }
}

fn tokenize(body: &str) -> std::collections::HashSet<String> {
    body.split_whitespace()
        .take(MAX_TRACKED_TOKENS)
        .map(|s| s.to_lowercase())
        .collect()
}

fn jaccard(a: &std::collections::HashSet<String>, b: &std::collections::HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

impl SpiralDetector {
    pub fn new(threshold: f64, min_run: usize) -> Self {
        Self {
            threshold,
            min_run,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn observe(&self, trace: &Trace) -> Option<Violation> {
        if trace.response_body.trim().is_empty() {
            return None;
        }
        let tokens = tokenize(&trace.response_body);

        let mut sessions = self.sessions.lock();
        let state = sessions.entry(trace.session_id.clone()).or_default();

        let similarity = state.last_tokens.as_ref().map(|prev| jaccard(prev, &tokens));
        state.last_tokens = Some(tokens);

        let Some(similarity) = similarity else {
            return None;
        };

        if similarity >= self.threshold {
            state.run_length += 1;
        } else {
            state.run_length = 0;
        }

        if state.run_length + 1 >= self.min_run {
            state.run_length = 0;
            Some(Violation {
                kind: "spiral".to_string(),
                severity: Severity::Medium,
                agent_id: trace.agent_id.clone(),
                session_id: trace.session_id.clone(),
                policy_name: None,
                action_type: Some(trace.action_type),
                message: format!(
                    "response near-identical to prior output ({similarity:.2} similarity) across {} consecutive calls",
                    self.min_run
                ),
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::trace::{ActionType, TraceStatus};
    use chrono::Utc;

    fn trace(response: &str) -> Trace {
        Trace {
            id: "trc_1".to_string(),
            session_id: "ses-1".to_string(),
            agent_id: "agent-1".to_string(),
            timestamp: Utc::now(),
            action_type: ActionType::LlmChat,
            action_name: "chat_completion".to_string(),
            action_params: serde_json::json!({}),
            target: "".to_string(),
            request_body: "".to_string(),
            response_body: response.to_string(),
            status: TraceStatus::Allowed,
            model: None,
            tokens_in: 0,
            tokens_out: 0,
            cost_usd: 0.0,
            latency_ms: 0,
            matched_policy: None,
            policy_reason: None,
            prev_hash: String::new(),
            hash: String::new(),
        }
    }

    #[test]
    fn repeated_identical_responses_fire_after_min_run() {
        let detector = SpiralDetector::new(0.9, 3);
        assert!(detector.observe(&trace("the system is unreachable")).is_none());
        assert!(detector.observe(&trace("the system is unreachable")).is_none());
        assert!(detector.observe(&trace("the system is unreachable")).is_some());
    }

    #[test]
    fn varied_responses_never_fire() {
        let detector = SpiralDetector::new(0.9, 3);
        assert!(detector.observe(&trace("alpha beta gamma")).is_none());
        assert!(detector.observe(&trace("delta epsilon zeta")).is_none());
        assert!(detector.observe(&trace("eta theta iota")).is_none());
        assert!(detector.observe(&trace("kappa lambda mu")).is_none());
    }
}
