//! Flags an agent repeating the same action too many times too quickly
//! within a session — the signature is `action_type|action_name|model`, so
//! distinct models or tools don't collide (spec §4.6, "Loop detection").

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::models::alert::{Severity, Violation};
use crate::models::trace::Trace;

const DEFAULT_THRESHOLD: usize = 5;
const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

pub struct LoopDetector {
    threshold: usize,
    window: Duration,
    windows: Mutex<HashMap<(String, String), Vec<DateTime<Utc>>>>,
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD, DEFAULT_WINDOW)
    }
}

impl LoopDetector {
    pub fn new(threshold: usize, window: Duration) -> Self {
        Self {
            threshold,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn observe(&self, trace: &Trace) -> Option<Violation> {
        let signature = format!(
            "{}|{}|{}",
            trace.action_type.as_str(),
            trace.action_name,
            trace.model.as_deref().unwrap_or("")
        );
        let key = (trace.session_id.clone(), signature.clone());
        let cutoff = trace.timestamp - chrono::Duration::from_std(self.window).unwrap_or_default();

        let mut windows = self.windows.lock();
        let entries = windows.entry(key).or_default();
        entries.retain(|t| *t >= cutoff);
        entries.push(trace.timestamp);

        if entries.len() >= self.threshold {
            Some(Violation {
                kind: "loop".to_string(),
                severity: Severity::Medium,
                agent_id: trace.agent_id.clone(),
                session_id: trace.session_id.clone(),
                policy_name: None,
                action_type: Some(trace.action_type),
                message: format!(
                    "action \"{signature}\" repeated {} times within {}s",
                    entries.len(),
                    self.window.as_secs()
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

    fn trace(session_id: &str, ts: DateTime<Utc>) -> Trace {
        Trace {
            id: "trc_1".to_string(),
            session_id: session_id.to_string(),
            agent_id: "agent-1".to_string(),
            timestamp: ts,
            action_type: ActionType::ToolCall,
            action_name: "search".to_string(),
            action_params: serde_json::json!({}),
            target: "".to_string(),
            request_body: "".to_string(),
            response_body: "".to_string(),
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
    fn flags_after_threshold_repeats() {
        let detector = LoopDetector::new(3, Duration::from_secs(60));
        let now = Utc::now();
        assert!(detector.observe(&trace("ses-1", now)).is_none());
        assert!(detector.observe(&trace("ses-1", now)).is_none());
        assert!(detector.observe(&trace("ses-1", now)).is_some());
    }

    #[test]
    fn entries_outside_window_do_not_count() {
        let detector = LoopDetector::new(2, Duration::from_secs(10));
        let now = Utc::now();
        assert!(detector.observe(&trace("ses-1", now - chrono::Duration::seconds(30))).is_none());
        assert!(detector.observe(&trace("ses-1", now)).is_none());
    }
}
