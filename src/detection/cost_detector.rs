//! Flags a single action costing far more than the agent's own recent
//! history for that action would predict (spec §4.6, "Cost anomaly").
//! Maintains a simple rolling mean per `(agent_id, action_name)`; requires a
//! minimum sample size before it will fire, so a brand-new action type never
//! trips the detector on its very first (necessarily "average") call.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::models::alert::{Severity, Violation};
use crate::models::trace::Trace;

const DEFAULT_MULTIPLIER: f64 = 10.0;
const MIN_SAMPLES: usize = 5;
const MAX_SAMPLES: usize = 200;

#[derive(Default)]
struct Samples {
    costs: Vec<f64>,
}

pub struct CostAnomalyDetector {
    multiplier: f64,
    min_samples: usize,
    stats: Mutex<HashMap<(String, String), Samples>>,
}

impl Default for CostAnomalyDetector {
    fn default() -> Self {
        Self::new(DEFAULT_MULTIPLIER, MIN_SAMPLES)
    }
}

impl CostAnomalyDetector {
    pub fn new(multiplier: f64, min_samples: usize) -> Self {
        Self {
            multiplier,
            min_samples,
            stats: Mutex::new(HashMap::new()),
        }
    }

    pub fn observe(&self, trace: &Trace) -> Option<Violation> {
        let key = (trace.agent_id.clone(), trace.action_name.clone());
        let mut stats = self.stats.lock();
        let entry = stats.entry(key).or_default();

        let violation = if entry.costs.len() >= self.min_samples {
            let mean = entry.costs.iter().sum::<f64>() / entry.costs.len() as f64;
            if mean > 0.0 && trace.cost_usd >= mean * self.multiplier {
                Some(Violation {
                    kind: "cost_anomaly".to_string(),
                    severity: Severity::High,
                    agent_id: trace.agent_id.clone(),
                    session_id: trace.session_id.clone(),
                    policy_name: None,
                    action_type: Some(trace.action_type),
                    message: format!(
                        "action \"{}\" cost ${:.4}, {:.1}x the recent mean of ${mean:.4}",
                        trace.action_name,
                        trace.cost_usd,
                        trace.cost_usd / mean,
                    ),
                })
            } else {
                None
            }
        } else {
            None
        };

        entry.costs.push(trace.cost_usd);
        if entry.costs.len() > MAX_SAMPLES {
            entry.costs.remove(0);
        }

        violation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::trace::{ActionType, TraceStatus};
    use chrono::Utc;

    fn trace(cost: f64) -> Trace {
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
            response_body: "".to_string(),
            status: TraceStatus::Allowed,
            model: None,
            tokens_in: 0,
            tokens_out: 0,
            cost_usd: cost,
            latency_ms: 0,
            matched_policy: None,
            policy_reason: None,
            prev_hash: String::new(),
            hash: String::new(),
        }
    }

    #[test]
    fn does_not_fire_before_minimum_samples() {
        let detector = CostAnomalyDetector::new(10.0, 5);
        for _ in 0..4 {
            assert!(detector.observe(&trace(0.01)).is_none());
        }
        // 5th sample establishes the baseline is this same low value — no anomaly.
        assert!(detector.observe(&trace(0.01)).is_none());
    }

    #[test]
    fn fires_on_large_spike_after_baseline() {
        let detector = CostAnomalyDetector::new(10.0, 5);
        for _ in 0..5 {
            detector.observe(&trace(0.01));
        }
        let violation = detector.observe(&trace(5.0));
        assert!(violation.is_some());
    }
}
