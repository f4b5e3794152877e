use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::trace::ActionType;

/// Severity assigned by a detector or a policy's terminate/deny effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// A detector's or policy's finding, prior to dedup/suppression by the alert
/// manager. `kind` is the dedup discriminator (e.g. `"loop"`, `"cost_anomaly"`,
/// `"spiral"`, `"policy_terminate"`, `"killswitch"`) — distinct from
/// `action_type`, which describes what the agent was doing when it fired.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub kind: String,
    pub severity: Severity,
    pub agent_id: String,
    pub session_id: String,
    pub policy_name: Option<String>,
    pub action_type: Option<ActionType>,
    pub message: String,
}

/// The persisted, dispatched form of a violation, after dedup-key suppression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub kind: String,
    pub severity: Severity,
    pub agent_id: String,
    pub session_id: String,
    pub policy_name: Option<String>,
    pub action_type: Option<ActionType>,
    pub message: String,
    pub time: DateTime<Utc>,
}

impl Alert {
    /// Dedup key: `"<kind>|<agent_id>|<session_id>"`. Two violations sharing
    /// this key within the dedup TTL collapse into a single dispatched alert.
    pub fn dedup_key(kind: &str, agent_id: &str, session_id: &str) -> String {
        format!("{kind}|{agent_id}|{session_id}")
    }

    pub fn from_violation(id: String, v: Violation) -> Self {
        Self {
            id,
            kind: v.kind,
            severity: v.severity,
            agent_id: v.agent_id,
            session_id: v.session_id,
            policy_name: v.policy_name,
            action_type: v.action_type,
            message: v.message,
            time: Utc::now(),
        }
    }
}
