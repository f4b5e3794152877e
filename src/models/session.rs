use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a session. `end_time` is set iff status is
/// `Completed` or `Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
    Terminated,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Terminated => "terminated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "terminated" => Some(Self::Terminated),
            _ => None,
        }
    }
}

/// A bounded interaction between an agent and the governed upstream.
///
/// Exactly one row exists in persistent storage per id; the in-memory copy
/// held by the session manager only exists while `status` is `active` or
/// `paused`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub agent_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub total_cost: f64,
    pub action_count: u64,
    pub metadata: serde_json::Value,
}

impl Session {
    pub fn new(id: String, agent_id: String, metadata: serde_json::Value) -> Self {
        Self {
            id,
            agent_id,
            start_time: Utc::now(),
            end_time: None,
            status: SessionStatus::Active,
            total_cost: 0.0,
            action_count: 0,
            metadata,
        }
    }
}

/// The stable owner of one or more sessions. Upserted on first sighting,
/// never deleted by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Agent {
    /// The literal agent id used when no `X-AgentWarden-Agent-Id` header is present.
    pub const ANONYMOUS: &'static str = "anonymous";

    pub fn new(id: String) -> Self {
        let name = id.clone();
        Self {
            id,
            name,
            created_at: Utc::now(),
        }
    }
}
