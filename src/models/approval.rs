use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::policy::TimeoutEffect;

/// Disposition of an approval record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Timeout,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Denied => "denied",
            ApprovalStatus::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "denied" => Some(Self::Denied),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }
}

/// A human-in-the-loop gate raised by an `approval` category policy match.
///
/// Created and persisted when the policy matches; the caller's task blocks on
/// an in-memory waiter keyed by `id` until `resolve` is called or the
/// `timeout_deadline` passes. Resolving a non-pending record is an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub id: String,
    pub session_id: String,
    pub trace_id: String,
    pub policy_name: String,
    pub action_summary: serde_json::Value,
    pub created_time: DateTime<Utc>,
    pub timeout_deadline: DateTime<Utc>,
    pub status: ApprovalStatus,
    pub timeout_effect: TimeoutEffect,
    pub approver: Option<String>,
    pub resolved_time: Option<DateTime<Utc>>,
}
