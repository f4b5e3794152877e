use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::policy::expr::Expr;

/// How a policy was classified at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    Cel,
    AiJudge,
    Approval,
}

/// What happens when a policy matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    Allow,
    Deny,
    Terminate,
    Throttle,
    Approve,
}

impl Effect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Effect::Allow => "allow",
            Effect::Deny => "deny",
            Effect::Terminate => "terminate",
            Effect::Throttle => "throttle",
            Effect::Approve => "approve",
        }
    }
}

/// What governs the outcome when an ai-judge call or an approval wait times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutEffect {
    Allow,
    #[default]
    Deny,
}

/// Settings specific to an `ai-judge` category policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiJudgeConfig {
    /// Markdown context document included verbatim in the system prompt.
    pub context: String,
    pub model: Option<String>,
    pub timeout: Duration,
    pub timeout_effect: TimeoutEffect,
}

/// One compiled policy, as held in a [`crate::policy::PolicySnapshot`].
///
/// `expression` is `Some` only for `Category::Cel`; `ai_judge` only for
/// `Category::AiJudge`; `approvers`/`approval_timeout`/`approval_timeout_effect`
/// only for `Category::Approval`. The evaluator matches on `category`, not on
/// which optional fields are populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub name: String,
    pub category: Category,
    pub effect: Effect,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expression: Option<Expr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throttle_delay: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approvers: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_timeout: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_timeout_effect: Option<TimeoutEffect>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_judge: Option<AiJudgeConfig>,
}
