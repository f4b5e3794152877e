use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::models::policy::{AiJudgeConfig, Category, Effect, Policy, TimeoutEffect};
use crate::policy::expr;

/// One `[[policies]]` table as written in the TOML policy file. This is the
/// wire shape; [`compile`] turns it into the typed, evaluator-ready
/// [`Policy`].
#[derive(Debug, Deserialize)]
pub struct PolicyFileEntry {
    pub name: String,
    #[serde(default)]
    pub r#type: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    pub effect: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub delay: Option<String>,
    #[serde(default)]
    pub approvers: Option<Vec<String>>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub timeout_effect: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PolicyFile {
    #[serde(default, rename = "policies")]
    pub policies: Vec<PolicyFileEntry>,
}

#[derive(Debug, Error)]
pub enum PolicyCompileError {
    #[error("policy \"{name}\": {source}")]
    Expr {
        name: String,
        #[source]
        source: expr::CompileError,
    },
    #[error("policy \"{name}\": unknown effect \"{effect}\"")]
    UnknownEffect { name: String, effect: String },
    #[error("policy \"{name}\": unknown timeout_effect \"{value}\"")]
    UnknownTimeoutEffect { name: String, value: String },
    #[error("policy \"{name}\": invalid duration \"{value}\"")]
    InvalidDuration { name: String, value: String },
    #[error("policy \"{name}\": approval/ai-judge policy requires a condition or approvers")]
    MissingCondition { name: String },
}

fn parse_effect(name: &str, s: &str) -> Result<Effect, PolicyCompileError> {
    Ok(match s {
        "allow" => Effect::Allow,
        "deny" => Effect::Deny,
        "terminate" => Effect::Terminate,
        "throttle" => Effect::Throttle,
        "approve" => Effect::Approve,
        other => {
            return Err(PolicyCompileError::UnknownEffect {
                name: name.to_string(),
                effect: other.to_string(),
            })
        }
    })
}

fn parse_timeout_effect(name: &str, s: &str) -> Result<TimeoutEffect, PolicyCompileError> {
    match s {
        "allow" => Ok(TimeoutEffect::Allow),
        "deny" => Ok(TimeoutEffect::Deny),
        other => Err(PolicyCompileError::UnknownTimeoutEffect {
            name: name.to_string(),
            value: other.to_string(),
        }),
    }
}

fn parse_dur(name: &str, s: &str) -> Result<Duration, PolicyCompileError> {
    expr::parse_duration(s).ok_or_else(|| PolicyCompileError::InvalidDuration {
        name: name.to_string(),
        value: s.to_string(),
    })
}

/// Classifies and compiles one config entry (spec §4.2 "Classification"):
/// `type = "ai-judge"` wins first, then a non-empty `approvers` list, else
/// it is a `cel` expression policy.
pub fn compile_one(entry: &PolicyFileEntry) -> Result<Policy, PolicyCompileError> {
    let effect = parse_effect(&entry.name, &entry.effect)?;
    let message = entry.message.clone().unwrap_or_else(|| entry.name.clone());

    if entry.r#type.as_deref() == Some("ai-judge") {
        let context = entry.context.clone().unwrap_or_default();
        let timeout = match &entry.timeout {
            Some(s) => parse_dur(&entry.name, s)?,
            None => Duration::from_secs(5),
        };
        let timeout_effect = match &entry.timeout_effect {
            Some(s) => parse_timeout_effect(&entry.name, s)?,
            None => TimeoutEffect::Deny,
        };
        return Ok(Policy {
            name: entry.name.clone(),
            category: Category::AiJudge,
            effect,
            message,
            expression: None,
            throttle_delay: None,
            approvers: None,
            approval_timeout: None,
            approval_timeout_effect: None,
            ai_judge: Some(AiJudgeConfig {
                context,
                model: entry.model.clone(),
                timeout,
                timeout_effect,
            }),
        });
    }

    if entry.approvers.as_ref().is_some_and(|a| !a.is_empty()) {
        let timeout = match &entry.timeout {
            Some(s) => Some(parse_dur(&entry.name, s)?),
            None => Some(Duration::from_secs(300)),
        };
        let timeout_effect = match &entry.timeout_effect {
            Some(s) => Some(parse_timeout_effect(&entry.name, s)?),
            None => Some(TimeoutEffect::Deny),
        };
        return Ok(Policy {
            name: entry.name.clone(),
            category: Category::Approval,
            effect: Effect::Approve,
            message,
            expression: entry
                .condition
                .as_deref()
                .map(expr::compile)
                .transpose()
                .map_err(|source| PolicyCompileError::Expr {
                    name: entry.name.clone(),
                    source,
                })?,
            throttle_delay: None,
            approvers: entry.approvers.clone(),
            approval_timeout: timeout,
            approval_timeout_effect: timeout_effect,
            ai_judge: None,
        });
    }

    let condition = entry
        .condition
        .as_deref()
        .ok_or_else(|| PolicyCompileError::MissingCondition {
            name: entry.name.clone(),
        })?;
    let expression = expr::compile(condition).map_err(|source| PolicyCompileError::Expr {
        name: entry.name.clone(),
        source,
    })?;
    let throttle_delay = match &entry.delay {
        Some(s) => Some(parse_dur(&entry.name, s)?),
        None => None,
    };

    Ok(Policy {
        name: entry.name.clone(),
        category: Category::Cel,
        effect,
        message,
        expression: Some(expression),
        throttle_delay,
        approvers: None,
        approval_timeout: None,
        approval_timeout_effect: None,
        ai_judge: None,
    })
}

/// Reads and compiles a policy file. A single bad entry is logged and
/// skipped (spec §4.2: "a bad policy is logged and skipped; startup does
/// not fail") — only a malformed TOML document itself is a hard error.
pub fn load_and_compile(path: &str) -> anyhow::Result<Vec<Policy>> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(%path, "policy file not found — starting with an empty policy set");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };
    let file: PolicyFile = toml::from_str(&text)?;

    let mut compiled = Vec::with_capacity(file.policies.len());
    for entry in &file.policies {
        match compile_one(entry) {
            Ok(policy) => compiled.push(policy),
            Err(e) => tracing::error!(error = %e, "skipping invalid policy"),
        }
    }
    Ok(compiled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_budget_deny_policy() {
        let entry = PolicyFileEntry {
            name: "budget".into(),
            r#type: None,
            condition: Some("session.cost > 0.50".into()),
            effect: "deny".into(),
            message: Some("over budget".into()),
            delay: None,
            approvers: None,
            model: None,
            context: None,
            timeout: None,
            timeout_effect: None,
        };
        let policy = compile_one(&entry).unwrap();
        assert_eq!(policy.category, Category::Cel);
        assert_eq!(policy.effect, Effect::Deny);
        assert!(policy.expression.is_some());
    }

    #[test]
    fn classifies_approval_over_condition() {
        let entry = PolicyFileEntry {
            name: "wire-transfer".into(),
            r#type: None,
            condition: Some(r#"action.name == "wire_transfer""#.into()),
            effect: "approve".into(),
            message: None,
            delay: None,
            approvers: Some(vec!["finance-oncall".into()]),
            model: None,
            context: None,
            timeout: Some("60s".into()),
            timeout_effect: Some("deny".into()),
        };
        let policy = compile_one(&entry).unwrap();
        assert_eq!(policy.category, Category::Approval);
        assert_eq!(policy.approval_timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn rejects_unknown_effect() {
        let entry = PolicyFileEntry {
            name: "bad".into(),
            r#type: None,
            condition: Some("true".into()),
            effect: "explode".into(),
            message: None,
            delay: None,
            approvers: None,
            model: None,
            context: None,
            timeout: None,
            timeout_effect: None,
        };
        assert!(compile_one(&entry).is_err());
    }
}
