//! Compiles policy configuration into an immutable snapshot and evaluates
//! it, in declaration order, against one action at a time.

pub mod config;
pub mod expr;
pub mod judge;
pub mod reload;

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::models::policy::{AiJudgeConfig, Category, Effect, Policy, TimeoutEffect};
use crate::policy::expr::EvalContext;

/// The immutable, atomically-published set of compiled policies. A
/// `Arc<PolicySnapshot>` is what evaluations actually read from — see
/// `PolicyEngine::current`.
#[derive(Debug, Default)]
pub struct PolicySnapshot {
    pub policies: Vec<Policy>,
}

/// Outcome of running the full pipeline against one action.
#[derive(Debug, Clone)]
pub enum Verdict {
    Allow {
        throttle_delay: Option<Duration>,
    },
    Deny {
        policy: String,
        message: String,
    },
    Terminate {
        policy: String,
        message: String,
    },
    Approve {
        policy: String,
        message: String,
        approvers: Vec<String>,
        timeout: Duration,
        timeout_effect: TimeoutEffect,
    },
}

/// Holds the current policy snapshot behind an [`arc_swap::ArcSwap`] so
/// readers take a single atomic load and evaluate lock-free (spec §9,
/// "GC-less atomic refcounting"). Swapped wholesale on every successful
/// reload; a bad reload leaves the previous snapshot in place.
pub struct PolicyEngine {
    snapshot: ArcSwap<PolicySnapshot>,
    policy_file: String,
    http_client: reqwest::Client,
    llm_base_url: String,
    llm_api_key: Option<String>,
}

impl PolicyEngine {
    pub fn new(
        policy_file: String,
        llm_base_url: String,
        llm_api_key: Option<String>,
    ) -> anyhow::Result<Arc<Self>> {
        let policies = config::load_and_compile(&policy_file)?;
        tracing::info!(count = policies.len(), path = %policy_file, "loaded policy set");
        Ok(Arc::new(Self {
            snapshot: ArcSwap::from_pointee(PolicySnapshot { policies }),
            policy_file,
            http_client: reqwest::Client::new(),
            llm_base_url,
            llm_api_key,
        }))
    }

    pub fn current(&self) -> Arc<PolicySnapshot> {
        self.snapshot.load_full()
    }

    /// Re-reads the policy file and atomically replaces the snapshot.
    /// Evaluations already in flight keep evaluating against the snapshot
    /// they captured via `current()`.
    pub fn reload(&self) -> anyhow::Result<usize> {
        let policies = config::load_and_compile(&self.policy_file)?;
        let count = policies.len();
        self.snapshot.store(Arc::new(PolicySnapshot { policies }));
        tracing::info!(count, "policy snapshot reloaded");
        Ok(count)
    }

    /// Runs the evaluation pipeline (spec §4.2) against one action.
    pub async fn evaluate(&self, ctx: &EvalContext<'_>) -> Verdict {
        let snapshot = self.current();
        let mut max_throttle: Option<Duration> = None;

        for policy in &snapshot.policies {
            match policy.category {
                Category::Cel => match self.evaluate_cel(policy, ctx) {
                    Ok(true) => match self.apply_effect(policy, &mut max_throttle) {
                        Some(verdict) => return verdict,
                        None => continue,
                    },
                    Ok(false) => continue,
                    Err(message) => {
                        return Verdict::Deny {
                            policy: policy.name.clone(),
                            message,
                        }
                    }
                },
                Category::AiJudge => {
                    let Some(ai_cfg) = &policy.ai_judge else {
                        return Verdict::Deny {
                            policy: policy.name.clone(),
                            message: "ai-judge policy missing configuration".to_string(),
                        };
                    };
                    let verdict = self.run_judge(ai_cfg, ctx).await;
                    if verdict.deny {
                        match self.apply_effect(policy, &mut max_throttle) {
                            Some(v) => return v,
                            None => continue,
                        }
                    }
                }
                Category::Approval => {
                    let matched = match &policy.expression {
                        Some(_) => self.evaluate_cel(policy, ctx),
                        None => Ok(true),
                    };
                    match matched {
                        Ok(true) => {
                            return Verdict::Approve {
                                policy: policy.name.clone(),
                                message: policy.message.clone(),
                                approvers: policy.approvers.clone().unwrap_or_default(),
                                timeout: policy
                                    .approval_timeout
                                    .unwrap_or(Duration::from_secs(300)),
                                timeout_effect: policy
                                    .approval_timeout_effect
                                    .unwrap_or(TimeoutEffect::Deny),
                            }
                        }
                        Ok(false) => continue,
                        Err(message) => {
                            return Verdict::Deny {
                                policy: policy.name.clone(),
                                message,
                            }
                        }
                    }
                }
            }
        }

        Verdict::Allow {
            throttle_delay: max_throttle,
        }
    }

    fn evaluate_cel(&self, policy: &Policy, ctx: &EvalContext<'_>) -> Result<bool, String> {
        let Some(expression) = &policy.expression else {
            return Err(format!("policy \"{}\" has no compiled rule", policy.name));
        };
        match expr::eval(expression, ctx) {
            Ok(value) => value
                .as_bool()
                .map_err(|e| format!("policy \"{}\" evaluation error: {e}", policy.name)),
            Err(e) => Err(format!("policy \"{}\" evaluation error: {e}", policy.name)),
        }
    }

    /// Applies a matched policy's effect. Returns `Some(verdict)` when the
    /// pipeline should short-circuit (deny/terminate), `None` when
    /// evaluation should continue (allow is a no-op match; throttle just
    /// records the delay).
    fn apply_effect(&self, policy: &Policy, max_throttle: &mut Option<Duration>) -> Option<Verdict> {
        match policy.effect {
            Effect::Allow => None,
            Effect::Deny => Some(Verdict::Deny {
                policy: policy.name.clone(),
                message: policy.message.clone(),
            }),
            Effect::Terminate => Some(Verdict::Terminate {
                policy: policy.name.clone(),
                message: policy.message.clone(),
            }),
            Effect::Throttle => {
                if let Some(delay) = policy.throttle_delay {
                    *max_throttle = Some(max_throttle.map_or(delay, |m| m.max(delay)));
                }
                None
            }
            Effect::Approve => None,
        }
    }

    async fn run_judge(
        &self,
        cfg: &AiJudgeConfig,
        ctx: &EvalContext<'_>,
    ) -> judge::JudgeVerdict {
        judge::judge_with_timeout(
            &self.http_client,
            &self.llm_base_url,
            self.llm_api_key.as_deref(),
            cfg,
            judge::JudgeRequest {
                action_type: ctx.action_type,
                action_name: ctx.action_name,
                action_target: ctx.action_target,
                action_params: ctx.action_params,
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::expr::empty_window_fn;
    use std::time::Duration as StdDuration;

    fn ctx<'a>(cost: f64, window_fn: &'a dyn Fn(&str, StdDuration) -> i64) -> EvalContext<'a> {
        EvalContext {
            action_type: "llm.chat",
            action_name: "chat_completion",
            action_target: "gpt-4o",
            action_params: &serde_json::json!({}),
            session_id: "ses_x",
            session_agent_id: "agent-1",
            session_cost: cost,
            session_action_count: 1,
            agent_id: "agent-1",
            agent_name: "agent-1",
            agent_daily_cost: cost,
            count_in_window: window_fn,
        }
    }

    #[tokio::test]
    async fn budget_policy_denies_over_cap() {
        let dir = std::env::temp_dir().join(format!("aw-policy-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("policies.toml");
        std::fs::write(
            &path,
            r#"
            [[policies]]
            name = "budget"
            condition = "session.cost > 0.50"
            effect = "deny"
            message = "over budget"
            "#,
        )
        .unwrap();

        let engine = PolicyEngine::new(
            path.to_string_lossy().to_string(),
            "http://localhost".to_string(),
            None,
        )
        .unwrap();

        let window_fn = empty_window_fn();
        match engine.evaluate(&ctx(0.10, &window_fn)).await {
            Verdict::Allow { .. } => {}
            other => panic!("expected allow, got {other:?}"),
        }
        match engine.evaluate(&ctx(0.75, &window_fn)).await {
            Verdict::Deny { policy, .. } => assert_eq!(policy, "budget"),
            other => panic!("expected deny, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn throttle_does_not_short_circuit() {
        let dir = std::env::temp_dir().join(format!("aw-policy-test2-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("policies.toml");
        std::fs::write(
            &path,
            r#"
            [[policies]]
            name = "rate"
            condition = "session.action_count > 0"
            effect = "throttle"
            delay = "500ms"
            message = "slow down"
            "#,
        )
        .unwrap();

        let engine = PolicyEngine::new(
            path.to_string_lossy().to_string(),
            "http://localhost".to_string(),
            None,
        )
        .unwrap();
        let window_fn = empty_window_fn();
        match engine.evaluate(&ctx(0.0, &window_fn)).await {
            Verdict::Allow { throttle_delay } => {
                assert_eq!(throttle_delay, Some(StdDuration::from_millis(500)))
            }
            other => panic!("expected allow-with-throttle, got {other:?}"),
        }
    }
}
