//! The policy condition language: tokenizer, Pratt parser, typed AST and a
//! type-checked evaluator. There is no CEL (or similar) crate anywhere in
//! the ecosystem this repo otherwise draws from, so this small language is
//! hand-rolled rather than generated or vendored — roughly thirty AST/token
//! kinds in total.

mod ast;
mod eval;
mod lexer;
mod parser;

pub use ast::{BinaryOp, Expr, Literal, UnaryOp};
pub use eval::{empty_window_fn, eval, type_check, EvalContext, EvalError, Type, TypeError, Value};
pub use lexer::parse_duration;
pub use parser::ParseError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Type(#[from] TypeError),
    #[error("condition must evaluate to bool, got {0:?}")]
    NotBoolean(Type),
}

/// Parses and type-checks a condition string. Called once per policy, at
/// compile time (startup or reload); never on the request path.
pub fn compile(src: &str) -> Result<Expr, CompileError> {
    let expr = parser::Parser::parse(src)?;
    let ty = type_check(&expr)?;
    if !matches!(ty, Type::Bool | Type::Dynamic) {
        return Err(CompileError::NotBoolean(ty));
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ctx<'a>(count_in_window: &'a dyn Fn(&str, Duration) -> i64) -> EvalContext<'a> {
        EvalContext {
            action_type: "llm.chat",
            action_name: "chat_completion",
            action_target: "gpt-4o",
            action_params: &serde_json::json!({"recipient": "finance@example.com"}),
            session_id: "ses_abc",
            session_agent_id: "agent-1",
            session_cost: 1.25,
            session_action_count: 4,
            agent_id: "agent-1",
            agent_name: "agent-1",
            agent_daily_cost: 3.0,
            count_in_window,
        }
    }

    #[test]
    fn compiles_and_evaluates_cost_cap() {
        let expr = compile("session.cost > 0.50").unwrap();
        let window_fn = empty_window_fn();
        let v = eval(&expr, &ctx(&window_fn)).unwrap();
        assert!(v.as_bool().unwrap());
    }

    #[test]
    fn evaluates_field_path_into_params() {
        let expr = compile(r#"action.params.recipient == "finance@example.com""#).unwrap();
        let window_fn = empty_window_fn();
        assert!(eval(&expr, &ctx(&window_fn)).unwrap().as_bool().unwrap());
    }

    #[test]
    fn evaluates_action_count_in_window() {
        let expr =
            compile(r#"action_count_in_window("tool.call", "5m") >= 3"#).unwrap();
        let lookup = |t: &str, w: Duration| -> i64 {
            assert_eq!(t, "tool.call");
            assert_eq!(w, Duration::from_secs(300));
            3
        };
        assert!(eval(&expr, &ctx(&lookup)).unwrap().as_bool().unwrap());
    }

    #[test]
    fn rejects_non_boolean_condition_at_compile_time() {
        assert!(compile("session.cost + 1").is_err());
    }

    #[test]
    fn rejects_unknown_field() {
        assert!(compile("session.bogus == 1").is_err());
    }
}
