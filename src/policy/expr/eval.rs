use std::time::Duration;

use thiserror::Error;

use super::ast::{BinaryOp, Expr, Literal, UnaryOp};
use super::lexer::parse_duration;

#[derive(Debug, Error)]
pub enum TypeError {
    #[error("unknown field path \"{0}\"")]
    UnknownField(String),
    #[error("unknown function \"{0}\"")]
    UnknownFunction(String),
    #[error("\"{0}\" expects {1} arguments, got {2}")]
    ArityMismatch(String, usize, usize),
    #[error("operator {0:?} cannot be applied to {1:?} and {2:?}")]
    BinaryTypeMismatch(BinaryOp, Type, Type),
    #[error("operator {0:?} cannot be applied to {1:?}")]
    UnaryTypeMismatch(UnaryOp, Type),
    #[error("expression must evaluate to bool, got {0:?}")]
    NotBoolean(Type),
}

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("type error: {0}")]
    Type(#[from] TypeError),
    #[error("invalid duration literal \"{0}\" in call argument")]
    InvalidDuration(String),
    #[error("expression did not evaluate to a boolean")]
    NonBooleanResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    Bool,
    Int,
    Float,
    Str,
    Duration,
    /// `action.params` and anything beneath it — the declared environment
    /// types it `map<string, any>`, so static checking stops there and
    /// comparisons against it are resolved dynamically at evaluation time.
    Dynamic,
}

#[derive(Debug, Clone)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Duration(Duration),
    Json(serde_json::Value),
}

impl Value {
    pub fn as_bool(&self) -> Result<bool, EvalError> {
        match self {
            Value::Bool(b) => Ok(*b),
            _ => Err(EvalError::NonBooleanResult),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            Value::Json(serde_json::Value::Number(n)) => n.as_f64(),
            _ => None,
        }
    }
}

/// Resolves field paths and the `action_count_in_window` binding at
/// evaluation time. One context is built per request, borrowing the
/// session manager's sliding-window lookup.
pub struct EvalContext<'a> {
    pub action_type: &'a str,
    pub action_name: &'a str,
    pub action_target: &'a str,
    pub action_params: &'a serde_json::Value,
    pub session_id: &'a str,
    pub session_agent_id: &'a str,
    pub session_cost: f64,
    pub session_action_count: i64,
    pub agent_id: &'a str,
    pub agent_name: &'a str,
    pub agent_daily_cost: f64,
    pub count_in_window: &'a dyn Fn(&str, Duration) -> i64,
}

/// Type-checks an expression against the fixed variable environment from
/// spec §4.2. Called once, at policy compile time.
pub fn type_check(expr: &Expr) -> Result<Type, TypeError> {
    match expr {
        Expr::Lit(Literal::Bool(_)) => Ok(Type::Bool),
        Expr::Lit(Literal::Int(_)) => Ok(Type::Int),
        Expr::Lit(Literal::Float(_)) => Ok(Type::Float),
        Expr::Lit(Literal::Str(_)) => Ok(Type::Str),
        Expr::Lit(Literal::Duration(_)) => Ok(Type::Duration),
        Expr::Field(path) => field_type(path),
        Expr::Unary(op, inner) => {
            let t = type_check(inner)?;
            match (op, t) {
                (UnaryOp::Not, Type::Bool) => Ok(Type::Bool),
                (UnaryOp::Neg, Type::Int) => Ok(Type::Int),
                (UnaryOp::Neg, Type::Float) => Ok(Type::Float),
                (UnaryOp::Neg, Type::Dynamic) | (UnaryOp::Not, Type::Dynamic) => Ok(Type::Dynamic),
                (op, t) => Err(TypeError::UnaryTypeMismatch(*op, t)),
            }
        }
        Expr::Binary(op, lhs, rhs) => {
            let lt = type_check(lhs)?;
            let rt = type_check(rhs)?;
            binary_result_type(*op, lt, rt)
        }
        Expr::Call(name, args) => check_call(name, args),
    }
}

fn field_type(path: &[String]) -> Result<Type, TypeError> {
    let joined = path.join(".");
    let t = match path.first().map(String::as_str) {
        Some("action") => match path.get(1).map(String::as_str) {
            Some("type") => Type::Str,
            Some("name") => Type::Str,
            Some("target") => Type::Str,
            Some("params") => Type::Dynamic,
            _ => return Err(TypeError::UnknownField(joined)),
        },
        Some("session") => match path.get(1).map(String::as_str) {
            Some("id") => Type::Str,
            Some("agent_id") => Type::Str,
            Some("cost") => Type::Float,
            Some("action_count") => Type::Int,
            _ => return Err(TypeError::UnknownField(joined)),
        },
        Some("agent") => match path.get(1).map(String::as_str) {
            Some("id") => Type::Str,
            Some("name") => Type::Str,
            Some("daily_cost") => Type::Float,
            _ => return Err(TypeError::UnknownField(joined)),
        },
        _ => return Err(TypeError::UnknownField(joined)),
    };
    // A path longer than two segments only ever descends into
    // `action.params`, which is opaque past that point.
    if path.len() > 2 && path[0] != "action" {
        return Err(TypeError::UnknownField(joined));
    }
    Ok(t)
}

fn check_call(name: &str, args: &[Expr]) -> Result<Type, TypeError> {
    match name {
        "action_count_in_window" => {
            if args.len() != 2 {
                return Err(TypeError::ArityMismatch(name.to_string(), 2, args.len()));
            }
            let t0 = type_check(&args[0])?;
            let t1 = type_check(&args[1])?;
            if !matches!(t0, Type::Str | Type::Dynamic) {
                return Err(TypeError::BinaryTypeMismatch(BinaryOp::Eq, t0, Type::Str));
            }
            if !matches!(t1, Type::Str | Type::Duration | Type::Dynamic) {
                return Err(TypeError::BinaryTypeMismatch(
                    BinaryOp::Eq,
                    t1,
                    Type::Duration,
                ));
            }
            Ok(Type::Int)
        }
        other => Err(TypeError::UnknownFunction(other.to_string())),
    }
}

fn binary_result_type(op: BinaryOp, lt: Type, rt: Type) -> Result<Type, TypeError> {
    use BinaryOp::*;
    use Type::*;

    if lt == Dynamic || rt == Dynamic {
        return Ok(match op {
            And | Or | Eq | Ne | Lt | Le | Gt | Ge => Bool,
            Add | Sub | Mul | Div => Dynamic,
        });
    }

    match op {
        And | Or => match (lt, rt) {
            (Bool, Bool) => Ok(Bool),
            _ => Err(TypeError::BinaryTypeMismatch(op, lt, rt)),
        },
        Eq | Ne => Ok(Bool),
        Lt | Le | Gt | Ge => match (lt, rt) {
            (Int, Int) | (Float, Float) | (Int, Float) | (Float, Int) | (Str, Str) => Ok(Bool),
            _ => Err(TypeError::BinaryTypeMismatch(op, lt, rt)),
        },
        Add | Sub | Mul | Div => match (lt, rt) {
            (Int, Int) => Ok(Int),
            (Float, Float) | (Int, Float) | (Float, Int) => Ok(Float),
            _ => Err(TypeError::BinaryTypeMismatch(op, lt, rt)),
        },
    }
}

/// Evaluates a (previously type-checked) expression against a request's
/// context. Any evaluation-time failure is the caller's signal to fail
/// closed — see [`crate::policy::engine`].
pub fn eval(expr: &Expr, ctx: &EvalContext) -> Result<Value, EvalError> {
    Ok(match expr {
        Expr::Lit(Literal::Bool(b)) => Value::Bool(*b),
        Expr::Lit(Literal::Int(n)) => Value::Int(*n),
        Expr::Lit(Literal::Float(f)) => Value::Float(*f),
        Expr::Lit(Literal::Str(s)) => Value::Str(s.clone()),
        Expr::Lit(Literal::Duration(d)) => Value::Duration(*d),
        Expr::Field(path) => eval_field(path, ctx),
        Expr::Unary(op, inner) => eval_unary(*op, eval(inner, ctx)?)?,
        Expr::Binary(op, lhs, rhs) => {
            let l = eval(lhs, ctx)?;
            let r = eval(rhs, ctx)?;
            eval_binary(*op, l, r)?
        }
        Expr::Call(name, args) => eval_call(name, args, ctx)?,
    })
}

fn eval_field(path: &[String], ctx: &EvalContext) -> Value {
    match (path.first().map(String::as_str), path.get(1).map(String::as_str)) {
        (Some("action"), Some("type")) => Value::Str(ctx.action_type.to_string()),
        (Some("action"), Some("name")) => Value::Str(ctx.action_name.to_string()),
        (Some("action"), Some("target")) => Value::Str(ctx.action_target.to_string()),
        (Some("action"), Some("params")) => {
            if path.len() == 2 {
                Value::Json(ctx.action_params.clone())
            } else {
                let mut cur = ctx.action_params;
                for seg in &path[2..] {
                    cur = cur.get(seg).unwrap_or(&serde_json::Value::Null);
                }
                Value::Json(cur.clone())
            }
        }
        (Some("session"), Some("id")) => Value::Str(ctx.session_id.to_string()),
        (Some("session"), Some("agent_id")) => Value::Str(ctx.session_agent_id.to_string()),
        (Some("session"), Some("cost")) => Value::Float(ctx.session_cost),
        (Some("session"), Some("action_count")) => Value::Int(ctx.session_action_count),
        (Some("agent"), Some("id")) => Value::Str(ctx.agent_id.to_string()),
        (Some("agent"), Some("name")) => Value::Str(ctx.agent_name.to_string()),
        (Some("agent"), Some("daily_cost")) => Value::Float(ctx.agent_daily_cost),
        _ => Value::Json(serde_json::Value::Null),
    }
}

fn eval_unary(op: UnaryOp, v: Value) -> Result<Value, EvalError> {
    Ok(match (op, v) {
        (UnaryOp::Not, Value::Bool(b)) => Value::Bool(!b),
        (UnaryOp::Neg, Value::Int(n)) => Value::Int(-n),
        (UnaryOp::Neg, Value::Float(f)) => Value::Float(-f),
        (UnaryOp::Not, Value::Json(serde_json::Value::Bool(b))) => Value::Bool(!b),
        (UnaryOp::Neg, Value::Json(serde_json::Value::Number(n))) => {
            Value::Float(-n.as_f64().unwrap_or(0.0))
        }
        _ => return Err(EvalError::NonBooleanResult),
    })
}

fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Int(a), Value::Int(b)) => a == b,
        (Value::Duration(a), Value::Duration(b)) => a == b,
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
            _ => to_json_string(a) == to_json_string(b),
        },
    }
}

fn to_json_string(v: &Value) -> String {
    match v {
        Value::Str(s) => s.clone(),
        Value::Json(j) => j.to_string(),
        _ => String::new(),
    }
}

fn eval_binary(op: BinaryOp, l: Value, r: Value) -> Result<Value, EvalError> {
    use BinaryOp::*;
    Ok(match op {
        And => Value::Bool(l.as_bool()? && r.as_bool()?),
        Or => Value::Bool(l.as_bool()? || r.as_bool()?),
        Eq => Value::Bool(json_eq(&l, &r)),
        Ne => Value::Bool(!json_eq(&l, &r)),
        Lt | Le | Gt | Ge => {
            let ord = match (&l, &r) {
                (Value::Str(a), Value::Str(b)) => a.partial_cmp(b),
                _ => l.as_f64().and_then(|a| r.as_f64().map(|b| (a, b))).and_then(
                    |(a, b)| a.partial_cmp(&b),
                ),
            };
            let ord = ord.ok_or(EvalError::NonBooleanResult)?;
            Value::Bool(match op {
                Lt => ord.is_lt(),
                Le => ord.is_le(),
                Gt => ord.is_gt(),
                Ge => ord.is_ge(),
                _ => unreachable!(),
            })
        }
        Add | Sub | Mul | Div => {
            let (a, b) = (
                l.as_f64().ok_or(EvalError::NonBooleanResult)?,
                r.as_f64().ok_or(EvalError::NonBooleanResult)?,
            );
            let result = match op {
                Add => a + b,
                Sub => a - b,
                Mul => a * b,
                Div => a / b,
                _ => unreachable!(),
            };
            match (l, r) {
                (Value::Int(_), Value::Int(_)) if op != Div => Value::Int(result as i64),
                _ => Value::Float(result),
            }
        }
    })
}

fn eval_call(name: &str, args: &[Expr], ctx: &EvalContext) -> Result<Value, EvalError> {
    match name {
        "action_count_in_window" => {
            let type_arg = eval(&args[0], ctx)?;
            let window_arg = eval(&args[1], ctx)?;
            let type_str = match type_arg {
                Value::Str(s) => s,
                Value::Json(serde_json::Value::String(s)) => s,
                _ => return Err(EvalError::NonBooleanResult),
            };
            let window = match window_arg {
                Value::Duration(d) => d,
                Value::Str(s) => parse_duration(&s).ok_or(EvalError::InvalidDuration(s))?,
                Value::Json(serde_json::Value::String(s)) => {
                    parse_duration(&s).ok_or_else(|| EvalError::InvalidDuration(s.clone()))?
                }
                _ => return Err(EvalError::NonBooleanResult),
            };
            Ok(Value::Int((ctx.count_in_window)(&type_str, window)))
        }
        _ => Err(EvalError::Type(TypeError::UnknownFunction(name.to_string()))),
    }
}

/// Convenience used by tests and the dryrun CLI: build a minimal context
/// with no window lookup.
pub fn empty_window_fn() -> impl Fn(&str, Duration) -> i64 {
    |_type, _window| 0
}
