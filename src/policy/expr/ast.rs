use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A literal value in source form. Durations are parsed eagerly by the
/// lexer (`"60s"`, `"5m"`, `"1h"`) since the only place a duration literal
/// can appear is as an argument to `action_count_in_window`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Duration(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

/// The typed boolean-expression AST compiled from a policy's `condition`
/// string. Field paths (`session.cost`, `action.params.recipient`) are
/// resolved against the evaluation context at run time; everything else is
/// pure syntax.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Lit(Literal),
    /// Dotted field access, e.g. `["session", "cost"]` for `session.cost`.
    Field(Vec<String>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// Only `action_count_in_window(type, window)` is bound at evaluation time.
    Call(String, Vec<Expr>),
}
