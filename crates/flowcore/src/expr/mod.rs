//! Sandboxed expression language for `transform` and `condition` steps.
//!
//! Source text is parsed into an [`Expr`] tree and evaluated by a tree-walking
//! interpreter against the step's resolved inputs. The language has literals,
//! variables, member/index access, object and array literals, arithmetic,
//! comparison, logical operators, a ternary, and a fixed set of pure helper
//! functions. There is no way to reach the network, the filesystem or
//! process state from an expression.

mod eval;
mod functions;
mod lexer;
mod parser;

use crate::Value;
use std::collections::BTreeMap;
use thiserror::Error;

pub use functions::FUNCTIONS;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    #[error("parse error at {pos}: {message}")]
    Parse { pos: usize, message: String },

    #[error("unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("{function}() expects {expected} argument(s), got {got}")]
    Arity {
        function: String,
        expected: String,
        got: usize,
    },

    #[error("type error: {0}")]
    Type(String),

    #[error("division by zero")]
    DivisionByZero,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

/// Expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Variable(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Conditional(Box<Expr>, Box<Expr>, Box<Expr>),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
}

/// A parsed expression, ready to evaluate any number of times.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    ast: Expr,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        Ok(Self {
            source: source.to_string(),
            ast: parser::parse(source)?,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn ast(&self) -> &Expr {
        &self.ast
    }

    /// Evaluate with `bindings` as the variable environment. The whole map is
    /// also visible as `inputs`.
    pub fn evaluate(&self, bindings: &BTreeMap<String, Value>) -> Result<Value, ExprError> {
        eval::Evaluator::new(bindings).eval(&self.ast)
    }
}

/// Parse and evaluate in one go.
pub fn evaluate(source: &str, bindings: &BTreeMap<String, Value>) -> Result<Value, ExprError> {
    Expression::parse(source)?.evaluate(bindings)
}
