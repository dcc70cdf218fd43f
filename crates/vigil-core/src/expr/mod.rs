//! Alert expression language
//!
//! An expression is parsed and type checked once, when configuration is
//! loaded, and evaluated every check cycle against a [`QueryCache`](crate::tsdb::QueryCache). The root
//! of every expression is a number; evaluation yields one [`GroupResult`] per
//! tag group found among its series operands, or a single result with an
//! empty group when there are none.
//!
//! ```text
//! avg(q("avg:os.cpu{host=*}", "5m")) > 80 && since(q("sum:os.cpu{host=*}", "1h")) < 600
//! ```

mod eval;
mod funcs;
mod lexer;
mod parse;
mod value;

pub use eval::Context;
pub use parse::{BinaryOp, Node, UnaryOp};
pub use value::{Computation, GroupResult, Type, Value};

use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};

use crate::tsdb::QueryError;

/// Syntax or type error, with the byte offset it was found at
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("at position {pos}: {message}")]
pub struct ParseError {
    pub pos: usize,
    pub message: String,
}

impl ParseError {
    pub fn new(pos: usize, message: impl Into<String>) -> Self {
        Self {
            pos,
            message: message.into(),
        }
    }
}

/// Errors raised while evaluating a parsed expression
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    /// Backend request failed
    #[error(transparent)]
    Query(#[from] QueryError),

    /// Backend answered with no series for a query
    #[error("no data for {0}")]
    NoData(String),

    /// A node produced a value of the wrong shape
    #[error("type error in {node}: {message}")]
    Type { node: String, message: String },

    /// A scalar argument did not reduce to exactly one number
    #[error("{func}: {message}")]
    Scalar { func: &'static str, message: String },

    #[error("bad duration {0}")]
    Duration(String),
}

impl EvalError {
    fn ty(node: &Node, message: impl Into<String>) -> Self {
        Self::Type {
            node: node.to_string(),
            message: message.into(),
        }
    }
}

/// A parsed, type-checked expression
#[derive(Debug, Clone)]
pub struct Expr {
    text: String,
    root: Node,
}

impl Expr {
    /// Parse and type check `text`
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        Ok(Self {
            text: text.to_string(),
            root: parse::parse(text)?,
        })
    }

    /// Source text as written
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Evaluate against the backend behind `ctx`.
    ///
    /// Results are numbers, one per distinct group, ordered by group.
    pub async fn evaluate(&self, ctx: &Context<'_>) -> Result<Vec<GroupResult>, EvalError> {
        eval::evaluate(&self.root, ctx).await
    }
}

impl FromStr for Expr {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

impl Serialize for Expr {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.text)
    }
}
