//! Tansy: a JSONata-style query and transformation language for JSON.
//!
//! An expression is parsed into an evaluator-ready AST ([`Expression`]) and
//! evaluated against a JSON-like input [`Value`]:
//!
//! ```
//! use tansy_lang::{parse, Value};
//!
//! let expr = parse("$sum(order.total)").unwrap();
//! let input = Value::from_json(&serde_json::json!({
//!     "order": [{ "total": 5 }, { "total": 7 }]
//! }));
//! assert_eq!(expr.evaluate(input).unwrap(), Value::Integer(12));
//! ```
//!
//! A parsed [`Expression`] is immutable and `Send + Sync`; each `evaluate`
//! call runs in its own interpreter context, so one compiled expression can
//! be shared freely across threads.

pub mod ast;
pub mod error;
pub mod evaluator;
pub mod frame;
mod functions;
pub mod lexer;
pub mod parser;
pub mod signature;
pub mod value;

pub use ast::{Node, NodeKind};
pub use error::Error;
pub use frame::Frame;
pub use lexer::Lexer;
pub use signature::Signature;
pub use value::{ArrayFlags, FunctionValue, Value};

use ast::nodes::Slot;

/// A parsed, evaluator-ready expression.
pub struct Expression {
    pub(crate) ast: Node,
    pub(crate) slots: Vec<Slot>,
    /// Errors collected in recovery mode; empty after a normal parse.
    pub errors: Vec<Error>,
}

impl Expression {
    /// The root of the processed syntax tree.
    pub fn ast(&self) -> &Node {
        &self.ast
    }
}

/// Parse an expression, failing on the first syntax error.
pub fn parse(source: &str) -> Result<Expression, Error> {
    parser::parse_source(source, false)
}

/// Parse an expression in recovery mode: collect syntax errors into
/// [`Expression::errors`] and substitute placeholder nodes, so that a
/// best-effort tree is produced for multi-error reporting.
pub fn parse_with_recovery(source: &str) -> Result<Expression, Error> {
    parser::parse_source(source, true)
}
