//! # Tansy Query Language - Abstract Syntax Tree
//!
//! Two tree representations cross this module:
//!
//! - **[raw]** - the parse tree produced by the Pratt parser, one node per
//!   grammar production. Operators like `.`/`[`/`{`/`^` are still structural
//!   binaries at this level.
//! - **[nodes]** - the evaluator-ready tree produced by the semantic pass:
//!   `.`-chains flattened into path steps, predicates and grouping attached as
//!   stages, ancestor (`%`) references resolved to slots, tail calls thunked.
//!
//! Supporting submodules:
//!
//! - **[tokens]** - lexical tokens produced by the lexer
//! - **[operators]** - binary operators (arithmetic, comparison, logical)

pub mod nodes;
pub mod operators;
pub mod raw;
pub mod tokens;

pub use nodes::{GroupPairs, Node, NodeKind, Slot, SortTerm, Stage};
pub use operators::BinaryOp;
pub use raw::{Ast, AstKind};
pub use tokens::{Token, TokenKind};
