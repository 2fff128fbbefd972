//! The raw parse tree, as produced by the Pratt parser before the semantic
//! pass. Structural operators (`.`, `[`, `{`, `^`, `@`, `#`) are still plain
//! binaries here; the semantic pass flattens them into path/step form.

use std::sync::Arc;

use regex::Regex;

use crate::ast::operators::BinaryOp;
use crate::error::Error;
use crate::signature::Signature;

#[derive(Debug, Clone)]
pub struct Ast {
    pub kind: AstKind,
    pub position: usize,
    /// Set by an empty predicate (`[]`): keep singleton arrays in the output.
    pub keep_array: bool,
}

impl Ast {
    pub fn new(kind: AstKind, position: usize) -> Ast {
        Ast {
            kind,
            position,
            keep_array: false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum AstKind {
    // terminals
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
    Name(String),
    Variable(String),
    Regex(Arc<Regex>),
    Wildcard,
    Descendant,
    Parent,
    /// `?` marker inside a partial-application argument list.
    Placeholder,

    // prefix forms
    Negate(Box<Ast>),
    ArrayCtor(Vec<Ast>),
    ObjectCtor(Vec<(Ast, Ast)>),
    Block(Vec<Ast>),
    Transform {
        pattern: Box<Ast>,
        update: Box<Ast>,
        delete: Option<Box<Ast>>,
    },

    // infix forms
    Path(Box<Ast>, Box<Ast>),
    Predicate(Box<Ast>, Box<Ast>),
    GroupBy(Box<Ast>, Vec<(Ast, Ast)>),
    OrderBy(Box<Ast>, Vec<RawSortTerm>),
    Bind(Box<Ast>, Box<Ast>),
    FocusBind(Box<Ast>, String),
    IndexBind(Box<Ast>, String),
    Apply(Box<Ast>, Box<Ast>),
    Binary(BinaryOp, Box<Ast>, Box<Ast>),
    Condition {
        condition: Box<Ast>,
        then: Box<Ast>,
        otherwise: Option<Box<Ast>>,
    },
    FunctionCall {
        procedure: Box<Ast>,
        args: Vec<Ast>,
        is_partial: bool,
    },
    Lambda {
        params: Vec<String>,
        body: Box<Ast>,
        signature: Option<Signature>,
    },

    /// Placeholder substituted for an unparsable fragment in recovery mode.
    ParseError(Error),
}

#[derive(Debug, Clone)]
pub struct RawSortTerm {
    pub expression: Ast,
    pub descending: bool,
}
