//! The evaluator-ready tree produced by the semantic pass.
//!
//! Kind-specific payloads live in [`NodeKind`], one variant per expression
//! form. The thin [`Node`] envelope carries the orchestration metadata that
//! genuinely cuts across kinds during path evaluation: predicates and stages,
//! group-by attachment, focus/index variable binds, the tuple flag, and the
//! resolved ancestor slot. A field foreign to a node's kind is never set.
//!
//! Ancestor slots are held in an arena (`Vec<Slot>`) owned by the parse
//! result and referenced by index, which keeps this tree `Send + Sync` while
//! the semantic pass rewrites slot levels and labels in place.

use std::sync::Arc;

use regex::Regex;

use crate::ast::operators::BinaryOp;
use crate::error::Error;
use crate::signature::Signature;
use crate::value::Value;

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub position: usize,
    /// Keep a singleton result as an array (set by an empty predicate `[]`).
    pub keep_array: bool,
    /// Constructed-array marker; a cons array is never spliced when flattening.
    pub cons: bool,
    /// Focus variable (`@$v`) bound by this step.
    pub focus: Option<String>,
    /// Index variable (`#$v`) bound by this step.
    pub index: Option<String>,
    /// This step (or path) binds tuple-stream state.
    pub tuple: bool,
    /// Resolved ancestor slot bound by this step.
    pub ancestor: Option<usize>,
    /// Stages applied during step evaluation (predicates, index binds).
    pub stages: Option<Vec<Stage>>,
    /// Predicates applied to a non-path expression result.
    pub predicates: Option<Vec<Node>>,
    /// Group-by attached to this expression or path.
    pub group: Option<GroupPairs>,
    /// Ancestor slots still seeking their parent step (semantic-pass state).
    pub seeking: Vec<usize>,
}

impl Node {
    pub fn new(kind: NodeKind, position: usize) -> Node {
        Node {
            kind,
            position,
            keep_array: false,
            cons: false,
            focus: None,
            index: None,
            tuple: false,
            ancestor: None,
            stages: None,
            predicates: None,
            group: None,
            seeking: Vec::new(),
        }
    }

    pub fn is_path(&self) -> bool {
        matches!(self.kind, NodeKind::Path { .. })
    }

    /// Short kind name for error messages.
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            NodeKind::Literal(_) => "literal",
            NodeKind::Name(_) => "name",
            NodeKind::Variable(_) => "variable",
            NodeKind::Regex(_) => "regex",
            NodeKind::Wildcard => "wildcard",
            NodeKind::Descendant => "descendant",
            NodeKind::Parent { .. } => "parent",
            NodeKind::Placeholder => "operator",
            NodeKind::Path { .. } => "path",
            NodeKind::Negate(_) => "unary",
            NodeKind::ArrayCtor { .. } => "unary",
            NodeKind::ObjectCtor(_) => "unary",
            NodeKind::Block { .. } => "block",
            NodeKind::Binary { .. } => "binary",
            NodeKind::Bind { .. } => "bind",
            NodeKind::Condition { .. } => "condition",
            NodeKind::FunctionCall { .. } => "function",
            NodeKind::PartialCall { .. } => "partial",
            NodeKind::Lambda { .. } => "lambda",
            NodeKind::Apply { .. } => "apply",
            NodeKind::Transform { .. } => "transform",
            NodeKind::Sort { .. } => "sort",
            NodeKind::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Literal(Literal),
    Name(String),
    Variable(String),
    Regex(Arc<Regex>),
    Wildcard,
    Descendant,
    /// A `%` reference, resolved to a slot in the expression's slot arena.
    Parent {
        slot: usize,
    },
    Placeholder,
    Path {
        steps: Vec<Node>,
        keep_singleton_array: bool,
    },
    Negate(Box<Node>),
    ArrayCtor {
        exprs: Vec<Node>,
    },
    ObjectCtor(GroupPairs),
    Block {
        exprs: Vec<Node>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Node>,
        rhs: Box<Node>,
    },
    Bind {
        name: String,
        rhs: Box<Node>,
    },
    Condition {
        condition: Box<Node>,
        then: Box<Node>,
        otherwise: Option<Box<Node>>,
    },
    FunctionCall {
        procedure: Box<Node>,
        args: Vec<Node>,
    },
    PartialCall {
        procedure: Box<Node>,
        args: Vec<Node>,
    },
    Lambda {
        params: Arc<Vec<String>>,
        body: Arc<Node>,
        signature: Option<Arc<Signature>>,
        /// Tail-call wrapper consumed by the evaluator's trampoline.
        thunk: bool,
    },
    Apply {
        lhs: Box<Node>,
        rhs: Box<Node>,
    },
    Transform {
        pattern: Arc<Node>,
        update: Arc<Node>,
        delete: Option<Arc<Node>>,
    },
    /// Order-by step within a path.
    Sort {
        terms: Vec<SortTerm>,
    },
    /// Recovery placeholder; evaluating it raises the stored error.
    Error {
        error: Error,
    },
}

/// Scalar literal payloads. Kept separate from [`Value`] so the processed
/// tree stays `Send + Sync`.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Null,
}

impl Literal {
    pub fn to_value(&self) -> Value {
        match self {
            Literal::Str(s) => Value::string(s.clone()),
            Literal::Integer(n) => Value::Integer(*n),
            Literal::Float(n) => Value::Float(*n),
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Null => Value::Null,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Literal::Str(s) => s.clone(),
            Literal::Integer(n) => n.to_string(),
            Literal::Float(n) => n.to_string(),
            Literal::Bool(b) => b.to_string(),
            Literal::Null => "null".to_string(),
        }
    }
}

/// A stage applied while evaluating a path step.
#[derive(Debug, Clone)]
pub enum Stage {
    Filter(Box<Node>),
    /// Bind the running position to a variable across the step's tuples.
    Index(String),
}

/// The key/value expression pairs of a grouping (`{...}`) construct.
#[derive(Debug, Clone)]
pub struct GroupPairs {
    pub pairs: Vec<(Node, Node)>,
    pub position: usize,
}

/// One term of an order-by clause.
#[derive(Debug, Clone)]
pub struct SortTerm {
    pub expression: Node,
    pub descending: bool,
}

/// An ancestor slot allocated for a `%` reference. `level` counts unresolved
/// path levels upward; the semantic pass drives it to 0 and attaches the slot
/// to the owning step.
#[derive(Debug, Clone)]
pub struct Slot {
    pub label: String,
    pub level: usize,
    pub index: usize,
}
