//! Lexical tokens produced by the lexer.

use std::sync::Arc;

use regex::Regex;

/// A single token with its 0-based source offset.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub position: usize,
}

/// Token payloads. Operators carry their textual id, which is also the key
/// into the parser's symbol table.
#[derive(Debug, Clone)]
pub enum TokenKind {
    Operator(String),
    Name(String),
    Variable(String),
    Str(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Null,
    Regex(Arc<Regex>),
}

impl PartialEq for TokenKind {
    fn eq(&self, other: &TokenKind) -> bool {
        use TokenKind::*;
        match (self, other) {
            (Operator(a), Operator(b)) => a == b,
            (Name(a), Name(b)) => a == b,
            (Variable(a), Variable(b)) => a == b,
            (Str(a), Str(b)) => a == b,
            (Integer(a), Integer(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (Bool(a), Bool(b)) => a == b,
            (Null, Null) => true,
            (Regex(a), Regex(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

impl TokenKind {
    /// Textual rendering used in signature collection and error messages.
    pub fn text(&self) -> String {
        match self {
            TokenKind::Operator(op) => op.clone(),
            TokenKind::Name(name) => name.clone(),
            TokenKind::Variable(name) => format!("${}", name),
            TokenKind::Str(s) => s.clone(),
            TokenKind::Integer(n) => n.to_string(),
            TokenKind::Float(n) => n.to_string(),
            TokenKind::Bool(b) => b.to_string(),
            TokenKind::Null => "null".to_string(),
            TokenKind::Regex(re) => re.as_str().to_string(),
        }
    }
}
