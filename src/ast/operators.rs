//! Binary operators.

/// Operators that survive the semantic pass as plain binary expressions.
/// Structural operators (`.`, `[`, `{`, `^`, `:=`, `@`, `#`, `~>`) are
/// rewritten into dedicated node kinds instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    // Arithmetic
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,

    // Comparison
    Equal,
    NotEqual,
    LessThan,
    LessEqual,
    GreaterThan,
    GreaterEqual,

    // Logical (short-circuiting)
    And,
    Or,

    /// Membership test (`in`)
    In,
    /// String concatenation (`&`)
    Concat,
    /// Integer range (`..`), only valid inside array constructors
    Range,
}

impl BinaryOp {
    /// Source-level operator symbol, for error messages.
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::Equal => "=",
            BinaryOp::NotEqual => "!=",
            BinaryOp::LessThan => "<",
            BinaryOp::LessEqual => "<=",
            BinaryOp::GreaterThan => ">",
            BinaryOp::GreaterEqual => ">=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::In => "in",
            BinaryOp::Concat => "&",
            BinaryOp::Range => "..",
        }
    }
}
