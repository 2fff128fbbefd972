//! The single error channel for parsing, signature validation, and evaluation.
//!
//! Every failure carries a stable code, an optional 0-based source position, and
//! the message inserts needed to render a human-readable description. Codes are
//! grouped by family: `S01xx` tokenizer, `S02xx`/`S03xx` parser syntax and
//! ancestry, `S04xx` signature definitions, `T04xx` argument validation,
//! `T1xxx`/`T2xxx` evaluation type errors, `D1xxx`/`D2xxx`/`D3xxx` evaluation
//! domain errors, `U1xxx` resource limits.

use std::fmt;

/// An error raised while parsing or evaluating an expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    /// Stable error code, e.g. `"S0202"` or `"T2001"`.
    pub code: &'static str,
    /// 0-based character offset into the source expression, where applicable.
    pub position: Option<usize>,
    /// Message inserts, in template order.
    pub inserts: Vec<String>,
}

impl Error {
    pub fn new(code: &'static str, position: Option<usize>) -> Self {
        Error {
            code,
            position,
            inserts: Vec::new(),
        }
    }

    pub fn with(code: &'static str, position: Option<usize>, inserts: Vec<String>) -> Self {
        Error {
            code,
            position,
            inserts,
        }
    }

    /// True for resource-limit errors (never recoverable, never retried).
    pub fn is_resource_limit(&self) -> bool {
        self.code.starts_with("U1") || self.code == "D2014"
    }

    fn template(&self) -> &'static str {
        match self.code {
            // tokenizer
            "S0101" => "String literal must be terminated by a matching quote",
            "S0102" => "Number out of range: {0}",
            "S0103" => "Unsupported escape sequence: \\{0}",
            "S0104" => "The escape sequence \\u must be followed by 4 hex digits",
            "S0105" => "Quoted property name must be terminated with a backquote",
            "S0106" => "Comment has no closing tag",
            // parser
            "S0201" => "Syntax error: {0}",
            "S0202" => "Expected {0}, got {1}",
            "S0203" => "Expected {0} before end of expression",
            "S0204" => "Unknown operator: {0}",
            "S0205" => "Unexpected token: {0}",
            "S0206" => "Unknown expression type: {0}",
            "S0207" => "Unexpected end of expression",
            "S0208" => "Parameter {0} of function definition must be a variable name (start with $)",
            "S0209" => "A predicate cannot follow a grouping expression in a step",
            "S0210" => "Each step can only have one grouping expression",
            "S0211" => "The symbol {0} cannot be used as a unary operator",
            "S0212" => "The left side of := must be a variable name (start with $)",
            "S0213" => "The literal value {0} cannot be used as a step within a path expression",
            "S0214" => "The right side of {0} must be a variable name (start with $)",
            "S0215" => "A context variable binding must precede any predicates on a step",
            "S0216" => "A context variable binding must precede the 'order-by' clause on a step",
            "S0217" => "The object representing the 'parent' cannot be derived from this expression",
            // regex literals
            "S0301" => "Empty regular expressions are not allowed",
            "S0302" => "No terminating / in regular expression",
            "S0303" => "Invalid regular expression: {0}",
            // signature definitions
            "S0402" => "Choice groups containing parameterized types are not supported",
            // signature validation
            "T0410" => "Argument {0} of function {1} does not match function signature",
            "T0411" => "Context value is not a compatible type with argument {0} of function {1}",
            "T0412" => "Argument of function {1} must be an array of {0}",
            // evaluation: call sites
            "T1003" => "Key in object structure must evaluate to a string; got: {0}",
            "T1005" => "Attempted to invoke a non-function. Did you mean ${0}?",
            "T1006" => "Attempted to invoke a non-function",
            "T1007" => "Attempted to partially apply a non-function. Did you mean ${0}?",
            "T1008" => "Attempted to partially apply a non-function",
            // evaluation: operand types
            "T2001" => "The left side of the {0} operator must evaluate to a number",
            "T2002" => "The right side of the {0} operator must evaluate to a number",
            "T2003" => "The left side of the range operator (..) must evaluate to an integer",
            "T2004" => "The right side of the range operator (..) must evaluate to an integer",
            "T2006" => "The right side of the function application operator ~> must be a function",
            "T2007" => "Type mismatch when comparing values {0} and {1} in order-by clause",
            "T2008" => {
                "The expressions within an order-by clause must evaluate to numeric or string values"
            }
            "T2009" => {
                "The values {0} and {1} either side of operator {2} must be of the same data type"
            }
            "T2010" => {
                "The expressions either side of operator {0} must evaluate to numeric or string values"
            }
            "T2011" => {
                "The insert/update clause of the transform expression must evaluate to an object: {0}"
            }
            "T2012" => {
                "The delete clause of the transform expression must evaluate to an array of strings: {0}"
            }
            // evaluation: domain
            "D1001" => "Number out of range: {0}",
            "D1002" => "Cannot negate a non-numeric value: {0}",
            "D1009" => "Multiple key definitions evaluate to same key: {0}",
            "D2014" => {
                "The size of the sequence allocated by the range operator (..) must not exceed 1e7 entries. Attempted to allocate {0}"
            }
            "D3030" => "Unable to cast value to a number: {0}",
            "D3050" => "The second argument of reduce function must be a function with at least two arguments",
            "D3060" => "Attempted to retrieve the square root of a negative number: {0}",
            "D3061" => "The power function has resulted in a value that cannot be represented as a JSON number: base={0}, exponent={1}",
            "D3070" => {
                "The single argument form of the sort function can only be applied to an array of strings or an array of numbers. Use the second argument to specify a comparison function"
            }
            "D3120" => "Syntax error in expression passed to function eval: {0}",
            "D3121" => "Dynamic error evaluating the expression passed to function eval: {0}",
            "D3137" => "{0}",
            "D3138" => "The $single() function expected exactly 1 matching result. Instead it matched more.",
            "D3139" => "The $single() function expected exactly 1 matching result. Instead it matched 0.",
            "D3141" => "{0}",
            // resource limits
            "U1001" => {
                "Stack overflow error: Check for non-terminating recursive function. Consider rewriting as tail-recursive"
            }
            "U1002" => "Expression evaluation timeout: Check for infinite loop",
            _ => "Unknown error",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut message = self.template().to_string();
        for (i, insert) in self.inserts.iter().enumerate() {
            message = message.replace(&format!("{{{}}}", i), insert);
        }
        match self.position {
            Some(pos) => write!(f, "{} @ {}: {}", self.code, pos, message),
            None => write!(f, "{}: {}", self.code, message),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_inserts_are_substituted() {
        let err = Error::with("S0202", Some(4), vec!["]".to_string(), "(end)".to_string()]);
        assert_eq!(err.to_string(), "S0202 @ 4: Expected ], got (end)");
    }

    #[test]
    fn resource_limit_classification() {
        assert!(Error::new("U1001", None).is_resource_limit());
        assert!(Error::new("D2014", None).is_resource_limit());
        assert!(!Error::new("T2001", None).is_resource_limit());
    }
}
