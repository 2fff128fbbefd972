//! The expression parser: a top-down operator-precedence (Pratt) engine over
//! a registered symbol table, followed by the semantic pass that rewrites the
//! raw parse tree into the evaluator-ready form.
//!
//! Grammar rules are pure functions over an explicit `&mut Parser`: a prefix
//! rule (`nud`) produces a node with no left operand, an infix rule (`led`)
//! combines a previously parsed left node with what follows. Registering the
//! same symbol twice keeps the higher binding power, so a symbol can serve as
//! both an operator and an ordinary name (`and`, `or`, `in`).
//!
//! The semantic pass (`process_ast`) flattens `.`-chains into path steps,
//! attaches predicates/grouping/sorting as stages on the owning step, resolves
//! `%` ancestor references against enclosing steps, and rewrites tail-position
//! function calls inside lambda bodies into thunks for the evaluator's
//! trampoline.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use crate::Expression;
use crate::ast::nodes::{GroupPairs, Literal, Node, NodeKind, Slot, SortTerm, Stage};
use crate::ast::operators::BinaryOp;
use crate::ast::raw::{Ast, AstKind, RawSortTerm};
use crate::ast::tokens::TokenKind;
use crate::error::Error;
use crate::lexer::{Lexer, operator_bp};
use crate::signature::Signature;

type NudFn = fn(&mut Parser, Sym) -> Result<Ast, Error>;
type LedFn = fn(&mut Parser, Sym, Ast) -> Result<Ast, Error>;

struct Rule {
    lbp: u8,
    nud: Option<NudFn>,
    led: Option<LedFn>,
}

fn register(
    table: &mut HashMap<&'static str, Rule>,
    id: &'static str,
    bp: u8,
    nud: Option<NudFn>,
    led: Option<LedFn>,
) {
    match table.get_mut(id) {
        Some(existing) => {
            // re-registration keeps the higher binding power
            if bp > existing.lbp {
                existing.lbp = bp;
            }
            if existing.nud.is_none() {
                existing.nud = nud;
            }
            if existing.led.is_none() {
                existing.led = led;
            }
        }
        None => {
            table.insert(id, Rule { lbp: bp, nud, led });
        }
    }
}

/// Binding power of an operator, from the tokenizer's operator table.
fn bp(op: &str) -> u8 {
    operator_bp(op).expect("operator registered in the table")
}

static SYMBOL_TABLE: LazyLock<HashMap<&'static str, Rule>> = LazyLock::new(|| {
    let mut t = HashMap::new();
    // terminals
    register(&mut t, "(end)", 0, Some(terminal_nud), None);
    register(&mut t, "(name)", 0, Some(terminal_nud), None);
    register(&mut t, "(literal)", 0, Some(terminal_nud), None);
    register(&mut t, "(regex)", 0, Some(terminal_nud), None);
    register(&mut t, "(error)", 0, Some(error_nud), None);
    // structural symbols that never start or continue an expression
    register(&mut t, ":", 0, None, None);
    register(&mut t, ";", 0, None, None);
    register(&mut t, ",", 0, None, None);
    register(&mut t, ")", 0, None, None);
    register(&mut t, "]", 0, None, None);
    register(&mut t, "}", 0, None, None);
    register(&mut t, "..", 0, None, None); // range; only valid inside [ ]
    // map operator and arithmetic
    register(&mut t, ".", bp("."), None, Some(dot_led));
    register(&mut t, "+", bp("+"), None, Some(binary_led));
    register(&mut t, "-", bp("-"), Some(minus_nud), Some(binary_led));
    register(&mut t, "*", bp("*"), Some(wildcard_nud), Some(binary_led));
    register(&mut t, "/", bp("/"), None, Some(binary_led));
    register(&mut t, "%", bp("%"), Some(parent_nud), Some(binary_led));
    // comparison and string concatenation
    register(&mut t, "=", bp("="), None, Some(binary_led));
    register(&mut t, "<", bp("<"), None, Some(binary_led));
    register(&mut t, ">", bp(">"), None, Some(binary_led));
    register(&mut t, "!=", bp("!="), None, Some(binary_led));
    register(&mut t, "<=", bp("<="), None, Some(binary_led));
    register(&mut t, ">=", bp(">="), None, Some(binary_led));
    register(&mut t, "&", bp("&"), None, Some(binary_led));
    // keywords usable both as operators and as field names
    register(&mut t, "and", bp("and"), Some(keyword_name_nud), Some(binary_led));
    register(&mut t, "or", bp("or"), Some(keyword_name_nud), Some(binary_led));
    register(&mut t, "in", bp("in"), Some(keyword_name_nud), Some(binary_led));
    // function application
    register(&mut t, "~>", bp("~>"), None, Some(apply_led));
    // descendant wildcard
    register(&mut t, "**", 0, Some(descendant_nud), None); // prefix only
    // function invocation / block expression
    register(&mut t, "(", bp("("), Some(block_nud), Some(call_led));
    // array constructor / predicate
    register(&mut t, "[", bp("["), Some(array_nud), Some(predicate_led));
    // order-by
    register(&mut t, "^", bp("^"), None, Some(orderby_led));
    // object constructor / group-by
    register(&mut t, "{", bp("{"), Some(object_nud), Some(group_led));
    // variable binding (right associative)
    register(&mut t, ":=", bp(":="), None, Some(bind_led));
    // focus and index variable binds
    register(&mut t, "@", bp("@"), None, Some(focus_led));
    register(&mut t, "#", bp("#"), None, Some(index_led));
    // conditionals
    register(&mut t, "?", bp("?"), None, Some(ternary_led));
    register(&mut t, "??", bp("??"), None, Some(coalesce_led));
    register(&mut t, "?:", bp("?:"), None, Some(default_led));
    // object transformer
    register(&mut t, "|", 0, Some(transform_nud), None); // prefix only
    t
});

/// The parser's view of the current token: the symbol-table id it resolves
/// to, its payload, and its left binding power.
#[derive(Clone)]
struct Sym {
    id: String,
    value: Option<TokenKind>, // None at end of input
    position: usize,
    lbp: u8,
}

impl Sym {
    fn text(&self) -> String {
        match &self.value {
            Some(kind) => kind.text(),
            None => "(end)".to_string(),
        }
    }
}

pub struct Parser {
    lexer: Lexer,
    node: Sym,
    source_len: usize,
    recover: bool,
    errors: Vec<Error>,
    ancestor_label: usize,
    slots: Vec<Slot>,
}

/// Parse a source expression into an evaluator-ready [`Expression`].
pub(crate) fn parse_source(source: &str, recover: bool) -> Result<Expression, Error> {
    let source_len = source.chars().count();
    let mut parser = Parser {
        lexer: Lexer::new(source),
        node: Sym {
            id: "(end)".to_string(),
            value: None,
            position: source_len,
            lbp: 0,
        },
        source_len,
        recover,
        errors: Vec::new(),
        ancestor_label: 0,
        slots: Vec::new(),
    };
    parser.advance(None, false)?;
    let raw = parser.expression(0)?;
    if parser.node.id != "(end)" {
        let err = Error::with(
            "S0201",
            Some(parser.node.position),
            vec![parser.node.text()],
        );
        parser.handle_error(err)?;
    }

    let ast = parser.process_ast(raw)?;

    if matches!(ast.kind, NodeKind::Parent { .. }) || !ast.seeking.is_empty() {
        // trying to derive the ancestor at top level
        return Err(Error::with(
            "S0217",
            Some(ast.position),
            vec![ast.kind_name().to_string()],
        ));
    }

    Ok(Expression {
        ast,
        slots: parser.slots,
        errors: parser.errors,
    })
}

impl Parser {
    fn handle_error(&mut self, err: Error) -> Result<Ast, Error> {
        if self.recover {
            let position = err.position.unwrap_or(0);
            self.errors.push(err.clone());
            Ok(Ast::new(AstKind::ParseError(err), position))
        } else {
            Err(err)
        }
    }

    fn handle_error_unit(&mut self, err: Error) -> Result<(), Error> {
        if self.recover {
            self.errors.push(err);
            Ok(())
        } else {
            Err(err)
        }
    }

    /// Move to the next token, optionally checking the current one first.
    /// `infix` tells the lexer whether an infix operator may follow (a `/` in
    /// operand position starts a regex literal instead).
    fn advance(&mut self, expected: Option<&str>, infix: bool) -> Result<(), Error> {
        if let Some(id) = expected
            && self.node.id != id
        {
            let code = if self.node.id == "(end)" {
                "S0203"
            } else {
                "S0202"
            };
            let err = Error::with(
                code,
                Some(self.node.position),
                vec![id.to_string(), self.node.text()],
            );
            return self.handle_error_unit(err);
        }
        let token = self.lexer.next_token(infix)?;
        self.node = match token {
            None => Sym {
                id: "(end)".to_string(),
                value: None,
                position: self.source_len,
                lbp: 0,
            },
            Some(token) => {
                let position = token.position;
                let (id, lbp) = match &token.kind {
                    TokenKind::Name(_) | TokenKind::Variable(_) => ("(name)".to_string(), 0),
                    TokenKind::Str(_)
                    | TokenKind::Integer(_)
                    | TokenKind::Float(_)
                    | TokenKind::Bool(_)
                    | TokenKind::Null => ("(literal)".to_string(), 0),
                    TokenKind::Regex(_) => ("(regex)".to_string(), 0),
                    TokenKind::Operator(op) => match SYMBOL_TABLE.get(op.as_str()) {
                        Some(rule) => (op.clone(), rule.lbp),
                        None => {
                            let err =
                                Error::with("S0204", Some(position), vec![op.clone()]);
                            self.handle_error_unit(err)?;
                            ("(error)".to_string(), 0)
                        }
                    },
                };
                Sym {
                    id,
                    value: Some(token.kind),
                    position,
                    lbp,
                }
            }
        };
        Ok(())
    }

    /// Pratt's algorithm: precedence climbing over the symbol table.
    fn expression(&mut self, rbp: u8) -> Result<Ast, Error> {
        let t = self.node.clone();
        self.advance(None, true)?;
        let mut left = self.nud(t)?;
        while rbp < self.node.lbp {
            let t = self.node.clone();
            self.advance(None, false)?;
            left = self.led(t, left)?;
        }
        Ok(left)
    }

    fn nud(&mut self, t: Sym) -> Result<Ast, Error> {
        match SYMBOL_TABLE.get(t.id.as_str()).and_then(|r| r.nud) {
            Some(nud) => nud(self, t),
            None => {
                let err = Error::with("S0211", Some(t.position), vec![t.text()]);
                self.handle_error(err)
            }
        }
    }

    fn led(&mut self, t: Sym, left: Ast) -> Result<Ast, Error> {
        match SYMBOL_TABLE.get(t.id.as_str()).and_then(|r| r.led) {
            Some(led) => led(self, t, left),
            None => Err(Error::with("S0201", Some(t.position), vec![t.text()])),
        }
    }
}

// ---------------------------------------------------------------------------
// grammar rules
// ---------------------------------------------------------------------------

fn terminal_nud(parser: &mut Parser, t: Sym) -> Result<Ast, Error> {
    let kind = match t.value {
        Some(TokenKind::Name(name)) => AstKind::Name(name),
        Some(TokenKind::Variable(name)) => AstKind::Variable(name),
        Some(TokenKind::Str(s)) => AstKind::Str(s),
        Some(TokenKind::Integer(n)) => AstKind::Int(n),
        Some(TokenKind::Float(n)) => AstKind::Float(n),
        Some(TokenKind::Bool(b)) => AstKind::Bool(b),
        Some(TokenKind::Null) => AstKind::Null,
        Some(TokenKind::Regex(re)) => AstKind::Regex(re),
        Some(TokenKind::Operator(_)) | None => {
            let err = Error::new("S0207", Some(t.position));
            return parser.handle_error(err);
        }
    };
    Ok(Ast::new(kind, t.position))
}

fn error_nud(parser: &mut Parser, t: Sym) -> Result<Ast, Error> {
    let err = Error::with("S0205", Some(t.position), vec![t.text()]);
    parser.handle_error(err)
}

fn keyword_name_nud(_parser: &mut Parser, t: Sym) -> Result<Ast, Error> {
    // `and`/`or`/`in` used as a field name
    Ok(Ast::new(AstKind::Name(t.id), t.position))
}

fn minus_nud(parser: &mut Parser, t: Sym) -> Result<Ast, Error> {
    let operand = parser.expression(70)?;
    Ok(Ast::new(AstKind::Negate(Box::new(operand)), t.position))
}

fn wildcard_nud(_parser: &mut Parser, t: Sym) -> Result<Ast, Error> {
    Ok(Ast::new(AstKind::Wildcard, t.position))
}

fn descendant_nud(_parser: &mut Parser, t: Sym) -> Result<Ast, Error> {
    Ok(Ast::new(AstKind::Descendant, t.position))
}

fn parent_nud(_parser: &mut Parser, t: Sym) -> Result<Ast, Error> {
    Ok(Ast::new(AstKind::Parent, t.position))
}

/// `(` as prefix: block expression, `;`-separated.
fn block_nud(parser: &mut Parser, t: Sym) -> Result<Ast, Error> {
    let mut exprs = Vec::new();
    while parser.node.id != ")" {
        exprs.push(parser.expression(0)?);
        if parser.node.id != ";" {
            break;
        }
        parser.advance(Some(";"), false)?;
    }
    parser.advance(Some(")"), true)?;
    Ok(Ast::new(AstKind::Block(exprs), t.position))
}

/// `[` as prefix: array constructor; `..` range items are only valid here.
fn array_nud(parser: &mut Parser, t: Sym) -> Result<Ast, Error> {
    let mut items = Vec::new();
    if parser.node.id != "]" {
        loop {
            let mut item = parser.expression(0)?;
            if parser.node.id == ".." {
                let position = parser.node.position;
                parser.advance(Some(".."), false)?;
                let rhs = parser.expression(0)?;
                item = Ast::new(
                    AstKind::Binary(BinaryOp::Range, Box::new(item), Box::new(rhs)),
                    position,
                );
            }
            items.push(item);
            if parser.node.id != "," {
                break;
            }
            parser.advance(Some(","), false)?;
        }
    }
    parser.advance(Some("]"), true)?;
    Ok(Ast::new(AstKind::ArrayCtor(items), t.position))
}

fn object_pairs(parser: &mut Parser) -> Result<Vec<(Ast, Ast)>, Error> {
    let mut pairs = Vec::new();
    if parser.node.id != "}" {
        loop {
            let key = parser.expression(0)?;
            parser.advance(Some(":"), false)?;
            let value = parser.expression(0)?;
            pairs.push((key, value));
            if parser.node.id != "," {
                break;
            }
            parser.advance(Some(","), false)?;
        }
    }
    parser.advance(Some("}"), true)?;
    Ok(pairs)
}

/// `{` as prefix: object constructor.
fn object_nud(parser: &mut Parser, t: Sym) -> Result<Ast, Error> {
    let pairs = object_pairs(parser)?;
    Ok(Ast::new(AstKind::ObjectCtor(pairs), t.position))
}

/// `{` as infix: group-by on the preceding step.
fn group_led(parser: &mut Parser, t: Sym, left: Ast) -> Result<Ast, Error> {
    let pairs = object_pairs(parser)?;
    Ok(Ast::new(AstKind::GroupBy(Box::new(left), pairs), t.position))
}

/// `|pattern|update[,delete]|` object transformer.
fn transform_nud(parser: &mut Parser, t: Sym) -> Result<Ast, Error> {
    let pattern = parser.expression(0)?;
    parser.advance(Some("|"), false)?;
    let update = parser.expression(0)?;
    let delete = if parser.node.id == "," {
        parser.advance(Some(","), false)?;
        Some(Box::new(parser.expression(0)?))
    } else {
        None
    };
    parser.advance(Some("|"), false)?;
    Ok(Ast::new(
        AstKind::Transform {
            pattern: Box::new(pattern),
            update: Box::new(update),
            delete,
        },
        t.position,
    ))
}

fn binary_led(parser: &mut Parser, t: Sym, left: Ast) -> Result<Ast, Error> {
    let op = match t.id.as_str() {
        "+" => BinaryOp::Add,
        "-" => BinaryOp::Subtract,
        "*" => BinaryOp::Multiply,
        "/" => BinaryOp::Divide,
        "%" => BinaryOp::Modulo,
        "=" => BinaryOp::Equal,
        "!=" => BinaryOp::NotEqual,
        "<" => BinaryOp::LessThan,
        "<=" => BinaryOp::LessEqual,
        ">" => BinaryOp::GreaterThan,
        ">=" => BinaryOp::GreaterEqual,
        "and" => BinaryOp::And,
        "or" => BinaryOp::Or,
        "in" => BinaryOp::In,
        "&" => BinaryOp::Concat,
        _ => return Err(Error::with("S0201", Some(t.position), vec![t.text()])),
    };
    let rhs = parser.expression(t.lbp)?;
    Ok(Ast::new(
        AstKind::Binary(op, Box::new(left), Box::new(rhs)),
        t.position,
    ))
}

fn dot_led(parser: &mut Parser, t: Sym, left: Ast) -> Result<Ast, Error> {
    let rhs = parser.expression(t.lbp)?;
    Ok(Ast::new(
        AstKind::Path(Box::new(left), Box::new(rhs)),
        t.position,
    ))
}

fn apply_led(parser: &mut Parser, t: Sym, left: Ast) -> Result<Ast, Error> {
    let rhs = parser.expression(t.lbp)?;
    Ok(Ast::new(
        AstKind::Apply(Box::new(left), Box::new(rhs)),
        t.position,
    ))
}

/// Walk through chained predicates to the underlying step and flag it.
fn set_keep_array(ast: &mut Ast) {
    match &mut ast.kind {
        AstKind::Predicate(lhs, _) => set_keep_array(lhs),
        _ => ast.keep_array = true,
    }
}

/// `[` as infix: predicate, or the empty `[]` keep-array marker.
fn predicate_led(parser: &mut Parser, t: Sym, mut left: Ast) -> Result<Ast, Error> {
    if parser.node.id == "]" {
        // empty predicate means maintain singleton arrays in the output
        set_keep_array(&mut left);
        parser.advance(Some("]"), false)?;
        return Ok(left);
    }
    let rhs = parser.expression(0)?;
    parser.advance(Some("]"), true)?;
    Ok(Ast::new(
        AstKind::Predicate(Box::new(left), Box::new(rhs)),
        t.position,
    ))
}

/// `^(<expr>, >expr, ...)` order-by.
fn orderby_led(parser: &mut Parser, t: Sym, left: Ast) -> Result<Ast, Error> {
    parser.advance(Some("("), false)?;
    let mut terms = Vec::new();
    loop {
        let mut descending = false;
        if parser.node.id == "<" {
            parser.advance(Some("<"), false)?;
        } else if parser.node.id == ">" {
            descending = true;
            parser.advance(Some(">"), false)?;
        }
        let expression = parser.expression(0)?;
        terms.push(RawSortTerm {
            expression,
            descending,
        });
        if parser.node.id != "," {
            break;
        }
        parser.advance(Some(","), false)?;
    }
    parser.advance(Some(")"), false)?;
    Ok(Ast::new(
        AstKind::OrderBy(Box::new(left), terms),
        t.position,
    ))
}

/// `:=` variable binding; right associative.
fn bind_led(parser: &mut Parser, t: Sym, left: Ast) -> Result<Ast, Error> {
    if !matches!(left.kind, AstKind::Variable(_)) {
        let err = Error::with("S0212", Some(left.position), vec![]);
        return parser.handle_error(err);
    }
    let rhs = parser.expression(t.lbp - 1)?;
    Ok(Ast::new(
        AstKind::Bind(Box::new(left), Box::new(rhs)),
        t.position,
    ))
}

fn focus_led(parser: &mut Parser, t: Sym, left: Ast) -> Result<Ast, Error> {
    let rhs = parser.expression(t.lbp)?;
    match rhs.kind {
        AstKind::Variable(name) => Ok(Ast::new(
            AstKind::FocusBind(Box::new(left), name),
            t.position,
        )),
        _ => {
            let err = Error::with("S0214", Some(rhs.position), vec!["@".to_string()]);
            parser.handle_error(err)
        }
    }
}

fn index_led(parser: &mut Parser, t: Sym, left: Ast) -> Result<Ast, Error> {
    let rhs = parser.expression(t.lbp)?;
    match rhs.kind {
        AstKind::Variable(name) => Ok(Ast::new(
            AstKind::IndexBind(Box::new(left), name),
            t.position,
        )),
        _ => {
            let err = Error::with("S0214", Some(rhs.position), vec!["#".to_string()]);
            parser.handle_error(err)
        }
    }
}

/// `? :` ternary conditional.
fn ternary_led(parser: &mut Parser, t: Sym, left: Ast) -> Result<Ast, Error> {
    let then = parser.expression(0)?;
    let otherwise = if parser.node.id == ":" {
        parser.advance(Some(":"), false)?;
        Some(Box::new(parser.expression(0)?))
    } else {
        None
    };
    Ok(Ast::new(
        AstKind::Condition {
            condition: Box::new(left),
            then: Box::new(then),
            otherwise,
        },
        t.position,
    ))
}

/// `??` coalesce: `lhs ?? rhs` parses as `$exists(lhs) ? lhs : rhs`.
fn coalesce_led(parser: &mut Parser, t: Sym, left: Ast) -> Result<Ast, Error> {
    let exists = Ast::new(
        AstKind::FunctionCall {
            procedure: Box::new(Ast::new(
                AstKind::Variable("exists".to_string()),
                t.position,
            )),
            args: vec![left.clone()],
            is_partial: false,
        },
        t.position,
    );
    let otherwise = parser.expression(0)?;
    Ok(Ast::new(
        AstKind::Condition {
            condition: Box::new(exists),
            then: Box::new(left),
            otherwise: Some(Box::new(otherwise)),
        },
        t.position,
    ))
}

/// `?:` default: the left side is both the test and the consequent.
fn default_led(parser: &mut Parser, t: Sym, left: Ast) -> Result<Ast, Error> {
    let otherwise = parser.expression(0)?;
    Ok(Ast::new(
        AstKind::Condition {
            condition: Box::new(left.clone()),
            then: Box::new(left),
            otherwise: Some(Box::new(otherwise)),
        },
        t.position,
    ))
}

/// `(` as infix: function invocation, possibly a lambda definition when the
/// left side is the `function` (or `λ`) keyword.
fn call_led(parser: &mut Parser, t: Sym, left: Ast) -> Result<Ast, Error> {
    let mut args = Vec::new();
    let mut is_partial = false;
    if parser.node.id != ")" {
        loop {
            if parser.node.id == "?" {
                // partial application placeholder
                is_partial = true;
                args.push(Ast::new(AstKind::Placeholder, parser.node.position));
                parser.advance(Some("?"), false)?;
            } else {
                args.push(parser.expression(0)?);
            }
            if parser.node.id != "," {
                break;
            }
            parser.advance(Some(","), false)?;
        }
    }
    parser.advance(Some(")"), true)?;

    let is_lambda_def = matches!(&left.kind, AstKind::Name(n) if n == "function" || n == "\u{03bb}");
    if !is_lambda_def {
        return Ok(Ast::new(
            AstKind::FunctionCall {
                procedure: Box::new(left),
                args,
                is_partial,
            },
            t.position,
        ));
    }

    // all of the parameters must be variable tokens
    let mut params = Vec::new();
    for arg in &args {
        match &arg.kind {
            AstKind::Variable(name) => params.push(name.clone()),
            _ => {
                let err = Error::with(
                    "S0208",
                    Some(arg.position),
                    vec![(params.len() + 1).to_string()],
                );
                return parser.handle_error(err);
            }
        }
    }

    // optional signature between angle brackets
    let mut signature = None;
    if parser.node.id == "<" {
        let mut depth = 1;
        let mut sig = String::from("<");
        while depth > 0 && parser.node.id != "{" && parser.node.id != "(end)" {
            parser.advance(None, false)?;
            if parser.node.id == ">" {
                depth -= 1;
            } else if parser.node.id == "<" {
                depth += 1;
            }
            sig.push_str(&parser.node.text());
        }
        parser.advance(Some(">"), false)?;
        signature = Some(Signature::new(&sig, "lambda")?);
    }

    parser.advance(Some("{"), false)?;
    let body = parser.expression(0)?;
    parser.advance(Some("}"), false)?;
    Ok(Ast::new(
        AstKind::Lambda {
            params,
            body: Box::new(body),
            signature,
        },
        t.position,
    ))
}

// ---------------------------------------------------------------------------
// semantic pass
// ---------------------------------------------------------------------------

/// Collect the ancestor slots a processed child is still seeking, so the
/// enclosing node keeps looking for them.
fn gather_ancestry(target: &mut Vec<usize>, child: &Node) {
    if !child.seeking.is_empty() || matches!(child.kind, NodeKind::Parent { .. }) {
        target.extend(child.seeking.iter().copied());
        if let NodeKind::Parent { slot } = child.kind {
            target.push(slot);
        }
    }
}

impl Parser {
    /// Rewrite the raw parse tree into the evaluator-ready form. Flattens
    /// location paths, attaches predicates and grouping as stages, resolves
    /// ancestry, and thunks tail calls in lambda bodies.
    fn process_ast(&mut self, expr: Ast) -> Result<Node, Error> {
        let position = expr.position;
        let keep = expr.keep_array;
        let mut result = match expr.kind {
            AstKind::Str(s) => Node::new(NodeKind::Literal(Literal::Str(s)), position),
            AstKind::Int(n) => Node::new(NodeKind::Literal(Literal::Integer(n)), position),
            AstKind::Float(n) => Node::new(NodeKind::Literal(Literal::Float(n)), position),
            AstKind::Bool(b) => Node::new(NodeKind::Literal(Literal::Bool(b)), position),
            AstKind::Null => Node::new(NodeKind::Literal(Literal::Null), position),
            AstKind::Variable(name) => Node::new(NodeKind::Variable(name), position),
            AstKind::Regex(re) => Node::new(NodeKind::Regex(re), position),
            AstKind::Wildcard => Node::new(NodeKind::Wildcard, position),
            AstKind::Descendant => Node::new(NodeKind::Descendant, position),
            AstKind::Placeholder => Node::new(NodeKind::Placeholder, position),

            AstKind::Name(name) => {
                // a bare name is a single-step path
                let mut step = Node::new(NodeKind::Name(name), position);
                step.keep_array = keep;
                let mut path = Node::new(
                    NodeKind::Path {
                        steps: vec![step],
                        keep_singleton_array: keep,
                    },
                    position,
                );
                path.keep_array = keep;
                path
            }

            AstKind::Parent => {
                let slot_index = self.slots.len();
                self.slots.push(Slot {
                    label: format!("!{}", self.ancestor_label),
                    level: 1,
                    index: slot_index,
                });
                self.ancestor_label += 1;
                Node::new(NodeKind::Parent { slot: slot_index }, position)
            }

            AstKind::Negate(inner) => {
                let inner = self.process_ast(*inner)?;
                match &inner.kind {
                    // fold negation of a numeric literal
                    NodeKind::Literal(Literal::Integer(n)) => {
                        Node::new(NodeKind::Literal(Literal::Integer(-n)), position)
                    }
                    NodeKind::Literal(Literal::Float(n)) => {
                        Node::new(NodeKind::Literal(Literal::Float(-n)), position)
                    }
                    _ => {
                        let mut seeking = Vec::new();
                        gather_ancestry(&mut seeking, &inner);
                        let mut node =
                            Node::new(NodeKind::Negate(Box::new(inner)), position);
                        node.seeking = seeking;
                        node
                    }
                }
            }

            AstKind::ArrayCtor(items) => {
                let mut seeking = Vec::new();
                let mut exprs = Vec::with_capacity(items.len());
                for item in items {
                    let node = self.process_ast(item)?;
                    gather_ancestry(&mut seeking, &node);
                    exprs.push(node);
                }
                let mut node = Node::new(NodeKind::ArrayCtor { exprs }, position);
                node.seeking = seeking;
                node
            }

            AstKind::ObjectCtor(raw_pairs) => {
                let mut seeking = Vec::new();
                let mut pairs = Vec::with_capacity(raw_pairs.len());
                for (k, v) in raw_pairs {
                    let k = self.process_ast(k)?;
                    gather_ancestry(&mut seeking, &k);
                    let v = self.process_ast(v)?;
                    gather_ancestry(&mut seeking, &v);
                    pairs.push((k, v));
                }
                let mut node =
                    Node::new(NodeKind::ObjectCtor(GroupPairs { pairs, position }), position);
                node.seeking = seeking;
                node
            }

            AstKind::Block(items) => {
                let mut seeking = Vec::new();
                let mut cons = false;
                let mut exprs = Vec::with_capacity(items.len());
                for item in items {
                    let part = self.process_ast(item)?;
                    gather_ancestry(&mut seeking, &part);
                    if part.cons {
                        cons = true;
                    } else if let NodeKind::Path { steps, .. } = &part.kind
                        && steps.first().map(|s| s.cons).unwrap_or(false)
                    {
                        cons = true;
                    }
                    exprs.push(part);
                }
                let mut node = Node::new(NodeKind::Block { exprs }, position);
                node.seeking = seeking;
                node.cons = cons;
                node
            }

            AstKind::Transform {
                pattern,
                update,
                delete,
            } => {
                let pattern = self.process_ast(*pattern)?;
                let update = self.process_ast(*update)?;
                let delete = match delete {
                    Some(d) => Some(Arc::new(self.process_ast(*d)?)),
                    None => None,
                };
                Node::new(
                    NodeKind::Transform {
                        pattern: Arc::new(pattern),
                        update: Arc::new(update),
                        delete,
                    },
                    position,
                )
            }

            AstKind::Condition {
                condition,
                then,
                otherwise,
            } => {
                let mut seeking = Vec::new();
                let condition = self.process_ast(*condition)?;
                gather_ancestry(&mut seeking, &condition);
                let then = self.process_ast(*then)?;
                gather_ancestry(&mut seeking, &then);
                let otherwise = match otherwise {
                    Some(e) => {
                        let e = self.process_ast(*e)?;
                        gather_ancestry(&mut seeking, &e);
                        Some(Box::new(e))
                    }
                    None => None,
                };
                let mut node = Node::new(
                    NodeKind::Condition {
                        condition: Box::new(condition),
                        then: Box::new(then),
                        otherwise,
                    },
                    position,
                );
                node.seeking = seeking;
                node
            }

            AstKind::FunctionCall {
                procedure,
                args,
                is_partial,
            } => {
                let mut seeking = Vec::new();
                let mut processed_args = Vec::with_capacity(args.len());
                for arg in args {
                    let arg = self.process_ast(arg)?;
                    gather_ancestry(&mut seeking, &arg);
                    processed_args.push(arg);
                }
                let procedure = Box::new(self.process_ast(*procedure)?);
                let kind = if is_partial {
                    NodeKind::PartialCall {
                        procedure,
                        args: processed_args,
                    }
                } else {
                    NodeKind::FunctionCall {
                        procedure,
                        args: processed_args,
                    }
                };
                let mut node = Node::new(kind, position);
                node.seeking = seeking;
                node
            }

            AstKind::Lambda {
                params,
                body,
                signature,
            } => {
                let body = self.process_ast(*body)?;
                let body = tail_call_optimize(body);
                Node::new(
                    NodeKind::Lambda {
                        params: Arc::new(params),
                        body: Arc::new(body),
                        signature: signature.map(Arc::new),
                        thunk: false,
                    },
                    position,
                )
            }

            AstKind::Bind(lhs, rhs) => {
                let name = match lhs.kind {
                    AstKind::Variable(name) => name,
                    _ => return Err(Error::new("S0212", Some(lhs.position))),
                };
                let rhs = self.process_ast(*rhs)?;
                let mut seeking = Vec::new();
                gather_ancestry(&mut seeking, &rhs);
                let mut node = Node::new(
                    NodeKind::Bind {
                        name,
                        rhs: Box::new(rhs),
                    },
                    position,
                );
                node.seeking = seeking;
                node
            }

            AstKind::Apply(lhs, rhs) => {
                let lhs = self.process_ast(*lhs)?;
                let rhs = self.process_ast(*rhs)?;
                let keep_array = lhs.keep_array || rhs.keep_array;
                let mut node = Node::new(
                    NodeKind::Apply {
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                    position,
                );
                node.keep_array = keep_array;
                node
            }

            AstKind::Binary(op, lhs, rhs) => {
                let lhs = self.process_ast(*lhs)?;
                let rhs = self.process_ast(*rhs)?;
                let mut seeking = Vec::new();
                gather_ancestry(&mut seeking, &lhs);
                gather_ancestry(&mut seeking, &rhs);
                let mut node = Node::new(
                    NodeKind::Binary {
                        op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                    position,
                );
                node.seeking = seeking;
                node
            }

            AstKind::Path(lhs, rhs) => self.process_path(*lhs, *rhs, position)?,
            AstKind::Predicate(lhs, rhs) => {
                self.process_predicate(*lhs, *rhs, position, keep)?
            }
            AstKind::GroupBy(lhs, pairs) => self.process_group(*lhs, pairs, position)?,
            AstKind::OrderBy(lhs, terms) => self.process_order_by(*lhs, terms, position)?,
            AstKind::FocusBind(lhs, var) => {
                self.process_focus_bind(*lhs, var, position, keep)?
            }
            AstKind::IndexBind(lhs, var) => self.process_index_bind(*lhs, var)?,

            AstKind::ParseError(error) => Node::new(NodeKind::Error { error }, position),
        };
        if keep {
            result.keep_array = true;
        }
        Ok(result)
    }

    /// `.` : flatten into a single path node with an ordered list of steps.
    fn process_path(&mut self, lhs: Ast, rhs: Ast, position: usize) -> Result<Node, Error> {
        let lstep = self.process_ast(lhs)?;
        let lstep_parent_slot = match lstep.kind {
            NodeKind::Parent { slot } => Some(slot),
            _ => None,
        };
        let mut result = if lstep.is_path() {
            lstep
        } else {
            let lstep_position = lstep.position;
            let mut path = Node::new(
                NodeKind::Path {
                    steps: vec![lstep],
                    keep_singleton_array: false,
                },
                lstep_position,
            );
            if let Some(slot) = lstep_parent_slot {
                path.seeking = vec![slot];
            }
            path
        };

        let rest = self.process_ast(rhs)?;
        {
            let NodeKind::Path {
                steps,
                keep_singleton_array,
            } = &mut result.kind
            else {
                unreachable!("path node");
            };
            match rest {
                Node {
                    kind: NodeKind::Path {
                        steps: rest_steps, ..
                    },
                    ..
                } => steps.extend(rest_steps),
                mut rest => {
                    if let Some(predicates) = rest.predicates.take() {
                        rest.stages = Some(
                            predicates
                                .into_iter()
                                .map(|p| Stage::Filter(Box::new(p)))
                                .collect(),
                        );
                    }
                    steps.push(rest);
                }
            }

            for step in steps.iter_mut() {
                match &step.kind {
                    // steps can't be numbers or the values true/false/null
                    NodeKind::Literal(
                        lit @ (Literal::Integer(_)
                        | Literal::Float(_)
                        | Literal::Bool(_)
                        | Literal::Null),
                    ) => {
                        return Err(Error::with(
                            "S0213",
                            Some(step.position),
                            vec![lit.describe()],
                        ));
                    }
                    // dotted string literals are field names
                    NodeKind::Literal(Literal::Str(s)) => {
                        step.kind = NodeKind::Name(s.clone());
                    }
                    _ => {}
                }
            }

            if steps.iter().any(|s| s.keep_array) {
                *keep_singleton_array = true;
            }
            // an array constructor as first step is evaluated once, not
            // iterated over the context; as last step its result isn't
            // flattened into the surrounding sequence
            if let Some(first) = steps.first_mut()
                && matches!(first.kind, NodeKind::ArrayCtor { .. })
            {
                first.cons = true;
            }
            if let Some(last) = steps.last_mut()
                && matches!(last.kind, NodeKind::ArrayCtor { .. })
            {
                last.cons = true;
            }
        }
        result.position = position;
        self.resolve_ancestry(&mut result)?;
        Ok(result)
    }

    /// `[` as infix: a predicate on the path's last step, or on the bare
    /// expression when there is no path yet.
    fn process_predicate(
        &mut self,
        lhs: Ast,
        rhs: Ast,
        position: usize,
        keep: bool,
    ) -> Result<Node, Error> {
        let mut result = self.process_ast(lhs)?;
        let predicate = self.process_ast(rhs)?;
        let is_path = result.is_path();
        let step: &mut Node = if is_path {
            match &mut result.kind {
                NodeKind::Path { steps, .. } => steps.last_mut().expect("non-empty path"),
                _ => unreachable!(),
            }
        } else {
            &mut result
        };

        if step.group.is_some() {
            return Err(Error::new("S0209", Some(position)));
        }
        if !predicate.seeking.is_empty() {
            for slot in predicate.seeking.clone() {
                if self.slots[slot].level == 1 {
                    self.seek_parent(step, slot)?;
                } else {
                    self.slots[slot].level -= 1;
                }
            }
            gather_ancestry(&mut step.seeking, &predicate);
        }
        if keep {
            step.keep_array = true;
        }
        if is_path {
            step.stages
                .get_or_insert_with(Vec::new)
                .push(Stage::Filter(Box::new(predicate)));
        } else {
            step.predicates.get_or_insert_with(Vec::new).push(predicate);
        }
        Ok(result)
    }

    /// `{` as infix: group-by attached to the expression or path.
    fn process_group(
        &mut self,
        lhs: Ast,
        raw_pairs: Vec<(Ast, Ast)>,
        position: usize,
    ) -> Result<Node, Error> {
        let mut result = self.process_ast(lhs)?;
        if result.group.is_some() {
            return Err(Error::new("S0210", Some(position)));
        }
        let mut pairs = Vec::with_capacity(raw_pairs.len());
        for (k, v) in raw_pairs {
            pairs.push((self.process_ast(k)?, self.process_ast(v)?));
        }
        result.group = Some(GroupPairs { pairs, position });
        Ok(result)
    }

    /// `^(...)`: append a sort step, wrapping the left side in a path first.
    fn process_order_by(
        &mut self,
        lhs: Ast,
        raw_terms: Vec<RawSortTerm>,
        position: usize,
    ) -> Result<Node, Error> {
        let mut result = self.process_ast(lhs)?;
        if !result.is_path() {
            let inner_position = result.position;
            result = Node::new(
                NodeKind::Path {
                    steps: vec![result],
                    keep_singleton_array: false,
                },
                inner_position,
            );
        }
        let mut seeking = Vec::new();
        let mut terms = Vec::with_capacity(raw_terms.len());
        for term in raw_terms {
            let expression = self.process_ast(term.expression)?;
            gather_ancestry(&mut seeking, &expression);
            terms.push(SortTerm {
                expression,
                descending: term.descending,
            });
        }
        let mut sort_step = Node::new(NodeKind::Sort { terms }, position);
        sort_step.seeking = seeking;
        if let NodeKind::Path { steps, .. } = &mut result.kind {
            steps.push(sort_step);
        }
        self.resolve_ancestry(&mut result)?;
        Ok(result)
    }

    /// `@$var`: bind the focus of the step. Clause order matters: predicates
    /// and order-by must come after the bind.
    fn process_focus_bind(
        &mut self,
        lhs: Ast,
        var: String,
        position: usize,
        keep: bool,
    ) -> Result<Node, Error> {
        let mut result = self.process_ast(lhs)?;
        let step: &mut Node = if result.is_path() {
            match &mut result.kind {
                NodeKind::Path { steps, .. } => steps.last_mut().expect("non-empty path"),
                _ => unreachable!(),
            }
        } else {
            &mut result
        };
        if step.stages.is_some() || step.predicates.is_some() {
            return Err(Error::new("S0215", Some(position)));
        }
        if matches!(step.kind, NodeKind::Sort { .. }) {
            return Err(Error::new("S0216", Some(position)));
        }
        if keep {
            step.keep_array = true;
        }
        step.focus = Some(var);
        step.tuple = true;
        Ok(result)
    }

    /// `#$var`: bind the running index of the step.
    fn process_index_bind(&mut self, lhs: Ast, var: String) -> Result<Node, Error> {
        let mut result = self.process_ast(lhs)?;
        if !result.is_path() {
            let inner_position = result.position;
            let mut inner = result;
            if let Some(predicates) = inner.predicates.take() {
                inner.stages = Some(
                    predicates
                        .into_iter()
                        .map(|p| Stage::Filter(Box::new(p)))
                        .collect(),
                );
            }
            result = Node::new(
                NodeKind::Path {
                    steps: vec![inner],
                    keep_singleton_array: false,
                },
                inner_position,
            );
        }
        let NodeKind::Path { steps, .. } = &mut result.kind else {
            unreachable!();
        };
        let step = steps.last_mut().expect("non-empty path");
        if step.stages.is_none() {
            step.index = Some(var);
        } else {
            step.stages
                .as_mut()
                .expect("checked above")
                .push(Stage::Index(var));
        }
        step.tuple = true;
        Ok(result)
    }

    /// Walk backwards from the last step of a path, resolving each ancestor
    /// slot it is seeking by decrementing the slot's level per step (skipping
    /// contiguous focus-bound steps). Slots that cannot be resolved within
    /// this path propagate on the path node itself.
    fn resolve_ancestry(&mut self, path: &mut Node) -> Result<(), Error> {
        let NodeKind::Path { steps, .. } = &mut path.kind else {
            return Ok(());
        };
        let last_index = steps.len() - 1;
        let mut slots_to_resolve: Vec<usize> = steps[last_index].seeking.clone();
        if let NodeKind::Parent { slot } = steps[last_index].kind {
            slots_to_resolve.push(slot);
        }
        for slot in slots_to_resolve {
            let mut index = steps.len() as isize - 2;
            while self.slots[slot].level > 0 {
                if index < 0 {
                    path.seeking.push(slot);
                    break;
                }
                let mut chosen = index as usize;
                index -= 1;
                // multiple contiguous steps that bind the focus are skipped
                while index >= 0
                    && steps[chosen].focus.is_some()
                    && steps[index as usize].focus.is_some()
                {
                    chosen = index as usize;
                    index -= 1;
                }
                self.seek_parent(&mut steps[chosen], slot)?;
            }
        }
        Ok(())
    }

    /// Resolve one slot against one step (or a nested node within it),
    /// decrementing the slot's level until the owning step is found.
    fn seek_parent(&mut self, node: &mut Node, slot: usize) -> Result<(), Error> {
        match &mut node.kind {
            NodeKind::Name(_) | NodeKind::Wildcard => {
                self.slots[slot].level -= 1;
                if self.slots[slot].level == 0 {
                    match node.ancestor {
                        None => node.ancestor = Some(slot),
                        Some(existing) => {
                            // reuse the established label
                            self.slots[slot].label = self.slots[existing].label.clone();
                            node.ancestor = Some(slot);
                        }
                    }
                    node.tuple = true;
                }
                Ok(())
            }
            NodeKind::Parent { .. } => {
                self.slots[slot].level += 1;
                Ok(())
            }
            NodeKind::Block { exprs } => {
                // look in the last expression in the block
                node.tuple = true;
                if let Some(last) = exprs.last_mut() {
                    self.seek_parent(last, slot)?;
                }
                Ok(())
            }
            NodeKind::Path { steps, .. } => {
                node.tuple = true;
                let mut index = steps.len() - 1;
                self.seek_parent(&mut steps[index], slot)?;
                while self.slots[slot].level > 0 && index > 0 {
                    index -= 1;
                    self.seek_parent(&mut steps[index], slot)?;
                }
                Ok(())
            }
            _ => {
                // the ancestor can't be derived from this construct
                Err(Error::with(
                    "S0217",
                    Some(node.position),
                    vec![node.kind_name().to_string()],
                ))
            }
        }
    }
}

/// Replace a tail-position function call with a thunk to be consumed by the
/// evaluator's trampoline. Applied to lambda bodies: the last expression of a
/// block and both branches of a conditional are tail positions.
fn tail_call_optimize(expr: Node) -> Node {
    match expr.kind {
        NodeKind::FunctionCall { .. } if expr.predicates.is_none() => {
            let position = expr.position;
            Node::new(
                NodeKind::Lambda {
                    params: Arc::new(Vec::new()),
                    body: Arc::new(expr),
                    signature: None,
                    thunk: true,
                },
                position,
            )
        }
        NodeKind::Condition {
            condition,
            then,
            otherwise,
        } => {
            let mut node = Node::new(
                NodeKind::Condition {
                    condition,
                    then: Box::new(tail_call_optimize(*then)),
                    otherwise: otherwise.map(|e| Box::new(tail_call_optimize(*e))),
                },
                expr.position,
            );
            node.keep_array = expr.keep_array;
            node.predicates = expr.predicates;
            node.group = expr.group;
            node.seeking = expr.seeking;
            node
        }
        NodeKind::Block { mut exprs } => {
            if let Some(last) = exprs.pop() {
                exprs.push(tail_call_optimize(last));
            }
            let mut node = Node::new(NodeKind::Block { exprs }, expr.position);
            node.keep_array = expr.keep_array;
            node.cons = expr.cons;
            node.predicates = expr.predicates;
            node.group = expr.group;
            node.seeking = expr.seeking;
            node
        }
        _ => expr,
    }
}
