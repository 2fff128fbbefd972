//! Tokenizer for tansy expressions.
//!
//! Produces one [`Token`] at a time. The caller indicates whether the next
//! token may be an infix operator: when an operand is expected instead, a `/`
//! begins a regex literal rather than division. This is the only context
//! sensitivity in the lexical grammar.

use std::sync::Arc;

use regex::Regex;

use crate::ast::tokens::{Token, TokenKind};
use crate::error::Error;

/// Operator table with left binding powers. This is the grammar's source of
/// truth for precedence; symbols with binding power 0 never act as infix.
pub(crate) const OPERATORS: &[(&str, u8)] = &[
    (".", 75),
    ("[", 80),
    ("]", 0),
    ("{", 70),
    ("}", 0),
    ("(", 80),
    (")", 0),
    (",", 0),
    ("@", 80),
    ("#", 80),
    (";", 80),
    (":", 80),
    ("?", 20),
    ("+", 50),
    ("-", 50),
    ("*", 60),
    ("/", 60),
    ("%", 60),
    ("|", 20),
    ("=", 40),
    ("<", 40),
    (">", 40),
    ("^", 40),
    ("**", 60),
    ("..", 20),
    (":=", 10),
    ("!=", 40),
    ("<=", 40),
    (">=", 40),
    ("~>", 40),
    ("??", 40),
    ("?:", 40),
    ("and", 30),
    ("or", 25),
    ("in", 40),
    ("&", 50),
    ("!", 0),
    ("~", 0),
];

pub(crate) fn operator_bp(op: &str) -> Option<u8> {
    OPERATORS.iter().find(|(id, _)| *id == op).map(|(_, bp)| *bp)
}

pub struct Lexer {
    input: Vec<char>,
    position: usize,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Lexer {
            input: input.chars().collect(),
            position: 0,
        }
    }

    fn current_char(&self) -> Option<char> {
        self.input.get(self.position).copied()
    }

    fn peek_char(&self, offset: usize) -> Option<char> {
        self.input.get(self.position + offset).copied()
    }

    fn advance(&mut self) {
        self.position += 1;
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<(), Error> {
        loop {
            while self.current_char().is_some_and(|c| c.is_whitespace()) {
                self.advance();
            }
            if self.current_char() == Some('/') && self.peek_char(1) == Some('*') {
                let start = self.position;
                self.advance();
                self.advance();
                loop {
                    match self.current_char() {
                        None => return Err(Error::new("S0106", Some(start))),
                        Some('*') if self.peek_char(1) == Some('/') => {
                            self.advance();
                            self.advance();
                            break;
                        }
                        Some(_) => self.advance(),
                    }
                }
            } else {
                return Ok(());
            }
        }
    }

    fn read_identifier(&mut self) -> String {
        let mut result = String::new();
        while let Some(ch) = self.current_char() {
            if ch.is_alphanumeric() || ch == '_' {
                result.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        result
    }

    fn read_unicode_escape(&mut self, start: usize) -> Result<u32, Error> {
        let mut hex = String::new();
        for _ in 0..4 {
            match self.current_char() {
                Some(h) if h.is_ascii_hexdigit() => {
                    hex.push(h);
                    self.advance();
                }
                _ => return Err(Error::new("S0104", Some(start))),
            }
        }
        Ok(u32::from_str_radix(&hex, 16).expect("validated hex digits"))
    }

    fn read_string(&mut self, quote: char) -> Result<String, Error> {
        let start = self.position;
        let mut result = String::new();
        self.advance(); // opening quote

        loop {
            match self.current_char() {
                None => return Err(Error::new("S0101", Some(start))),
                Some(c) if c == quote => {
                    self.advance();
                    return Ok(result);
                }
                Some('\\') => {
                    let escape_start = self.position;
                    self.advance();
                    match self.current_char() {
                        Some('"') => result.push('"'),
                        Some('\'') => result.push('\''),
                        Some('\\') => result.push('\\'),
                        Some('/') => result.push('/'),
                        Some('b') => result.push('\u{0008}'),
                        Some('f') => result.push('\u{000C}'),
                        Some('n') => result.push('\n'),
                        Some('r') => result.push('\r'),
                        Some('t') => result.push('\t'),
                        Some('u') => {
                            self.advance();
                            let code = self.read_unicode_escape(escape_start)?;
                            if (0xD800..=0xDBFF).contains(&code) {
                                // high surrogate: a \uXXXX low surrogate must follow
                                if self.current_char() != Some('\\')
                                    || self.peek_char(1) != Some('u')
                                {
                                    return Err(Error::new("S0104", Some(escape_start)));
                                }
                                self.advance();
                                self.advance();
                                let low = self.read_unicode_escape(escape_start)?;
                                if !(0xDC00..=0xDFFF).contains(&low) {
                                    return Err(Error::new("S0104", Some(escape_start)));
                                }
                                let combined =
                                    0x10000 + ((code - 0xD800) << 10) + (low - 0xDC00);
                                match char::from_u32(combined) {
                                    Some(ch) => result.push(ch),
                                    None => return Err(Error::new("S0104", Some(escape_start))),
                                }
                            } else {
                                match char::from_u32(code) {
                                    Some(ch) => result.push(ch),
                                    None => return Err(Error::new("S0104", Some(escape_start))),
                                }
                            }
                            continue; // already past the escape
                        }
                        Some(ch) => {
                            return Err(Error::with(
                                "S0103",
                                Some(escape_start),
                                vec![ch.to_string()],
                            ));
                        }
                        None => return Err(Error::new("S0101", Some(start))),
                    }
                    self.advance();
                }
                Some(ch) => {
                    result.push(ch);
                    self.advance();
                }
            }
        }
    }

    fn read_digits(&mut self, text: &mut String) {
        while let Some(ch) = self.current_char() {
            if !ch.is_ascii_digit() {
                break;
            }
            text.push(ch);
            self.advance();
        }
    }

    fn read_number(&mut self) -> Result<TokenKind, Error> {
        let start = self.position;
        let mut text = String::new();
        let mut is_float = false;

        self.read_digits(&mut text);
        if self.current_char() == Some('.')
            && self.peek_char(1).is_some_and(|c| c.is_ascii_digit())
        {
            is_float = true;
            text.push('.');
            self.advance();
            self.read_digits(&mut text);
        }
        if let Some(e @ ('e' | 'E')) = self.current_char() {
            // exponent only when followed by digits (optionally signed)
            let sign_offset = usize::from(matches!(self.peek_char(1), Some('+') | Some('-')));
            if self
                .peek_char(1 + sign_offset)
                .is_some_and(|c| c.is_ascii_digit())
            {
                is_float = true;
                text.push(e);
                self.advance();
                if let Some(sign @ ('+' | '-')) = self.current_char() {
                    text.push(sign);
                    self.advance();
                }
                self.read_digits(&mut text);
            }
        }

        if is_float {
            let value: f64 = text
                .parse()
                .map_err(|_| Error::with("S0102", Some(start), vec![text.clone()]))?;
            if !value.is_finite() {
                return Err(Error::with("S0102", Some(start), vec![text]));
            }
            Ok(TokenKind::Float(value))
        } else {
            match text.parse::<i64>() {
                Ok(value) => Ok(TokenKind::Integer(value)),
                // too large for i64: keep it as a float if possible
                Err(_) => {
                    let value: f64 = text
                        .parse()
                        .map_err(|_| Error::with("S0102", Some(start), vec![text.clone()]))?;
                    if !value.is_finite() {
                        return Err(Error::with("S0102", Some(start), vec![text]));
                    }
                    Ok(TokenKind::Float(value))
                }
            }
        }
    }

    fn read_backquote_name(&mut self) -> Result<String, Error> {
        let start = self.position;
        self.advance(); // opening backquote
        let mut name = String::new();
        while let Some(ch) = self.current_char() {
            if ch == '`' {
                self.advance();
                return Ok(name);
            }
            name.push(ch);
            self.advance();
        }
        Err(Error::new("S0105", Some(start)))
    }

    fn read_regex(&mut self) -> Result<TokenKind, Error> {
        let start = self.position;
        self.advance(); // opening slash
        let mut pattern = String::new();
        let mut in_class = false;
        loop {
            match self.current_char() {
                None => return Err(Error::new("S0302", Some(start))),
                Some('\\') => {
                    pattern.push('\\');
                    self.advance();
                    match self.current_char() {
                        Some(ch) => {
                            pattern.push(ch);
                            self.advance();
                        }
                        None => return Err(Error::new("S0302", Some(start))),
                    }
                }
                Some('[') => {
                    in_class = true;
                    pattern.push('[');
                    self.advance();
                }
                Some(']') => {
                    in_class = false;
                    pattern.push(']');
                    self.advance();
                }
                Some('/') if !in_class => {
                    self.advance();
                    break;
                }
                Some(ch) => {
                    pattern.push(ch);
                    self.advance();
                }
            }
        }
        if pattern.is_empty() {
            return Err(Error::new("S0301", Some(start)));
        }
        let mut flags = String::new();
        while let Some(ch) = self.current_char() {
            if ch.is_ascii_alphabetic() {
                flags.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        let full = if flags.is_empty() {
            pattern.clone()
        } else {
            format!("(?{}){}", flags, pattern)
        };
        let compiled = Regex::new(&full)
            .map_err(|e| Error::with("S0303", Some(start), vec![e.to_string()]))?;
        Ok(TokenKind::Regex(Arc::new(compiled)))
    }

    /// Read the next token. `infix` is true when an infix operator may follow;
    /// when false, a `/` starts a regex literal. Returns `None` at end of input.
    pub fn next_token(&mut self, infix: bool) -> Result<Option<Token>, Error> {
        self.skip_whitespace_and_comments()?;

        let position = self.position;
        let token = |kind| Ok(Some(Token { kind, position }));

        let ch = match self.current_char() {
            None => return Ok(None),
            Some(ch) => ch,
        };

        // regex literal when an operand is expected
        if ch == '/' && !infix {
            return token(self.read_regex()?);
        }

        // two-character operators
        if let Some(next) = self.peek_char(1) {
            let pair: String = [ch, next].iter().collect();
            if matches!(
                pair.as_str(),
                "**" | ".." | ":=" | "!=" | "<=" | ">=" | "~>" | "??" | "?:"
            ) {
                self.advance();
                self.advance();
                return token(TokenKind::Operator(pair));
            }
        }

        if ".[]{}()@#;,:?+-*/%|=<>^&!~".contains(ch) {
            self.advance();
            return token(TokenKind::Operator(ch.to_string()));
        }

        match ch {
            '"' | '\'' => {
                let s = self.read_string(ch)?;
                token(TokenKind::Str(s))
            }
            '`' => {
                let name = self.read_backquote_name()?;
                token(TokenKind::Name(name))
            }
            '$' => {
                self.advance();
                // `$$` is the root variable, named "$"
                let name = if self.current_char() == Some('$') {
                    self.advance();
                    "$".to_string()
                } else {
                    self.read_identifier()
                };
                token(TokenKind::Variable(name))
            }
            c if c.is_ascii_digit() => {
                let kind = self.read_number()?;
                token(kind)
            }
            c if c.is_alphabetic() || c == '_' => {
                let ident = self.read_identifier();
                match ident.as_str() {
                    "true" => token(TokenKind::Bool(true)),
                    "false" => token(TokenKind::Bool(false)),
                    "null" => token(TokenKind::Null),
                    "and" | "or" | "in" => token(TokenKind::Operator(ident)),
                    _ => token(TokenKind::Name(ident)),
                }
            }
            c => Err(Error::with("S0204", Some(position), vec![c.to_string()])),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(source);
        let mut out = Vec::new();
        while let Some(token) = lexer.next_token(true).unwrap() {
            out.push(token.kind);
        }
        out
    }

    #[test]
    fn keywords_and_literals() {
        assert_eq!(
            kinds("and or in true false null"),
            vec![
                TokenKind::Operator("and".into()),
                TokenKind::Operator("or".into()),
                TokenKind::Operator("in".into()),
                TokenKind::Bool(true),
                TokenKind::Bool(false),
                TokenKind::Null,
            ]
        );
    }

    #[test]
    fn numbers() {
        assert_eq!(
            kinds("42 3.14 2.5e2 1E-2"),
            vec![
                TokenKind::Integer(42),
                TokenKind::Float(3.14),
                TokenKind::Float(250.0),
                TokenKind::Float(0.01),
            ]
        );
    }

    #[test]
    fn range_is_not_a_decimal_point() {
        assert_eq!(
            kinds("1..5"),
            vec![
                TokenKind::Integer(1),
                TokenKind::Operator("..".into()),
                TokenKind::Integer(5),
            ]
        );
    }

    #[test]
    fn two_char_operators() {
        assert_eq!(
            kinds(":= != <= >= ~> ?? ?: .. **"),
            vec![
                TokenKind::Operator(":=".into()),
                TokenKind::Operator("!=".into()),
                TokenKind::Operator("<=".into()),
                TokenKind::Operator(">=".into()),
                TokenKind::Operator("~>".into()),
                TokenKind::Operator("??".into()),
                TokenKind::Operator("?:".into()),
                TokenKind::Operator("..".into()),
                TokenKind::Operator("**".into()),
            ]
        );
    }

    #[test]
    fn string_escapes() {
        assert_eq!(
            kinds(r#""a\"b\\c\nd" 'A'"#),
            vec![
                TokenKind::Str("a\"b\\c\nd".into()),
                TokenKind::Str("A".into()),
            ]
        );
    }

    #[test]
    fn surrogate_pair_escape() {
        assert_eq!(
            kinds(r#""😀""#),
            vec![TokenKind::Str("\u{1F600}".into())]
        );
    }

    #[test]
    fn backquote_names() {
        assert_eq!(
            kinds("`field name`"),
            vec![TokenKind::Name("field name".into())]
        );
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            kinds("foo /* comment */ bar"),
            vec![TokenKind::Name("foo".into()), TokenKind::Name("bar".into())]
        );
    }

    #[test]
    fn variables() {
        assert_eq!(
            kinds("$x $ $$"),
            vec![
                TokenKind::Variable("x".into()),
                TokenKind::Variable("".into()),
                TokenKind::Variable("$".into()),
            ]
        );
    }

    #[test]
    fn slash_mode_disambiguation() {
        // operand position: regex literal
        let mut lexer = Lexer::new("/ab+/");
        match lexer.next_token(false).unwrap().unwrap().kind {
            TokenKind::Regex(re) => assert_eq!(re.as_str(), "ab+"),
            other => panic!("expected regex, got {:?}", other),
        }
        // operator position: division
        let mut lexer = Lexer::new("/");
        assert_eq!(
            lexer.next_token(true).unwrap().unwrap().kind,
            TokenKind::Operator("/".into())
        );
    }

    #[test]
    fn unterminated_string_errors() {
        let mut lexer = Lexer::new("\"abc");
        assert_eq!(lexer.next_token(false).unwrap_err().code, "S0101");
    }
}
