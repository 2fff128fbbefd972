//! Function signature compilation and argument validation.
//!
//! A signature is a compact type-constraint string (`<s-nn?:s>` and friends)
//! compiled into a regular expression over one-letter-per-argument type codes.
//! On every application the supplied arguments are encoded into a code string,
//! matched, and coerced: context substitution for omitted arguments marked
//! `-`, auto-wrapping of single values into arrays, and homogeneity checks on
//! parameterized array types.
//!
//! Type codes: `s`tring, `n`umber, `b`oolean, nul`l`, `a`rray, `o`bject,
//! `f`unction, `j` (any JSON), `x` (anything), `m`issing.

use regex::Regex;

use crate::error::Error;
use crate::value::Value;

/// One declared parameter of a signature.
#[derive(Debug, Clone)]
struct Param {
    ptype: String,
    fragment: String,
    context: bool,
    array: bool,
    subtype: Option<String>,
    /// Anchored form of `fragment`, used for the context-compatibility check.
    anchored: Regex,
}

/// A compiled signature: ordered parameters plus the matcher over the
/// concatenated argument type codes. Built once per function definition and
/// reused for every call.
#[derive(Debug, Clone)]
pub struct Signature {
    params: Vec<Param>,
    matcher: Regex,
    function_name: String,
}

/// The one-letter type code for a value.
pub fn type_symbol(value: &Value) -> char {
    match value {
        Value::Undefined => 'm',
        Value::Null => 'l',
        Value::Bool(_) => 'b',
        Value::Integer(_) | Value::Float(_) => 'n',
        Value::String(_) => 's',
        Value::Array(..) | Value::Range(..) => 'a',
        Value::Object(_) => 'o',
        Value::Function(_) | Value::Regex(_) => 'f',
    }
}

fn find_closing(signature: &[char], start: usize, open: char, close: char) -> usize {
    let mut depth = 1;
    let mut position = start;
    while position + 1 < signature.len() {
        position += 1;
        let symbol = signature[position];
        if symbol == close {
            depth -= 1;
            if depth == 0 {
                break;
            }
        } else if symbol == open {
            depth += 1;
        }
    }
    position
}

impl Signature {
    /// Compile a signature string (including the enclosing angle brackets).
    pub fn new(signature: &str, function_name: &str) -> Result<Signature, Error> {
        let chars: Vec<char> = signature.chars().collect();
        let mut params: Vec<Param> = Vec::new();
        // the parameter under construction, pushed on `next`
        let mut ptype = String::new();
        let mut fragment = String::new();
        let mut array = false;

        let push =
            |params: &mut Vec<Param>, ptype: &mut String, fragment: &mut String, array: &mut bool| {
                params.push(Param {
                    ptype: std::mem::take(ptype),
                    fragment: std::mem::take(fragment),
                    context: false,
                    array: *array,
                    subtype: None,
                    anchored: Regex::new("^$").expect("valid"),
                });
                *array = false;
            };

        let mut position = 1;
        while position < chars.len() {
            let symbol = chars[position];
            if symbol == ':' {
                // return type is not enforced
                break;
            }
            match symbol {
                's' | 'n' | 'b' | 'l' | 'o' => {
                    fragment = format!("[{}m]", symbol);
                    ptype = symbol.to_string();
                    push(&mut params, &mut ptype, &mut fragment, &mut array);
                }
                'a' => {
                    // any value is acceptable and will be wrapped as a singleton
                    fragment = "[asnblfom]".to_string();
                    ptype = "a".to_string();
                    array = true;
                    push(&mut params, &mut ptype, &mut fragment, &mut array);
                }
                'f' => {
                    fragment = "f".to_string();
                    ptype = "f".to_string();
                    push(&mut params, &mut ptype, &mut fragment, &mut array);
                }
                'j' => {
                    fragment = "[asnblom]".to_string();
                    ptype = "j".to_string();
                    push(&mut params, &mut ptype, &mut fragment, &mut array);
                }
                'x' => {
                    fragment = "[asnblfom]".to_string();
                    ptype = "x".to_string();
                    push(&mut params, &mut ptype, &mut fragment, &mut array);
                }
                '-' => {
                    if let Some(prev) = params.last_mut() {
                        prev.context = true;
                        prev.fragment.push('?');
                    }
                }
                '?' | '+' => {
                    if let Some(prev) = params.last_mut() {
                        prev.fragment.push(symbol);
                    }
                }
                '(' => {
                    let end = find_closing(&chars, position, '(', ')');
                    let choice: String = chars[position + 1..end].iter().collect();
                    if choice.contains('<') {
                        return Err(Error::new("S0402", None));
                    }
                    fragment = format!("[{}m]", choice);
                    ptype = format!("({})", choice);
                    push(&mut params, &mut ptype, &mut fragment, &mut array);
                    position = end;
                }
                '<' => {
                    let end = find_closing(&chars, position, '<', '>');
                    let accepts_subtype = params
                        .last()
                        .map(|p| p.ptype == "a" || p.ptype == "f")
                        .unwrap_or(false);
                    if accepts_subtype {
                        let subtype: String = chars[position + 1..end].iter().collect();
                        if let Some(prev) = params.last_mut() {
                            prev.subtype = Some(subtype);
                        }
                    }
                    // type parameters on other types are ignored
                    position = end;
                }
                _ => {}
            }
            position += 1;
        }

        let mut pattern = String::from("^");
        for param in &params {
            pattern.push('(');
            pattern.push_str(&param.fragment);
            pattern.push(')');
        }
        pattern.push('$');
        let matcher = Regex::new(&pattern).expect("signature fragments are valid regexes");

        for param in &mut params {
            param.anchored = Regex::new(&format!("^(?:{})$", param.fragment))
                .expect("signature fragments are valid regexes");
        }

        Ok(Signature {
            params,
            matcher,
            function_name: function_name.to_string(),
        })
    }

    /// Number of declared parameters.
    pub fn arity(&self) -> usize {
        self.params.len()
    }

    /// Number of non-optional parameters.
    pub fn min_args(&self) -> usize {
        self.params
            .iter()
            .filter(|p| !p.fragment.contains('?'))
            .count()
    }

    /// Validate and coerce the supplied arguments, substituting the context
    /// value for omitted context-substitutable parameters.
    pub fn validate(&self, args: &[Value], context: &Value) -> Result<Vec<Value>, Error> {
        let supplied: String = args.iter().map(type_symbol).collect();

        let captures = match self.matcher.captures(&supplied) {
            Some(captures) => captures,
            None => return Err(self.validation_error(&supplied)),
        };

        let mut validated: Vec<Value> = Vec::with_capacity(args.len());
        let mut arg_index = 0usize;
        for (index, param) in self.params.iter().enumerate() {
            let matched = captures.get(index + 1).map(|m| m.as_str()).unwrap_or("");
            if matched.is_empty() {
                if param.context {
                    // substitute the context value for the missing argument,
                    // provided its type code is compatible
                    let context_type = type_symbol(context).to_string();
                    if param.anchored.is_match(&context_type) {
                        validated.push(context.clone());
                    } else {
                        return Err(Error::with(
                            "T0411",
                            None,
                            vec![(arg_index + 1).to_string(), self.function_name.clone()],
                        ));
                    }
                } else {
                    validated.push(args.get(arg_index).cloned().unwrap_or(Value::Undefined));
                    arg_index += 1;
                }
                continue;
            }
            // a `+` parameter may have matched several argument codes
            for single in matched.chars() {
                if param.array {
                    if single == 'm' {
                        validated.push(Value::Undefined);
                        arg_index += 1;
                        continue;
                    }
                    let arg = args.get(arg_index).cloned().unwrap_or(Value::Undefined);
                    if let Some(subtype) = &param.subtype {
                        let wanted = subtype.chars().next().unwrap_or('x');
                        let array_ok = if single == 'a' {
                            // every member must share the declared item type
                            arg.iter_items().all(|item| type_symbol(&item) == wanted)
                        } else {
                            single == wanted
                        };
                        if !array_ok {
                            return Err(Error::with(
                                "T0412",
                                None,
                                vec![subtype.clone(), self.function_name.clone()],
                            ));
                        }
                    }
                    // the function expects an array; if it's not one, make it so
                    if single == 'a' {
                        validated.push(arg);
                    } else {
                        validated.push(Value::array(vec![arg]));
                    }
                    arg_index += 1;
                } else {
                    validated.push(args.get(arg_index).cloned().unwrap_or(Value::Undefined));
                    arg_index += 1;
                }
            }
        }
        Ok(validated)
    }

    /// Re-match a growing prefix of the parameter regexes to pinpoint the
    /// first offending argument position (1-based).
    fn validation_error(&self, supplied: &str) -> Error {
        let mut partial = String::from("^");
        let mut good_to = 0usize;
        for param in &self.params {
            partial.push_str(&param.fragment);
            let tester = Regex::new(&partial).expect("signature fragments are valid regexes");
            match tester.find(supplied).filter(|m| m.start() == 0) {
                Some(m) => good_to = m.end(),
                None => {
                    return Error::with(
                        "T0410",
                        None,
                        vec![(good_to + 1).to_string(), self.function_name.clone()],
                    );
                }
            }
        }
        // everything matched some prefix: extraneous arguments
        Error::with(
            "T0410",
            None,
            vec![(good_to + 1).to_string(), self.function_name.clone()],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_and_accepts_matching_args() {
        let sig = Signature::new("<s-nn?:s>", "substring").unwrap();
        let args = vec![
            Value::string("hello"),
            Value::Integer(1),
            Value::Integer(2),
        ];
        let validated = sig.validate(&args, &Value::Undefined).unwrap();
        assert_eq!(validated.len(), 3);
    }

    #[test]
    fn context_substitution_fills_missing_argument() {
        let sig = Signature::new("<s-:s>", "uppercase").unwrap();
        let validated = sig.validate(&[], &Value::string("ctx")).unwrap();
        assert_eq!(validated, vec![Value::string("ctx")]);
    }

    #[test]
    fn incompatible_context_is_rejected() {
        let sig = Signature::new("<s-:s>", "uppercase").unwrap();
        let err = sig.validate(&[], &Value::Integer(1)).unwrap_err();
        assert_eq!(err.code, "T0411");
    }

    #[test]
    fn array_parameter_wraps_single_value() {
        let sig = Signature::new("<a<n>:n>", "sum").unwrap();
        let validated = sig.validate(&[Value::Integer(5)], &Value::Undefined).unwrap();
        assert_eq!(validated, vec![Value::array(vec![Value::Integer(5)])]);
    }

    #[test]
    fn mixed_array_fails_homogeneity_check() {
        let sig = Signature::new("<a<n>:n>", "sum").unwrap();
        let arg = Value::array(vec![Value::Integer(1), Value::string("x")]);
        let err = sig.validate(&[arg], &Value::Undefined).unwrap_err();
        assert_eq!(err.code, "T0412");
    }

    #[test]
    fn bad_argument_position_is_reported() {
        let sig = Signature::new("<sn:s>", "pad").unwrap();
        let args = vec![Value::string("x"), Value::string("y")];
        let err = sig.validate(&args, &Value::Undefined).unwrap_err();
        assert_eq!(err.code, "T0410");
        assert_eq!(err.inserts[0], "2");
    }

    #[test]
    fn choice_group_with_parameterized_type_is_rejected() {
        assert_eq!(
            Signature::new("<(sa<n>):s>", "broken").unwrap_err().code,
            "S0402"
        );
    }
}
