//! The value model for the tansy query language.
//!
//! This type represents all valid JSON types plus the engine-internal kinds a
//! query can produce: functions (lambdas, builtins, partial applications,
//! transformers), compiled regular expressions, lazily-represented integer
//! ranges, and `Undefined` — the "absent" value that propagates through
//! expressions and is distinct from JSON `null`.
//!
//! # Type preservation
//!
//! The language preserves the distinction between integers and floats:
//! arithmetic maintains integer types when results are whole, and high-precision
//! decimal arithmetic prevents floating-point drift on mixed operations.
//!
//! # Sequences
//!
//! Path evaluation produces *sequences*: arrays tagged with bookkeeping flags
//! ([`ArrayFlags`]) that control singleton unwrapping, splicing of constructed
//! arrays, and tuple-stream threading. Flags live on the value handle, never
//! participate in equality, and are invisible to JSON output.

use indexmap::IndexMap;
use std::rc::Rc;
use std::sync::Arc;

use regex::Regex;

use crate::ast::nodes::Node;
use crate::error::Error;
use crate::evaluator::Evaluator;
use crate::frame::Frame;
use crate::signature::Signature;

/// Bookkeeping flags carried by array values during evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArrayFlags {
    /// Result sequence of a path/step evaluation; subject to singleton unwrapping.
    pub sequence: bool,
    /// Explicitly constructed array (`[...]`); never spliced into a parent sequence.
    pub cons: bool,
    /// A sequence of length 1 must not be unwrapped to its single element.
    pub keep_singleton: bool,
    /// The sequence carries correlated tuple bindings rather than plain values.
    pub tuple_stream: bool,
    /// Wrapper around a top-level array input so `$` refers to the whole array.
    pub outer_wrapper: bool,
}

/// A JSON-like value, extended with the engine-internal kinds described in the
/// module documentation.
#[derive(Debug, Clone)]
pub enum Value {
    /// Absent ("no value"); propagates through most operators.
    Undefined,
    /// JSON null.
    Null,
    /// JSON boolean.
    Bool(bool),
    /// Integer number (preserved separately from floats).
    Integer(i64),
    /// Floating-point number.
    Float(f64),
    /// UTF-8 string.
    String(Rc<str>),
    /// Array of values plus sequence flags. Cloning shares the backing vector.
    Array(Rc<Vec<Value>>, ArrayFlags),
    /// Object with string keys. Cloning shares the backing map.
    Object(Rc<IndexMap<String, Value>>),
    /// Lazy inclusive integer range produced by the `..` operator.
    Range(i64, i64),
    /// A function value: lambda, builtin, partial application, or transformer.
    Function(FunctionValue),
    /// A compiled regular expression literal.
    Regex(Arc<Regex>),
}

/// The callable kinds a `Value::Function` can hold.
#[derive(Debug, Clone)]
pub enum FunctionValue {
    Lambda(Rc<LambdaFn>),
    Native(Arc<NativeFunction>),
    Partial(Rc<PartialFn>),
    Transformer(Rc<TransformerFn>),
}

/// A lambda closure: declared parameters, body, and the captured frame.
#[derive(Debug)]
pub struct LambdaFn {
    pub params: Arc<Vec<String>>,
    pub body: Arc<Node>,
    pub environment: Frame,
    pub input: Value,
    pub signature: Option<Arc<Signature>>,
    /// Tail-call marker consumed by the trampoline; never invoked directly.
    pub thunk: bool,
}

/// The implementation contract for builtin functions. Implementations receive
/// the evaluator so higher-order builtins can apply function arguments.
pub type NativeImpl = fn(&Evaluator<'_>, &[Value]) -> Result<Value, Error>;

/// A builtin function: name, compiled signature, and implementation.
pub struct NativeFunction {
    pub name: &'static str,
    pub signature: Signature,
    pub implementation: NativeImpl,
}

impl std::fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NativeFunction({})", self.name)
    }
}

/// A partially-applied builtin: supplied arguments are bound, `None` slots
/// remain open and are filled left-to-right on application.
#[derive(Debug)]
pub struct PartialFn {
    pub target: FunctionValue,
    pub bound: Vec<Option<Value>>,
}

/// A transformer function produced by the `|pattern|update[,delete]|` operator.
#[derive(Debug)]
pub struct TransformerFn {
    pub pattern: Arc<Node>,
    pub update: Arc<Node>,
    pub delete: Option<Arc<Node>>,
    pub environment: Frame,
}

impl Value {
    pub fn string(s: impl Into<String>) -> Value {
        Value::String(Rc::from(s.into()))
    }

    /// A plain (non-sequence) array.
    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Rc::new(items), ArrayFlags::default())
    }

    pub fn array_with(items: Vec<Value>, flags: ArrayFlags) -> Value {
        Value::Array(Rc::new(items), flags)
    }

    pub fn object(map: IndexMap<String, Value>) -> Value {
        Value::Object(Rc::new(map))
    }

    /// An empty result sequence.
    pub fn sequence() -> Value {
        Value::Array(
            Rc::new(Vec::new()),
            ArrayFlags {
                sequence: true,
                ..ArrayFlags::default()
            },
        )
    }

    /// A sequence created from a single element. A one-element array becomes a
    /// sequence of that element; anything else is wrapped.
    pub fn sequence_of(el: Value) -> Value {
        let flags = ArrayFlags {
            sequence: true,
            ..ArrayFlags::default()
        };
        match el {
            Value::Array(items, _) if items.len() == 1 => Value::Array(items, flags),
            other => Value::Array(Rc::new(vec![other]), flags),
        }
    }

    pub fn sequence_from(items: Vec<Value>) -> Value {
        Value::Array(
            Rc::new(items),
            ArrayFlags {
                sequence: true,
                ..ArrayFlags::default()
            },
        )
    }

    /// Convert a float result to the narrowest representation: `Undefined` for
    /// NaN, an integer when the value is whole, an error for infinities.
    pub fn number(n: f64) -> Result<Value, Error> {
        if n.is_nan() {
            return Ok(Value::Undefined);
        }
        if n.is_infinite() {
            return Err(Error::with("D1001", None, vec![n.to_string()]));
        }
        if n.fract() == 0.0 && n >= i64::MIN as f64 && n <= i64::MAX as f64 {
            Ok(Value::Integer(n as i64))
        } else {
            Ok(Value::Float(n))
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Numeric check: booleans are not numbers, NaN and infinities don't count.
    pub fn is_numeric(&self) -> bool {
        match self {
            Value::Integer(_) => true,
            Value::Float(f) => f.is_finite(),
            _ => false,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Value::Array(..) | Value::Range(..))
    }

    /// Function-like values: anything the apply operator accepts.
    pub fn is_callable(&self) -> bool {
        matches!(self, Value::Function(_) | Value::Regex(_))
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(n) => Some(*n as f64),
            Value::Float(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn flags(&self) -> ArrayFlags {
        match self {
            Value::Array(_, flags) => *flags,
            _ => ArrayFlags::default(),
        }
    }

    pub fn is_sequence(&self) -> bool {
        self.flags().sequence
    }

    pub fn is_tuple_stream(&self) -> bool {
        self.flags().tuple_stream
    }

    pub fn with_flags(self, flags: ArrayFlags) -> Value {
        match self {
            Value::Array(items, _) => Value::Array(items, flags),
            other => other,
        }
    }

    /// Number of items when viewed as a list ([`Value::iter_items`]).
    pub fn len(&self) -> usize {
        match self {
            Value::Array(items, _) => items.len(),
            Value::Range(lo, hi) => (hi - lo + 1).max(0) as usize,
            _ => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Value::Array(items, _) => items.is_empty(),
            Value::Range(lo, hi) => hi < lo,
            _ => false,
        }
    }

    /// Index into an array or range.
    pub fn item(&self, index: usize) -> Option<Value> {
        match self {
            Value::Array(items, _) => items.get(index).cloned(),
            Value::Range(lo, hi) => {
                let v = lo + index as i64;
                if v <= *hi { Some(Value::Integer(v)) } else { None }
            }
            _ => None,
        }
    }

    /// Iterate a value as a list: arrays and ranges yield their items, any
    /// other value yields itself once.
    pub fn iter_items(&self) -> ItemIter<'_> {
        match self {
            Value::Array(items, _) => ItemIter::Slice(items.iter()),
            Value::Range(lo, hi) => ItemIter::Range(*lo, *hi),
            other => ItemIter::Single(Some(other)),
        }
    }

    /// Materialize arrays and ranges into a plain vector of items.
    pub fn into_items(self) -> Vec<Value> {
        match self {
            Value::Array(items, _) => match Rc::try_unwrap(items) {
                Ok(v) => v,
                Err(rc) => rc.as_ref().clone(),
            },
            Value::Range(lo, hi) => (lo..=hi).map(Value::Integer).collect(),
            other => vec![other],
        }
    }

    /// JSONata boolean conversion; `None` means the result is undefined.
    pub fn to_boolean(&self) -> Option<bool> {
        match self {
            Value::Undefined => None,
            Value::Null => Some(false),
            Value::Bool(b) => Some(*b),
            Value::Integer(n) => Some(*n != 0),
            Value::Float(n) => Some(*n != 0.0),
            Value::String(s) => Some(!s.is_empty()),
            Value::Array(items, _) => match items.len() {
                0 => Some(false),
                1 => items[0].to_boolean().or(Some(false)),
                _ => Some(items.iter().any(|v| v.to_boolean() == Some(true))),
            },
            Value::Range(lo, hi) => Some(hi >= lo),
            Value::Object(map) => Some(!map.is_empty()),
            Value::Function(_) | Value::Regex(_) => Some(false),
        }
    }

    /// Human-readable type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Integer(_) | Value::Float(_) => "number",
            Value::String(_) => "string",
            Value::Array(..) | Value::Range(..) => "array",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
            Value::Regex(_) => "function",
        }
    }

    /// Compact rendering for error message inserts.
    pub fn describe(&self) -> String {
        match self.to_json() {
            Some(json) => json.to_string(),
            None => self.type_name().to_string(),
        }
    }

    /// Convert from the serde_json data model.
    pub fn from_json(v: &serde_json::Value) -> Value {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Integer(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::string(s.clone()),
            serde_json::Value::Array(items) => {
                Value::array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => {
                let entries = map
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect();
                Value::object(entries)
            }
        }
    }

    /// Convert to the serde_json data model. `Undefined` converts to `None`;
    /// functions and regexes have no JSON representation and also yield `None`.
    /// Whole-valued floats serialize as integers.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        match self {
            Value::Undefined => None,
            Value::Null => Some(serde_json::Value::Null),
            Value::Bool(b) => Some(serde_json::Value::Bool(*b)),
            Value::Integer(n) => Some(serde_json::Value::from(*n)),
            Value::Float(n) => {
                if n.fract() == 0.0 && *n >= i64::MIN as f64 && *n <= i64::MAX as f64 {
                    Some(serde_json::Value::from(*n as i64))
                } else {
                    serde_json::Number::from_f64(*n).map(serde_json::Value::Number)
                }
            }
            Value::String(s) => Some(serde_json::Value::String(s.to_string())),
            Value::Array(items, _) => Some(serde_json::Value::Array(
                items.iter().filter_map(Value::to_json).collect(),
            )),
            Value::Range(lo, hi) => Some(serde_json::Value::Array(
                (*lo..=*hi).map(serde_json::Value::from).collect(),
            )),
            Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map.iter() {
                    if let Some(j) = v.to_json() {
                        out.insert(k.clone(), j);
                    }
                }
                Some(serde_json::Value::Object(out))
            }
            Value::Function(_) | Value::Regex(_) => None,
        }
    }
}

/// Iterator over a value viewed as a list.
pub enum ItemIter<'a> {
    Slice(std::slice::Iter<'a, Value>),
    Range(i64, i64),
    Single(Option<&'a Value>),
}

impl<'a> Iterator for ItemIter<'a> {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        match self {
            ItemIter::Slice(iter) => iter.next().cloned(),
            ItemIter::Range(lo, hi) => {
                if *lo <= *hi {
                    let v = *lo;
                    *lo += 1;
                    Some(Value::Integer(v))
                } else {
                    None
                }
            }
            ItemIter::Single(slot) => slot.take().cloned(),
        }
    }
}

// Value equality is the language's `=` semantics: numerics compare across
// representations, array flags are ignored, ranges compare as their expansion,
// and functions never compare equal.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (a, b) if a.is_numeric() && b.is_numeric() => a.as_f64() == b.as_f64(),
            (
                a @ (Value::Array(..) | Value::Range(..)),
                b @ (Value::Array(..) | Value::Range(..)),
            ) => a.len() == b.len() && a.iter_items().zip(b.iter_items()).all(|(x, y)| x == y),
            (Value::Object(a), Value::Object(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).map(|w| v == w).unwrap_or(false))
            }
            (Value::Regex(a), Value::Regex(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_equality_crosses_representations() {
        assert_eq!(Value::Integer(1), Value::Float(1.0));
        assert_ne!(Value::Integer(1), Value::Float(1.5));
        assert_ne!(Value::Bool(true), Value::Integer(1));
    }

    #[test]
    fn ranges_compare_as_arrays() {
        let range = Value::Range(1, 3);
        let array = Value::array(vec![
            Value::Integer(1),
            Value::Integer(2),
            Value::Integer(3),
        ]);
        assert_eq!(range, array);
        assert_eq!(range.len(), 3);
    }

    #[test]
    fn number_narrows_to_integer() {
        assert_eq!(Value::number(3.0).unwrap(), Value::Integer(3));
        assert_eq!(Value::number(3.5).unwrap(), Value::Float(3.5));
        assert!(Value::number(f64::INFINITY).is_err());
        assert!(Value::number(f64::NAN).unwrap().is_undefined());
    }

    #[test]
    fn sequence_of_single_element_array() {
        let seq = Value::sequence_of(Value::array(vec![Value::Integer(7)]));
        assert_eq!(seq.len(), 1);
        assert!(seq.is_sequence());
    }
}
