//! The builtin function library.
//!
//! Each builtin is registered as `(name, signature, implementation)` and bound
//! into the root frame before evaluation. Implementations receive the
//! evaluator so higher-order functions (`$map`, `$filter`, `$reduce`, `$sort`,
//! `$sift`, `$each`, `$single`) can apply their function arguments through the
//! normal application machinery, trampoline included.
//!
//! Date-time picture formatting and number-to-words are deliberately absent.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, LazyLock};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use indexmap::IndexMap;

use crate::error::Error;
use crate::evaluator::{Evaluator, boolize, function_arity};
use crate::frame::Frame;
use crate::signature::Signature;
use crate::value::{ArrayFlags, NativeFunction, NativeImpl, Value};

fn define(name: &'static str, signature: &str, implementation: NativeImpl) -> Arc<NativeFunction> {
    Arc::new(NativeFunction {
        name,
        signature: Signature::new(signature, name).expect("valid builtin signature"),
        implementation,
    })
}

static BUILTINS: LazyLock<Vec<Arc<NativeFunction>>> = LazyLock::new(|| {
    vec![
        define("sum", "<a<n>:n>", fn_sum),
        define("count", "<a:n>", fn_count),
        define("max", "<a<n>:n>", fn_max),
        define("min", "<a<n>:n>", fn_min),
        define("average", "<a<n>:n>", fn_average),
        define("string", "<x-b?:s>", fn_string),
        define("substring", "<s-nn?:s>", fn_substring),
        define("substringBefore", "<s-s:s>", fn_substring_before),
        define("substringAfter", "<s-s:s>", fn_substring_after),
        define("lowercase", "<s-:s>", fn_lowercase),
        define("uppercase", "<s-:s>", fn_uppercase),
        define("length", "<s-:n>", fn_length),
        define("trim", "<s-:s>", fn_trim),
        define("pad", "<s-ns?:s>", fn_pad),
        define("match", "<s-f<s:o>n?:a<o>>", fn_match),
        define("contains", "<s-(sf):b>", fn_contains),
        define("replace", "<s-(sf)(sf)n?:s>", fn_replace),
        define("split", "<s-(sf)n?:a<s>>", fn_split),
        define("join", "<a<s>s?:s>", fn_join),
        define("number", "<(nsb)-:n>", fn_number),
        define("floor", "<n-:n>", fn_floor),
        define("ceil", "<n-:n>", fn_ceil),
        define("round", "<n-n?:n>", fn_round),
        define("abs", "<n-:n>", fn_abs),
        define("sqrt", "<n-:n>", fn_sqrt),
        define("power", "<n-n:n>", fn_power),
        define("random", "<:n>", fn_random),
        define("boolean", "<x-:b>", fn_boolean),
        define("not", "<x-:b>", fn_not),
        define("map", "<af>", fn_map),
        define("zip", "<a+>", fn_zip),
        define("filter", "<af>", fn_filter),
        define("single", "<af?>", fn_single),
        define("reduce", "<afj?:j>", fn_reduce),
        define("sift", "<o-f?:o>", fn_sift),
        define("keys", "<x-:a<s>>", fn_keys),
        define("lookup", "<x-s:x>", fn_lookup),
        define("append", "<xx:a>", fn_append),
        define("exists", "<x:b>", fn_exists),
        define("spread", "<x-:a<o>>", fn_spread),
        define("merge", "<a<o>:o>", fn_merge),
        define("reverse", "<a:a>", fn_reverse),
        define("each", "<o-f:a>", fn_each),
        define("error", "<s?:x>", fn_error),
        define("assert", "<bs?:x>", fn_assert),
        define("type", "<x:s>", fn_type),
        define("sort", "<af?:a>", fn_sort),
        define("shuffle", "<a:a>", fn_shuffle),
        define("distinct", "<x:x>", fn_distinct),
        define("base64encode", "<s-:s>", fn_base64_encode),
        define("base64decode", "<s-:s>", fn_base64_decode),
        define("encodeUrlComponent", "<s-:s>", fn_encode_url_component),
        define("encodeUrl", "<s-:s>", fn_encode_url),
        define("decodeUrlComponent", "<s-:s>", fn_decode_url),
        define("decodeUrl", "<s-:s>", fn_decode_url),
        define("eval", "<sx?:x>", fn_eval),
    ]
});

/// Bind the builtin library into a (root) frame.
pub(crate) fn bind_builtins(frame: &Frame) {
    for builtin in BUILTINS.iter() {
        frame.bind(
            builtin.name,
            Value::Function(crate::value::FunctionValue::Native(builtin.clone())),
        );
    }
}

// ---------------------------------------------------------------------------
// shared helpers (also used by the evaluator)
// ---------------------------------------------------------------------------

/// The `$string` conversion: strings pass through, functions become empty,
/// everything else serializes as compact JSON.
pub(crate) fn stringify(value: &Value) -> String {
    match value {
        Value::Undefined => String::new(),
        Value::String(s) => s.to_string(),
        Value::Function(_) | Value::Regex(_) => String::new(),
        other => other
            .to_json()
            .map(|j| j.to_string())
            .unwrap_or_default(),
    }
}

/// Navigate a key into a value; arrays map the lookup over their items.
pub(crate) fn lookup_value(input: &Value, key: &str) -> Value {
    match input {
        Value::Array(..) | Value::Range(..) => {
            let mut out = Vec::new();
            for item in input.iter_items() {
                match lookup_value(&item, key) {
                    Value::Undefined => {}
                    res @ (Value::Array(..) | Value::Range(..)) => out.extend(res.iter_items()),
                    res => out.push(res),
                }
            }
            Value::sequence_from(out)
        }
        Value::Object(map) => map.get(key).cloned().unwrap_or(Value::Undefined),
        _ => Value::Undefined,
    }
}

/// Append `b` onto `a`, flattening arrays; undefined on either side vanishes.
pub(crate) fn append(a: Value, b: Value) -> Value {
    if a.is_undefined() {
        return b;
    }
    if b.is_undefined() {
        return a;
    }
    let (mut items, flags) = match a {
        Value::Array(_, flags) => (a.into_items(), flags),
        range @ Value::Range(..) => (
            range.into_items(),
            ArrayFlags {
                sequence: true,
                ..ArrayFlags::default()
            },
        ),
        other => (
            vec![other],
            ArrayFlags {
                sequence: true,
                ..ArrayFlags::default()
            },
        ),
    };
    if b.is_array() {
        items.extend(b.iter_items());
    } else {
        items.push(b);
    }
    Value::array_with(items, flags)
}

/// Stable fallible merge sort; ties keep the left item first.
pub(crate) fn merge_sort<F>(mut items: Vec<Value>, comp: &mut F) -> Result<Vec<Value>, Error>
where
    F: FnMut(&Value, &Value) -> Result<Ordering, Error>,
{
    if items.len() <= 1 {
        return Ok(items);
    }
    let right = items.split_off(items.len() / 2);
    let left = merge_sort(items, comp)?;
    let right = merge_sort(right, comp)?;

    let mut merged = Vec::with_capacity(left.len() + right.len());
    let mut li = left.into_iter().peekable();
    let mut ri = right.into_iter().peekable();
    loop {
        match (li.peek(), ri.peek()) {
            (Some(l), Some(r)) => {
                if comp(l, r)? == Ordering::Greater {
                    merged.push(ri.next().expect("peeked"));
                } else {
                    merged.push(li.next().expect("peeked"));
                }
            }
            (Some(_), None) => merged.push(li.next().expect("peeked")),
            (None, Some(_)) => merged.push(ri.next().expect("peeked")),
            (None, None) => break,
        }
    }
    Ok(merged)
}

/// Apply a function argument, truncating the candidate arguments to its arity.
fn apply_with_arity(
    ev: &Evaluator<'_>,
    func: &Value,
    candidate_args: Vec<Value>,
) -> Result<Value, Error> {
    let arity = function_arity(func).max(1);
    let args: Vec<Value> = candidate_args.into_iter().take(arity).collect();
    ev.apply(func, args)
}

fn numeric_items(arg: &Value) -> Vec<f64> {
    arg.iter_items()
        .filter_map(|v| v.as_f64())
        .collect()
}

// ---------------------------------------------------------------------------
// aggregation
// ---------------------------------------------------------------------------

fn fn_sum(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    let arg = &args[0];
    if arg.is_undefined() {
        return Ok(Value::Undefined);
    }
    Value::number(arg.iter_items().filter_map(|v| v.as_f64()).sum())
}

fn fn_count(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    let arg = &args[0];
    if arg.is_undefined() {
        return Ok(Value::Integer(0));
    }
    Ok(Value::Integer(arg.len() as i64))
}

fn fn_max(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    let arg = &args[0];
    if arg.is_undefined() || arg.is_empty() {
        return Ok(Value::Undefined);
    }
    Value::number(numeric_items(arg).into_iter().fold(f64::MIN, f64::max))
}

fn fn_min(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    let arg = &args[0];
    if arg.is_undefined() || arg.is_empty() {
        return Ok(Value::Undefined);
    }
    Value::number(numeric_items(arg).into_iter().fold(f64::MAX, f64::min))
}

fn fn_average(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    let arg = &args[0];
    if arg.is_undefined() || arg.is_empty() {
        return Ok(Value::Undefined);
    }
    let items = numeric_items(arg);
    Value::number(items.iter().sum::<f64>() / items.len() as f64)
}

// ---------------------------------------------------------------------------
// strings
// ---------------------------------------------------------------------------

fn fn_string(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    let arg = &args[0];
    if arg.is_undefined() {
        return Ok(Value::Undefined);
    }
    let pretty = args.get(1).and_then(Value::to_boolean).unwrap_or(false);
    if pretty && !matches!(arg, Value::String(_)) {
        if let Some(json) = arg.to_json() {
            return Ok(Value::string(
                serde_json::to_string_pretty(&json).unwrap_or_default(),
            ));
        }
    }
    Ok(Value::string(stringify(arg)))
}

fn fn_length(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    match args[0].as_str() {
        Some(s) => Ok(Value::Integer(s.chars().count() as i64)),
        None => Ok(Value::Undefined),
    }
}

fn fn_substring(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    let Some(s) = args[0].as_str() else {
        return Ok(Value::Undefined);
    };
    let chars: Vec<char> = s.chars().collect();
    let mut start = args[1].as_f64().unwrap_or(0.0).trunc() as i64;
    if start < 0 {
        start += chars.len() as i64;
    }
    let start = start.max(0) as usize;
    let taken: String = match args.get(2).and_then(Value::as_f64) {
        Some(len) => {
            let len = len.trunc().max(0.0) as usize;
            chars.iter().skip(start).take(len).collect()
        }
        None => chars.iter().skip(start).collect(),
    };
    Ok(Value::string(taken))
}

fn fn_substring_before(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    let (Some(s), Some(chars)) = (args[0].as_str(), args[1].as_str()) else {
        return Ok(Value::Undefined);
    };
    match s.find(chars) {
        Some(pos) => Ok(Value::string(&s[..pos])),
        None => Ok(Value::string(s)),
    }
}

fn fn_substring_after(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    let (Some(s), Some(chars)) = (args[0].as_str(), args[1].as_str()) else {
        return Ok(Value::Undefined);
    };
    match s.find(chars) {
        Some(pos) => Ok(Value::string(&s[pos + chars.len()..])),
        None => Ok(Value::string(s)),
    }
}

fn fn_lowercase(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    match args[0].as_str() {
        Some(s) => Ok(Value::string(s.to_lowercase())),
        None => Ok(Value::Undefined),
    }
}

fn fn_uppercase(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    match args[0].as_str() {
        Some(s) => Ok(Value::string(s.to_uppercase())),
        None => Ok(Value::Undefined),
    }
}

/// Normalize whitespace: runs collapse to one space, ends are trimmed.
fn fn_trim(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    let Some(s) = args[0].as_str() else {
        return Ok(Value::Undefined);
    };
    let collapsed: String = s.split_whitespace().collect::<Vec<_>>().join(" ");
    Ok(Value::string(collapsed))
}

fn fn_pad(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    let Some(s) = args[0].as_str() else {
        return Ok(Value::Undefined);
    };
    let width = args[1].as_f64().unwrap_or(0.0).trunc() as i64;
    let pad_chars: Vec<char> = args
        .get(2)
        .and_then(Value::as_str)
        .filter(|p| !p.is_empty())
        .unwrap_or(" ")
        .chars()
        .collect();
    let current = s.chars().count() as i64;
    let needed = width.abs() - current;
    if needed <= 0 {
        return Ok(Value::string(s));
    }
    let padding: String = (0..needed as usize)
        .map(|i| pad_chars[i % pad_chars.len()])
        .collect();
    let result = if width < 0 {
        format!("{}{}", padding, s)
    } else {
        format!("{}{}", s, padding)
    };
    Ok(Value::string(result))
}

fn fn_contains(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    let Some(s) = args[0].as_str() else {
        return Ok(Value::Undefined);
    };
    let found = match &args[1] {
        Value::String(pattern) => s.contains(pattern.as_ref()),
        Value::Regex(re) => re.is_match(s),
        _ => false,
    };
    Ok(Value::Bool(found))
}

fn match_object(m: &regex::Captures<'_>, full: &regex::Match<'_>) -> Value {
    let mut obj = IndexMap::new();
    obj.insert("match".to_string(), Value::string(full.as_str()));
    obj.insert("index".to_string(), Value::Integer(full.start() as i64));
    let groups: Vec<Value> = m
        .iter()
        .skip(1)
        .map(|g| match g {
            Some(g) => Value::string(g.as_str()),
            None => Value::string(""),
        })
        .collect();
    obj.insert("groups".to_string(), Value::array(groups));
    Value::object(obj)
}

fn fn_match(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    let Some(s) = args[0].as_str() else {
        return Ok(Value::Undefined);
    };
    let Value::Regex(re) = &args[1] else {
        return Ok(Value::Undefined);
    };
    let limit = args
        .get(2)
        .and_then(Value::as_f64)
        .map(|l| l.trunc().max(0.0) as usize)
        .unwrap_or(usize::MAX);
    let mut results = Vec::new();
    for captures in re.captures_iter(s).take(limit) {
        let full = captures.get(0).expect("group 0 always matches");
        results.push(match_object(&captures, &full));
    }
    Ok(Value::sequence_from(results))
}

fn fn_split(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    let Some(s) = args[0].as_str() else {
        return Ok(Value::Undefined);
    };
    let limit = args
        .get(2)
        .and_then(Value::as_f64)
        .map(|l| l.trunc().max(0.0) as usize)
        .unwrap_or(usize::MAX);
    let parts: Vec<Value> = match &args[1] {
        Value::String(sep) if sep.is_empty() => {
            s.chars().map(|c| Value::string(c.to_string())).collect()
        }
        Value::String(sep) => s
            .split(sep.as_ref())
            .map(Value::string)
            .collect(),
        Value::Regex(re) => re.split(s).map(Value::string).collect(),
        _ => return Ok(Value::Undefined),
    };
    Ok(Value::array(parts.into_iter().take(limit).collect()))
}

fn fn_join(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    let arg = &args[0];
    if arg.is_undefined() {
        return Ok(Value::Undefined);
    }
    let sep = args.get(1).and_then(Value::as_str).unwrap_or("");
    let parts: Vec<String> = arg
        .iter_items()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    Ok(Value::string(parts.join(sep)))
}

/// Expand `$0`..`$9` group references in a replacement template; `$$` is a
/// literal dollar.
fn expand_replacement(template: &str, captures: &regex::Captures<'_>) -> String {
    let mut out = String::new();
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('$') => {
                out.push('$');
                chars.next();
            }
            Some(d) if d.is_ascii_digit() => {
                let mut num = 0usize;
                while let Some(d) = chars.peek().copied().filter(|d| d.is_ascii_digit()) {
                    // prefer the longest group number that exists
                    let candidate = num * 10 + d.to_digit(10).expect("digit") as usize;
                    if candidate < captures.len() {
                        num = candidate;
                        chars.next();
                    } else {
                        break;
                    }
                }
                if let Some(g) = captures.get(num) {
                    out.push_str(g.as_str());
                }
            }
            _ => out.push('$'),
        }
    }
    out
}

fn fn_replace(ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    let Some(s) = args[0].as_str() else {
        return Ok(Value::Undefined);
    };
    let limit = args
        .get(3)
        .and_then(Value::as_f64)
        .map(|l| l.trunc().max(0.0) as usize)
        .unwrap_or(usize::MAX);

    match (&args[1], &args[2]) {
        (Value::String(pattern), Value::String(replacement)) => {
            Ok(Value::string(s.replacen(
                pattern.as_ref(),
                replacement.as_ref(),
                limit,
            )))
        }
        (Value::Regex(re), replacement) => {
            let mut out = String::new();
            let mut last = 0usize;
            for captures in re.captures_iter(s).take(limit) {
                let full = captures.get(0).expect("group 0 always matches");
                out.push_str(&s[last..full.start()]);
                match replacement {
                    Value::String(template) => {
                        out.push_str(&expand_replacement(template, &captures));
                    }
                    func if func.is_callable() => {
                        let result =
                            ev.apply(func, vec![match_object(&captures, &full)])?;
                        out.push_str(result.as_str().unwrap_or(""));
                    }
                    _ => out.push_str(full.as_str()),
                }
                last = full.end();
            }
            out.push_str(&s[last..]);
            Ok(Value::string(out))
        }
        _ => Ok(Value::Undefined),
    }
}

// ---------------------------------------------------------------------------
// numbers
// ---------------------------------------------------------------------------

fn fn_number(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    match &args[0] {
        Value::Undefined => Ok(Value::Undefined),
        v if v.is_numeric() => Ok(v.clone()),
        Value::Bool(b) => Ok(Value::Integer(i64::from(*b))),
        Value::String(s) => {
            let trimmed = s.trim();
            if let Some(hex) = trimmed.strip_prefix("0x")
                && let Ok(n) = i64::from_str_radix(hex, 16)
            {
                return Ok(Value::Integer(n));
            }
            match trimmed.parse::<f64>() {
                Ok(n) if n.is_finite() => Value::number(n),
                _ => Err(Error::with("D3030", None, vec![s.to_string()])),
            }
        }
        other => Err(Error::with("D3030", None, vec![other.describe()])),
    }
}

fn fn_floor(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    match args[0].as_f64() {
        Some(n) => Value::number(n.floor()),
        None => Ok(Value::Undefined),
    }
}

fn fn_ceil(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    match args[0].as_f64() {
        Some(n) => Value::number(n.ceil()),
        None => Ok(Value::Undefined),
    }
}

/// Round half to even, at an optional number of decimal places.
fn fn_round(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    let Some(n) = args[0].as_f64() else {
        return Ok(Value::Undefined);
    };
    let precision = args
        .get(1)
        .and_then(Value::as_f64)
        .map(|p| p.trunc() as i32)
        .unwrap_or(0);
    let scale = 10f64.powi(precision);
    Value::number((n * scale).round_ties_even() / scale)
}

fn fn_abs(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    match args[0].as_f64() {
        Some(n) => Value::number(n.abs()),
        None => Ok(Value::Undefined),
    }
}

fn fn_sqrt(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    match args[0].as_f64() {
        Some(n) if n < 0.0 => Err(Error::with("D3060", None, vec![n.to_string()])),
        Some(n) => Value::number(n.sqrt()),
        None => Ok(Value::Undefined),
    }
}

fn fn_power(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    let (Some(base), Some(exponent)) = (args[0].as_f64(), args[1].as_f64()) else {
        return Ok(Value::Undefined);
    };
    let result = base.powf(exponent);
    if !result.is_finite() {
        return Err(Error::with(
            "D3061",
            None,
            vec![base.to_string(), exponent.to_string()],
        ));
    }
    Value::number(result)
}

static RNG_STATE: AtomicU64 = AtomicU64::new(0);

fn next_random() -> f64 {
    let mut state = RNG_STATE.load(AtomicOrdering::Relaxed);
    if state == 0 {
        state = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x9E3779B97F4A7C15)
            | 1;
    }
    // xorshift64
    state ^= state << 13;
    state ^= state >> 7;
    state ^= state << 17;
    RNG_STATE.store(state, AtomicOrdering::Relaxed);
    (state >> 11) as f64 / (1u64 << 53) as f64
}

fn fn_random(_ev: &Evaluator<'_>, _args: &[Value]) -> Result<Value, Error> {
    Ok(Value::Float(next_random()))
}

// ---------------------------------------------------------------------------
// booleans
// ---------------------------------------------------------------------------

fn fn_boolean(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    match args[0].to_boolean() {
        Some(b) => Ok(Value::Bool(b)),
        None => Ok(Value::Undefined),
    }
}

fn fn_not(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    match args[0].to_boolean() {
        Some(b) => Ok(Value::Bool(!b)),
        None => Ok(Value::Undefined),
    }
}

// ---------------------------------------------------------------------------
// higher-order functions
// ---------------------------------------------------------------------------

fn fn_map(ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    let arr = &args[0];
    if arr.is_undefined() {
        return Ok(Value::Undefined);
    }
    let func = &args[1];
    let mut results = Vec::new();
    for (index, item) in arr.iter_items().enumerate() {
        let res = apply_with_arity(
            ev,
            func,
            vec![item, Value::Integer(index as i64), arr.clone()],
        )?;
        if !res.is_undefined() {
            results.push(res);
        }
    }
    Ok(Value::sequence_from(results))
}

fn fn_filter(ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    let arr = &args[0];
    if arr.is_undefined() {
        return Ok(Value::Undefined);
    }
    let func = &args[1];
    let mut results = Vec::new();
    for (index, item) in arr.iter_items().enumerate() {
        let res = apply_with_arity(
            ev,
            func,
            vec![item.clone(), Value::Integer(index as i64), arr.clone()],
        )?;
        if boolize(&res) {
            results.push(item);
        }
    }
    Ok(Value::sequence_from(results))
}

fn fn_single(ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    let arr = &args[0];
    if arr.is_undefined() {
        return Ok(Value::Undefined);
    }
    let func = args.get(1);
    let mut found: Option<Value> = None;
    for (index, item) in arr.iter_items().enumerate() {
        let matched = match func {
            Some(f) if f.is_callable() => boolize(&apply_with_arity(
                ev,
                f,
                vec![item.clone(), Value::Integer(index as i64), arr.clone()],
            )?),
            _ => true,
        };
        if matched {
            if found.is_some() {
                return Err(Error::new("D3138", None));
            }
            found = Some(item);
        }
    }
    found.ok_or_else(|| Error::new("D3139", None))
}

fn fn_reduce(ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    let arr = &args[0];
    if arr.is_undefined() {
        return Ok(Value::Undefined);
    }
    let func = &args[1];
    if function_arity(func) < 2 {
        return Err(Error::new("D3050", None));
    }
    let mut items = arr.iter_items();
    let mut acc = match args.get(2) {
        Some(init) if !init.is_undefined() => init.clone(),
        _ => match items.next() {
            Some(first) => first,
            None => return Ok(Value::Undefined),
        },
    };
    for item in items {
        acc = ev.apply(func, vec![acc, item])?;
    }
    Ok(acc)
}

fn fn_sift(ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    let Value::Object(map) = &args[0] else {
        return Ok(Value::Undefined);
    };
    let func = args.get(1);
    let mut result = IndexMap::new();
    for (key, value) in map.iter() {
        let keep = match func {
            Some(f) if f.is_callable() => boolize(&apply_with_arity(
                ev,
                f,
                vec![
                    value.clone(),
                    Value::string(key.clone()),
                    args[0].clone(),
                ],
            )?),
            _ => boolize(value),
        };
        if keep {
            result.insert(key.clone(), value.clone());
        }
    }
    Ok(Value::object(result))
}

fn fn_each(ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    let Value::Object(map) = &args[0] else {
        return Ok(Value::Undefined);
    };
    let func = &args[1];
    let mut results = Vec::new();
    for (key, value) in map.iter() {
        let res = apply_with_arity(
            ev,
            func,
            vec![value.clone(), Value::string(key.clone())],
        )?;
        if !res.is_undefined() {
            results.push(res);
        }
    }
    Ok(Value::sequence_from(results))
}

fn fn_zip(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    let shortest = args.iter().map(Value::len).min().unwrap_or(0);
    let mut rows = Vec::with_capacity(shortest);
    for i in 0..shortest {
        let row: Vec<Value> = args
            .iter()
            .map(|arg| arg.item(i).unwrap_or(Value::Undefined))
            .collect();
        rows.push(Value::array(row));
    }
    Ok(Value::array(rows))
}

fn fn_sort(ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    let arr = &args[0];
    if arr.is_undefined() {
        return Ok(Value::Undefined);
    }
    let items: Vec<Value> = arr.iter_items().collect();
    match args.get(1) {
        Some(func) if func.is_callable() => {
            // the comparator answers: should a come after b?
            let sorted = merge_sort(items, &mut |a, b| {
                let swap = ev.apply(func, vec![a.clone(), b.clone()])?;
                Ok(if boolize(&swap) {
                    Ordering::Greater
                } else {
                    Ordering::Less
                })
            })?;
            Ok(Value::array(sorted))
        }
        _ => {
            let all_numbers = items.iter().all(Value::is_numeric);
            let all_strings = items.iter().all(|v| matches!(v, Value::String(_)));
            if !all_numbers && !all_strings {
                return Err(Error::new("D3070", None));
            }
            let sorted = merge_sort(items, &mut |a, b| {
                Ok(if all_numbers {
                    a.as_f64()
                        .partial_cmp(&b.as_f64())
                        .unwrap_or(Ordering::Equal)
                } else {
                    a.as_str().cmp(&b.as_str())
                })
            })?;
            Ok(Value::array(sorted))
        }
    }
}

fn fn_shuffle(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    let mut items: Vec<Value> = args[0].iter_items().collect();
    for i in (1..items.len()).rev() {
        let j = (next_random() * (i + 1) as f64) as usize % (i + 1);
        items.swap(i, j);
    }
    Ok(Value::array(items))
}

fn fn_distinct(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    let arg = &args[0];
    if !arg.is_array() {
        return Ok(arg.clone());
    }
    let mut seen: Vec<Value> = Vec::new();
    for item in arg.iter_items() {
        if !seen.contains(&item) {
            seen.push(item);
        }
    }
    Ok(Value::sequence_from(seen))
}

// ---------------------------------------------------------------------------
// structure
// ---------------------------------------------------------------------------

fn fn_keys(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    match &args[0] {
        Value::Object(map) => Ok(Value::sequence_from(
            map.keys().map(|k| Value::string(k.clone())).collect(),
        )),
        arr @ (Value::Array(..) | Value::Range(..)) => {
            // the distinct union of the keys of all member objects
            let mut keys: Vec<Value> = Vec::new();
            for item in arr.iter_items() {
                if let Value::Object(map) = item {
                    for k in map.keys() {
                        let key = Value::string(k.clone());
                        if !keys.contains(&key) {
                            keys.push(key);
                        }
                    }
                }
            }
            Ok(Value::sequence_from(keys))
        }
        _ => Ok(Value::Undefined),
    }
}

fn fn_lookup(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    match args[1].as_str() {
        Some(key) => Ok(lookup_value(&args[0], key)),
        None => Ok(Value::Undefined),
    }
}

fn fn_append(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    Ok(append(args[0].clone(), args[1].clone()))
}

fn fn_exists(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    Ok(Value::Bool(!args[0].is_undefined()))
}

fn fn_spread(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    fn spread_object(map: &IndexMap<String, Value>, out: &mut Vec<Value>) {
        for (k, v) in map.iter() {
            let mut entry = IndexMap::new();
            entry.insert(k.clone(), v.clone());
            out.push(Value::object(entry));
        }
    }
    match &args[0] {
        Value::Undefined => Ok(Value::Undefined),
        Value::Object(map) => {
            let mut out = Vec::new();
            spread_object(map, &mut out);
            Ok(Value::sequence_from(out))
        }
        arr @ (Value::Array(..) | Value::Range(..)) => {
            let mut out = Vec::new();
            for item in arr.iter_items() {
                match item {
                    Value::Object(map) => spread_object(&map, &mut out),
                    other => out.push(other),
                }
            }
            Ok(Value::sequence_from(out))
        }
        other => Ok(other.clone()),
    }
}

fn fn_merge(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    let arg = &args[0];
    if arg.is_undefined() {
        return Ok(Value::Undefined);
    }
    let mut result = IndexMap::new();
    for item in arg.iter_items() {
        if let Value::Object(map) = item {
            for (k, v) in map.iter() {
                result.insert(k.clone(), v.clone());
            }
        }
    }
    Ok(Value::object(result))
}

fn fn_reverse(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    let mut items: Vec<Value> = args[0].iter_items().collect();
    items.reverse();
    Ok(Value::array(items))
}

fn fn_type(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    match &args[0] {
        Value::Undefined => Ok(Value::Undefined),
        other => Ok(Value::string(other.type_name())),
    }
}

// ---------------------------------------------------------------------------
// errors and assertions
// ---------------------------------------------------------------------------

fn fn_error(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    let message = args
        .first()
        .and_then(Value::as_str)
        .unwrap_or("$error() function evaluated")
        .to_string();
    Err(Error::with("D3137", None, vec![message]))
}

fn fn_assert(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    if boolize(&args[0]) {
        return Ok(Value::Undefined);
    }
    let message = args
        .get(1)
        .and_then(Value::as_str)
        .unwrap_or("$assert() statement failed")
        .to_string();
    Err(Error::with("D3141", None, vec![message]))
}

// ---------------------------------------------------------------------------
// encoding
// ---------------------------------------------------------------------------

fn fn_base64_encode(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    match args[0].as_str() {
        Some(s) => Ok(Value::string(BASE64.encode(s.as_bytes()))),
        None => Ok(Value::Undefined),
    }
}

fn fn_base64_decode(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    let Some(s) = args[0].as_str() else {
        return Ok(Value::Undefined);
    };
    match BASE64.decode(s.as_bytes()) {
        Ok(bytes) => match String::from_utf8(bytes) {
            Ok(decoded) => Ok(Value::string(decoded)),
            Err(_) => Ok(Value::Undefined),
        },
        Err(_) => Ok(Value::Undefined),
    }
}

fn percent_encode(s: &str, keep: fn(char) -> bool) -> String {
    let mut out = String::new();
    for c in s.chars() {
        if keep(c) {
            out.push(c);
        } else {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).as_bytes() {
                out.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    out
}

fn component_unreserved(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-_.!~*'()".contains(c)
}

fn url_unreserved(c: char) -> bool {
    component_unreserved(c) || ";/?:@&=+$,#".contains(c)
}

fn fn_encode_url_component(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    match args[0].as_str() {
        Some(s) => Ok(Value::string(percent_encode(s, component_unreserved))),
        None => Ok(Value::Undefined),
    }
}

fn fn_encode_url(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    match args[0].as_str() {
        Some(s) => Ok(Value::string(percent_encode(s, url_unreserved))),
        None => Ok(Value::Undefined),
    }
}

fn fn_decode_url(_ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    let Some(s) = args[0].as_str() else {
        return Ok(Value::Undefined);
    };
    let mut bytes = Vec::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '%' {
            let hex: String = chars.by_ref().take(2).collect();
            match u8::from_str_radix(&hex, 16) {
                Ok(byte) => bytes.push(byte),
                Err(_) => return Ok(Value::Undefined),
            }
        } else {
            let mut buf = [0u8; 4];
            bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
        }
    }
    match String::from_utf8(bytes) {
        Ok(decoded) => Ok(Value::string(decoded)),
        Err(_) => Ok(Value::Undefined),
    }
}

// ---------------------------------------------------------------------------
// dynamic evaluation
// ---------------------------------------------------------------------------

fn fn_eval(ev: &Evaluator<'_>, args: &[Value]) -> Result<Value, Error> {
    let Some(source) = args[0].as_str() else {
        return Ok(Value::Undefined);
    };
    let focus = match args.get(1) {
        Some(focus) if !focus.is_undefined() => focus.clone(),
        _ => ev.input.borrow().clone(),
    };
    let parsed = crate::parser::parse_source(source, false)
        .map_err(|e| Error::with("D3120", None, vec![e.to_string()]))?;
    let frame = Frame::with_parent(&ev.root);
    let sub = Evaluator::new(&parsed.slots, ev.root.clone());
    sub.eval(&parsed.ast, &focus, &frame).map_err(|e| {
        if e.is_resource_limit() {
            e
        } else {
            Error::with("D3121", None, vec![e.to_string()])
        }
    })
}
