//! The tree-walking evaluator.
//!
//! Evaluation of a node against `(input, environment)` yields a single value
//! or a typed error. Path evaluation iterates steps over input sequences;
//! when a step binds focus (`@`), index (`#`), or ancestor (`%`) variables the
//! evaluation switches to a *tuple stream* threading correlated bindings so
//! later steps, sorting, and grouping can reference them.
//!
//! Function application validates arguments against compiled signatures and
//! runs a trampoline: a lambda body rewritten into a tail-call thunk is
//! unpacked and re-applied in a loop instead of recursing, which keeps deep
//! tail recursion off the call stack.
//!
//! A parsed [`Expression`] is immutable and shareable across threads; every
//! `evaluate` call builds its own [`Evaluator`] context, so no state is ever
//! shared between concurrent evaluations.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;
use std::sync::LazyLock;

use indexmap::IndexMap;
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};

use crate::Expression;
use crate::ast::nodes::{GroupPairs, Node, NodeKind, Slot, SortTerm, Stage};
use crate::ast::operators::BinaryOp;
use crate::error::Error;
use crate::frame::Frame;
use crate::functions;
use crate::signature::Signature;
use crate::value::{ArrayFlags, FunctionValue, LambdaFn, PartialFn, TransformerFn, Value};

/// The function-composition lambda used by `lhs ~> rhs` when both sides are
/// functions. Parsed once per process.
static CHAIN: LazyLock<Expression> = LazyLock::new(|| {
    crate::parser::parse_source("function($f, $g) { function($x){ $g($f($x)) } }", false)
        .expect("chain lambda parses")
});

/// Signature of the transformer functions produced by `|...|...|`.
static TRANSFORMER_SIGNATURE: LazyLock<Signature> =
    LazyLock::new(|| Signature::new("<(oa):o>", "transform").expect("valid signature"));

impl Expression {
    /// Evaluate against an input value with the builtin library in scope.
    pub fn evaluate(&self, input: Value) -> Result<Value, Error> {
        self.evaluate_with_options(input, &[], None)
    }

    /// Evaluate with additional variable bindings merged into the root frame.
    pub fn evaluate_with_bindings(
        &self,
        input: Value,
        bindings: &[(&str, Value)],
    ) -> Result<Value, Error> {
        self.evaluate_with_options(input, bindings, None)
    }

    /// Evaluate under cooperative runtime bounds: wall-clock timeout and a
    /// maximum evaluation depth, checked at every evaluation entry and exit.
    pub fn evaluate_timeboxed(
        &self,
        input: Value,
        timeout_ms: u64,
        max_depth: usize,
    ) -> Result<Value, Error> {
        self.evaluate_with_options(input, &[], Some((timeout_ms, max_depth)))
    }

    /// Evaluate with bindings and optional runtime bounds
    /// `(timeout_ms, max_depth)` in one call.
    pub fn evaluate_with_options(
        &self,
        input: Value,
        bindings: &[(&str, Value)],
        bounds: Option<(u64, usize)>,
    ) -> Result<Value, Error> {
        let env = Frame::new();
        functions::bind_builtins(&env);
        for (name, value) in bindings {
            env.bind(*name, value.clone());
        }
        if let Some((timeout_ms, max_depth)) = bounds {
            env.set_runtime_bounds(timeout_ms, max_depth);
        }

        // wrap a top-level array so `$` refers to the whole array
        let input = match input {
            arr @ Value::Array(..) | arr @ Value::Range(..) => Value::array_with(
                vec![arr],
                ArrayFlags {
                    sequence: true,
                    outer_wrapper: true,
                    ..ArrayFlags::default()
                },
            ),
            other => other,
        };
        env.bind("$", input.clone());

        let evaluator = Evaluator::new(&self.slots, env.clone());
        evaluator.eval(&self.ast, &input, &env)
    }
}

/// Per-call interpreter context: the expression's ancestor-slot arena, the
/// root frame, and the transient "current input" used by `$eval`.
pub struct Evaluator<'a> {
    slots: &'a [Slot],
    pub(crate) root: Frame,
    pub(crate) input: RefCell<Value>,
}

impl<'a> Evaluator<'a> {
    pub(crate) fn new(slots: &'a [Slot], root: Frame) -> Evaluator<'a> {
        Evaluator {
            slots,
            root,
            input: RefCell::new(Value::Undefined),
        }
    }

    /// Evaluate one node. The entry/exit hooks of the runtime guard and the
    /// sequence-mangling rules (empty sequence → no value, singleton sequence
    /// → its element) live here.
    pub fn eval(&self, expr: &Node, input: &Value, env: &Frame) -> Result<Value, Error> {
        *self.input.borrow_mut() = input.clone();

        let timebox = if env.is_parallel() {
            None
        } else {
            env.timebox()
        };
        if let Some(tb) = &timebox {
            tb.enter()?;
        }

        let mut result = self.eval_kind(expr, input, env)?;

        if let Some(predicates) = &expr.predicates {
            for predicate in predicates {
                result = self.eval_filter(predicate, result, env)?;
            }
        }
        if !expr.is_path()
            && let Some(group) = &expr.group
        {
            result = self.eval_group(group, result, env)?;
        }

        if let Some(tb) = &timebox {
            tb.exit()?;
        }

        if result.is_sequence() && !result.is_tuple_stream() {
            let mut flags = result.flags();
            if expr.keep_array {
                flags.keep_singleton = true;
            }
            if result.is_empty() {
                result = Value::Undefined;
            } else if result.len() == 1 && !flags.keep_singleton {
                result = result.item(0).expect("length checked");
            } else {
                result = result.with_flags(flags);
            }
        }
        Ok(result)
    }

    fn eval_kind(&self, expr: &Node, input: &Value, env: &Frame) -> Result<Value, Error> {
        match &expr.kind {
            NodeKind::Literal(lit) => Ok(lit.to_value()),
            NodeKind::Name(name) => Ok(functions::lookup_value(input, name)),
            NodeKind::Regex(re) => Ok(Value::Regex(re.clone())),
            NodeKind::Wildcard => Ok(self.eval_wildcard(input)),
            NodeKind::Descendant => Ok(eval_descendants(input)),
            NodeKind::Parent { slot } => Ok(env
                .lookup(&self.slots[*slot].label)
                .unwrap_or(Value::Undefined)),
            NodeKind::Placeholder => Ok(Value::Undefined),

            NodeKind::Variable(name) => {
                if name.is_empty() {
                    // bare `$` refers to the context value
                    if input.flags().outer_wrapper {
                        Ok(input.item(0).unwrap_or(Value::Undefined))
                    } else {
                        Ok(input.clone())
                    }
                } else {
                    Ok(env.lookup(name).unwrap_or(Value::Undefined))
                }
            }

            NodeKind::Path {
                steps,
                keep_singleton_array,
            } => self.eval_path(expr, steps, *keep_singleton_array, input, env),

            NodeKind::Negate(inner) => {
                let value = self.eval(inner, input, env)?;
                match value {
                    Value::Undefined => Ok(Value::Undefined),
                    v if v.is_numeric() => Value::number(-v.as_f64().expect("numeric")),
                    v => Err(Error::with(
                        "D1002",
                        Some(expr.position),
                        vec![v.describe()],
                    )),
                }
            }

            NodeKind::ArrayCtor { exprs } => {
                let saved_parallel = env.is_parallel();
                let mut items: Vec<Value> = Vec::new();
                for (idx, item_expr) in exprs.iter().enumerate() {
                    env.set_parallel(idx > 0);
                    let value = self.eval(item_expr, input, env);
                    env.set_parallel(saved_parallel);
                    let value = value?;
                    if value.is_undefined() {
                        continue;
                    }
                    if matches!(item_expr.kind, NodeKind::ArrayCtor { .. }) {
                        // nested constructor stays nested
                        items.push(value);
                    } else if value.is_array() {
                        items.extend(value.iter_items());
                    } else {
                        items.push(value);
                    }
                }
                let flags = ArrayFlags {
                    cons: expr.cons,
                    ..ArrayFlags::default()
                };
                Ok(Value::array_with(items, flags))
            }

            NodeKind::ObjectCtor(pairs) => self.eval_group(pairs, input.clone(), env),

            NodeKind::Block { exprs } => {
                // a new frame limits the scope of variable assignments
                let frame = Frame::with_parent(env);
                let mut result = Value::Undefined;
                for e in exprs {
                    result = self.eval(e, input, &frame)?;
                }
                Ok(result)
            }

            NodeKind::Binary { op, lhs, rhs } => {
                self.eval_binary(*op, lhs, rhs, expr.position, input, env)
            }

            NodeKind::Bind { name, rhs } => {
                let value = self.eval(rhs, input, env)?;
                env.bind(name.clone(), value.clone());
                Ok(value)
            }

            NodeKind::Condition {
                condition,
                then,
                otherwise,
            } => {
                let test = self.eval(condition, input, env)?;
                if boolize(&test) {
                    self.eval(then, input, env)
                } else if let Some(otherwise) = otherwise {
                    self.eval(otherwise, input, env)
                } else {
                    Ok(Value::Undefined)
                }
            }

            NodeKind::FunctionCall { procedure, args } => {
                self.eval_function(procedure, args, expr.position, input, env, None)
            }

            NodeKind::PartialCall { procedure, args } => {
                self.eval_partial(procedure, args, expr.position, input, env)
            }

            NodeKind::Lambda {
                params,
                body,
                signature,
                thunk,
            } => Ok(Value::Function(FunctionValue::Lambda(Rc::new(LambdaFn {
                params: params.clone(),
                body: body.clone(),
                environment: env.clone(),
                input: input.clone(),
                signature: signature.clone(),
                thunk: *thunk,
            })))),

            NodeKind::Apply { lhs, rhs } => self.eval_apply(lhs, rhs, input, env),

            NodeKind::Transform {
                pattern,
                update,
                delete,
            } => Ok(Value::Function(FunctionValue::Transformer(Rc::new(
                TransformerFn {
                    pattern: pattern.clone(),
                    update: update.clone(),
                    delete: delete.clone(),
                    environment: env.clone(),
                },
            )))),

            NodeKind::Sort { terms } => self.eval_sort(terms, input, env, expr.position),

            NodeKind::Error { error } => Err(error.clone()),
        }
    }

    // ------------------------------------------------------------------
    // paths
    // ------------------------------------------------------------------

    fn eval_path(
        &self,
        expr: &Node,
        steps: &[Node],
        keep_singleton_array: bool,
        input: &Value,
        env: &Frame,
    ) -> Result<Value, Error> {
        // a path starting with a variable reference is absolute, not relative
        let first_is_variable = matches!(
            steps.first().map(|s| &s.kind),
            Some(NodeKind::Variable(_))
        );
        let mut input_seq = if input.is_array() && !first_is_variable {
            input.clone()
        } else {
            Value::sequence_of(input.clone())
        };

        let mut result = Value::Undefined;
        let mut is_tuple_stream = false;
        let mut tuple_bindings = Value::Undefined;

        let last = steps.len().saturating_sub(1);
        for (ii, step) in steps.iter().enumerate() {
            if step.tuple {
                is_tuple_stream = true;
            }
            if ii == 0 && step.cons {
                // an explicit array constructor first step is evaluated once,
                // not iterated over the context array
                result = self.eval(step, &input_seq, env)?;
            } else if is_tuple_stream {
                tuple_bindings =
                    self.eval_tuple_step(step, &input_seq, &tuple_bindings, env)?;
            } else {
                result = self.eval_step(step, &input_seq, env, ii == last)?;
            }

            if !is_tuple_stream && (result.is_undefined() || result.is_empty()) {
                break;
            }
            if step.focus.is_none() {
                input_seq = result.clone();
            }
        }

        if is_tuple_stream {
            if expr.tuple {
                // the tuple stream carries ancestry for an enclosing path
                result = tuple_bindings.clone();
            } else {
                let items: Vec<Value> = tuple_bindings
                    .iter_items()
                    .map(|binding| match &binding {
                        Value::Object(map) => {
                            map.get("@").cloned().unwrap_or(Value::Undefined)
                        }
                        _ => Value::Undefined,
                    })
                    .collect();
                result = Value::sequence_from(items);
            }
        }

        if keep_singleton_array && result.is_array() {
            let mut flags = result.flags();
            // an array explicitly constructed in the expression is promoted
            // to a singleton sequence rather than flagged directly
            if flags.cons && !flags.sequence {
                result = Value::sequence_of(result);
                flags = result.flags();
            }
            flags.keep_singleton = true;
            result = result.with_flags(flags);
        }

        if let Some(group) = &expr.group {
            let grouped_input = if is_tuple_stream {
                tuple_bindings
            } else {
                result
            };
            result = self.eval_group(group, grouped_input, env)?;
        }

        Ok(result)
    }

    /// One step of a plain (non-tuple) path: evaluate the step expression per
    /// input item, apply stages, then flatten into the result sequence.
    fn eval_step(
        &self,
        step: &Node,
        input: &Value,
        env: &Frame,
        last_step: bool,
    ) -> Result<Value, Error> {
        if let NodeKind::Sort { terms } = &step.kind {
            let mut result = self.eval_sort(terms, input, env, step.position)?;
            if let Some(stages) = &step.stages {
                result = self.eval_stages(stages, result, env)?;
            }
            return Ok(result);
        }

        let mut collected: Vec<Value> = Vec::new();
        for item in input.iter_items() {
            let mut res = self.eval(step, &item, env)?;
            if let Some(stages) = &step.stages {
                for stage in stages {
                    if let Stage::Filter(predicate) = stage {
                        res = self.eval_filter(predicate, res, env)?;
                    }
                }
            }
            if !res.is_undefined() {
                collected.push(res);
            }
        }

        if last_step
            && collected.len() == 1
            && collected[0].is_array()
            && !collected[0].is_sequence()
        {
            return Ok(collected.into_iter().next().expect("length checked"));
        }

        // flatten, except for explicitly constructed arrays
        let mut out: Vec<Value> = Vec::new();
        for res in collected {
            if !res.is_array() || res.flags().cons {
                out.push(res);
            } else {
                out.extend(res.iter_items());
            }
        }
        Ok(Value::sequence_from(out))
    }

    /// One step of a tuple-stream path: thread the bindings through the step,
    /// adding focus/index/ancestor entries as the step dictates.
    fn eval_tuple_step(
        &self,
        step: &Node,
        input: &Value,
        tuple_bindings: &Value,
        env: &Frame,
    ) -> Result<Value, Error> {
        if let NodeKind::Sort { terms } = &step.kind {
            let mut result;
            if !tuple_bindings.is_undefined() {
                result = self.eval_sort(terms, tuple_bindings, env, step.position)?;
            } else {
                let sorted = self.eval_sort(terms, input, env, step.position)?;
                let mut tuples: Vec<Value> = Vec::new();
                for (ss, item) in sorted.iter_items().enumerate() {
                    let mut map = IndexMap::new();
                    map.insert("@".to_string(), item);
                    if let Some(index_var) = &step.index {
                        map.insert(index_var.clone(), Value::Integer(ss as i64));
                    }
                    tuples.push(Value::object(map));
                }
                result = Value::array_with(
                    tuples,
                    ArrayFlags {
                        sequence: true,
                        tuple_stream: true,
                        ..ArrayFlags::default()
                    },
                );
            }
            if let Some(stages) = &step.stages {
                result = self.eval_stages(stages, result, env)?;
            }
            return Ok(result);
        }

        let bindings: Vec<Value> = if tuple_bindings.is_undefined() {
            input
                .iter_items()
                .filter(|item| !item.is_undefined())
                .map(|item| {
                    let mut map = IndexMap::new();
                    map.insert("@".to_string(), item);
                    Value::object(map)
                })
                .collect()
        } else {
            tuple_bindings.iter_items().collect()
        };

        let mut out: Vec<Value> = Vec::new();
        for binding in &bindings {
            let binding_map = match binding {
                Value::Object(map) => map.clone(),
                _ => continue,
            };
            let context = binding_map.get("@").cloned().unwrap_or(Value::Undefined);
            let step_env = self.frame_from_tuple(env, &binding_map);
            let res = self.eval(step, &context, &step_env)?;
            if res.is_undefined() {
                continue;
            }
            let res_is_tuple = res.is_tuple_stream();
            let items: Vec<Value> = if res.is_array() {
                res.iter_items().collect()
            } else {
                vec![res]
            };
            for (bb, item) in items.into_iter().enumerate() {
                let mut tuple: IndexMap<String, Value> = binding_map.as_ref().clone();
                if res_is_tuple {
                    // the nested step already produced bindings; merge them
                    if let Value::Object(inner) = &item {
                        for (k, v) in inner.iter() {
                            tuple.insert(k.clone(), v.clone());
                        }
                    }
                } else {
                    if let Some(focus) = &step.focus {
                        tuple.insert(focus.clone(), item);
                        tuple.insert("@".to_string(), context.clone());
                    } else {
                        tuple.insert("@".to_string(), item);
                    }
                    if let Some(index_var) = &step.index {
                        tuple.insert(index_var.clone(), Value::Integer(bb as i64));
                    }
                    if let Some(slot) = step.ancestor {
                        tuple.insert(self.slots[slot].label.clone(), context.clone());
                    }
                }
                out.push(Value::object(tuple));
            }
        }

        let mut result = Value::array_with(
            out,
            ArrayFlags {
                sequence: true,
                tuple_stream: true,
                ..ArrayFlags::default()
            },
        );
        if let Some(stages) = &step.stages {
            result = self.eval_stages(stages, result, env)?;
        }
        Ok(result)
    }

    fn eval_stages(&self, stages: &[Stage], input: Value, env: &Frame) -> Result<Value, Error> {
        let mut result = input;
        for stage in stages {
            match stage {
                Stage::Filter(predicate) => {
                    result = self.eval_filter(predicate, result, env)?;
                }
                Stage::Index(var) => {
                    // record the running position in each tuple
                    if let Value::Array(items, flags) = &result {
                        let mut items = items.as_ref().clone();
                        for (ee, tuple) in items.iter_mut().enumerate() {
                            if let Value::Object(map) = tuple {
                                Rc::make_mut(map)
                                    .insert(var.clone(), Value::Integer(ee as i64));
                            }
                        }
                        result = Value::array_with(items, *flags);
                    }
                }
            }
        }
        Ok(result)
    }

    /// Apply a filter predicate: a number selects by (possibly end-relative)
    /// index, an array of numbers selects all matching positions, anything
    /// else keeps items where the predicate is truthy.
    fn eval_filter(&self, predicate: &Node, input: Value, env: &Frame) -> Result<Value, Error> {
        let input = if input.is_array() {
            input
        } else {
            Value::sequence_of(input)
        };
        let tuple = input.is_tuple_stream();
        let out_flags = ArrayFlags {
            sequence: true,
            tuple_stream: tuple,
            ..ArrayFlags::default()
        };
        let mut results: Vec<Value> = Vec::new();

        if let NodeKind::Literal(
            lit @ (crate::ast::nodes::Literal::Integer(_) | crate::ast::nodes::Literal::Float(_)),
        ) = &predicate.kind
        {
            // index arithmetic truncates toward zero
            let mut index = lit.to_value().as_f64().expect("numeric literal").trunc() as i64;
            if index < 0 {
                index += input.len() as i64;
            }
            if index >= 0
                && let Some(item) = input.item(index as usize)
                && !item.is_undefined()
            {
                if item.is_array() {
                    return Ok(item);
                }
                results.push(item);
            }
            return Ok(Value::array_with(results, out_flags));
        }

        for (index, item) in input.iter_items().enumerate() {
            let (context, item_env) = if tuple {
                match &item {
                    Value::Object(map) => (
                        map.get("@").cloned().unwrap_or(Value::Undefined),
                        self.frame_from_tuple(env, map),
                    ),
                    _ => (item.clone(), env.clone()),
                }
            } else {
                (item.clone(), env.clone())
            };
            let mut res = self.eval(predicate, &context, &item_env)?;
            if res.is_numeric() {
                res = Value::sequence_of(res);
            }
            if is_array_of_numbers(&res) {
                for ires in res.iter_items() {
                    let mut ii = ires.as_f64().expect("numeric").trunc() as i64;
                    if ii < 0 {
                        ii += input.len() as i64;
                    }
                    if ii == index as i64 {
                        results.push(item.clone());
                    }
                }
            } else if boolize(&res) {
                results.push(item.clone());
            }
        }
        Ok(Value::array_with(results, out_flags))
    }

    // ------------------------------------------------------------------
    // operators
    // ------------------------------------------------------------------

    fn eval_binary(
        &self,
        op: BinaryOp,
        lhs: &Node,
        rhs: &Node,
        position: usize,
        input: &Value,
        env: &Frame,
    ) -> Result<Value, Error> {
        if matches!(op, BinaryOp::And | BinaryOp::Or) {
            // the right side is evaluated lazily to allow short-circuiting
            let left = self.eval(lhs, input, env)?;
            let lb = boolize(&left);
            let result = match op {
                BinaryOp::And => lb && boolize(&self.eval(rhs, input, env)?),
                _ => lb || boolize(&self.eval(rhs, input, env)?),
            };
            return Ok(Value::Bool(result));
        }

        let left = self.eval(lhs, input, env)?;
        let right = self.eval(rhs, input, env)?;
        match op {
            BinaryOp::Add
            | BinaryOp::Subtract
            | BinaryOp::Multiply
            | BinaryOp::Divide
            | BinaryOp::Modulo => numeric_binop(op, &left, &right, position),
            BinaryOp::Equal => Ok(equality(&left, &right, true)),
            BinaryOp::NotEqual => Ok(equality(&left, &right, false)),
            BinaryOp::LessThan
            | BinaryOp::LessEqual
            | BinaryOp::GreaterThan
            | BinaryOp::GreaterEqual => comparison(op, &left, &right, position),
            BinaryOp::Concat => {
                let mut out = String::new();
                if !left.is_undefined() {
                    out.push_str(&functions::stringify(&left));
                }
                if !right.is_undefined() {
                    out.push_str(&functions::stringify(&right));
                }
                Ok(Value::string(out))
            }
            BinaryOp::In => Ok(includes(&left, &right)),
            BinaryOp::Range => range_op(&left, &right, position),
            // And/Or are short-circuited above with an early return.
            BinaryOp::And | BinaryOp::Or => unreachable!(),
        }
    }

    // ------------------------------------------------------------------
    // grouping and sorting
    // ------------------------------------------------------------------

    /// Group the input sequence by the key expressions, then evaluate each
    /// value expression once per distinct key.
    pub(crate) fn eval_group(
        &self,
        group: &GroupPairs,
        input: Value,
        env: &Frame,
    ) -> Result<Value, Error> {
        struct GroupEntry {
            data: Value,
            expr_index: usize,
        }

        let reduce = input.is_tuple_stream();
        let input = if input.is_array() {
            input
        } else {
            Value::sequence_of(input)
        };
        // an empty sequence still evaluates the keys once, so a literal
        // object can be produced from no input
        let items: Vec<Value> = if input.is_empty() {
            vec![Value::Undefined]
        } else {
            input.iter_items().collect()
        };

        let mut groups: IndexMap<String, GroupEntry> = IndexMap::new();
        for item in &items {
            let (context, item_env) = if reduce {
                match item {
                    Value::Object(map) => (
                        map.get("@").cloned().unwrap_or(Value::Undefined),
                        self.frame_from_tuple(env, map),
                    ),
                    _ => (item.clone(), env.clone()),
                }
            } else {
                (item.clone(), env.clone())
            };
            for (pair_index, (key_expr, _)) in group.pairs.iter().enumerate() {
                let key = self.eval(key_expr, &context, &item_env)?;
                match key {
                    Value::Undefined => {}
                    Value::String(key) => {
                        match groups.get_mut(key.as_ref()) {
                            Some(entry) => {
                                if entry.expr_index != pair_index {
                                    // the same key from different expressions is ambiguous
                                    return Err(Error::with(
                                        "D1009",
                                        Some(group.position),
                                        vec![key.to_string()],
                                    ));
                                }
                                entry.data =
                                    functions::append(entry.data.clone(), item.clone());
                            }
                            None => {
                                groups.insert(
                                    key.to_string(),
                                    GroupEntry {
                                        data: item.clone(),
                                        expr_index: pair_index,
                                    },
                                );
                            }
                        }
                    }
                    other => {
                        return Err(Error::with(
                            "T1003",
                            Some(group.position),
                            vec![other.describe()],
                        ));
                    }
                }
            }
        }

        let saved_parallel = env.is_parallel();
        let mut result: IndexMap<String, Value> = IndexMap::new();
        for (idx, (key, entry)) in groups.into_iter().enumerate() {
            let (context, value_env) = if reduce {
                let mut tuple = reduce_tuple_stream(&entry.data);
                let context = tuple.shift_remove("@").unwrap_or(Value::Undefined);
                (context, self.frame_from_map(env, &tuple))
            } else {
                (entry.data, env.clone())
            };
            value_env.set_parallel(idx > 0);
            let value = self.eval(&group.pairs[entry.expr_index].1, &context, &value_env);
            value_env.set_parallel(false);
            let value = value?;
            if !value.is_undefined() {
                result.insert(key, value);
            }
        }
        env.set_parallel(saved_parallel);
        Ok(Value::object(result))
    }

    /// Stable multi-term sort; the first non-zero term decides.
    fn eval_sort(
        &self,
        terms: &[SortTerm],
        input: &Value,
        env: &Frame,
        position: usize,
    ) -> Result<Value, Error> {
        if !input.is_array() {
            return Ok(input.clone());
        }
        let tuple_sort = input.is_tuple_stream();
        let items: Vec<Value> = input.iter_items().collect();
        let sorted = functions::merge_sort(items, &mut |a, b| {
            self.sort_compare(terms, a, b, tuple_sort, env, position)
        })?;
        Ok(Value::array_with(sorted, input.flags()))
    }

    fn sort_compare(
        &self,
        terms: &[SortTerm],
        a: &Value,
        b: &Value,
        tuple_sort: bool,
        env: &Frame,
        position: usize,
    ) -> Result<Ordering, Error> {
        for term in terms {
            let aa = self.eval_sort_term(&term.expression, a, tuple_sort, env)?;
            let bb = self.eval_sort_term(&term.expression, b, tuple_sort, env)?;

            // undefined sorts after anything defined
            if aa.is_undefined() {
                if bb.is_undefined() {
                    continue;
                }
                return Ok(Ordering::Greater);
            }
            if bb.is_undefined() {
                return Ok(Ordering::Less);
            }

            let a_ok = aa.is_numeric() || matches!(aa, Value::String(_));
            let b_ok = bb.is_numeric() || matches!(bb, Value::String(_));
            if !a_ok || !b_ok {
                return Err(Error::with(
                    "T2008",
                    Some(position),
                    vec![aa.describe(), bb.describe()],
                ));
            }

            let ord = if aa.is_numeric() && bb.is_numeric() {
                aa.as_f64()
                    .partial_cmp(&bb.as_f64())
                    .unwrap_or(Ordering::Equal)
            } else if let (Value::String(x), Value::String(y)) = (&aa, &bb) {
                x.cmp(y)
            } else {
                return Err(Error::with(
                    "T2007",
                    Some(position),
                    vec![aa.describe(), bb.describe()],
                ));
            };
            if ord == Ordering::Equal {
                continue;
            }
            return Ok(if term.descending { ord.reverse() } else { ord });
        }
        Ok(Ordering::Equal)
    }

    fn eval_sort_term(
        &self,
        expression: &Node,
        item: &Value,
        tuple_sort: bool,
        env: &Frame,
    ) -> Result<Value, Error> {
        if tuple_sort && let Value::Object(map) = item {
            let context = map.get("@").cloned().unwrap_or(Value::Undefined);
            let term_env = self.frame_from_tuple(env, map);
            self.eval(expression, &context, &term_env)
        } else {
            self.eval(expression, item, env)
        }
    }

    // ------------------------------------------------------------------
    // functions
    // ------------------------------------------------------------------

    fn eval_function(
        &self,
        procedure: &Node,
        args: &[Node],
        position: usize,
        input: &Value,
        env: &Frame,
        applyto: Option<Value>,
    ) -> Result<Value, Error> {
        let proc = self.eval(procedure, input, env)?;

        if proc.is_undefined()
            && let Some(name) = leading_name(procedure)
            && env.lookup(name).is_some()
        {
            // the user probably forgot the leading $
            return Err(Error::with("T1005", Some(position), vec![name.to_string()]));
        }

        let mut evaluated = Vec::with_capacity(args.len() + 1);
        if let Some(context) = applyto {
            evaluated.push(context);
        }
        for arg in args {
            evaluated.push(self.eval(arg, input, env)?);
        }

        if !proc.is_callable() {
            return Err(Error::new("T1006", Some(position)));
        }
        self.apply_function(&proc, evaluated, input).map_err(|mut e| {
            if e.position.is_none() {
                e.position = Some(position);
            }
            e
        })
    }

    /// Apply a function value to already-evaluated arguments. Consumes
    /// tail-call thunks in a trampoline loop so tail recursion does not grow
    /// the call stack.
    pub fn apply_function(
        &self,
        proc: &Value,
        args: Vec<Value>,
        context: &Value,
    ) -> Result<Value, Error> {
        let mut result = self.apply_inner(proc, args, context)?;
        loop {
            let thunk = match &result {
                Value::Function(FunctionValue::Lambda(lambda)) if lambda.thunk => lambda.clone(),
                _ => break,
            };
            let NodeKind::FunctionCall {
                procedure,
                args: thunk_args,
            } = &thunk.body.kind
            else {
                break;
            };
            let next = self.eval(procedure, &thunk.input, &thunk.environment)?;
            let mut evaluated = Vec::with_capacity(thunk_args.len());
            for arg in thunk_args {
                evaluated.push(self.eval(arg, &thunk.input, &thunk.environment)?);
            }
            result = self.apply_inner(&next, evaluated, context)?;
        }
        Ok(result)
    }

    /// Convenience for builtins applying function arguments.
    pub fn apply(&self, proc: &Value, args: Vec<Value>) -> Result<Value, Error> {
        self.apply_function(proc, args, &Value::Undefined)
    }

    fn apply_inner(
        &self,
        proc: &Value,
        args: Vec<Value>,
        context: &Value,
    ) -> Result<Value, Error> {
        match proc {
            Value::Function(FunctionValue::Lambda(lambda)) => {
                let validated = match &lambda.signature {
                    Some(signature) => signature.validate(&args, context)?,
                    None => args,
                };
                let frame = Frame::with_parent(&lambda.environment);
                for (param, arg) in lambda.params.iter().zip(validated) {
                    frame.bind(param.clone(), arg);
                }
                self.eval(&lambda.body, &lambda.input, &frame)
            }
            Value::Function(FunctionValue::Native(native)) => {
                let validated = native.signature.validate(&args, context)?;
                (native.implementation)(self, &validated)
            }
            Value::Function(FunctionValue::Partial(partial)) => {
                let mut supplied = args.into_iter();
                let mut filled = Vec::with_capacity(partial.bound.len());
                for slot in &partial.bound {
                    match slot {
                        Some(value) => filled.push(value.clone()),
                        None => filled.push(supplied.next().unwrap_or(Value::Undefined)),
                    }
                }
                filled.extend(supplied);
                self.apply_inner(&Value::Function(partial.target.clone()), filled, context)
            }
            Value::Function(FunctionValue::Transformer(transformer)) => {
                let validated = TRANSFORMER_SIGNATURE.validate(&args, context)?;
                let obj = validated.into_iter().next().unwrap_or(Value::Undefined);
                self.apply_transformer(transformer, obj)
            }
            Value::Regex(re) => {
                // a regex applied as a function keeps the strings it matches
                let matches: Vec<Value> = args
                    .iter()
                    .filter(|v| v.as_str().map(|s| re.is_match(s)).unwrap_or(false))
                    .cloned()
                    .collect();
                Ok(Value::sequence_from(matches))
            }
            _ => Err(Error::new("T1006", None)),
        }
    }

    fn eval_partial(
        &self,
        procedure: &Node,
        args: &[Node],
        position: usize,
        input: &Value,
        env: &Frame,
    ) -> Result<Value, Error> {
        // placeholders stay open; everything else is evaluated eagerly
        let mut evaluated: Vec<Option<Value>> = Vec::with_capacity(args.len());
        for arg in args {
            match arg.kind {
                NodeKind::Placeholder => evaluated.push(None),
                _ => evaluated.push(Some(self.eval(arg, input, env)?)),
            }
        }
        let proc = self.eval(procedure, input, env)?;

        if proc.is_undefined()
            && let Some(name) = leading_name(procedure)
            && env.lookup(name).is_some()
        {
            return Err(Error::with("T1007", Some(position), vec![name.to_string()]));
        }

        match &proc {
            Value::Function(FunctionValue::Lambda(lambda)) => {
                // bind the supplied parameters; the rest stay open
                let frame = Frame::with_parent(&lambda.environment);
                let mut unbound = Vec::new();
                for (i, param) in lambda.params.iter().enumerate() {
                    match evaluated.get(i) {
                        Some(Some(value)) => frame.bind(param.clone(), value.clone()),
                        _ => unbound.push(param.clone()),
                    }
                }
                Ok(Value::Function(FunctionValue::Lambda(Rc::new(LambdaFn {
                    params: std::sync::Arc::new(unbound),
                    body: lambda.body.clone(),
                    environment: frame,
                    input: lambda.input.clone(),
                    signature: None,
                    thunk: false,
                }))))
            }
            Value::Function(target @ (FunctionValue::Native(_) | FunctionValue::Partial(_)
            | FunctionValue::Transformer(_))) => {
                let arity = function_arity(&proc);
                let mut bound = Vec::with_capacity(arity);
                for i in 0..arity {
                    match evaluated.get(i) {
                        Some(Some(value)) => bound.push(Some(value.clone())),
                        _ => bound.push(None),
                    }
                }
                Ok(Value::Function(FunctionValue::Partial(Rc::new(PartialFn {
                    target: target.clone(),
                    bound,
                }))))
            }
            _ => {
                let name = leading_name(procedure)
                    .map(|n| n.to_string())
                    .unwrap_or_default();
                if name.is_empty() {
                    Err(Error::new("T1008", Some(position)))
                } else {
                    Err(Error::with("T1007", Some(position), vec![name]))
                }
            }
        }
    }

    /// `lhs ~> rhs`: apply the right side to the left value, or compose two
    /// functions via the chain lambda.
    fn eval_apply(
        &self,
        lhs: &Node,
        rhs: &Node,
        input: &Value,
        env: &Frame,
    ) -> Result<Value, Error> {
        let left = self.eval(lhs, input, env)?;

        if let NodeKind::FunctionCall { procedure, args } = &rhs.kind {
            // invoke the right side with the left value as first argument
            return self.eval_function(procedure, args, rhs.position, input, env, Some(left));
        }

        let func = self.eval(rhs, input, env)?;
        if !func.is_callable() && !left.is_callable() {
            return Err(Error::with(
                "T2006",
                Some(rhs.position),
                vec![func.describe()],
            ));
        }
        if left.is_callable() {
            // function chaining: λ($f, $g) { λ($x){ $g($f($x)) } }
            let chain = self.eval(&CHAIN.ast, &Value::Undefined, env)?;
            self.apply_function(&chain, vec![left, func], input)
        } else {
            self.apply_function(&func, vec![left], input)
        }
    }

    /// Apply a transformer: clone the target, find the pattern matches, merge
    /// updates into them, and remove deleted keys.
    fn apply_transformer(
        &self,
        transformer: &TransformerFn,
        obj: Value,
    ) -> Result<Value, Error> {
        if obj.is_undefined() {
            return Ok(Value::Undefined);
        }
        // copy-on-write: mutations below can't leak into the caller's value
        let mut result = obj;

        let matches = self.eval(&transformer.pattern, &result, &transformer.environment)?;
        if matches.is_undefined() {
            return Ok(result);
        }
        let match_list: Vec<Value> = if matches.is_array() {
            matches.iter_items().collect()
        } else {
            vec![matches]
        };

        for matched in match_list {
            if !matches!(matched, Value::Object(_)) {
                continue;
            }
            let mut replacement = matched.clone();

            let update = self.eval(&transformer.update, &matched, &transformer.environment)?;
            if !update.is_undefined() {
                let Value::Object(update_map) = &update else {
                    return Err(Error::with(
                        "T2011",
                        Some(transformer.update.position),
                        vec![update.describe()],
                    ));
                };
                if let Value::Object(map) = &mut replacement {
                    let target = Rc::make_mut(map);
                    for (k, v) in update_map.iter() {
                        target.insert(k.clone(), v.clone());
                    }
                }
            }

            if let Some(delete) = &transformer.delete {
                let deletions = self.eval(delete, &replacement, &transformer.environment)?;
                if !deletions.is_undefined() {
                    let del_list: Vec<Value> = if deletions.is_array() {
                        deletions.iter_items().collect()
                    } else {
                        vec![deletions.clone()]
                    };
                    if !del_list.iter().all(|d| matches!(d, Value::String(_))) {
                        return Err(Error::with(
                            "T2012",
                            Some(delete.position),
                            vec![deletions.describe()],
                        ));
                    }
                    if let Value::Object(map) = &mut replacement {
                        let target = Rc::make_mut(map);
                        for d in del_list {
                            if let Value::String(key) = d {
                                target.shift_remove(key.as_ref());
                            }
                        }
                    }
                }
            }

            if replacement != matched {
                replace_all(&mut result, &matched, &replacement);
            }
        }
        Ok(result)
    }

    // ------------------------------------------------------------------
    // structure traversal
    // ------------------------------------------------------------------

    fn eval_wildcard(&self, input: &Value) -> Value {
        let mut input = input.clone();
        if input.flags().outer_wrapper && !input.is_empty() {
            input = input.item(0).expect("non-empty");
        }
        let mut results: Vec<Value> = Vec::new();
        self.wildcard_into(&input, &mut results);
        Value::sequence_from(results)
    }

    fn wildcard_into(&self, input: &Value, results: &mut Vec<Value>) {
        match input {
            Value::Object(map) => {
                for value in map.values() {
                    if value.is_array() {
                        let mut flat = Vec::new();
                        flatten_deep(value, &mut flat);
                        results.extend(flat);
                    } else {
                        results.push(value.clone());
                    }
                }
            }
            Value::Array(..) | Value::Range(..) => {
                for value in input.iter_items() {
                    if value.is_array() {
                        let mut flat = Vec::new();
                        flatten_deep(&value, &mut flat);
                        results.extend(flat);
                    } else if matches!(value, Value::Object(_)) {
                        self.wildcard_into(&value, results);
                    } else {
                        results.push(value);
                    }
                }
            }
            _ => {}
        }
    }

    pub(crate) fn frame_from_tuple(
        &self,
        env: &Frame,
        tuple: &Rc<IndexMap<String, Value>>,
    ) -> Frame {
        let frame = Frame::with_parent(env);
        for (name, value) in tuple.iter() {
            frame.bind(name.clone(), value.clone());
        }
        frame
    }

    fn frame_from_map(&self, env: &Frame, map: &IndexMap<String, Value>) -> Frame {
        let frame = Frame::with_parent(env);
        for (name, value) in map.iter() {
            frame.bind(name.clone(), value.clone());
        }
        frame
    }
}

// ----------------------------------------------------------------------
// operator helpers
// ----------------------------------------------------------------------

pub(crate) fn boolize(value: &Value) -> bool {
    value.to_boolean().unwrap_or(false)
}

fn is_array_of_numbers(value: &Value) -> bool {
    match value {
        Value::Array(items, _) => items.iter().all(Value::is_numeric),
        Value::Range(..) => true,
        _ => false,
    }
}

fn leading_name(procedure: &Node) -> Option<&str> {
    match &procedure.kind {
        NodeKind::Path { steps, .. } => match steps.first().map(|s| &s.kind) {
            Some(NodeKind::Name(name)) => Some(name),
            _ => None,
        },
        _ => None,
    }
}

/// Number of arguments a function value accepts, used by higher-order
/// builtins to decide how many arguments to supply.
pub(crate) fn function_arity(proc: &Value) -> usize {
    match proc {
        Value::Function(FunctionValue::Lambda(lambda)) => lambda.params.len(),
        Value::Function(FunctionValue::Native(native)) => native.signature.arity(),
        Value::Function(FunctionValue::Partial(partial)) => {
            partial.bound.iter().filter(|slot| slot.is_none()).count()
        }
        Value::Function(FunctionValue::Transformer(_)) => 1,
        Value::Regex(_) => 1,
        _ => 0,
    }
}

fn numeric_binop(op: BinaryOp, lhs: &Value, rhs: &Value, position: usize) -> Result<Value, Error> {
    if !lhs.is_undefined() && !lhs.is_numeric() {
        return Err(Error::with(
            "T2001",
            Some(position),
            vec![op.symbol().to_string()],
        ));
    }
    if !rhs.is_undefined() && !rhs.is_numeric() {
        return Err(Error::with(
            "T2002",
            Some(position),
            vec![op.symbol().to_string()],
        ));
    }
    if lhs.is_undefined() || rhs.is_undefined() {
        return Ok(Value::Undefined);
    }

    // integer arithmetic stays integral while it fits
    if let (Value::Integer(a), Value::Integer(b)) = (lhs, rhs) {
        let folded = match op {
            BinaryOp::Add => a.checked_add(*b),
            BinaryOp::Subtract => a.checked_sub(*b),
            BinaryOp::Multiply => a.checked_mul(*b),
            BinaryOp::Divide => {
                if *b != 0 && a % b == 0 {
                    Some(a / b)
                } else {
                    None
                }
            }
            // truncating remainder, same sign as the dividend
            BinaryOp::Modulo => a.checked_rem(*b),
            _ => None,
        };
        if let Some(n) = folded {
            return Ok(Value::Integer(n));
        }
    }

    let a = lhs.as_f64().expect("numeric");
    let b = rhs.as_f64().expect("numeric");

    // decimal arithmetic avoids binary-float drift on mixed operands
    if let (Some(da), Some(db)) = (Decimal::from_f64(a), Decimal::from_f64(b)) {
        let exact = match op {
            BinaryOp::Add => da.checked_add(db),
            BinaryOp::Subtract => da.checked_sub(db),
            BinaryOp::Multiply => da.checked_mul(db),
            BinaryOp::Divide => {
                if db.is_zero() {
                    None
                } else {
                    da.checked_div(db)
                }
            }
            BinaryOp::Modulo => {
                if db.is_zero() {
                    None
                } else {
                    da.checked_rem(db)
                }
            }
            _ => None,
        };
        if let Some(exact) = exact {
            if exact.is_integer()
                && let Some(n) = exact.to_i64()
            {
                return Ok(Value::Integer(n));
            }
            if let Some(f) = exact.to_f64() {
                return Value::number(f).map_err(|mut e| {
                    e.position = Some(position);
                    e
                });
            }
        }
    }

    let raw = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Subtract => a - b,
        BinaryOp::Multiply => a * b,
        BinaryOp::Divide => a / b,
        BinaryOp::Modulo => a % b,
        _ => unreachable!("numeric operator"),
    };
    Value::number(raw).map_err(|mut e| {
        e.position = Some(position);
        e
    })
}

fn equality(lhs: &Value, rhs: &Value, expect_equal: bool) -> Value {
    if lhs.is_undefined() || rhs.is_undefined() {
        // if either side is undefined, the result is false
        return Value::Bool(false);
    }
    Value::Bool((lhs == rhs) == expect_equal)
}

fn comparison(op: BinaryOp, lhs: &Value, rhs: &Value, position: usize) -> Result<Value, Error> {
    let lcomparable = lhs.is_undefined() || lhs.is_numeric() || matches!(lhs, Value::String(_));
    let rcomparable = rhs.is_undefined() || rhs.is_numeric() || matches!(rhs, Value::String(_));
    if !lcomparable || !rcomparable {
        return Err(Error::with(
            "T2010",
            Some(position),
            vec![op.symbol().to_string()],
        ));
    }
    if lhs.is_undefined() || rhs.is_undefined() {
        return Ok(Value::Undefined);
    }

    let ord = if lhs.is_numeric() && rhs.is_numeric() {
        lhs.as_f64()
            .partial_cmp(&rhs.as_f64())
            .unwrap_or(Ordering::Equal)
    } else if let (Value::String(a), Value::String(b)) = (lhs, rhs) {
        a.cmp(b)
    } else {
        return Err(Error::with(
            "T2009",
            Some(position),
            vec![
                lhs.describe(),
                rhs.describe(),
                op.symbol().to_string(),
            ],
        ));
    };
    let result = match op {
        BinaryOp::LessThan => ord == Ordering::Less,
        BinaryOp::LessEqual => ord != Ordering::Greater,
        BinaryOp::GreaterThan => ord == Ordering::Greater,
        BinaryOp::GreaterEqual => ord != Ordering::Less,
        _ => unreachable!("comparison operator"),
    };
    Ok(Value::Bool(result))
}

fn includes(lhs: &Value, rhs: &Value) -> Value {
    if lhs.is_undefined() || rhs.is_undefined() {
        return Value::Bool(false);
    }
    if rhs.is_array() {
        Value::Bool(rhs.iter_items().any(|item| &item == lhs))
    } else {
        Value::Bool(rhs == lhs)
    }
}

/// `..`: both ends must be integers; the result is represented lazily and its
/// size is capped at ten million entries.
fn range_op(lhs: &Value, rhs: &Value, position: usize) -> Result<Value, Error> {
    if !lhs.is_undefined() && !matches!(lhs, Value::Integer(_)) {
        return Err(Error::with("T2003", Some(position), vec![lhs.describe()]));
    }
    if !rhs.is_undefined() && !matches!(rhs, Value::Integer(_)) {
        return Err(Error::with("T2004", Some(position), vec![rhs.describe()]));
    }
    let (Value::Integer(a), Value::Integer(b)) = (lhs, rhs) else {
        return Ok(Value::Undefined);
    };
    if a > b {
        return Ok(Value::Undefined);
    }
    let size = (*b as i128) - (*a as i128) + 1;
    if size > 10_000_000 {
        return Err(Error::with("D2014", Some(position), vec![size.to_string()]));
    }
    Ok(Value::Range(*a, *b))
}

fn eval_descendants(input: &Value) -> Value {
    if input.is_undefined() {
        return Value::Undefined;
    }
    let mut results = Vec::new();
    recurse_descendants(input, &mut results);
    if results.len() == 1 {
        results.into_iter().next().expect("length checked")
    } else {
        Value::sequence_from(results)
    }
}

fn recurse_descendants(input: &Value, results: &mut Vec<Value>) {
    if !input.is_array() {
        results.push(input.clone());
    }
    match input {
        Value::Array(..) | Value::Range(..) => {
            for member in input.iter_items() {
                recurse_descendants(&member, results);
            }
        }
        Value::Object(map) => {
            for value in map.values() {
                recurse_descendants(value, results);
            }
        }
        _ => {}
    }
}

fn flatten_deep(value: &Value, out: &mut Vec<Value>) {
    if value.is_array() {
        for item in value.iter_items() {
            flatten_deep(&item, out);
        }
    } else {
        out.push(value.clone());
    }
}

/// Merge all bindings of a tuple stream into one tuple, appending values
/// bound under the same name.
fn reduce_tuple_stream(data: &Value) -> IndexMap<String, Value> {
    match data {
        Value::Object(map) => map.as_ref().clone(),
        Value::Array(items, _) => {
            let mut result: IndexMap<String, Value> = match items.first() {
                Some(Value::Object(first)) => first.as_ref().clone(),
                _ => IndexMap::new(),
            };
            for el in items.iter().skip(1) {
                if let Value::Object(el) = el {
                    for (k, v) in el.iter() {
                        let existing = result.get(k).cloned().unwrap_or(Value::Undefined);
                        result.insert(k.clone(), functions::append(existing, v.clone()));
                    }
                }
            }
            result
        }
        _ => IndexMap::new(),
    }
}

/// Replace every sub-value structurally equal to `from` with `to`.
fn replace_all(target: &mut Value, from: &Value, to: &Value) {
    if target == from {
        *target = to.clone();
        return;
    }
    match target {
        Value::Array(items, _) => {
            let items = Rc::make_mut(items);
            for item in items.iter_mut() {
                replace_all(item, from, to);
            }
        }
        Value::Object(map) => {
            let map = Rc::make_mut(map);
            for (_, value) in map.iter_mut() {
                replace_all(value, from, to);
            }
        }
        _ => {}
    }
}
