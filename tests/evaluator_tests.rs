use serde_json::json;
use tansy_lang::{Value, parse};

fn eval(source: &str, input: serde_json::Value) -> Result<Value, tansy_lang::Error> {
    parse(source)
        .unwrap_or_else(|e| panic!("parse failed for {:?}: {}", source, e))
        .evaluate(Value::from_json(&input))
}

fn eval_json(source: &str, input: serde_json::Value) -> serde_json::Value {
    eval(source, input)
        .unwrap_or_else(|e| panic!("evaluation failed for {:?}: {}", source, e))
        .to_json()
        .expect("defined result")
}

fn eval_err(source: &str, input: serde_json::Value) -> String {
    eval(source, input)
        .err()
        .expect("expected an evaluation error")
        .code
        .to_string()
}

// ---------------------------------------------------------------------------
// literals and operators
// ---------------------------------------------------------------------------

#[test]
fn arithmetic() {
    assert_eq!(eval_json("1 + 2 * 3", json!(null)), json!(7));
    assert_eq!(eval_json("(1 + 2) * 3", json!(null)), json!(9));
    assert_eq!(eval_json("10 - 2 - 3", json!(null)), json!(5));
    assert_eq!(eval_json("5 / 2", json!(null)), json!(2.5));
    assert_eq!(eval_json("6 / 2", json!(null)), json!(3));
    assert_eq!(eval_json("-7 % 2", json!(null)), json!(-1));
    assert_eq!(eval_json("7 % -2", json!(null)), json!(1));
    assert_eq!(eval_json("0.1 + 0.2", json!(null)), json!(0.3));
}

#[test]
fn arithmetic_type_errors() {
    assert_eq!(eval_err("'a' + 1", json!(null)), "T2001");
    assert_eq!(eval_err("1 * 'a'", json!(null)), "T2002");
    assert_eq!(eval_err("- 'a'", json!(null)), "D1002");
    assert_eq!(eval_err("1 / 0", json!(null)), "D1001");
}

#[test]
fn absent_operand_propagates_as_absent() {
    assert!(eval("a + 1", json!({})).unwrap().is_undefined());
    assert!(eval("1 - a", json!({})).unwrap().is_undefined());
}

#[test]
fn equality_and_comparison() {
    assert_eq!(eval_json("1 = 1.0", json!(null)), json!(true));
    assert_eq!(eval_json("1 != 2", json!(null)), json!(true));
    assert_eq!(eval_json("'a' = 1", json!(null)), json!(false));
    assert_eq!(eval_json("'abc' < 'abd'", json!(null)), json!(true));
    assert_eq!(eval_json("2 >= 2", json!(null)), json!(true));
    // either side absent: equality is false, comparison is absent
    assert_eq!(eval_json("a = a", json!({})), json!(false));
    assert!(eval("a < 1", json!({})).unwrap().is_undefined());
    // incompatible operands
    assert_eq!(eval_err("1 < 'a'", json!(null)), "T2009");
    assert_eq!(eval_err("true > false", json!(null)), "T2010");
}

#[test]
fn boolean_operators_short_circuit() {
    assert_eq!(eval_json("true or $error('boom')", json!(null)), json!(true));
    assert_eq!(
        eval_json("false and $error('boom')", json!(null)),
        json!(false)
    );
    assert_eq!(eval_json("1 < 2 and 2 < 3", json!(null)), json!(true));
}

#[test]
fn string_concatenation() {
    assert_eq!(eval_json("'a' & 'b'", json!(null)), json!("ab"));
    assert_eq!(eval_json("1 & 2", json!(null)), json!("12"));
    // absent concatenates as empty string
    assert_eq!(eval_json("a & 'x'", json!({})), json!("x"));
}

#[test]
fn membership() {
    assert_eq!(eval_json("2 in [1, 2, 3]", json!(null)), json!(true));
    assert_eq!(eval_json("5 in [1, 2, 3]", json!(null)), json!(false));
    assert_eq!(eval_json("'a' in 'a'", json!(null)), json!(true));
    assert_eq!(eval_json("a in [1]", json!({})), json!(false));
}

#[test]
fn conditionals() {
    assert_eq!(eval_json("true ? 1 : 2", json!(null)), json!(1));
    assert_eq!(eval_json("false ? 1 : 2", json!(null)), json!(2));
    assert!(eval("false ? 1", json!(null)).unwrap().is_undefined());
}

#[test]
fn coalesce_and_default() {
    assert_eq!(eval_json("a ?? 'fallback'", json!({})), json!("fallback"));
    assert_eq!(eval_json("a ?? 'fallback'", json!({"a": 1})), json!(1));
    // null exists, so ?? keeps it while ?: falls through on falsiness
    assert_eq!(eval_json("a ?? 'x'", json!({"a": null})), json!(null));
    assert_eq!(eval_json("a ?: 'x'", json!({"a": null})), json!("x"));
    assert_eq!(eval_json("a ?: 'x'", json!({"a": 7})), json!(7));
}

// ---------------------------------------------------------------------------
// paths and sequences
// ---------------------------------------------------------------------------

#[test]
fn simple_field_access() {
    assert_eq!(eval_json("name", json!({"name": "Ada"})), json!("Ada"));
    assert_eq!(
        eval_json("user.address.city", json!({"user": {"address": {"city": "Oslo"}}})),
        json!("Oslo")
    );
    assert!(eval("missing", json!({"name": "Ada"})).unwrap().is_undefined());
}

#[test]
fn path_maps_over_arrays() {
    let input = json!({"order": [{"total": 5}, {"total": 7}, {"other": 1}]});
    assert_eq!(eval_json("order.total", input), json!([5, 7]));
}

#[test]
fn singleton_sequences_unwrap() {
    let input = json!({"order": [{"total": 5}]});
    assert_eq!(eval_json("order.total", input.clone()), json!(5));
    // unless the empty predicate requests array shape
    assert_eq!(eval_json("order.total[]", input), json!([5]));
}

#[test]
fn empty_sequences_are_absent() {
    let input = json!({"order": []});
    assert!(eval("order.total", input).unwrap().is_undefined());
}

#[test]
fn constructed_arrays_are_not_unwrapped() {
    assert_eq!(eval_json("[1]", json!(null)), json!([1]));
    assert_eq!(eval_json("[]", json!(null)), json!([]));
    // a constructed array as the last step is not flattened away
    assert_eq!(
        eval_json("a.[b]", json!({"a": [{"b": 1}, {"b": 2}]})),
        json!([[1], [2]])
    );
}

#[test]
fn dollar_refers_to_the_whole_input() {
    assert_eq!(eval_json("$", json!([1, 2, 3])), json!([1, 2, 3]));
    assert_eq!(eval_json("$$", json!([1, 2])), json!([1, 2]));
    assert_eq!(eval_json("$[0]", json!([1, 2, 3])), json!(1));
}

#[test]
fn numeric_predicates_select_by_index() {
    let input = json!({"arr": ["a", "b", "c"]});
    assert_eq!(eval_json("arr[0]", input.clone()), json!("a"));
    assert_eq!(eval_json("arr[-1]", input.clone()), json!("c"));
    // truncation toward zero
    assert_eq!(eval_json("arr[0.9]", input.clone()), json!("a"));
    assert!(eval("arr[9]", input).unwrap().is_undefined());
}

#[test]
fn boolean_predicates_filter() {
    let input = json!({"order": [{"total": 5}, {"total": 12}, {"total": 20}]});
    assert_eq!(
        eval_json("order[total > 10].total", input.clone()),
        json!([12, 20])
    );
    assert!(eval("order[total > 100]", input).unwrap().is_undefined());
}

#[test]
fn array_of_numbers_predicate_selects_positions() {
    let input = json!({"arr": ["a", "b", "c", "d"]});
    assert_eq!(eval_json("arr[[0, 2]]", input), json!(["a", "c"]));
}

#[test]
fn wildcard_and_descendant() {
    let input = json!({"a": 1, "b": 2});
    assert_eq!(eval_json("$sum(*)", input), json!(3));
    let nested = json!({"a": {"b": 1}});
    assert_eq!(eval_json("$count(**)", nested), json!(3));
}

// ---------------------------------------------------------------------------
// ranges
// ---------------------------------------------------------------------------

#[test]
fn range_operator() {
    assert_eq!(eval_json("[1..3]", json!(null)), json!([1, 2, 3]));
    // lhs > rhs yields no entries
    assert_eq!(eval_json("[5..1]", json!(null)), json!([]));
    assert_eq!(eval_json("$count([1..100])", json!(null)), json!(100));
    assert_eq!(eval_json("$sum([1..10])", json!(null)), json!(55));
}

#[test]
fn range_requires_integers() {
    assert_eq!(eval_err("[1.5..3]", json!(null)), "T2003");
    assert_eq!(eval_err("[1..'a']", json!(null)), "T2004");
}

#[test]
fn oversized_range_is_rejected() {
    assert_eq!(eval_err("[1..20000000]", json!(null)), "D2014");
}

// ---------------------------------------------------------------------------
// grouping and sorting
// ---------------------------------------------------------------------------

#[test]
fn group_by_accumulates_per_key() {
    let input = json!([{"a": 1}, {"a": 1}, {"a": 2}]);
    let result = eval_json("${$string(a): $count($)}", input);
    assert_eq!(result, json!({"1": 2, "2": 1}));
}

#[test]
fn group_by_is_deterministic() {
    let input = json!([{"a": 1}, {"a": 1}, {"a": 2}]);
    let first = eval_json("${$string(a): $count($)}", input.clone());
    for _ in 0..5 {
        assert_eq!(eval_json("${$string(a): $count($)}", input.clone()), first);
    }
}

#[test]
fn group_key_must_be_a_string() {
    assert_eq!(eval_err("${a: 1}", json!([{"a": 1}])), "T1003");
}

#[test]
fn colliding_keys_from_different_expressions_are_ambiguous() {
    let input = json!([{"a": "k", "b": "k"}]);
    assert_eq!(eval_err("${a: 1, b: 2}", input), "D1009");
}

#[test]
fn object_constructor() {
    let input = json!({"name": "Ada", "age": 36});
    assert_eq!(
        eval_json("{'who': name, 'old': age > 30}", input),
        json!({"who": "Ada", "old": true})
    );
    assert_eq!(eval_json("{}", json!(null)), json!({}));
}

#[test]
fn order_by_sorts_ascending_by_default() {
    let input = json!({"items": [{"x": 3}, {"x": 1}, {"x": 2}]});
    assert_eq!(eval_json("items^(x).x", input.clone()), json!([1, 2, 3]));
    assert_eq!(eval_json("items^(>x).x", input), json!([3, 2, 1]));
}

#[test]
fn order_by_multiple_terms_and_stability() {
    let input = json!({"items": [
        {"g": "b", "n": 1},
        {"g": "a", "n": 2},
        {"g": "a", "n": 1},
        {"g": "b", "n": 0}
    ]});
    assert_eq!(
        eval_json("items^(g, n).n", input),
        json!([1, 2, 0, 1])
    );
}

#[test]
fn order_by_absent_sorts_last() {
    let input = json!({"items": [{"x": 2}, {"y": 9}, {"x": 1}]});
    assert_eq!(eval_json("items^(x).(x ?? 'none')", input), json!([1, 2, "none"]));
}

#[test]
fn order_by_incomparable_operands_error() {
    let input = json!({"items": [{"x": 1}, {"x": "a"}]});
    assert_eq!(eval_err("items^(x)", input), "T2007");
    let input = json!({"items": [{"x": true}, {"x": false}]});
    assert_eq!(eval_err("items^(x)", input), "T2008");
}

// ---------------------------------------------------------------------------
// variables, blocks, lambdas
// ---------------------------------------------------------------------------

#[test]
fn variable_binding_in_blocks() {
    assert_eq!(eval_json("($x := 5; $x + 1)", json!(null)), json!(6));
    assert_eq!(eval_json("($x := $y := 3; $x * $y)", json!(null)), json!(9));
}

#[test]
fn block_returns_last_expression() {
    assert_eq!(eval_json("(1; 2; 3)", json!(null)), json!(3));
}

#[test]
fn lambda_application() {
    assert_eq!(
        eval_json("(function($x){ $x * 2 })(21)", json!(null)),
        json!(42)
    );
    assert_eq!(
        eval_json("($add := function($a, $b){ $a + $b }; $add(2, 3))", json!(null)),
        json!(5)
    );
}

#[test]
fn lambda_closures_capture_their_frame() {
    let source = "($n := 10; $f := function($x){ $x + $n }; $f(5))";
    assert_eq!(eval_json(source, json!(null)), json!(15));
}

#[test]
fn recursive_lambda() {
    let source = "($fact := function($n){ $n <= 1 ? 1 : $n * $fact($n - 1) }; $fact(5))";
    assert_eq!(eval_json(source, json!(null)), json!(120));
}

#[test]
fn deep_tail_recursion_completes() {
    let source =
        "($count := function($n, $acc){ $n = 0 ? $acc : $count($n - 1, $acc + 1) }; $count(100000, 0))";
    let expr = parse(source).unwrap();
    let result = expr.evaluate(Value::Undefined).unwrap();
    assert_eq!(result, Value::Integer(100_000));
}

#[test]
fn tail_recursion_stays_within_depth_bounds() {
    let source =
        "($count := function($n, $acc){ $n = 0 ? $acc : $count($n - 1, $acc + 1) }; $count(100000, 0))";
    let expr = parse(source).unwrap();
    let result = expr
        .evaluate_timeboxed(Value::Undefined, 60_000, 100)
        .unwrap();
    assert_eq!(result, Value::Integer(100_000));
}

#[test]
fn non_tail_recursion_exceeds_depth_bounds() {
    let source = "($f := function($n){ $n = 0 ? 0 : 1 + $f($n - 1) }; $f(10000))";
    let expr = parse(source).unwrap();
    let err = expr
        .evaluate_timeboxed(Value::Undefined, 60_000, 100)
        .unwrap_err();
    assert_eq!(err.code, "U1001");
}

#[test]
fn runaway_evaluation_times_out() {
    let source = "($spin := function(){ $spin() }; $spin())";
    let expr = parse(source).unwrap();
    let err = expr
        .evaluate_timeboxed(Value::Undefined, 100, 1000)
        .unwrap_err();
    assert_eq!(err.code, "U1002");
}

// ---------------------------------------------------------------------------
// function application operator
// ---------------------------------------------------------------------------

#[test]
fn apply_passes_value_as_first_argument() {
    assert_eq!(eval_json("5 ~> $string()", json!(null)), json!("5"));
    assert_eq!(eval_json("5 ~> $string", json!(null)), json!("5"));
    assert_eq!(
        eval_json("'hello' ~> $substring(0, 4) ~> $uppercase()", json!(null)),
        json!("HELL")
    );
}

#[test]
fn apply_composes_functions() {
    let source = "($inc := function($x){ $x + 1 };
                  $dbl := function($x){ $x * 2 };
                  $f := $inc ~> $dbl;
                  $f(3))";
    assert_eq!(eval_json(source, json!(null)), json!(8));
}

#[test]
fn apply_to_non_function_errors() {
    assert_eq!(eval_err("5 ~> 6", json!(null)), "T2006");
}

#[test]
fn partial_application_of_lambda() {
    let source = "($add := function($a, $b){ $a + $b }; $inc := $add(?, 1); $inc(5))";
    assert_eq!(eval_json(source, json!(null)), json!(6));
}

#[test]
fn partial_application_of_builtin() {
    let source = "($first3 := $substring(?, 0, 3); $first3('hello'))";
    assert_eq!(eval_json(source, json!(null)), json!("hel"));
}

#[test]
fn context_substitution_in_paths() {
    assert_eq!(
        eval_json("name.$uppercase()", json!({"name": "ada"})),
        json!("ADA")
    );
}

// ---------------------------------------------------------------------------
// tuple streams: focus, index, ancestors
// ---------------------------------------------------------------------------

#[test]
fn index_bind() {
    let input = json!({"arr": ["a", "b"]});
    assert_eq!(
        eval_json("arr#$i.{'idx': $i, 'val': $}", input),
        json!([{"idx": 0, "val": "a"}, {"idx": 1, "val": "b"}])
    );
}

#[test]
fn focus_bind_keeps_the_enclosing_context() {
    let input = json!({"arr": [1, 2, 3]});
    assert_eq!(
        eval_json("arr@$x.{'n': $x}", input),
        json!([{"n": 1}, {"n": 2}, {"n": 3}])
    );
}

#[test]
fn parent_reference_in_predicates() {
    let input = json!({"a": {"flag": true, "b": [1, 2]}});
    assert_eq!(eval_json("a.b[%.flag]", input), json!([1, 2]));
    let input = json!({"a": {"flag": false, "b": [1, 2]}});
    assert!(eval("a.b[%.flag]", input).unwrap().is_undefined());
}

#[test]
fn parent_reference_as_a_step() {
    let input = json!({"a": {"b": [1, 2]}});
    assert_eq!(eval_json("$count(a.b.%)", input), json!(2));
}

// ---------------------------------------------------------------------------
// transformers
// ---------------------------------------------------------------------------

#[test]
fn transform_merges_updates() {
    let input = json!({"a": 1});
    assert_eq!(
        eval_json("$ ~> |$|{'b': 2}|", input),
        json!({"a": 1, "b": 2})
    );
}

#[test]
fn transform_deletes_fields() {
    let input = json!({"a": 1, "b": 2});
    assert_eq!(eval_json("$ ~> |$|{}, 'a'|", input), json!({"b": 2}));
}

#[test]
fn transform_targets_nested_matches() {
    let input = json!({"items": [{"price": 1}, {"price": 2}]});
    assert_eq!(
        eval_json("$ ~> |items|{'price': price * 10}|", input),
        json!({"items": [{"price": 10}, {"price": 20}]})
    );
}

#[test]
fn transform_update_must_be_an_object() {
    assert_eq!(eval_err("$ ~> |$|'nope'|", json!({"a": 1})), "T2011");
}

#[test]
fn transform_delete_must_be_strings() {
    assert_eq!(eval_err("$ ~> |$|{}, 1|", json!({"a": 1})), "T2012");
}

// ---------------------------------------------------------------------------
// error reporting
// ---------------------------------------------------------------------------

#[test]
fn invoking_a_non_function_fails() {
    assert_eq!(eval_err("a()", json!({"a": 1})), "T1006");
}

#[test]
fn forgotten_dollar_is_hinted() {
    assert_eq!(eval_err("string(5)", json!(null)), "T1005");
}

#[test]
fn error_function_raises() {
    let err = eval("$error('kaboom')", json!(null)).unwrap_err();
    assert_eq!(err.code, "D3137");
    assert!(err.to_string().contains("kaboom"));
}

#[test]
fn errors_carry_positions() {
    let err = eval("1 + 'a'", json!(null)).unwrap_err();
    assert_eq!(err.code, "T2001");
    assert!(err.position.is_some());
}
