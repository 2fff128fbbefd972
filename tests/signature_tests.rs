use serde_json::json;
use tansy_lang::{Value, parse};

fn eval(source: &str, input: serde_json::Value) -> Result<Value, tansy_lang::Error> {
    parse(source).unwrap().evaluate(Value::from_json(&input))
}

fn eval_err(source: &str, input: serde_json::Value) -> String {
    eval(source, input)
        .err()
        .expect("expected an error")
        .code
        .to_string()
}

#[test]
fn array_parameter_coerces_single_value() {
    // a<n> parameter: a bare number is wrapped into a one-element array
    assert_eq!(eval("$sum(5)", json!(null)).unwrap(), Value::Integer(5));
    assert_eq!(
        eval("$count('x')", json!(null)).unwrap(),
        Value::Integer(1)
    );
}

#[test]
fn mixed_array_argument_is_rejected() {
    assert_eq!(eval_err("$sum([1, 'x'])", json!(null)), "T0412");
}

#[test]
fn wrong_argument_type_reports_position() {
    let err = eval("$lowercase(5)", json!(null)).unwrap_err();
    assert_eq!(err.code, "T0410");
    assert_eq!(err.inserts[0], "1");
    assert_eq!(err.inserts[1], "lowercase");
}

#[test]
fn extraneous_arguments_are_rejected() {
    assert_eq!(eval_err("$not(true, false)", json!(null)), "T0410");
}

#[test]
fn context_substitution_for_builtins() {
    assert_eq!(
        eval("name.$uppercase()", json!({"name": "ada"})).unwrap(),
        Value::string("ADA")
    );
    assert_eq!(
        eval("n.$string()", json!({"n": 7})).unwrap(),
        Value::string("7")
    );
}

#[test]
fn incompatible_context_substitution_is_rejected() {
    // context is a number, $uppercase wants a string
    assert_eq!(eval_err("n.$uppercase()", json!({"n": 5})), "T0411");
}

#[test]
fn lambda_signatures_validate_arguments() {
    assert_eq!(
        eval("(function($x)<n:n>{ $x + 1 })(2)", json!(null)).unwrap(),
        Value::Integer(3)
    );
    assert_eq!(
        eval_err("(function($x)<n:n>{ $x + 1 })('a')", json!(null)),
        "T0410"
    );
}

#[test]
fn lambda_signature_coerces_array_parameters() {
    assert_eq!(
        eval("(function($a)<a<n>:n>{ $sum($a) })(4)", json!(null)).unwrap(),
        Value::Integer(4)
    );
}

#[test]
fn optional_parameters_may_be_omitted() {
    assert_eq!(
        eval("$round(2.567, 2)", json!(null)).unwrap(),
        Value::Float(2.57)
    );
    assert_eq!(eval("$round(2.5)", json!(null)).unwrap(), Value::Integer(2));
    assert_eq!(eval("$round(3.5)", json!(null)).unwrap(), Value::Integer(4));
}

#[test]
fn choice_parameters_accept_either_type() {
    // $contains accepts a string or a regex as its pattern
    assert_eq!(
        eval("$contains('abracadabra', 'bra')", json!(null)).unwrap(),
        Value::Bool(true)
    );
    assert_eq!(
        eval("$contains('abracadabra', /a.*a/)", json!(null)).unwrap(),
        Value::Bool(true)
    );
}

#[test]
fn function_parameters_are_enforced() {
    assert_eq!(eval_err("$map([1], 'not a function')", json!(null)), "T0410");
}
