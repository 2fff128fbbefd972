use std::sync::Arc;

use serde_json::json;
use tansy_lang::{Value, parse};

fn eval_json(source: &str, input: serde_json::Value) -> serde_json::Value {
    parse(source)
        .unwrap_or_else(|e| panic!("parse failed: {}", e))
        .evaluate(Value::from_json(&input))
        .unwrap_or_else(|e| panic!("evaluation failed: {}", e))
        .to_json()
        .expect("defined result")
}

fn invoice() -> serde_json::Value {
    json!({
        "Account": {
            "Name": "Firefly",
            "Order": [
                {
                    "OrderID": "order103",
                    "Product": [
                        {"Name": "Bowler Hat", "Price": 34.45, "Quantity": 2},
                        {"Name": "Trilby", "Price": 21.67, "Quantity": 1}
                    ]
                },
                {
                    "OrderID": "order104",
                    "Product": [
                        {"Name": "Bowler Hat", "Price": 34.45, "Quantity": 4},
                        {"Name": "Cloak", "Price": 107.99, "Quantity": 1}
                    ]
                }
            ]
        }
    })
}

#[test]
fn nested_path_collects_all_matches() {
    assert_eq!(
        eval_json("Account.Order.Product.Name", invoice()),
        json!(["Bowler Hat", "Trilby", "Bowler Hat", "Cloak"])
    );
}

#[test]
fn aggregation_over_a_path() {
    assert_eq!(
        eval_json(
            "$round($sum(Account.Order.Product.(Price * Quantity)), 2)",
            invoice()
        ),
        json!(336.36)
    );
    assert_eq!(
        eval_json("$sum(Account.Order.Product.Quantity)", invoice()),
        json!(8)
    );
}

#[test]
fn filter_then_project() {
    assert_eq!(
        eval_json("Account.Order.Product[Price > 30].Name", invoice()),
        json!(["Bowler Hat", "Bowler Hat", "Cloak"])
    );
}

#[test]
fn group_products_by_name() {
    assert_eq!(
        eval_json(
            "Account.Order.Product{Name: $sum(Quantity)}",
            invoice()
        ),
        json!({"Bowler Hat": 6, "Trilby": 1, "Cloak": 1})
    );
}

#[test]
fn sort_products_by_price_descending() {
    assert_eq!(
        eval_json("Account.Order.Product^(>Price).Name", invoice()),
        json!(["Cloak", "Bowler Hat", "Bowler Hat", "Trilby"])
    );
}

#[test]
fn construct_a_summary_object() {
    let source = "{
        'company': Account.Name,
        'orders': $count(Account.Order),
        'lines': Account.Order.Product.{
            'sku': Name,
            'amount': Price * Quantity
        }[]
    }";
    let result = eval_json(source, invoice());
    assert_eq!(result["company"], json!("Firefly"));
    assert_eq!(result["orders"], json!(2));
    assert_eq!(result["lines"].as_array().unwrap().len(), 4);
    assert_eq!(
        result["lines"][0],
        json!({"sku": "Bowler Hat", "amount": 68.9})
    );
}

#[test]
fn orders_with_parent_binding() {
    // each product line carries its order's id via the parent reference
    let source = "Account.Order.Product.{'order': %.OrderID, 'name': Name}";
    let result = eval_json(source, invoice());
    assert_eq!(
        result,
        json!([
            {"order": "order103", "name": "Bowler Hat"},
            {"order": "order103", "name": "Trilby"},
            {"order": "order104", "name": "Bowler Hat"},
            {"order": "order104", "name": "Cloak"}
        ])
    );
}

#[test]
fn higher_order_pipeline() {
    let source = "( $expensive := $filter(Account.Order.Product, function($p){ $p.Price > 30 });
                    $map($expensive, function($p){ $p.Name }) )";
    assert_eq!(
        eval_json(source, invoice()),
        json!(["Bowler Hat", "Bowler Hat", "Cloak"])
    );
}

#[test]
fn reduce_totals() {
    assert_eq!(
        eval_json(
            "$reduce(Account.Order.Product.Quantity, function($a, $b){ $a + $b })",
            invoice()
        ),
        json!(8)
    );
}

#[test]
fn string_functions_round_trip() {
    assert_eq!(
        eval_json("$join($map(['a','b','c'], $uppercase), '-')", json!(null)),
        json!("A-B-C")
    );
    assert_eq!(
        eval_json("$split('a-b-c', '-')", json!(null)),
        json!(["a", "b", "c"])
    );
    assert_eq!(
        eval_json("$replace('tick tock', /t(\\w+)/, 'T$1')", json!(null)),
        json!("Tick Tock")
    );
    assert_eq!(
        eval_json("$base64decode($base64encode('tansy'))", json!(null)),
        json!("tansy")
    );
    assert_eq!(
        eval_json("$decodeUrlComponent($encodeUrlComponent('a b&c'))", json!(null)),
        json!("a b&c")
    );
}

#[test]
fn structural_functions() {
    assert_eq!(
        eval_json("$keys({'a': 1, 'b': 2})", json!(null)),
        json!(["a", "b"])
    );
    assert_eq!(
        eval_json("$merge([{'a': 1}, {'b': 2}, {'a': 3}])", json!(null)),
        json!({"a": 3, "b": 2})
    );
    assert_eq!(
        eval_json("$distinct([1, 2, 1, 3, 2])", json!(null)),
        json!([1, 2, 3])
    );
    assert_eq!(
        eval_json("$zip([1, 2], ['a', 'b'])", json!(null)),
        json!([[1, "a"], [2, "b"]])
    );
    assert_eq!(
        eval_json("$append([1], [2, 3])", json!(null)),
        json!([1, 2, 3])
    );
    assert_eq!(
        eval_json("$reverse([1, 2, 3])", json!(null)),
        json!([3, 2, 1])
    );
    assert_eq!(
        eval_json("$each({'a': 1, 'b': 2}, function($v, $k){ $k & '=' & $v })[]", json!(null)),
        json!(["a=1", "b=2"])
    );
    assert_eq!(
        eval_json("$sift({'a': 1, 'b': 0}, function($v){ $v > 0 })", json!(null)),
        json!({"a": 1})
    );
}

#[test]
fn dynamic_eval() {
    assert_eq!(eval_json("$eval('1 + 2')", json!(null)), json!(3));
    assert_eq!(
        eval_json("$eval('a + 1', {'a': 41})", json!(null)),
        json!(42)
    );
}

#[test]
fn bindings_are_merged_into_the_root_frame() {
    let expr = parse("$greeting & ', ' & name").unwrap();
    let result = expr
        .evaluate_with_bindings(
            Value::from_json(&json!({"name": "Ada"})),
            &[("greeting", Value::string("hello"))],
        )
        .unwrap();
    assert_eq!(result, Value::string("hello, Ada"));
}

#[test]
fn one_expression_is_shared_across_threads() {
    let expr = Arc::new(parse("$sum(Account.Order.Product.Quantity)").unwrap());
    std::thread::scope(|scope| {
        for _ in 0..4 {
            let expr = Arc::clone(&expr);
            scope.spawn(move || {
                let result = expr.evaluate(Value::from_json(&invoice())).unwrap();
                assert_eq!(result, Value::Integer(8));
            });
        }
    });
}

#[test]
fn recovery_parse_still_reports_collected_errors() {
    let expr = tansy_lang::parse_with_recovery("Account.(").unwrap();
    assert!(!expr.errors.is_empty());
}

#[test]
fn transform_pipeline_end_to_end() {
    let source = "Account ~> |Order.Product[Price > 100]|{'Discounted': true}|";
    let result = eval_json(source, invoice());
    assert_eq!(
        result["Order"][1]["Product"][1],
        json!({"Name": "Cloak", "Price": 107.99, "Quantity": 1, "Discounted": true})
    );
    // cheaper products untouched
    assert_eq!(
        result["Order"][0]["Product"][0],
        json!({"Name": "Bowler Hat", "Price": 34.45, "Quantity": 2})
    );
}
