use tansy_lang::ast::BinaryOp;
use tansy_lang::ast::nodes::{Literal, NodeKind};
use tansy_lang::{parse, parse_with_recovery};

fn parse_err(source: &str) -> String {
    parse(source).err().expect("expected a parse error").code.to_string()
}

#[test]
fn literals_parse() {
    let ast = parse("42").unwrap();
    assert!(matches!(
        ast.ast().kind,
        NodeKind::Literal(Literal::Integer(42))
    ));

    let ast = parse("3.5").unwrap();
    assert!(matches!(ast.ast().kind, NodeKind::Literal(Literal::Float(f)) if f == 3.5));

    let ast = parse(r#""hello""#).unwrap();
    assert!(matches!(&ast.ast().kind, NodeKind::Literal(Literal::Str(s)) if s == "hello"));

    let ast = parse("null").unwrap();
    assert!(matches!(ast.ast().kind, NodeKind::Literal(Literal::Null)));
}

#[test]
fn negative_number_literal_is_folded() {
    let ast = parse("-5").unwrap();
    assert!(matches!(
        ast.ast().kind,
        NodeKind::Literal(Literal::Integer(-5))
    ));
}

#[test]
fn multiplication_binds_tighter_than_addition() {
    let ast = parse("1 + 2 * 3").unwrap();
    let NodeKind::Binary { op, lhs, rhs } = &ast.ast().kind else {
        panic!("expected binary node");
    };
    assert_eq!(*op, BinaryOp::Add);
    assert!(matches!(
        lhs.kind,
        NodeKind::Literal(Literal::Integer(1))
    ));
    assert!(matches!(
        rhs.kind,
        NodeKind::Binary {
            op: BinaryOp::Multiply,
            ..
        }
    ));
}

#[test]
fn parentheses_override_precedence() {
    // (1 + 2) * 3: the block is the left operand of the multiplication
    let ast = parse("(1 + 2) * 3").unwrap();
    let NodeKind::Binary { op, lhs, .. } = &ast.ast().kind else {
        panic!("expected binary node");
    };
    assert_eq!(*op, BinaryOp::Multiply);
    assert!(matches!(lhs.kind, NodeKind::Block { .. }));
}

#[test]
fn comparison_binds_looser_than_arithmetic() {
    let ast = parse("1 + 2 < 3 * 4").unwrap();
    let NodeKind::Binary { op, lhs, rhs } = &ast.ast().kind else {
        panic!("expected binary node");
    };
    assert_eq!(*op, BinaryOp::LessThan);
    assert!(matches!(lhs.kind, NodeKind::Binary { op: BinaryOp::Add, .. }));
    assert!(matches!(
        rhs.kind,
        NodeKind::Binary {
            op: BinaryOp::Multiply,
            ..
        }
    ));
}

#[test]
fn and_binds_tighter_than_or() {
    let ast = parse("a or b and c").unwrap();
    let NodeKind::Binary { op, rhs, .. } = &ast.ast().kind else {
        panic!("expected binary node");
    };
    assert_eq!(*op, BinaryOp::Or);
    assert!(matches!(rhs.kind, NodeKind::Binary { op: BinaryOp::And, .. }));
}

#[test]
fn path_flattens_into_ordered_steps() {
    let ast = parse("a.b.c").unwrap();
    let NodeKind::Path { steps, .. } = &ast.ast().kind else {
        panic!("expected path node");
    };
    assert_eq!(steps.len(), 3);
    for (step, expected) in steps.iter().zip(["a", "b", "c"]) {
        match &step.kind {
            NodeKind::Name(name) => assert_eq!(name, expected),
            other => panic!("expected a name step, got {:?}", other),
        }
    }
    // no nested path-of-path nodes
    assert!(steps.iter().all(|s| !s.is_path()));
}

#[test]
fn dotted_string_literal_becomes_a_name_step() {
    let ast = parse(r#"a."b c""#).unwrap();
    let NodeKind::Path { steps, .. } = &ast.ast().kind else {
        panic!("expected path node");
    };
    assert!(matches!(&steps[1].kind, NodeKind::Name(n) if n == "b c"));
}

#[test]
fn parsing_is_deterministic() {
    let first = format!("{:?}", parse("a.b[x > 1].{'k': $sum(v)}").unwrap().ast());
    let second = format!("{:?}", parse("a.b[x > 1].{'k': $sum(v)}").unwrap().ast());
    assert_eq!(first, second);
}

#[test]
fn bind_is_right_associative() {
    let ast = parse("$a := $b := 2").unwrap();
    let NodeKind::Bind { name, rhs } = &ast.ast().kind else {
        panic!("expected bind node");
    };
    assert_eq!(name, "a");
    let NodeKind::Bind { name, .. } = &rhs.kind else {
        panic!("expected nested bind node");
    };
    assert_eq!(name, "b");
}

#[test]
fn lambda_definition() {
    let ast = parse("function($x, $y){ $x + $y }").unwrap();
    let NodeKind::Lambda { params, thunk, .. } = &ast.ast().kind else {
        panic!("expected lambda node");
    };
    assert_eq!(params.as_ref(), &["x".to_string(), "y".to_string()]);
    assert!(!thunk);
}

#[test]
fn tail_call_is_thunked() {
    let ast = parse("function($n){ $n = 0 ? 0 : $recurse($n - 1) }").unwrap();
    let NodeKind::Lambda { body, .. } = &ast.ast().kind else {
        panic!("expected lambda node");
    };
    let NodeKind::Condition { otherwise, .. } = &body.kind else {
        panic!("expected conditional body");
    };
    let else_branch = otherwise.as_ref().expect("else branch");
    match &else_branch.kind {
        NodeKind::Lambda { thunk, body, .. } => {
            assert!(*thunk);
            assert!(matches!(body.kind, NodeKind::FunctionCall { .. }));
        }
        other => panic!("expected a thunk, got {:?}", other),
    }
}

#[test]
fn keywords_can_be_field_names() {
    let ast = parse("and").unwrap();
    let NodeKind::Path { steps, .. } = &ast.ast().kind else {
        panic!("expected path node");
    };
    assert!(matches!(&steps[0].kind, NodeKind::Name(n) if n == "and"));
}

#[test]
fn order_by_appends_a_sort_step() {
    let ast = parse("items^(>price, name)").unwrap();
    let NodeKind::Path { steps, .. } = &ast.ast().kind else {
        panic!("expected path node");
    };
    let NodeKind::Sort { terms } = &steps.last().unwrap().kind else {
        panic!("expected sort step");
    };
    assert_eq!(terms.len(), 2);
    assert!(terms[0].descending);
    assert!(!terms[1].descending);
}

#[test]
fn empty_predicate_sets_keep_array() {
    let ast = parse("a[]").unwrap();
    let NodeKind::Path {
        keep_singleton_array,
        ..
    } = &ast.ast().kind
    else {
        panic!("expected path node");
    };
    assert!(*keep_singleton_array);
}

#[test]
fn literal_path_step_is_rejected() {
    assert_eq!(parse_err("a.5"), "S0213");
    assert_eq!(parse_err("a.true"), "S0213");
    assert_eq!(parse_err("a.null"), "S0213");
}

#[test]
fn syntax_errors() {
    assert_eq!(parse_err("(a"), "S0203");
    assert_eq!(parse_err("a b"), "S0201");
    assert_eq!(parse_err("a ! b"), "S0204");
    assert_eq!(parse_err("+"), "S0211");
    assert_eq!(parse_err(""), "S0207");
    assert_eq!(parse_err("a := 5"), "S0212");
    assert_eq!(parse_err("a @ 5"), "S0214");
    assert_eq!(parse_err("function(x){x}"), "S0208");
}

#[test]
fn clause_ordering_is_enforced() {
    // predicate before focus bind
    assert_eq!(parse_err("a[0]@$v"), "S0215");
    // order-by before focus bind
    assert_eq!(parse_err("a^(b)@$v"), "S0216");
    // grouping before predicate (on a bare expression)
    assert_eq!(parse_err("$v{'k': 1}[0]"), "S0209");
    // only one grouping per step
    assert_eq!(parse_err("a{'k': 1}{'j': 2}"), "S0210");
}

#[test]
fn unresolved_ancestor_at_top_level_is_rejected() {
    assert_eq!(parse_err("%"), "S0217");
    assert_eq!(parse_err("%.a"), "S0217");
}

#[test]
fn recovery_mode_collects_errors() {
    let expr = parse_with_recovery("(1; 2").unwrap();
    assert!(!expr.errors.is_empty());

    let expr = parse_with_recovery("$x := ").unwrap();
    assert!(!expr.errors.is_empty());
}

#[test]
fn recovery_mode_collects_multiple_errors() {
    let expr = parse_with_recovery("[1, ! , 2").unwrap();
    assert!(expr.errors.len() >= 2);
}

#[test]
fn regex_literal_vs_division() {
    // operand position: a regex literal
    let ast = parse("$match(a, /b+/)").unwrap();
    let NodeKind::FunctionCall { args, .. } = &ast.ast().kind else {
        panic!("expected function call");
    };
    assert!(matches!(args[1].kind, NodeKind::Regex(_)));

    // operator position: division
    let ast = parse("a / b").unwrap();
    assert!(matches!(
        ast.ast().kind,
        NodeKind::Binary {
            op: BinaryOp::Divide,
            ..
        }
    ));
}
