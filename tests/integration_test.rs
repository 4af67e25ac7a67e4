// Integration tests for the full compile/evaluate pipeline
//
// These exercise complete expressions through the public API: paths and
// sequence semantics, predicates, grouping, sorting, lambdas and tail
// calls, ancestor references, transforms, and the builtin catalog.

use jsonata_engine::{
    compile, evaluate, jvalue, value::JValue, Bindings, EvaluatorError, NativeContext,
    NativeFunction, ParamSpec,
};

fn invoice() -> JValue {
    JValue::from_json_str(
        r#"{
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
        }"#,
    )
    .unwrap()
}

// ── Spec scenarios ───────────────────────────────────────────────────────────

#[test]
fn basic_path() {
    assert_eq!(evaluate("a", &jvalue!({"a": "b"})).unwrap(), jvalue!("b"));
}

#[test]
fn array_broadcast() {
    assert_eq!(
        evaluate("a", &jvalue!([{"a": "b"}, {"a": "d"}])).unwrap(),
        jvalue!(["b", "d"])
    );
}

#[test]
fn predicate_index_is_zero_based() {
    // $[0] is the first element, so $[1] on [10,20,30] selects 20
    let data = jvalue!([10i64, 20i64, 30i64]);
    assert_eq!(evaluate("$[1]", &data).unwrap(), jvalue!(20i64));
    assert_eq!(evaluate("$[0]", &data).unwrap(), jvalue!(10i64));
    assert_eq!(evaluate("$[-1]", &data).unwrap(), jvalue!(30i64));
    assert!(evaluate("$[3]", &data).unwrap().is_undefined());
}

#[test]
fn sequence_collapse_law() {
    // zero results: undefined
    assert!(evaluate("a.b", &jvalue!({"a": {}})).unwrap().is_undefined());
    // one result: the bare value
    assert_eq!(
        evaluate("a.b", &jvalue!({"a": {"b": 7i64}})).unwrap(),
        jvalue!(7i64)
    );
    // one result with keep-singleton: a one-element array
    assert_eq!(
        evaluate("a.b[]", &jvalue!({"a": {"b": 7i64}})).unwrap(),
        jvalue!([7i64])
    );
    // two or more: an array
    assert_eq!(
        evaluate("a.b", &jvalue!({"a": [{"b": 1i64}, {"b": 2i64}]})).unwrap(),
        jvalue!([1i64, 2i64])
    );
}

#[test]
fn ancestor_resolution_is_deterministic() {
    let data = jvalue!({"data": [
        {"id": 1i64, "name": "a"},
        {"id": 2i64, "name": "b"}
    ]});
    assert_eq!(
        evaluate("data.name.%.id", &data).unwrap(),
        jvalue!([1i64, 2i64])
    );
}

#[test]
fn tail_calls_do_not_grow_the_stack() {
    let expr = compile(
        "($f := function($n, $acc){ $n <= 0 ? $acc : $f($n - 1, $acc + $n) }; $f(100000, 0))",
    )
    .unwrap();
    assert_eq!(
        expr.evaluate(&JValue::Undefined).unwrap(),
        JValue::Integer(5_000_050_000)
    );
}

#[test]
fn identity_transform_is_idempotent() {
    for data in [
        invoice(),
        jvalue!([1i64, 2i64, 3i64]),
        jvalue!("scalar"),
        jvalue!(null),
        jvalue!({"nested": {"deep": [true, {"x": 1.5}]}}),
    ] {
        assert_eq!(evaluate("$ ~> |$|{}|", &data).unwrap(), data);
    }
}

#[test]
fn partial_application_of_native_function() {
    fn mult3(_ctx: &NativeContext, args: &[JValue]) -> Result<JValue, EvaluatorError> {
        let product = args.iter().filter_map(|a| a.as_f64()).product::<f64>();
        Ok(JValue::number(product))
    }

    let bindings = Bindings::new().bind_function(
        "mult3",
        NativeFunction::new("mult3", mult3)
            .param(ParamSpec::of("n"))
            .param(ParamSpec::of("n"))
            .param(ParamSpec::of("n")),
    );

    let expr = compile("($m := $mult3(1, 2, ?); $m(3))").unwrap();
    assert_eq!(
        expr.evaluate_with_bindings(&JValue::Undefined, &bindings)
            .unwrap(),
        JValue::Integer(6)
    );
}

#[test]
fn signature_validation_failure_is_typed() {
    // a declared signature turns a wrong-typed argument into T0410, not a
    // generic error
    let err = evaluate(
        "($f := function($x)<s:s>{ $x }; $f(42))",
        &JValue::Undefined,
    )
    .unwrap_err();
    assert_eq!(err.code(), "T0410");

    // builtins enforce their parameter contracts the same way
    let err = evaluate("$lowercase(true)", &JValue::Undefined).unwrap_err();
    assert_eq!(err.code(), "T0410");
}

#[test]
fn round_trip_of_literals_and_simple_paths() {
    for expr in [
        "42",
        "3.5",
        "\"hello\"",
        "true",
        "null",
        "a.b.c",
        "[1, 2, 3]",
        "{\"a\": 1}",
        "a[0].b",
        "1 + 2 * 3",
    ] {
        let first = compile(expr).unwrap();
        let rendered = first.ast().to_string();
        let second = compile(&rendered)
            .unwrap_or_else(|e| panic!("re-parse of {:?} failed: {}", rendered, e));
        assert_eq!(
            first.ast(),
            second.ast(),
            "round trip changed {:?} (rendered {:?})",
            expr,
            rendered
        );
    }
}

// ── Paths and sequences ──────────────────────────────────────────────────────

#[test]
fn nested_paths_over_arrays_flatten() {
    assert_eq!(
        evaluate("Account.Order.Product.Name", &invoice()).unwrap(),
        jvalue!(["Bowler Hat", "Trilby", "Bowler Hat", "Cloak"])
    );
}

#[test]
fn predicates_filter_during_steps() {
    assert_eq!(
        evaluate("Account.Order.Product[Price > 30].Name", &invoice()).unwrap(),
        jvalue!(["Bowler Hat", "Bowler Hat", "Cloak"])
    );
}

#[test]
fn wildcard_and_descendant() {
    let data = jvalue!({"a": {"x": 1i64}, "b": {"x": 2i64}});
    assert_eq!(evaluate("*.x", &data).unwrap(), jvalue!([1i64, 2i64]));
    assert_eq!(evaluate("**.x", &data).unwrap(), jvalue!([1i64, 2i64]));
}

#[test]
fn path_ending_in_array_constructor_stays_wrapped() {
    assert_eq!(
        evaluate("a.[b]", &jvalue!({"a": {"b": 1i64}})).unwrap(),
        jvalue!([1i64])
    );
}

#[test]
fn absolute_paths_ignore_the_iteration_context() {
    let data = jvalue!({"top": "t", "items": [1i64, 2i64]});
    assert_eq!(
        evaluate("items.($$.top)", &data).unwrap(),
        jvalue!(["t", "t"])
    );
}

// ── Grouping, sorting, bindings ──────────────────────────────────────────────

#[test]
fn group_by_aggregates_per_key() {
    assert_eq!(
        evaluate(
            "Account.Order.Product{Name: $sum(Quantity)}",
            &invoice()
        )
        .unwrap(),
        jvalue!({"Bowler Hat": 6i64, "Trilby": 1i64, "Cloak": 1i64})
    );
}

#[test]
fn order_by_is_stable_and_typed() {
    assert_eq!(
        evaluate("Account.Order.Product^(>Price).Name", &invoice()).unwrap(),
        jvalue!(["Cloak", "Bowler Hat", "Bowler Hat", "Trilby"])
    );
}

#[test]
fn index_binding_counts_positions() {
    let data = jvalue!({"letters": ["a", "b", "c"]});
    assert_eq!(
        evaluate("letters#$i.($i + 1)", &data).unwrap(),
        jvalue!([1i64, 2i64, 3i64])
    );
}

#[test]
fn focus_binding_supports_joins() {
    let data = jvalue!({
        "orders": [{"pid": "p1"}, {"pid": "p2"}],
        "products": [
            {"id": "p1", "label": "hat"},
            {"id": "p2", "label": "cloak"}
        ]
    });
    assert_eq!(
        evaluate("orders@$o.products[id = $o.pid].label", &data).unwrap(),
        jvalue!(["hat", "cloak"])
    );
}

// ── Functions ────────────────────────────────────────────────────────────────

#[test]
fn higher_order_builtins() {
    assert_eq!(
        evaluate("$map([1, 2, 3], function($x){ $x * 2 })", &JValue::Undefined).unwrap(),
        jvalue!([2i64, 4i64, 6i64])
    );
    assert_eq!(
        evaluate(
            "$filter([1, 2, 3, 4], function($x){ $x % 2 = 0 })",
            &JValue::Undefined
        )
        .unwrap(),
        jvalue!([2i64, 4i64])
    );
    assert_eq!(
        evaluate(
            "$reduce([1, 2, 3, 4], function($a, $b){ $a + $b }, 100)",
            &JValue::Undefined
        )
        .unwrap(),
        jvalue!(110i64)
    );
}

#[test]
fn recursive_lambda_with_closure() {
    let expr = "($factorial := function($n){ $n <= 1 ? 1 : $n * $factorial($n - 1) }; $factorial(10))";
    assert_eq!(
        evaluate(expr, &JValue::Undefined).unwrap(),
        jvalue!(3628800i64)
    );
}

#[test]
fn chained_application_reads_left_to_right() {
    assert_eq!(
        evaluate(
            "Account.Order.Product.Price ~> $max ~> $string",
            &invoice()
        )
        .unwrap(),
        jvalue!("107.99")
    );
}

#[test]
fn string_builtins_compose() {
    assert_eq!(
        evaluate(
            "$join($map($split(\"a,b,c\", \",\"), $uppercase), \"-\")",
            &JValue::Undefined
        )
        .unwrap(),
        jvalue!("A-B-C")
    );
}

#[test]
fn regex_literals_drive_string_functions() {
    assert_eq!(
        evaluate("$contains(\"hello world\", /wor../)", &JValue::Undefined).unwrap(),
        jvalue!(true)
    );
    assert_eq!(
        evaluate(
            "$replace(\"2023-01-15\", /(\\d{4})-(\\d{2})-(\\d{2})/, \"$3/$2/$1\")",
            &JValue::Undefined
        )
        .unwrap(),
        jvalue!("15/01/2023")
    );
    assert_eq!(
        evaluate("$split(\"a1b22c\", /\\d+/)", &JValue::Undefined).unwrap(),
        jvalue!(["a", "b", "c"])
    );
}

#[test]
fn transform_on_nested_matches() {
    let result = evaluate(
        "$ ~> |Account.Order.Product|{\"Total\": Price * Quantity}|",
        &invoice(),
    )
    .unwrap();
    let totals = evaluate("Account.Order.Product.Total", &result).unwrap();
    assert_eq!(
        totals,
        jvalue!([68.9, 21.67, 137.8, 107.99])
    );
}

#[test]
fn context_substitution_within_paths() {
    // $uppercase() with no argument takes the step context
    assert_eq!(
        evaluate("names.$uppercase()", &jvalue!({"names": ["ab", "cd"]})).unwrap(),
        jvalue!(["AB", "CD"])
    );
}

// ── Error surfaces ───────────────────────────────────────────────────────────

#[test]
fn static_error_positions_point_into_the_source() {
    let err = compile("a.b[").unwrap_err();
    assert_eq!(err.code(), "S0207");
    assert_eq!(err.position(), Some(4));
}

#[test]
fn each_error_tier_keeps_its_code() {
    // static
    assert_eq!(compile("a{k: v}{x: y}").unwrap_err().code(), "S0210");
    assert_eq!(compile("%").unwrap_err().code(), "S0217");
    // type
    assert_eq!(
        evaluate("\"a\" < 1", &JValue::Undefined).unwrap_err().code(),
        "T2009"
    );
    // dynamic
    assert_eq!(
        evaluate("$error(\"kaboom\")", &JValue::Undefined)
            .unwrap_err()
            .code(),
        "D3137"
    );
}

#[test]
fn undefined_propagation_is_not_an_error() {
    let data = jvalue!({"present": 1i64});
    assert!(evaluate("missing.path", &data).unwrap().is_undefined());
    assert!(evaluate("$uppercase(missing)", &data).unwrap().is_undefined());
    assert!(evaluate("missing + 1", &data).unwrap().is_undefined());
    assert_eq!(evaluate("$count(missing)", &data).unwrap(), jvalue!(0i64));
}

#[test]
fn datetime_builtins_agree_within_one_evaluation() {
    let result = evaluate(
        "($m := $millis(); $toMillis($now()) = $m)",
        &JValue::Undefined,
    )
    .unwrap();
    assert_eq!(result, jvalue!(true));
}

#[test]
fn random_is_in_unit_interval() {
    let result = evaluate("($r := $random(); $r >= 0 and $r < 1)", &JValue::Undefined).unwrap();
    assert_eq!(result, jvalue!(true));
}
