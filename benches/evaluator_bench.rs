//! Criterion benchmarks for the expression engine.
//!
//! Measures compile cost and raw evaluation cost separately: the compiled
//! AST is reused across iterations, which is the intended usage pattern.
//!
//! Run:
//!   cargo bench
//!   cargo bench -- simple_path       # one group
//!   cargo bench -- realistic_workload

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use indexmap::IndexMap;
use jsonata_engine::{compile, value::JValue};

// ── Data builders ────────────────────────────────────────────────────────────

/// Tiny single-field object used by simple-path benchmarks.
fn tiny_obj(key: &str, val: JValue) -> JValue {
    let mut m = IndexMap::new();
    m.insert(key.to_string(), val);
    JValue::object(m)
}

/// Object holding a flat numeric array: {"values": [0, 1, ..., n-1]}.
fn numeric_array(n: usize) -> JValue {
    let values: Vec<JValue> = (0..n as i64).map(JValue::Integer).collect();
    tiny_obj("values", JValue::array(values))
}

/// Array of order-like records for predicate/grouping benchmarks.
fn orders(n: usize) -> JValue {
    let items: Vec<JValue> = (0..n)
        .map(|i| {
            let mut m = IndexMap::new();
            m.insert("id".to_string(), JValue::Integer(i as i64));
            m.insert(
                "price".to_string(),
                JValue::Float((i % 100) as f64 + 0.5),
            );
            m.insert(
                "category".to_string(),
                JValue::string(["a", "b", "c"][i % 3]),
            );
            JValue::object(m)
        })
        .collect();
    tiny_obj("orders", JValue::array(items))
}

// ── Benchmarks ───────────────────────────────────────────────────────────────

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");
    for expr in [
        "a",
        "orders[price > 50].id",
        "orders{category: $sum(price)}",
        "($f := function($n, $acc){ $n <= 0 ? $acc : $f($n - 1, $acc + $n) }; $f(10, 0))",
    ] {
        group.bench_with_input(BenchmarkId::from_parameter(expr), expr, |b, expr| {
            b.iter(|| compile(black_box(expr)).unwrap());
        });
    }
    group.finish();
}

fn bench_simple_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("simple_path");
    let expr = compile("a.b.c").unwrap();
    let mut inner = IndexMap::new();
    inner.insert("c".to_string(), JValue::Integer(42));
    let data = tiny_obj("a", tiny_obj("b", JValue::object(inner)));
    group.bench_function("a.b.c", |b| {
        b.iter(|| expr.evaluate(black_box(&data)).unwrap());
    });
    group.finish();
}

fn bench_predicates(c: &mut Criterion) {
    let mut group = c.benchmark_group("predicates");
    let expr = compile("orders[price > 50].id").unwrap();
    for n in [100usize, 1000] {
        let data = orders(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &data, |b, data| {
            b.iter(|| expr.evaluate(black_box(data)).unwrap());
        });
    }
    group.finish();
}

fn bench_aggregation(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregation");
    let expr = compile("$sum(values)").unwrap();
    for n in [100usize, 10_000] {
        let data = numeric_array(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &data, |b, data| {
            b.iter(|| expr.evaluate(black_box(data)).unwrap());
        });
    }
    group.finish();
}

fn bench_realistic_workload(c: &mut Criterion) {
    let mut group = c.benchmark_group("realistic_workload");
    let expr = compile("orders{category: $round($average(price), 2)}").unwrap();
    let data = orders(1000);
    group.bench_function("group_and_average_1000", |b| {
        b.iter(|| expr.evaluate(black_box(&data)).unwrap());
    });

    let tail = compile(
        "($f := function($n, $acc){ $n <= 0 ? $acc : $f($n - 1, $acc + $n) }; $f(5000, 0))",
    )
    .unwrap();
    group.bench_function("tail_recursion_5000", |b| {
        b.iter(|| tail.evaluate(black_box(&JValue::Undefined)).unwrap());
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_compile,
    bench_simple_path,
    bench_predicates,
    bench_aggregation,
    bench_realistic_workload
);
criterion_main!(benches);
