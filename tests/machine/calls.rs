//! Integration tests for calls, results and closures.

use std::sync::Arc;

use proptest::prelude::*;
use realmvm_foundation::{BinaryOp, Expr, FieldType, FuncSource, FuncType, NameExpr, Stmt, Type};
use realmvm_machine::StackDepths;

use crate::common::{call, func, ints_named, machine, op, program, scope, var};

// =============================================================================
// Results
// =============================================================================

#[test]
fn multiple_results_unpack_into_locals() {
    let mut m = machine();
    // func swap(a, b int) (int, int) { return b, a }
    let swap = func(
        "swap",
        10,
        &["a", "b"],
        2,
        &[],
        vec![Stmt::ret(vec![var("b", 0, 1), var("a", 0, 0)])],
    );
    // func pair(x, y int) int { a, b := swap(x, y); return a*10 + b }
    let pair = func(
        "pair",
        20,
        &["x", "y"],
        1,
        &["a", "b"],
        vec![
            Stmt::define(
                vec![var("a", 0, 3), var("b", 0, 4)],
                vec![Expr::call(var("swap", 1, 0), vec![var("x", 0, 0), var("y", 0, 1)])],
            ),
            Stmt::ret(vec![op(
                BinaryOp::Add,
                op(BinaryOp::Mul, var("a", 0, 3), Expr::int(10)),
                var("b", 0, 4),
            )]),
        ],
    );
    program(&mut m, &["swap", "pair"], vec![swap, pair]);

    assert_eq!(call(&mut m, "swap", &[1, 2]), vec![2, 1]);
    assert_eq!(call(&mut m, "pair", &[1, 2]), vec![21]);
    assert_eq!(m.stack_depths(), StackDepths::default());
}

#[test]
fn nested_calls_evaluate_inside_out() {
    let mut m = machine();
    let sq = func(
        "sq",
        10,
        &["x"],
        1,
        &[],
        vec![Stmt::ret(vec![op(BinaryOp::Mul, var("x", 0, 0), var("x", 0, 0))])],
    );
    let dec = func(
        "dec",
        20,
        &["x"],
        1,
        &[],
        vec![Stmt::ret(vec![op(BinaryOp::Sub, var("x", 0, 0), Expr::int(1))])],
    );
    // sq(dec(sq(x)))
    let f = func(
        "f",
        30,
        &["x"],
        1,
        &[],
        vec![Stmt::ret(vec![Expr::call(
            var("sq", 1, 0),
            vec![Expr::call(
                var("dec", 1, 1),
                vec![Expr::call(var("sq", 1, 0), vec![var("x", 0, 0)])],
            )],
        )])],
    );
    program(&mut m, &["sq", "dec", "f"], vec![sq, dec, f]);

    assert_eq!(call(&mut m, "f", &[3]), vec![64]);
}

// =============================================================================
// Closures
// =============================================================================

fn counter_program() -> realmvm_machine::Machine {
    let thunk = FuncType::new(Vec::new(), ints_named(&[".res0"]));
    // func() int { n++; return n }, with n captured
    let lit = Arc::new(FuncSource::new(
        "",
        thunk.clone(),
        scope(12, &[".res0", "n"]).with_heap_item(1),
        vec![Stmt::inc(var("n", 0, 1)), Stmt::ret(vec![var("n", 0, 1)])],
    ));
    // func makeCounter() func() int { n := 0; return func() ... }
    let make = FuncSource::new(
        "makeCounter",
        FuncType::new(Vec::new(), vec![FieldType::new(".res0", Type::func(thunk))]),
        scope(10, &[".res0", "n"]).with_heap_item(1),
        vec![
            Stmt::define(vec![var("n", 0, 1)], vec![Expr::int(0)]),
            Stmt::ret(vec![Expr::func_lit(lit, vec![NameExpr::new("n", 0, 1)])]),
        ],
    );
    let tick = |name: &str| Stmt::expr(Expr::call(var(name, 0, 0), Vec::new()));
    // a, b := makeCounter(), makeCounter(); a(); a(); b(); return a()*10 + b()
    let run = FuncSource::new(
        "run",
        FuncType::new(Vec::new(), ints_named(&[".res0"])),
        scope(20, &["a", "b", ".res0"]),
        vec![
            Stmt::define(
                vec![var("a", 0, 0), var("b", 0, 1)],
                vec![
                    Expr::call(var("makeCounter", 1, 0), Vec::new()),
                    Expr::call(var("makeCounter", 1, 0), Vec::new()),
                ],
            ),
            tick("a"),
            tick("a"),
            Stmt::expr(Expr::call(var("b", 0, 1), Vec::new())),
            Stmt::ret(vec![op(
                BinaryOp::Add,
                op(BinaryOp::Mul, Expr::call(var("a", 0, 0), Vec::new()), Expr::int(10)),
                Expr::call(var("b", 0, 1), Vec::new()),
            )]),
        ],
    );
    let mut m = machine();
    program(&mut m, &["makeCounter", "run"], vec![make, run]);
    m
}

#[test]
fn closures_keep_their_own_captured_variable() {
    let mut m = counter_program();
    assert_eq!(call(&mut m, "run", &[]), vec![32]);
    // Each transaction builds fresh counters.
    assert_eq!(call(&mut m, "run", &[]), vec![32]);
    assert_eq!(m.stack_depths(), StackDepths::default());
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn calls_return_exactly_their_declared_results(n in 0usize..5) {
        let mut m = machine();
        let values = (1..=n).map(|i| Expr::int(i64::try_from(i).unwrap())).collect();
        let f = func("f", 10, &[], n, &[], vec![Stmt::ret(values)]);
        program(&mut m, &["f"], vec![f]);

        let expected: Vec<i64> = (1..=n).map(|i| i64::try_from(i).unwrap()).collect();
        prop_assert_eq!(call(&mut m, "f", &[]), expected);
        prop_assert_eq!(m.stack_depths(), StackDepths::default());
    }
}
