//! Integration tests for defer, panic and recover.

use std::sync::Arc;

use realmvm_foundation::{
    BinaryOp, Builtin, CompositeElts, ErrorKind, Expr, FieldType, ForStmt, FuncSource, FuncType,
    Stmt, Type,
};
use realmvm_machine::{Machine, StackDepths};

use crate::common::{
    call, func, machine, op, panic_with, println, program, range, recover_into, scope, var, when,
    PKG,
};

fn lit(line: u32, body: Vec<Stmt>) -> Arc<FuncSource> {
    Arc::new(FuncSource::new(
        "",
        FuncType::new(Vec::new(), Vec::new()),
        scope(line, &[]),
        body,
    ))
}

fn unhandled(m: &mut Machine, name: &str) -> String {
    let err = m.call(PKG, name, Vec::new()).unwrap_err();
    match err.kind {
        ErrorKind::UnhandledPanic(msg) => msg,
        other => panic!("expected an unhandled panic, got {other:?}"),
    }
}

// =============================================================================
// Recovery
// =============================================================================

#[test]
fn a_panic_in_a_callee_is_recovered_by_the_caller() {
    let mut m = machine();
    let g = func("g", 10, &[], 0, &[], vec![panic_with("deep")]);
    let f = func(
        "f",
        20,
        &[],
        1,
        &[],
        vec![
            recover_into(21, 0, 5),
            Stmt::expr(Expr::call(var("g", 1, 0), Vec::new())),
            Stmt::ret(vec![Expr::int(1)]),
        ],
    );
    program(&mut m, &["g", "f"], vec![g, f]);

    assert_eq!(call(&mut m, "f", &[]), vec![5]);
    assert!(m.exceptions().is_empty());
    assert_eq!(m.stack_depths(), StackDepths::default());
}

#[test]
fn recovering_inside_a_loop_leaves_no_stale_state() {
    let mut m = machine();
    // func f(n int) int {
    //     defer recover into -1
    //     xs := []int{0, 1, 2}
    //     for i := range xs { if i == n { panic("hit") } }
    //     return 100
    // }
    let f = func(
        "f",
        10,
        &["n"],
        1,
        &["xs"],
        vec![
            recover_into(11, 1, -1),
            Stmt::define(
                vec![var("xs", 0, 2)],
                vec![Expr::composite(
                    Type::slice(Type::int()),
                    CompositeElts::Sequence((0..3).map(Expr::int).collect()),
                )],
            ),
            range(
                12,
                &["i"],
                var("xs", 1, 2),
                Some(var("i", 0, 0)),
                None,
                vec![when(
                    13,
                    op(BinaryOp::Eql, var("i", 1, 0), var("n", 2, 0)),
                    vec![panic_with("hit")],
                )],
            ),
            Stmt::ret(vec![Expr::int(100)]),
        ],
    );
    // func g() int { return f(0) + 1 }
    let g = func(
        "g",
        20,
        &[],
        1,
        &[],
        vec![Stmt::ret(vec![op(
            BinaryOp::Add,
            Expr::call(var("f", 1, 0), vec![Expr::int(0)]),
            Expr::int(1),
        )])],
    );
    // s := 0; for k := 0; k < 3; k++ { s += f(0) }; return s
    let thrice = func(
        "thrice",
        30,
        &[],
        1,
        &["s"],
        vec![
            Stmt::define(vec![var("s", 0, 1)], vec![Expr::int(0)]),
            ForStmt {
                label: None,
                block: scope(31, &["k"]),
                init: Some(Stmt::define(vec![var("k", 0, 0)], vec![Expr::int(0)])),
                cond: Some(op(BinaryOp::Lss, var("k", 0, 0), Expr::int(3))),
                post: Some(Stmt::inc(var("k", 0, 0))),
                body: vec![Stmt::op_assign(
                    BinaryOp::Add,
                    var("s", 1, 1),
                    Expr::call(var("f", 2, 0), vec![Expr::int(0)]),
                )]
                .into(),
            }
            .into(),
            Stmt::ret(vec![var("s", 0, 1)]),
        ],
    );
    program(&mut m, &["f", "g", "thrice"], vec![f, g, thrice]);

    assert_eq!(call(&mut m, "f", &[0]), vec![-1]);
    assert_eq!(call(&mut m, "f", &[5]), vec![100]);
    assert_eq!(call(&mut m, "g", &[]), vec![0]);
    assert_eq!(call(&mut m, "thrice", &[]), vec![-3]);
    assert_eq!(m.stack_depths(), StackDepths::default());
    assert!(m.exceptions().is_empty());
}

#[test]
fn recover_only_works_directly_in_the_deferred_call() {
    let mut m = machine();
    let helper = func(
        "helper",
        10,
        &[],
        0,
        &[],
        vec![Stmt::expr(Expr::builtin(Builtin::Recover, Vec::new()))],
    );
    // defer func() { helper() }(); panic("boom")
    let indirect = func(
        "indirect",
        20,
        &[],
        0,
        &[],
        vec![
            Stmt::defer(
                Expr::func_lit(
                    lit(21, vec![Stmt::expr(Expr::call(var("helper", 2, 0), Vec::new()))]),
                    Vec::new(),
                ),
                Vec::new(),
            ),
            panic_with("boom"),
        ],
    );
    // defer helper(); panic("boom")
    let direct = func(
        "direct",
        30,
        &[],
        1,
        &[],
        vec![
            Stmt::defer(var("helper", 1, 0), Vec::new()),
            panic_with("boom"),
        ],
    );
    program(&mut m, &["helper", "indirect", "direct"], vec![helper, indirect, direct]);

    assert_eq!(unhandled(&mut m, "indirect"), "panic: boom");
    assert_eq!(m.stack_depths(), StackDepths::default());
    assert_eq!(call(&mut m, "direct", &[]), vec![0]);
}

#[test]
fn recover_returns_the_panic_value() {
    let mut m = machine();
    // func f() (r any) { defer func() { r = recover() }(); panic("oops") }
    let f = FuncSource::new(
        "f",
        FuncType::new(Vec::new(), vec![FieldType::new(".res0", Type::any())]),
        scope(10, &[".res0"]),
        vec![
            Stmt::defer(
                Expr::func_lit(
                    lit(
                        11,
                        vec![Stmt::assign(
                            vec![var(".res0", 1, 0)],
                            vec![Expr::builtin(Builtin::Recover, Vec::new())],
                        )],
                    ),
                    Vec::new(),
                ),
                Vec::new(),
            ),
            panic_with("oops"),
        ],
    );
    program(&mut m, &["f"], vec![f]);

    let out = m.call(PKG, "f", Vec::new()).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(&**out[0].as_str().unwrap(), "oops");
}

// =============================================================================
// Unhandled
// =============================================================================

#[test]
fn a_panic_during_a_deferred_call_chains_both_messages() {
    let mut m = machine();
    let f = func(
        "f",
        10,
        &[],
        0,
        &[],
        vec![
            Stmt::defer(Expr::func_lit(lit(11, vec![panic_with("second")]), Vec::new()), Vec::new()),
            panic_with("first"),
        ],
    );
    program(&mut m, &["f"], vec![f]);

    assert_eq!(unhandled(&mut m, "f"), "panic: second\n\tpanic: first");
    assert!(m.exceptions().is_empty());
    assert_eq!(m.stack_depths(), StackDepths::default());
}

// =============================================================================
// Defer
// =============================================================================

#[test]
fn deferred_arguments_are_evaluated_when_deferred() {
    let mut m = machine();
    // x := 1; defer println(x); x = 2; println(x)
    let f = func(
        "f",
        10,
        &[],
        0,
        &["x"],
        vec![
            Stmt::define(vec![var("x", 0, 0)], vec![Expr::int(1)]),
            Stmt::defer(Expr::Builtin(Builtin::Println), vec![var("x", 0, 0)]),
            Stmt::assign(vec![var("x", 0, 0)], vec![Expr::int(2)]),
            println(vec![var("x", 0, 0)]),
        ],
    );
    program(&mut m, &["f"], vec![f]);

    assert!(call(&mut m, "f", &[]).is_empty());
    assert_eq!(m.take_output(), "2\n1\n");
}

#[test]
fn deferred_calls_see_named_results() {
    let mut m = machine();
    // func f() (r int) { defer func() { r *= 2 }(); return 21 }
    let f = func(
        "f",
        10,
        &[],
        1,
        &[],
        vec![
            Stmt::defer(
                Expr::func_lit(
                    lit(
                        11,
                        vec![Stmt::op_assign(BinaryOp::Mul, var(".res0", 1, 0), Expr::int(2))],
                    ),
                    Vec::new(),
                ),
                Vec::new(),
            ),
            Stmt::ret(vec![Expr::int(21)]),
        ],
    );
    program(&mut m, &["f"], vec![f]);

    assert_eq!(call(&mut m, "f", &[]), vec![42]);
}
