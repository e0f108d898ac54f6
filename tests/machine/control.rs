//! Integration tests for loops, labels and the cycle budget.

use std::sync::Arc;

use realmvm_foundation::{BinaryOp, CompositeElts, ErrorKind, Expr, ForStmt, Stmt, Type};
use realmvm_machine::{Machine, MachineOptions, StackDepths};
use realmvm_storage::{CacheStore, FuncRegistry, MemBackend};

use crate::common::{call, func, machine, op, program, range, scope, var, when, PKG};

/// `label: for v := 0; v < bound; v++ { body }`
fn counting_loop(label: Option<&str>, v: &str, line: u32, bound: Expr, body: Vec<Stmt>) -> Stmt {
    ForStmt {
        label: label.map(Arc::from),
        block: scope(line, &[v]),
        init: Some(Stmt::define(vec![var(v, 0, 0)], vec![Expr::int(0)])),
        cond: Some(op(BinaryOp::Lss, var(v, 0, 0), bound)),
        post: Some(Stmt::inc(var(v, 0, 0))),
        body: body.into(),
    }
    .into()
}

// =============================================================================
// Labels
// =============================================================================

#[test]
fn labeled_break_and_continue_leave_the_outer_loop() {
    let mut m = machine();
    // outer: for i := 0; i < 5; i++ {
    //     for j := 0; j < 5; j++ {
    //         if i == 4 { break outer }
    //         if j > i { continue outer }
    //         s += j
    //     }
    // }
    let inner = counting_loop(
        None,
        "j",
        12,
        Expr::int(5),
        vec![
            when(
                13,
                op(BinaryOp::Eql, var("i", 2, 0), Expr::int(4)),
                vec![Stmt::brk(Some("outer"))],
            ),
            when(
                14,
                op(BinaryOp::Gtr, var("j", 1, 0), var("i", 2, 0)),
                vec![Stmt::cont(Some("outer"))],
            ),
            Stmt::op_assign(BinaryOp::Add, var("s", 2, 1), var("j", 0, 0)),
        ],
    );
    let nested = func(
        "nested",
        10,
        &[],
        1,
        &["s"],
        vec![
            Stmt::define(vec![var("s", 0, 1)], vec![Expr::int(0)]),
            counting_loop(Some("outer"), "i", 11, Expr::int(5), vec![inner]),
            Stmt::ret(vec![var("s", 0, 1)]),
        ],
    );
    program(&mut m, &["nested"], vec![nested]);

    assert_eq!(call(&mut m, "nested", &[]), vec![1 + (1 + 2) + (1 + 2 + 3)]);
    assert_eq!(m.stack_depths(), StackDepths::default());
}

// =============================================================================
// Range
// =============================================================================

#[test]
fn range_without_a_key_visits_every_element() {
    let mut m = machine();
    // s := 0; for _, v := range []int{n, n, n} { s += v }; return s
    let triple = func(
        "triple",
        10,
        &["n"],
        1,
        &["s"],
        vec![
            Stmt::define(vec![var("s", 0, 2)], vec![Expr::int(0)]),
            range(
                11,
                &["v"],
                Expr::composite(
                    Type::slice(Type::int()),
                    CompositeElts::Sequence(vec![var("n", 1, 0), var("n", 1, 0), var("n", 1, 0)]),
                ),
                None,
                Some(var("v", 0, 0)),
                vec![Stmt::op_assign(BinaryOp::Add, var("s", 1, 2), var("v", 0, 0))],
            ),
            Stmt::ret(vec![var("s", 0, 2)]),
        ],
    );
    program(&mut m, &["triple"], vec![triple]);

    assert_eq!(call(&mut m, "triple", &[7]), vec![21]);
    assert_eq!(m.stack_depths(), StackDepths::default());
}

// =============================================================================
// Cycle Budget
// =============================================================================

#[test]
fn the_budget_applies_per_transaction() {
    let st = CacheStore::new(Arc::new(MemBackend::new()), FuncRegistry::new());
    let mut m = Machine::new(st, MachineOptions::metered(2_000));
    let spin = func(
        "spin",
        10,
        &[],
        0,
        &[],
        vec![ForStmt {
            label: None,
            block: scope(11, &[]),
            init: None,
            cond: None,
            post: None,
            body: Vec::new().into(),
        }
        .into()],
    );
    let one = func("one", 20, &[], 1, &[], vec![Stmt::ret(vec![Expr::int(1)])]);
    program(&mut m, &["spin", "one"], vec![spin, one]);

    let err = m.call(PKG, "spin", Vec::new()).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::CycleLimitExceeded { limit: 2_000 }));
    assert!(err.is_fatal());
    assert_eq!(m.stack_depths(), StackDepths::default());

    // The next transaction starts with a full budget.
    assert_eq!(call(&mut m, "one", &[]), vec![1]);
    assert!(m.cycles() <= 2_000);
}
