//! Integration tests for realm state driven through the machine.

use std::sync::Arc;

use realmvm_foundation::{
    BinaryOp, BlockSource, Builtin, ErrorKind, Expr, FieldType, FuncSource, FuncType, Location,
    NameExpr, RangeOp, RangeStmt, Stmt, Type, TypedValue,
};
use realmvm_machine::{Machine, MachineOptions, PackageDecl, StackDepths};
use realmvm_realm::RealmOp;
use realmvm_storage::{CacheStore, FuncRegistry, MemBackend};

const REGISTRY: &str = "gno.land/r/demo/registry";
const CLIENT: &str = "gno.land/p/demo/client";

fn at(pkg: &str, line: u32) -> Location {
    Location::new(pkg, "pkg.gno", line, 1)
}

fn ints(names: &[&str]) -> Vec<FieldType> {
    names.iter().map(|n| FieldType::new(n, Type::int())).collect()
}

fn append_x() -> Stmt {
    Stmt::assign(
        vec![Expr::name("items", 1, 0)],
        vec![Expr::builtin(
            Builtin::Append,
            vec![Expr::name("items", 1, 0), Expr::name("x", 0, 0)],
        )],
    )
}

/// ```go
/// var items []int
/// func Add(x int) { items = append(items, x) }
/// func Sum() int { s := 0; for _, v := range items { s += v }; return s }
/// func AddThenFail(x int) { items = append(items, x); panic("rejected") }
/// ```
fn registry() -> PackageDecl {
    let add = FuncSource::new(
        "Add",
        FuncType::new(ints(&["x"]), Vec::new()),
        BlockSource::new(at(REGISTRY, 10), &["x"]),
        vec![append_x()],
    );
    let sum = FuncSource::new(
        "Sum",
        FuncType::new(Vec::new(), ints(&[".res0"])),
        BlockSource::new(at(REGISTRY, 20), &[".res0", "s"]),
        vec![
            Stmt::define(vec![Expr::name("s", 0, 1)], vec![Expr::int(0)]),
            RangeStmt {
                label: None,
                block: BlockSource::new(at(REGISTRY, 21), &["v"]),
                x: Expr::name("items", 2, 0),
                key: None,
                value: Some(Expr::name("v", 0, 0)),
                op: RangeOp::Define,
                body: vec![Stmt::op_assign(
                    BinaryOp::Add,
                    Expr::name("s", 1, 1),
                    Expr::name("v", 0, 0),
                )]
                .into(),
            }
            .into(),
            Stmt::ret(vec![Expr::name("s", 0, 1)]),
        ],
    );
    let fail = FuncSource::new(
        "AddThenFail",
        FuncType::new(ints(&["x"]), Vec::new()),
        BlockSource::new(at(REGISTRY, 30), &["x"]),
        vec![
            append_x(),
            Stmt::expr(Expr::builtin(Builtin::Panic, vec![Expr::string("rejected")])),
        ],
    );
    PackageDecl::new(
        "registry",
        REGISTRY,
        BlockSource::new(at(REGISTRY, 1), &["items", "Add", "Sum", "AddThenFail"]),
    )
    .with_var(Stmt::var(
        vec![NameExpr::new("items", 0, 0)],
        Some(Type::slice(Type::int())),
        Vec::new(),
    ))
    .with_func(add)
    .with_func(sum)
    .with_func(fail)
}

/// A plain package forwarding to the registry.
fn client() -> PackageDecl {
    let forward = |name: &str, target: &str, line: u32| {
        FuncSource::new(
            name,
            FuncType::new(ints(&["x"]), Vec::new()),
            BlockSource::new(at(CLIENT, line), &["x"]),
            vec![Stmt::expr(Expr::call(
                Expr::pkg_member(REGISTRY, target),
                vec![Expr::name("x", 0, 0)],
            ))],
        )
    };
    let total = FuncSource::new(
        "Total",
        FuncType::new(Vec::new(), ints(&[".res0"])),
        BlockSource::new(at(CLIENT, 30), &[".res0"]),
        vec![Stmt::ret(vec![Expr::call(
            Expr::pkg_member(REGISTRY, "Sum"),
            Vec::new(),
        )])],
    );
    PackageDecl::new(
        "client",
        CLIENT,
        BlockSource::new(at(CLIENT, 1), &["Push", "Reject", "Total"]),
    )
    .with_func(forward("Push", "Add", 10))
    .with_func(forward("Reject", "AddThenFail", 20))
    .with_func(total)
}

struct Chain {
    backend: Arc<MemBackend>,
    funcs: FuncRegistry,
}

impl Chain {
    fn new() -> Self {
        Self {
            backend: Arc::new(MemBackend::new()),
            funcs: FuncRegistry::new(),
        }
    }

    fn machine(&self, options: MachineOptions) -> Machine {
        let st = CacheStore::new(self.backend.clone(), self.funcs.clone());
        Machine::new(st, options)
    }
}

fn push(m: &mut Machine, x: i64) {
    assert!(m.call(CLIENT, "Push", vec![TypedValue::int(x)]).unwrap().is_empty());
}

fn total(m: &mut Machine) -> i64 {
    m.call(CLIENT, "Total", Vec::new()).unwrap()[0].as_int().unwrap()
}

// =============================================================================
// Persistence
// =============================================================================

#[test]
fn realm_state_outlives_the_machine_that_wrote_it() {
    let chain = Chain::new();
    let mut m = chain.machine(MachineOptions::default());
    m.declare_package(registry()).unwrap();
    m.declare_package(client()).unwrap();
    push(&mut m, 3);
    push(&mut m, 4);
    assert_eq!(total(&mut m), 7);

    // Only the realm was persisted; the client is declared again.
    let mut fresh = chain.machine(MachineOptions::default());
    assert!(fresh.package(CLIENT).unwrap().is_none());
    fresh.declare_package(client()).unwrap();
    assert_eq!(total(&mut fresh), 7);
    push(&mut fresh, 5);
    assert_eq!(total(&mut fresh), 12);

    let len = Expr::builtin(Builtin::Len, vec![Expr::name("items", 0, 0)]);
    let n = fresh.eval(REGISTRY, &len).unwrap();
    assert_eq!(n[0].as_int().unwrap(), 3);
    assert_eq!(fresh.stack_depths(), StackDepths::default());
}

#[test]
fn an_aborted_transaction_writes_nothing() {
    let chain = Chain::new();
    let mut m = chain.machine(MachineOptions::default());
    m.declare_package(registry()).unwrap();
    m.declare_package(client()).unwrap();
    push(&mut m, 10);
    let before = chain.backend.snapshot().unwrap();

    let err = m
        .call(CLIENT, "Reject", vec![TypedValue::int(99)])
        .unwrap_err();
    match &err.kind {
        ErrorKind::UnhandledPanic(msg) => assert_eq!(msg, "panic: rejected"),
        other => panic!("expected an unhandled panic, got {other:?}"),
    }
    assert_eq!(chain.backend.snapshot().unwrap(), before);
    assert_eq!(total(&mut m), 10);

    // Another machine agrees.
    let mut fresh = chain.machine(MachineOptions::default());
    fresh.declare_package(client()).unwrap();
    assert_eq!(total(&mut fresh), 10);
}

#[test]
fn reading_a_realm_writes_nothing() {
    let chain = Chain::new();
    let mut m = chain.machine(MachineOptions::default());
    m.declare_package(registry()).unwrap();
    m.declare_package(client()).unwrap();
    push(&mut m, 1);
    let before = chain.backend.snapshot().unwrap();

    assert_eq!(total(&mut m), 1);
    assert_eq!(chain.backend.snapshot().unwrap(), before);
}

// =============================================================================
// Change Log
// =============================================================================

#[test]
fn the_op_log_records_growth_of_the_backing_array() {
    let chain = Chain::new();
    let mut m = chain.machine(MachineOptions::default().with_realm_op_log(true));
    m.declare_package(registry()).unwrap();
    m.declare_package(client()).unwrap();
    m.realm_mut(REGISTRY).unwrap().take_op_log();

    // The first append allocates a backing array.
    push(&mut m, 1);
    let log = m.realm_mut(REGISTRY).unwrap().take_op_log();
    assert!(log.iter().any(|op| matches!(op, RealmOp::New(_))), "{log:?}");
    assert!(log.iter().any(|op| matches!(op, RealmOp::Mod(_))), "{log:?}");
    assert!(!log.iter().any(|op| matches!(op, RealmOp::Del(_))), "{log:?}");

    // Growing past capacity replaces it.
    push(&mut m, 2);
    let log = m.realm_mut(REGISTRY).unwrap().take_op_log();
    assert!(log.iter().any(|op| matches!(op, RealmOp::New(_))), "{log:?}");
    assert!(log.iter().any(|op| matches!(op, RealmOp::Del(_))), "{log:?}");
    assert_eq!(total(&mut m), 3);
}
