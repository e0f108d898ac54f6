//! Builders for hand-resolved guest programs.

use std::sync::Arc;

use realmvm_foundation::{
    BinaryOp, BlockSource, Builtin, Clause, Expr, FieldType, FuncSource, FuncType, IfStmt,
    Location, RangeOp, RangeStmt, Stmt, Type, TypedValue,
};
use realmvm_machine::{Machine, MachineOptions, PackageDecl};
use realmvm_storage::{CacheStore, FuncRegistry, MemBackend};

pub const PKG: &str = "gno.land/p/demo/prog";

pub fn at(line: u32) -> Location {
    Location::new(PKG, "prog.gno", line, 1)
}

pub fn scope(line: u32, names: &[&str]) -> BlockSource {
    BlockSource::new(at(line), names)
}

pub fn ints_named(names: &[&str]) -> Vec<FieldType> {
    names.iter().map(|n| FieldType::new(n, Type::int())).collect()
}

/// Function over ints laid out as params, then `.resN`, then locals.
pub fn func(
    name: &str,
    line: u32,
    params: &[&str],
    results: usize,
    locals: &[&str],
    body: Vec<Stmt>,
) -> FuncSource {
    let results: Vec<String> = (0..results).map(|i| format!(".res{i}")).collect();
    let result_names: Vec<&str> = results.iter().map(String::as_str).collect();
    let mut names = params.to_vec();
    names.extend_from_slice(&result_names);
    names.extend_from_slice(locals);
    FuncSource::new(
        name,
        FuncType::new(ints_named(params), ints_named(&result_names)),
        scope(line, &names),
        body,
    )
}

pub fn var(name: &str, depth: u16, index: u16) -> Expr {
    Expr::name(name, depth, index)
}

pub fn op(o: BinaryOp, l: Expr, r: Expr) -> Expr {
    Expr::binary(o, l, r)
}

pub fn when(line: u32, cond: Expr, then: Vec<Stmt>) -> Stmt {
    IfStmt {
        block: scope(line, &[]),
        init: None,
        cond,
        then: Clause::new(scope(line, &[]), then),
        els: Clause::new(scope(line, &[]), Vec::new()),
    }
    .into()
}

pub fn range(line: u32, names: &[&str], x: Expr, key: Option<Expr>, value: Option<Expr>, body: Vec<Stmt>) -> Stmt {
    RangeStmt {
        label: None,
        block: scope(line, names),
        x,
        key,
        value,
        op: RangeOp::Define,
        body: body.into(),
    }
    .into()
}

pub fn panic_with(msg: &str) -> Stmt {
    Stmt::expr(Expr::builtin(Builtin::Panic, vec![Expr::string(msg)]))
}

pub fn println(args: Vec<Expr>) -> Stmt {
    Stmt::expr(Expr::builtin(Builtin::Println, args))
}

/// `defer func() { if recover() != nil { <target> = v } }()`, where the
/// target is `index` of the function block two scopes up.
pub fn recover_into(line: u32, index: u16, v: i64) -> Stmt {
    let lit = Arc::new(FuncSource::new(
        "",
        FuncType::new(Vec::new(), Vec::new()),
        scope(line, &[]),
        vec![when(
            line,
            op(
                BinaryOp::Neq,
                Expr::builtin(Builtin::Recover, Vec::new()),
                Expr::nil(),
            ),
            vec![Stmt::assign(vec![var("r", 2, index)], vec![Expr::int(v)])],
        )],
    ));
    Stmt::defer(Expr::func_lit(lit, Vec::new()), Vec::new())
}

pub fn machine() -> Machine {
    let st = CacheStore::new(Arc::new(MemBackend::new()), FuncRegistry::new());
    Machine::new(st, MachineOptions::default())
}

pub fn program(m: &mut Machine, names: &[&str], funcs: Vec<FuncSource>) {
    let decl = funcs
        .into_iter()
        .fold(PackageDecl::new("prog", PKG, scope(1, names)), PackageDecl::with_func);
    m.declare_package(decl).unwrap();
}

pub fn call(m: &mut Machine, name: &str, args: &[i64]) -> Vec<i64> {
    let args = args.iter().copied().map(TypedValue::int).collect();
    m.call(PKG, name, args)
        .unwrap()
        .iter()
        .map(|v| v.as_int().unwrap())
        .collect()
}
