//! Resolved guest AST nodes.
//!
//! The checker hands the runtime fully resolved nodes: names carry their
//! block path, composite literals carry their type, and every scope carries a
//! [`BlockSource`] describing its slots. Nodes are immutable and shared
//! through `Arc`, so pushing one onto a machine stack is a pointer copy.

#![allow(clippy::module_name_repetitions)]

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::{FuncType, Type};

// =============================================================================
// Locations and Scopes
// =============================================================================

/// Source position of a node.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    /// Package path.
    pub pkg_path: Arc<str>,
    /// File name within the package.
    pub file: Arc<str>,
    /// Line (1-indexed).
    pub line: u32,
    /// Column (1-indexed).
    pub column: u32,
}

impl Location {
    /// Creates a location.
    #[must_use]
    pub fn new(pkg_path: &str, file: &str, line: u32, column: u32) -> Self {
        Self {
            pkg_path: Arc::from(pkg_path),
            file: Arc::from(file),
            line,
            column,
        }
    }

    /// Store key for nodes at this location.
    #[must_use]
    pub fn key(&self) -> String {
        format!("loc:{self}")
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}:{}:{}",
            self.pkg_path, self.file, self.line, self.column
        )
    }
}

/// Slot layout of one lexical scope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSource {
    /// Slot names in order.
    pub names: Vec<Arc<str>>,
    /// Which slots hold heap items (variables captured by closures).
    pub heap_items: Vec<bool>,
    /// Where the scope begins.
    pub location: Location,
}

impl BlockSource {
    /// Creates a scope with the given slot names and no heap items.
    #[must_use]
    pub fn new(location: Location, names: &[&str]) -> Self {
        Self {
            names: names.iter().map(|n| Arc::from(*n)).collect(),
            heap_items: vec![false; names.len()],
            location,
        }
    }

    /// Marks a slot as a heap item.
    #[must_use]
    pub fn with_heap_item(mut self, index: usize) -> Self {
        if index < self.heap_items.len() {
            self.heap_items[index] = true;
        }
        self
    }

    /// Number of slots.
    #[must_use]
    pub fn num_names(&self) -> usize {
        self.names.len()
    }

    /// Slot index of a name.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n.as_ref() == name)
    }

    /// Returns true if the slot holds a heap item.
    #[must_use]
    pub fn is_heap_item(&self, index: usize) -> bool {
        self.heap_items.get(index).copied().unwrap_or(false)
    }
}

/// Resolved position of a name: parent hops from the current block, then slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ValuePath {
    /// Number of parent links to follow (0 is the current block).
    pub depth: u16,
    /// Slot index in the target block.
    pub index: u16,
}

impl ValuePath {
    /// Creates a value path.
    #[must_use]
    pub fn new(depth: u16, index: u16) -> Self {
        Self { depth, index }
    }
}

// =============================================================================
// Operators
// =============================================================================

/// Binary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Quo,
    /// `%`
    Rem,
    /// `&`
    Band,
    /// `|`
    Bor,
    /// `^`
    Xor,
    /// `<<`
    Shl,
    /// `>>`
    Shr,
    /// `&^`
    Bandn,
    /// `&&`
    Land,
    /// `||`
    Lor,
    /// `==`
    Eql,
    /// `!=`
    Neq,
    /// `<`
    Lss,
    /// `<=`
    Leq,
    /// `>`
    Gtr,
    /// `>=`
    Geq,
}

impl BinaryOp {
    /// True for the short-circuit operators.
    #[must_use]
    pub fn is_short_circuit(self) -> bool {
        matches!(self, Self::Land | Self::Lor)
    }

    /// True for comparisons.
    #[must_use]
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Eql | Self::Neq | Self::Lss | Self::Leq | Self::Gtr | Self::Geq
        )
    }
}

/// Unary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    /// `+x`
    Pos,
    /// `-x`
    Neg,
    /// `!x`
    Not,
    /// `^x`
    Xor,
}

/// Assignment operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AssignOp {
    /// `=`
    Assign,
    /// `:=`
    Define,
    /// Compound `op=`.
    Op(BinaryOp),
}

/// Built-in functions of the universe scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Builtin {
    /// `panic(v)`
    Panic,
    /// `recover()`
    Recover,
    /// `len(x)`
    Len,
    /// `cap(x)`
    Cap,
    /// `append(s, xs...)`
    Append,
    /// `delete(m, k)`
    Delete,
    /// `print(xs...)`
    Print,
    /// `println(xs...)`
    Println,
    /// `make(T, n)`
    Make,
    /// `new(T)`
    New,
    /// `copy(dst, src)`
    Copy,
}

impl Builtin {
    /// All builtins in universe order.
    pub const ALL: [Builtin; 11] = [
        Self::Panic,
        Self::Recover,
        Self::Len,
        Self::Cap,
        Self::Append,
        Self::Delete,
        Self::Print,
        Self::Println,
        Self::Make,
        Self::New,
        Self::Copy,
    ];

    /// Guest-language name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Panic => "panic",
            Self::Recover => "recover",
            Self::Len => "len",
            Self::Cap => "cap",
            Self::Append => "append",
            Self::Delete => "delete",
            Self::Print => "print",
            Self::Println => "println",
            Self::Make => "make",
            Self::New => "new",
            Self::Copy => "copy",
        }
    }

    /// Looks a builtin up by name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.name() == name)
    }
}

// =============================================================================
// Expressions
// =============================================================================

/// Literal constant payloads.
#[derive(Clone, Debug, PartialEq)]
pub enum Constant {
    /// Untyped or typed nil.
    Nil,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Unsigned integer.
    Uint(u64),
    /// Float.
    Float(f64),
    /// String.
    String(Arc<str>),
}

/// A constant with its static type.
#[derive(Clone, Debug, PartialEq)]
pub struct ConstExpr {
    /// Static type; `None` only for untyped nil.
    pub ty: Option<Type>,
    /// Value.
    pub value: Constant,
}

/// A resolved name.
#[derive(Clone, Debug, PartialEq)]
pub struct NameExpr {
    /// Source name.
    pub name: Arc<str>,
    /// Resolved block path.
    pub path: ValuePath,
}

impl NameExpr {
    /// Creates a resolved name.
    #[must_use]
    pub fn new(name: &str, depth: u16, index: u16) -> Self {
        Self {
            name: Arc::from(name),
            path: ValuePath::new(depth, index),
        }
    }
}

/// Reference to a top-level name of another package.
#[derive(Clone, Debug, PartialEq)]
pub struct PkgMemberExpr {
    /// Package path.
    pub pkg_path: Arc<str>,
    /// Member name.
    pub name: Arc<str>,
}

/// Binary expression.
#[derive(Clone, Debug)]
pub struct BinaryExpr {
    /// Operator.
    pub op: BinaryOp,
    /// Left operand.
    pub left: Expr,
    /// Right operand.
    pub right: Expr,
}

/// Unary expression.
#[derive(Clone, Debug)]
pub struct UnaryExpr {
    /// Operator.
    pub op: UnaryOp,
    /// Operand.
    pub x: Expr,
}

/// Call expression.
#[derive(Clone, Debug)]
pub struct CallExpr {
    /// Callee.
    pub func: Expr,
    /// Arguments.
    pub args: Vec<Expr>,
    /// True for `f(xs...)`.
    pub varg: bool,
    /// Number of argument values on the stack at call time.
    pub num_args: usize,
}

impl CallExpr {
    /// Creates a call.
    #[must_use]
    pub fn new(func: Expr, args: Vec<Expr>) -> Self {
        let num_args = args.len();
        Self {
            func,
            args,
            varg: false,
            num_args,
        }
    }

    /// Creates a call whose function and arguments are already on the value
    /// stack (host entry points and deferred calls).
    #[must_use]
    pub fn with_stacked_args(num_args: usize) -> Self {
        Self {
            func: Expr::Blank,
            args: Vec::new(),
            varg: false,
            num_args,
        }
    }

    /// Marks the last argument as spread (`xs...`).
    #[must_use]
    pub fn with_spread(mut self) -> Self {
        self.varg = true;
        self
    }
}

/// Index expression `x[i]`.
#[derive(Clone, Debug)]
pub struct IndexExpr {
    /// Indexed value.
    pub x: Expr,
    /// Index.
    pub index: Expr,
}

/// Slice expression `x[lo:hi]`.
#[derive(Clone, Debug)]
pub struct SliceExpr {
    /// Sliced value.
    pub x: Expr,
    /// Low bound.
    pub low: Option<Expr>,
    /// High bound.
    pub high: Option<Expr>,
}

/// What a selector resolves to.
#[derive(Clone, Debug)]
pub enum Selection {
    /// Struct field by index (pointers are dereferenced automatically).
    Field(usize),
    /// Method value bound to the receiver.
    Method(Arc<FuncSource>),
}

/// Selector expression `x.sel`.
#[derive(Clone, Debug)]
pub struct SelectorExpr {
    /// Receiver expression.
    pub x: Expr,
    /// Resolved selection.
    pub sel: Selection,
}

/// Composite literal elements.
#[derive(Clone, Debug)]
pub enum CompositeElts {
    /// Positional elements (arrays, slices).
    Sequence(Vec<Expr>),
    /// Struct fields by index.
    Fields(Vec<(usize, Expr)>),
    /// Map key/value pairs.
    Pairs(Vec<(Expr, Expr)>),
}

/// Composite literal `T{...}`.
#[derive(Clone, Debug)]
pub struct CompositeLitExpr {
    /// Literal type.
    pub ty: Type,
    /// Elements.
    pub elts: CompositeElts,
}

/// Function literal with its captured names.
#[derive(Clone, Debug)]
pub struct FuncLitExpr {
    /// Function source.
    pub source: Arc<FuncSource>,
    /// Captured heap-item names, in the order of the trailing capture slots.
    pub captures: Vec<NameExpr>,
}

/// A guest expression.
#[derive(Clone, Debug)]
pub enum Expr {
    /// Constant.
    Const(Arc<ConstExpr>),
    /// Resolved name.
    Name(Arc<NameExpr>),
    /// Blank identifier `_`.
    Blank,
    /// Universe builtin.
    Builtin(Builtin),
    /// Member of another package.
    PkgMember(Arc<PkgMemberExpr>),
    /// Binary expression.
    Binary(Arc<BinaryExpr>),
    /// Unary expression.
    Unary(Arc<UnaryExpr>),
    /// Call (or conversion, when the callee is a type).
    Call(Arc<CallExpr>),
    /// Index.
    Index(Arc<IndexExpr>),
    /// Slice.
    Slice(Arc<SliceExpr>),
    /// Selector.
    Selector(Arc<SelectorExpr>),
    /// Dereference `*x`.
    Star(Arc<Expr>),
    /// Address-of `&x`.
    Ref(Arc<Expr>),
    /// Composite literal.
    CompositeLit(Arc<CompositeLitExpr>),
    /// Function literal.
    FuncLit(Arc<FuncLitExpr>),
    /// Type used as a value.
    Type(Type),
}

impl Expr {
    /// Typed constant.
    #[must_use]
    pub fn constant(ty: Type, value: Constant) -> Self {
        Self::Const(Arc::new(ConstExpr {
            ty: Some(ty),
            value,
        }))
    }

    /// `int` constant.
    #[must_use]
    pub fn int(v: i64) -> Self {
        Self::constant(Type::int(), Constant::Int(v))
    }

    /// `string` constant.
    #[must_use]
    pub fn string(v: &str) -> Self {
        Self::constant(Type::string(), Constant::String(Arc::from(v)))
    }

    /// `bool` constant.
    #[must_use]
    pub fn bool(v: bool) -> Self {
        Self::constant(Type::bool(), Constant::Bool(v))
    }

    /// Untyped nil.
    #[must_use]
    pub fn nil() -> Self {
        Self::Const(Arc::new(ConstExpr {
            ty: None,
            value: Constant::Nil,
        }))
    }

    /// Resolved name.
    #[must_use]
    pub fn name(name: &str, depth: u16, index: u16) -> Self {
        Self::Name(Arc::new(NameExpr::new(name, depth, index)))
    }

    /// Member of another package.
    #[must_use]
    pub fn pkg_member(pkg_path: &str, name: &str) -> Self {
        Self::PkgMember(Arc::new(PkgMemberExpr {
            pkg_path: Arc::from(pkg_path),
            name: Arc::from(name),
        }))
    }

    /// Binary expression.
    #[must_use]
    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Self::Binary(Arc::new(BinaryExpr { op, left, right }))
    }

    /// Unary expression.
    #[must_use]
    pub fn unary(op: UnaryOp, x: Expr) -> Self {
        Self::Unary(Arc::new(UnaryExpr { op, x }))
    }

    /// Call expression.
    #[must_use]
    pub fn call(func: Expr, args: Vec<Expr>) -> Self {
        Self::Call(Arc::new(CallExpr::new(func, args)))
    }

    /// Call with the last argument spread.
    #[must_use]
    pub fn call_spread(func: Expr, args: Vec<Expr>) -> Self {
        Self::Call(Arc::new(CallExpr::new(func, args).with_spread()))
    }

    /// Builtin call.
    #[must_use]
    pub fn builtin(b: Builtin, args: Vec<Expr>) -> Self {
        Self::call(Self::Builtin(b), args)
    }

    /// Index expression.
    #[must_use]
    pub fn index(x: Expr, index: Expr) -> Self {
        Self::Index(Arc::new(IndexExpr { x, index }))
    }

    /// Slice expression.
    #[must_use]
    pub fn slice(x: Expr, low: Option<Expr>, high: Option<Expr>) -> Self {
        Self::Slice(Arc::new(SliceExpr { x, low, high }))
    }

    /// Struct field selector.
    #[must_use]
    pub fn field(x: Expr, index: usize) -> Self {
        Self::Selector(Arc::new(SelectorExpr {
            x,
            sel: Selection::Field(index),
        }))
    }

    /// Method value selector.
    #[must_use]
    pub fn method(x: Expr, source: Arc<FuncSource>) -> Self {
        Self::Selector(Arc::new(SelectorExpr {
            x,
            sel: Selection::Method(source),
        }))
    }

    /// `*x`
    #[must_use]
    pub fn star(x: Expr) -> Self {
        Self::Star(Arc::new(x))
    }

    /// `&x`
    #[must_use]
    pub fn addr(x: Expr) -> Self {
        Self::Ref(Arc::new(x))
    }

    /// Composite literal.
    #[must_use]
    pub fn composite(ty: Type, elts: CompositeElts) -> Self {
        Self::CompositeLit(Arc::new(CompositeLitExpr { ty, elts }))
    }

    /// Function literal.
    #[must_use]
    pub fn func_lit(source: Arc<FuncSource>, captures: Vec<NameExpr>) -> Self {
        Self::FuncLit(Arc::new(FuncLitExpr { source, captures }))
    }

    /// Returns true for call expressions (which may push several values).
    #[must_use]
    pub fn is_call(&self) -> bool {
        matches!(self, Self::Call(_))
    }
}

// =============================================================================
// Statements
// =============================================================================

/// Assignment statement.
#[derive(Clone, Debug)]
pub struct AssignStmt {
    /// Operator.
    pub op: AssignOp,
    /// Targets.
    pub lhs: Vec<Expr>,
    /// Values.
    pub rhs: Vec<Expr>,
}

/// `x++` / `x--`.
#[derive(Clone, Debug)]
pub struct IncDecStmt {
    /// Target.
    pub x: Expr,
    /// True for increment.
    pub inc: bool,
}

/// A clause body that extends its enclosing block with extra slots.
#[derive(Clone, Debug)]
pub struct Clause {
    /// Extra slots appended to the enclosing block.
    pub source: BlockSource,
    /// Statements.
    pub body: Arc<[Stmt]>,
}

impl Clause {
    /// Creates a clause.
    #[must_use]
    pub fn new(source: BlockSource, body: Vec<Stmt>) -> Self {
        Self {
            source,
            body: body.into(),
        }
    }
}

/// `if init; cond { then } else { els }`
#[derive(Clone, Debug)]
pub struct IfStmt {
    /// Scope of the init statement.
    pub block: BlockSource,
    /// Init statement.
    pub init: Option<Stmt>,
    /// Condition.
    pub cond: Expr,
    /// Then branch.
    pub then: Clause,
    /// Else branch (empty body when absent).
    pub els: Clause,
}

/// `for init; cond; post { body }`
#[derive(Clone, Debug)]
pub struct ForStmt {
    /// Label, if any.
    pub label: Option<Arc<str>>,
    /// Loop scope.
    pub block: BlockSource,
    /// Init statement.
    pub init: Option<Stmt>,
    /// Condition (`None` loops forever).
    pub cond: Option<Expr>,
    /// Post statement.
    pub post: Option<Stmt>,
    /// Body.
    pub body: Arc<[Stmt]>,
}

/// How a range statement binds key and value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeOp {
    /// No assignment.
    None,
    /// `k, v = range x`
    Assign,
    /// `k, v := range x`
    Define,
}

/// `for k, v := range x { body }`
#[derive(Clone, Debug)]
pub struct RangeStmt {
    /// Label, if any.
    pub label: Option<Arc<str>>,
    /// Loop scope.
    pub block: BlockSource,
    /// Ranged value.
    pub x: Expr,
    /// Key target.
    pub key: Option<Expr>,
    /// Value target.
    pub value: Option<Expr>,
    /// Binding mode.
    pub op: RangeOp,
    /// Body.
    pub body: Arc<[Stmt]>,
}

/// One clause of an expression switch.
#[derive(Clone, Debug)]
pub struct SwitchClause {
    /// Case expressions; empty for `default`.
    pub cases: Vec<Expr>,
    /// Clause body.
    pub clause: Clause,
}

/// `switch init; tag { clauses }`
#[derive(Clone, Debug)]
pub struct SwitchStmt {
    /// Label, if any.
    pub label: Option<Arc<str>>,
    /// Switch scope.
    pub block: BlockSource,
    /// Init statement.
    pub init: Option<Stmt>,
    /// Tag (`None` switches on `true`).
    pub tag: Option<Expr>,
    /// Clauses in source order.
    pub clauses: Vec<SwitchClause>,
}

/// One clause of a type switch.
#[derive(Clone, Debug)]
pub struct TypeClause {
    /// Case types; `None` matches an undefined value. Empty for `default`.
    pub types: Vec<Option<Type>>,
    /// Clause body; when the switch binds a variable it is the first extra slot.
    pub clause: Clause,
}

/// `switch v := x.(type) { clauses }`
#[derive(Clone, Debug)]
pub struct TypeSwitchStmt {
    /// Label, if any.
    pub label: Option<Arc<str>>,
    /// Switch scope.
    pub block: BlockSource,
    /// Init statement.
    pub init: Option<Stmt>,
    /// Switched value.
    pub x: Expr,
    /// True when the clause binds the switched value.
    pub binds: bool,
    /// Clauses in source order.
    pub clauses: Vec<TypeClause>,
}

/// `{ body }` with its own scope.
#[derive(Clone, Debug)]
pub struct BlockStmt {
    /// Scope.
    pub block: BlockSource,
    /// Statements.
    pub body: Arc<[Stmt]>,
}

/// Branch kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BranchOp {
    /// `break`
    Break,
    /// `continue`
    Continue,
    /// `goto`
    Goto,
    /// `fallthrough`
    Fallthrough,
}

/// Branch statement.
#[derive(Clone, Debug)]
pub struct BranchStmt {
    /// Kind.
    pub op: BranchOp,
    /// Target label.
    pub label: Option<Arc<str>>,
    /// For `goto`: blocks to pop to reach the target body.
    pub block_depth: u16,
    /// For `goto`: statement index in the target body. For `fallthrough`:
    /// index of the clause being left.
    pub body_index: usize,
}

/// `var names T = values`
#[derive(Clone, Debug)]
pub struct ValueDeclStmt {
    /// Declared names.
    pub names: Vec<NameExpr>,
    /// Declared type.
    pub ty: Option<Type>,
    /// Initial values (empty for zero values).
    pub values: Vec<Expr>,
}

/// A statement annotated with its source line.
#[derive(Clone, Debug)]
pub struct LocatedStmt {
    /// Line (1-indexed).
    pub line: u32,
    /// Statement.
    pub stmt: Stmt,
}

/// A guest statement.
#[derive(Clone, Debug)]
pub enum Stmt {
    /// Expression statement.
    Expr(Expr),
    /// Assignment.
    Assign(Arc<AssignStmt>),
    /// Increment or decrement.
    IncDec(Arc<IncDecStmt>),
    /// If.
    If(Arc<IfStmt>),
    /// For loop.
    For(Arc<ForStmt>),
    /// Range loop.
    Range(Arc<RangeStmt>),
    /// Expression switch.
    Switch(Arc<SwitchStmt>),
    /// Type switch.
    TypeSwitch(Arc<TypeSwitchStmt>),
    /// Nested block.
    Block(Arc<BlockStmt>),
    /// Return.
    Return(Arc<[Expr]>),
    /// Branch.
    Branch(Arc<BranchStmt>),
    /// Defer.
    Defer(Arc<CallExpr>),
    /// Variable declaration.
    ValueDecl(Arc<ValueDeclStmt>),
    /// Statement with a source line.
    Located(Arc<LocatedStmt>),
    /// No-op.
    Empty,
}

impl Stmt {
    /// Expression statement.
    #[must_use]
    pub fn expr(x: Expr) -> Self {
        Self::Expr(x)
    }

    /// `lhs = rhs`
    #[must_use]
    pub fn assign(lhs: Vec<Expr>, rhs: Vec<Expr>) -> Self {
        Self::Assign(Arc::new(AssignStmt {
            op: AssignOp::Assign,
            lhs,
            rhs,
        }))
    }

    /// `lhs := rhs`
    #[must_use]
    pub fn define(lhs: Vec<Expr>, rhs: Vec<Expr>) -> Self {
        Self::Assign(Arc::new(AssignStmt {
            op: AssignOp::Define,
            lhs,
            rhs,
        }))
    }

    /// `x op= y`
    #[must_use]
    pub fn op_assign(op: BinaryOp, x: Expr, y: Expr) -> Self {
        Self::Assign(Arc::new(AssignStmt {
            op: AssignOp::Op(op),
            lhs: vec![x],
            rhs: vec![y],
        }))
    }

    /// `x++`
    #[must_use]
    pub fn inc(x: Expr) -> Self {
        Self::IncDec(Arc::new(IncDecStmt { x, inc: true }))
    }

    /// `x--`
    #[must_use]
    pub fn dec(x: Expr) -> Self {
        Self::IncDec(Arc::new(IncDecStmt { x, inc: false }))
    }

    /// `return results...`
    #[must_use]
    pub fn ret(results: Vec<Expr>) -> Self {
        Self::Return(results.into())
    }

    /// `defer call`
    #[must_use]
    pub fn defer(func: Expr, args: Vec<Expr>) -> Self {
        Self::Defer(Arc::new(CallExpr::new(func, args)))
    }

    /// `break [label]`
    #[must_use]
    pub fn brk(label: Option<&str>) -> Self {
        Self::branch(BranchOp::Break, label)
    }

    /// `continue [label]`
    #[must_use]
    pub fn cont(label: Option<&str>) -> Self {
        Self::branch(BranchOp::Continue, label)
    }

    fn branch(op: BranchOp, label: Option<&str>) -> Self {
        Self::Branch(Arc::new(BranchStmt {
            op,
            label: label.map(Arc::from),
            block_depth: 0,
            body_index: 0,
        }))
    }

    /// `goto` to statement `body_index` of the body `block_depth` blocks up.
    #[must_use]
    pub fn goto(label: &str, block_depth: u16, body_index: usize) -> Self {
        Self::Branch(Arc::new(BranchStmt {
            op: BranchOp::Goto,
            label: Some(Arc::from(label)),
            block_depth,
            body_index,
        }))
    }

    /// `fallthrough` out of clause `clause_index`.
    #[must_use]
    pub fn fallthrough(clause_index: usize) -> Self {
        Self::Branch(Arc::new(BranchStmt {
            op: BranchOp::Fallthrough,
            label: None,
            block_depth: 0,
            body_index: clause_index,
        }))
    }

    /// `var names ty = values`
    #[must_use]
    pub fn var(names: Vec<NameExpr>, ty: Option<Type>, values: Vec<Expr>) -> Self {
        Self::ValueDecl(Arc::new(ValueDeclStmt { names, ty, values }))
    }

    /// Annotates this statement with a source line.
    #[must_use]
    pub fn at(self, line: u32) -> Self {
        Self::Located(Arc::new(LocatedStmt { line, stmt: self }))
    }
}

impl From<IfStmt> for Stmt {
    fn from(s: IfStmt) -> Self {
        Self::If(Arc::new(s))
    }
}

impl From<ForStmt> for Stmt {
    fn from(s: ForStmt) -> Self {
        Self::For(Arc::new(s))
    }
}

impl From<RangeStmt> for Stmt {
    fn from(s: RangeStmt) -> Self {
        Self::Range(Arc::new(s))
    }
}

impl From<SwitchStmt> for Stmt {
    fn from(s: SwitchStmt) -> Self {
        Self::Switch(Arc::new(s))
    }
}

impl From<TypeSwitchStmt> for Stmt {
    fn from(s: TypeSwitchStmt) -> Self {
        Self::TypeSwitch(Arc::new(s))
    }
}

impl From<BlockStmt> for Stmt {
    fn from(s: BlockStmt) -> Self {
        Self::Block(Arc::new(s))
    }
}

// =============================================================================
// Functions
// =============================================================================

/// Declaration of a function, method, or function literal.
///
/// Block layout: parameters (receiver first for methods), results, locals,
/// then captured heap items.
#[derive(Clone, Debug)]
pub struct FuncSource {
    /// Function name (empty for literals).
    pub name: Arc<str>,
    /// Declaring package.
    pub pkg_path: Arc<str>,
    /// Signature.
    pub ty: Arc<FuncType>,
    /// Body; `None` for natively implemented functions.
    pub body: Option<Arc<[Stmt]>>,
    /// Function scope.
    pub block: BlockSource,
    /// True for methods.
    pub is_method: bool,
}

impl FuncSource {
    /// Creates a guest function.
    #[must_use]
    pub fn new(name: &str, ty: FuncType, block: BlockSource, body: Vec<Stmt>) -> Self {
        Self {
            name: Arc::from(name),
            pkg_path: block.location.pkg_path.clone(),
            ty: Arc::new(ty),
            body: Some(body.into()),
            block,
            is_method: false,
        }
    }

    /// Creates a function implemented by the native interop layer.
    #[must_use]
    pub fn native(name: &str, ty: FuncType, block: BlockSource) -> Self {
        Self {
            name: Arc::from(name),
            pkg_path: block.location.pkg_path.clone(),
            ty: Arc::new(ty),
            body: None,
            block,
            is_method: false,
        }
    }

    /// Marks this function as a method.
    #[must_use]
    pub fn as_method(mut self) -> Self {
        self.is_method = true;
        self
    }

    /// Where the function is declared.
    #[must_use]
    pub fn location(&self) -> &Location {
        &self.block.location
    }
}
