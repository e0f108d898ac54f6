//! Core types for realmvm: values, heap objects, type descriptors and the
//! resolved guest AST.
//!
//! This crate provides:
//! - [`TypedValue`] / [`Value`] - Guest runtime values
//! - [`ObjectRef`] - Shared handles to heap objects with ownership info
//! - [`Block`] - Lexical scopes and loop cursors
//! - [`Type`] - Static type descriptors
//! - [`Stmt`] / [`Expr`] - Resolved guest AST nodes
//! - [`ObjectId`] / [`Hashlet`] - Durable identities and content hashes
//! - [`Error`] - Rich error types with context

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod block;
pub mod error;
pub mod hash;
pub mod nodes;
pub mod object;
pub mod types;
pub mod value;

pub use block::{Block, BodyCursor, CURSOR_COND, CURSOR_START};
pub use error::{Error, ErrorContext, ErrorKind, Result};
pub use hash::{HASHLET_LEN, Hashlet, ObjectId, PkgId};
pub use nodes::{
    AssignOp, AssignStmt, BinaryExpr, BinaryOp, BlockSource, BlockStmt, BranchOp, BranchStmt,
    Builtin, CallExpr, Clause, CompositeElts, CompositeLitExpr, ConstExpr, Constant, Expr,
    ForStmt, FuncLitExpr, FuncSource, IfStmt, IncDecStmt, IndexExpr, LocatedStmt, Location,
    NameExpr, PkgMemberExpr, RangeOp, RangeStmt, Selection, SelectorExpr, SliceExpr, Stmt,
    SwitchClause, SwitchStmt, TypeClause, TypeSwitchStmt, UnaryExpr, UnaryOp, ValueDeclStmt,
    ValuePath,
};
pub use object::{
    ArrayValue, BoundMethodValue, FuncValue, HeapItemValue, MapValue, NativeRef, ObjectInfo,
    ObjectRef, PackageValue, StructValue, WeakObjectRef,
};
pub use types::{
    ArrayType, DeclaredType, FieldType, FuncType, InterfaceType, Kind, MapType, PrimitiveType,
    StructType, Type, TypeId,
};
pub use value::{
    MapKey, ObjectResolver, PointerValue, RefValue, SliceValue, TypedValue, Value, wrap_float,
    wrap_int, wrap_uint,
};
