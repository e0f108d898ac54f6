//! The realmvm interpreter.
//!
//! This crate provides:
//! - [`Machine`] - Four-stack trampoline interpreter with block and frame stacks
//! - [`Op`] - Pending operations and their cycle costs
//! - [`Frame`] / [`StackDepths`] - Activation records for calls, loops and switches
//! - [`PackageDecl`] - Checked packages, declared with [`Machine::declare_package`]
//! - [`MachineOptions`] - Cycle budget, read-only mode and operation logs
//! - [`NativeInterop`] / [`NativeRegistry`] - Host-implemented functions
//! - [`CoverageTracker`] / [`Profiler`] - Optional instrumentation hooks
//!
//! Guest code never runs on the native stack: statements and expressions are
//! expanded into ops one step at a time, so nesting depth in the guest
//! program costs heap, not Rust stack frames. Runtime errors become guest
//! panics that deferred calls may recover; everything else aborts the
//! transaction.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod assign;
pub mod binary;
mod call;
mod eval;
mod exec;
pub mod frame;
pub mod instrument;
pub mod machine;
pub mod native;
pub mod op;
pub mod options;
mod package;
mod uverse;


pub use call::is_realm_path;
pub use frame::{Defer, Exception, Frame, FrameKind, StackDepths};
pub use instrument::{CoverageTracker, LineCoverage, OpProfile, Profiler};
pub use machine::Machine;
pub use native::{NativeFn, NativeInterop, NativeRegistry};
pub use op::Op;
pub use options::MachineOptions;
pub use package::PackageDecl;
