//! Integration tests for Layer 3: Machine
//!
//! Tests the trampoline through hand-resolved guest programs: calls and
//! returns, control flow, defer and panic, and host interop.

mod calls;
mod common;
mod control;
mod panics;
