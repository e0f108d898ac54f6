//! Integration tests for Layer 2: Realm
//!
//! Tests ownership tracking and finalization against a real store, across
//! several committed transactions.

mod common;
mod invariants;
mod lifecycle;
mod ownership;
