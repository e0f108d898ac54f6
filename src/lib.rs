//! Realmvm - Resumable interpreter with realm ownership and persistence
//!
//! This crate re-exports all layers of the realmvm system for convenient access.
//! For detailed documentation, see the individual layer crates.
//!
//! # Architecture
//!
//! ```text
//! Layer 3: realmvm_machine    - Trampoline interpreter, calls, defer/panic, transactions
//! Layer 2: realmvm_realm      - Ownership tracking, reference counts, finalization
//! Layer 1: realmvm_storage    - Object store, cache, images, function registry
//! Layer 0: realmvm_foundation - Core types (TypedValue, ObjectRef, Type, nodes, Error)
//! ```

pub use realmvm_foundation as foundation;
pub use realmvm_machine as machine;
pub use realmvm_realm as realm;
pub use realmvm_storage as storage;
