//! Realm ownership tracking for realmvm.
//!
//! This crate provides:
//! - [`Realm`] - Per-package ownership context and the `did_update` hook
//! - [`Realm::finalize`] - Turns a transaction's marks into store writes
//! - [`RealmOp`] - Optional log of persisted changes
//!
//! Objects reachable from a realm package form an ownership tree: each
//! singly referenced object has exactly one owner, multiply referenced
//! objects are escaped and ownerless, and objects whose reference count
//! drops to zero are deleted together with their exclusively owned
//! descendants.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod finalize;
pub mod realm;

pub use finalize::FinalizeSummary;
pub use realm::{MarkCounts, Realm, RealmOp};
