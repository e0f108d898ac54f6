//! Integration tests for Layer 0: Foundation
//!
//! Tests for core types: TypedValue, ObjectRef, identities and Error.

mod errors;
mod identity;
mod values;
