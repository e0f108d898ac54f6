//! Integration tests for Layer 1: Storage
//!
//! Tests for the backend, the transactional cache store and packages.

mod backend;
mod objects;
mod packages;
