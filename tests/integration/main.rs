//! Integration tests for the full stack
//!
//! A realm package driven from a plain package across several machines
//! sharing one backend: persistence, aborted transactions, read-only
//! evaluation and the realm change log.

mod realms;
