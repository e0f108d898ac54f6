//! Error types for realmvm.
//!
//! Errors fall into two disjoint categories. Fatal errors mean an invariant
//! of the host was violated (stack mismatch, wrong value kind, bookkeeping
//! inconsistency) and abort the transaction. Guest-visible errors are runtime
//! conditions raised by guest code; the machine converts them into guest
//! panics that a deferred `recover` may catch.

use std::fmt;

use thiserror::Error;

use crate::hash::ObjectId;

/// The main error type for realmvm operations.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct Error {
    /// The kind of error that occurred.
    pub kind: ErrorKind,
    /// Optional context about where the error occurred.
    pub context: Option<ErrorContext>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
        }
    }

    /// Adds context to this error.
    #[must_use]
    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Creates an internal invariant violation.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal(message.into()))
    }

    /// Creates a guest runtime error (recoverable by guest code).
    #[must_use]
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime(message.into()))
    }

    /// Creates an object not found error.
    #[must_use]
    pub fn object_not_found(id: ObjectId) -> Self {
        Self::new(ErrorKind::ObjectNotFound(id))
    }

    /// Creates a persistence bookkeeping error.
    #[must_use]
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Persistence(message.into()))
    }

    /// Creates a serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization(message.into()))
    }

    /// Creates a not-yet-implemented error for a known unsupported path.
    #[must_use]
    pub fn not_yet_implemented(what: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotYetImplemented(what.into()))
    }

    /// Returns true if this error must abort the transaction.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !self.is_guest_recoverable()
    }

    /// Returns true if guest code may observe this error as a panic value.
    #[must_use]
    pub fn is_guest_recoverable(&self) -> bool {
        matches!(self.kind, ErrorKind::Runtime(_))
    }
}

/// Categorized error kinds for pattern matching.
#[derive(Debug, Error)]
pub enum ErrorKind {
    /// Guest-triggered runtime condition, converted into a guest panic.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// A guest panic reached the outermost frame without being recovered.
    ///
    /// The message lists every panic in the chain, most recent first.
    #[error("{0}")]
    UnhandledPanic(String),

    /// Object was not found in the store.
    #[error("object not found: {0}")]
    ObjectNotFound(ObjectId),

    /// Declared type was not found in the store.
    #[error("type not found: {0}")]
    TypeNotFound(String),

    /// Function source was not registered for a location.
    #[error("function source not found: {0}")]
    SourceNotFound(String),

    /// Ownership or persistence bookkeeping is inconsistent.
    #[error("persistence invariant violated: {0}")]
    Persistence(String),

    /// A read-only transaction tried to mutate durable state.
    #[error("read-only violation: {0}")]
    ReadOnlyViolation(String),

    /// Encoding or decoding of a persisted image failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The configured cycle budget was exhausted.
    #[error("cycle limit exceeded: {limit}")]
    CycleLimitExceeded {
        /// The configured limit.
        limit: u64,
    },

    /// A path the runtime knowingly does not support yet.
    #[error("not yet implemented: {0}")]
    NotYetImplemented(String),

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Context about where an error occurred.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// Package path being executed.
    pub pkg_path: Option<String>,
    /// Source file.
    pub file: Option<String>,
    /// Line number in source.
    pub line: Option<u32>,
    /// Op being dispatched when the error surfaced.
    pub op: Option<String>,
}

impl ErrorContext {
    /// Creates a new empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the package path.
    #[must_use]
    pub fn with_package(mut self, pkg_path: impl Into<String>) -> Self {
        self.pkg_path = Some(pkg_path.into());
        self
    }

    /// Sets the source file and line.
    #[must_use]
    pub fn with_position(mut self, file: impl Into<String>, line: u32) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self
    }

    /// Sets the op name.
    #[must_use]
    pub fn with_op(mut self, op: impl Into<String>) -> Self {
        self.op = Some(op.into());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(pkg) = &self.pkg_path {
            write!(f, "in {pkg}")?;
        }
        if let Some(file) = &self.file {
            write!(f, " at {file}")?;
            if let Some(line) = self.line {
                write!(f, ":{line}")?;
            }
        }
        if let Some(op) = &self.op {
            write!(f, " during {op}")?;
        }
        Ok(())
    }
}

/// Result type alias for realmvm operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::PkgId;

    #[test]
    fn runtime_errors_are_recoverable() {
        let err = Error::runtime("index out of range [3] with length 2");
        assert!(err.is_guest_recoverable());
        assert!(!err.is_fatal());
        assert_eq!(
            format!("{err}"),
            "runtime error: index out of range [3] with length 2"
        );
    }

    #[test]
    fn internal_errors_are_fatal() {
        let err = Error::internal("stack underflow");
        assert!(err.is_fatal());
        assert!(format!("{err}").contains("stack underflow"));
    }

    #[test]
    fn object_not_found_mentions_id() {
        let id = ObjectId::new(PkgId::from_path("gno.land/r/demo"), 7);
        let err = Error::object_not_found(id);
        assert!(matches!(err.kind, ErrorKind::ObjectNotFound(_)));
        assert!(format!("{err}").ends_with(":7"));
    }

    #[test]
    fn error_with_context() {
        let err = Error::internal("bad kind").with_context(
            ErrorContext::new()
                .with_package("gno.land/r/demo")
                .with_position("demo.gno", 12)
                .with_op("Index1"),
        );
        let ctx = err.context.expect("context set");
        assert_eq!(ctx.line, Some(12));
        let shown = format!("{ctx}");
        assert!(shown.contains("demo.gno:12"));
        assert!(shown.contains("Index1"));
    }
}
