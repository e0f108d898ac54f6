//! Integration tests for Error types
//!
//! Tests error construction, display, context, and the fatal/recoverable split.

use realmvm_foundation::{Error, ErrorContext, ErrorKind, ObjectId, PkgId};

// =============================================================================
// Error Construction
// =============================================================================

#[test]
fn runtime_errors_are_guest_recoverable() {
    let err = Error::runtime("index out of range [3] with length 2");
    assert!(matches!(err.kind, ErrorKind::Runtime(_)));
    assert!(err.is_guest_recoverable());
    assert!(!err.is_fatal());
}

#[test]
fn everything_else_is_fatal() {
    let errors = [
        Error::internal("stack mismatch"),
        Error::persistence("owner of escaped object"),
        Error::serialization("truncated image"),
        Error::not_yet_implemented("recursive declared types"),
        Error::object_not_found(ObjectId::new(PkgId::from_path("gno.land/r/x"), 3)),
        Error::new(ErrorKind::UnhandledPanic("panic: boom".to_string())),
        Error::new(ErrorKind::ReadOnlyViolation("write in eval".to_string())),
        Error::new(ErrorKind::CycleLimitExceeded { limit: 10 }),
    ];
    for err in errors {
        assert!(err.is_fatal(), "{err} should be fatal");
        assert!(!err.is_guest_recoverable());
    }
}

// =============================================================================
// Error Display
// =============================================================================

#[test]
fn runtime_display_has_go_prefix() {
    let err = Error::runtime("integer divide by zero");
    assert_eq!(err.to_string(), "runtime error: integer divide by zero");
}

#[test]
fn unhandled_panic_displays_message_verbatim() {
    let err = Error::new(ErrorKind::UnhandledPanic("panic: bad\n\tpanic: worse".to_string()));
    assert_eq!(err.to_string(), "panic: bad\n\tpanic: worse");
}

#[test]
fn cycle_limit_display_includes_limit() {
    let err = Error::new(ErrorKind::CycleLimitExceeded { limit: 5_000 });
    assert!(err.to_string().contains("5000"));
}

#[test]
fn object_not_found_display_includes_id() {
    let id = ObjectId::new(PkgId::from_path("gno.land/r/demo"), 42);
    let err = Error::object_not_found(id);
    assert!(err.to_string().ends_with(":42"));
}

// =============================================================================
// Error Context
// =============================================================================

#[test]
fn context_is_attached_without_changing_display() {
    let ctx = ErrorContext::new()
        .with_package("gno.land/r/demo")
        .with_position("counter.gno", 12)
        .with_op("Call");
    let err = Error::runtime("nil pointer dereference").with_context(ctx);
    assert_eq!(err.to_string(), "runtime error: nil pointer dereference");

    let ctx = err.context.expect("context");
    assert_eq!(ctx.pkg_path.as_deref(), Some("gno.land/r/demo"));
    assert_eq!(ctx.line, Some(12));
    assert_eq!(
        ctx.to_string(),
        "in gno.land/r/demo at counter.gno:12 during Call"
    );
}

#[test]
fn empty_context_displays_nothing() {
    assert_eq!(ErrorContext::new().to_string(), "");
}
