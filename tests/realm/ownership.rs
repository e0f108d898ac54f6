//! Integration tests for the ownership tree
//!
//! Tests creation, escape and deletion as seen by a fresh store after commit.

use std::sync::Arc;

use realmvm_foundation::{ErrorKind, ObjectRef, TypedValue, Value};
use realmvm_realm::Realm;
use realmvm_storage::{MemBackend, Store};

use crate::common::{OTHER, PATH, attach, commit, committed_root, detach, obj_value, store};

// =============================================================================
// Creation
// =============================================================================

#[test]
fn owned_chain_is_created_with_hashed_references() {
    let backend = Arc::new(MemBackend::new());
    let mut st = store(&backend);
    let mut rlm = Realm::new(PATH);
    let root = committed_root(&mut rlm, &mut st, 2);

    let a = ObjectRef::structure(vec![TypedValue::int(0)]);
    let b = ObjectRef::heap_item(TypedValue::int(5));
    a.set_slot(0, obj_value(&b)).unwrap();
    attach(&mut rlm, &root, 0, &a);
    let summary = commit(&mut rlm, &mut st);
    assert_eq!(summary.created, 2);

    let mut fresh = store(&backend);
    let loaded = fresh.get_object(a.id()).unwrap();
    assert_eq!(loaded.owner_id(), root.id());
    let slot = loaded.get_slot(0).unwrap();
    let Value::Ref(r) = &slot.v else {
        panic!("expected an unloaded reference, got {slot:?}");
    };
    assert_eq!(r.object_id, b.id());
    assert_eq!(r.hash, b.hash());
    assert!(!r.escaped);
}

#[test]
fn churn_within_a_transaction_creates_nothing() {
    let backend = Arc::new(MemBackend::new());
    let mut st = store(&backend);
    let mut rlm = Realm::new(PATH);
    let root = committed_root(&mut rlm, &mut st, 1);
    let time = rlm.time();

    for _ in 0..3 {
        let c = ObjectRef::array(vec![TypedValue::int(1)]);
        attach(&mut rlm, &root, 0, &c);
        detach(&mut rlm, &root, 0);
        assert!(!c.is_real());
    }
    let summary = commit(&mut rlm, &mut st);
    assert_eq!(summary.created, 0);
    assert_eq!(summary.deleted, 0);
    assert_eq!(rlm.time(), time);
    assert_eq!(backend.keys_with_prefix("oid:").unwrap().len(), 1);
}

// =============================================================================
// Escape
// =============================================================================

#[test]
fn escaped_objects_are_stored_without_owner() {
    let backend = Arc::new(MemBackend::new());
    let mut st = store(&backend);
    let mut rlm = Realm::new(PATH);
    let root = committed_root(&mut rlm, &mut st, 2);
    let shared = ObjectRef::heap_item(TypedValue::int(3));
    attach(&mut rlm, &root, 0, &shared);
    attach(&mut rlm, &root, 1, &shared);
    commit(&mut rlm, &mut st);

    let mut fresh = store(&backend);
    let loaded = fresh.get_object(shared.id()).unwrap();
    assert!(loaded.is_escaped());
    assert!(loaded.owner_id().is_zero());
    assert_eq!(loaded.ref_count(), 2);

    let parent = fresh.get_object(root.id()).unwrap();
    let slot = parent.get_slot(1).unwrap();
    let Value::Ref(r) = &slot.v else {
        panic!("expected an unloaded reference, got {slot:?}");
    };
    assert!(r.escaped);
    assert!(r.hash.is_none());
}

#[test]
fn sharing_a_real_object_escapes_it_later() {
    let backend = Arc::new(MemBackend::new());
    let mut st = store(&backend);
    let mut rlm = Realm::new(PATH);
    let root = committed_root(&mut rlm, &mut st, 2);
    let item = ObjectRef::heap_item(TypedValue::int(1));
    attach(&mut rlm, &root, 0, &item);
    commit(&mut rlm, &mut st);
    assert!(!item.is_escaped());
    assert!(item.owner().is_some_and(|o| o.ptr_eq(&root)));

    attach(&mut rlm, &root, 1, &item);
    let summary = commit(&mut rlm, &mut st);
    assert_eq!(summary.escaped, 1);
    assert_eq!(summary.created, 0);
    assert!(item.is_escaped());
    assert!(item.owner().is_none());
}

// =============================================================================
// Deletion
// =============================================================================

#[test]
fn deleting_an_owner_keeps_shared_descendants() {
    let backend = Arc::new(MemBackend::new());
    let mut st = store(&backend);
    let mut rlm = Realm::new(PATH);
    let root = committed_root(&mut rlm, &mut st, 2);

    let a = ObjectRef::structure(vec![TypedValue::int(0), TypedValue::int(0)]);
    let b = ObjectRef::heap_item(TypedValue::int(1));
    let s = ObjectRef::heap_item(TypedValue::int(2));
    a.set_slot(0, obj_value(&b)).unwrap();
    a.set_slot(1, obj_value(&s)).unwrap();
    attach(&mut rlm, &root, 0, &a);
    attach(&mut rlm, &root, 1, &s);
    let summary = commit(&mut rlm, &mut st);
    assert_eq!(summary.created, 3);
    assert!(s.is_escaped());

    detach(&mut rlm, &root, 0);
    let summary = commit(&mut rlm, &mut st);
    assert_eq!(summary.deleted, 2);
    assert!(a.is_deleted() && b.is_deleted());
    assert!(!s.is_deleted());
    assert_eq!(s.ref_count(), 1);

    let fresh = store(&backend);
    assert!(!fresh.has_object(a.id()).unwrap());
    assert!(!fresh.has_object(b.id()).unwrap());
    assert!(fresh.has_object(s.id()).unwrap());
}

#[test]
fn deleted_objects_cannot_be_attached_again() {
    let backend = Arc::new(MemBackend::new());
    let mut st = store(&backend);
    let mut rlm = Realm::new(PATH);
    let root = committed_root(&mut rlm, &mut st, 1);
    let c = ObjectRef::array(vec![]);
    attach(&mut rlm, &root, 0, &c);
    commit(&mut rlm, &mut st);
    detach(&mut rlm, &root, 0);
    commit(&mut rlm, &mut st);

    let err = rlm.did_update(Some(&root), None, Some(&c)).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::Persistence(_)));
}

// =============================================================================
// Realm Boundaries
// =============================================================================

#[test]
fn objects_of_another_realm_are_read_only() {
    let backend = Arc::new(MemBackend::new());
    let mut st = store(&backend);
    let mut owner = Realm::new(PATH);
    let root = committed_root(&mut owner, &mut st, 1);

    let mut other = Realm::new(OTHER);
    let err = other
        .did_update(Some(&root), None, Some(&ObjectRef::array(vec![])))
        .unwrap_err();
    assert!(err.is_guest_recoverable());
    assert_eq!(
        err.to_string(),
        "runtime error: cannot modify external-realm or non-realm object"
    );
    assert!(other.mark_counts().is_empty());
}
