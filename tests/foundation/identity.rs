//! Integration tests for identities and object bookkeeping
//!
//! Tests hashlets, package and object ids, reference counts and owners.

use realmvm_foundation::{ErrorKind, HASHLET_LEN, Hashlet, ObjectId, ObjectRef, PkgId, TypedValue};

// =============================================================================
// Hashes and Ids
// =============================================================================

#[test]
fn hashlets_are_truncated_sha256() {
    let h = Hashlet::of(b"abc");
    assert_eq!(h.0.len(), HASHLET_LEN);
    assert_eq!(h.to_hex(), "ba7816bf8f01cfea414140de5dae2223b00361a3");
    assert_eq!(h, Hashlet::of(b"abc"));
    assert!(!h.is_zero());
    assert!(Hashlet::default().is_zero());
}

#[test]
fn package_ids_derive_from_paths() {
    let a = PkgId::from_path("gno.land/r/demo/a");
    assert_eq!(a, PkgId::from_path("gno.land/r/demo/a"));
    assert_ne!(a, PkgId::from_path("gno.land/r/demo/b"));
    assert!(!a.is_zero());
}

#[test]
fn object_ids_order_by_creation_within_a_package() {
    let pkg = PkgId::from_path("gno.land/r/demo");
    let first = ObjectId::new(pkg, 1);
    let second = ObjectId::new(pkg, 2);
    assert!(first < second);
    assert!(ObjectId::default().is_zero());
    assert!(!first.is_zero());
    assert_eq!(first.key(), format!("oid:{pkg}:1"));
}

// =============================================================================
// Object Bookkeeping
// =============================================================================

#[test]
fn fresh_objects_are_not_real() {
    let o = ObjectRef::structure(vec![TypedValue::int(0)]);
    assert!(!o.is_real());
    assert!(o.id().is_zero());
    assert_eq!(o.ref_count(), 0);
    assert!(o.hash().is_none());
}

#[test]
fn reference_counts_refuse_to_underflow() {
    let o = ObjectRef::heap_item(TypedValue::int(1));
    assert_eq!(o.inc_ref_count(), 1);
    assert_eq!(o.dec_ref_count().unwrap(), 0);
    let err = o.dec_ref_count().unwrap_err();
    assert!(matches!(err.kind, ErrorKind::Persistence(_)));
}

#[test]
fn owner_back_reference_is_weak() {
    let child = ObjectRef::heap_item(TypedValue::int(1));
    {
        let owner = ObjectRef::array(vec![]);
        owner.set_id(ObjectId::new(PkgId::from_path("gno.land/r/demo"), 7));
        child.set_owner(Some(&owner));
        assert!(child.owner().is_some_and(|o| o.ptr_eq(&owner)));
    }
    assert!(child.owner().is_none());
    assert_eq!(child.owner_id().new_time, 7);

    child.set_owner(None);
    assert!(child.owner_id().is_zero());
}

#[test]
fn slots_swap_and_return_the_previous_value() {
    let o = ObjectRef::array(vec![TypedValue::int(1), TypedValue::int(2)]);
    let old = o.set_slot(1, TypedValue::int(5)).unwrap();
    assert_eq!(old.as_int().unwrap(), 2);
    assert_eq!(o.get_slot(1).unwrap().as_int().unwrap(), 5);
    assert!(o.set_slot(2, TypedValue::int(0)).is_err());
}
