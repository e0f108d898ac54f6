//! Integration tests for realm records, op logs and dirty propagation

use std::sync::Arc;

use realmvm_foundation::{ObjectRef, TypedValue};
use realmvm_realm::{Realm, RealmOp};
use realmvm_storage::{MemBackend, Store};

use crate::common::{PATH, attach, commit, committed_root, detach, obj_value, store};

#[test]
fn realm_time_survives_through_its_record() {
    let backend = Arc::new(MemBackend::new());
    let mut st = store(&backend);
    let mut rlm = Realm::new(PATH);
    let root = committed_root(&mut rlm, &mut st, 1);
    attach(&mut rlm, &root, 0, &ObjectRef::array(vec![]));
    commit(&mut rlm, &mut st);
    assert_eq!(rlm.time(), 2);

    let mut fresh = store(&backend);
    let record = fresh.get_realm_record(PATH).unwrap().unwrap();
    assert_eq!(record, rlm.record());

    let mut resumed = Realm::from_record(&record);
    let next = resumed.assign_new_object_id(&ObjectRef::array(vec![])).unwrap();
    assert_eq!(next.new_time, 3);
    assert_eq!(next.pkg_id, rlm.id());
}

#[test]
fn op_log_follows_each_transaction() {
    let backend = Arc::new(MemBackend::new());
    let mut st = store(&backend);
    let mut rlm = Realm::new(PATH).with_op_log();
    let root = committed_root(&mut rlm, &mut st, 1);

    let item = ObjectRef::heap_item(TypedValue::int(1));
    attach(&mut rlm, &root, 0, &item);
    commit(&mut rlm, &mut st);
    assert_eq!(
        rlm.take_op_log(),
        vec![RealmOp::New(item.id()), RealmOp::Mod(root.id())]
    );

    detach(&mut rlm, &root, 0);
    commit(&mut rlm, &mut st);
    assert_eq!(
        rlm.take_op_log(),
        vec![RealmOp::Mod(root.id()), RealmOp::Del(item.id())]
    );
    assert!(rlm.op_log().is_empty());
}

#[test]
fn modifying_a_leaf_rewrites_its_ancestors() {
    let backend = Arc::new(MemBackend::new());
    let mut st = store(&backend);
    let mut rlm = Realm::new(PATH);
    let root = committed_root(&mut rlm, &mut st, 1);
    let a = ObjectRef::structure(vec![TypedValue::int(0)]);
    let b = ObjectRef::heap_item(TypedValue::int(1));
    a.set_slot(0, obj_value(&b)).unwrap();
    attach(&mut rlm, &root, 0, &a);
    commit(&mut rlm, &mut st);
    let (root_hash, a_hash) = (root.hash(), a.hash());

    b.set_slot(0, TypedValue::int(2)).unwrap();
    rlm.did_update(Some(&b), None, None).unwrap();
    let summary = commit(&mut rlm, &mut st);
    assert_eq!(summary.updated, 3);
    assert_ne!(root.hash(), root_hash);
    assert_ne!(a.hash(), a_hash);

    let mut fresh = store(&backend);
    let loaded = fresh.get_object(b.id()).unwrap();
    assert_eq!(loaded.get_slot(0).unwrap().as_int().unwrap(), 2);
}

#[test]
fn escaped_objects_stop_dirty_propagation() {
    let backend = Arc::new(MemBackend::new());
    let mut st = store(&backend);
    let mut rlm = Realm::new(PATH);
    let root = committed_root(&mut rlm, &mut st, 2);
    let shared = ObjectRef::heap_item(TypedValue::int(1));
    attach(&mut rlm, &root, 0, &shared);
    attach(&mut rlm, &root, 1, &shared);
    commit(&mut rlm, &mut st);
    let root_hash = root.hash();

    shared.set_slot(0, TypedValue::int(9)).unwrap();
    rlm.did_update(Some(&shared), None, None).unwrap();
    let summary = commit(&mut rlm, &mut st);
    assert_eq!(summary.updated, 1);
    assert_eq!(root.hash(), root_hash);
}

#[test]
fn realms_display_their_path_and_time() {
    let mut rlm = Realm::new(PATH);
    rlm.assign_new_object_id(&ObjectRef::array(vec![])).unwrap();
    let shown = rlm.to_string();
    assert!(shown.starts_with("Realm{gno.land/r/demo/tree@1}#"));
    assert!(shown.ends_with(&rlm.id().to_string()));
}
