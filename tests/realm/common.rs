//! Shared fixtures for realm tests.

use std::sync::Arc;

use realmvm_foundation::{ObjectRef, TypedValue, Value};
use realmvm_realm::Realm;
use realmvm_storage::{CacheStore, FuncRegistry, MemBackend, Store};

pub const PATH: &str = "gno.land/r/demo/tree";
pub const OTHER: &str = "gno.land/r/demo/other";

pub fn store(backend: &Arc<MemBackend>) -> CacheStore {
    CacheStore::new(backend.clone(), FuncRegistry::new())
}

pub fn obj_value(o: &ObjectRef) -> TypedValue {
    TypedValue {
        t: None,
        v: Value::Object(o.clone()),
    }
}

/// A committed root with `slots` empty slots, standing in for a package block.
pub fn committed_root(rlm: &mut Realm, st: &mut CacheStore, slots: usize) -> ObjectRef {
    let root = ObjectRef::structure((0..slots).map(|_| TypedValue::int(0)).collect());
    rlm.assign_new_object_id(&root).unwrap();
    root.inc_ref_count();
    st.set_object(&root).unwrap();
    st.commit().unwrap();
    root
}

pub fn attach(rlm: &mut Realm, po: &ObjectRef, index: usize, co: &ObjectRef) {
    let old = po.set_slot(index, obj_value(co)).unwrap();
    rlm.did_update(Some(po), old.v.as_object(), Some(co)).unwrap();
}

pub fn detach(rlm: &mut Realm, po: &ObjectRef, index: usize) {
    let old = po.set_slot(index, TypedValue::int(0)).unwrap();
    rlm.did_update(Some(po), old.v.as_object(), None).unwrap();
}

pub fn commit(rlm: &mut Realm, st: &mut CacheStore) -> realmvm_realm::FinalizeSummary {
    let summary = rlm.finalize(st, false).unwrap();
    st.commit().unwrap();
    summary
}
