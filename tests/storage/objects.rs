//! Integration tests for CacheStore object persistence
//!
//! Tests identity caching, lazy child loading, hashing and transactions.

use std::sync::Arc;

use realmvm_foundation::{
    ErrorKind, FieldType, ObjectId, ObjectRef, PkgId, Type, TypedValue, Value,
};
use realmvm_storage::{Backend, CacheStore, FuncRegistry, MemBackend, Store, WriteBatch};

const PATH: &str = "gno.land/r/demo/storage";

fn oid(time: u64) -> ObjectId {
    ObjectId::new(PkgId::from_path(PATH), time)
}

fn store(backend: &Arc<MemBackend>) -> CacheStore {
    CacheStore::new(backend.clone(), FuncRegistry::new())
}

fn saved(s: &mut CacheStore, obj: ObjectRef, time: u64) -> ObjectRef {
    obj.set_id(oid(time));
    s.set_object(&obj).unwrap();
    obj
}

// =============================================================================
// Round Trips
// =============================================================================

#[test]
fn structs_reload_with_their_fields() {
    let backend = Arc::new(MemBackend::new());
    let mut s = store(&backend);
    saved(
        &mut s,
        ObjectRef::structure(vec![TypedValue::string("alice"), TypedValue::int(30)]),
        1,
    );
    s.commit().unwrap();

    let mut s2 = store(&backend);
    let loaded = s2.get_object(oid(1)).unwrap();
    assert_eq!(loaded.get_slot(0).unwrap().as_str().unwrap().as_ref(), "alice");
    assert_eq!(loaded.get_slot(1).unwrap().as_int().unwrap(), 30);
    assert_eq!(loaded.id(), oid(1));
}

#[test]
fn maps_reload_in_insertion_order() {
    let backend = Arc::new(MemBackend::new());
    let mut s = store(&backend);
    let m = ObjectRef::map();
    if let ObjectRef::Map(inner) = &m {
        let mut inner = inner.borrow_mut();
        for (k, v) in [("b", 2), ("a", 1), ("c", 3)] {
            let key = TypedValue::string(k);
            inner.set(key.map_key().unwrap(), key, TypedValue::int(v));
        }
    }
    saved(&mut s, m, 1);
    s.commit().unwrap();

    let mut s2 = store(&backend);
    let loaded = s2.get_object(oid(1)).unwrap();
    let ObjectRef::Map(inner) = &loaded else {
        panic!("expected a map, got {loaded:?}");
    };
    let inner = inner.borrow();
    let keys: Vec<String> = inner.entries.values().map(|(k, _)| k.to_string()).collect();
    assert_eq!(keys, ["b", "a", "c"]);
    let a = TypedValue::string("a").map_key().unwrap();
    assert_eq!(inner.get(&a).unwrap().as_int().unwrap(), 1);
}

#[test]
fn struct_types_survive_persistence() {
    let backend = Arc::new(MemBackend::new());
    let mut s = store(&backend);
    let t = Type::structure("main", vec![FieldType::new("n", Type::int())]);
    let inner = saved(&mut s, ObjectRef::structure(vec![TypedValue::int(4)]), 2);
    saved(
        &mut s,
        ObjectRef::heap_item(TypedValue::new(t.clone(), Value::Object(inner))),
        1,
    );
    s.commit().unwrap();

    let mut s2 = store(&backend);
    let item = s2.get_object(oid(1)).unwrap();
    assert_eq!(item.get_slot(0).unwrap().t, Some(t));
}

// =============================================================================
// Identity Cache
// =============================================================================

#[test]
fn one_live_object_per_id() {
    let backend = Arc::new(MemBackend::new());
    let mut s = store(&backend);
    saved(&mut s, ObjectRef::array(vec![TypedValue::int(1)]), 1);
    s.commit().unwrap();

    let mut s2 = store(&backend);
    let a = s2.get_object(oid(1)).unwrap();
    let b = s2.get_object(oid(1)).unwrap();
    assert!(a.ptr_eq(&b));
    assert_eq!(s2.num_cached(), 1);
}

#[test]
fn unloaded_children_resolve_through_the_store() {
    let backend = Arc::new(MemBackend::new());
    let mut s = store(&backend);
    let child = saved(&mut s, ObjectRef::heap_item(TypedValue::int(8)), 2);
    saved(
        &mut s,
        ObjectRef::array(vec![TypedValue::new(Type::HeapItem, Value::Object(child))]),
        1,
    );
    s.commit().unwrap();

    let mut s2 = store(&backend);
    let parent = s2.get_object(oid(1)).unwrap();
    let slot = parent.get_slot(0).unwrap();
    let resolved = slot.v.resolved(&mut s2).unwrap();
    let child = resolved.as_object().unwrap();
    assert_eq!(child.get_slot(0).unwrap().as_int().unwrap(), 8);
    assert!(child.ptr_eq(&s2.get_object(oid(2)).unwrap()));
}

// =============================================================================
// Hashes
// =============================================================================

#[test]
fn hash_tracks_content() {
    let backend = Arc::new(MemBackend::new());
    let mut s = store(&backend);
    let obj = saved(&mut s, ObjectRef::array(vec![TypedValue::int(1)]), 1);
    let first = obj.hash().unwrap();
    obj.set_slot(0, TypedValue::int(2)).unwrap();
    let second = s.set_object(&obj).unwrap();
    assert_ne!(first, second);
    obj.set_slot(0, TypedValue::int(1)).unwrap();
    assert_eq!(s.set_object(&obj).unwrap(), first);
}

// =============================================================================
// Failures
// =============================================================================

#[test]
fn unreal_objects_cannot_be_saved() {
    let backend = Arc::new(MemBackend::new());
    let mut s = store(&backend);
    let err = s.set_object(&ObjectRef::array(vec![])).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::Persistence(_)));
}

#[test]
fn references_to_unreal_children_are_rejected() {
    let backend = Arc::new(MemBackend::new());
    let mut s = store(&backend);
    let parent = ObjectRef::heap_item(TypedValue::new(
        Type::array(0, Type::int()),
        Value::Object(ObjectRef::array(vec![])),
    ));
    parent.set_id(oid(1));
    let err = s.set_object(&parent).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::Persistence(_)));
}

#[test]
fn images_under_the_wrong_key_are_detected() {
    let backend = Arc::new(MemBackend::new());
    let mut s = store(&backend);
    saved(&mut s, ObjectRef::array(vec![]), 1);
    s.commit().unwrap();

    let image = s.object_bytes(oid(1)).unwrap().unwrap();
    let mut batch = WriteBatch::new();
    batch.put(oid(2).key(), image);
    backend.apply(batch).unwrap();

    let mut s2 = store(&backend);
    let err = s2.get_object(oid(2)).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::Persistence(_)));
}

// =============================================================================
// Transactions
// =============================================================================

#[test]
fn writes_are_invisible_until_commit() {
    let backend = Arc::new(MemBackend::new());
    let mut s = store(&backend);
    saved(&mut s, ObjectRef::array(vec![]), 1);
    assert!(s.has_object(oid(1)).unwrap());
    assert_eq!(s.num_pending(), 1);
    assert!(backend.is_empty().unwrap());

    assert_eq!(s.commit().unwrap(), 1);
    assert_eq!(s.num_pending(), 0);
    assert!(!backend.is_empty().unwrap());
}

#[test]
fn deletes_commit_as_removals() {
    let backend = Arc::new(MemBackend::new());
    let mut s = store(&backend);
    let obj = saved(&mut s, ObjectRef::array(vec![]), 1);
    s.commit().unwrap();

    s.del_object(&obj).unwrap();
    assert!(!s.has_object(oid(1)).unwrap());
    s.commit().unwrap();
    assert!(backend.keys_with_prefix("oid:").unwrap().is_empty());
}

#[test]
fn discard_forgets_cached_objects() {
    let backend = Arc::new(MemBackend::new());
    let mut s = store(&backend);
    saved(&mut s, ObjectRef::array(vec![]), 1);
    s.commit().unwrap();
    let a = s.get_object(oid(1)).unwrap();

    s.discard();
    assert_eq!(s.num_cached(), 0);
    let b = s.get_object(oid(1)).unwrap();
    assert!(!a.ptr_eq(&b));
}
