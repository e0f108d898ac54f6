//! Integration tests for packages, realm records and function sources

use std::sync::Arc;

use realmvm_foundation::{
    Block, BlockSource, ErrorKind, FuncSource, FuncType, FuncValue, Location, ObjectId,
    ObjectInfo, ObjectRef, PackageValue, PkgId, TypedValue, Value,
};
use realmvm_storage::{CacheStore, FuncRegistry, MemBackend, RealmRecord, Store};

const PATH: &str = "gno.land/r/demo/pkgs";

fn oid(time: u64) -> ObjectId {
    ObjectId::new(PkgId::from_path(PATH), time)
}

fn package(block: ObjectRef) -> ObjectRef {
    ObjectRef::Package(std::rc::Rc::new(std::cell::RefCell::new(PackageValue {
        info: ObjectInfo::default(),
        name: Arc::from("pkgs"),
        path: Arc::from(PATH),
        names: vec![Arc::from("x")],
        block: Value::Object(block),
    })))
}

fn inc_source() -> Arc<FuncSource> {
    let loc = Location::new(PATH, "pkgs.gno", 3, 1);
    Arc::new(FuncSource::new(
        "Inc",
        FuncType::new(vec![], vec![]),
        BlockSource::new(loc, &[]),
        vec![],
    ))
}

// =============================================================================
// Packages
// =============================================================================

#[test]
fn packages_are_found_by_path() {
    let backend = Arc::new(MemBackend::new());
    let mut s = CacheStore::new(backend.clone(), FuncRegistry::new());
    assert!(s.get_package(PATH).unwrap().is_none());

    let source = BlockSource::new(Location::new(PATH, "pkgs.gno", 1, 1), &["x"]);
    let mut block = Block::new(&source, Value::Nil);
    block.values[0] = TypedValue::int(11);
    let block = ObjectRef::block(block);
    block.set_id(oid(2));
    s.set_object(&block).unwrap();
    let pkg = package(block);
    pkg.set_id(oid(1));
    s.set_object(&pkg).unwrap();
    s.set_package(&pkg).unwrap();
    s.commit().unwrap();

    let mut s2 = CacheStore::new(backend, FuncRegistry::new());
    let loaded = s2.get_package(PATH).unwrap().unwrap();
    let ObjectRef::Package(p) = &loaded else {
        panic!("expected a package, got {loaded:?}");
    };
    let block = p.borrow().block.resolved(&mut s2).unwrap();
    let x = block.as_object().unwrap().get_slot(0).unwrap();
    assert_eq!(x.as_int().unwrap(), 11);
}

#[test]
fn unreal_packages_cannot_be_recorded() {
    let mut s = CacheStore::new(Arc::new(MemBackend::new()), FuncRegistry::new());
    let pkg = package(ObjectRef::array(vec![]));
    let err = s.set_package(&pkg).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::Persistence(_)));

    let err = s.set_package(&ObjectRef::array(vec![])).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::Internal(_)));
}

// =============================================================================
// Realm Records
// =============================================================================

#[test]
fn realm_records_survive_commit() {
    let backend = Arc::new(MemBackend::new());
    let mut s = CacheStore::new(backend.clone(), FuncRegistry::new());
    let record = RealmRecord {
        path: Arc::from(PATH),
        time: 17,
    };
    s.set_realm_record(&record).unwrap();
    s.commit().unwrap();

    let mut s2 = CacheStore::new(backend, FuncRegistry::new());
    assert_eq!(s2.get_realm_record(PATH).unwrap(), Some(record));
}

// =============================================================================
// Function Sources
// =============================================================================

#[test]
fn persisted_functions_rebind_to_registered_sources() {
    let backend = Arc::new(MemBackend::new());
    let registry = FuncRegistry::new();
    let mut s = CacheStore::new(backend.clone(), registry.clone());
    let source = inc_source();
    s.register_func_source(source.clone()).unwrap();

    let f = ObjectRef::func(FuncValue::from_source(source.clone(), Value::Nil));
    f.set_id(oid(1));
    s.set_object(&f).unwrap();
    s.commit().unwrap();

    let mut s2 = CacheStore::new(backend.clone(), registry);
    let loaded = s2.get_object(oid(1)).unwrap();
    let ObjectRef::Func(fv) = &loaded else {
        panic!("expected a function, got {loaded:?}");
    };
    let fv = fv.borrow();
    assert!(fv.source.as_ref().is_some_and(|src| Arc::ptr_eq(src, &source)));

    let mut s3 = CacheStore::new(backend, FuncRegistry::new());
    let err = s3.get_object(oid(1)).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::SourceNotFound(_)));
}

#[test]
fn registry_clones_share_declarations() {
    let registry = FuncRegistry::new();
    let clone = registry.clone();
    clone.register(inc_source()).unwrap();
    assert_eq!(registry.len(), 1);
    assert!(!registry.is_empty());
}

#[test]
fn missing_objects_are_reported() {
    let mut s = CacheStore::new(Arc::new(MemBackend::new()), FuncRegistry::new());
    let err = s.get_object(oid(9)).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::ObjectNotFound(id) if id == oid(9)));
}
