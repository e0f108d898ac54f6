//! Integration tests for MemBackend and WriteBatch

use std::sync::Arc;

use realmvm_storage::{Backend, MemBackend, WriteBatch};

fn bytes(s: &str) -> Arc<[u8]> {
    Arc::from(s.as_bytes())
}

#[test]
fn batches_apply_atomically() {
    let backend = MemBackend::new();
    let mut batch = WriteBatch::new();
    batch.put("oid:a".to_string(), bytes("1"));
    batch.put("oid:b".to_string(), bytes("2"));
    batch.put("pkg:x".to_string(), bytes("3"));
    assert_eq!(batch.len(), 3);
    backend.apply(batch).unwrap();

    assert_eq!(backend.len().unwrap(), 3);
    assert_eq!(
        backend.keys_with_prefix("oid:").unwrap(),
        vec!["oid:a".to_string(), "oid:b".to_string()]
    );

    let mut batch = WriteBatch::new();
    batch.delete("oid:a".to_string());
    backend.apply(batch).unwrap();
    assert!(backend.get("oid:a").unwrap().is_none());
    assert_eq!(backend.get("oid:b").unwrap().as_deref(), Some(&b"2"[..]));
}

#[test]
fn snapshots_do_not_see_later_writes() {
    let backend = MemBackend::new();
    let before = backend.snapshot().unwrap();
    let mut batch = WriteBatch::new();
    batch.put("k".to_string(), bytes("v"));
    backend.apply(batch).unwrap();
    assert!(before.is_empty());
    assert!(!backend.is_empty().unwrap());
}

#[test]
fn empty_batches_are_harmless() {
    let backend = MemBackend::new();
    let batch = WriteBatch::new();
    assert!(batch.is_empty());
    backend.apply(batch).unwrap();
    assert!(backend.is_empty().unwrap());
}
