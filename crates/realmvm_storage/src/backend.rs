//! Durable key/value backends.
//!
//! The backend only sees opaque bytes under string keys. Writes arrive in
//! batches at commit time and are applied atomically.

use std::sync::{Arc, RwLock};

use realmvm_foundation::{Error, Result};

/// A set of writes applied atomically. `None` deletes the key.
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<(String, Option<Arc<[u8]>>)>,
}

impl WriteBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a put.
    pub fn put(&mut self, key: String, bytes: Arc<[u8]>) {
        self.ops.push((key, Some(bytes)));
    }

    /// Adds a delete.
    pub fn delete(&mut self, key: String) {
        self.ops.push((key, None));
    }

    /// Number of writes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// True if the batch has no writes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl IntoIterator for WriteBatch {
    type Item = (String, Option<Arc<[u8]>>);
    type IntoIter = std::vec::IntoIter<Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.into_iter()
    }
}

/// Durable byte storage shared between transactions.
pub trait Backend: Send + Sync {
    /// Reads a key.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unavailable.
    fn get(&self, key: &str) -> Result<Option<Arc<[u8]>>>;

    /// Applies a batch atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch could not be applied; nothing is written.
    fn apply(&self, batch: WriteBatch) -> Result<()>;
}

/// In-memory backend built on a persistent map.
///
/// Readers see a consistent snapshot; a batch builds the next version from
/// an O(1) clone and swaps it in.
#[derive(Debug, Default)]
pub struct MemBackend {
    data: RwLock<im::HashMap<String, Arc<[u8]>>>,
}

impl MemBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current contents.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the lock is poisoned.
    pub fn snapshot(&self) -> Result<im::HashMap<String, Arc<[u8]>>> {
        self.data
            .read()
            .map(|d| d.clone())
            .map_err(|_| Error::internal("store backend lock poisoned"))
    }

    /// Number of stored keys.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.snapshot()?.len())
    }

    /// True if nothing is stored.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.snapshot()?.is_empty())
    }

    /// Sorted keys starting with `prefix`.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the lock is poisoned.
    pub fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .snapshot()?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

impl Backend for MemBackend {
    fn get(&self, key: &str) -> Result<Option<Arc<[u8]>>> {
        Ok(self.snapshot()?.get(key).cloned())
    }

    fn apply(&self, batch: WriteBatch) -> Result<()> {
        let mut guard = self
            .data
            .write()
            .map_err(|_| Error::internal("store backend lock poisoned"))?;
        let mut next = guard.clone();
        for (key, bytes) in batch {
            match bytes {
                Some(bytes) => {
                    next.insert(key, bytes);
                }
                None => {
                    next.remove(&key);
                }
            }
        }
        *guard = next;
        Ok(())
    }
}
