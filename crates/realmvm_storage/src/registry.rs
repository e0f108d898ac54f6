//! Registry of guest function sources.
//!
//! Persisted functions record only the location of their source; the
//! registry maps locations back to the resolved declarations. It is shared
//! between transactions, like the backend.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use realmvm_foundation::{Error, FuncSource, Location, Result};

/// Shared map from source location to function declaration.
#[derive(Clone, Debug, Default)]
pub struct FuncRegistry {
    sources: Arc<RwLock<HashMap<Location, Arc<FuncSource>>>>,
}

impl FuncRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a declaration under its location, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the lock is poisoned.
    pub fn register(&self, source: Arc<FuncSource>) -> Result<()> {
        let mut sources = self
            .sources
            .write()
            .map_err(|_| Error::internal("function registry lock poisoned"))?;
        sources.insert(source.location().clone(), source);
        Ok(())
    }

    /// Looks up a declaration.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the lock is poisoned.
    pub fn get(&self, location: &Location) -> Result<Option<Arc<FuncSource>>> {
        let sources = self
            .sources
            .read()
            .map_err(|_| Error::internal("function registry lock poisoned"))?;
        Ok(sources.get(location).cloned())
    }

    /// Number of registered declarations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.read().map(|s| s.len()).unwrap_or(0)
    }

    /// True if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
