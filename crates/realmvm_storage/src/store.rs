//! The store interface the machine and realms persist through.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use realmvm_foundation::{
    FuncSource, Hashlet, Location, ObjectId, ObjectRef, ObjectResolver, RefValue, Result, Type,
    TypeId,
};

/// Persisted realm state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealmRecord {
    /// Realm (package) path.
    pub path: Arc<str>,
    /// Creation counter.
    pub time: u64,
}

/// Transactional object, type and package storage.
///
/// Within a transaction every id maps to a single live object, so repeated
/// loads return the same handle. Writes are buffered until [`Store::commit`];
/// [`Store::discard`] drops them together with every object loaded or
/// created in the transaction.
pub trait Store {
    /// Loads an object by id.
    ///
    /// # Errors
    ///
    /// Returns `ObjectNotFound` if no such object exists.
    fn get_object(&mut self, id: ObjectId) -> Result<ObjectRef>;

    /// Writes an object's image, recording and returning its hash.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the object or any referenced child is
    /// not real.
    fn set_object(&mut self, obj: &ObjectRef) -> Result<Hashlet>;

    /// Removes an object.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the object is not real.
    fn del_object(&mut self, obj: &ObjectRef) -> Result<()>;

    /// Loads a declared type.
    ///
    /// # Errors
    ///
    /// Returns `TypeNotFound` if it was never stored.
    fn get_type(&mut self, id: &TypeId) -> Result<Type>;

    /// Stores a declared type (and the declared types it mentions).
    /// Other types need no storage and are ignored.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if encoding fails.
    fn set_type(&mut self, t: &Type) -> Result<()>;

    /// Registers a function declaration so persisted functions can find it.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the registry is unavailable.
    fn register_func_source(&mut self, source: Arc<FuncSource>) -> Result<()>;

    /// Looks up a function declaration by location.
    ///
    /// # Errors
    ///
    /// Returns `SourceNotFound` if nothing is registered there.
    fn get_func_source(&mut self, location: &Location) -> Result<Arc<FuncSource>>;

    /// Loads a package by path.
    ///
    /// # Errors
    ///
    /// Propagates load failures.
    fn get_package(&mut self, path: &str) -> Result<Option<ObjectRef>>;

    /// Records the path of a real package object.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the package is not real.
    fn set_package(&mut self, pkg: &ObjectRef) -> Result<()>;

    /// Loads a realm's persisted state.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the record is corrupt.
    fn get_realm_record(&mut self, path: &str) -> Result<Option<RealmRecord>>;

    /// Writes a realm's state.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if encoding fails.
    fn set_realm_record(&mut self, record: &RealmRecord) -> Result<()>;

    /// Applies all buffered writes, returning how many there were.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the batch.
    fn commit(&mut self) -> Result<usize>;

    /// Drops buffered writes and every object of this transaction.
    fn discard(&mut self);
}

impl ObjectResolver for dyn Store + '_ {
    fn resolve(&mut self, r: &RefValue) -> Result<ObjectRef> {
        self.get_object(r.object_id)
    }
}
