//! Per-transaction store over a shared backend.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, trace};

use realmvm_foundation::{
    Error, ErrorKind, FuncSource, Hashlet, Location, ObjectId, ObjectRef, ObjectResolver,
    RefValue, Result, Type, TypeId,
};

use crate::backend::{Backend, WriteBatch};
use crate::image::{ImageLoader, ObjectImage, TypeSink, fill_object, internalize_type, shell_object};
use crate::registry::FuncRegistry;
use crate::store::{RealmRecord, Store};

fn package_key(path: &str) -> String {
    format!("pkg:{path}")
}

fn realm_key(path: &str) -> String {
    format!("realm:{path}")
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(value).map_err(|e| Error::serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    rmp_serde::from_slice(bytes).map_err(|e| Error::serialization(e.to_string()))
}

/// A transaction's view of the store.
///
/// Holds the identity cache of loaded objects and the pending writes. Create
/// one per transaction; committing applies the writes to the backend, and
/// discarding (or dropping) the store abandons them.
pub struct CacheStore {
    backend: Arc<dyn Backend>,
    registry: FuncRegistry,
    objects: HashMap<ObjectId, ObjectRef>,
    types: HashMap<TypeId, Type>,
    loading_types: HashSet<TypeId>,
    pending: BTreeMap<String, Option<Arc<[u8]>>>,
}

impl CacheStore {
    /// Starts a transaction over a backend.
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, registry: FuncRegistry) -> Self {
        Self {
            backend,
            registry,
            objects: HashMap::new(),
            types: HashMap::new(),
            loading_types: HashSet::new(),
            pending: BTreeMap::new(),
        }
    }

    /// The shared backend.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// The shared function registry.
    #[must_use]
    pub fn registry(&self) -> &FuncRegistry {
        &self.registry
    }

    /// Number of objects in the identity cache.
    #[must_use]
    pub fn num_cached(&self) -> usize {
        self.objects.len()
    }

    /// Number of buffered writes.
    #[must_use]
    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    /// True if the object exists, in pending writes or in the backend.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub fn has_object(&self, id: ObjectId) -> Result<bool> {
        Ok(self.read(&id.key())?.is_some())
    }

    /// Raw image bytes of an object.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub fn object_bytes(&self, id: ObjectId) -> Result<Option<Arc<[u8]>>> {
        self.read(&id.key())
    }

    fn read(&self, key: &str) -> Result<Option<Arc<[u8]>>> {
        match self.pending.get(key) {
            Some(bytes) => Ok(bytes.clone()),
            None => self.backend.get(key),
        }
    }

    fn write(&mut self, key: String, bytes: Option<Vec<u8>>) {
        self.pending.insert(key, bytes.map(Arc::from));
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("cached", &self.objects.len())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl Store for CacheStore {
    fn get_object(&mut self, id: ObjectId) -> Result<ObjectRef> {
        if let Some(obj) = self.objects.get(&id) {
            return Ok(obj.clone());
        }
        let bytes = self
            .read(&id.key())?
            .ok_or_else(|| Error::object_not_found(id))?;
        let image = ObjectImage::from_bytes(&bytes)?;
        if image.info().id != id {
            return Err(Error::persistence(format!(
                "object stored under {id} claims id {}",
                image.info().id
            )));
        }
        let obj = shell_object(&image);
        obj.set_hash(Hashlet::of(&bytes));
        self.objects.insert(id, obj.clone());
        if let Err(e) = fill_object(&obj, image, self) {
            self.objects.remove(&id);
            return Err(e);
        }
        trace!(%id, kind = obj.kind_name(), "loaded object");
        Ok(obj)
    }

    fn set_object(&mut self, obj: &ObjectRef) -> Result<Hashlet> {
        let id = obj.id();
        if id.is_zero() {
            return Err(Error::persistence(format!(
                "cannot save unreal {} object",
                obj.kind_name()
            )));
        }
        let mut sink = TypeSink::default();
        let image = crate::image::encode_object(obj, &mut sink)?;
        for t in &sink.declared {
            self.set_type(t)?;
        }
        let bytes = image.to_bytes()?;
        let hash = Hashlet::of(&bytes);
        obj.set_hash(hash);
        self.write(id.key(), Some(bytes));
        self.objects.insert(id, obj.clone());
        trace!(%id, kind = obj.kind_name(), %hash, "saved object");
        Ok(hash)
    }

    fn del_object(&mut self, obj: &ObjectRef) -> Result<()> {
        let id = obj.id();
        if id.is_zero() {
            return Err(Error::persistence(format!(
                "cannot delete unreal {} object",
                obj.kind_name()
            )));
        }
        self.write(id.key(), None);
        self.objects.remove(&id);
        trace!(%id, kind = obj.kind_name(), "deleted object");
        Ok(())
    }

    fn get_type(&mut self, id: &TypeId) -> Result<Type> {
        if let Some(t) = self.types.get(id) {
            return Ok(t.clone());
        }
        let bytes = self
            .read(&id.key())?
            .ok_or_else(|| Error::new(ErrorKind::TypeNotFound(id.to_string())))?;
        let stored: Type = decode(&bytes)?;
        if !self.loading_types.insert(id.clone()) {
            return Err(Error::not_yet_implemented(format!(
                "recursive declared type {id}"
            )));
        }
        let t = internalize_type(&stored, self);
        self.loading_types.remove(id);
        let t = t?;
        self.types.insert(id.clone(), t.clone());
        Ok(t)
    }

    fn set_type(&mut self, t: &Type) -> Result<()> {
        let Type::Declared(d) = t else {
            return Ok(());
        };
        let id = t.type_id();
        if self.types.contains_key(&id) {
            return Ok(());
        }
        let mut sink = TypeSink::default();
        let stored = sink.externalize_declaration(d);
        self.write(id.key(), Some(encode(&stored)?));
        self.types.insert(id, t.clone());
        for nested in &sink.declared {
            self.set_type(nested)?;
        }
        Ok(())
    }

    fn register_func_source(&mut self, source: Arc<FuncSource>) -> Result<()> {
        self.registry.register(source)
    }

    fn get_func_source(&mut self, location: &Location) -> Result<Arc<FuncSource>> {
        self.registry
            .get(location)?
            .ok_or_else(|| Error::new(ErrorKind::SourceNotFound(location.to_string())))
    }

    fn get_package(&mut self, path: &str) -> Result<Option<ObjectRef>> {
        let Some(bytes) = self.read(&package_key(path))? else {
            return Ok(None);
        };
        let id: ObjectId = decode(&bytes)?;
        self.get_object(id).map(Some)
    }

    fn set_package(&mut self, pkg: &ObjectRef) -> Result<()> {
        let ObjectRef::Package(p) = pkg else {
            return Err(Error::internal(format!(
                "set_package on a {} object",
                pkg.kind_name()
            )));
        };
        let id = pkg.id();
        if id.is_zero() {
            return Err(Error::persistence("cannot record an unreal package"));
        }
        let path = p.borrow().path.clone();
        self.write(package_key(&path), Some(encode(&id)?));
        self.objects.insert(id, pkg.clone());
        Ok(())
    }

    fn get_realm_record(&mut self, path: &str) -> Result<Option<RealmRecord>> {
        match self.read(&realm_key(path))? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn set_realm_record(&mut self, record: &RealmRecord) -> Result<()> {
        self.write(realm_key(&record.path), Some(encode(record)?));
        Ok(())
    }

    fn commit(&mut self) -> Result<usize> {
        let mut batch = WriteBatch::new();
        for (key, bytes) in std::mem::take(&mut self.pending) {
            match bytes {
                Some(bytes) => batch.put(key, bytes),
                None => batch.delete(key),
            }
        }
        let writes = batch.len();
        self.backend.apply(batch)?;
        debug!(writes, cached = self.objects.len(), "committed store transaction");
        Ok(writes)
    }

    fn discard(&mut self) {
        debug!(
            pending = self.pending.len(),
            cached = self.objects.len(),
            "discarded store transaction"
        );
        self.pending.clear();
        self.objects.clear();
        self.types.clear();
    }
}

impl ImageLoader for CacheStore {
    fn load_object(&mut self, id: ObjectId) -> Result<ObjectRef> {
        self.get_object(id)
    }

    fn load_type(&mut self, id: &TypeId) -> Result<Type> {
        self.get_type(id)
    }

    fn load_source(&mut self, location: &Location) -> Result<Arc<FuncSource>> {
        self.get_func_source(location)
    }
}

impl ObjectResolver for CacheStore {
    fn resolve(&mut self, r: &RefValue) -> Result<ObjectRef> {
        self.get_object(r.object_id)
    }
}
