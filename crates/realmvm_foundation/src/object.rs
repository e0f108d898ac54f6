//! Heap objects and ownership bookkeeping.
//!
//! Every heap value that can sit in the ownership tree carries an
//! [`ObjectInfo`]. [`ObjectRef`] is the closed union of object kinds; it is a
//! cheap handle (`Rc`) so the machine, the realm buffers and the store cache
//! can all refer to the same object. Ownership state (refcount, owner, flags)
//! is guest-level bookkeeping and is independent of the `Rc` count.

#![allow(clippy::module_name_repetitions)]

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use indexmap::IndexMap;

use crate::block::Block;
use crate::error::{Error, Result};
use crate::hash::{Hashlet, ObjectId};
use crate::nodes::{Builtin, FuncSource, Location};
use crate::types::FuncType;
use crate::value::{MapKey, TypedValue, Value};

// =============================================================================
// ObjectInfo
// =============================================================================

/// Identity, ownership and lifecycle flags of an object.
#[derive(Clone, Default)]
pub struct ObjectInfo {
    /// Durable id; zero until the object becomes real.
    pub id: ObjectId,
    /// Content hash, valid only while the object is not dirty.
    pub hash: Option<Hashlet>,
    /// Id of the owning object; zero if none or escaped.
    pub owner_id: ObjectId,
    /// Live back-reference to the owner, when it is loaded.
    pub owner: Option<WeakObjectRef>,
    /// Realm time of the last modification.
    pub mod_time: u64,
    /// References from other objects or roots.
    pub ref_count: i64,
    /// Finalized as escaped (multiply referenced, ownerless).
    pub is_escaped: bool,
    /// Modified during this transaction.
    pub is_dirty: bool,
    /// Finalized as deleted.
    pub is_deleted: bool,
    /// Became real during this transaction.
    pub is_new_real: bool,
    /// Marked escaped during this transaction.
    pub is_new_escaped: bool,
    /// Marked deleted during this transaction.
    pub is_new_deleted: bool,
}

impl ObjectInfo {
    /// Fresh info for a copy: no identity, no owner, no marks.
    #[must_use]
    pub fn fresh() -> Self {
        Self::default()
    }

    /// True once the object has a durable id.
    #[must_use]
    pub fn is_real(&self) -> bool {
        !self.id.is_zero()
    }
}

impl fmt::Debug for ObjectInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectInfo")
            .field("id", &self.id)
            .field("owner_id", &self.owner_id)
            .field("ref_count", &self.ref_count)
            .field("mod_time", &self.mod_time)
            .field("is_escaped", &self.is_escaped)
            .field("is_dirty", &self.is_dirty)
            .field("is_deleted", &self.is_deleted)
            .field("is_new_real", &self.is_new_real)
            .field("is_new_escaped", &self.is_new_escaped)
            .field("is_new_deleted", &self.is_new_deleted)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Object kinds
// =============================================================================

/// Fixed-length array (also the backing store of slices).
#[derive(Debug, Default)]
pub struct ArrayValue {
    /// Ownership info.
    pub info: ObjectInfo,
    /// Elements.
    pub list: Vec<TypedValue>,
}

/// Struct value.
#[derive(Debug, Default)]
pub struct StructValue {
    /// Ownership info.
    pub info: ObjectInfo,
    /// Fields in declaration order.
    pub fields: Vec<TypedValue>,
}

/// Map value with insertion-ordered, deterministic iteration.
#[derive(Debug, Default)]
pub struct MapValue {
    /// Ownership info.
    pub info: ObjectInfo,
    /// Entries keyed by their encoded key.
    pub entries: IndexMap<MapKey, (TypedValue, TypedValue)>,
}

impl MapValue {
    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the map has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up a value.
    #[must_use]
    pub fn get(&self, key: &MapKey) -> Option<&TypedValue> {
        self.entries.get(key).map(|(_, v)| v)
    }

    /// Inserts or replaces an entry, returning the previous value.
    pub fn set(&mut self, key: MapKey, k: TypedValue, v: TypedValue) -> Option<TypedValue> {
        match self.entries.get_mut(&key) {
            Some(entry) => Some(std::mem::replace(&mut entry.1, v)),
            None => {
                self.entries.insert(key, (k, v));
                None
            }
        }
    }

    /// Removes an entry, preserving the order of the rest.
    pub fn delete(&mut self, key: &MapKey) -> Option<(TypedValue, TypedValue)> {
        self.entries.shift_remove(key)
    }

    /// Checks that a host-produced replacement keeps every existing key.
    ///
    /// Adding and updating keys is supported; removing keys is not.
    ///
    /// # Errors
    ///
    /// Returns `NotYetImplemented` if any existing key is missing from `incoming`.
    pub fn check_sync(&self, incoming: &[MapKey]) -> Result<()> {
        if self.entries.keys().any(|k| !incoming.contains(k)) {
            return Err(Error::not_yet_implemented(
                "map key deletion during native value synchronization",
            ));
        }
        Ok(())
    }
}

/// How a function body is provided when it is not guest code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NativeRef {
    /// A universe builtin.
    Builtin(Builtin),
    /// A function of the host interop layer.
    Host {
        /// Package path.
        pkg_path: Arc<str>,
        /// Function name.
        name: Arc<str>,
    },
}

/// A function or closure.
#[derive(Debug)]
pub struct FuncValue {
    /// Ownership info.
    pub info: ObjectInfo,
    /// Signature.
    pub ty: Arc<FuncType>,
    /// Function name.
    pub name: Arc<str>,
    /// Declaring package.
    pub pkg_path: Arc<str>,
    /// Guest source, absent for builtins.
    pub source: Option<Arc<FuncSource>>,
    /// Native body, if not guest code.
    pub native: Option<NativeRef>,
    /// Lexical parent block (a block object or an unloaded reference).
    pub parent: Value,
    /// Captured heap items, copied into the trailing slots on call.
    pub captures: Vec<TypedValue>,
}

impl FuncValue {
    /// Creates a function value for a guest or host-native source.
    #[must_use]
    pub fn from_source(source: Arc<FuncSource>, parent: Value) -> Self {
        let native = if source.body.is_none() {
            Some(NativeRef::Host {
                pkg_path: source.pkg_path.clone(),
                name: source.name.clone(),
            })
        } else {
            None
        };
        Self {
            info: ObjectInfo::default(),
            ty: source.ty.clone(),
            name: source.name.clone(),
            pkg_path: source.pkg_path.clone(),
            source: Some(source),
            native,
            parent,
            captures: Vec::new(),
        }
    }

    /// Creates a builtin function value.
    #[must_use]
    pub fn builtin(builtin: Builtin, ty: FuncType) -> Self {
        Self {
            info: ObjectInfo::default(),
            ty: Arc::new(ty),
            name: Arc::from(builtin.name()),
            pkg_path: Arc::from(""),
            source: None,
            native: Some(NativeRef::Builtin(builtin)),
            parent: Value::Nil,
            captures: Vec::new(),
        }
    }

    /// Location of the guest source, if any.
    #[must_use]
    pub fn location(&self) -> Option<&Location> {
        self.source.as_ref().map(|s| s.location())
    }
}

/// A method value bound to its receiver.
#[derive(Debug)]
pub struct BoundMethodValue {
    /// Ownership info.
    pub info: ObjectInfo,
    /// The method function (an object or an unloaded reference).
    pub func: Value,
    /// Bound receiver.
    pub receiver: TypedValue,
}

/// Stable-address wrapper for a variable captured by a closure.
#[derive(Debug, Default)]
pub struct HeapItemValue {
    /// Ownership info.
    pub info: ObjectInfo,
    /// Wrapped value.
    pub value: TypedValue,
}

/// A package: its name, path and top-level block.
#[derive(Debug)]
pub struct PackageValue {
    /// Ownership info.
    pub info: ObjectInfo,
    /// Package name.
    pub name: Arc<str>,
    /// Package path.
    pub path: Arc<str>,
    /// Top-level names, indexing the package block.
    pub names: Vec<Arc<str>>,
    /// Package block (an object or an unloaded reference).
    pub block: Value,
}

impl PackageValue {
    /// Slot index of a top-level name.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n.as_ref() == name)
    }
}

// =============================================================================
// ObjectRef
// =============================================================================

/// Shared handle to any object.
#[derive(Clone)]
pub enum ObjectRef {
    /// Array.
    Array(Rc<RefCell<ArrayValue>>),
    /// Struct.
    Struct(Rc<RefCell<StructValue>>),
    /// Map.
    Map(Rc<RefCell<MapValue>>),
    /// Function or closure.
    Func(Rc<RefCell<FuncValue>>),
    /// Bound method.
    BoundMethod(Rc<RefCell<BoundMethodValue>>),
    /// Lexical block.
    Block(Rc<RefCell<Block>>),
    /// Heap item.
    HeapItem(Rc<RefCell<HeapItemValue>>),
    /// Package.
    Package(Rc<RefCell<PackageValue>>),
}

macro_rules! with_object {
    ($obj:expr, $o:ident => $body:expr) => {
        match $obj {
            ObjectRef::Array($o) => $body,
            ObjectRef::Struct($o) => $body,
            ObjectRef::Map($o) => $body,
            ObjectRef::Func($o) => $body,
            ObjectRef::BoundMethod($o) => $body,
            ObjectRef::Block($o) => $body,
            ObjectRef::HeapItem($o) => $body,
            ObjectRef::Package($o) => $body,
        }
    };
}

impl ObjectRef {
    /// Wraps an array.
    #[must_use]
    pub fn array(list: Vec<TypedValue>) -> Self {
        Self::Array(Rc::new(RefCell::new(ArrayValue {
            info: ObjectInfo::default(),
            list,
        })))
    }

    /// Wraps a struct.
    #[must_use]
    pub fn structure(fields: Vec<TypedValue>) -> Self {
        Self::Struct(Rc::new(RefCell::new(StructValue {
            info: ObjectInfo::default(),
            fields,
        })))
    }

    /// Creates an empty map.
    #[must_use]
    pub fn map() -> Self {
        Self::Map(Rc::new(RefCell::new(MapValue::default())))
    }

    /// Wraps a function value.
    #[must_use]
    pub fn func(fv: FuncValue) -> Self {
        Self::Func(Rc::new(RefCell::new(fv)))
    }

    /// Wraps a heap item around a value.
    #[must_use]
    pub fn heap_item(value: TypedValue) -> Self {
        Self::HeapItem(Rc::new(RefCell::new(HeapItemValue {
            info: ObjectInfo::default(),
            value,
        })))
    }

    /// Wraps a block.
    #[must_use]
    pub fn block(block: Block) -> Self {
        Self::Block(Rc::new(RefCell::new(block)))
    }

    /// Short kind name for diagnostics.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Array(_) => "array",
            Self::Struct(_) => "struct",
            Self::Map(_) => "map",
            Self::Func(_) => "func",
            Self::BoundMethod(_) => "boundmethod",
            Self::Block(_) => "block",
            Self::HeapItem(_) => "heapitem",
            Self::Package(_) => "package",
        }
    }

    /// Address of the shared allocation, usable as an identity key.
    #[must_use]
    pub fn addr(&self) -> usize {
        with_object!(self, o => Rc::as_ptr(o).cast::<u8>() as usize)
    }

    /// True if both handles point at the same object.
    #[must_use]
    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        self.addr() == other.addr()
    }

    /// Weak handle.
    #[must_use]
    pub fn downgrade(&self) -> WeakObjectRef {
        match self {
            Self::Array(o) => WeakObjectRef::Array(Rc::downgrade(o)),
            Self::Struct(o) => WeakObjectRef::Struct(Rc::downgrade(o)),
            Self::Map(o) => WeakObjectRef::Map(Rc::downgrade(o)),
            Self::Func(o) => WeakObjectRef::Func(Rc::downgrade(o)),
            Self::BoundMethod(o) => WeakObjectRef::BoundMethod(Rc::downgrade(o)),
            Self::Block(o) => WeakObjectRef::Block(Rc::downgrade(o)),
            Self::HeapItem(o) => WeakObjectRef::HeapItem(Rc::downgrade(o)),
            Self::Package(o) => WeakObjectRef::Package(Rc::downgrade(o)),
        }
    }

    /// Reads the ownership info.
    pub fn info<R>(&self, f: impl FnOnce(&ObjectInfo) -> R) -> R {
        with_object!(self, o => f(&o.borrow().info))
    }

    /// Mutates the ownership info.
    pub fn info_mut<R>(&self, f: impl FnOnce(&mut ObjectInfo) -> R) -> R {
        with_object!(self, o => f(&mut o.borrow_mut().info))
    }

    /// Durable id (zero if not real).
    #[must_use]
    pub fn id(&self) -> ObjectId {
        self.info(|i| i.id)
    }

    /// Sets the durable id.
    pub fn set_id(&self, id: ObjectId) {
        self.info_mut(|i| i.id = id);
    }

    /// True once the object has a durable id.
    #[must_use]
    pub fn is_real(&self) -> bool {
        self.info(ObjectInfo::is_real)
    }

    /// Current reference count.
    #[must_use]
    pub fn ref_count(&self) -> i64 {
        self.info(|i| i.ref_count)
    }

    /// Increments the reference count, returning the new count.
    pub fn inc_ref_count(&self) -> i64 {
        self.info_mut(|i| {
            i.ref_count += 1;
            i.ref_count
        })
    }

    /// Decrements the reference count, returning the new count.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the count would go negative.
    pub fn dec_ref_count(&self) -> Result<i64> {
        let id = self.id();
        self.info_mut(|i| {
            if i.ref_count <= 0 {
                return Err(Error::persistence(format!(
                    "reference count underflow on {} {id}",
                    self.kind_name()
                )));
            }
            i.ref_count -= 1;
            Ok(i.ref_count)
        })
    }

    /// Id of the owner.
    #[must_use]
    pub fn owner_id(&self) -> ObjectId {
        self.info(|i| i.owner_id)
    }

    /// Live owner, if it is still loaded.
    #[must_use]
    pub fn owner(&self) -> Option<ObjectRef> {
        self.info(|i| i.owner.as_ref().and_then(WeakObjectRef::upgrade))
    }

    /// Sets (or clears) the owner.
    pub fn set_owner(&self, owner: Option<&ObjectRef>) {
        let (owner_id, weak) = match owner {
            Some(o) => (o.id(), Some(o.downgrade())),
            None => (ObjectId::default(), None),
        };
        self.info_mut(|i| {
            i.owner_id = owner_id;
            i.owner = weak;
        });
    }

    /// Content hash, if computed and still valid.
    #[must_use]
    pub fn hash(&self) -> Option<Hashlet> {
        self.info(|i| i.hash)
    }

    /// Records the content hash.
    pub fn set_hash(&self, hash: Hashlet) {
        self.info_mut(|i| i.hash = Some(hash));
    }

    /// Dirty flag.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.info(|i| i.is_dirty)
    }

    /// Sets the dirty flag; marking dirty invalidates the hash.
    pub fn set_is_dirty(&self, dirty: bool, mod_time: u64) {
        self.info_mut(|i| {
            i.is_dirty = dirty;
            if dirty {
                i.hash = None;
                i.mod_time = mod_time;
            }
        });
    }

    /// Deleted flag.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.info(|i| i.is_deleted)
    }

    /// Sets the deleted flag.
    pub fn set_is_deleted(&self, deleted: bool, mod_time: u64) {
        self.info_mut(|i| {
            i.is_deleted = deleted;
            if deleted {
                i.mod_time = mod_time;
            }
        });
    }

    /// New-real flag.
    #[must_use]
    pub fn is_new_real(&self) -> bool {
        self.info(|i| i.is_new_real)
    }

    /// Sets the new-real flag.
    pub fn set_is_new_real(&self, v: bool) {
        self.info_mut(|i| i.is_new_real = v);
    }

    /// Escaped flag.
    #[must_use]
    pub fn is_escaped(&self) -> bool {
        self.info(|i| i.is_escaped)
    }

    /// Sets the escaped flag.
    pub fn set_is_escaped(&self, v: bool) {
        self.info_mut(|i| i.is_escaped = v);
    }

    /// New-escaped flag.
    #[must_use]
    pub fn is_new_escaped(&self) -> bool {
        self.info(|i| i.is_new_escaped)
    }

    /// Sets the new-escaped flag.
    pub fn set_is_new_escaped(&self, v: bool) {
        self.info_mut(|i| i.is_new_escaped = v);
    }

    /// New-deleted flag.
    #[must_use]
    pub fn is_new_deleted(&self) -> bool {
        self.info(|i| i.is_new_deleted)
    }

    /// Sets the new-deleted flag.
    pub fn set_is_new_deleted(&self, v: bool) {
        self.info_mut(|i| i.is_new_deleted = v);
    }

    /// Values that may reference child objects in the ownership tree.
    ///
    /// Packages contribute their block; blocks contribute their slots and
    /// parent; functions contribute their parent block and captures.
    #[must_use]
    pub fn child_values(&self) -> Vec<Value> {
        match self {
            Self::Array(a) => a.borrow().list.iter().map(|tv| tv.v.clone()).collect(),
            Self::Struct(s) => s.borrow().fields.iter().map(|tv| tv.v.clone()).collect(),
            Self::Map(m) => m
                .borrow()
                .entries
                .values()
                .flat_map(|(k, v)| [k.v.clone(), v.v.clone()])
                .collect(),
            Self::Func(f) => {
                let f = f.borrow();
                std::iter::once(f.parent.clone())
                    .chain(f.captures.iter().map(|tv| tv.v.clone()))
                    .collect()
            }
            Self::BoundMethod(b) => {
                let b = b.borrow();
                vec![b.func.clone(), b.receiver.v.clone()]
            }
            Self::Block(b) => {
                let b = b.borrow();
                b.values
                    .iter()
                    .map(|tv| tv.v.clone())
                    .chain(std::iter::once(b.parent.clone()))
                    .collect()
            }
            Self::HeapItem(h) => vec![h.borrow().value.v.clone()],
            Self::Package(p) => vec![p.borrow().block.clone()],
        }
    }

    /// Reads slot `index` of an array, struct, block or heap item.
    ///
    /// # Errors
    ///
    /// Returns an internal error for other kinds or an out-of-range slot.
    pub fn get_slot(&self, index: usize) -> Result<TypedValue> {
        let found = match self {
            Self::Array(a) => a.borrow().list.get(index).cloned(),
            Self::Struct(s) => s.borrow().fields.get(index).cloned(),
            Self::Block(b) => b.borrow().values.get(index).cloned(),
            Self::HeapItem(h) if index == 0 => Some(h.borrow().value.clone()),
            _ => None,
        };
        found.ok_or_else(|| {
            Error::internal(format!("no slot {index} in {}", self.kind_name()))
        })
    }

    /// Overwrites slot `index`, returning the previous value.
    ///
    /// # Errors
    ///
    /// Returns an internal error for other kinds or an out-of-range slot.
    pub fn set_slot(&self, index: usize, tv: TypedValue) -> Result<TypedValue> {
        let slot_missing = || Error::internal(format!("no slot {index} in {}", self.kind_name()));
        match self {
            Self::Array(a) => {
                let mut a = a.borrow_mut();
                let slot = a.list.get_mut(index).ok_or_else(slot_missing)?;
                Ok(std::mem::replace(slot, tv))
            }
            Self::Struct(s) => {
                let mut s = s.borrow_mut();
                let slot = s.fields.get_mut(index).ok_or_else(slot_missing)?;
                Ok(std::mem::replace(slot, tv))
            }
            Self::Block(b) => {
                let mut b = b.borrow_mut();
                let slot = b.values.get_mut(index).ok_or_else(slot_missing)?;
                Ok(std::mem::replace(slot, tv))
            }
            Self::HeapItem(h) if index == 0 => Ok(std::mem::replace(&mut h.borrow_mut().value, tv)),
            _ => Err(slot_missing()),
        }
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (id, rc) = self.info(|i| (i.id, i.ref_count));
        write!(f, "{}@{:#x}(id={id}, rc={rc})", self.kind_name(), self.addr())
    }
}

/// Weak counterpart of [`ObjectRef`], used for owner back-references.
#[derive(Clone)]
pub enum WeakObjectRef {
    /// Array.
    Array(Weak<RefCell<ArrayValue>>),
    /// Struct.
    Struct(Weak<RefCell<StructValue>>),
    /// Map.
    Map(Weak<RefCell<MapValue>>),
    /// Function.
    Func(Weak<RefCell<FuncValue>>),
    /// Bound method.
    BoundMethod(Weak<RefCell<BoundMethodValue>>),
    /// Block.
    Block(Weak<RefCell<Block>>),
    /// Heap item.
    HeapItem(Weak<RefCell<HeapItemValue>>),
    /// Package.
    Package(Weak<RefCell<PackageValue>>),
}

impl WeakObjectRef {
    /// Upgrades to a strong handle if the object is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<ObjectRef> {
        match self {
            Self::Array(w) => w.upgrade().map(ObjectRef::Array),
            Self::Struct(w) => w.upgrade().map(ObjectRef::Struct),
            Self::Map(w) => w.upgrade().map(ObjectRef::Map),
            Self::Func(w) => w.upgrade().map(ObjectRef::Func),
            Self::BoundMethod(w) => w.upgrade().map(ObjectRef::BoundMethod),
            Self::Block(w) => w.upgrade().map(ObjectRef::Block),
            Self::HeapItem(w) => w.upgrade().map(ObjectRef::HeapItem),
            Self::Package(w) => w.upgrade().map(ObjectRef::Package),
        }
    }
}

impl fmt::Debug for WeakObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(o) => write!(f, "Weak({o:?})"),
            None => f.write_str("Weak(dropped)"),
        }
    }
}
