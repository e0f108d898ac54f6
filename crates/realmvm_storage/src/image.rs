//! Persisted object images.
//!
//! An image is the serializable form of one object. Child objects are never
//! inlined: every reference to another object becomes a [`RefImage`] carrying
//! the child's id, plus its hash when the child is owned, or an escaped
//! marker when it is not. Declared types are replaced by [`Type::Ref`] and
//! stored separately. Images are encoded as named `MessagePack`; the hash of
//! an object is the hashlet of its encoded image.
//!
//! Decoding happens in two steps so that reference cycles through pointers
//! terminate: [`shell_object`] builds an empty object carrying the persisted
//! info, the caller caches it under its id, and [`fill_object`] decodes the
//! contents. Object slots decode lazily into [`Value::Ref`]; pointer and
//! slice bases are loaded eagerly through the [`ImageLoader`].

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use realmvm_foundation::{
    ArrayValue, Block, BoundMethodValue, Builtin, DeclaredType, Error, FieldType, FuncSource,
    FuncType, FuncValue, Hashlet, HeapItemValue, Location, MapValue, NativeRef, ObjectId,
    ObjectInfo, ObjectRef, PackageValue, PointerValue, RefValue, Result, SliceValue, StructType,
    StructValue, Type, TypeId, TypedValue, Value,
};

// =============================================================================
// Image types
// =============================================================================

/// Persisted ownership info.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoImage {
    /// Object id.
    pub id: ObjectId,
    /// Owner id (zero when escaped).
    pub owner_id: ObjectId,
    /// Realm time of the last modification.
    pub mod_time: u64,
    /// Reference count.
    pub ref_count: i64,
    /// Escaped flag.
    pub is_escaped: bool,
}

impl InfoImage {
    fn from_info(info: &ObjectInfo) -> Self {
        Self {
            id: info.id,
            owner_id: info.owner_id,
            mod_time: info.mod_time,
            ref_count: info.ref_count,
            is_escaped: info.is_escaped,
        }
    }

    fn to_info(&self) -> ObjectInfo {
        ObjectInfo {
            id: self.id,
            owner_id: self.owner_id,
            mod_time: self.mod_time,
            ref_count: self.ref_count,
            is_escaped: self.is_escaped,
            ..ObjectInfo::default()
        }
    }
}

/// Reference to another persisted object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefImage {
    /// Child id.
    pub id: ObjectId,
    /// Child hash, present for owned children.
    pub hash: Option<Hashlet>,
    /// True if the child is escaped.
    pub escaped: bool,
}

/// Persisted value payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ValueImage {
    /// Nil.
    Nil,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Unsigned integer.
    Uint(u64),
    /// Float.
    Float(f64),
    /// String.
    String(Arc<str>),
    /// Pointer into a persisted object.
    Pointer {
        /// Base object.
        base: RefImage,
        /// Slot index.
        index: usize,
    },
    /// Slice of a persisted array.
    Slice {
        /// Backing array.
        base: RefImage,
        /// Offset.
        offset: usize,
        /// Length.
        len: usize,
        /// Capacity.
        cap: usize,
    },
    /// Child object.
    Object(RefImage),
    /// Type value.
    Type(Type),
}

/// Persisted typed value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TypedValueImage {
    /// Static type (declared types as references).
    pub t: Option<Type>,
    /// Payload.
    pub v: ValueImage,
}

/// Persisted native body reference.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NativeImage {
    /// Universe builtin.
    Builtin(Builtin),
    /// Host interop function.
    Host {
        /// Package path.
        pkg_path: Arc<str>,
        /// Function name.
        name: Arc<str>,
    },
}

/// Persisted function value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FuncImage {
    /// Function name.
    pub name: Arc<str>,
    /// Declaring package.
    pub pkg_path: Arc<str>,
    /// Signature (as a function type).
    pub ty: Type,
    /// Location of the guest source, used to look it up again.
    pub source: Option<Location>,
    /// Native body reference.
    pub native: Option<NativeImage>,
    /// Parent block.
    pub parent: ValueImage,
    /// Captured heap items.
    pub captures: Vec<TypedValueImage>,
}

/// Persisted object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ObjectImage {
    /// Array.
    Array {
        /// Info.
        info: InfoImage,
        /// Elements.
        list: Vec<TypedValueImage>,
    },
    /// Struct.
    Struct {
        /// Info.
        info: InfoImage,
        /// Fields.
        fields: Vec<TypedValueImage>,
    },
    /// Map, entries in iteration order.
    Map {
        /// Info.
        info: InfoImage,
        /// Key/value pairs.
        entries: Vec<(TypedValueImage, TypedValueImage)>,
    },
    /// Function.
    Func {
        /// Info.
        info: InfoImage,
        /// Function contents.
        func: FuncImage,
    },
    /// Bound method.
    BoundMethod {
        /// Info.
        info: InfoImage,
        /// Method function.
        func: ValueImage,
        /// Receiver.
        receiver: TypedValueImage,
    },
    /// Block.
    Block {
        /// Info.
        info: InfoImage,
        /// Scope location.
        location: Location,
        /// Slots.
        values: Vec<TypedValueImage>,
        /// Parent block.
        parent: ValueImage,
    },
    /// Heap item.
    HeapItem {
        /// Info.
        info: InfoImage,
        /// Wrapped value.
        value: TypedValueImage,
    },
    /// Package.
    Package {
        /// Info.
        info: InfoImage,
        /// Package name.
        name: Arc<str>,
        /// Package path.
        path: Arc<str>,
        /// Top-level names.
        names: Vec<Arc<str>>,
        /// Package block.
        block: ValueImage,
    },
}

impl ObjectImage {
    /// Persisted info.
    #[must_use]
    pub fn info(&self) -> &InfoImage {
        match self {
            Self::Array { info, .. }
            | Self::Struct { info, .. }
            | Self::Map { info, .. }
            | Self::Func { info, .. }
            | Self::BoundMethod { info, .. }
            | Self::Block { info, .. }
            | Self::HeapItem { info, .. }
            | Self::Package { info, .. } => info,
        }
    }

    /// Encodes as named `MessagePack`.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(self).map_err(|e| Error::serialization(e.to_string()))
    }

    /// Decodes from `MessagePack`.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if decoding fails.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| Error::serialization(e.to_string()))
    }
}

// =============================================================================
// Encoding
// =============================================================================

/// Declared types encountered while encoding, to be stored separately.
#[derive(Debug, Default)]
pub struct TypeSink {
    /// Declared types, as found.
    pub declared: Vec<Type>,
}

impl TypeSink {
    /// Replaces declared types by references, recording each declaration.
    pub fn externalize(&mut self, t: &Type) -> Type {
        match t {
            Type::Pointer(e) => Type::pointer(self.externalize(e)),
            Type::Slice(e) => Type::slice(self.externalize(e)),
            Type::Array(a) => Type::array(a.len, self.externalize(&a.elem)),
            Type::Map(m) => Type::map(self.externalize(&m.key), self.externalize(&m.value)),
            Type::Struct(s) => Type::Struct(Arc::new(StructType {
                pkg_path: s.pkg_path.clone(),
                fields: self.externalize_fields(&s.fields),
            })),
            Type::Func(ft) => Type::func(self.externalize_func(ft)),
            Type::Declared(_) => {
                self.declared.push(t.clone());
                Type::Ref(t.type_id())
            }
            other => other.clone(),
        }
    }

    /// Stored form of a declaration: the declared type with its base
    /// externalized.
    pub fn externalize_declaration(&mut self, d: &DeclaredType) -> Type {
        Type::Declared(Arc::new(DeclaredType {
            pkg_path: d.pkg_path.clone(),
            name: d.name.clone(),
            base: self.externalize(&d.base),
        }))
    }

    fn externalize_fields(&mut self, fields: &[FieldType]) -> Vec<FieldType> {
        fields
            .iter()
            .map(|f| FieldType {
                name: f.name.clone(),
                ty: self.externalize(&f.ty),
            })
            .collect()
    }

    fn externalize_func(&mut self, ft: &FuncType) -> FuncType {
        FuncType {
            params: self.externalize_fields(&ft.params),
            results: self.externalize_fields(&ft.results),
            variadic: ft.variadic,
        }
    }
}

fn ref_image(obj: &ObjectRef) -> Result<RefImage> {
    if !obj.is_real() {
        return Err(Error::persistence(format!(
            "cannot save reference to unreal {} object",
            obj.kind_name()
        )));
    }
    let escaped = obj.is_escaped() || obj.is_new_escaped();
    Ok(RefImage {
        id: obj.id(),
        hash: if escaped { None } else { obj.hash() },
        escaped,
    })
}

fn encode_value(v: &Value, sink: &mut TypeSink) -> Result<ValueImage> {
    Ok(match v {
        Value::Nil => ValueImage::Nil,
        Value::Bool(b) => ValueImage::Bool(*b),
        Value::Int(i) => ValueImage::Int(*i),
        Value::Uint(u) => ValueImage::Uint(*u),
        Value::Float(f) => ValueImage::Float(*f),
        Value::String(s) => ValueImage::String(s.clone()),
        Value::Pointer(p) => ValueImage::Pointer {
            base: ref_image(&p.base)?,
            index: p.index,
        },
        Value::Slice(s) => ValueImage::Slice {
            base: ref_image(&s.base_object())?,
            offset: s.offset,
            len: s.len,
            cap: s.cap,
        },
        Value::Object(o) => ValueImage::Object(ref_image(o)?),
        Value::Ref(r) => ValueImage::Object(RefImage {
            id: r.object_id,
            hash: r.hash,
            escaped: r.escaped,
        }),
        Value::Type(t) => ValueImage::Type(sink.externalize(t)),
    })
}

fn encode_typed(tv: &TypedValue, sink: &mut TypeSink) -> Result<TypedValueImage> {
    Ok(TypedValueImage {
        t: tv.t.as_ref().map(|t| sink.externalize(t)),
        v: encode_value(&tv.v, sink)?,
    })
}

fn encode_list(list: &[TypedValue], sink: &mut TypeSink) -> Result<Vec<TypedValueImage>> {
    list.iter().map(|tv| encode_typed(tv, sink)).collect()
}

/// Builds the image of an object. Every referenced child must be real.
///
/// # Errors
///
/// Returns a persistence error if a child object has no id.
pub fn encode_object(obj: &ObjectRef, sink: &mut TypeSink) -> Result<ObjectImage> {
    Ok(match obj {
        ObjectRef::Array(a) => {
            let a = a.borrow();
            ObjectImage::Array {
                info: InfoImage::from_info(&a.info),
                list: encode_list(&a.list, sink)?,
            }
        }
        ObjectRef::Struct(s) => {
            let s = s.borrow();
            ObjectImage::Struct {
                info: InfoImage::from_info(&s.info),
                fields: encode_list(&s.fields, sink)?,
            }
        }
        ObjectRef::Map(m) => {
            let m = m.borrow();
            let entries = m
                .entries
                .values()
                .map(|(k, v)| Ok((encode_typed(k, sink)?, encode_typed(v, sink)?)))
                .collect::<Result<Vec<_>>>()?;
            ObjectImage::Map {
                info: InfoImage::from_info(&m.info),
                entries,
            }
        }
        ObjectRef::Func(f) => {
            let f = f.borrow();
            let native = f.native.as_ref().map(|n| match n {
                NativeRef::Builtin(b) => NativeImage::Builtin(*b),
                NativeRef::Host { pkg_path, name } => NativeImage::Host {
                    pkg_path: pkg_path.clone(),
                    name: name.clone(),
                },
            });
            ObjectImage::Func {
                info: InfoImage::from_info(&f.info),
                func: FuncImage {
                    name: f.name.clone(),
                    pkg_path: f.pkg_path.clone(),
                    ty: Type::func(sink.externalize_func(&f.ty)),
                    source: f.location().cloned(),
                    native,
                    parent: encode_value(&f.parent, sink)?,
                    captures: encode_list(&f.captures, sink)?,
                },
            }
        }
        ObjectRef::BoundMethod(b) => {
            let b = b.borrow();
            ObjectImage::BoundMethod {
                info: InfoImage::from_info(&b.info),
                func: encode_value(&b.func, sink)?,
                receiver: encode_typed(&b.receiver, sink)?,
            }
        }
        ObjectRef::Block(b) => {
            let b = b.borrow();
            ObjectImage::Block {
                info: InfoImage::from_info(&b.info),
                location: b.location.clone(),
                values: encode_list(&b.values, sink)?,
                parent: encode_value(&b.parent, sink)?,
            }
        }
        ObjectRef::HeapItem(h) => {
            let h = h.borrow();
            ObjectImage::HeapItem {
                info: InfoImage::from_info(&h.info),
                value: encode_typed(&h.value, sink)?,
            }
        }
        ObjectRef::Package(p) => {
            let p = p.borrow();
            ObjectImage::Package {
                info: InfoImage::from_info(&p.info),
                name: p.name.clone(),
                path: p.path.clone(),
                names: p.names.clone(),
                block: encode_value(&p.block, sink)?,
            }
        }
    })
}

// =============================================================================
// Decoding
// =============================================================================

/// What decoding needs from the store.
pub trait ImageLoader {
    /// Loads (or returns the cached) object with the given id.
    ///
    /// # Errors
    ///
    /// Returns `ObjectNotFound` if it does not exist.
    fn load_object(&mut self, id: ObjectId) -> Result<ObjectRef>;

    /// Loads a declared type.
    ///
    /// # Errors
    ///
    /// Returns `TypeNotFound` if it does not exist.
    fn load_type(&mut self, id: &TypeId) -> Result<Type>;

    /// Looks up the guest source of a function.
    ///
    /// # Errors
    ///
    /// Returns `SourceNotFound` if nothing is registered at the location.
    fn load_source(&mut self, location: &Location) -> Result<Arc<FuncSource>>;
}

/// Replaces type references by the declared types they name.
///
/// # Errors
///
/// Propagates loader failures.
pub fn internalize_type<L: ImageLoader + ?Sized>(t: &Type, loader: &mut L) -> Result<Type> {
    Ok(match t {
        Type::Pointer(e) => Type::pointer(internalize_type(e, loader)?),
        Type::Slice(e) => Type::slice(internalize_type(e, loader)?),
        Type::Array(a) => Type::array(a.len, internalize_type(&a.elem, loader)?),
        Type::Map(m) => Type::map(
            internalize_type(&m.key, loader)?,
            internalize_type(&m.value, loader)?,
        ),
        Type::Struct(s) => Type::Struct(Arc::new(StructType {
            pkg_path: s.pkg_path.clone(),
            fields: internalize_fields(&s.fields, loader)?,
        })),
        Type::Func(ft) => Type::func(internalize_func(ft, loader)?),
        Type::Declared(d) => Type::Declared(Arc::new(DeclaredType {
            pkg_path: d.pkg_path.clone(),
            name: d.name.clone(),
            base: internalize_type(&d.base, loader)?,
        })),
        Type::Ref(id) => loader.load_type(id)?,
        other => other.clone(),
    })
}

fn internalize_fields<L: ImageLoader + ?Sized>(
    fields: &[FieldType],
    loader: &mut L,
) -> Result<Vec<FieldType>> {
    fields
        .iter()
        .map(|f| {
            Ok(FieldType {
                name: f.name.clone(),
                ty: internalize_type(&f.ty, loader)?,
            })
        })
        .collect()
}

fn internalize_func<L: ImageLoader + ?Sized>(ft: &FuncType, loader: &mut L) -> Result<FuncType> {
    Ok(FuncType {
        params: internalize_fields(&ft.params, loader)?,
        results: internalize_fields(&ft.results, loader)?,
        variadic: ft.variadic,
    })
}

fn decode_value<L: ImageLoader + ?Sized>(v: ValueImage, loader: &mut L) -> Result<Value> {
    Ok(match v {
        ValueImage::Nil => Value::Nil,
        ValueImage::Bool(b) => Value::Bool(b),
        ValueImage::Int(i) => Value::Int(i),
        ValueImage::Uint(u) => Value::Uint(u),
        ValueImage::Float(f) => Value::Float(f),
        ValueImage::String(s) => Value::String(s),
        ValueImage::Pointer { base, index } => Value::Pointer(PointerValue {
            base: loader.load_object(base.id)?,
            index,
        }),
        ValueImage::Slice {
            base,
            offset,
            len,
            cap,
        } => match loader.load_object(base.id)? {
            ObjectRef::Array(a) => Value::Slice(SliceValue {
                base: a,
                offset,
                len,
                cap,
            }),
            other => {
                return Err(Error::persistence(format!(
                    "slice base {} is a {}",
                    base.id,
                    other.kind_name()
                )));
            }
        },
        ValueImage::Object(r) => Value::Ref(RefValue {
            object_id: r.id,
            hash: r.hash,
            escaped: r.escaped,
        }),
        ValueImage::Type(t) => Value::Type(internalize_type(&t, loader)?),
    })
}

fn decode_typed<L: ImageLoader + ?Sized>(tv: TypedValueImage, loader: &mut L) -> Result<TypedValue> {
    let t = match tv.t {
        Some(t) => Some(internalize_type(&t, loader)?),
        None => None,
    };
    Ok(TypedValue {
        t,
        v: decode_value(tv.v, loader)?,
    })
}

fn decode_list<L: ImageLoader + ?Sized>(
    list: Vec<TypedValueImage>,
    loader: &mut L,
) -> Result<Vec<TypedValue>> {
    list.into_iter().map(|tv| decode_typed(tv, loader)).collect()
}

/// Map keys are decoded with their composite contents loaded so they can be
/// re-encoded as lookup keys.
fn decode_key<L: ImageLoader + ?Sized>(tv: TypedValueImage, loader: &mut L) -> Result<TypedValue> {
    let mut key = decode_typed(tv, loader)?;
    if let Value::Ref(r) = &key.v {
        key.v = Value::Object(loader.load_object(r.object_id)?);
    }
    Ok(key)
}

/// Creates an empty object of the image's kind carrying the persisted info.
#[must_use]
pub fn shell_object(image: &ObjectImage) -> ObjectRef {
    let info = image.info().to_info();
    match image {
        ObjectImage::Array { .. } => ObjectRef::Array(Rc::new(RefCell::new(ArrayValue {
            info,
            list: Vec::new(),
        }))),
        ObjectImage::Struct { .. } => ObjectRef::Struct(Rc::new(RefCell::new(StructValue {
            info,
            fields: Vec::new(),
        }))),
        ObjectImage::Map { .. } => ObjectRef::Map(Rc::new(RefCell::new(MapValue {
            info,
            ..MapValue::default()
        }))),
        ObjectImage::Func { func, .. } => {
            let mut fv = FuncValue::builtin(Builtin::Panic, FuncType::new(Vec::new(), Vec::new()));
            fv.info = info;
            fv.name = func.name.clone();
            fv.pkg_path = func.pkg_path.clone();
            fv.native = None;
            ObjectRef::func(fv)
        }
        ObjectImage::BoundMethod { .. } => {
            ObjectRef::BoundMethod(Rc::new(RefCell::new(BoundMethodValue {
                info,
                func: Value::Nil,
                receiver: TypedValue::undefined(),
            })))
        }
        ObjectImage::Block { location, .. } => {
            let mut b = Block::shell(location.clone());
            b.info = info;
            ObjectRef::block(b)
        }
        ObjectImage::HeapItem { .. } => ObjectRef::HeapItem(Rc::new(RefCell::new(HeapItemValue {
            info,
            value: TypedValue::undefined(),
        }))),
        ObjectImage::Package {
            name, path, names, ..
        } => ObjectRef::Package(Rc::new(RefCell::new(PackageValue {
            info,
            name: name.clone(),
            path: path.clone(),
            names: names.clone(),
            block: Value::Nil,
        }))),
    }
}

/// Decodes an image's contents into a shell built by [`shell_object`].
///
/// # Errors
///
/// Returns a persistence error on a kind mismatch and propagates loader
/// failures.
pub fn fill_object<L: ImageLoader + ?Sized>(
    obj: &ObjectRef,
    image: ObjectImage,
    loader: &mut L,
) -> Result<()> {
    match (obj, image) {
        (ObjectRef::Array(a), ObjectImage::Array { list, .. }) => {
            let list = decode_list(list, loader)?;
            a.borrow_mut().list = list;
        }
        (ObjectRef::Struct(s), ObjectImage::Struct { fields, .. }) => {
            let fields = decode_list(fields, loader)?;
            s.borrow_mut().fields = fields;
        }
        (ObjectRef::Map(m), ObjectImage::Map { entries, .. }) => {
            for (k, v) in entries {
                let k = decode_key(k, loader)?;
                let v = decode_typed(v, loader)?;
                let key = k.map_key()?;
                m.borrow_mut().set(key, k, v);
            }
        }
        (ObjectRef::Func(f), ObjectImage::Func { func, .. }) => {
            let ty = match internalize_type(&func.ty, loader)? {
                Type::Func(ft) => ft,
                other => {
                    return Err(Error::persistence(format!(
                        "function {} has non-function type {other}",
                        func.name
                    )));
                }
            };
            let source = match &func.source {
                Some(loc) => Some(loader.load_source(loc)?),
                None => None,
            };
            let parent = decode_value(func.parent, loader)?;
            let captures = decode_list(func.captures, loader)?;
            let mut f = f.borrow_mut();
            f.ty = ty;
            f.source = source;
            f.native = func.native.map(|n| match n {
                NativeImage::Builtin(b) => NativeRef::Builtin(b),
                NativeImage::Host { pkg_path, name } => NativeRef::Host { pkg_path, name },
            });
            f.parent = parent;
            f.captures = captures;
        }
        (ObjectRef::BoundMethod(b), ObjectImage::BoundMethod { func, receiver, .. }) => {
            let func = decode_value(func, loader)?;
            let receiver = decode_typed(receiver, loader)?;
            let mut b = b.borrow_mut();
            b.func = func;
            b.receiver = receiver;
        }
        (ObjectRef::Block(b), ObjectImage::Block { values, parent, .. }) => {
            let values = decode_list(values, loader)?;
            let parent = decode_value(parent, loader)?;
            let mut b = b.borrow_mut();
            b.values = values;
            b.parent = parent;
        }
        (ObjectRef::HeapItem(h), ObjectImage::HeapItem { value, .. }) => {
            let value = decode_typed(value, loader)?;
            h.borrow_mut().value = value;
        }
        (ObjectRef::Package(p), ObjectImage::Package { block, .. }) => {
            let block = decode_value(block, loader)?;
            p.borrow_mut().block = block;
        }
        (obj, image) => {
            return Err(Error::persistence(format!(
                "image of {} does not match {} object",
                image.info().id,
                obj.kind_name()
            )));
        }
    }
    Ok(())
}
