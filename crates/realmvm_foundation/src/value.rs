//! Guest runtime values.
//!
//! A [`TypedValue`] pairs a static type with a [`Value`] payload. Primitive
//! payloads are stored inline; composite payloads are handles to heap
//! objects. An undefined value (no type, nil payload) is distinct from a typed
//! nil.
//!
//! Objects loaded from the store may still hold [`RefValue`] tokens for
//! children that have not been loaded yet. The machine resolves a token the
//! moment it reads the slot holding it, so values on the machine stacks never
//! carry tokens at the top level.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_lossless)]

use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::hash::{Hashlet, ObjectId};
use crate::object::{ArrayValue, ObjectRef};
use crate::types::{Kind, PrimitiveType, Type};

// =============================================================================
// Payloads
// =============================================================================

/// Pointer to slot `index` of `base` (array element, struct field, block
/// slot, or the single slot of a heap item).
#[derive(Clone, Debug)]
pub struct PointerValue {
    /// Object holding the pointee.
    pub base: ObjectRef,
    /// Slot within the base.
    pub index: usize,
}

impl PointerValue {
    /// Reads the pointee.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the slot does not exist.
    pub fn deref(&self) -> Result<TypedValue> {
        self.base.get_slot(self.index)
    }
}

/// Window onto a backing array.
#[derive(Clone, Debug)]
pub struct SliceValue {
    /// Backing array.
    pub base: Rc<RefCell<ArrayValue>>,
    /// First element.
    pub offset: usize,
    /// Number of visible elements.
    pub len: usize,
    /// Capacity from `offset`.
    pub cap: usize,
}

impl SliceValue {
    /// Backing array as an object handle.
    #[must_use]
    pub fn base_object(&self) -> ObjectRef {
        ObjectRef::Array(self.base.clone())
    }
}

/// Token standing in for a persisted child object that is not loaded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefValue {
    /// Id of the referenced object.
    pub object_id: ObjectId,
    /// Content hash when the child is owned by the referencing object.
    pub hash: Option<Hashlet>,
    /// True when the child is escaped (no single owner).
    pub escaped: bool,
}

/// Resolves unloaded object tokens.
pub trait ObjectResolver {
    /// Loads (or returns the cached) object behind a token.
    ///
    /// # Errors
    ///
    /// Returns `ObjectNotFound` if the store has no such object.
    fn resolve(&mut self, r: &RefValue) -> Result<ObjectRef>;
}

/// Value payload.
#[derive(Clone, Debug, Default)]
pub enum Value {
    /// Nil (undefined, or typed nil for pointer/slice/map/func/interface).
    #[default]
    Nil,
    /// Boolean.
    Bool(bool),
    /// Signed integer of any width.
    Int(i64),
    /// Unsigned integer of any width.
    Uint(u64),
    /// Float of either width.
    Float(f64),
    /// String.
    String(Arc<str>),
    /// Pointer.
    Pointer(PointerValue),
    /// Slice.
    Slice(SliceValue),
    /// Heap object (array, struct, map, func, bound method, block, heap item, package).
    Object(ObjectRef),
    /// Type value.
    Type(Type),
    /// Unloaded persisted object.
    Ref(RefValue),
}

impl Value {
    /// The object handle, if this payload is an object.
    #[must_use]
    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Self::Object(o) => Some(o),
            _ => None,
        }
    }

    /// True for nil.
    #[must_use]
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    /// Replaces an unloaded token with the loaded object.
    ///
    /// # Errors
    ///
    /// Propagates resolver failures.
    pub fn resolved<R: ObjectResolver + ?Sized>(&self, resolver: &mut R) -> Result<Value> {
        match self {
            Self::Ref(r) => Ok(Self::Object(resolver.resolve(r)?)),
            other => Ok(other.clone()),
        }
    }
}

// =============================================================================
// TypedValue
// =============================================================================

/// A (type, value) pair.
#[derive(Clone, Debug, Default)]
pub struct TypedValue {
    /// Static type; `None` only for undefined values.
    pub t: Option<Type>,
    /// Payload.
    pub v: Value,
}

impl TypedValue {
    /// Creates a typed value.
    #[must_use]
    pub fn new(t: Type, v: Value) -> Self {
        Self { t: Some(t), v }
    }

    /// The undefined value.
    #[must_use]
    pub fn undefined() -> Self {
        Self::default()
    }

    /// `int` value.
    #[must_use]
    pub fn int(v: i64) -> Self {
        Self::new(Type::int(), Value::Int(v))
    }

    /// `bool` value.
    #[must_use]
    pub fn bool(v: bool) -> Self {
        Self::new(Type::bool(), Value::Bool(v))
    }

    /// `string` value.
    #[must_use]
    pub fn string(v: &str) -> Self {
        Self::new(Type::string(), Value::String(Arc::from(v)))
    }

    /// `float64` value.
    #[must_use]
    pub fn float64(v: f64) -> Self {
        Self::new(Type::float64(), Value::Float(v))
    }

    /// `rune` value.
    #[must_use]
    pub fn rune(c: char) -> Self {
        Self::new(Type::rune(), Value::Int(c as i64))
    }

    /// Type value.
    #[must_use]
    pub fn type_value(t: Type) -> Self {
        Self::new(Type::TypeType, Value::Type(t))
    }

    /// Heap item wrapping `value`.
    #[must_use]
    pub fn heap_item(value: TypedValue) -> Self {
        Self::new(Type::HeapItem, Value::Object(ObjectRef::heap_item(value)))
    }

    /// True for the undefined value.
    #[must_use]
    pub fn is_undefined(&self) -> bool {
        self.t.is_none() && self.v.is_nil()
    }

    /// Kind of the static type.
    #[must_use]
    pub fn kind(&self) -> Option<Kind> {
        self.t.as_ref().map(Type::kind)
    }

    /// Zero value of a type. Arrays and structs are allocated eagerly.
    #[must_use]
    pub fn zero(t: &Type) -> Self {
        let v = match t.base() {
            Type::Primitive(p) => match p {
                PrimitiveType::Bool => Value::Bool(false),
                PrimitiveType::String => Value::String(Arc::from("")),
                p if p.is_float() => Value::Float(0.0),
                p if p.is_unsigned() => Value::Uint(0),
                _ => Value::Int(0),
            },
            Type::Array(a) => Value::Object(ObjectRef::array(
                (0..a.len).map(|_| Self::zero(&a.elem)).collect(),
            )),
            Type::Struct(s) => Value::Object(ObjectRef::structure(
                s.fields.iter().map(|f| Self::zero(&f.ty)).collect(),
            )),
            Type::Interface(_) => return Self::undefined(),
            _ => Value::Nil,
        };
        Self { t: Some(t.clone()), v }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    fn kind_error(&self, want: &str) -> Error {
        Error::internal(format!(
            "expected {want} value, got {}",
            self.t.as_ref().map_or_else(|| "undefined".to_string(), ToString::to_string)
        ))
    }

    /// Boolean payload.
    ///
    /// # Errors
    ///
    /// Returns an internal error for other kinds.
    pub fn as_bool(&self) -> Result<bool> {
        match self.v {
            Value::Bool(b) => Ok(b),
            _ => Err(self.kind_error("bool")),
        }
    }

    /// Signed integer payload.
    ///
    /// # Errors
    ///
    /// Returns an internal error for other kinds.
    pub fn as_int(&self) -> Result<i64> {
        match self.v {
            Value::Int(i) => Ok(i),
            _ => Err(self.kind_error("int")),
        }
    }

    /// Any integer payload as `i64`, for indexes and lengths.
    ///
    /// # Errors
    ///
    /// Returns an internal error for non-integer kinds.
    pub fn as_index(&self) -> Result<i64> {
        match self.v {
            Value::Int(i) => Ok(i),
            Value::Uint(u) => Ok(i64::try_from(u).unwrap_or(i64::MAX)),
            _ => Err(self.kind_error("integer")),
        }
    }

    /// Unsigned integer payload.
    ///
    /// # Errors
    ///
    /// Returns an internal error for other kinds.
    pub fn as_uint(&self) -> Result<u64> {
        match self.v {
            Value::Uint(u) => Ok(u),
            _ => Err(self.kind_error("uint")),
        }
    }

    /// Float payload.
    ///
    /// # Errors
    ///
    /// Returns an internal error for other kinds.
    pub fn as_float(&self) -> Result<f64> {
        match self.v {
            Value::Float(f) => Ok(f),
            _ => Err(self.kind_error("float")),
        }
    }

    /// String payload.
    ///
    /// # Errors
    ///
    /// Returns an internal error for other kinds.
    pub fn as_str(&self) -> Result<&Arc<str>> {
        match &self.v {
            Value::String(s) => Ok(s),
            _ => Err(self.kind_error("string")),
        }
    }

    /// Object payload.
    ///
    /// # Errors
    ///
    /// Returns an internal error for other kinds.
    pub fn as_object(&self) -> Result<&ObjectRef> {
        self.v.as_object().ok_or_else(|| self.kind_error("object"))
    }

    /// Length of strings, arrays, slices and maps; nil has length zero.
    ///
    /// # Errors
    ///
    /// Returns an internal error for kinds without a length.
    pub fn len(&self) -> Result<usize> {
        match &self.v {
            Value::String(s) => Ok(s.len()),
            Value::Slice(s) => Ok(s.len),
            Value::Object(ObjectRef::Array(a)) => Ok(a.borrow().list.len()),
            Value::Object(ObjectRef::Map(m)) => Ok(m.borrow().len()),
            Value::Nil => Ok(0),
            _ => Err(self.kind_error("sized")),
        }
    }

    /// Capacity of arrays and slices.
    ///
    /// # Errors
    ///
    /// Returns an internal error for other kinds.
    pub fn cap(&self) -> Result<usize> {
        match &self.v {
            Value::Slice(s) => Ok(s.cap),
            Value::Object(ObjectRef::Array(a)) => Ok(a.borrow().list.len()),
            Value::Nil => Ok(0),
            _ => Err(self.kind_error("array or slice")),
        }
    }

    // -------------------------------------------------------------------------
    // Ownership helpers
    // -------------------------------------------------------------------------

    /// The object a store into a slot attaches to the ownership tree.
    ///
    /// # Errors
    ///
    /// Propagates resolver failures.
    pub fn first_object<R: ObjectResolver + ?Sized>(
        &self,
        resolver: &mut R,
    ) -> Result<Option<ObjectRef>> {
        Ok(match &self.v {
            Value::Object(o) => Some(o.clone()),
            Value::Pointer(p) => Some(p.base.clone()),
            Value::Slice(s) => Some(s.base_object()),
            Value::Ref(r) => Some(resolver.resolve(r)?),
            _ => None,
        })
    }

    /// Copy with value semantics: arrays and structs are duplicated
    /// recursively, everything else is shared.
    ///
    /// # Errors
    ///
    /// Propagates resolver failures.
    pub fn copy<R: ObjectResolver + ?Sized>(&self, resolver: &mut R) -> Result<TypedValue> {
        let kind = self.kind();
        let obj = match (&self.v, kind) {
            (Value::Object(o), Some(Kind::Array | Kind::Struct)) => o.clone(),
            (Value::Ref(r), Some(Kind::Array | Kind::Struct)) => resolver.resolve(r)?,
            _ => return Ok(self.clone()),
        };
        let v = match &obj {
            ObjectRef::Array(a) => {
                let elems = a.borrow().list.clone();
                let list = elems
                    .iter()
                    .map(|e| e.copy(resolver))
                    .collect::<Result<Vec<_>>>()?;
                Value::Object(ObjectRef::array(list))
            }
            ObjectRef::Struct(s) => {
                let elems = s.borrow().fields.clone();
                let fields = elems
                    .iter()
                    .map(|e| e.copy(resolver))
                    .collect::<Result<Vec<_>>>()?;
                Value::Object(ObjectRef::structure(fields))
            }
            _ => return Ok(self.clone()),
        };
        Ok(Self { t: self.t.clone(), v })
    }

    // -------------------------------------------------------------------------
    // Equality and ordering
    // -------------------------------------------------------------------------

    /// Guest `==`.
    ///
    /// # Errors
    ///
    /// Returns a runtime error for uncomparable non-nil values.
    pub fn equals<R: ObjectResolver + ?Sized>(
        &self,
        other: &TypedValue,
        resolver: &mut R,
    ) -> Result<bool> {
        let same_type = match (&self.t, &other.t) {
            (None, None) => true,
            (Some(a), Some(b)) => a == b,
            _ => false,
        };
        if !same_type {
            return Ok(false);
        }
        let lhs = self.v.resolved(resolver)?;
        let rhs = other.v.resolved(resolver)?;
        Ok(match (&lhs, &rhs) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Uint(a), Value::Uint(b)) => a == b,
            #[allow(clippy::float_cmp)]
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Type(a), Value::Type(b)) => a == b,
            (Value::Pointer(a), Value::Pointer(b)) => a.base.ptr_eq(&b.base) && a.index == b.index,
            (Value::Object(ObjectRef::Array(a)), Value::Object(ObjectRef::Array(b))) => {
                let (la, lb) = (a.borrow().list.clone(), b.borrow().list.clone());
                elementwise_equal(&la, &lb, resolver)?
            }
            (Value::Object(ObjectRef::Struct(a)), Value::Object(ObjectRef::Struct(b))) => {
                let (fa, fb) = (a.borrow().fields.clone(), b.borrow().fields.clone());
                elementwise_equal(&fa, &fb, resolver)?
            }
            (Value::Nil, _) | (_, Value::Nil) => false,
            _ => {
                return Err(Error::runtime(format!(
                    "comparing uncomparable type {}",
                    self.t.as_ref().map_or_else(String::new, ToString::to_string)
                )));
            }
        })
    }

    /// Guest ordering for ordered kinds.
    ///
    /// # Errors
    ///
    /// Returns an internal error for unordered kinds.
    pub fn compare(&self, other: &TypedValue) -> Result<Ordering> {
        match (&self.v, &other.v) {
            (Value::Int(a), Value::Int(b)) => Ok(a.cmp(b)),
            (Value::Uint(a), Value::Uint(b)) => Ok(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a
                .partial_cmp(b)
                .ok_or_else(|| Error::internal("NaN has no ordering")),
            (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
            _ => Err(self.kind_error("ordered")),
        }
    }

    /// Encoded map key.
    ///
    /// # Errors
    ///
    /// Returns `NotYetImplemented` for pointer, func and other reference keys.
    pub fn map_key(&self) -> Result<MapKey> {
        let mut out = Vec::new();
        self.encode_key(&mut out)?;
        Ok(MapKey(out))
    }

    fn encode_key(&self, out: &mut Vec<u8>) -> Result<()> {
        if let Some(t) = &self.t {
            out.extend_from_slice(t.type_id().0.as_bytes());
        }
        out.push(0);
        match &self.v {
            Value::Nil => out.push(0),
            Value::Bool(b) => out.extend_from_slice(&[1, u8::from(*b)]),
            Value::Int(i) => {
                out.push(2);
                out.extend_from_slice(&i.to_le_bytes());
            }
            Value::Uint(u) => {
                out.push(3);
                out.extend_from_slice(&u.to_le_bytes());
            }
            Value::Float(f) => {
                out.push(4);
                let f = if *f == 0.0 { 0.0 } else { *f };
                out.extend_from_slice(&f.to_bits().to_le_bytes());
            }
            Value::String(s) => {
                out.push(5);
                out.extend_from_slice(&(s.len() as u64).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            Value::Object(ObjectRef::Array(a)) => {
                out.push(6);
                for e in &a.borrow().list {
                    e.encode_key(out)?;
                }
            }
            Value::Object(ObjectRef::Struct(s)) => {
                out.push(7);
                for f in &s.borrow().fields {
                    f.encode_key(out)?;
                }
            }
            other => {
                return Err(Error::not_yet_implemented(format!(
                    "map key of kind {}",
                    value_kind_name(other)
                )));
            }
        }
        Ok(())
    }
}

fn elementwise_equal<R: ObjectResolver + ?Sized>(
    a: &[TypedValue],
    b: &[TypedValue],
    resolver: &mut R,
) -> Result<bool> {
    if a.len() != b.len() {
        return Ok(false);
    }
    for (x, y) in a.iter().zip(b) {
        if !x.equals(y, resolver)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn value_kind_name(v: &Value) -> &'static str {
    match v {
        Value::Nil => "nil",
        Value::Bool(_) => "bool",
        Value::Int(_) => "int",
        Value::Uint(_) => "uint",
        Value::Float(_) => "float",
        Value::String(_) => "string",
        Value::Pointer(_) => "pointer",
        Value::Slice(_) => "slice",
        Value::Object(o) => o.kind_name(),
        Value::Type(_) => "type",
        Value::Ref(_) => "ref",
    }
}

/// Encoded, hashable map key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MapKey(pub Vec<u8>);

// =============================================================================
// Integer widths
// =============================================================================

/// Wraps a signed result to the width of `p`.
#[must_use]
pub fn wrap_int(p: PrimitiveType, v: i64) -> i64 {
    match p {
        PrimitiveType::Int8 => v as i8 as i64,
        PrimitiveType::Int16 => v as i16 as i64,
        PrimitiveType::Int32 => v as i32 as i64,
        _ => v,
    }
}

/// Wraps an unsigned result to the width of `p`.
#[must_use]
pub fn wrap_uint(p: PrimitiveType, v: u64) -> u64 {
    match p {
        PrimitiveType::Uint8 => v as u8 as u64,
        PrimitiveType::Uint16 => v as u16 as u64,
        PrimitiveType::Uint32 => v as u32 as u64,
        _ => v,
    }
}

/// Rounds a float result to the width of `p`.
#[must_use]
pub fn wrap_float(p: PrimitiveType, v: f64) -> f64 {
    match p {
        PrimitiveType::Float32 => v as f32 as f64,
        _ => v,
    }
}

// =============================================================================
// Display
// =============================================================================

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.v {
            Value::Nil => {
                if self.t.is_none() {
                    f.write_str("<nil>")
                } else {
                    f.write_str("nil")
                }
            }
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Uint(u) => write!(f, "{u}"),
            Value::Float(x) => {
                if x.is_infinite() {
                    f.write_str(if *x > 0.0 { "+Inf" } else { "-Inf" })
                } else {
                    write!(f, "{x}")
                }
            }
            Value::String(s) => f.write_str(s),
            Value::Pointer(p) => match p.deref() {
                Ok(tv) if matches!(tv.kind(), Some(Kind::Struct | Kind::Array)) => {
                    write!(f, "&{tv}")
                }
                _ => write!(f, "&{}[{}]", p.base.kind_name(), p.index),
            },
            Value::Slice(s) => {
                let a = s.base.borrow();
                write_list(f, &a.list[s.offset..s.offset + s.len])
            }
            Value::Object(ObjectRef::Array(a)) => write_list(f, &a.borrow().list),
            Value::Object(ObjectRef::Struct(s)) => {
                f.write_str("{")?;
                for (i, field) in s.borrow().fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{field}")?;
                }
                f.write_str("}")
            }
            Value::Object(ObjectRef::Map(m)) => {
                f.write_str("map[")?;
                for (i, (k, v)) in m.borrow().entries.values().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{k}:{v}")?;
                }
                f.write_str("]")
            }
            Value::Object(ObjectRef::HeapItem(h)) => write!(f, "{}", h.borrow().value),
            Value::Object(o) => write!(f, "{}", o.kind_name()),
            Value::Type(t) => write!(f, "{t}"),
            Value::Ref(r) => write!(f, "ref({})", r.object_id),
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, list: &[TypedValue]) -> fmt::Result {
    f.write_str("[")?;
    for (i, e) in list.iter().enumerate() {
        if i > 0 {
            f.write_str(" ")?;
        }
        write!(f, "{e}")?;
    }
    f.write_str("]")
}
