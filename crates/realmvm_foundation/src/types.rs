//! Static type descriptors.
//!
//! Types arrive from the checker already resolved; the runtime only looks
//! them up (zero values, element types, conversions, type identity). The set
//! of kinds is closed.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Primitive scalar types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimitiveType {
    /// `bool`
    Bool,
    /// `string`
    String,
    /// `int` (64-bit)
    Int,
    /// `int8`
    Int8,
    /// `int16`
    Int16,
    /// `int32` (also `rune`)
    Int32,
    /// `int64`
    Int64,
    /// `uint` (64-bit)
    Uint,
    /// `uint8` (also `byte`)
    Uint8,
    /// `uint16`
    Uint16,
    /// `uint32`
    Uint32,
    /// `uint64`
    Uint64,
    /// `float32`
    Float32,
    /// `float64`
    Float64,
}

impl PrimitiveType {
    /// Guest-language spelling.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::String => "string",
            Self::Int => "int",
            Self::Int8 => "int8",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Uint => "uint",
            Self::Uint8 => "uint8",
            Self::Uint16 => "uint16",
            Self::Uint32 => "uint32",
            Self::Uint64 => "uint64",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
        }
    }

    /// True for signed integer types.
    #[must_use]
    pub fn is_signed(self) -> bool {
        matches!(
            self,
            Self::Int | Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64
        )
    }

    /// True for unsigned integer types.
    #[must_use]
    pub fn is_unsigned(self) -> bool {
        matches!(
            self,
            Self::Uint | Self::Uint8 | Self::Uint16 | Self::Uint32 | Self::Uint64
        )
    }

    /// True for floating point types.
    #[must_use]
    pub fn is_float(self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }

    /// True for any integer type.
    #[must_use]
    pub fn is_integer(self) -> bool {
        self.is_signed() || self.is_unsigned()
    }

    /// Bit width of numeric types; 0 for bool and string.
    #[must_use]
    pub fn bits(self) -> u32 {
        match self {
            Self::Bool | Self::String => 0,
            Self::Int8 | Self::Uint8 => 8,
            Self::Int16 | Self::Uint16 => 16,
            Self::Int32 | Self::Uint32 | Self::Float32 => 32,
            Self::Int | Self::Int64 | Self::Uint | Self::Uint64 | Self::Float64 => 64,
        }
    }
}

/// The closed set of value kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    /// A primitive scalar.
    Primitive(PrimitiveType),
    /// Fixed-length array.
    Array,
    /// Slice over a backing array.
    Slice,
    /// Pointer into an object slot.
    Pointer,
    /// Struct.
    Struct,
    /// Map.
    Map,
    /// Function or closure.
    Func,
    /// Interface (holds a dynamic value).
    Interface,
    /// Package.
    Package,
    /// A type used as a value.
    Type,
    /// Heap item wrapper for captured variables.
    HeapItem,
    /// Unresolved reference to a persisted declared type.
    Ref,
}

/// Identifier of a type; the canonical spelling.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeId(pub Arc<str>);

impl TypeId {
    /// Store key for this type.
    #[must_use]
    pub fn key(&self) -> String {
        format!("tid:{}", self.0)
    }
}

impl fmt::Debug for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeId({})", self.0)
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A named field (struct field, parameter, result).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldType {
    /// Field name; empty for unnamed parameters and results.
    pub name: Arc<str>,
    /// Field type.
    pub ty: Type,
}

impl FieldType {
    /// Creates a field.
    #[must_use]
    pub fn new(name: &str, ty: Type) -> Self {
        Self {
            name: Arc::from(name),
            ty,
        }
    }
}

/// Fixed-length array type.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArrayType {
    /// Number of elements.
    pub len: usize,
    /// Element type.
    pub elem: Type,
}

/// Map type.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MapType {
    /// Key type.
    pub key: Type,
    /// Value type.
    pub value: Type,
}

/// Struct type.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StructType {
    /// Package declaring the struct (for unexported fields).
    pub pkg_path: Arc<str>,
    /// Fields in declaration order.
    pub fields: Vec<FieldType>,
}

/// Function signature.
///
/// Method signatures list the receiver as the first parameter.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FuncType {
    /// Parameters.
    pub params: Vec<FieldType>,
    /// Results.
    pub results: Vec<FieldType>,
    /// True if the last parameter is variadic (`...T`, typed as `[]T`).
    pub variadic: bool,
}

impl FuncType {
    /// Creates a non-variadic function type.
    #[must_use]
    pub fn new(params: Vec<FieldType>, results: Vec<FieldType>) -> Self {
        Self {
            params,
            results,
            variadic: false,
        }
    }

    /// Marks the last parameter as variadic.
    #[must_use]
    pub fn with_variadic(mut self) -> Self {
        self.variadic = true;
        self
    }
}

/// Interface type.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InterfaceType {
    /// Declaring package.
    pub pkg_path: Arc<str>,
    /// Method names.
    pub methods: Vec<Arc<str>>,
}

/// A named type declared in a package.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeclaredType {
    /// Declaring package.
    pub pkg_path: Arc<str>,
    /// Type name.
    pub name: Arc<str>,
    /// Underlying type.
    pub base: Type,
}

/// A static type descriptor.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    /// Primitive scalar.
    Primitive(PrimitiveType),
    /// `*T`
    Pointer(Arc<Type>),
    /// `[N]T`
    Array(Arc<ArrayType>),
    /// `[]T`
    Slice(Arc<Type>),
    /// `map[K]V`
    Map(Arc<MapType>),
    /// `struct{...}`
    Struct(Arc<StructType>),
    /// `func(...)...`
    Func(Arc<FuncType>),
    /// `interface{...}`
    Interface(Arc<InterfaceType>),
    /// Named type.
    Declared(Arc<DeclaredType>),
    /// Reference to a declared type stored separately.
    Ref(TypeId),
    /// Package value type.
    Package,
    /// Type of type values.
    TypeType,
    /// Heap item wrapper type.
    HeapItem,
}

impl Type {
    /// `bool`
    #[must_use]
    pub fn bool() -> Self {
        Self::Primitive(PrimitiveType::Bool)
    }

    /// `string`
    #[must_use]
    pub fn string() -> Self {
        Self::Primitive(PrimitiveType::String)
    }

    /// `int`
    #[must_use]
    pub fn int() -> Self {
        Self::Primitive(PrimitiveType::Int)
    }

    /// `int32` (rune)
    #[must_use]
    pub fn rune() -> Self {
        Self::Primitive(PrimitiveType::Int32)
    }

    /// `uint8` (byte)
    #[must_use]
    pub fn byte() -> Self {
        Self::Primitive(PrimitiveType::Uint8)
    }

    /// `float64`
    #[must_use]
    pub fn float64() -> Self {
        Self::Primitive(PrimitiveType::Float64)
    }

    /// `*elem`
    #[must_use]
    pub fn pointer(elem: Type) -> Self {
        Self::Pointer(Arc::new(elem))
    }

    /// `[]elem`
    #[must_use]
    pub fn slice(elem: Type) -> Self {
        Self::Slice(Arc::new(elem))
    }

    /// `[len]elem`
    #[must_use]
    pub fn array(len: usize, elem: Type) -> Self {
        Self::Array(Arc::new(ArrayType { len, elem }))
    }

    /// `map[key]value`
    #[must_use]
    pub fn map(key: Type, value: Type) -> Self {
        Self::Map(Arc::new(MapType { key, value }))
    }

    /// Struct type with the given fields.
    #[must_use]
    pub fn structure(pkg_path: &str, fields: Vec<FieldType>) -> Self {
        Self::Struct(Arc::new(StructType {
            pkg_path: Arc::from(pkg_path),
            fields,
        }))
    }

    /// Function type.
    #[must_use]
    pub fn func(ft: FuncType) -> Self {
        Self::Func(Arc::new(ft))
    }

    /// The empty interface.
    #[must_use]
    pub fn any() -> Self {
        Self::Interface(Arc::new(InterfaceType {
            pkg_path: Arc::from(""),
            methods: Vec::new(),
        }))
    }

    /// Named type.
    #[must_use]
    pub fn declared(pkg_path: &str, name: &str, base: Type) -> Self {
        Self::Declared(Arc::new(DeclaredType {
            pkg_path: Arc::from(pkg_path),
            name: Arc::from(name),
            base,
        }))
    }

    /// Kind of the underlying type.
    #[must_use]
    pub fn kind(&self) -> Kind {
        match self {
            Self::Primitive(p) => Kind::Primitive(*p),
            Self::Pointer(_) => Kind::Pointer,
            Self::Array(_) => Kind::Array,
            Self::Slice(_) => Kind::Slice,
            Self::Map(_) => Kind::Map,
            Self::Struct(_) => Kind::Struct,
            Self::Func(_) => Kind::Func,
            Self::Interface(_) => Kind::Interface,
            Self::Declared(d) => d.base.kind(),
            Self::Ref(_) => Kind::Ref,
            Self::Package => Kind::Package,
            Self::TypeType => Kind::Type,
            Self::HeapItem => Kind::HeapItem,
        }
    }

    /// Underlying type (strips declared names).
    #[must_use]
    pub fn base(&self) -> &Type {
        match self {
            Self::Declared(d) => d.base.base(),
            other => other,
        }
    }

    /// Primitive type of the underlying type, if any.
    #[must_use]
    pub fn primitive(&self) -> Option<PrimitiveType> {
        match self.base() {
            Self::Primitive(p) => Some(*p),
            _ => None,
        }
    }

    /// Element type of pointers, slices, arrays and maps.
    #[must_use]
    pub fn elem(&self) -> Option<&Type> {
        match self.base() {
            Self::Pointer(t) | Self::Slice(t) => Some(t),
            Self::Array(a) => Some(&a.elem),
            Self::Map(m) => Some(&m.value),
            _ => None,
        }
    }

    /// Struct descriptor of the underlying type.
    #[must_use]
    pub fn as_struct(&self) -> Option<&StructType> {
        match self.base() {
            Self::Struct(s) => Some(s),
            _ => None,
        }
    }

    /// Function descriptor of the underlying type.
    #[must_use]
    pub fn as_func(&self) -> Option<&Arc<FuncType>> {
        match self.base() {
            Self::Func(f) => Some(f),
            _ => None,
        }
    }

    /// True for interface types.
    #[must_use]
    pub fn is_interface(&self) -> bool {
        matches!(self.kind(), Kind::Interface)
    }

    /// Canonical identity of this type.
    #[must_use]
    pub fn type_id(&self) -> TypeId {
        TypeId(Arc::from(self.to_string()))
    }
}

fn write_fields(f: &mut fmt::Formatter<'_>, fields: &[FieldType], named: bool) -> fmt::Result {
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            f.write_str(",")?;
        }
        if named && !field.name.is_empty() {
            write!(f, "{} ", field.name)?;
        }
        write!(f, "{}", field.ty)?;
    }
    Ok(())
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primitive(p) => f.write_str(p.name()),
            Self::Pointer(t) => write!(f, "*{t}"),
            Self::Array(a) => write!(f, "[{}]{}", a.len, a.elem),
            Self::Slice(t) => write!(f, "[]{t}"),
            Self::Map(m) => write!(f, "map[{}]{}", m.key, m.value),
            Self::Struct(s) => {
                f.write_str("struct{")?;
                for (i, field) in s.fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(";")?;
                    }
                    write!(f, "{} {}", field.name, field.ty)?;
                }
                f.write_str("}")
            }
            Self::Func(ft) => {
                f.write_str("func(")?;
                write_fields(f, &ft.params, false)?;
                if ft.variadic {
                    f.write_str("...")?;
                }
                f.write_str(")")?;
                if !ft.results.is_empty() {
                    f.write_str("(")?;
                    write_fields(f, &ft.results, false)?;
                    f.write_str(")")?;
                }
                Ok(())
            }
            Self::Interface(it) => {
                f.write_str("interface{")?;
                for (i, m) in it.methods.iter().enumerate() {
                    if i > 0 {
                        f.write_str(";")?;
                    }
                    f.write_str(m)?;
                }
                f.write_str("}")
            }
            Self::Declared(d) => write!(f, "{}.{}", d.pkg_path, d.name),
            Self::Ref(id) => write!(f, "{id}"),
            Self::Package => f.write_str("package"),
            Self::TypeType => f.write_str("type"),
            Self::HeapItem => f.write_str("heapitem"),
        }
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Type({self})")
    }
}
