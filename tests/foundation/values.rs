//! Integration tests for TypedValue
//!
//! Tests zero values, value-semantics copies, equality, map keys and display.

use proptest::prelude::*;
use realmvm_foundation::{
    ErrorKind, FieldType, ObjectRef, ObjectResolver, PointerValue, PrimitiveType, RefValue,
    Result, Type, TypedValue, Value, wrap_float, wrap_int, wrap_uint,
};

/// Resolver for values that never hold unloaded references.
struct Detached;

impl ObjectResolver for Detached {
    fn resolve(&mut self, r: &RefValue) -> Result<ObjectRef> {
        Err(realmvm_foundation::Error::object_not_found(r.object_id))
    }
}

fn int_array(items: &[i64]) -> TypedValue {
    TypedValue::new(
        Type::array(items.len(), Type::int()),
        Value::Object(ObjectRef::array(
            items.iter().map(|i| TypedValue::int(*i)).collect(),
        )),
    )
}

// =============================================================================
// Zero Values
// =============================================================================

#[test]
fn zero_values_by_kind() {
    assert_eq!(TypedValue::zero(&Type::int()).as_int().unwrap(), 0);
    assert!(!TypedValue::zero(&Type::bool()).as_bool().unwrap());
    assert_eq!(TypedValue::zero(&Type::string()).as_str().unwrap().as_ref(), "");
    assert!(TypedValue::zero(&Type::pointer(Type::int())).v.is_nil());
    assert!(TypedValue::zero(&Type::any()).is_undefined());
}

#[test]
fn composite_zero_values_are_allocated() {
    let arr = TypedValue::zero(&Type::array(3, Type::int()));
    assert_eq!(arr.len().unwrap(), 3);

    let point = Type::structure(
        "main",
        vec![FieldType::new("x", Type::int()), FieldType::new("y", Type::int())],
    );
    let zero = TypedValue::zero(&point);
    let obj = zero.as_object().unwrap();
    assert_eq!(obj.get_slot(1).unwrap().as_int().unwrap(), 0);
}

// =============================================================================
// Copy Semantics
// =============================================================================

#[test]
fn copying_an_array_duplicates_it() {
    let original = int_array(&[1, 2]);
    let copy = original.copy(&mut Detached).unwrap();
    copy.as_object().unwrap().set_slot(0, TypedValue::int(9)).unwrap();

    assert_eq!(original.as_object().unwrap().get_slot(0).unwrap().as_int().unwrap(), 1);
    assert!(!original.as_object().unwrap().ptr_eq(copy.as_object().unwrap()));
}

#[test]
fn copying_a_map_shares_it() {
    let m = TypedValue::new(Type::map(Type::string(), Type::int()), Value::Object(ObjectRef::map()));
    let copy = m.copy(&mut Detached).unwrap();
    assert!(m.as_object().unwrap().ptr_eq(copy.as_object().unwrap()));
}

// =============================================================================
// Equality
// =============================================================================

#[test]
fn equality_requires_identical_types() {
    let a = TypedValue::int(7);
    let b = TypedValue::new(Type::Primitive(PrimitiveType::Int64), Value::Int(7));
    assert!(a.equals(&TypedValue::int(7), &mut Detached).unwrap());
    assert!(!a.equals(&b, &mut Detached).unwrap());
}

#[test]
fn arrays_compare_elementwise() {
    assert!(int_array(&[1, 2]).equals(&int_array(&[1, 2]), &mut Detached).unwrap());
    assert!(!int_array(&[1, 2]).equals(&int_array(&[1, 3]), &mut Detached).unwrap());
}

#[test]
fn comparing_maps_is_a_runtime_error() {
    let t = Type::map(Type::string(), Type::int());
    let a = TypedValue::new(t.clone(), Value::Object(ObjectRef::map()));
    let b = TypedValue::new(t, Value::Object(ObjectRef::map()));
    let err = a.equals(&b, &mut Detached).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::Runtime(_)));
}

#[test]
fn pointers_compare_by_target() {
    let item = ObjectRef::heap_item(TypedValue::int(1));
    let p = |base: &ObjectRef| {
        TypedValue::new(
            Type::pointer(Type::int()),
            Value::Pointer(PointerValue {
                base: base.clone(),
                index: 0,
            }),
        )
    };
    let other = ObjectRef::heap_item(TypedValue::int(1));
    assert!(p(&item).equals(&p(&item), &mut Detached).unwrap());
    assert!(!p(&item).equals(&p(&other), &mut Detached).unwrap());
}

// =============================================================================
// Map Keys
// =============================================================================

#[test]
fn map_keys_distinguish_types() {
    let a = TypedValue::int(1).map_key().unwrap();
    let b = TypedValue::new(Type::Primitive(PrimitiveType::Int8), Value::Int(1))
        .map_key()
        .unwrap();
    assert_ne!(a, b);
}

#[test]
fn negative_zero_float_keys_collide() {
    let a = TypedValue::float64(0.0).map_key().unwrap();
    let b = TypedValue::float64(-0.0).map_key().unwrap();
    assert_eq!(a, b);
}

#[test]
fn pointer_keys_are_not_supported() {
    let p = TypedValue::new(
        Type::pointer(Type::int()),
        Value::Pointer(PointerValue {
            base: ObjectRef::heap_item(TypedValue::int(0)),
            index: 0,
        }),
    );
    let err = p.map_key().unwrap_err();
    assert!(matches!(err.kind, ErrorKind::NotYetImplemented(_)));
}

proptest! {
    #[test]
    fn int_keys_collide_exactly_when_equal(a in any::<i64>(), b in any::<i64>()) {
        let ka = TypedValue::int(a).map_key().unwrap();
        let kb = TypedValue::int(b).map_key().unwrap();
        prop_assert_eq!(ka == kb, a == b);
    }

    #[test]
    fn string_keys_collide_exactly_when_equal(a in ".{0,8}", b in ".{0,8}") {
        let ka = TypedValue::string(&a).map_key().unwrap();
        let kb = TypedValue::string(&b).map_key().unwrap();
        prop_assert_eq!(ka == kb, a == b);
    }
}

// =============================================================================
// Integer Widths
// =============================================================================

#[test]
fn narrow_integers_wrap() {
    assert_eq!(wrap_int(PrimitiveType::Int8, 200), -56);
    assert_eq!(wrap_int(PrimitiveType::Int, 200), 200);
    assert_eq!(wrap_uint(PrimitiveType::Uint8, 300), 44);
    assert_eq!(wrap_uint(PrimitiveType::Uint16, 70_000), 4_464);
}

#[test]
fn float32_rounds() {
    let x = wrap_float(PrimitiveType::Float32, 0.1);
    assert_eq!(x, f64::from(0.1_f32));
    assert_eq!(wrap_float(PrimitiveType::Float64, 0.1), 0.1);
}

// =============================================================================
// Display
// =============================================================================

#[test]
fn display_matches_guest_printing() {
    assert_eq!(TypedValue::undefined().to_string(), "<nil>");
    assert_eq!(TypedValue::zero(&Type::pointer(Type::int())).to_string(), "nil");
    assert_eq!(int_array(&[1, 2, 3]).to_string(), "[1 2 3]");
    assert_eq!(TypedValue::float64(f64::INFINITY).to_string(), "+Inf");
    assert_eq!(TypedValue::rune('a').to_string(), "97");
}

#[test]
fn struct_display_lists_fields() {
    let s = TypedValue::new(
        Type::structure(
            "main",
            vec![FieldType::new("n", Type::int()), FieldType::new("s", Type::string())],
        ),
        Value::Object(ObjectRef::structure(vec![
            TypedValue::int(1),
            TypedValue::string("hi"),
        ])),
    );
    assert_eq!(s.to_string(), "{1 hi}");
}
