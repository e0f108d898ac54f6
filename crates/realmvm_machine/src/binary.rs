//! Arithmetic, comparison and conversion on typed values.
//!
//! These are pure functions of their operands; the machine pops the operands
//! and pushes the result. Integer results wrap to the width of the left
//! operand's type.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_precision_loss)]

use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;
use std::sync::Arc;

use realmvm_foundation::{
    ArrayValue, BinaryOp, Error, Kind, ObjectResolver, PrimitiveType, Result, SliceValue, Type,
    TypedValue, UnaryOp, Value, wrap_float, wrap_int, wrap_uint,
};

// =============================================================================
// Binary operators
// =============================================================================

/// Applies a non-short-circuit binary operator.
///
/// # Errors
///
/// Returns runtime errors for integer division by zero, negative shift
/// counts and uncomparable operands; internal errors for mismatched kinds.
pub fn binary_op<R: ObjectResolver + ?Sized>(
    op: BinaryOp,
    l: &TypedValue,
    r: &TypedValue,
    resolver: &mut R,
) -> Result<TypedValue> {
    match op {
        BinaryOp::Eql => Ok(TypedValue::bool(values_equal(l, r, resolver)?)),
        BinaryOp::Neq => Ok(TypedValue::bool(!values_equal(l, r, resolver)?)),
        BinaryOp::Lss => Ok(TypedValue::bool(l.compare(r)? == Ordering::Less)),
        BinaryOp::Leq => Ok(TypedValue::bool(l.compare(r)? != Ordering::Greater)),
        BinaryOp::Gtr => Ok(TypedValue::bool(l.compare(r)? == Ordering::Greater)),
        BinaryOp::Geq => Ok(TypedValue::bool(l.compare(r)? != Ordering::Less)),
        BinaryOp::Land => Ok(TypedValue::bool(l.as_bool()? && r.as_bool()?)),
        BinaryOp::Lor => Ok(TypedValue::bool(l.as_bool()? || r.as_bool()?)),
        BinaryOp::Shl | BinaryOp::Shr => shift(op, l, r),
        _ => arithmetic(op, l, r),
    }
}

/// Guest `==` where either side may be the untyped nil.
///
/// # Errors
///
/// Propagates uncomparable-type errors.
pub fn values_equal<R: ObjectResolver + ?Sized>(
    l: &TypedValue,
    r: &TypedValue,
    resolver: &mut R,
) -> Result<bool> {
    if l.is_undefined() {
        return Ok(r.v.is_nil());
    }
    if r.is_undefined() {
        return Ok(l.v.is_nil());
    }
    l.equals(r, resolver)
}

fn primitive_of(tv: &TypedValue) -> Result<PrimitiveType> {
    tv.t.as_ref()
        .and_then(Type::primitive)
        .ok_or_else(|| Error::internal("arithmetic on a non-primitive value"))
}

fn arithmetic(op: BinaryOp, l: &TypedValue, r: &TypedValue) -> Result<TypedValue> {
    let v = match (&l.v, &r.v) {
        (Value::Int(a), Value::Int(b)) => {
            Value::Int(wrap_int(primitive_of(l)?, int_op(op, *a, *b)?))
        }
        (Value::Uint(a), Value::Uint(b)) => {
            Value::Uint(wrap_uint(primitive_of(l)?, uint_op(op, *a, *b)?))
        }
        (Value::Float(a), Value::Float(b)) => {
            Value::Float(wrap_float(primitive_of(l)?, float_op(op, *a, *b)?))
        }
        (Value::String(a), Value::String(b)) if op == BinaryOp::Add => {
            let mut s = String::with_capacity(a.len() + b.len());
            s.push_str(a);
            s.push_str(b);
            Value::String(Arc::from(s))
        }
        _ => {
            return Err(Error::internal(format!(
                "invalid operation {op:?} on {l} and {r}"
            )));
        }
    };
    Ok(TypedValue { t: l.t.clone(), v })
}

fn int_op(op: BinaryOp, a: i64, b: i64) -> Result<i64> {
    Ok(match op {
        BinaryOp::Add => a.wrapping_add(b),
        BinaryOp::Sub => a.wrapping_sub(b),
        BinaryOp::Mul => a.wrapping_mul(b),
        BinaryOp::Quo => {
            if b == 0 {
                return Err(Error::runtime("integer divide by zero"));
            }
            a.wrapping_div(b)
        }
        BinaryOp::Rem => {
            if b == 0 {
                return Err(Error::runtime("integer divide by zero"));
            }
            a.wrapping_rem(b)
        }
        BinaryOp::Band => a & b,
        BinaryOp::Bor => a | b,
        BinaryOp::Xor => a ^ b,
        BinaryOp::Bandn => a & !b,
        _ => return Err(Error::internal(format!("{op:?} is not an integer operator"))),
    })
}

fn uint_op(op: BinaryOp, a: u64, b: u64) -> Result<u64> {
    Ok(match op {
        BinaryOp::Add => a.wrapping_add(b),
        BinaryOp::Sub => a.wrapping_sub(b),
        BinaryOp::Mul => a.wrapping_mul(b),
        BinaryOp::Quo => a
            .checked_div(b)
            .ok_or_else(|| Error::runtime("integer divide by zero"))?,
        BinaryOp::Rem => a
            .checked_rem(b)
            .ok_or_else(|| Error::runtime("integer divide by zero"))?,
        BinaryOp::Band => a & b,
        BinaryOp::Bor => a | b,
        BinaryOp::Xor => a ^ b,
        BinaryOp::Bandn => a & !b,
        _ => return Err(Error::internal(format!("{op:?} is not an integer operator"))),
    })
}

fn float_op(op: BinaryOp, a: f64, b: f64) -> Result<f64> {
    Ok(match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Quo => a / b,
        _ => return Err(Error::internal(format!("{op:?} is not a float operator"))),
    })
}

fn shift(op: BinaryOp, l: &TypedValue, r: &TypedValue) -> Result<TypedValue> {
    let n = r.as_index()?;
    if n < 0 {
        return Err(Error::runtime("negative shift amount"));
    }
    let n = n as u64;
    let p = primitive_of(l)?;
    let v = match (&l.v, op) {
        (Value::Int(a), BinaryOp::Shl) => {
            Value::Int(wrap_int(p, if n >= 64 { 0 } else { *a << n }))
        }
        (Value::Int(a), _) => Value::Int(if n >= 64 {
            if *a < 0 { -1 } else { 0 }
        } else {
            *a >> n
        }),
        (Value::Uint(a), BinaryOp::Shl) => {
            Value::Uint(wrap_uint(p, if n >= 64 { 0 } else { *a << n }))
        }
        (Value::Uint(a), _) => Value::Uint(if n >= 64 { 0 } else { *a >> n }),
        _ => return Err(Error::internal(format!("cannot shift {l}"))),
    };
    Ok(TypedValue { t: l.t.clone(), v })
}

// =============================================================================
// Unary operators
// =============================================================================

/// Applies a unary operator.
///
/// # Errors
///
/// Returns an internal error for operands of the wrong kind.
pub fn unary_op(op: UnaryOp, x: &TypedValue) -> Result<TypedValue> {
    let v = match (op, &x.v) {
        (UnaryOp::Pos, _) => return Ok(x.clone()),
        (UnaryOp::Neg, Value::Int(a)) => Value::Int(wrap_int(primitive_of(x)?, a.wrapping_neg())),
        (UnaryOp::Neg, Value::Uint(a)) => {
            Value::Uint(wrap_uint(primitive_of(x)?, a.wrapping_neg()))
        }
        (UnaryOp::Neg, Value::Float(a)) => Value::Float(-a),
        (UnaryOp::Not, Value::Bool(b)) => Value::Bool(!b),
        (UnaryOp::Xor, Value::Int(a)) => Value::Int(wrap_int(primitive_of(x)?, !a)),
        (UnaryOp::Xor, Value::Uint(a)) => Value::Uint(wrap_uint(primitive_of(x)?, !a)),
        _ => return Err(Error::internal(format!("invalid operation {op:?} on {x}"))),
    };
    Ok(TypedValue { t: x.t.clone(), v })
}

// =============================================================================
// Conversions
// =============================================================================

/// Converts `x` to type `t`.
///
/// # Errors
///
/// Returns an internal error for conversions the type checker would reject.
pub fn convert(t: &Type, x: TypedValue) -> Result<TypedValue> {
    if t.is_interface() {
        return Ok(x);
    }
    let target = t.base();
    let v = match (target, &x.v) {
        (Type::Primitive(p), v) if p.is_integer() || p.is_float() => numeric(*p, v)?,
        (Type::Primitive(PrimitiveType::String), Value::Int(c)) => {
            let c = u32::try_from(*c).ok().and_then(char::from_u32).unwrap_or('\u{FFFD}');
            Value::String(Arc::from(c.to_string()))
        }
        (Type::Primitive(PrimitiveType::String), Value::Uint(c)) => {
            let c = u32::try_from(*c).ok().and_then(char::from_u32).unwrap_or('\u{FFFD}');
            Value::String(Arc::from(c.to_string()))
        }
        (Type::Primitive(PrimitiveType::String), Value::Slice(s)) => {
            Value::String(Arc::from(slice_to_string(s, x.t.as_ref())?))
        }
        (Type::Primitive(PrimitiveType::String), Value::Nil)
            if x.kind() == Some(Kind::Slice) =>
        {
            Value::String(Arc::from(""))
        }
        (Type::Slice(elem), Value::String(s)) => string_to_slice(elem, s)?,
        _ => x.v,
    };
    Ok(TypedValue { t: Some(t.clone()), v })
}

fn numeric(p: PrimitiveType, v: &Value) -> Result<Value> {
    Ok(match *v {
        Value::Int(i) if p.is_signed() => Value::Int(wrap_int(p, i)),
        Value::Int(i) if p.is_unsigned() => Value::Uint(wrap_uint(p, i as u64)),
        Value::Int(i) => Value::Float(wrap_float(p, i as f64)),
        Value::Uint(u) if p.is_signed() => Value::Int(wrap_int(p, u as i64)),
        Value::Uint(u) if p.is_unsigned() => Value::Uint(wrap_uint(p, u)),
        Value::Uint(u) => Value::Float(wrap_float(p, u as f64)),
        Value::Float(f) if p.is_signed() => Value::Int(wrap_int(p, f as i64)),
        Value::Float(f) if p.is_unsigned() => Value::Uint(wrap_uint(p, f as u64)),
        Value::Float(f) => Value::Float(wrap_float(p, f)),
        ref other => {
            return Err(Error::internal(format!(
                "cannot convert {other:?} to {}",
                p.name()
            )));
        }
    })
}

fn slice_to_string(s: &SliceValue, t: Option<&Type>) -> Result<String> {
    let elem = t.and_then(Type::elem).and_then(Type::primitive);
    let a = s.base.borrow();
    let list = a
        .list
        .get(s.offset..s.offset + s.len)
        .ok_or_else(|| Error::internal("slice window exceeds its backing array"))?;
    match elem {
        Some(PrimitiveType::Int32) => Ok(list
            .iter()
            .map(|e| {
                u32::try_from(e.as_int().unwrap_or(-1))
                    .ok()
                    .and_then(char::from_u32)
                    .unwrap_or('\u{FFFD}')
            })
            .collect()),
        _ => {
            let bytes = list
                .iter()
                .map(|e| e.as_uint().map(|b| b as u8))
                .collect::<Result<Vec<u8>>>()?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
    }
}

fn string_to_slice(elem: &Type, s: &str) -> Result<Value> {
    let list: Vec<TypedValue> = match elem.primitive() {
        Some(PrimitiveType::Int32) => s
            .chars()
            .map(|c| TypedValue::new(elem.clone(), Value::Int(i64::from(u32::from(c)))))
            .collect(),
        Some(PrimitiveType::Uint8) => s
            .bytes()
            .map(|b| TypedValue::new(elem.clone(), Value::Uint(u64::from(b))))
            .collect(),
        _ => return Err(Error::internal(format!("cannot convert string to []{elem}"))),
    };
    Ok(new_slice(list))
}

/// Allocates a fresh backing array and a slice over all of it.
#[must_use]
pub fn new_slice(list: Vec<TypedValue>) -> Value {
    let len = list.len();
    Value::Slice(SliceValue {
        base: Rc::new(RefCell::new(ArrayValue {
            list,
            ..ArrayValue::default()
        })),
        offset: 0,
        len,
        cap: len,
    })
}
