//! Universe builtins.
//!
//! Builtins run with their own call frame, like host functions, and finish
//! through [`Machine::pop_frame_and_return`].

use std::cell::RefCell;
use std::fmt::Write as _;
use std::rc::Rc;

use tracing::trace;

use realmvm_foundation::{
    ArrayValue, Builtin, Error, ObjectRef, PointerValue, Result, SliceValue, Type, TypedValue,
    Value,
};

use crate::machine::Machine;

fn arg(args: &[TypedValue], i: usize, b: Builtin) -> Result<TypedValue> {
    args.get(i)
        .cloned()
        .ok_or_else(|| Error::internal(format!("{} is missing argument {i}", b.name())))
}

fn type_arg(args: &[TypedValue], b: Builtin) -> Result<Type> {
    match arg(args, 0, b)?.v {
        Value::Type(t) => Ok(t),
        other => Err(Error::internal(format!(
            "{} expects a type, got {other:?}",
            b.name()
        ))),
    }
}

fn size_arg(args: &[TypedValue], i: usize, b: Builtin) -> Result<Option<usize>> {
    let Some(tv) = args.get(i) else {
        return Ok(None);
    };
    let n = tv.as_index()?;
    usize::try_from(n)
        .map(Some)
        .map_err(|_| Error::runtime(format!("{}: size out of range", b.name())))
}

impl Machine {
    pub(crate) fn call_builtin(
        &mut self,
        b: Builtin,
        args: Vec<TypedValue>,
        is_varg: bool,
    ) -> Result<()> {
        trace!(builtin = b.name(), args = args.len(), "builtin");
        match b {
            Builtin::Panic => {
                let value = args.into_iter().next().unwrap_or_else(TypedValue::undefined);
                self.pop_frame_and_return(Vec::new())?;
                self.start_panic(value)
            }
            Builtin::Recover => {
                let v = self.recover();
                self.pop_frame_and_return(vec![v])
            }
            Builtin::Len => {
                let n = arg(&args, 0, b)?.len()?;
                self.pop_frame_and_return(vec![int_of(n)])
            }
            Builtin::Cap => {
                let n = arg(&args, 0, b)?.cap()?;
                self.pop_frame_and_return(vec![int_of(n)])
            }
            Builtin::Append => {
                let v = self.append(args, is_varg)?;
                self.pop_frame_and_return(vec![v])
            }
            Builtin::Delete => {
                let m = arg(&args, 0, b)?;
                let k = arg(&args, 1, b)?;
                if let Value::Object(o @ ObjectRef::Map(_)) = &m.v {
                    self.map_delete(o, &k)?;
                }
                self.pop_frame_and_return(Vec::new())
            }
            Builtin::Print | Builtin::Println => {
                let mut line = String::new();
                for (i, a) in args.iter().enumerate() {
                    if i > 0 && b == Builtin::Println {
                        line.push(' ');
                    }
                    let _ = write!(line, "{a}");
                }
                if b == Builtin::Println {
                    line.push('\n');
                }
                self.write_output(&line);
                self.pop_frame_and_return(Vec::new())
            }
            Builtin::Make => {
                let t = type_arg(&args, b)?;
                let v = match t.base() {
                    Type::Slice(elem) => {
                        let len = size_arg(&args, 1, b)?.unwrap_or(0);
                        let cap = size_arg(&args, 2, b)?.unwrap_or(len);
                        if cap < len {
                            return Err(Error::runtime("makeslice: cap out of range"));
                        }
                        let list = (0..cap).map(|_| TypedValue::zero(elem)).collect();
                        let base = Rc::new(RefCell::new(ArrayValue {
                            list,
                            ..ArrayValue::default()
                        }));
                        Value::Slice(SliceValue {
                            base,
                            offset: 0,
                            len,
                            cap,
                        })
                    }
                    Type::Map(_) => Value::Object(ObjectRef::map()),
                    other => return Err(Error::internal(format!("cannot make {other}"))),
                };
                self.pop_frame_and_return(vec![TypedValue::new(t, v)])
            }
            Builtin::New => {
                let t = type_arg(&args, b)?;
                let item = ObjectRef::heap_item(TypedValue::zero(&t));
                let p = TypedValue::new(
                    Type::pointer(t),
                    Value::Pointer(PointerValue {
                        base: item,
                        index: 0,
                    }),
                );
                self.pop_frame_and_return(vec![p])
            }
            Builtin::Copy => {
                let dst = arg(&args, 0, b)?;
                let src = arg(&args, 1, b)?;
                let n = self.copy_elems(&dst, &src)?;
                self.pop_frame_and_return(vec![int_of(n)])
            }
        }
    }

    /// Recovers the active panic if called directly from a deferred call
    /// registered before the panic began.
    fn recover(&mut self) -> TypedValue {
        let Some(i) = self.call_frame_index(2) else {
            return TypedValue::undefined();
        };
        let fr = &self.frames[i];
        if !fr.is_defer || self.panic_scope <= fr.defer_panic_scope {
            return TypedValue::undefined();
        }
        let Some(last) = self.exceptions.last() else {
            return TypedValue::undefined();
        };
        let value = last.value.clone();
        trace!(scope = self.panic_scope, "recovered");
        self.exceptions.clear();
        value
    }

    /// Elements of a slice, array or string argument.
    fn elems_of(&mut self, x: &TypedValue) -> Result<Vec<TypedValue>> {
        match &x.v {
            Value::Slice(s) => {
                let base = s.base_object();
                (s.offset..s.offset + s.len)
                    .map(|i| self.load_slot(&base, i))
                    .collect()
            }
            Value::Object(o @ ObjectRef::Array(_)) => {
                let n = x.len()?;
                (0..n).map(|i| self.load_slot(o, i)).collect()
            }
            Value::String(s) => Ok(s
                .bytes()
                .map(|c| TypedValue::new(Type::byte(), Value::Uint(u64::from(c))))
                .collect()),
            Value::Nil => Ok(Vec::new()),
            _ => Err(Error::internal(format!("cannot spread {x}"))),
        }
    }

    fn append(&mut self, args: Vec<TypedValue>, is_varg: bool) -> Result<TypedValue> {
        let mut it = args.into_iter();
        let s = it
            .next()
            .ok_or_else(|| Error::internal("append without a slice"))?;
        let extra: Vec<TypedValue> = if is_varg {
            match it.next() {
                Some(spread) => self.elems_of(&spread)?,
                None => Vec::new(),
            }
        } else {
            it.collect()
        };
        if extra.is_empty() {
            return Ok(s);
        }
        let slice_t = s
            .t
            .clone()
            .ok_or_else(|| Error::internal("append to an untyped nil"))?;
        let (len, cap, base) = match &s.v {
            Value::Slice(sv) => (sv.len, sv.cap, Some(sv.clone())),
            Value::Nil => (0, 0, None),
            _ => return Err(Error::internal(format!("append to {s}"))),
        };
        let n = extra.len();

        // Fits: write through the shared backing array.
        if let Some(sv) = base.filter(|_| len + n <= cap) {
            let obj = sv.base_object();
            for (i, e) in extra.into_iter().enumerate() {
                self.assign_slot(&obj, sv.offset + len + i, e)?;
            }
            return Ok(TypedValue {
                t: Some(slice_t),
                v: Value::Slice(SliceValue { len: len + n, ..sv }),
            });
        }

        let mut list = self.elems_of(&s)?;
        for e in extra {
            list.push(e.copy(&mut *self.store)?);
        }
        let new_cap = (cap * 2).max(len + n);
        let elem = slice_t.elem().cloned().unwrap_or_else(Type::any);
        list.resize_with(new_cap, || TypedValue::zero(&elem));
        let base = Rc::new(RefCell::new(ArrayValue {
            list,
            ..ArrayValue::default()
        }));
        Ok(TypedValue {
            t: Some(slice_t),
            v: Value::Slice(SliceValue {
                base,
                offset: 0,
                len: len + n,
                cap: new_cap,
            }),
        })
    }

    fn copy_elems(&mut self, dst: &TypedValue, src: &TypedValue) -> Result<usize> {
        let Value::Slice(d) = &dst.v else {
            return Ok(0);
        };
        let elems = self.elems_of(src)?;
        let n = d.len.min(elems.len());
        let obj = d.base_object();
        for (i, e) in elems.into_iter().take(n).enumerate() {
            self.assign_slot(&obj, d.offset + i, e)?;
        }
        Ok(n)
    }
}

fn int_of(n: usize) -> TypedValue {
    TypedValue::int(i64::try_from(n).unwrap_or(i64::MAX))
}
