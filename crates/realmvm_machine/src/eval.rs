//! Expression evaluation.
//!
//! `Eval` pops one expression and either pushes its value directly (names,
//! constants, literals without operands) or schedules operand evaluations
//! followed by the op that combines them. Operands are pushed in reverse so
//! they evaluate left to right.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use realmvm_foundation::{
    BinaryOp, BoundMethodValue, Builtin, CompositeElts, ConstExpr, Constant, Error, Expr,
    FuncType, FuncValue, Kind, ObjectInfo, ObjectRef, PointerValue, Result, Selection, SliceValue,
    Type, TypedValue, UnaryOp, Value,
};

use crate::assign::{Target, check_index, nil_deref};
use crate::binary;
use crate::machine::Machine;
use crate::op::Op;

fn const_value(c: &ConstExpr) -> TypedValue {
    let v = match &c.value {
        Constant::Nil => Value::Nil,
        Constant::Bool(b) => Value::Bool(*b),
        Constant::Int(i) => Value::Int(*i),
        Constant::Uint(u) => Value::Uint(*u),
        Constant::Float(f) => Value::Float(*f),
        Constant::String(s) => Value::String(s.clone()),
    };
    TypedValue { t: c.ty.clone(), v }
}

/// Function value for a universe builtin.
pub(crate) fn builtin_value(b: Builtin) -> TypedValue {
    let ft = FuncType::new(Vec::new(), Vec::new()).with_variadic();
    let fv = FuncValue::builtin(b, ft.clone());
    TypedValue::new(Type::func(ft), Value::Object(ObjectRef::func(fv)))
}

fn bounds_error(low: usize, high: usize, cap: usize) -> Error {
    Error::runtime(format!(
        "slice bounds out of range [{low}:{high}] with capacity {cap}"
    ))
}

fn to_usize(i: i64) -> Result<usize> {
    usize::try_from(i).map_err(|_| Error::runtime(format!("index out of range [{i}]")))
}

impl Machine {
    pub(crate) fn do_eval(&mut self) -> Result<()> {
        let x = self.pop_expr()?;
        match &x {
            Expr::Const(c) => self.push_value(const_value(c)),
            Expr::Name(n) => {
                let block = self.block_at_depth(n.path.depth)?;
                let v = self.read_var(&block, usize::from(n.path.index))?;
                self.push_value(v);
            }
            Expr::Blank => return Err(Error::internal("cannot evaluate _")),
            Expr::Builtin(b) => self.push_value(builtin_value(*b)),
            Expr::PkgMember(pm) => {
                let pkg = self.require_package(&pm.pkg_path)?;
                let index = match &pkg {
                    ObjectRef::Package(p) => p.borrow().index_of(&pm.name),
                    _ => None,
                }
                .ok_or_else(|| {
                    Error::internal(format!("{}.{} is not declared", pm.pkg_path, pm.name))
                })?;
                let block = self.package_block(&pkg)?;
                let v = self.read_var(&block, index)?;
                self.push_value(v);
            }
            Expr::Binary(bx) => {
                if bx.op.is_short_circuit() {
                    self.push_expr(x.clone());
                    self.push_op(Op::Binary1);
                    self.push_eval(&bx.left);
                } else {
                    self.push_op(Op::Binary(bx.op));
                    self.push_eval(&bx.right);
                    self.push_eval(&bx.left);
                }
            }
            Expr::Unary(ux) => {
                self.push_op(Op::Unary(ux.op));
                self.push_eval(&ux.x);
            }
            Expr::Call(cx) => {
                self.push_expr(x.clone());
                self.push_op(Op::Precall);
                for a in cx.args.iter().rev() {
                    self.push_eval(a);
                }
                self.push_eval(&cx.func);
            }
            Expr::Index(ix) => {
                self.push_op(Op::Index);
                self.push_eval(&ix.index);
                self.push_eval(&ix.x);
            }
            Expr::Slice(sx) => {
                self.push_expr(x.clone());
                self.push_op(Op::Slice);
                if let Some(high) = &sx.high {
                    self.push_eval(high);
                }
                if let Some(low) = &sx.low {
                    self.push_eval(low);
                }
                self.push_eval(&sx.x);
            }
            Expr::Selector(sx) => match &sx.sel {
                Selection::Field(i) => {
                    self.push_op(Op::SelectField(*i));
                    self.push_eval(&sx.x);
                }
                Selection::Method(_) => {
                    self.push_expr(x.clone());
                    self.push_op(Op::SelectMethod);
                    self.push_eval(&sx.x);
                }
            },
            Expr::Star(inner) => {
                self.push_op(Op::Star);
                self.push_eval(inner);
            }
            Expr::Ref(inner) => {
                self.push_expr(x.clone());
                self.push_op(Op::Ref);
                self.push_for_pointer(inner)?;
            }
            Expr::CompositeLit(cl) => {
                self.push_expr(x.clone());
                self.push_op(Op::CompositeLit);
                match &cl.elts {
                    CompositeElts::Sequence(elts) => {
                        for e in elts.iter().rev() {
                            self.push_eval(e);
                        }
                    }
                    CompositeElts::Fields(fields) => {
                        for (_, e) in fields.iter().rev() {
                            self.push_eval(e);
                        }
                    }
                    CompositeElts::Pairs(pairs) => {
                        for (k, v) in pairs.iter().rev() {
                            self.push_eval(v);
                            self.push_eval(k);
                        }
                    }
                }
            }
            Expr::FuncLit(fl) => {
                self.store.register_func_source(fl.source.clone())?;
                let mut captures = Vec::with_capacity(fl.captures.len());
                for n in &fl.captures {
                    let block = self.block_at_depth(n.path.depth)?;
                    let bo = ObjectRef::Block(block);
                    captures.push(self.load_slot(&bo, usize::from(n.path.index))?);
                }
                let parent = self.last_block_value()?;
                let mut fv = FuncValue::from_source(fl.source.clone(), parent);
                fv.captures = captures;
                let t = Type::Func(fl.source.ty.clone());
                self.push_value(TypedValue::new(t, Value::Object(ObjectRef::func(fv))));
            }
            Expr::Type(t) => self.push_value(TypedValue::type_value(t.clone())),
        }
        Ok(())
    }

    // =========================================================================
    // Operators
    // =========================================================================

    /// Left operand of `&&` / `||` is on the stack; decide whether the right
    /// one runs.
    pub(crate) fn do_binary1(&mut self) -> Result<()> {
        let Expr::Binary(bx) = self.pop_expr()? else {
            return Err(Error::internal("expected a binary expression"));
        };
        let l = self.pop_value()?;
        let short = match bx.op {
            BinaryOp::Land => !l.as_bool()?,
            BinaryOp::Lor => l.as_bool()?,
            op => return Err(Error::internal(format!("{op:?} does not short-circuit"))),
        };
        if short {
            self.push_value(l);
        } else {
            self.push_eval(&bx.right);
        }
        Ok(())
    }

    pub(crate) fn do_binary(&mut self, op: BinaryOp) -> Result<()> {
        let r = self.pop_value()?;
        let l = self.pop_value()?;
        let v = binary::binary_op(op, &l, &r, &mut *self.store)?;
        self.push_value(v);
        Ok(())
    }

    pub(crate) fn do_unary(&mut self, op: UnaryOp) -> Result<()> {
        let x = self.pop_value()?;
        let v = binary::unary_op(op, &x)?;
        self.push_value(v);
        Ok(())
    }

    pub(crate) fn do_convert(&mut self) -> Result<()> {
        let x = self.pop_value()?;
        let t = match self.pop_value()?.v {
            Value::Type(t) => t,
            other => return Err(Error::internal(format!("cannot convert to {other:?}"))),
        };
        let v = binary::convert(&t, x)?;
        self.push_value(v);
        Ok(())
    }

    // =========================================================================
    // Indexing and slicing
    // =========================================================================

    pub(crate) fn do_index(&mut self) -> Result<()> {
        let index = self.pop_value()?;
        let x = self.pop_value()?;
        let v = self.index_value(&x, &index)?;
        self.push_value(v);
        Ok(())
    }

    fn index_value(&mut self, x: &TypedValue, index: &TypedValue) -> Result<TypedValue> {
        let zero_elem = || {
            x.t.as_ref()
                .and_then(Type::elem)
                .map_or_else(TypedValue::undefined, TypedValue::zero)
        };
        match &x.v {
            Value::String(s) => {
                let i = check_index(index, s.len())?;
                Ok(TypedValue::new(
                    Type::byte(),
                    Value::Uint(u64::from(s.as_bytes()[i])),
                ))
            }
            Value::Object(o @ ObjectRef::Array(_)) => {
                let i = check_index(index, x.len()?)?;
                self.load_slot(o, i)
            }
            Value::Slice(s) => {
                let i = check_index(index, s.len)?;
                self.load_slot(&s.base_object(), s.offset + i)
            }
            Value::Object(o @ ObjectRef::Map(_)) => {
                Ok(self.map_get(o, index)?.unwrap_or_else(zero_elem))
            }
            Value::Pointer(_) => {
                let arr = self.deref(x)?;
                self.index_value(&arr, index)
            }
            Value::Nil => match x.kind() {
                Some(Kind::Map) => Ok(zero_elem()),
                Some(Kind::Slice) => {
                    check_index(index, 0).map(|_| TypedValue::undefined())
                }
                _ => Err(nil_deref()),
            },
            _ => Err(Error::internal(format!("cannot index {x}"))),
        }
    }

    pub(crate) fn do_slice(&mut self) -> Result<()> {
        let Expr::Slice(sx) = self.pop_expr()? else {
            return Err(Error::internal("expected a slice expression"));
        };
        let high = match sx.high {
            Some(_) => Some(to_usize(self.pop_value()?.as_index()?)?),
            None => None,
        };
        let low = match sx.low {
            Some(_) => to_usize(self.pop_value()?.as_index()?)?,
            None => 0,
        };
        let x = self.pop_value()?;
        let v = self.slice_value(x, low, high)?;
        self.push_value(v);
        Ok(())
    }

    fn slice_value(&mut self, x: TypedValue, low: usize, high: Option<usize>) -> Result<TypedValue> {
        match &x.v {
            Value::String(s) => {
                let high = high.unwrap_or(s.len());
                if low > high || high > s.len() {
                    return Err(bounds_error(low, high, s.len()));
                }
                let sub = String::from_utf8_lossy(&s.as_bytes()[low..high]).into_owned();
                Ok(TypedValue {
                    t: x.t.clone(),
                    v: Value::String(Arc::from(sub)),
                })
            }
            Value::Slice(s) => {
                let high = high.unwrap_or(s.len);
                if low > high || high > s.cap {
                    return Err(bounds_error(low, high, s.cap));
                }
                Ok(TypedValue {
                    t: x.t.clone(),
                    v: Value::Slice(SliceValue {
                        base: s.base.clone(),
                        offset: s.offset + low,
                        len: high - low,
                        cap: s.cap - low,
                    }),
                })
            }
            Value::Object(ObjectRef::Array(a)) => {
                let len = a.borrow().list.len();
                let high = high.unwrap_or(len);
                if low > high || high > len {
                    return Err(bounds_error(low, high, len));
                }
                let elem = x
                    .t
                    .as_ref()
                    .and_then(Type::elem)
                    .cloned()
                    .ok_or_else(|| Error::internal("array value without an element type"))?;
                Ok(TypedValue::new(
                    Type::slice(elem),
                    Value::Slice(SliceValue {
                        base: a.clone(),
                        offset: low,
                        len: high - low,
                        cap: len - low,
                    }),
                ))
            }
            Value::Pointer(_) => {
                let arr = self.deref(&x)?;
                self.slice_value(arr, low, high)
            }
            Value::Nil => {
                let high = high.unwrap_or(0);
                if low > 0 || high > 0 {
                    return Err(bounds_error(low, high, 0));
                }
                Ok(x)
            }
            _ => Err(Error::internal(format!("cannot slice {x}"))),
        }
    }

    // =========================================================================
    // Selectors and pointers
    // =========================================================================

    pub(crate) fn do_select_field(&mut self, index: usize) -> Result<()> {
        let x = self.pop_value()?;
        let obj = self.struct_object(&x)?;
        let v = self.load_slot(&obj, index)?;
        self.push_value(v);
        Ok(())
    }

    /// Binds a method to its receiver.
    pub(crate) fn do_select_method(&mut self) -> Result<()> {
        let Expr::Selector(sx) = self.pop_expr()? else {
            return Err(Error::internal("expected a selector"));
        };
        let Selection::Method(source) = &sx.sel else {
            return Err(Error::internal("expected a method selector"));
        };
        let receiver = self.pop_value()?;
        let func = FuncValue::from_source(source.clone(), Value::Nil);
        let t = Type::Func(source.ty.clone());
        let bm = BoundMethodValue {
            info: ObjectInfo::default(),
            func: Value::Object(ObjectRef::func(func)),
            receiver,
        };
        self.push_value(TypedValue::new(
            t,
            Value::Object(ObjectRef::BoundMethod(Rc::new(RefCell::new(bm)))),
        ));
        Ok(())
    }

    pub(crate) fn do_star(&mut self) -> Result<()> {
        let p = self.pop_value()?;
        let v = self.deref(&p)?;
        self.push_value(v);
        Ok(())
    }

    pub(crate) fn do_ref(&mut self) -> Result<()> {
        let Expr::Ref(inner) = self.pop_expr()? else {
            return Err(Error::internal("expected an address-of expression"));
        };
        let (obj, index) = match self.pop_as_pointer(&inner)? {
            Target::Slot { obj, index } => (obj, index),
            Target::MapEntry { .. } => {
                return Err(Error::internal("cannot take the address of a map entry"));
            }
            Target::Blank => return Err(Error::internal("cannot take the address of _")),
        };
        let pointee = self.load_slot(&obj, index)?;
        let t = Type::pointer(pointee.t.unwrap_or_else(Type::any));
        self.push_value(TypedValue::new(
            t,
            Value::Pointer(PointerValue { base: obj, index }),
        ));
        Ok(())
    }

    // =========================================================================
    // Composite literals
    // =========================================================================

    pub(crate) fn do_composite_lit(&mut self) -> Result<()> {
        let Expr::CompositeLit(cl) = self.pop_expr()? else {
            return Err(Error::internal("expected a composite literal"));
        };
        let v = match (&cl.elts, cl.ty.base()) {
            (CompositeElts::Sequence(elts), Type::Array(at)) => {
                let values = self.pop_copies(elts.len())?;
                let mut list: Vec<TypedValue> = (0..at.len).map(|_| TypedValue::zero(&at.elem)).collect();
                for (slot, v) in list.iter_mut().zip(values) {
                    *slot = v;
                }
                Value::Object(ObjectRef::array(list))
            }
            (CompositeElts::Fields(fields), Type::Array(at)) => {
                let values = self.pop_copies(fields.len())?;
                let mut list: Vec<TypedValue> = (0..at.len).map(|_| TypedValue::zero(&at.elem)).collect();
                for ((i, _), v) in fields.iter().zip(values) {
                    let slot = list
                        .get_mut(*i)
                        .ok_or_else(|| Error::internal(format!("array index {i} out of bounds")))?;
                    *slot = v;
                }
                Value::Object(ObjectRef::array(list))
            }
            (CompositeElts::Sequence(elts), Type::Slice(_)) => {
                let values = self.pop_copies(elts.len())?;
                binary::new_slice(values)
            }
            (CompositeElts::Fields(fields), Type::Slice(elem)) => {
                let values = self.pop_copies(fields.len())?;
                let len = fields.iter().map(|(i, _)| i + 1).max().unwrap_or(0);
                let mut list: Vec<TypedValue> = (0..len).map(|_| TypedValue::zero(elem)).collect();
                for ((i, _), v) in fields.iter().zip(values) {
                    list[*i] = v;
                }
                binary::new_slice(list)
            }
            (CompositeElts::Sequence(elts), Type::Struct(st)) => {
                let values = self.pop_copies(elts.len())?;
                let mut fields: Vec<TypedValue> = st.fields.iter().map(|f| TypedValue::zero(&f.ty)).collect();
                for (slot, v) in fields.iter_mut().zip(values) {
                    *slot = v;
                }
                Value::Object(ObjectRef::structure(fields))
            }
            (CompositeElts::Fields(given), Type::Struct(st)) => {
                let values = self.pop_copies(given.len())?;
                let mut fields: Vec<TypedValue> = st.fields.iter().map(|f| TypedValue::zero(&f.ty)).collect();
                for ((i, _), v) in given.iter().zip(values) {
                    let slot = fields
                        .get_mut(*i)
                        .ok_or_else(|| Error::internal(format!("struct has no field {i}")))?;
                    *slot = v;
                }
                Value::Object(ObjectRef::structure(fields))
            }
            (CompositeElts::Pairs(pairs), Type::Map(_)) => {
                let values = self.pop_copies(pairs.len() * 2)?;
                let map = ObjectRef::map();
                if let ObjectRef::Map(m) = &map {
                    let mut m = m.borrow_mut();
                    for kv in values.chunks(2) {
                        let (k, v) = (kv[0].clone(), kv[1].clone());
                        m.set(k.map_key()?, k, v);
                    }
                }
                Value::Object(map)
            }
            (elts, t) => {
                return Err(Error::internal(format!(
                    "cannot build {t} from {} elements",
                    match elts {
                        CompositeElts::Sequence(_) => "positional",
                        CompositeElts::Fields(_) => "keyed",
                        CompositeElts::Pairs(_) => "key/value",
                    }
                )));
            }
        };
        self.push_value(TypedValue::new(cl.ty.clone(), v));
        Ok(())
    }

    /// Pops `n` values and copies each one.
    fn pop_copies(&mut self, n: usize) -> Result<Vec<TypedValue>> {
        let values = self.pop_values(n)?;
        values
            .iter()
            .map(|v| v.copy(&mut *self.store))
            .collect()
    }
}
