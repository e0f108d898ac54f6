//! Variable access, assignment targets and tracked writes.
//!
//! Every write into an object slot goes through this module. The value is
//! copied first (arrays and structs have value semantics), then the realm is
//! told which object the slot stopped and started referencing, and only then
//! is the slot overwritten. A write the realm rejects leaves memory as it was.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use realmvm_foundation::{
    AssignStmt, BinaryOp, Block, Error, Expr, Kind, NameExpr, ObjectRef, Result, Selection, Stmt, Type,
    TypedValue, Value,
};

use crate::binary;
use crate::machine::Machine;

/// Where an assignment lands.
#[derive(Debug)]
pub(crate) enum Target {
    /// `_`
    Blank,
    /// Slot of an array, struct, block or heap item.
    Slot { obj: ObjectRef, index: usize },
    /// Entry of a map.
    MapEntry {
        map: ObjectRef,
        key: TypedValue,
        value_type: Option<Type>,
    },
}

pub(crate) fn nil_deref() -> Error {
    Error::runtime("invalid memory address or nil pointer dereference")
}

/// Bounds-checks an index operand.
pub(crate) fn check_index(index: &TypedValue, len: usize) -> Result<usize> {
    let i = index.as_index()?;
    usize::try_from(i)
        .ok()
        .filter(|i| *i < len)
        .ok_or_else(|| Error::runtime(format!("index out of range [{i}] with length {len}")))
}

fn is_nilable(t: &Type) -> bool {
    matches!(t.kind(), Kind::Pointer | Kind::Slice | Kind::Map | Kind::Func)
}

impl Machine {
    // =========================================================================
    // Reads
    // =========================================================================

    /// Reads slot `index` of `obj`, loading a persisted child in place.
    pub(crate) fn load_slot(&mut self, obj: &ObjectRef, index: usize) -> Result<TypedValue> {
        let tv = obj.get_slot(index)?;
        let Value::Ref(r) = &tv.v else {
            return Ok(tv);
        };
        let o = self.store.get_object(r.object_id)?;
        let loaded = TypedValue {
            t: tv.t.clone(),
            v: Value::Object(o),
        };
        obj.set_slot(index, loaded.clone())?;
        Ok(loaded)
    }

    /// Reads a variable, looking through its heap item.
    pub(crate) fn read_var(&mut self, block: &Rc<RefCell<Block>>, index: usize) -> Result<TypedValue> {
        let bo = ObjectRef::Block(block.clone());
        let slot = self.load_slot(&bo, index)?;
        match (&slot.t, &slot.v) {
            (Some(Type::HeapItem), Value::Object(item)) => self.load_slot(item, 0),
            _ => Ok(slot),
        }
    }

    /// Where a write to a variable lands: its heap item, or the block slot.
    pub(crate) fn var_target(&mut self, block: &Rc<RefCell<Block>>, index: usize) -> Result<Target> {
        let bo = ObjectRef::Block(block.clone());
        let slot = self.load_slot(&bo, index)?;
        match (&slot.t, &slot.v) {
            (Some(Type::HeapItem), Value::Object(item)) => Ok(Target::Slot {
                obj: item.clone(),
                index: 0,
            }),
            _ => Ok(Target::Slot { obj: bo, index }),
        }
    }

    /// The parent of a block, loading it if it is still a reference.
    pub(crate) fn parent_of(&mut self, block: &Rc<RefCell<Block>>) -> Result<Rc<RefCell<Block>>> {
        let parent = block.borrow().parent.clone();
        match parent {
            Value::Object(ObjectRef::Block(p)) => Ok(p),
            Value::Ref(r) => {
                let o = self.store.get_object(r.object_id)?;
                block.borrow_mut().parent = Value::Object(o.clone());
                match o {
                    ObjectRef::Block(p) => Ok(p),
                    other => Err(Error::internal(format!(
                        "block parent is a {}",
                        other.kind_name()
                    ))),
                }
            }
            _ => Err(Error::internal(format!(
                "block at {} has no parent",
                block.borrow().location
            ))),
        }
    }

    /// The block `depth` levels above the current one.
    pub(crate) fn block_at_depth(&mut self, depth: u16) -> Result<Rc<RefCell<Block>>> {
        let mut b = self.last_block()?;
        for _ in 0..depth {
            b = self.parent_of(&b)?;
        }
        Ok(b)
    }

    /// Reads the current value at a target.
    pub(crate) fn read_target(&mut self, target: &Target) -> Result<TypedValue> {
        match target {
            Target::Blank => Err(Error::internal("cannot read from _")),
            Target::Slot { obj, index } => self.load_slot(obj, *index),
            Target::MapEntry {
                map,
                key,
                value_type,
            } => Ok(match self.map_get(map, key)? {
                Some(v) => v,
                None => value_type
                    .as_ref()
                    .map_or_else(TypedValue::undefined, TypedValue::zero),
            }),
        }
    }

    /// Reads the pointee of a pointer.
    pub(crate) fn deref(&mut self, p: &TypedValue) -> Result<TypedValue> {
        match &p.v {
            Value::Pointer(pv) => self.load_slot(&pv.base, pv.index),
            Value::Nil => Err(nil_deref()),
            _ => Err(Error::internal(format!("cannot dereference {p}"))),
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Stores a value at a target.
    pub(crate) fn assign_target(&mut self, target: Target, tv: TypedValue) -> Result<()> {
        match target {
            Target::Blank => Ok(()),
            Target::Slot { obj, index } => self.assign_slot(&obj, index, tv),
            Target::MapEntry { map, key, .. } => self.map_set(&map, key, tv),
        }
    }

    /// Copies `tv` into slot `index` of `obj`.
    pub(crate) fn assign_slot(&mut self, obj: &ObjectRef, index: usize, tv: TypedValue) -> Result<()> {
        let mut tv = tv.copy(&mut *self.store)?;
        let old = obj.get_slot(index)?;
        if tv.is_undefined() {
            if let Some(t) = old.t.as_ref().filter(|t| is_nilable(t)) {
                tv.t = Some(t.clone());
            }
        }
        if obj.is_real() {
            let xo = old.first_object(&mut *self.store)?;
            let co = tv.first_object(&mut *self.store)?;
            self.did_update(obj, xo.as_ref(), co.as_ref())?;
        }
        obj.set_slot(index, tv)?;
        Ok(())
    }

    /// Writes through to a variable (into its heap item when captured).
    pub(crate) fn set_var(&mut self, block: &Rc<RefCell<Block>>, index: usize, tv: TypedValue) -> Result<()> {
        let target = self.var_target(block, index)?;
        self.assign_target(target, tv)
    }

    /// Defines a variable. Captured variables get a fresh heap item so
    /// closures from earlier definitions keep their own copy.
    pub(crate) fn define_var(&mut self, block: &Rc<RefCell<Block>>, index: usize, tv: TypedValue) -> Result<()> {
        let is_item = block.borrow().is_heap_item(index);
        let bo = ObjectRef::Block(block.clone());
        if !is_item {
            return self.assign_slot(&bo, index, tv);
        }
        let tv = tv.copy(&mut *self.store)?;
        let item = ObjectRef::heap_item(tv);
        if bo.is_real() {
            let old = bo.get_slot(index)?;
            let xo = old.first_object(&mut *self.store)?;
            self.did_update(&bo, xo.as_ref(), Some(&item))?;
        }
        bo.set_slot(index, TypedValue::new(Type::HeapItem, Value::Object(item)))?;
        Ok(())
    }

    pub(crate) fn define_name(&mut self, n: &NameExpr, tv: TypedValue) -> Result<()> {
        let block = self.block_at_depth(n.path.depth)?;
        self.define_var(&block, usize::from(n.path.index), tv)
    }

    /// Gives every captured variable of a loop block a fresh heap item
    /// holding its current value.
    pub(crate) fn refresh_heap_items(&mut self, block: &Rc<RefCell<Block>>) -> Result<()> {
        let n = block.borrow().values.len();
        for i in 0..n {
            if !block.borrow().is_heap_item(i) {
                continue;
            }
            let current = self.read_var(block, i)?;
            self.define_var(block, i, current)?;
        }
        Ok(())
    }

    // =========================================================================
    // Maps
    // =========================================================================

    pub(crate) fn map_get(&mut self, map: &ObjectRef, key: &TypedValue) -> Result<Option<TypedValue>> {
        let ObjectRef::Map(m) = map else {
            return Err(Error::internal(format!("{} is not a map", map.kind_name())));
        };
        let mk = key.map_key()?;
        let found = m.borrow().get(&mk).cloned();
        let Some(tv) = found else {
            return Ok(None);
        };
        let Value::Ref(r) = &tv.v else {
            return Ok(Some(tv));
        };
        let o = self.store.get_object(r.object_id)?;
        let loaded = TypedValue {
            t: tv.t.clone(),
            v: Value::Object(o),
        };
        if let Some(entry) = m.borrow_mut().entries.get_mut(&mk) {
            entry.1 = loaded.clone();
        }
        Ok(Some(loaded))
    }

    pub(crate) fn map_set(&mut self, map: &ObjectRef, key: TypedValue, value: TypedValue) -> Result<()> {
        let ObjectRef::Map(m) = map else {
            return Err(Error::internal(format!("{} is not a map", map.kind_name())));
        };
        let key = key.copy(&mut *self.store)?;
        let value = value.copy(&mut *self.store)?;
        let mk = key.map_key()?;
        if map.is_real() {
            let old = m.borrow().get(&mk).cloned();
            let xo = match &old {
                Some(tv) => tv.first_object(&mut *self.store)?,
                None => None,
            };
            let co = value.first_object(&mut *self.store)?;
            self.did_update(map, xo.as_ref(), co.as_ref())?;
            if old.is_none() {
                if let Some(ko) = key.first_object(&mut *self.store)? {
                    self.did_update(map, None, Some(&ko))?;
                }
            }
        }
        m.borrow_mut().set(mk, key, value);
        Ok(())
    }

    /// Writes back map contents produced by a host function.
    pub(crate) fn sync_map(
        &mut self,
        map: &ObjectRef,
        entries: Vec<(TypedValue, TypedValue)>,
    ) -> Result<()> {
        let ObjectRef::Map(m) = map else {
            return Err(Error::internal(format!("{} is not a map", map.kind_name())));
        };
        let keys = entries
            .iter()
            .map(|(k, _)| k.map_key())
            .collect::<Result<Vec<_>>>()?;
        m.borrow().check_sync(&keys)?;
        for (k, v) in entries {
            self.map_set(map, k, v)?;
        }
        Ok(())
    }

    pub(crate) fn map_delete(&mut self, map: &ObjectRef, key: &TypedValue) -> Result<()> {
        let ObjectRef::Map(m) = map else {
            return Err(Error::internal(format!("{} is not a map", map.kind_name())));
        };
        let mk = key.map_key()?;
        let entry = m.borrow().entries.get(&mk).cloned();
        let Some((k, v)) = entry else {
            return Ok(());
        };
        if map.is_real() {
            let vo = v.first_object(&mut *self.store)?;
            self.did_update(map, vo.as_ref(), None)?;
            if let Some(ko) = k.first_object(&mut *self.store)? {
                self.did_update(map, Some(&ko), None)?;
            }
        }
        m.borrow_mut().delete(&mk);
        Ok(())
    }

    // =========================================================================
    // Assignment targets
    // =========================================================================

    /// Schedules evaluation of the operands an assignable expression needs.
    pub(crate) fn push_for_pointer(&mut self, lx: &Expr) -> Result<()> {
        match lx {
            Expr::Name(_) | Expr::Blank => {}
            Expr::Index(ix) => {
                self.push_eval(&ix.index);
                self.push_eval(&ix.x);
            }
            Expr::Selector(sx) => self.push_eval(&sx.x),
            Expr::Star(x) => self.push_eval(x),
            Expr::CompositeLit(_) => self.push_eval(lx),
            _ => return Err(Error::internal("expression is not assignable")),
        }
        Ok(())
    }

    /// Pops the operands pushed for `lx` and returns where it points.
    pub(crate) fn pop_as_pointer(&mut self, lx: &Expr) -> Result<Target> {
        match lx {
            Expr::Blank => Ok(Target::Blank),
            Expr::Name(n) => {
                let block = self.block_at_depth(n.path.depth)?;
                self.var_target(&block, usize::from(n.path.index))
            }
            Expr::Index(_) => {
                let index = self.pop_value()?;
                let x = self.pop_value()?;
                self.index_target(&x, index)
            }
            Expr::Selector(sx) => {
                let Selection::Field(i) = sx.sel else {
                    return Err(Error::internal("cannot assign to a method value"));
                };
                let x = self.pop_value()?;
                let obj = self.struct_object(&x)?;
                Ok(Target::Slot { obj, index: i })
            }
            Expr::Star(_) => {
                let p = self.pop_value()?;
                match p.v {
                    Value::Pointer(pv) => Ok(Target::Slot {
                        obj: pv.base,
                        index: pv.index,
                    }),
                    Value::Nil => Err(nil_deref()),
                    _ => Err(Error::internal(format!("cannot dereference {p}"))),
                }
            }
            Expr::CompositeLit(_) => {
                let v = self.pop_value()?;
                Ok(Target::Slot {
                    obj: ObjectRef::heap_item(v),
                    index: 0,
                })
            }
            _ => Err(Error::internal("expression is not assignable")),
        }
    }

    fn index_target(&mut self, x: &TypedValue, index: TypedValue) -> Result<Target> {
        match &x.v {
            Value::Object(ObjectRef::Array(a)) => {
                let len = a.borrow().list.len();
                let i = check_index(&index, len)?;
                Ok(Target::Slot {
                    obj: ObjectRef::Array(a.clone()),
                    index: i,
                })
            }
            Value::Slice(s) => {
                let i = check_index(&index, s.len)?;
                Ok(Target::Slot {
                    obj: s.base_object(),
                    index: s.offset + i,
                })
            }
            Value::Object(map @ ObjectRef::Map(_)) => Ok(Target::MapEntry {
                map: map.clone(),
                key: index,
                value_type: x.t.as_ref().and_then(Type::elem).cloned(),
            }),
            Value::Pointer(_) => {
                let arr = self.deref(x)?;
                self.index_target(&arr, index)
            }
            Value::Nil => match x.kind() {
                Some(Kind::Map) => Err(Error::runtime("assignment to entry in nil map")),
                Some(Kind::Slice) => Err(Error::runtime(format!(
                    "index out of range [{}] with length 0",
                    index.as_index()?
                ))),
                _ => Err(nil_deref()),
            },
            _ => Err(Error::internal(format!("cannot index {x}"))),
        }
    }

    /// The struct object behind a struct value or a pointer to one.
    pub(crate) fn struct_object(&mut self, x: &TypedValue) -> Result<ObjectRef> {
        match &x.v {
            Value::Object(o @ ObjectRef::Struct(_)) => Ok(o.clone()),
            Value::Pointer(_) => {
                let s = self.deref(x)?;
                match s.v {
                    Value::Object(o @ ObjectRef::Struct(_)) => Ok(o),
                    _ => Err(Error::internal(format!("pointee {s} is not a struct"))),
                }
            }
            Value::Nil => Err(nil_deref()),
            _ => Err(Error::internal(format!("{x} is not a struct"))),
        }
    }

    // =========================================================================
    // Assignment ops
    // =========================================================================

    fn pop_assign_stmt(&mut self) -> Result<Arc<AssignStmt>> {
        match self.pop_stmt()? {
            Stmt::Assign(s) => Ok(s),
            other => Err(Error::internal(format!(
                "expected an assignment, found {other:?}"
            ))),
        }
    }

    pub(crate) fn do_assign(&mut self) -> Result<()> {
        let s = self.pop_assign_stmt()?;
        let values = self.pop_values(s.lhs.len())?;
        let mut targets = Vec::with_capacity(s.lhs.len());
        for lx in s.lhs.iter().rev() {
            targets.push(self.pop_as_pointer(lx)?);
        }
        targets.reverse();
        for (target, v) in targets.into_iter().zip(values) {
            self.assign_target(target, v)?;
        }
        Ok(())
    }

    pub(crate) fn do_define(&mut self) -> Result<()> {
        let s = self.pop_assign_stmt()?;
        let values = self.pop_values(s.lhs.len())?;
        for (lx, v) in s.lhs.iter().zip(values) {
            match lx {
                Expr::Blank => {}
                Expr::Name(n) => self.define_name(n, v)?,
                _ => return Err(Error::internal("cannot define a non-name")),
            }
        }
        Ok(())
    }

    pub(crate) fn do_assign_op(&mut self, op: BinaryOp) -> Result<()> {
        let s = self.pop_assign_stmt()?;
        let rhs = self.pop_value()?;
        let lx = s
            .lhs
            .first()
            .ok_or_else(|| Error::internal("assignment without a target"))?;
        let target = self.pop_as_pointer(lx)?;
        let cur = self.read_target(&target)?;
        let result = binary::binary_op(op, &cur, &rhs, &mut *self.store)?;
        self.assign_target(target, result)
    }

    pub(crate) fn do_inc_dec(&mut self, inc: bool) -> Result<()> {
        let Stmt::IncDec(s) = self.pop_stmt()? else {
            return Err(Error::internal("expected an inc/dec statement"));
        };
        let target = self.pop_as_pointer(&s.x)?;
        let cur = self.read_target(&target)?;
        let one = match cur.v {
            Value::Int(_) => Value::Int(1),
            Value::Uint(_) => Value::Uint(1),
            Value::Float(_) => Value::Float(1.0),
            _ => return Err(Error::internal(format!("cannot increment {cur}"))),
        };
        let one = TypedValue {
            t: cur.t.clone(),
            v: one,
        };
        let op = if inc { BinaryOp::Add } else { BinaryOp::Sub };
        let result = binary::binary_op(op, &cur, &one, &mut *self.store)?;
        self.assign_target(target, result)
    }

    pub(crate) fn do_value_decl(&mut self) -> Result<()> {
        let Stmt::ValueDecl(d) = self.pop_stmt()? else {
            return Err(Error::internal("expected a var declaration"));
        };
        let values = self.pop_values(d.names.len())?;
        for (n, mut v) in d.names.iter().zip(values) {
            if v.is_undefined() {
                if let Some(t) = d.ty.as_ref().filter(|t| !t.is_interface()) {
                    v.t = Some(t.clone());
                }
            }
            self.define_name(n, v)?;
        }
        Ok(())
    }
}
