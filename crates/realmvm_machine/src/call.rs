//! Calls, returns, deferred calls and panics.
//!
//! A call is three ops: `Precall` inspects the callee and pushes a call
//! frame, `Call` builds the function block and starts the body, and one of
//! the return ops hands the results back. Results either sit on the value
//! stack (`Return`) or in the named result slots of the function block
//! (`ReturnFromBlock`); `ReturnToBlock` moves the former into the latter so
//! deferred calls can observe and change them.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use realmvm_foundation::{
    Block, BodyCursor, Error, ErrorKind, Expr, FuncType, NativeRef, ObjectRef, Result, Stmt,
    TypedValue, Value,
};

use crate::assign::nil_deref;
use crate::binary;
use crate::frame::{Exception, Frame};
use crate::machine::Machine;
use crate::op::Op;

/// True for realm package paths: the second path segment is `r`.
///
/// `gno.land/r/demo/boards` is a realm, `gno.land/p/demo/avl` is not.
#[must_use]
pub fn is_realm_path(pkg_path: &str) -> bool {
    pkg_path.split('/').nth(1) == Some("r")
}

/// Writes a fresh local, looking through heap items.
fn set_local(block: &mut Block, index: usize, tv: TypedValue) -> Result<()> {
    if block.is_heap_item(index) {
        if let Value::Object(ObjectRef::HeapItem(h)) = &block.slot(index)?.v {
            h.borrow_mut().value = tv;
            return Ok(());
        }
    }
    let slot = block
        .values
        .get_mut(index)
        .ok_or_else(|| Error::internal(format!("no slot {index} in function block")))?;
    *slot = tv;
    Ok(())
}

impl Machine {
    // =========================================================================
    // Call
    // =========================================================================

    pub(crate) fn do_precall(&mut self) -> Result<()> {
        let Expr::Call(cx) = self.pop_expr()? else {
            return Err(Error::internal("expected a call expression"));
        };
        self.begin_call(cx.num_args, cx.varg, false, 0)
    }

    /// Starts a call whose callee and `num_args` arguments are on the value
    /// stack.
    pub(crate) fn begin_call(
        &mut self,
        num_args: usize,
        is_varg: bool,
        is_defer: bool,
        defer_scope: u64,
    ) -> Result<()> {
        let callee = self.peek_value(num_args + 1)?.clone();
        match &callee.v {
            Value::Object(ObjectRef::Func(fv)) => {
                let (ft, pkg_path) = {
                    let f = fv.borrow();
                    (f.ty.clone(), f.pkg_path.clone())
                };
                let func = ObjectRef::Func(fv.clone());
                self.push_call_frame(func, ft, None, num_args, is_varg, &pkg_path)?;
            }
            Value::Object(ObjectRef::BoundMethod(bm)) => {
                let (func, receiver) = {
                    let b = bm.borrow();
                    (b.func.clone(), b.receiver.clone())
                };
                let func = match func {
                    Value::Object(o) => o,
                    Value::Ref(r) => {
                        let o = self.store.get_object(r.object_id)?;
                        bm.borrow_mut().func = Value::Object(o.clone());
                        o
                    }
                    other => return Err(Error::internal(format!("bound method over {other:?}"))),
                };
                let receiver = match &receiver.v {
                    Value::Ref(_) => {
                        let v = receiver.v.resolved(&mut *self.store)?;
                        let tv = TypedValue { t: receiver.t.clone(), v };
                        bm.borrow_mut().receiver = tv.clone();
                        tv
                    }
                    _ => receiver,
                };
                let (ft, pkg_path) = match &func {
                    ObjectRef::Func(fv) => {
                        let f = fv.borrow();
                        (f.ty.clone(), f.pkg_path.clone())
                    }
                    other => {
                        return Err(Error::internal(format!(
                            "bound method over a {}",
                            other.kind_name()
                        )));
                    }
                };
                self.push_call_frame(func, ft, Some(receiver), num_args, is_varg, &pkg_path)?;
            }
            Value::Type(_) => {
                if num_args != 1 {
                    return Err(Error::internal("conversion takes one argument"));
                }
                self.push_op(Op::Convert);
                return Ok(());
            }
            Value::Nil => return Err(nil_deref()),
            _ => return Err(Error::internal(format!("cannot call {callee}"))),
        }
        if is_defer {
            let fr = self.last_frame_mut()?;
            fr.is_defer = true;
            fr.defer_panic_scope = defer_scope;
        }
        self.push_op(Op::Call);
        Ok(())
    }

    fn push_call_frame(
        &mut self,
        func: ObjectRef,
        ft: Arc<FuncType>,
        receiver: Option<TypedValue>,
        num_args: usize,
        is_varg: bool,
        pkg_path: &Arc<str>,
    ) -> Result<()> {
        let mut depths = self.stack_depths();
        depths.values = self
            .values
            .len()
            .checked_sub(num_args + 1)
            .ok_or_else(|| Error::internal("call arguments missing from the value stack"))?;
        let mut fr = Frame::call(depths, func, ft);
        fr.receiver = receiver;
        fr.num_args = num_args;
        fr.is_varg = is_varg;
        fr.last_package = self.package.clone();
        fr.last_realm = self.realm.clone();
        trace!(%fr, depth = self.frames.len(), "push call frame");
        self.frames.push(fr);

        if pkg_path.is_empty() {
            return Ok(());
        }
        if let Some(pkg) = self.load_package(pkg_path)? {
            self.package = Some(pkg);
        }
        if is_realm_path(pkg_path) && self.realm.as_ref() != Some(pkg_path) {
            self.ensure_realm(pkg_path)?;
            self.realm = Some(pkg_path.clone());
        }
        Ok(())
    }

    /// Builds the function block and starts the body.
    pub(crate) fn do_call(&mut self) -> Result<()> {
        let fr = self.last_frame()?;
        let func = fr
            .func
            .clone()
            .ok_or_else(|| Error::internal("call op without a call frame"))?;
        let receiver = fr.receiver.clone();
        let num_args = fr.num_args;
        let is_varg = fr.is_varg;
        let ObjectRef::Func(fv) = &func else {
            return Err(Error::internal(format!("cannot call a {}", func.kind_name())));
        };
        let (source, native, parent, captures, pkg_path) = {
            let f = fv.borrow();
            (
                f.source.clone(),
                f.native.clone(),
                f.parent.clone(),
                f.captures.clone(),
                f.pkg_path.clone(),
            )
        };
        if native.is_some() {
            self.push_op(Op::CallNative);
            return Ok(());
        }
        let source = source.ok_or_else(|| Error::internal("guest function without source"))?;
        let body = source
            .body
            .clone()
            .ok_or_else(|| Error::internal(format!("function {} has no body", source.name)))?;

        let parent = match parent {
            Value::Ref(r) => {
                let o = self.store.get_object(r.object_id)?;
                fv.borrow_mut().parent = Value::Object(o.clone());
                Value::Object(o)
            }
            Value::Nil if !pkg_path.is_empty() => {
                let pkg = self.require_package(&pkg_path)?;
                Value::Object(ObjectRef::Block(self.package_block(&pkg)?))
            }
            other => other,
        };

        let ft = &source.ty;
        let np = ft.params.len();
        let mut block = Block::new(&source.block, parent);

        let start = block
            .values
            .len()
            .checked_sub(captures.len())
            .ok_or_else(|| Error::internal("more captures than block slots"))?;
        for (i, c) in captures.into_iter().enumerate() {
            block.values[start + i] = c;
        }
        for (i, r) in ft.results.iter().enumerate() {
            set_local(&mut block, np + i, TypedValue::zero(&r.ty))?;
        }

        let mut args = self.pop_values(num_args)?;
        self.pop_value()?;
        let nrecv = usize::from(receiver.is_some());
        if ft.variadic && !is_varg {
            let fixed = np
                .checked_sub(nrecv + 1)
                .ok_or_else(|| Error::internal("variadic function without parameters"))?;
            if args.len() < fixed {
                return Err(Error::internal("too few arguments"));
            }
            let rest = args.split_off(fixed);
            let slice_t = ft.params[np - 1].ty.clone();
            let packed = if rest.is_empty() {
                TypedValue {
                    t: Some(slice_t),
                    v: Value::Nil,
                }
            } else {
                let rest = rest
                    .iter()
                    .map(|a| a.copy(&mut *self.store))
                    .collect::<Result<Vec<_>>>()?;
                TypedValue::new(slice_t, binary::new_slice(rest))
            };
            args.push(packed);
        }
        if args.len() + nrecv != np {
            return Err(Error::internal(format!(
                "{} takes {np} parameters, got {}",
                source.name,
                args.len() + nrecv
            )));
        }

        let mut slot = 0;
        if let Some(recv) = receiver {
            let v = recv.copy(&mut *self.store)?;
            set_local(&mut block, 0, v)?;
            slot = 1;
        }
        for a in args {
            let v = a.copy(&mut *self.store)?;
            set_local(&mut block, slot, v)?;
            slot += 1;
        }

        block.body = Some(Box::new(BodyCursor::new(body)));
        self.push_block(Rc::new(RefCell::new(block)));
        if ft.results.is_empty() {
            self.push_exec(&Stmt::ret(Vec::new()));
        }
        self.push_op(Op::Body);
        Ok(())
    }

    pub(crate) fn do_call_native(&mut self) -> Result<()> {
        let fr = self.last_frame()?;
        let receiver = fr.receiver.clone();
        let num_args = fr.num_args;
        let is_varg = fr.is_varg;
        let native = match &fr.func {
            Some(ObjectRef::Func(fv)) => fv.borrow().native.clone(),
            _ => None,
        }
        .ok_or_else(|| Error::internal("native call without a native function"))?;
        let mut args = self.pop_values(num_args)?;
        self.pop_value()?;
        match native {
            NativeRef::Builtin(b) => self.call_builtin(b, args, is_varg),
            NativeRef::Host { pkg_path, name } => {
                if let Some(r) = receiver {
                    args.insert(0, r);
                }
                let interop = self.interop.as_mut().ok_or_else(|| {
                    Error::internal(format!("no native interop installed for {pkg_path}.{name}"))
                })?;
                let maps: Vec<Option<ObjectRef>> = args
                    .iter()
                    .map(|a| match &a.v {
                        Value::Object(o @ ObjectRef::Map(_)) => Some(o.clone()),
                        _ => None,
                    })
                    .collect();
                let results = interop.call(&pkg_path, &name, args)?;
                for (i, entries) in interop.take_map_updates() {
                    let map = maps.get(i).cloned().flatten().ok_or_else(|| {
                        Error::internal(format!("{pkg_path}.{name}: argument {i} is not a map"))
                    })?;
                    self.sync_map(&map, entries)?;
                }
                self.pop_frame_and_return(results)
            }
        }
    }

    // =========================================================================
    // Return
    // =========================================================================

    /// Results are on the value stack.
    pub(crate) fn do_return(&mut self) -> Result<()> {
        let n = self.last_call_frame()?.num_results();
        let results = self.pop_values(n)?;
        let results = results
            .iter()
            .map(|r| r.copy(&mut *self.store))
            .collect::<Result<Vec<_>>>()?;
        self.pop_frame_and_return(results)
    }

    /// Results are in the named result slots of the function block.
    pub(crate) fn do_return_from_block(&mut self) -> Result<()> {
        let (block, np, nr) = self.result_block()?;
        let mut results = Vec::with_capacity(nr);
        for i in 0..nr {
            results.push(self.read_var(&block, np + i)?);
        }
        self.pop_frame_and_return(results)
    }

    /// Moves explicit results into the result slots before defers run.
    pub(crate) fn do_return_to_block(&mut self) -> Result<()> {
        let (block, np, nr) = self.result_block()?;
        let results = self.pop_values(nr)?;
        for (i, r) in results.into_iter().enumerate() {
            self.set_var(&block, np + i, r)?;
        }
        Ok(())
    }

    fn result_block(&self) -> Result<(Rc<RefCell<Block>>, usize, usize)> {
        let fr = self.last_call_frame()?;
        let ft = fr
            .func_type
            .as_ref()
            .ok_or_else(|| Error::internal("call frame without a signature"))?;
        let block = self
            .blocks
            .get(fr.depths.blocks)
            .cloned()
            .ok_or_else(|| Error::internal("function block missing"))?;
        Ok((block, ft.params.len(), ft.results.len()))
    }

    /// Pops the innermost call frame, restores the stacks to their depths at
    /// the call, and pushes `results` unless the call was deferred.
    pub(crate) fn pop_frame_and_return(&mut self, results: Vec<TypedValue>) -> Result<()> {
        if !self.pop_until_last_call_frame() {
            return Err(Error::internal("return without a call frame"));
        }
        let fr = self
            .frames
            .pop()
            .ok_or_else(|| Error::internal("frame stack underflow"))?;
        trace!(%fr, results = results.len(), "return");
        self.truncate_to(fr.depths);
        if !fr.is_defer {
            self.values.extend(results);
        }
        self.restore_context(&fr, true)
    }

    /// Switches back to the caller's package and realm, finalizing the
    /// callee's realm when control leaves it.
    fn restore_context(&mut self, fr: &Frame, finalize: bool) -> Result<()> {
        let callee_realm = std::mem::replace(&mut self.realm, fr.last_realm.clone());
        self.package = fr.last_package.clone();
        if !finalize {
            return Ok(());
        }
        match callee_realm {
            Some(path) if fr.last_realm.as_ref() != Some(&path) => self.finalize_realm(&path),
            _ => Ok(()),
        }
    }

    // =========================================================================
    // Defer and Panic
    // =========================================================================

    /// Runs the pending deferred calls of the innermost call frame, last
    /// registered first. Stays on the op stack until none are left.
    pub(crate) fn do_return_call_defers(&mut self) -> Result<()> {
        let next = self.last_call_frame_mut()?.defers.pop();
        if let Some(d) = next {
            let n = d.args.len();
            self.push_value(d.func);
            for a in d.args {
                self.push_value(a);
            }
            return self.begin_call(n, d.is_varg, true, d.panic_scope);
        }
        self.ops.pop();
        if self.exceptions.is_empty() {
            return Ok(());
        }
        // Still panicking: the frame is abandoned without results.
        if !self.pop_until_last_call_frame() {
            return Err(Error::internal("panic unwound past the last call frame"));
        }
        let fr = self
            .frames
            .pop()
            .ok_or_else(|| Error::internal("frame stack underflow"))?;
        trace!(%fr, "unwind");
        self.restore_context(&fr, false)
    }

    /// Raises a guest panic with `value`.
    ///
    /// # Errors
    ///
    /// Returns `UnhandledPanic` if there is no call frame to unwind.
    pub(crate) fn start_panic(&mut self, value: TypedValue) -> Result<()> {
        self.panic_scope += 1;
        debug!(scope = self.panic_scope, value = %value, "panic");
        self.exceptions.push(Exception {
            value,
            scope: self.panic_scope,
        });
        if self.call_frame_index(1).is_none() {
            return Err(self.unhandled_panic());
        }
        self.push_op(Op::Panic2);
        self.push_op(Op::ReturnCallDefers);
        Ok(())
    }

    /// Runs after a frame's defers during a panic: either the panic was
    /// recovered and the frame returns normally, or unwinding continues
    /// with the caller.
    pub(crate) fn do_panic2(&mut self) -> Result<()> {
        if self.exceptions.is_empty() {
            self.push_op(Op::ReturnFromBlock);
            self.push_op(Op::ReturnCallDefers);
            return Ok(());
        }
        if !self.pop_until_last_call_frame() {
            return Err(self.unhandled_panic());
        }
        self.push_op(Op::Panic2);
        self.push_op(Op::ReturnCallDefers);
        Ok(())
    }

    fn unhandled_panic(&self) -> Error {
        let msg = self
            .exceptions
            .iter()
            .rev()
            .map(|e| format!("panic: {}", e.value))
            .collect::<Vec<_>>()
            .join("\n\t");
        warn!(panics = self.exceptions.len(), "unhandled panic");
        Error::new(ErrorKind::UnhandledPanic(msg))
    }
}
