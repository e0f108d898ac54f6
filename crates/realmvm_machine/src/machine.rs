//! The machine: explicit stacks and the dispatch loop.
//!
//! Execution never recurses natively into guest code. Every pending step is
//! data on one of the stacks:
//!
//! - **ops**: what to do next
//! - **values**: operands and results
//! - **exprs** / **stmts**: nodes waiting for the op that scheduled them
//! - **blocks**: active lexical scopes, innermost last
//! - **frames**: calls, loops and switches, with the depths to restore
//!
//! [`Machine::run`] pops one op at a time until it meets [`Op::Halt`] or the
//! op stack is empty. Nested runs push a `Halt` first, so an evaluation can
//! be started from inside another one without growing the native stack.

#![allow(clippy::module_name_repetitions)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use tracing::{debug, trace};

use realmvm_foundation::{
    Block, Error, ErrorContext, ErrorKind, Expr, ObjectRef, Result, Stmt, TypedValue, Value,
};
use realmvm_realm::Realm;
use realmvm_storage::Store;

use crate::frame::{Exception, Frame, FrameKind, StackDepths};
use crate::instrument::{CoverageTracker, Profiler};
use crate::native::NativeInterop;
use crate::op::Op;
use crate::options::MachineOptions;

/// Resumable interpreter for one transaction at a time.
pub struct Machine {
    pub(crate) ops: Vec<Op>,
    pub(crate) values: Vec<TypedValue>,
    pub(crate) exprs: Vec<Expr>,
    pub(crate) stmts: Vec<Stmt>,
    pub(crate) blocks: Vec<Rc<RefCell<Block>>>,
    pub(crate) frames: Vec<Frame>,

    /// Package whose code is running.
    pub(crate) package: Option<ObjectRef>,
    /// Path of the realm whose objects may be modified.
    pub(crate) realm: Option<Arc<str>>,
    pub(crate) realms: HashMap<Arc<str>, Realm>,
    pub(crate) packages: HashMap<Arc<str>, ObjectRef>,

    pub(crate) exceptions: Vec<Exception>,
    pub(crate) panic_scope: u64,

    pub(crate) store: Box<dyn Store>,
    pub(crate) options: MachineOptions,
    pub(crate) cycles: u64,
    pub(crate) output: String,
    output_sink: Option<Box<dyn FnMut(&str)>>,
    /// Nesting depth of read-only evaluations.
    pub(crate) guard_depth: usize,
    /// Line of the statement executing most recently.
    pub(crate) line: u32,

    pub(crate) interop: Option<Box<dyn NativeInterop>>,
    coverage: Option<Box<dyn CoverageTracker>>,
    profiler: Option<Box<dyn Profiler>>,
}

impl Machine {
    /// Creates a machine over a store.
    #[must_use]
    pub fn new(store: impl Store + 'static, options: MachineOptions) -> Self {
        Self {
            ops: Vec::with_capacity(256),
            values: Vec::with_capacity(256),
            exprs: Vec::with_capacity(64),
            stmts: Vec::with_capacity(64),
            blocks: Vec::with_capacity(32),
            frames: Vec::with_capacity(32),
            package: None,
            realm: None,
            realms: HashMap::new(),
            packages: HashMap::new(),
            exceptions: Vec::new(),
            panic_scope: 0,
            store: Box::new(store),
            options,
            cycles: 0,
            output: String::new(),
            output_sink: None,
            guard_depth: 0,
            line: 0,
            interop: None,
            coverage: None,
            profiler: None,
        }
    }

    /// Installs the host side of native functions.
    #[must_use]
    pub fn with_interop(mut self, interop: impl NativeInterop + 'static) -> Self {
        self.interop = Some(Box::new(interop));
        self
    }

    /// Sends `print`/`println` output to `sink` instead of the machine's
    /// buffer.
    #[must_use]
    pub fn with_output_sink(mut self, sink: impl FnMut(&str) + 'static) -> Self {
        self.output_sink = Some(Box::new(sink));
        self
    }

    /// Installs a coverage tracker.
    #[must_use]
    pub fn with_coverage(mut self, coverage: impl CoverageTracker + 'static) -> Self {
        self.coverage = Some(Box::new(coverage));
        self
    }

    /// Installs a profiler.
    #[must_use]
    pub fn with_profiler(mut self, profiler: impl Profiler + 'static) -> Self {
        self.profiler = Some(Box::new(profiler));
        self
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Configuration.
    #[must_use]
    pub fn options(&self) -> &MachineOptions {
        &self.options
    }

    /// Cycles charged since the current entry point started.
    #[must_use]
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Buffered `print`/`println` output. Empty when an output sink is
    /// installed.
    #[must_use]
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Drains the buffered output.
    pub fn take_output(&mut self) -> String {
        std::mem::take(&mut self.output)
    }

    pub(crate) fn write_output(&mut self, text: &str) {
        match &mut self.output_sink {
            Some(sink) => sink(text),
            None => self.output.push_str(text),
        }
    }

    /// The store.
    pub fn store_mut(&mut self) -> &mut dyn Store {
        &mut *self.store
    }

    /// A realm loaded by this machine.
    #[must_use]
    pub fn realm(&self, path: &str) -> Option<&Realm> {
        self.realms.get(path)
    }

    /// Mutable access to a realm loaded by this machine.
    pub fn realm_mut(&mut self, path: &str) -> Option<&mut Realm> {
        self.realms.get_mut(path)
    }

    /// Path of the realm currently allowed to mutate.
    #[must_use]
    pub fn current_realm(&self) -> Option<&Arc<str>> {
        self.realm.as_ref()
    }

    /// Current depth of every stack.
    #[must_use]
    pub fn stack_depths(&self) -> StackDepths {
        StackDepths {
            ops: self.ops.len(),
            values: self.values.len(),
            exprs: self.exprs.len(),
            stmts: self.stmts.len(),
            blocks: self.blocks.len(),
            frames: self.frames.len(),
        }
    }

    /// Panics currently unwinding, oldest first.
    #[must_use]
    pub fn exceptions(&self) -> &[Exception] {
        &self.exceptions
    }

    // =========================================================================
    // Stack Primitives
    // =========================================================================

    pub(crate) fn push_op(&mut self, op: Op) {
        self.ops.push(op);
    }

    pub(crate) fn push_expr(&mut self, x: Expr) {
        self.exprs.push(x);
    }

    /// Schedules evaluation of `x`.
    pub(crate) fn push_eval(&mut self, x: &Expr) {
        self.exprs.push(x.clone());
        self.ops.push(Op::Eval);
    }

    /// Schedules execution of `s`.
    pub(crate) fn push_exec(&mut self, s: &Stmt) {
        self.stmts.push(s.clone());
        self.ops.push(Op::Exec);
    }

    pub(crate) fn pop_expr(&mut self) -> Result<Expr> {
        self.exprs
            .pop()
            .ok_or_else(|| Error::internal("expression stack underflow"))
    }

    pub(crate) fn push_stmt(&mut self, s: Stmt) {
        self.stmts.push(s);
    }

    pub(crate) fn pop_stmt(&mut self) -> Result<Stmt> {
        self.stmts
            .pop()
            .ok_or_else(|| Error::internal("statement stack underflow"))
    }

    pub(crate) fn push_value(&mut self, tv: TypedValue) {
        self.values.push(tv);
    }

    pub(crate) fn pop_value(&mut self) -> Result<TypedValue> {
        self.values
            .pop()
            .ok_or_else(|| Error::internal("value stack underflow"))
    }

    /// Value `offset` places from the top (1 is the top).
    pub(crate) fn peek_value(&self, offset: usize) -> Result<&TypedValue> {
        self.values
            .len()
            .checked_sub(offset)
            .and_then(|i| self.values.get(i))
            .ok_or_else(|| Error::internal(format!("value stack has no entry {offset} deep")))
    }

    pub(crate) fn peek_value_mut(&mut self, offset: usize) -> Result<&mut TypedValue> {
        let i = self
            .values
            .len()
            .checked_sub(offset)
            .ok_or_else(|| Error::internal(format!("value stack has no entry {offset} deep")))?;
        self.values
            .get_mut(i)
            .ok_or_else(|| Error::internal("value stack underflow"))
    }

    /// Pops the top `n` values, in push order.
    pub(crate) fn pop_values(&mut self, n: usize) -> Result<Vec<TypedValue>> {
        let start = self
            .values
            .len()
            .checked_sub(n)
            .ok_or_else(|| Error::internal(format!("cannot pop {n} values")))?;
        Ok(self.values.split_off(start))
    }

    /// Pops every value above `start`, in push order.
    pub(crate) fn reap_values(&mut self, start: usize) -> Result<Vec<TypedValue>> {
        if start > self.values.len() {
            return Err(Error::internal(format!(
                "cannot reap values from {start}, stack has {}",
                self.values.len()
            )));
        }
        Ok(self.values.split_off(start))
    }

    pub(crate) fn push_block(&mut self, b: Rc<RefCell<Block>>) {
        self.blocks.push(b);
    }

    pub(crate) fn pop_block(&mut self) -> Result<Rc<RefCell<Block>>> {
        self.blocks
            .pop()
            .ok_or_else(|| Error::internal("block stack underflow"))
    }

    pub(crate) fn last_block(&self) -> Result<Rc<RefCell<Block>>> {
        self.blocks
            .last()
            .cloned()
            .ok_or_else(|| Error::internal("no active block"))
    }

    /// Parent link for a block nested in the current one.
    pub(crate) fn last_block_value(&self) -> Result<Value> {
        Ok(Value::Object(ObjectRef::Block(self.last_block()?)))
    }

    pub(crate) fn truncate_to(&mut self, d: StackDepths) {
        self.ops.truncate(d.ops);
        self.values.truncate(d.values);
        self.exprs.truncate(d.exprs);
        self.stmts.truncate(d.stmts);
        self.blocks.truncate(d.blocks);
    }

    /// Clears every stack and the panic state.
    pub(crate) fn reset_stacks(&mut self) {
        self.ops.clear();
        self.values.clear();
        self.exprs.clear();
        self.stmts.clear();
        self.blocks.clear();
        self.frames.clear();
        self.exceptions.clear();
    }

    // =========================================================================
    // Frames
    // =========================================================================

    pub(crate) fn push_frame_basic(&mut self, kind: FrameKind, label: Option<Arc<str>>) {
        let depths = self.stack_depths();
        trace!(?kind, depth = self.frames.len(), "push frame");
        self.frames.push(Frame::basic(kind, label, depths));
    }

    pub(crate) fn last_frame(&self) -> Result<&Frame> {
        self.frames
            .last()
            .ok_or_else(|| Error::internal("no active frame"))
    }

    pub(crate) fn last_frame_mut(&mut self) -> Result<&mut Frame> {
        self.frames
            .last_mut()
            .ok_or_else(|| Error::internal("no active frame"))
    }

    /// Index of the `n`th call frame from the top (1 is the innermost).
    pub(crate) fn call_frame_index(&self, n: usize) -> Option<usize> {
        self.frames
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, f)| f.is_call())
            .nth(n.checked_sub(1)?)
            .map(|(i, _)| i)
    }

    pub(crate) fn last_call_frame(&self) -> Result<&Frame> {
        self.call_frame_index(1)
            .map(|i| &self.frames[i])
            .ok_or_else(|| Error::internal("no active call frame"))
    }

    pub(crate) fn last_call_frame_mut(&mut self) -> Result<&mut Frame> {
        let i = self
            .call_frame_index(1)
            .ok_or_else(|| Error::internal("no active call frame"))?;
        Ok(&mut self.frames[i])
    }

    /// Pops loop and switch frames down to the innermost call frame. Returns
    /// false if there is no call frame left.
    pub fn pop_until_last_call_frame(&mut self) -> bool {
        while let Some(fr) = self.frames.last() {
            if fr.is_call() {
                return true;
            }
            self.frames.pop();
        }
        false
    }

    /// Pops the top frame and truncates every stack to its entry depths.
    pub(crate) fn pop_frame_and_reset(&mut self) -> Result<()> {
        let fr = self
            .frames
            .pop()
            .ok_or_else(|| Error::internal("frame stack underflow"))?;
        self.truncate_to(fr.depths);
        Ok(())
    }

    /// Unwinds a `for` iteration so the loop sees the end of its body.
    pub(crate) fn peek_frame_and_continue_for(&mut self) -> Result<()> {
        let d = self.last_frame()?.depths;
        self.continue_at(d, 0)
    }

    /// Unwinds a `range` iteration; the ranged value stays on the stack.
    pub(crate) fn peek_frame_and_continue_range(&mut self) -> Result<()> {
        let d = self.last_frame()?.depths;
        self.continue_at(d, 1)
    }

    fn continue_at(&mut self, d: StackDepths, extra_values: usize) -> Result<()> {
        self.ops.truncate(d.ops + 1);
        self.values.truncate(d.values + extra_values);
        self.exprs.truncate(d.exprs);
        self.stmts.truncate(d.stmts);
        self.blocks.truncate(d.blocks + 1);
        let block = self.last_block()?;
        block.borrow_mut().cursor()?.finish();
        Ok(())
    }

    // =========================================================================
    // Dispatch Loop
    // =========================================================================

    /// Runs ops until `Halt` or an empty op stack.
    ///
    /// Guest-recoverable errors raised by a handler become guest panics.
    ///
    /// # Errors
    ///
    /// Returns fatal errors, and `UnhandledPanic` when a panic unwinds past
    /// the last call frame.
    pub fn run(&mut self) -> Result<()> {
        while let Some(&op) = self.ops.last() {
            if !op.is_sticky() {
                self.ops.pop();
            }
            self.charge(op)?;
            if op == Op::Halt {
                return Ok(());
            }
            trace!(%op, ops = self.ops.len(), values = self.values.len(), "dispatch");
            if let Err(err) = self.dispatch(op) {
                if err.is_guest_recoverable() {
                    debug!(error = %err, "runtime error raised as guest panic");
                    let value = TypedValue::string(&err.to_string());
                    self.start_panic(value)
                        .map_err(|e| self.contextualize(e, op))?;
                } else {
                    return Err(self.contextualize(err, op));
                }
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, op: Op) -> Result<()> {
        match op {
            Op::Halt => Ok(()),
            Op::PopResults(depth) => {
                if self.values.len() < depth {
                    return Err(Error::internal("expression statement consumed values"));
                }
                self.values.truncate(depth);
                Ok(())
            }
            Op::PopBlock => self.pop_block().map(|_| ()),
            Op::PopFrameAndReset => self.pop_frame_and_reset(),

            Op::Exec => self.do_exec(),
            Op::Body => self.do_body(),
            Op::ForLoop => self.do_for_loop(),
            Op::RangeIter => self.do_range_iter(),
            Op::RangeIterString => self.do_range_iter_string(),
            Op::RangeIterMap => self.do_range_iter_map(),
            Op::IfCond => self.do_if_cond(),
            Op::SwitchClause => self.do_switch_clause(),
            Op::SwitchCase => self.do_switch_case(),
            Op::TypeSwitch => self.do_type_switch(),
            Op::Assign => self.do_assign(),
            Op::Define => self.do_define(),
            Op::AssignOp(bop) => self.do_assign_op(bop),
            Op::IncDec(inc) => self.do_inc_dec(inc),
            Op::ValueDecl => self.do_value_decl(),
            Op::Defer => self.do_defer(),

            Op::Precall => self.do_precall(),
            Op::Call => self.do_call(),
            Op::CallNative => self.do_call_native(),
            Op::Return => self.do_return(),
            Op::ReturnFromBlock => self.do_return_from_block(),
            Op::ReturnToBlock => self.do_return_to_block(),
            Op::ReturnCallDefers => self.do_return_call_defers(),
            Op::Panic2 => self.do_panic2(),

            Op::Eval => self.do_eval(),
            Op::Binary1 => self.do_binary1(),
            Op::Binary(bop) => self.do_binary(bop),
            Op::Unary(uop) => self.do_unary(uop),
            Op::Index => self.do_index(),
            Op::Slice => self.do_slice(),
            Op::SelectField(i) => self.do_select_field(i),
            Op::SelectMethod => self.do_select_method(),
            Op::Star => self.do_star(),
            Op::Ref => self.do_ref(),
            Op::CompositeLit => self.do_composite_lit(),
            Op::Convert => self.do_convert(),
        }
    }

    fn charge(&mut self, op: Op) -> Result<()> {
        let cost = op.cost();
        self.cycles = self.cycles.saturating_add(cost);
        if let Some(p) = self.profiler.as_mut() {
            p.record_op_cost(op, cost, alloc_estimate(op));
        }
        let limit = self.options.max_cycles;
        if limit > 0 && self.cycles > limit {
            return Err(Error::new(ErrorKind::CycleLimitExceeded { limit }));
        }
        Ok(())
    }

    pub(crate) fn record_line(&mut self, line: u32) {
        self.line = line;
        let Some(cov) = self.coverage.as_mut() else {
            return;
        };
        if let Some(b) = self.blocks.last() {
            let b = b.borrow();
            cov.record_line_executed(&b.location.pkg_path, &b.location.file, line);
        }
    }

    fn contextualize(&self, err: Error, op: Op) -> Error {
        if err.context.is_some() {
            return err;
        }
        let mut ctx = ErrorContext::new().with_op(op.name());
        if let Some(b) = self.blocks.last() {
            let b = b.borrow();
            ctx = ctx.with_package(b.location.pkg_path.to_string());
            if self.line > 0 {
                ctx = ctx.with_position(b.location.file.to_string(), self.line);
            }
        }
        err.with_context(ctx)
    }

    // =========================================================================
    // Packages and Realms
    // =========================================================================

    /// Loads a package by path, from this machine's cache or the store.
    pub(crate) fn load_package(&mut self, path: &str) -> Result<Option<ObjectRef>> {
        if let Some(pkg) = self.packages.get(path) {
            return Ok(Some(pkg.clone()));
        }
        let Some(pkg) = self.store.get_package(path)? else {
            return Ok(None);
        };
        self.packages.insert(Arc::from(path), pkg.clone());
        Ok(Some(pkg))
    }

    pub(crate) fn require_package(&mut self, path: &str) -> Result<ObjectRef> {
        self.load_package(path)?
            .ok_or_else(|| Error::internal(format!("package {path} is not declared")))
    }

    /// The block of a package, loading it if it is still a reference.
    pub(crate) fn package_block(&mut self, pkg: &ObjectRef) -> Result<Rc<RefCell<Block>>> {
        let ObjectRef::Package(p) = pkg else {
            return Err(Error::internal(format!("{} is not a package", pkg.kind_name())));
        };
        let block = p.borrow().block.clone();
        match block {
            Value::Object(ObjectRef::Block(b)) => Ok(b),
            Value::Ref(r) => {
                let o = self.store.get_object(r.object_id)?;
                p.borrow_mut().block = Value::Object(o.clone());
                match o {
                    ObjectRef::Block(b) => Ok(b),
                    other => Err(Error::internal(format!(
                        "package block is a {}",
                        other.kind_name()
                    ))),
                }
            }
            _ => Err(Error::internal("package has no block")),
        }
    }

    /// Makes sure the realm of `path` is loaded.
    pub(crate) fn ensure_realm(&mut self, path: &Arc<str>) -> Result<()> {
        if self.realms.contains_key(path) {
            return Ok(());
        }
        let rlm = match self.store.get_realm_record(path)? {
            Some(record) => Realm::from_record(&record),
            None => Realm::new(path),
        };
        let rlm = if self.options.realm_op_log {
            rlm.with_op_log()
        } else {
            rlm
        };
        self.realms.insert(path.clone(), rlm);
        Ok(())
    }

    /// Finalizes one realm.
    pub(crate) fn finalize_realm(&mut self, path: &str) -> Result<()> {
        let read_only = self.options.read_only;
        if let Some(rlm) = self.realms.get_mut(path) {
            rlm.finalize(&mut *self.store, read_only)?;
        }
        Ok(())
    }

    /// Finalizes every loaded realm with pending marks.
    pub(crate) fn finalize_all_realms(&mut self) -> Result<()> {
        let read_only = self.options.read_only;
        for rlm in self.realms.values_mut() {
            if !rlm.mark_counts().is_empty() {
                rlm.finalize(&mut *self.store, read_only)?;
            }
        }
        Ok(())
    }

    /// Abandons the transaction: stacks, loaded realms and packages, and the
    /// store's pending writes.
    pub(crate) fn abort(&mut self) {
        self.reset_stacks();
        self.realms.clear();
        self.packages.retain(|_, p| !p.is_real());
        self.package = None;
        self.realm = None;
        self.store.discard();
    }

    // =========================================================================
    // Mutation Hook
    // =========================================================================

    /// Reports that a slot of `po` changed from `xo` to `co`.
    pub(crate) fn did_update(
        &mut self,
        po: &ObjectRef,
        xo: Option<&ObjectRef>,
        co: Option<&ObjectRef>,
    ) -> Result<()> {
        if !po.is_real() {
            return Ok(());
        }
        if self.guard_depth > 0 {
            return Err(Error::new(ErrorKind::ReadOnlyViolation(format!(
                "write to {} {} during evaluation",
                po.kind_name(),
                po.id()
            ))));
        }
        let Some(path) = self.realm.clone() else {
            return Err(Error::runtime(
                "cannot modify external-realm or non-realm object",
            ));
        };
        let rlm = self
            .realms
            .get_mut(&path)
            .ok_or_else(|| Error::internal(format!("realm {path} is not loaded")))?;
        rlm.did_update(Some(po), xo, co)
    }
}

fn alloc_estimate(op: Op) -> u64 {
    match op {
        Op::Call => 64,
        Op::CompositeLit => 32,
        Op::SelectMethod | Op::Ref => 16,
        _ => 0,
    }
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("depths", &self.stack_depths())
            .field("realm", &self.realm)
            .field("cycles", &self.cycles)
            .field("exceptions", &self.exceptions.len())
            .finish_non_exhaustive()
    }
}
