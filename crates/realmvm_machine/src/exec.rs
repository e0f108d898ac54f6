//! Statement execution: bodies, control flow and branches.
//!
//! A statement list runs under a sticky `Body` op that feeds one statement
//! at a time from the block's cursor. Loops keep their own sticky op
//! (`ForLoop`, `RangeIter*`) and record the stack depths at entry on the
//! cursor, so `continue` and `goto` can cut the stacks back without
//! unwinding anything natively.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use tracing::trace;

use realmvm_foundation::{
    AssignOp, Block, BlockStmt, BodyCursor, BranchOp, BranchStmt, CURSOR_COND, CURSOR_START,
    Error, Expr, ForStmt, IfStmt, Kind, ObjectRef, RangeOp, RangeStmt, Result, Stmt, SwitchStmt,
    TypeSwitchStmt, TypedValue, Value,
};

use crate::binary;
use crate::frame::{Defer, FrameKind};
use crate::machine::Machine;
use crate::op::Op;

fn cursor_of(body: Arc<[Stmt]>) -> Option<Box<BodyCursor>> {
    Some(Box::new(BodyCursor::new(body)))
}

impl Machine {
    pub(crate) fn do_exec(&mut self) -> Result<()> {
        let s = self.pop_stmt()?;
        match &s {
            Stmt::Located(l) => {
                self.record_line(l.line);
                self.push_exec(&l.stmt);
            }
            Stmt::Empty => {}
            Stmt::Expr(x) => {
                let depth = self.values.len();
                self.push_op(Op::PopResults(depth));
                self.push_eval(x);
            }
            Stmt::Assign(a) => {
                let first_rhs = a.rhs.first().cloned();
                match a.op {
                    AssignOp::Assign => {
                        self.push_op(Op::Assign);
                        self.push_stmt(s.clone());
                        for x in a.rhs.iter().rev() {
                            self.push_eval(x);
                        }
                        for lx in a.lhs.iter().rev() {
                            self.push_for_pointer(lx)?;
                        }
                    }
                    AssignOp::Define => {
                        self.push_op(Op::Define);
                        self.push_stmt(s.clone());
                        for x in a.rhs.iter().rev() {
                            self.push_eval(x);
                        }
                    }
                    AssignOp::Op(bop) => {
                        let rhs = first_rhs
                            .ok_or_else(|| Error::internal("assignment without a value"))?;
                        let lx = a
                            .lhs
                            .first()
                            .ok_or_else(|| Error::internal("assignment without a target"))?;
                        self.push_op(Op::AssignOp(bop));
                        self.push_stmt(s.clone());
                        self.push_eval(&rhs);
                        self.push_for_pointer(lx)?;
                    }
                }
            }
            Stmt::IncDec(d) => {
                self.push_op(Op::IncDec(d.inc));
                self.push_stmt(s.clone());
                self.push_for_pointer(&d.x)?;
            }
            Stmt::If(is) => self.exec_if(&s, is)?,
            Stmt::For(fs) => self.exec_for(fs)?,
            Stmt::Range(rs) => self.exec_range(rs)?,
            Stmt::Switch(ss) => self.exec_switch(ss)?,
            Stmt::TypeSwitch(ts) => self.exec_type_switch(&s, ts)?,
            Stmt::Block(bs) => self.exec_block(bs)?,
            Stmt::Return(results) => self.exec_return(results)?,
            Stmt::Branch(bs) => self.exec_branch(bs)?,
            Stmt::Defer(cx) => {
                self.push_op(Op::Defer);
                self.push_stmt(s.clone());
                for x in cx.args.iter().rev() {
                    self.push_eval(x);
                }
                self.push_eval(&cx.func);
            }
            Stmt::ValueDecl(d) => {
                if d.values.is_empty() {
                    for n in &d.names {
                        let zero = d
                            .ty
                            .as_ref()
                            .map_or_else(TypedValue::undefined, TypedValue::zero);
                        self.define_name(n, zero)?;
                    }
                } else {
                    self.push_op(Op::ValueDecl);
                    self.push_stmt(s.clone());
                    for x in d.values.iter().rev() {
                        self.push_eval(x);
                    }
                }
            }
        }
        Ok(())
    }

    /// Feeds the next statement of the current block's body.
    pub(crate) fn do_body(&mut self) -> Result<()> {
        let block = self.last_block()?;
        let next = {
            let mut b = block.borrow_mut();
            let cur = b.cursor()?;
            if cur.next_index == CURSOR_START {
                cur.num_ops = self.ops.len();
                cur.num_values = self.values.len();
                cur.num_exprs = self.exprs.len();
                cur.num_stmts = self.stmts.len();
                cur.next_index = 0;
            }
            cur.next_stmt()
        };
        match next {
            Some(s) => self.push_exec(&s),
            None => {
                self.ops.pop();
                block.borrow_mut().body = None;
            }
        }
        Ok(())
    }

    fn exec_block(&mut self, bs: &BlockStmt) -> Result<()> {
        let parent = self.last_block_value()?;
        let mut block = Block::new(&bs.block, parent);
        block.body = cursor_of(bs.body.clone());
        self.push_op(Op::PopBlock);
        self.push_block(Rc::new(RefCell::new(block)));
        self.push_op(Op::Body);
        Ok(())
    }

    // =========================================================================
    // If
    // =========================================================================

    fn exec_if(&mut self, s: &Stmt, is: &IfStmt) -> Result<()> {
        let parent = self.last_block_value()?;
        let block = Block::new(&is.block, parent);
        self.push_op(Op::PopBlock);
        self.push_block(Rc::new(RefCell::new(block)));
        self.push_stmt(s.clone());
        self.push_op(Op::IfCond);
        self.push_eval(&is.cond);
        if let Some(init) = &is.init {
            self.push_exec(init);
        }
        Ok(())
    }

    pub(crate) fn do_if_cond(&mut self) -> Result<()> {
        let Stmt::If(is) = self.pop_stmt()? else {
            return Err(Error::internal("expected an if statement"));
        };
        let cond = self.pop_value()?.as_bool()?;
        let clause = if cond { &is.then } else { &is.els };
        let block = self.last_block()?;
        {
            let mut b = block.borrow_mut();
            b.expand(&clause.source);
            b.body = cursor_of(clause.body.clone());
        }
        self.push_op(Op::Body);
        Ok(())
    }

    // =========================================================================
    // For
    // =========================================================================

    fn exec_for(&mut self, fs: &ForStmt) -> Result<()> {
        self.push_frame_basic(FrameKind::For, fs.label.clone());
        let parent = self.last_block_value()?;
        let mut block = Block::new(&fs.block, parent);
        let mut cursor = BodyCursor::new(fs.body.clone());
        cursor.cond.clone_from(&fs.cond);
        cursor.post.clone_from(&fs.post);
        block.body = Some(Box::new(cursor));
        self.push_block(Rc::new(RefCell::new(block)));
        self.push_op(Op::ForLoop);
        if let Some(cond) = &fs.cond {
            self.push_eval(cond);
        }
        if let Some(init) = &fs.init {
            self.push_exec(init);
        }
        Ok(())
    }

    pub(crate) fn do_for_loop(&mut self) -> Result<()> {
        let block = self.last_block()?;
        let (index, has_cond) = {
            let mut b = block.borrow_mut();
            let cur = b.cursor()?;
            (cur.next_index, cur.cond.is_some())
        };
        if index == CURSOR_START || index == CURSOR_COND {
            if has_cond && !self.pop_value()?.as_bool()? {
                return self.pop_frame_and_reset();
            }
            let mut b = block.borrow_mut();
            let cur = b.cursor()?;
            if index == CURSOR_START {
                cur.num_ops = self.ops.len();
                cur.num_values = self.values.len();
                cur.num_exprs = self.exprs.len();
                cur.num_stmts = self.stmts.len();
            }
            cur.next_index = 0;
        }
        let next = block.borrow_mut().cursor()?.next_stmt();
        if let Some(s) = next {
            self.push_exec(&s);
            return Ok(());
        }

        self.refresh_heap_items(&block)?;
        let (cond, post) = {
            let mut b = block.borrow_mut();
            let cur = b.cursor()?;
            cur.next_index = CURSOR_COND;
            (cur.cond.clone(), cur.post.clone())
        };
        if let Some(cond) = cond {
            self.push_eval(&cond);
        }
        if let Some(post) = post {
            self.push_exec(&post);
        }
        Ok(())
    }

    // =========================================================================
    // Range
    // =========================================================================

    fn exec_range(&mut self, rs: &RangeStmt) -> Result<()> {
        self.push_frame_basic(FrameKind::Range, rs.label.clone());
        let parent = self.last_block_value()?;
        let mut block = Block::new(&rs.block, parent);
        let mut cursor = BodyCursor::new(rs.body.clone());
        cursor.key.clone_from(&rs.key);
        cursor.value.clone_from(&rs.value);
        cursor.op = rs.op;
        block.body = Some(Box::new(cursor));
        self.push_block(Rc::new(RefCell::new(block)));
        self.push_op(Op::RangeIter);
        self.push_eval(&rs.x);
        Ok(())
    }

    /// Records loop-entry depths on the cursor and positions it for the
    /// first assignment. Returns false if the loop runs zero times.
    fn start_range(&mut self, block: &Rc<RefCell<Block>>, len: usize) -> Result<bool> {
        if len == 0 {
            return Ok(false);
        }
        let mut b = block.borrow_mut();
        let cur = b.cursor()?;
        cur.num_ops = self.ops.len();
        cur.num_values = self.values.len();
        cur.num_exprs = self.exprs.len();
        cur.num_stmts = self.stmts.len();
        cur.list_len = len;
        cur.list_index = 0;
        cur.str_index = 0;
        cur.next_index = CURSOR_COND;
        Ok(true)
    }

    /// Pushes the next body statement, or advances to the next element.
    /// Returns false when the body is done for this element.
    fn range_step(&mut self, block: &Rc<RefCell<Block>>) -> Result<bool> {
        let next = block.borrow_mut().cursor()?.next_stmt();
        match next {
            Some(s) => {
                self.push_exec(&s);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn range_targets(&self, block: &Rc<RefCell<Block>>) -> Result<(RangeOp, Option<Expr>, Option<Expr>)> {
        let mut b = block.borrow_mut();
        let cur = b.cursor()?;
        let live = |x: &Option<Expr>| x.clone().filter(|x| !matches!(x, Expr::Blank));
        Ok((cur.op, live(&cur.key), live(&cur.value)))
    }

    fn range_assign(&mut self, x: &Expr, op: RangeOp, tv: TypedValue) -> Result<()> {
        match (op, x) {
            (RangeOp::None, _) | (_, Expr::Blank) => Ok(()),
            (RangeOp::Define, Expr::Name(n)) => self.define_name(n, tv),
            (RangeOp::Assign, Expr::Name(n)) => {
                let block = self.block_at_depth(n.path.depth)?;
                self.set_var(&block, usize::from(n.path.index), tv)
            }
            (RangeOp::Define, _) => Err(Error::internal("range defines a non-name")),
            (RangeOp::Assign, _) => Err(Error::not_yet_implemented(
                "range assignment to a non-name target",
            )),
        }
    }

    fn set_cursor_index(block: &Rc<RefCell<Block>>, index: isize) -> Result<()> {
        block.borrow_mut().cursor()?.next_index = index;
        Ok(())
    }

    /// Range over arrays, slices and pointers to arrays. Strings and maps
    /// hand the loop over to their own op.
    pub(crate) fn do_range_iter(&mut self) -> Result<()> {
        let block = self.last_block()?;
        let index = block.borrow_mut().cursor()?.next_index;
        if index == CURSOR_START {
            let x = self.peek_value(1)?.clone();
            let len = match &x.v {
                Value::String(_) => {
                    self.replace_sticky(Op::RangeIterString)?;
                    return Ok(());
                }
                Value::Object(ObjectRef::Map(_)) => {
                    self.replace_sticky(Op::RangeIterMap)?;
                    return Ok(());
                }
                Value::Nil if x.kind() == Some(Kind::Map) => {
                    self.replace_sticky(Op::RangeIterMap)?;
                    return Ok(());
                }
                Value::Object(ObjectRef::Array(_)) => {
                    let copy = x.copy(&mut *self.store)?;
                    let len = copy.len()?;
                    *self.peek_value_mut(1)? = copy;
                    len
                }
                Value::Pointer(_) => {
                    let arr = self.deref(&x)?;
                    let len = arr.len()?;
                    *self.peek_value_mut(1)? = arr;
                    len
                }
                Value::Slice(s) => s.len,
                Value::Nil => 0,
                _ => return Err(Error::internal(format!("cannot range over {x}"))),
            };
            if !self.start_range(&block, len)? {
                return self.pop_frame_and_reset();
            }
        }

        let index = block.borrow_mut().cursor()?.next_index;
        if index == CURSOR_COND {
            let i = block.borrow_mut().cursor()?.list_index;
            let (op, kx, vx) = self.range_targets(&block)?;
            if let Some(kx) = kx {
                let key = TypedValue::int(i64::try_from(i).unwrap_or(i64::MAX));
                self.range_assign(&kx, op, key)?;
            }
            if let Some(vx) = vx {
                let x = self.peek_value(1)?.clone();
                let elem = match &x.v {
                    Value::Slice(s) => self.load_slot(&s.base_object(), s.offset + i)?,
                    Value::Object(o) => self.load_slot(o, i)?,
                    _ => return Err(Error::internal(format!("cannot index {x}"))),
                };
                self.range_assign(&vx, op, elem)?;
            }
            Self::set_cursor_index(&block, 0)?;
        }

        if self.range_step(&block)? {
            return Ok(());
        }
        let more = {
            let mut b = block.borrow_mut();
            let cur = b.cursor()?;
            cur.list_index += 1;
            cur.list_index < cur.list_len
        };
        if !more {
            return self.pop_frame_and_reset();
        }
        Self::set_cursor_index(&block, CURSOR_COND)
    }

    pub(crate) fn do_range_iter_string(&mut self) -> Result<()> {
        let block = self.last_block()?;
        let s = self.peek_value(1)?.as_str()?.clone();
        let index = block.borrow_mut().cursor()?.next_index;
        if index == CURSOR_START && !self.start_range(&block, s.len())? {
            return self.pop_frame_and_reset();
        }

        let index = block.borrow_mut().cursor()?.next_index;
        if index == CURSOR_COND {
            let at = block.borrow_mut().cursor()?.str_index;
            let c = s
                .get(at..)
                .and_then(|rest| rest.chars().next())
                .ok_or_else(|| Error::internal("string range past the end"))?;
            let (op, kx, vx) = self.range_targets(&block)?;
            if let Some(kx) = kx {
                self.range_assign(&kx, op, TypedValue::int(i64::try_from(at).unwrap_or(i64::MAX)))?;
            }
            if let Some(vx) = vx {
                self.range_assign(&vx, op, TypedValue::rune(c))?;
            }
            Self::set_cursor_index(&block, 0)?;
        }

        if self.range_step(&block)? {
            return Ok(());
        }
        let more = {
            let mut b = block.borrow_mut();
            let cur = b.cursor()?;
            let width = s
                .get(cur.str_index..)
                .and_then(|rest| rest.chars().next())
                .map_or(1, char::len_utf8);
            cur.str_index += width;
            cur.list_index += 1;
            cur.str_index < cur.list_len
        };
        if !more {
            return self.pop_frame_and_reset();
        }
        Self::set_cursor_index(&block, CURSOR_COND)
    }

    /// Range over a map in insertion order. Keys are snapshotted at loop
    /// entry; keys deleted during the loop are skipped.
    pub(crate) fn do_range_iter_map(&mut self) -> Result<()> {
        let block = self.last_block()?;
        let x = self.peek_value(1)?.clone();
        let map = match &x.v {
            Value::Object(o @ ObjectRef::Map(_)) => Some(o.clone()),
            _ => None,
        };
        let index = block.borrow_mut().cursor()?.next_index;
        if index == CURSOR_START {
            let keys: Vec<_> = match &map {
                Some(ObjectRef::Map(m)) => m.borrow().entries.keys().cloned().collect(),
                _ => Vec::new(),
            };
            if !self.start_range(&block, keys.len())? {
                return self.pop_frame_and_reset();
            }
            block.borrow_mut().cursor()?.map_keys = keys;
        }

        let index = block.borrow_mut().cursor()?.next_index;
        if index == CURSOR_COND {
            let Some(ObjectRef::Map(m)) = &map else {
                return Err(Error::internal("map range lost its map"));
            };
            let entry = {
                let mut b = block.borrow_mut();
                let cur = b.cursor()?;
                let mut found = None;
                while cur.list_index < cur.list_len {
                    let key = &cur.map_keys[cur.list_index];
                    if let Some((k, _)) = m.borrow().entries.get(key) {
                        found = Some((key.clone(), k.clone()));
                        break;
                    }
                    cur.list_index += 1;
                }
                found
            };
            let Some((mk, k)) = entry else {
                return self.pop_frame_and_reset();
            };
            let (op, kx, vx) = self.range_targets(&block)?;
            if let Some(vx) = vx {
                let map_obj = ObjectRef::Map(m.clone());
                let v = self
                    .map_get(&map_obj, &k)?
                    .ok_or_else(|| Error::internal(format!("map entry {mk:?} vanished")))?;
                self.range_assign(&vx, op, v)?;
            }
            if let Some(kx) = kx {
                self.range_assign(&kx, op, k)?;
            }
            Self::set_cursor_index(&block, 0)?;
        }

        if self.range_step(&block)? {
            return Ok(());
        }
        let more = {
            let mut b = block.borrow_mut();
            let cur = b.cursor()?;
            cur.list_index += 1;
            cur.list_index < cur.list_len
        };
        if !more {
            return self.pop_frame_and_reset();
        }
        Self::set_cursor_index(&block, CURSOR_COND)
    }

    fn replace_sticky(&mut self, op: Op) -> Result<()> {
        let top = self
            .ops
            .last_mut()
            .ok_or_else(|| Error::internal("op stack underflow"))?;
        *top = op;
        Ok(())
    }

    // =========================================================================
    // Switch
    // =========================================================================

    fn exec_switch(&mut self, ss: &Arc<SwitchStmt>) -> Result<()> {
        self.push_frame_basic(FrameKind::Switch, ss.label.clone());
        self.last_frame_mut()?.switch = Some(ss.clone());
        self.push_op(Op::PopFrameAndReset);
        let parent = self.last_block_value()?;
        self.push_block(Rc::new(RefCell::new(Block::new(&ss.block, parent))));
        self.push_op(Op::SwitchClause);
        self.push_value(TypedValue::int(0));
        self.push_value(TypedValue::int(0));
        match &ss.tag {
            Some(tag) => self.push_eval(tag),
            None => self.push_value(TypedValue::bool(true)),
        }
        if let Some(init) = &ss.init {
            self.push_exec(init);
        }
        Ok(())
    }

    fn switch_state(&self) -> Result<(usize, usize)> {
        let ci = self.peek_value(3)?.as_index()?;
        let ki = self.peek_value(2)?.as_index()?;
        let ci = usize::try_from(ci).map_err(|_| Error::internal("negative clause index"))?;
        let ki = usize::try_from(ki).map_err(|_| Error::internal("negative case index"))?;
        Ok((ci, ki))
    }

    fn current_switch(&self) -> Result<Arc<SwitchStmt>> {
        self.last_frame()?
            .switch
            .clone()
            .ok_or_else(|| Error::internal("switch op outside a switch frame"))
    }

    /// Schedules the next case expression, or enters the default clause
    /// once every case has been tried.
    pub(crate) fn do_switch_clause(&mut self) -> Result<()> {
        let ss = self.current_switch()?;
        let (mut ci, mut ki) = self.switch_state()?;
        while let Some(cl) = ss.clauses.get(ci) {
            if ki < cl.cases.len() {
                break;
            }
            ci += 1;
            ki = 0;
        }
        let Some(cl) = ss.clauses.get(ci) else {
            self.pop_values(3)?;
            return match ss.clauses.iter().position(|c| c.cases.is_empty()) {
                Some(default) => self.enter_switch_clause(&ss, default),
                None => Ok(()),
            };
        };
        *self.peek_value_mut(3)? = TypedValue::int(i64::try_from(ci).unwrap_or(i64::MAX));
        *self.peek_value_mut(2)? = TypedValue::int(i64::try_from(ki).unwrap_or(i64::MAX));
        self.push_op(Op::SwitchCase);
        self.push_eval(&cl.cases[ki]);
        Ok(())
    }

    pub(crate) fn do_switch_case(&mut self) -> Result<()> {
        let case = self.pop_value()?;
        let tag = self.peek_value(1)?.clone();
        let matched = binary::values_equal(&tag, &case, &mut *self.store)?;
        let (ci, ki) = self.switch_state()?;
        if matched {
            self.pop_values(3)?;
            let ss = self.current_switch()?;
            return self.enter_switch_clause(&ss, ci);
        }
        *self.peek_value_mut(2)? = TypedValue::int(i64::try_from(ki + 1).unwrap_or(i64::MAX));
        self.push_op(Op::SwitchClause);
        Ok(())
    }

    fn enter_switch_clause(&mut self, ss: &SwitchStmt, ci: usize) -> Result<()> {
        let cl = ss
            .clauses
            .get(ci)
            .ok_or_else(|| Error::internal(format!("switch has no clause {ci}")))?;
        trace!(clause = ci, "enter switch clause");
        let block = self.last_block()?;
        {
            let mut b = block.borrow_mut();
            b.values.truncate(ss.block.num_names());
            b.expand(&cl.clause.source);
            b.body = cursor_of(cl.clause.body.clone());
        }
        self.push_op(Op::Body);
        Ok(())
    }

    fn exec_type_switch(&mut self, s: &Stmt, ts: &TypeSwitchStmt) -> Result<()> {
        self.push_frame_basic(FrameKind::Switch, ts.label.clone());
        self.push_op(Op::PopFrameAndReset);
        let parent = self.last_block_value()?;
        self.push_block(Rc::new(RefCell::new(Block::new(&ts.block, parent))));
        self.push_stmt(s.clone());
        self.push_op(Op::TypeSwitch);
        self.push_eval(&ts.x);
        if let Some(init) = &ts.init {
            self.push_exec(init);
        }
        Ok(())
    }

    /// Picks the clause whose type list contains the dynamic type of the
    /// value. An interface case type matches any non-nil value.
    pub(crate) fn do_type_switch(&mut self) -> Result<()> {
        let Stmt::TypeSwitch(ts) = self.pop_stmt()? else {
            return Err(Error::internal("expected a type switch"));
        };
        let x = self.pop_value()?;
        let mut default = None;
        let mut chosen = None;
        for (ci, cl) in ts.clauses.iter().enumerate() {
            if cl.types.is_empty() {
                default = Some(ci);
                continue;
            }
            let hit = cl.types.iter().any(|t| match t {
                None => x.is_undefined(),
                Some(t) if t.is_interface() => !x.is_undefined(),
                Some(t) => x.t.as_ref() == Some(t),
            });
            if hit {
                chosen = Some(ci);
                break;
            }
        }
        let Some(ci) = chosen.or(default) else {
            return Ok(());
        };
        let cl = &ts.clauses[ci];
        let block = self.last_block()?;
        let base = ts.block.num_names();
        {
            let mut b = block.borrow_mut();
            b.values.truncate(base);
            b.expand(&cl.clause.source);
            b.body = cursor_of(cl.clause.body.clone());
        }
        if ts.binds {
            self.define_var(&block, base, x)?;
        }
        self.push_op(Op::Body);
        Ok(())
    }

    // =========================================================================
    // Branches
    // =========================================================================

    fn exec_branch(&mut self, bs: &BranchStmt) -> Result<()> {
        match bs.op {
            BranchOp::Break => {
                loop {
                    let fr = self.last_frame()?;
                    if fr.is_call() {
                        return Err(Error::internal("break outside a loop or switch"));
                    }
                    if fr.matches_label(bs.label.as_ref()) {
                        break;
                    }
                    self.frames.pop();
                }
                self.pop_frame_and_reset()
            }
            BranchOp::Continue => {
                loop {
                    let fr = self.last_frame()?;
                    if fr.is_call() {
                        return Err(Error::internal("continue outside a loop"));
                    }
                    let is_loop = matches!(fr.kind, FrameKind::For | FrameKind::Range);
                    if is_loop && fr.matches_label(bs.label.as_ref()) {
                        break;
                    }
                    self.frames.pop();
                }
                match self.last_frame()?.kind {
                    FrameKind::For => self.peek_frame_and_continue_for(),
                    _ => self.peek_frame_and_continue_range(),
                }
            }
            BranchOp::Goto => self.goto_jump(bs.block_depth, bs.body_index),
            BranchOp::Fallthrough => self.fallthrough(bs.body_index),
        }
    }

    fn goto_jump(&mut self, block_depth: u16, body_index: usize) -> Result<()> {
        for _ in 0..block_depth {
            self.pop_block()?;
        }
        let nblocks = self.blocks.len();
        while let Some(fr) = self.frames.last() {
            if fr.is_call() || fr.depths.blocks < nblocks {
                break;
            }
            self.frames.pop();
        }
        let block = self.last_block()?;
        let mut b = block.borrow_mut();
        let cur = b.cursor()?;
        self.ops.truncate(cur.num_ops);
        self.values.truncate(cur.num_values);
        self.exprs.truncate(cur.num_exprs);
        self.stmts.truncate(cur.num_stmts);
        cur.next_index =
            isize::try_from(body_index).map_err(|_| Error::internal("goto target overflow"))?;
        Ok(())
    }

    fn fallthrough(&mut self, clause_index: usize) -> Result<()> {
        let fr = self.last_frame()?;
        if fr.kind != FrameKind::Switch {
            return Err(Error::internal("fallthrough outside a switch"));
        }
        let d = fr.depths;
        let ss = self.current_switch()?;
        self.ops.truncate(d.ops + 1);
        self.values.truncate(d.values);
        self.exprs.truncate(d.exprs);
        self.stmts.truncate(d.stmts);
        self.blocks.truncate(d.blocks + 1);
        self.enter_switch_clause(&ss, clause_index + 1)
    }

    // =========================================================================
    // Return and defer
    // =========================================================================

    fn exec_return(&mut self, results: &Arc<[Expr]>) -> Result<()> {
        let has_defers = !self.last_call_frame()?.defers.is_empty();
        if has_defers {
            self.push_op(Op::ReturnFromBlock);
            self.push_op(Op::ReturnCallDefers);
            if !results.is_empty() {
                self.push_op(Op::ReturnToBlock);
            }
        } else if results.is_empty() {
            self.push_op(Op::ReturnFromBlock);
        } else {
            self.push_op(Op::Return);
        }
        for x in results.iter().rev() {
            self.push_eval(x);
        }
        Ok(())
    }

    /// Registers a deferred call with its function and arguments evaluated.
    pub(crate) fn do_defer(&mut self) -> Result<()> {
        let Stmt::Defer(cx) = self.pop_stmt()? else {
            return Err(Error::internal("expected a defer statement"));
        };
        let args = self.pop_values(cx.num_args)?;
        let func = self.pop_value()?;
        let panic_scope = self.panic_scope;
        self.last_call_frame_mut()?.defers.push(Defer {
            func,
            args,
            is_varg: cx.varg,
            panic_scope,
        });
        Ok(())
    }
}
