//! Lexical blocks and the loop/body cursor the machine keeps on them.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::nodes::{BlockSource, Expr, Location, RangeOp, Stmt};
use crate::object::{ObjectInfo, ObjectRef};
use crate::types::Type;
use crate::value::{MapKey, PointerValue, TypedValue, Value};

/// Body-statement index before the first iteration starts.
pub const CURSOR_START: isize = -2;
/// Body-statement index while the loop condition or range assignment runs.
pub const CURSOR_COND: isize = -1;

/// Execution state of the statement list currently running in a block.
///
/// Loops record the stack depths at entry so `continue` can restore them.
#[derive(Clone, Debug)]
pub struct BodyCursor {
    /// Statements being executed.
    pub body: Arc<[Stmt]>,
    /// Index of the next statement; see [`CURSOR_START`] and [`CURSOR_COND`].
    pub next_index: isize,
    /// Operation stack depth at loop entry.
    pub num_ops: usize,
    /// Value stack depth at loop entry.
    pub num_values: usize,
    /// Expression stack depth at loop entry.
    pub num_exprs: usize,
    /// Statement stack depth at loop entry.
    pub num_stmts: usize,
    /// `for` condition.
    pub cond: Option<Expr>,
    /// `for` post statement.
    pub post: Option<Stmt>,
    /// Statement currently executing, for diagnostics.
    pub active: Option<Stmt>,
    /// Range key target.
    pub key: Option<Expr>,
    /// Range value target.
    pub value: Option<Expr>,
    /// Range binding mode.
    pub op: RangeOp,
    /// Range length snapshot.
    pub list_len: usize,
    /// Range position (element index, or rune count for strings).
    pub list_index: usize,
    /// Byte offset into a ranged string.
    pub str_index: usize,
    /// Snapshot of map keys for map ranges.
    pub map_keys: Vec<MapKey>,
}

impl BodyCursor {
    /// Cursor positioned before the first statement.
    #[must_use]
    pub fn new(body: Arc<[Stmt]>) -> Self {
        Self {
            body,
            next_index: CURSOR_START,
            num_ops: 0,
            num_values: 0,
            num_exprs: 0,
            num_stmts: 0,
            cond: None,
            post: None,
            active: None,
            key: None,
            value: None,
            op: RangeOp::None,
            list_len: 0,
            list_index: 0,
            str_index: 0,
            map_keys: Vec::new(),
        }
    }

    /// Number of statements in the body.
    #[must_use]
    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Next statement, advancing the cursor; `None` at the end of the body.
    pub fn next_stmt(&mut self) -> Option<Stmt> {
        let i = usize::try_from(self.next_index).ok()?;
        let stmt = self.body.get(i).cloned()?;
        self.next_index += 1;
        self.active = Some(stmt.clone());
        Some(stmt)
    }

    /// Moves the cursor past the end of the body.
    pub fn finish(&mut self) {
        self.next_index = isize::try_from(self.body.len()).unwrap_or(isize::MAX);
    }
}

/// A lexical scope instance: slot values plus a parent link.
#[derive(Debug)]
pub struct Block {
    /// Ownership info.
    pub info: ObjectInfo,
    /// Where the scope begins.
    pub location: Location,
    /// Slot values (heap-item slots hold a heap-item object).
    pub values: Vec<TypedValue>,
    /// Parent block (a block object, an unloaded reference, or nil).
    pub parent: Value,
    /// Transient body cursor; never persisted.
    pub body: Option<Box<BodyCursor>>,
}

impl Block {
    /// Creates a block with one undefined slot per name.
    ///
    /// Slots marked as heap items get a fresh heap item each.
    #[must_use]
    pub fn new(source: &BlockSource, parent: Value) -> Self {
        let mut block = Self {
            info: ObjectInfo::default(),
            location: source.location.clone(),
            values: Vec::with_capacity(source.num_names()),
            parent,
            body: None,
        };
        block.expand(source);
        block
    }

    /// Creates an empty block shell (used when decoding persisted blocks).
    #[must_use]
    pub fn shell(location: Location) -> Self {
        Self {
            info: ObjectInfo::default(),
            location,
            values: Vec::new(),
            parent: Value::Nil,
            body: None,
        }
    }

    /// Appends the slots of a clause scope.
    pub fn expand(&mut self, source: &BlockSource) {
        for i in 0..source.num_names() {
            if source.is_heap_item(i) {
                self.values.push(TypedValue::heap_item(TypedValue::undefined()));
            } else {
                self.values.push(TypedValue::undefined());
            }
        }
    }

    /// The parent block, if it is loaded.
    #[must_use]
    pub fn parent_block(&self) -> Option<Rc<RefCell<Block>>> {
        match &self.parent {
            Value::Object(ObjectRef::Block(b)) => Some(b.clone()),
            _ => None,
        }
    }

    /// Reads a variable, looking through heap items.
    ///
    /// # Errors
    ///
    /// Returns an internal error for a missing slot.
    pub fn get(&self, index: usize) -> Result<TypedValue> {
        let slot = self.slot(index)?;
        match (&slot.t, &slot.v) {
            (Some(Type::HeapItem), Value::Object(ObjectRef::HeapItem(h))) => {
                Ok(h.borrow().value.clone())
            }
            _ => Ok(slot.clone()),
        }
    }

    /// Raw slot value (the heap item itself for captured variables).
    ///
    /// # Errors
    ///
    /// Returns an internal error for a missing slot.
    pub fn slot(&self, index: usize) -> Result<&TypedValue> {
        self.values.get(index).ok_or_else(|| {
            Error::internal(format!("no slot {index} in block at {}", self.location))
        })
    }

    /// True if the slot holds a heap item.
    #[must_use]
    pub fn is_heap_item(&self, index: usize) -> bool {
        self.values
            .get(index)
            .is_some_and(|tv| matches!(tv.t, Some(Type::HeapItem)))
    }

    /// Pointer to a variable: into its heap item if captured, otherwise into
    /// the block slot.
    ///
    /// # Errors
    ///
    /// Returns an internal error for a missing slot.
    pub fn pointer_to(this: &Rc<RefCell<Block>>, index: usize) -> Result<PointerValue> {
        let b = this.borrow();
        let slot = b.slot(index)?;
        match (&slot.t, &slot.v) {
            (Some(Type::HeapItem), Value::Object(item)) => Ok(PointerValue {
                base: item.clone(),
                index: 0,
            }),
            _ => Ok(PointerValue {
                base: ObjectRef::Block(this.clone()),
                index,
            }),
        }
    }

    /// Body cursor.
    ///
    /// # Errors
    ///
    /// Returns an internal error if no body is executing in this block.
    pub fn cursor(&mut self) -> Result<&mut BodyCursor> {
        self.body
            .as_deref_mut()
            .ok_or_else(|| Error::internal(format!("no body cursor in block at {}", self.location)))
    }
}
