//! Frames, deferred calls and in-flight panics.

use std::fmt;
use std::sync::Arc;

use realmvm_foundation::{FuncType, ObjectRef, SwitchStmt, TypedValue};

/// What pushed a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    /// Function call (guest, builtin or host).
    Call,
    /// `for` loop.
    For,
    /// `range` loop.
    Range,
    /// Expression or type switch.
    Switch,
}

/// Stack depths recorded when a frame or cursor is entered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StackDepths {
    /// Op stack.
    pub ops: usize,
    /// Value stack.
    pub values: usize,
    /// Expression stack.
    pub exprs: usize,
    /// Statement stack.
    pub stmts: usize,
    /// Block stack.
    pub blocks: usize,
    /// Frame stack.
    pub frames: usize,
}

/// A deferred call, with its function and arguments already evaluated.
#[derive(Clone, Debug)]
pub struct Defer {
    /// Function or bound method value.
    pub func: TypedValue,
    /// Evaluated arguments.
    pub args: Vec<TypedValue>,
    /// True if the last argument is spread.
    pub is_varg: bool,
    /// Panic scope when the defer statement ran.
    pub panic_scope: u64,
}

/// A raised panic value.
#[derive(Clone, Debug)]
pub struct Exception {
    /// The value passed to `panic` (or the runtime error text).
    pub value: TypedValue,
    /// Panic scope this exception opened.
    pub scope: u64,
}

/// One entry of the frame stack.
#[derive(Clone)]
pub struct Frame {
    /// What pushed the frame.
    pub kind: FrameKind,
    /// Loop or switch label.
    pub label: Option<Arc<str>>,
    /// Depths to restore when the frame is popped.
    pub depths: StackDepths,
    /// Switch statement, for `fallthrough`.
    pub switch: Option<Arc<SwitchStmt>>,

    /// Called function.
    pub func: Option<ObjectRef>,
    /// Signature of the called function.
    pub func_type: Option<Arc<FuncType>>,
    /// Bound receiver.
    pub receiver: Option<TypedValue>,
    /// Argument values on the stack above the callee.
    pub num_args: usize,
    /// True if the last argument is already a slice.
    pub is_varg: bool,
    /// Pending deferred calls, run last to first.
    pub defers: Vec<Defer>,

    /// Package active before the call.
    pub last_package: Option<ObjectRef>,
    /// Realm active before the call.
    pub last_realm: Option<Arc<str>>,

    /// True for a frame running a deferred call.
    pub is_defer: bool,
    /// Panic scope at which the running deferred call was registered.
    pub defer_panic_scope: u64,
}

impl Frame {
    /// Loop or switch frame.
    #[must_use]
    pub fn basic(kind: FrameKind, label: Option<Arc<str>>, depths: StackDepths) -> Self {
        Self {
            kind,
            label,
            depths,
            switch: None,
            func: None,
            func_type: None,
            receiver: None,
            num_args: 0,
            is_varg: false,
            defers: Vec::new(),
            last_package: None,
            last_realm: None,
            is_defer: false,
            defer_panic_scope: 0,
        }
    }

    /// Call frame.
    #[must_use]
    pub fn call(depths: StackDepths, func: ObjectRef, func_type: Arc<FuncType>) -> Self {
        Self {
            func: Some(func),
            func_type: Some(func_type),
            ..Self::basic(FrameKind::Call, None, depths)
        }
    }

    /// True for call frames.
    #[must_use]
    pub fn is_call(&self) -> bool {
        self.kind == FrameKind::Call
    }

    /// Number of declared results of the called function.
    #[must_use]
    pub fn num_results(&self) -> usize {
        self.func_type.as_ref().map_or(0, |ft| ft.results.len())
    }

    /// True if this loop or switch frame is the target of a branch.
    #[must_use]
    pub fn matches_label(&self, label: Option<&Arc<str>>) -> bool {
        match label {
            None => true,
            Some(l) => self.label.as_ref() == Some(l),
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("depths", &self.depths)
            .field("num_args", &self.num_args)
            .field("defers", &self.defers.len())
            .field("is_defer", &self.is_defer)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FrameKind::Call => {
                let name = self
                    .func
                    .as_ref()
                    .and_then(|o| match o {
                        ObjectRef::Func(fv) => Some(fv.borrow().name.to_string()),
                        _ => None,
                    })
                    .unwrap_or_default();
                write!(f, "[FRAME FUNC:{name} ARGS:{}]", self.num_args)
            }
            kind => write!(
                f,
                "[FRAME {kind:?} LABEL:{}]",
                self.label.as_deref().unwrap_or("")
            ),
        }
    }
}
