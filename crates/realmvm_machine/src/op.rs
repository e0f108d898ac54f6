//! Operations of the machine's op stack.
//!
//! Ops carry only small inline data. A handler that needs an AST node finds
//! it on the expression or statement stack, where the op that scheduled it
//! left it.

#![allow(clippy::doc_markdown)]

use std::fmt;

use realmvm_foundation::{BinaryOp, UnaryOp};

/// A single pending operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    // === Control ===
    /// Stops the run loop (marks the bottom of a nested run).
    Halt,
    /// Pops values down to the given depth (expression statements).
    PopResults(usize),
    /// Pops the top block.
    PopBlock,
    /// Pops the top frame and truncates every stack to its entry depths.
    PopFrameAndReset,

    // === Statements ===
    /// Executes the statement on top of the stmt stack.
    Exec,
    /// Steps the body cursor of the top block. Sticky.
    Body,
    /// Steps a `for` loop. Sticky.
    ForLoop,
    /// Steps a range over an array or slice. Sticky.
    RangeIter,
    /// Steps a range over a string. Sticky.
    RangeIterString,
    /// Steps a range over a map. Sticky.
    RangeIterMap,
    /// Picks the branch of an `if` from the condition value.
    IfCond,
    /// Advances to the next case expression of a switch.
    SwitchClause,
    /// Compares the tag against one case value.
    SwitchCase,
    /// Selects the clause of a type switch.
    TypeSwitch,
    /// `lhs = rhs`: `[targets.., values..] -> []`
    Assign,
    /// `lhs := rhs`: `[values..] -> []`
    Define,
    /// `x op= y`: `[target.., y] -> []`
    AssignOp(BinaryOp),
    /// `x++` (true) or `x--` (false).
    IncDec(bool),
    /// `var` declaration with values.
    ValueDecl,
    /// Records a deferred call on the current call frame.
    Defer,

    // === Calls ===
    /// Inspects the callee under the arguments and dispatches.
    Precall,
    /// Enters the function of the top call frame.
    Call,
    /// Runs a builtin or host function of the top call frame.
    CallNative,
    /// Returns the values on top of the stack.
    Return,
    /// Returns the result slots of the call block.
    ReturnFromBlock,
    /// Copies returned values into the result slots of the call block.
    ReturnToBlock,
    /// Runs the next deferred call of the current frame. Sticky.
    ReturnCallDefers,
    /// Continues unwinding after a frame's defers have run.
    Panic2,

    // === Expressions ===
    /// Evaluates the expression on top of the expr stack.
    Eval,
    /// Short-circuit step of `&&` / `||`.
    Binary1,
    /// Binary operator: `[a, b] -> [a op b]`
    Binary(BinaryOp),
    /// Unary operator: `[a] -> [op a]`
    Unary(UnaryOp),
    /// Index: `[x, i] -> [x[i]]`
    Index,
    /// Slice: `[x, lo?, hi?] -> [x[lo:hi]]`
    Slice,
    /// Struct field: `[x] -> [x.f]`
    SelectField(usize),
    /// Method value: `[x] -> [x.m]`
    SelectMethod,
    /// Dereference: `[p] -> [*p]`
    Star,
    /// Address-of: `[target..] -> [&x]`
    Ref,
    /// Composite literal: `[elems..] -> [T{..}]`
    CompositeLit,
    /// Conversion: `[T, x] -> [T(x)]`
    Convert,
}

impl Op {
    /// Sticky ops stay on the op stack while they run; their handlers pop
    /// them when they are done.
    #[must_use]
    pub fn is_sticky(self) -> bool {
        matches!(
            self,
            Self::Body
                | Self::ForLoop
                | Self::RangeIter
                | Self::RangeIterString
                | Self::RangeIterMap
                | Self::ReturnCallDefers
        )
    }

    /// Cycle cost charged before dispatch.
    #[must_use]
    pub fn cost(self) -> u64 {
        match self {
            Self::Halt | Self::PopResults(_) | Self::PopBlock => 1,
            Self::Exec | Self::Eval | Self::Body => 2,
            Self::Binary(op) => match op {
                BinaryOp::Quo | BinaryOp::Rem => 8,
                BinaryOp::Mul | BinaryOp::Shl | BinaryOp::Shr => 5,
                _ => 3,
            },
            Self::Unary(_) | Self::Binary1 | Self::IfCond | Self::Star | Self::SelectField(_) => 3,
            Self::ForLoop
            | Self::RangeIter
            | Self::RangeIterString
            | Self::SwitchClause
            | Self::SwitchCase
            | Self::TypeSwitch
            | Self::Index
            | Self::Ref => 4,
            Self::RangeIterMap | Self::Slice | Self::Convert | Self::SelectMethod => 6,
            Self::Assign
            | Self::Define
            | Self::AssignOp(_)
            | Self::IncDec(_)
            | Self::ValueDecl
            | Self::PopFrameAndReset => 5,
            Self::Return | Self::ReturnFromBlock | Self::ReturnToBlock | Self::Defer => 8,
            Self::CompositeLit => 10,
            Self::Precall | Self::ReturnCallDefers | Self::Panic2 => 12,
            Self::Call | Self::CallNative => 20,
        }
    }

    /// Short name for diagnostics.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Halt => "Halt",
            Self::PopResults(_) => "PopResults",
            Self::PopBlock => "PopBlock",
            Self::PopFrameAndReset => "PopFrameAndReset",
            Self::Exec => "Exec",
            Self::Body => "Body",
            Self::ForLoop => "ForLoop",
            Self::RangeIter => "RangeIter",
            Self::RangeIterString => "RangeIterString",
            Self::RangeIterMap => "RangeIterMap",
            Self::IfCond => "IfCond",
            Self::SwitchClause => "SwitchClause",
            Self::SwitchCase => "SwitchCase",
            Self::TypeSwitch => "TypeSwitch",
            Self::Assign => "Assign",
            Self::Define => "Define",
            Self::AssignOp(_) => "AssignOp",
            Self::IncDec(_) => "IncDec",
            Self::ValueDecl => "ValueDecl",
            Self::Defer => "Defer",
            Self::Precall => "Precall",
            Self::Call => "Call",
            Self::CallNative => "CallNative",
            Self::Return => "Return",
            Self::ReturnFromBlock => "ReturnFromBlock",
            Self::ReturnToBlock => "ReturnToBlock",
            Self::ReturnCallDefers => "ReturnCallDefers",
            Self::Panic2 => "Panic2",
            Self::Eval => "Eval",
            Self::Binary1 => "Binary1",
            Self::Binary(_) => "Binary",
            Self::Unary(_) => "Unary",
            Self::Index => "Index",
            Self::Slice => "Slice",
            Self::SelectField(_) => "SelectField",
            Self::SelectMethod => "SelectMethod",
            Self::Star => "Star",
            Self::Ref => "Ref",
            Self::CompositeLit => "CompositeLit",
            Self::Convert => "Convert",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PopResults(depth) => write!(f, "PopResults({depth})"),
            Self::Binary(op) => write!(f, "Binary({op:?})"),
            Self::Unary(op) => write!(f, "Unary({op:?})"),
            Self::AssignOp(op) => write!(f, "AssignOp({op:?})"),
            Self::IncDec(inc) => f.write_str(if *inc { "Inc" } else { "Dec" }),
            Self::SelectField(i) => write!(f, "SelectField({i})"),
            other => f.write_str(other.name()),
        }
    }
}
