//! Decoded instruction set.
//!
//! Instructions are stored pre-decoded as enum values rather than as a byte
//! stream; operands index into the owning code object's constant, name, or
//! nested-code tables. Jump operands are absolute instruction offsets.

use crate::slots::{BinaryOp, CompareOp, UnaryOp};

/// One VM instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    /// Push `consts[idx]`.
    LoadConst(u32),
    /// Push local `idx`; unbound locals raise `NameError`.
    LoadLocal(u32),
    /// Pop into local `idx`.
    StoreLocal(u32),
    /// Unbind local `idx`.
    DeleteLocal(u32),
    /// Push the global (or builtin) bound to `names[idx]`.
    LoadGlobal(u32),
    /// Pop into the global `names[idx]`.
    StoreGlobal(u32),
    /// Remove the global `names[idx]`.
    DeleteGlobal(u32),

    /// Pop receiver, push attribute `names[idx]` (full descriptor and
    /// interception protocol).
    LoadAttr(u32),
    /// Stack `[.., receiver, value]`: assign attribute `names[idx]`.
    StoreAttr(u32),
    /// Pop receiver, delete attribute `names[idx]`.
    DeleteAttr(u32),

    /// Stack `[.., obj, key]`: push `obj[key]`.
    LoadItem,
    /// Stack `[.., obj, key, value]`: `obj[key] = value`.
    StoreItem,
    /// Stack `[.., obj, key]`: `del obj[key]`.
    DeleteItem,

    /// Discard the top of stack.
    Pop,
    /// Duplicate the top of stack.
    Dup,
    /// Swap the top two stack values.
    Swap,

    /// Pop `n` values, push a list (top of stack is the last element).
    BuildList(u32),
    /// Pop `n` values, push a tuple.
    BuildTuple(u32),
    /// Pop `n` key/value pairs (`[.., k1, v1, .., kn, vn]`), push a dict.
    BuildDict(u32),

    /// Stack `[.., lhs, rhs]`: apply a binary operator with full
    /// forward/reflected fallback.
    Binary(BinaryOp),
    /// Stack `[.., lhs, rhs]`: apply the in-place form, falling back to the
    /// forward form.
    Inplace(BinaryOp),
    /// Stack `[.., lhs, rhs]`: apply a comparison.
    Compare(CompareOp),
    /// Apply a unary operator to the top of stack.
    Unary(UnaryOp),
    /// Stack `[.., item, container]`: membership test, optionally negated.
    Contains { negate: bool },
    /// Stack `[.., lhs, rhs]`: identity test, optionally negated.
    Is { negate: bool },

    /// Unconditional jump to instruction offset.
    Jump(u32),
    /// Pop; jump when falsy.
    PopJumpIfFalse(u32),
    /// Pop; jump when truthy.
    PopJumpIfTrue(u32),

    /// Pop a value, push an iterator over it.
    GetIter,
    /// With an iterator on top: push its next value, or on exhaustion pop
    /// the iterator and jump to the offset.
    ForIter(u32),

    /// Stack `[.., callee, arg1..argn]`: call with `n` positional arguments.
    Call(u32),
    /// Return the top of stack from the current frame.
    Return,

    /// Push a function built from `nested[idx]`, capturing the current
    /// globals.
    MakeFunction(u32),
    /// Stack `[.., bases(list), members(dict)]`: build a class named
    /// `names[idx]` and push it.
    BuildClass(u32),

    /// Pop an exception (class or instance) and raise it.
    Raise,
    /// Re-raise the exception on top of the stack without popping frames'
    /// handler state.
    Reraise,
    /// Stack `[.., exc, handler_class]`: pop the class, push whether the
    /// exception matches it (the exception stays on the stack).
    CheckExcMatch,

    /// Pop a context manager, invoke its enter slot, push the manager back
    /// followed by the enter result.
    EnterWith,
    /// Stack `[.., manager]`: normal block exit; invoke the exit slot with
    /// the no-exception triple and discard its result.
    ExitWith,
    /// Stack `[.., manager, exc]`: exceptional block exit; invoke the exit
    /// slot with exception info. A truthy return swallows the exception,
    /// otherwise it is re-raised.
    ExitWithExcept,

    /// Push the module registered under the dotted name `names[idx]`,
    /// consulting the pluggable loader on a miss.
    Import(u32),
}

impl Op {
    /// Rewrites the jump target of a branching instruction. Returns false
    /// for non-branching instructions.
    pub(crate) fn set_jump_target(&mut self, target: u32) -> bool {
        match self {
            Self::Jump(t) | Self::PopJumpIfFalse(t) | Self::PopJumpIfTrue(t) | Self::ForIter(t) => {
                *t = target;
                true
            }
            _ => false,
        }
    }
}
