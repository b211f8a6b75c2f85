//! Assembly-level construction of code objects.
//!
//! The builder tracks instruction offsets so forward jumps can be emitted
//! with a placeholder and patched once the target position is known, and
//! records exception-table spans over half-open instruction ranges.

use std::rc::Rc;

use crate::{
    bytecode::{Code, ExceptionEntry, Op},
    value::Value,
};

/// An unpatched forward jump.
#[derive(Debug, Clone, Copy)]
#[must_use = "a jump label must be patched or the branch targets instruction 0"]
pub struct JumpLabel(usize);

/// Incremental builder for a [`Code`] object.
#[derive(Debug)]
pub struct CodeBuilder {
    name: Rc<str>,
    num_params: u32,
    num_locals: u32,
    ops: Vec<Op>,
    consts: Vec<Value>,
    names: Vec<Rc<str>>,
    nested: Vec<Rc<Code>>,
    exception_table: Vec<ExceptionEntry>,
}

impl CodeBuilder {
    /// Starts a code object. The first `num_params` of `num_locals` locals
    /// are filled from call arguments.
    #[must_use]
    pub fn new(name: impl AsRef<str>, num_params: u32, num_locals: u32) -> Self {
        debug_assert!(num_params <= num_locals);
        Self {
            name: Rc::from(name.as_ref()),
            num_params,
            num_locals,
            ops: Vec::new(),
            consts: Vec::new(),
            names: Vec::new(),
            nested: Vec::new(),
            exception_table: Vec::new(),
        }
    }

    /// Appends a constant, returning its pool index.
    pub fn add_const(&mut self, value: Value) -> u32 {
        self.consts.push(value);
        u32::try_from(self.consts.len() - 1).unwrap_or(u32::MAX)
    }

    /// Interns a name, returning its table index.
    pub fn add_name(&mut self, name: &str) -> u32 {
        if let Some(idx) = self.names.iter().position(|n| &**n == name) {
            return u32::try_from(idx).unwrap_or(u32::MAX);
        }
        self.names.push(Rc::from(name));
        u32::try_from(self.names.len() - 1).unwrap_or(u32::MAX)
    }

    /// Appends a nested code object (a function body defined inside this
    /// one), returning its index for `MakeFunction`.
    pub fn add_nested(&mut self, code: Code) -> u32 {
        self.nested.push(Rc::new(code));
        u32::try_from(self.nested.len() - 1).unwrap_or(u32::MAX)
    }

    /// Appends an instruction.
    pub fn emit(&mut self, op: Op) {
        self.ops.push(op);
    }

    /// Appends a branching instruction with a placeholder target; the
    /// returned label is patched later with [`Self::patch_jump`].
    pub fn emit_jump(&mut self, op: Op) -> JumpLabel {
        debug_assert!(matches!(
            op,
            Op::Jump(_) | Op::PopJumpIfFalse(_) | Op::PopJumpIfTrue(_) | Op::ForIter(_)
        ));
        self.ops.push(op);
        JumpLabel(self.ops.len() - 1)
    }

    /// Points a previously emitted jump at the current position.
    pub fn patch_jump(&mut self, label: JumpLabel) {
        let target = self.position();
        let patched = self.ops[label.0].set_jump_target(target);
        debug_assert!(patched, "patch target is not a branching instruction");
    }

    /// Current instruction offset (the index the next `emit` will occupy).
    #[must_use]
    pub fn position(&self) -> u32 {
        u32::try_from(self.ops.len()).unwrap_or(u32::MAX)
    }

    /// Registers an exception handler for the half-open instruction range
    /// `[start, end)`. On a catchable raise inside the range, the operand
    /// stack is cut back to `stack_depth`, the exception is pushed, and
    /// control moves to `handler`.
    pub fn add_exception_span(&mut self, start: u32, end: u32, handler: u32, stack_depth: u32) {
        debug_assert!(start <= end);
        self.exception_table.push(ExceptionEntry {
            start,
            end,
            handler,
            stack_depth,
        });
    }

    /// Finalizes the code object.
    #[must_use]
    pub fn finish(self) -> Code {
        Code {
            name: self.name,
            num_params: self.num_params,
            num_locals: self.num_locals,
            ops: self.ops,
            consts: self.consts,
            names: self.names,
            nested: self.nested,
            exception_table: self.exception_table,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_jump_patching() {
        let mut b = CodeBuilder::new("test", 0, 0);
        let c = b.add_const(Value::Bool(true));
        b.emit(Op::LoadConst(c));
        let label = b.emit_jump(Op::PopJumpIfFalse(u32::MAX));
        b.emit(Op::LoadConst(c));
        b.patch_jump(label);
        b.emit(Op::Return);
        let code = b.finish();
        assert_eq!(code.ops[1], Op::PopJumpIfFalse(3));
    }

    #[test]
    fn names_are_interned() {
        let mut b = CodeBuilder::new("test", 0, 0);
        let a = b.add_name("x");
        let c = b.add_name("y");
        let again = b.add_name("x");
        assert_eq!(a, again);
        assert_ne!(a, c);
    }

    #[test]
    fn innermost_handler_wins() {
        let mut b = CodeBuilder::new("test", 0, 0);
        for _ in 0..8 {
            b.emit(Op::Pop);
        }
        b.add_exception_span(0, 8, 6, 0);
        b.add_exception_span(2, 5, 7, 1);
        let code = b.finish();
        assert_eq!(code.find_handler(3).unwrap().handler, 7);
        assert_eq!(code.find_handler(6).unwrap().handler, 6);
        assert!(code.find_handler(8).is_none());
    }
}
