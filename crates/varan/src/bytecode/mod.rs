//! Compiled-code artifacts consumed by the execution engine.
//!
//! A [`Code`] object is the opaque unit of execution: a named instruction
//! sequence plus its constant pool, name table, nested code objects (for
//! functions defined within it), and exception table. Code objects are
//! produced by an external compiler through [`CodeBuilder`].

mod builder;
mod op;

use std::rc::Rc;

pub use builder::CodeBuilder;
pub use op::Op;

use crate::value::Value;

/// One entry of a code object's exception table.
///
/// When an instruction in `[start, end)` raises a catchable exception, the
/// operand stack is truncated to `stack_depth`, the exception value is
/// pushed, and control transfers to `handler`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionEntry {
    pub(crate) start: u32,
    pub(crate) end: u32,
    pub(crate) handler: u32,
    pub(crate) stack_depth: u32,
}

/// A compiled unit: function body, class body, or module top level.
#[derive(Debug)]
pub struct Code {
    name: Rc<str>,
    /// The first `num_params` locals are filled from call arguments.
    num_params: u32,
    num_locals: u32,
    pub(crate) ops: Vec<Op>,
    pub(crate) consts: Vec<Value>,
    pub(crate) names: Vec<Rc<str>>,
    pub(crate) nested: Vec<Rc<Code>>,
    pub(crate) exception_table: Vec<ExceptionEntry>,
}

impl Code {
    /// Human-readable name for diagnostics and frame records.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of declared parameters.
    #[must_use]
    pub fn num_params(&self) -> u32 {
        self.num_params
    }

    pub(crate) fn num_locals(&self) -> usize {
        self.num_locals as usize
    }

    /// Finds the innermost exception-table entry covering `pc`, preferring
    /// later (more deeply nested) entries.
    pub(crate) fn find_handler(&self, pc: u32) -> Option<&ExceptionEntry> {
        self.exception_table
            .iter()
            .rev()
            .find(|entry| entry.start <= pc && pc < entry.end)
    }
}
