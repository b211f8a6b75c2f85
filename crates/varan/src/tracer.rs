//! Execution tracing hooks.
//!
//! A [`VmTracer`] receives callbacks from the dispatch loop at instruction,
//! call, and unwind boundaries. The default [`NoopTracer`] compiles to
//! nothing; [`StderrTracer`] prints a line per event for debugging guest
//! programs or the engine itself.

use crate::{bytecode::Op, exception::VmException};

/// Observer for VM execution events. All methods default to no-ops so
/// implementors override only what they need.
pub trait VmTracer {
    /// Called before each instruction is executed.
    fn on_instruction(&mut self, code_name: &str, pc: usize, op: &Op) {
        let _ = (code_name, pc, op);
    }

    /// Called when a frame is pushed.
    fn on_call(&mut self, code_name: &str, depth: usize) {
        let _ = (code_name, depth);
    }

    /// Called when a frame returns normally.
    fn on_return(&mut self, code_name: &str) {
        let _ = code_name;
    }

    /// Called when an exception begins unwinding out of a frame.
    fn on_unwind(&mut self, code_name: &str, exc: &VmException) {
        let _ = (code_name, exc);
    }
}

/// The default tracer: does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl VmTracer for NoopTracer {}

/// Prints one line per event to stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrTracer;

impl VmTracer for StderrTracer {
    fn on_instruction(&mut self, code_name: &str, pc: usize, op: &Op) {
        eprintln!("[{code_name}] {pc:>4} {op:?}");
    }

    fn on_call(&mut self, code_name: &str, depth: usize) {
        eprintln!("[{code_name}] call (depth {depth})");
    }

    fn on_return(&mut self, code_name: &str) {
        eprintln!("[{code_name}] return");
    }

    fn on_unwind(&mut self, code_name: &str, exc: &VmException) {
        eprintln!("[{code_name}] unwind: {exc}");
    }
}
