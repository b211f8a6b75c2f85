//! An embeddable, sandboxed runtime for a dynamic, class-based language.
//!
//! varan executes compiled bytecode under strict resource governance:
//! recursion depth, allocation bytes, per-collection size, wall-clock
//! deadlines, instruction budgets, and external cancellation. The object
//! model supports multiple inheritance with C3 linearization, operator
//! overloading through protocol ("dunder") slots, iterators, context
//! managers, descriptors, and attribute interception.
//!
//! The source-to-bytecode compiler is an external collaborator: the engine
//! consumes [`bytecode::Code`] artifacts, which tests and embedders can
//! also assemble directly with [`bytecode::CodeBuilder`].
//!
//! ```
//! use varan::bytecode::{CodeBuilder, Op};
//! use varan::{BinaryOp, Interpreter, Object, Value};
//!
//! let mut interp = Interpreter::new();
//! let mut code = CodeBuilder::new("main", 0, 0);
//! let a = code.add_const(Value::Int(20));
//! let b = code.add_const(Value::Int(22));
//! code.emit(Op::LoadConst(a));
//! code.emit(Op::LoadConst(b));
//! code.emit(Op::Binary(BinaryOp::Add));
//! code.emit(Op::Return);
//! let result = interp.execute(code.finish()).unwrap();
//! assert_eq!(result, Object::Int(42));
//! ```

pub mod bytecode;

mod builtins;
mod class;
mod exception;
mod interp;
mod module;
mod object;
mod resource;
mod slots;
mod tracer;
mod value;
mod vm;

pub use class::{ClassBuilder, ClassObject, Instance};
pub use exception::{ExcType, FrameInfo, RunError, RunResult, VmException};
pub use interp::{ExecError, Interpreter};
pub use module::{ModuleLoader, ModuleObject};
pub use object::Object;
pub use resource::{
    CancelToken, LimitedTracker, ResourceError, ResourceLimits, ResourceTracker,
    DEFAULT_MAX_RECURSION_DEPTH,
};
pub use slots::{BinaryOp, CompareOp, Slot, SlotArity, UnaryOp};
pub use tracer::{NoopTracer, StderrTracer, VmTracer};
pub use value::{HostFunction, IterState, OpaqueData, Value};
pub use vm::{IterNext, VmContext};
