//! The embedder-facing interpreter instance.
//!
//! An [`Interpreter`] owns everything one execution context needs: the root
//! class, the global and builtin namespaces, the module table, and the
//! configured resource limits. Nothing is process-global, so independent
//! instances never share state. An instance is single-threaded; callers
//! needing concurrency create one instance per thread.

use std::{cell::RefCell, fmt, rc::Rc, time::Duration};

use crate::{
    builtins,
    bytecode::Code,
    class::{ClassBuilder, ClassObject},
    exception::{ExcType, RunError, RunResult, VmException},
    module::{ModuleLoader, ModuleObject, ModuleTable},
    object::Object,
    resource::{CancelToken, LimitedTracker, ResourceLimits},
    tracer::{NoopTracer, VmTracer},
    value::{HostFunction, Map, Namespace, Value},
    vm::{Vm, VmContext},
};

/// Error returned to the embedder.
#[derive(Debug)]
pub enum ExecError {
    /// A guest exception reached the top of the stack uncaught.
    Exception(VmException),
    /// Execution was cancelled by the deadline, the instruction budget, or
    /// an external cancellation token.
    Cancelled(VmException),
    /// The interpreter has been closed.
    Closed,
    /// An engine bug, never guest misbehavior.
    Internal(String),
}

impl ExecError {
    fn from_run_error(err: RunError) -> Self {
        match err {
            RunError::Internal(msg) => Self::Internal(msg),
            RunError::Exc(exc) => Self::Exception(*exc),
            RunError::UncatchableExc(exc) => match exc.exc_type() {
                ExcType::TimeoutError | ExcType::CancelledError => Self::Cancelled(*exc),
                _ => Self::Exception(*exc),
            },
        }
    }

    /// The carried exception, when there is one.
    #[must_use]
    pub fn exception(&self) -> Option<&VmException> {
        match self {
            Self::Exception(exc) | Self::Cancelled(exc) => Some(exc),
            Self::Closed | Self::Internal(_) => None,
        }
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exception(exc) => write!(f, "{exc}"),
            Self::Cancelled(exc) => write!(f, "execution cancelled: {exc}"),
            Self::Closed => write!(f, "interpreter is closed"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for ExecError {}

/// Live state, dropped on close.
struct InterpState {
    root_class: Rc<ClassObject>,
    globals: Namespace,
    builtins: Namespace,
    modules: ModuleTable,
}

/// One interpreter instance.
pub struct Interpreter {
    state: Option<InterpState>,
    limits: ResourceLimits,
    tracer: Box<dyn VmTracer>,
    allocated: usize,
}

impl fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interpreter")
            .field("closed", &self.state.is_none())
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    /// Creates an interpreter with the builtin namespace installed and the
    /// default recursion ceiling.
    #[must_use]
    pub fn new() -> Self {
        let mut builtin_map = Map::default();
        builtins::install(&mut builtin_map);
        Self {
            state: Some(InterpState {
                root_class: ClassObject::new_root(),
                globals: Rc::new(RefCell::new(Map::default())),
                builtins: Rc::new(RefCell::new(builtin_map)),
                modules: ModuleTable::new(),
            }),
            limits: ResourceLimits::new(),
            tracer: Box::new(NoopTracer),
            allocated: 0,
        }
    }

    /// Replaces the execution tracer.
    pub fn set_tracer(&mut self, tracer: impl VmTracer + 'static) {
        self.tracer = Box::new(tracer);
    }

    // --- host registration ---

    /// Binds a host function under a global name, visible to guest code as
    /// an ordinary callable.
    pub fn register(
        &mut self,
        name: &str,
        f: impl Fn(&mut dyn VmContext, &[Value]) -> RunResult<Value> + 'static,
    ) -> Result<(), ExecError> {
        let state = self.state.as_ref().ok_or(ExecError::Closed)?;
        let host = Value::HostFunction(Rc::new(HostFunction::new(name, f)));
        state.globals.borrow_mut().insert(name.to_string(), host);
        Ok(())
    }

    /// Binds a host function into the reserved builtin namespace.
    pub fn register_builtin(
        &mut self,
        name: &str,
        f: impl Fn(&mut dyn VmContext, &[Value]) -> RunResult<Value> + 'static,
    ) -> Result<(), ExecError> {
        let state = self.state.as_ref().ok_or(ExecError::Closed)?;
        let host = Value::HostFunction(Rc::new(HostFunction::new(name, f)));
        state.builtins.borrow_mut().insert(name.to_string(), host);
        Ok(())
    }

    /// Builds a class from a host-side definition and binds it under its
    /// name in the global namespace.
    pub fn register_class(&mut self, builder: ClassBuilder) -> Result<Rc<ClassObject>, ExecError> {
        let state = self.state.as_ref().ok_or(ExecError::Closed)?;
        let name = builder.name().to_string();
        let class = builder.build(&state.root_class).map_err(ExecError::from_run_error)?;
        state
            .globals
            .borrow_mut()
            .insert(name, Value::Class(Rc::clone(&class)));
        Ok(class)
    }

    // --- global namespace accessors ---

    /// Reads a global binding in host-native form. Returns `None` for a
    /// missing name, and silently after close.
    #[must_use]
    pub fn get_global(&self, name: &str) -> Option<Object> {
        let state = self.state.as_ref()?;
        state.globals.borrow().get(name).map(Object::from)
    }

    /// Sets a global binding. Fails once the instance is closed.
    pub fn set_global(&mut self, name: &str, value: impl Into<Value>) -> Result<(), ExecError> {
        let state = self.state.as_ref().ok_or(ExecError::Closed)?;
        state.globals.borrow_mut().insert(name.to_string(), value.into());
        Ok(())
    }

    /// Enumerates global names. Empty after close.
    #[must_use]
    pub fn global_names(&self) -> Vec<String> {
        self.state
            .as_ref()
            .map(|state| state.globals.borrow().keys().cloned().collect())
            .unwrap_or_default()
    }

    // --- modules ---

    /// Executes a compiled module body in a fresh namespace and publishes
    /// it under the dotted name, creating and linking package placeholders.
    pub fn register_module(&mut self, name: &str, code: Code) -> Result<(), ExecError> {
        let module = Rc::new(ModuleObject::new(name));
        let dict = Rc::clone(module.dict());
        self.run(code, &dict, None, None)?;
        let state = self.state.as_mut().ok_or(ExecError::Closed)?;
        state.modules.insert(module);
        Ok(())
    }

    /// Installs the loader consulted for imports of unregistered modules.
    pub fn set_module_loader(&mut self, loader: impl ModuleLoader + 'static) -> Result<(), ExecError> {
        let state = self.state.as_mut().ok_or(ExecError::Closed)?;
        state.modules.set_loader(Box::new(loader));
        Ok(())
    }

    // --- resource-limit configuration (silent no-ops once closed) ---

    /// Sets the maximum call-stack depth.
    pub fn set_max_recursion_depth(&mut self, limit: usize) {
        if self.state.is_some() {
            self.limits.max_recursion_depth = Some(limit);
        }
    }

    /// Sets the aggregate allocation ceiling in bytes.
    pub fn set_max_allocation_bytes(&mut self, limit: usize) {
        if self.state.is_some() {
            self.limits.max_allocation_bytes = Some(limit);
        }
    }

    /// Sets the per-collection size ceiling.
    pub fn set_max_collection_len(&mut self, limit: usize) {
        if self.state.is_some() {
            self.limits.max_collection_len = Some(limit);
        }
    }

    /// Sets the instruction budget per execution.
    pub fn set_max_operations(&mut self, limit: usize) {
        if self.state.is_some() {
            self.limits.max_operations = Some(limit);
        }
    }

    /// Sets a wall-clock deadline applied to every execution. A per-call
    /// deadline from [`Interpreter::execute_with_timeout`] takes precedence.
    pub fn set_timeout(&mut self, limit: Duration) {
        if self.state.is_some() {
            self.limits.max_duration = Some(limit);
        }
    }

    /// Approximate bytes allocated by guest executions so far. Zero after
    /// close.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        if self.state.is_some() { self.allocated } else { 0 }
    }

    // --- execution ---

    /// Runs a compiled code object against the global namespace and returns
    /// its result in host-native form.
    pub fn execute(&mut self, code: Code) -> Result<Object, ExecError> {
        self.execute_inner(code, None, None)
    }

    /// Runs with a wall-clock deadline; expiry unwinds past all guest
    /// handlers and reports [`ExecError::Cancelled`].
    pub fn execute_with_timeout(&mut self, code: Code, timeout: Duration) -> Result<Object, ExecError> {
        self.execute_inner(code, Some(timeout), None)
    }

    /// Runs under an external cancellation token, checked at the same
    /// cadence as the deadline.
    pub fn execute_with_cancel(&mut self, code: Code, token: CancelToken) -> Result<Object, ExecError> {
        self.execute_inner(code, None, Some(token))
    }

    fn execute_inner(
        &mut self,
        code: Code,
        timeout: Option<Duration>,
        token: Option<CancelToken>,
    ) -> Result<Object, ExecError> {
        let globals = Rc::clone(&self.state.as_ref().ok_or(ExecError::Closed)?.globals);
        let value = self.run(code, &globals, timeout, token)?;
        Ok(Object::from(&value))
    }

    fn run(
        &mut self,
        code: Code,
        globals: &Namespace,
        timeout: Option<Duration>,
        token: Option<CancelToken>,
    ) -> Result<Value, ExecError> {
        let state = self.state.as_mut().ok_or(ExecError::Closed)?;
        let mut limits = self.limits.clone();
        if let Some(timeout) = timeout {
            limits = limits.max_duration(timeout);
        }
        let mut tracker = LimitedTracker::new(limits);
        if let Some(token) = token {
            tracker = tracker.with_cancel_token(token);
        }
        let code = Rc::new(code);
        let result = {
            let mut vm = Vm::new(
                &mut tracker,
                self.tracer.as_mut(),
                &state.root_class,
                &state.builtins,
                &mut state.modules,
            );
            vm.run_code(&code, globals)
        };
        self.allocated += tracker.allocated();
        result.map_err(ExecError::from_run_error)
    }

    /// Releases all interpreter state. Idempotent; after close, mutating
    /// operations fail with [`ExecError::Closed`] and read accessors return
    /// zero values silently.
    pub fn close(&mut self) {
        self.state = None;
    }

    /// Whether [`Interpreter::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.is_none()
    }
}
