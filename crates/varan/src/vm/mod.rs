//! The execution engine: frames, the instruction dispatch loop, calls, and
//! resource-governance checkpoints.
//!
//! A `Vm` borrows everything per-execution: the resource tracker, the
//! tracer, the interpreter's root class, builtin namespace, and module
//! table. Nested guest calls run as nested invocations of `run_frame`, so
//! the guest call stack maps onto the host stack and is bounded by the
//! recursion ceiling.

mod dispatch;

use std::rc::Rc;

use smallvec::SmallVec;

use crate::{
    bytecode::{Code, Op},
    class::{ClassBuilder, ClassObject, Instance},
    exception::{ExcType, RunError, RunResult, VmException},
    module::{ModuleObject, ModuleTable},
    resource::ResourceTracker,
    slots::Slot,
    tracer::VmTracer,
    value::{FunctionObject, Map, Namespace, Value},
};

/// Result of advancing an iterator: the next value, or orderly exhaustion.
///
/// Exhaustion is an explicit outcome rather than an error so loop constructs
/// can terminate without inspecting an error channel.
#[derive(Debug)]
pub enum IterNext {
    Value(Value),
    Exhausted,
}

/// Engine callbacks available to host-registered functions.
///
/// A host function receives `&mut dyn VmContext` and may recurse back into
/// the engine through it; resource limits keep applying.
pub trait VmContext {
    /// Calls any callable value with positional arguments.
    fn call(&mut self, callee: &Value, args: &[Value]) -> RunResult<Value>;
    /// Developer-facing representation (`__repr__` protocol).
    fn repr(&mut self, value: &Value) -> RunResult<String>;
    /// User-facing rendering (`__str__` protocol, falling back to repr).
    fn render(&mut self, value: &Value) -> RunResult<String>;
    /// Truth value (`__bool__`/`__len__` protocol).
    fn truthy(&mut self, value: &Value) -> RunResult<bool>;
    /// Length (`__len__` protocol).
    fn length(&mut self, value: &Value) -> RunResult<usize>;
    /// Obtains an iterator (`__iter__` protocol).
    fn iterate(&mut self, value: &Value) -> RunResult<Value>;
    /// Advances an iterator (`__next__` protocol).
    fn next(&mut self, iterator: &Value) -> RunResult<IterNext>;
    /// Full attribute read, including descriptors and interception hooks.
    fn get_attr(&mut self, obj: &Value, name: &str) -> RunResult<Value>;
    /// Full attribute write, including interception hooks and setters.
    fn set_attr(&mut self, obj: &Value, name: &str, value: Value) -> RunResult<()>;
    /// Builds a class from a host-side definition.
    fn build_class(&mut self, builder: ClassBuilder) -> RunResult<Rc<ClassObject>>;
    /// Classification check against a class or exception-class value.
    fn is_instance(&mut self, value: &Value, class: &Value) -> RunResult<bool>;
}

/// One activation record.
struct Frame {
    code: Rc<Code>,
    globals: Namespace,
    locals: Vec<Option<Value>>,
    stack: Vec<Value>,
}

impl Frame {
    fn new(code: Rc<Code>, globals: Namespace, args: &[Value]) -> Self {
        let mut locals: Vec<Option<Value>> = vec![None; code.num_locals()];
        for (slot, arg) in locals.iter_mut().zip(args) {
            *slot = Some(arg.clone());
        }
        Self {
            code,
            globals,
            locals,
            stack: Vec::new(),
        }
    }

    fn pop(&mut self) -> RunResult<Value> {
        self.stack.pop().ok_or_else(|| RunError::internal("operand stack underflow"))
    }

    fn popn(&mut self, n: usize) -> RunResult<Vec<Value>> {
        if self.stack.len() < n {
            return Err(RunError::internal("operand stack underflow"));
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    fn peek(&self) -> RunResult<&Value> {
        self.stack.last().ok_or_else(|| RunError::internal("operand stack underflow"))
    }
}

/// What an executed instruction does to control flow.
enum Flow {
    Next,
    Jump(u32),
    Return(Value),
}

/// The execution engine for one run. Generic over the tracker so the
/// unlimited configuration monomorphizes its checks away.
pub(crate) struct Vm<'a, T: ResourceTracker> {
    pub(crate) tracker: &'a mut T,
    pub(crate) tracer: &'a mut dyn VmTracer,
    pub(crate) root_class: &'a Rc<ClassObject>,
    pub(crate) builtins: &'a Namespace,
    pub(crate) modules: &'a mut ModuleTable,
    depth: usize,
}

impl<'a, T: ResourceTracker> Vm<'a, T> {
    pub(crate) fn new(
        tracker: &'a mut T,
        tracer: &'a mut dyn VmTracer,
        root_class: &'a Rc<ClassObject>,
        builtins: &'a Namespace,
        modules: &'a mut ModuleTable,
    ) -> Self {
        Self {
            tracker,
            tracer,
            root_class,
            builtins,
            modules,
            depth: 0,
        }
    }

    /// Runs a code object against the given globals, returning the value of
    /// its `Return` (or `None` when execution falls off the end).
    pub(crate) fn run_code(&mut self, code: &Rc<Code>, globals: &Namespace) -> RunResult<Value> {
        let mut frame = Frame::new(Rc::clone(code), Rc::clone(globals), &[]);
        self.run_frame(&mut frame)
    }

    /// Calls a guest function: recursion check, frame setup, nested loop.
    pub(crate) fn call_function(&mut self, func: &Rc<FunctionObject>, args: &[Value]) -> RunResult<Value> {
        let params = func.code.num_params() as usize;
        if args.len() != params {
            return Err(ExcType::type_error(format!(
                "{}() takes {params} argument(s) ({} given)",
                func.name,
                args.len()
            )));
        }
        self.tracker.check_recursion_depth(self.depth + 1)?;
        self.depth += 1;
        self.tracer.on_call(&func.name, self.depth);
        let mut frame = Frame::new(Rc::clone(&func.code), Rc::clone(&func.globals), args);
        let result = self.run_frame(&mut frame);
        self.depth -= 1;
        if result.is_ok() {
            self.tracer.on_return(&func.name);
        }
        result
    }

    /// The dispatch loop. Each iteration checks the cooperative-preemption
    /// tick, traces, executes one instruction, and routes any catchable
    /// exception through the frame's exception table.
    fn run_frame(&mut self, frame: &mut Frame) -> RunResult<Value> {
        let code = Rc::clone(&frame.code);
        let mut pc: usize = 0;
        loop {
            let Some(op) = code.ops.get(pc) else {
                return Ok(Value::None);
            };
            self.tracker.check_tick()?;
            self.tracer.on_instruction(code.name(), pc, op);

            match self.step(frame, *op) {
                Ok(Flow::Next) => pc += 1,
                Ok(Flow::Jump(target)) => pc = target as usize,
                Ok(Flow::Return(value)) => return Ok(value),
                Err(err) => pc = self.unwind(frame, pc, err)?,
            }
        }
    }

    /// Handles a raised error at `pc`: transfers to a covering handler for
    /// catchable exceptions, otherwise records the frame and propagates.
    fn unwind(&mut self, frame: &mut Frame, pc: usize, mut err: RunError) -> RunResult<usize> {
        if let RunError::Exc(exc) = err {
            if let Some(entry) = frame.code.find_handler(u32::try_from(pc).unwrap_or(u32::MAX)) {
                frame.stack.truncate(entry.stack_depth as usize);
                frame.stack.push(Value::ExcInstance(Rc::new(*exc)));
                return Ok(entry.handler as usize);
            }
            err = RunError::Exc(exc);
        }
        if let RunError::Exc(exc) | RunError::UncatchableExc(exc) = &err {
            self.tracer.on_unwind(frame.code.name(), exc);
        }
        err.record_frame(frame.code.name());
        Err(err)
    }

    /// Executes one instruction.
    fn step(&mut self, frame: &mut Frame, op: Op) -> RunResult<Flow> {
        match op {
            Op::LoadConst(idx) => {
                let value = frame
                    .code
                    .consts
                    .get(idx as usize)
                    .ok_or_else(|| RunError::internal("constant index out of range"))?
                    .clone();
                frame.stack.push(value);
            }
            Op::LoadLocal(idx) => {
                let value = frame
                    .locals
                    .get(idx as usize)
                    .ok_or_else(|| RunError::internal("local index out of range"))?
                    .clone()
                    .ok_or_else(|| {
                        VmException::new(
                            ExcType::NameError,
                            Some("local variable referenced before assignment".to_string()),
                        )
                    })?;
                frame.stack.push(value);
            }
            Op::StoreLocal(idx) => {
                let value = frame.pop()?;
                *frame
                    .locals
                    .get_mut(idx as usize)
                    .ok_or_else(|| RunError::internal("local index out of range"))? = Some(value);
            }
            Op::DeleteLocal(idx) => {
                *frame
                    .locals
                    .get_mut(idx as usize)
                    .ok_or_else(|| RunError::internal("local index out of range"))? = None;
            }
            Op::LoadGlobal(idx) => {
                let name = Self::name_at(&frame.code, idx)?;
                let value = frame
                    .globals
                    .borrow()
                    .get(&*name)
                    .cloned()
                    .or_else(|| self.builtins.borrow().get(&*name).cloned())
                    .ok_or_else(|| ExcType::name_error(&name))?;
                frame.stack.push(value);
            }
            Op::StoreGlobal(idx) => {
                let name = Self::name_at(&frame.code, idx)?;
                let value = frame.pop()?;
                frame.globals.borrow_mut().insert(name.to_string(), value);
            }
            Op::DeleteGlobal(idx) => {
                let name = Self::name_at(&frame.code, idx)?;
                if frame.globals.borrow_mut().shift_remove(&*name).is_none() {
                    return Err(ExcType::name_error(&name));
                }
            }

            Op::LoadAttr(idx) => {
                let name = Self::name_at(&frame.code, idx)?;
                let obj = frame.pop()?;
                let value = self.attr_get(&obj, &name)?;
                frame.stack.push(value);
            }
            Op::StoreAttr(idx) => {
                let name = Self::name_at(&frame.code, idx)?;
                let value = frame.pop()?;
                let obj = frame.pop()?;
                self.attr_set(&obj, &name, value)?;
            }
            Op::DeleteAttr(idx) => {
                let name = Self::name_at(&frame.code, idx)?;
                let obj = frame.pop()?;
                self.attr_del(&obj, &name)?;
            }

            Op::LoadItem => {
                let key = frame.pop()?;
                let obj = frame.pop()?;
                let value = self.item_get(&obj, &key)?;
                frame.stack.push(value);
            }
            Op::StoreItem => {
                let value = frame.pop()?;
                let key = frame.pop()?;
                let obj = frame.pop()?;
                self.item_set(&obj, &key, value)?;
            }
            Op::DeleteItem => {
                let key = frame.pop()?;
                let obj = frame.pop()?;
                self.item_del(&obj, &key)?;
            }

            Op::Pop => {
                frame.pop()?;
            }
            Op::Dup => {
                let top = frame.peek()?.clone();
                frame.stack.push(top);
            }
            Op::Swap => {
                let len = frame.stack.len();
                if len < 2 {
                    return Err(RunError::internal("operand stack underflow"));
                }
                frame.stack.swap(len - 1, len - 2);
            }

            Op::BuildList(n) => {
                let items = frame.popn(n as usize)?;
                self.tracker.check_collection_len(items.len())?;
                let value = Value::list(items);
                self.tracker.on_allocate(|| value.estimate_size())?;
                frame.stack.push(value);
            }
            Op::BuildTuple(n) => {
                let items = frame.popn(n as usize)?;
                self.tracker.check_collection_len(items.len())?;
                let value = Value::tuple(items);
                self.tracker.on_allocate(|| value.estimate_size())?;
                frame.stack.push(value);
            }
            Op::BuildDict(n) => {
                let mut flat = frame.popn(2 * n as usize)?;
                self.tracker.check_collection_len(n as usize)?;
                let mut map = Map::default();
                for pair in flat.chunks_exact_mut(2) {
                    let value = pair[1].clone();
                    let Value::Str(key) = &pair[0] else {
                        return Err(ExcType::type_error(format!(
                            "dict keys must be strings, not '{}'",
                            pair[0].type_name()
                        )));
                    };
                    map.insert(key.to_string(), value);
                }
                let value = Value::Dict(Rc::new(std::cell::RefCell::new(map)));
                self.tracker.on_allocate(|| value.estimate_size())?;
                frame.stack.push(value);
            }

            Op::Binary(bin) => {
                let rhs = frame.pop()?;
                let lhs = frame.pop()?;
                let result = self.binary_op(bin, &lhs, &rhs)?;
                frame.stack.push(result);
            }
            Op::Inplace(bin) => {
                let rhs = frame.pop()?;
                let lhs = frame.pop()?;
                let result = self.inplace_op(bin, &lhs, &rhs)?;
                frame.stack.push(result);
            }
            Op::Compare(cmp) => {
                let rhs = frame.pop()?;
                let lhs = frame.pop()?;
                let result = self.compare_op(cmp, &lhs, &rhs)?;
                frame.stack.push(result);
            }
            Op::Unary(unary) => {
                let operand = frame.pop()?;
                let result = self.unary_op(unary, &operand)?;
                frame.stack.push(result);
            }
            Op::Contains { negate } => {
                let container = frame.pop()?;
                let item = frame.pop()?;
                let found = self.contains(&container, &item)?;
                frame.stack.push(Value::Bool(found != negate));
            }
            Op::Is { negate } => {
                let rhs = frame.pop()?;
                let lhs = frame.pop()?;
                frame.stack.push(Value::Bool(lhs.is_identical(&rhs) != negate));
            }

            Op::Jump(target) => return Ok(Flow::Jump(target)),
            Op::PopJumpIfFalse(target) => {
                let value = frame.pop()?;
                if !self.value_truthy(&value)? {
                    return Ok(Flow::Jump(target));
                }
            }
            Op::PopJumpIfTrue(target) => {
                let value = frame.pop()?;
                if self.value_truthy(&value)? {
                    return Ok(Flow::Jump(target));
                }
            }

            Op::GetIter => {
                let value = frame.pop()?;
                let iter = self.get_iter(&value)?;
                frame.stack.push(iter);
            }
            Op::ForIter(target) => {
                let iter = frame.peek()?.clone();
                match self.iter_next(&iter)? {
                    IterNext::Value(value) => frame.stack.push(value),
                    IterNext::Exhausted => {
                        frame.pop()?;
                        return Ok(Flow::Jump(target));
                    }
                }
            }

            Op::Call(argc) => {
                let args = frame.popn(argc as usize)?;
                let callee = frame.pop()?;
                let result = self.call_value(&callee, &args)?;
                frame.stack.push(result);
            }
            Op::Return => {
                let value = frame.pop()?;
                return Ok(Flow::Return(value));
            }

            Op::MakeFunction(idx) => {
                let code = frame
                    .code
                    .nested
                    .get(idx as usize)
                    .ok_or_else(|| RunError::internal("nested code index out of range"))?;
                let func = FunctionObject {
                    name: Rc::from(code.name()),
                    code: Rc::clone(code),
                    globals: Rc::clone(&frame.globals),
                };
                frame.stack.push(Value::Function(Rc::new(func)));
            }
            Op::BuildClass(idx) => {
                let name = Self::name_at(&frame.code, idx)?;
                let members = frame.pop()?;
                let bases = frame.pop()?;
                let class = self.build_guest_class(&name, &bases, &members)?;
                frame.stack.push(Value::Class(class));
            }

            Op::Raise | Op::Reraise => {
                let value = frame.pop()?;
                return Err(Self::raise_value(&value));
            }
            Op::CheckExcMatch => {
                let handler_class = frame.pop()?;
                let Value::ExcClass(handler_type) = handler_class else {
                    return Err(ExcType::type_error(
                        "catching requires an exception class".to_string(),
                    ));
                };
                let matches = match frame.peek()? {
                    Value::ExcInstance(exc) => exc.exc_type().is_subclass_of(handler_type),
                    _ => false,
                };
                frame.stack.push(Value::Bool(matches));
            }

            Op::EnterWith => {
                let manager = frame.pop()?;
                let entered = self.context_enter(&manager)?;
                frame.stack.push(manager);
                frame.stack.push(entered);
            }
            Op::ExitWith => {
                let manager = frame.pop()?;
                self.context_exit(&manager, None)?;
            }
            Op::ExitWithExcept => {
                let exc = frame.pop()?;
                let manager = frame.pop()?;
                let Value::ExcInstance(exc) = exc else {
                    return Err(RunError::internal("exceptional exit without an exception on the stack"));
                };
                let suppressed = self.context_exit(&manager, Some(&exc))?;
                if !suppressed {
                    return Err(Self::raise_value(&Value::ExcInstance(exc)));
                }
            }

            Op::Import(idx) => {
                let name = Self::name_at(&frame.code, idx)?;
                let module = self.import_module(&name)?;
                frame.stack.push(Value::Module(module));
            }
        }
        Ok(Flow::Next)
    }

    fn name_at(code: &Code, idx: u32) -> RunResult<Rc<str>> {
        code.names
            .get(idx as usize)
            .cloned()
            .ok_or_else(|| RunError::internal("name index out of range"))
    }

    /// Converts a raised value into the error channel, keeping governance
    /// kinds uncatchable even when guest code raises them by name.
    fn raise_value(value: &Value) -> RunError {
        let exc = match value {
            Value::ExcClass(exc_type) => VmException::new(*exc_type, None),
            Value::ExcInstance(exc) => (**exc).clone(),
            other => {
                return ExcType::type_error(format!(
                    "exceptions must be exception classes or instances, not '{}'",
                    other.type_name()
                ));
            }
        };
        if matches!(
            exc.exc_type(),
            ExcType::TimeoutError | ExcType::CancelledError | ExcType::InconsistentHierarchy
        ) {
            RunError::UncatchableExc(Box::new(exc))
        } else {
            RunError::Exc(Box::new(exc))
        }
    }

    /// Builds a class from the operand-stack form: a list of base classes
    /// and a dict of members.
    fn build_guest_class(&mut self, name: &str, bases: &Value, members: &Value) -> RunResult<Rc<ClassObject>> {
        let Value::List(bases) = bases else {
            return Err(RunError::internal("class bases must be a list"));
        };
        let mut base_classes = Vec::with_capacity(bases.borrow().len());
        for base in bases.borrow().iter() {
            let Value::Class(class) = base else {
                return Err(ExcType::type_error(format!(
                    "base of '{name}' is not a class: '{}'",
                    base.type_name()
                )));
            };
            base_classes.push(Rc::clone(class));
        }
        if base_classes.is_empty() {
            base_classes.push(Rc::clone(self.root_class));
        }
        let Value::Dict(members) = members else {
            return Err(RunError::internal("class members must be a dict"));
        };
        let members = members.borrow().clone();
        let class = ClassObject::build(name, base_classes, members, crate::class::AttrModel::Dict, None)?;
        self.tracker.on_allocate(|| Value::Class(Rc::clone(&class)).estimate_size())?;
        Ok(class)
    }

    /// Resolves a dotted import: registered module, else the pluggable
    /// loader, else `ImportError`.
    fn import_module(&mut self, name: &str) -> RunResult<Rc<ModuleObject>> {
        if let Some(module) = self.modules.get(name) {
            return Ok(module);
        }
        let Some(code) = self.modules.load_from_loader(name) else {
            return Err(
                VmException::new(ExcType::ImportError, Some(format!("no module named '{name}'"))).into(),
            );
        };
        let module = Rc::new(ModuleObject::new(name));
        let code = Rc::new(code);
        self.run_code(&code, module.dict())?;
        self.modules.insert(Rc::clone(&module));
        Ok(module)
    }

    /// Calls any callable value.
    pub(crate) fn call_value(&mut self, callee: &Value, args: &[Value]) -> RunResult<Value> {
        match callee {
            Value::Function(func) => self.call_function(&Rc::clone(func), args),
            Value::HostFunction(host) => {
                // Host callables count against the same recursion ceiling as
                // guest frames; a host hook re-entering the engine must hit
                // the ceiling instead of the native stack.
                let host = Rc::clone(host);
                self.tracker.check_recursion_depth(self.depth + 1)?;
                self.depth += 1;
                self.tracer.on_call(host.name(), self.depth);
                let result = host.call(self, args);
                self.depth -= 1;
                if result.is_ok() {
                    self.tracer.on_return(host.name());
                }
                result
            }
            Value::BoundMethod(method) => {
                let method = Rc::clone(method);
                let mut full: SmallVec<[Value; 4]> = SmallVec::with_capacity(args.len() + 1);
                full.push(method.receiver.clone());
                full.extend(args.iter().cloned());
                self.call_value(&method.func, &full)
            }
            Value::Class(class) => self.instantiate(&Rc::clone(class), args),
            Value::ExcClass(exc_type) => {
                let message = match args {
                    [] => None,
                    [Value::Str(msg)] => Some(msg.to_string()),
                    [other] => Some(self.render(other)?),
                    _ => {
                        return Err(ExcType::type_error(format!(
                            "{exc_type}() takes at most 1 argument ({} given)",
                            args.len()
                        )));
                    }
                };
                Ok(Value::ExcInstance(Rc::new(VmException::new(*exc_type, message))))
            }
            Value::Instance(_) => {
                let Some(result) = self.call_slot(callee, Slot::Call, args)? else {
                    return Err(ExcType::not_callable(callee.type_name()));
                };
                Ok(result)
            }
            other => Err(ExcType::not_callable(other.type_name())),
        }
    }

    /// Instantiates a class: the construction hook (or default allocation),
    /// then the initializer.
    fn instantiate(&mut self, class: &Rc<ClassObject>, args: &[Value]) -> RunResult<Value> {
        let has_new_hook = class.slot(Slot::New).is_some();
        let instance = if let Some(new_hook) = class.slot(Slot::New).cloned() {
            let mut full: SmallVec<[Value; 4]> = SmallVec::with_capacity(args.len() + 1);
            full.push(Value::Class(Rc::clone(class)));
            full.extend(args.iter().cloned());
            self.call_value(&new_hook, &full)?
        } else {
            let value = Value::Instance(Rc::new(Instance::new(Rc::clone(class))));
            self.tracker.on_allocate(|| value.estimate_size())?;
            value
        };

        // The initializer only runs when construction produced an instance
        // of (a subclass of) the requested class.
        let run_init = matches!(&instance, Value::Instance(inst) if inst.class().is_subclass_of(class));
        if run_init {
            if let Some(init) = class.slot(Slot::Init).cloned() {
                let mut full: SmallVec<[Value; 4]> = SmallVec::with_capacity(args.len() + 1);
                full.push(instance.clone());
                full.extend(args.iter().cloned());
                self.call_value(&init, &full)?;
            } else if !args.is_empty() && !has_new_hook {
                return Err(ExcType::type_error(format!(
                    "{}() takes no arguments ({} given)",
                    class.name(),
                    args.len()
                )));
            }
        }
        Ok(instance)
    }
}

impl<T: ResourceTracker> VmContext for Vm<'_, T> {
    fn call(&mut self, callee: &Value, args: &[Value]) -> RunResult<Value> {
        self.call_value(callee, args)
    }

    fn repr(&mut self, value: &Value) -> RunResult<String> {
        self.repr_value(value)
    }

    fn render(&mut self, value: &Value) -> RunResult<String> {
        self.str_value(value)
    }

    fn truthy(&mut self, value: &Value) -> RunResult<bool> {
        self.value_truthy(value)
    }

    fn length(&mut self, value: &Value) -> RunResult<usize> {
        self.value_len(value)
    }

    fn iterate(&mut self, value: &Value) -> RunResult<Value> {
        self.get_iter(value)
    }

    fn next(&mut self, iterator: &Value) -> RunResult<IterNext> {
        self.iter_next(iterator)
    }

    fn get_attr(&mut self, obj: &Value, name: &str) -> RunResult<Value> {
        self.attr_get(obj, name)
    }

    fn set_attr(&mut self, obj: &Value, name: &str, value: Value) -> RunResult<()> {
        self.attr_set(obj, name, value)
    }

    fn build_class(&mut self, builder: ClassBuilder) -> RunResult<Rc<ClassObject>> {
        let class = builder.build(self.root_class)?;
        self.tracker.on_allocate(|| Value::Class(Rc::clone(&class)).estimate_size())?;
        Ok(class)
    }

    fn is_instance(&mut self, value: &Value, class: &Value) -> RunResult<bool> {
        self.isinstance(value, class)
    }
}
