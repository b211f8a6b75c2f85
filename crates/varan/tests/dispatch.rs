//! Protocol dispatch through the public API: operator fallback, type-based
//! slot lookup, iteration, context managers, descriptors, and attribute
//! interception. Guest programs are assembled directly with `CodeBuilder`
//! since the compiler is an external collaborator.

use std::{cell::RefCell, rc::Rc};

use pretty_assertions::assert_eq;
use varan::bytecode::{Code, CodeBuilder, Op};
use varan::{
    BinaryOp, ClassBuilder, CompareOp, ExcType, HostFunction, Interpreter, Object, Value, VmException,
};

fn host(name: &str, f: impl Fn(&mut dyn varan::VmContext, &[Value]) -> varan::RunResult<Value> + 'static) -> Value {
    Value::HostFunction(Rc::new(HostFunction::new(name, f)))
}

#[test]
fn reflected_slot_rescues_unsupported_left_operand() {
    let mut interp = Interpreter::new();
    interp
        .register_class(ClassBuilder::new("Right").method("__radd__", host("__radd__", |_, _| Ok(Value::Int(99)))))
        .unwrap();

    let mut b = CodeBuilder::new("main", 0, 0);
    let ten = b.add_const(Value::Int(10));
    let right = b.add_name("Right");
    b.emit(Op::LoadConst(ten));
    b.emit(Op::LoadGlobal(right));
    b.emit(Op::Call(0));
    b.emit(Op::Binary(BinaryOp::Add));
    b.emit(Op::Return);

    assert_eq!(interp.execute(b.finish()).unwrap(), Object::Int(99));
}

#[test]
fn unsupported_operand_pair_raises_type_error_naming_both_types() {
    let mut interp = Interpreter::new();
    interp.register_class(ClassBuilder::new("Blank")).unwrap();

    let mut b = CodeBuilder::new("main", 0, 0);
    let blank = b.add_name("Blank");
    b.emit(Op::LoadGlobal(blank));
    b.emit(Op::Call(0));
    b.emit(Op::LoadGlobal(blank));
    b.emit(Op::Call(0));
    b.emit(Op::Binary(BinaryOp::Sub));
    b.emit(Op::Return);

    let err = interp.execute(b.finish()).unwrap_err();
    let exc = err.exception().unwrap();
    assert_eq!(exc.exc_type(), ExcType::TypeError);
    let message = exc.message().unwrap();
    assert!(message.contains("Blank"), "message should name the types: {message}");
}

#[test]
fn protocol_lookup_bypasses_instance_attributes() {
    let mut interp = Interpreter::new();
    interp
        .register_class(ClassBuilder::new("Sized").method("__len__", host("__len__", |_, _| Ok(Value::Int(5)))))
        .unwrap();

    // obj = Sized(); obj.__len__ = 0; len(obj)
    let mut b = CodeBuilder::new("main", 0, 0);
    let sized = b.add_name("Sized");
    let obj = b.add_name("obj");
    let len_name = b.add_name("__len__");
    let len_builtin = b.add_name("len");
    let zero = b.add_const(Value::Int(0));
    b.emit(Op::LoadGlobal(sized));
    b.emit(Op::Call(0));
    b.emit(Op::StoreGlobal(obj));
    b.emit(Op::LoadGlobal(obj));
    b.emit(Op::LoadConst(zero));
    b.emit(Op::StoreAttr(len_name));
    b.emit(Op::LoadGlobal(len_builtin));
    b.emit(Op::LoadGlobal(obj));
    b.emit(Op::Call(1));
    b.emit(Op::Return);

    assert_eq!(interp.execute(b.finish()).unwrap(), Object::Int(5));
}

/// A guest iterator yielding 0, 1, 2 must drive a for-construct to exactly
/// that sequence, with exhaustion consumed silently.
#[test]
fn iterator_exhaustion_terminates_loop_without_error() {
    let mut interp = Interpreter::new();
    interp
        .register_class(
            ClassBuilder::new("Counter")
                .method(
                    "__init__",
                    host("__init__", |ctx, args| {
                        ctx.set_attr(&args[0], "n", Value::Int(0))?;
                        Ok(Value::None)
                    }),
                )
                .method("__iter__", host("__iter__", |_, args| Ok(args[0].clone())))
                .method(
                    "__next__",
                    host("__next__", |ctx, args| {
                        let Value::Int(n) = ctx.get_attr(&args[0], "n")? else {
                            return Err(VmException::new(ExcType::TypeError, None).into());
                        };
                        if n >= 3 {
                            return Err(VmException::new(ExcType::StopIteration, None).into());
                        }
                        ctx.set_attr(&args[0], "n", Value::Int(n + 1))?;
                        Ok(Value::Int(n))
                    }),
                ),
        )
        .unwrap();

    // total = 0; count = 0; for v in Counter(): total += v; count += 1
    let mut b = CodeBuilder::new("main", 0, 2);
    let counter = b.add_name("Counter");
    let zero = b.add_const(Value::Int(0));
    let one = b.add_const(Value::Int(1));
    b.emit(Op::LoadConst(zero));
    b.emit(Op::StoreLocal(0));
    b.emit(Op::LoadConst(zero));
    b.emit(Op::StoreLocal(1));
    b.emit(Op::LoadGlobal(counter));
    b.emit(Op::Call(0));
    b.emit(Op::GetIter);
    let head = b.position();
    let done = b.emit_jump(Op::ForIter(u32::MAX));
    b.emit(Op::LoadLocal(0));
    b.emit(Op::Binary(BinaryOp::Add));
    b.emit(Op::StoreLocal(0));
    b.emit(Op::LoadLocal(1));
    b.emit(Op::LoadConst(one));
    b.emit(Op::Binary(BinaryOp::Add));
    b.emit(Op::StoreLocal(1));
    b.emit(Op::Jump(head));
    b.patch_jump(done);
    // return (total, count)
    b.emit(Op::LoadLocal(0));
    b.emit(Op::LoadLocal(1));
    b.emit(Op::BuildTuple(2));
    b.emit(Op::Return);

    let result = interp.execute(b.finish()).unwrap();
    assert_eq!(result, Object::List(vec![Object::Int(3), Object::Int(3)]));
}

/// Builds the context-manager program: `cm = <Class>(); with cm: raise
/// ValueError`. The handler entry routes the in-flight exception through
/// the exit slot.
fn with_block_raising(class_name: &str) -> Code {
    let mut b = CodeBuilder::new("main", 0, 0);
    let class_idx = b.add_name(class_name);
    let cm = b.add_name("cm");
    let exc = b.add_const(Value::ExcClass(ExcType::ValueError));
    let suppressed = b.add_const(Value::str("suppressed"));
    let normal = b.add_const(Value::str("normal"));
    b.emit(Op::LoadGlobal(class_idx));
    b.emit(Op::Call(0));
    b.emit(Op::StoreGlobal(cm));
    b.emit(Op::LoadGlobal(cm));
    b.emit(Op::EnterWith); // [cm, entered]
    b.emit(Op::Pop); // [cm]
    let body_start = b.position();
    b.emit(Op::LoadConst(exc));
    b.emit(Op::Raise);
    let body_end = b.position();
    b.emit(Op::ExitWith);
    b.emit(Op::LoadConst(normal));
    b.emit(Op::Return);
    let handler = b.position();
    b.emit(Op::ExitWithExcept); // [cm, exc] -> suppress or re-raise
    b.emit(Op::LoadConst(suppressed));
    b.emit(Op::Return);
    b.add_exception_span(body_start, body_end, handler, 1);
    b.finish()
}

fn exit_recording_class(name: &str, suppress: bool, calls: &Rc<RefCell<u32>>, saw: &Rc<RefCell<String>>) -> ClassBuilder {
    let calls = Rc::clone(calls);
    let saw = Rc::clone(saw);
    ClassBuilder::new(name)
        .method("__enter__", host("__enter__", |_, args| Ok(args[0].clone())))
        .method(
            "__exit__",
            host("__exit__", move |_, args| {
                *calls.borrow_mut() += 1;
                *saw.borrow_mut() = match &args[1] {
                    Value::ExcClass(exc_type) => exc_type.to_string(),
                    _ => "none".to_string(),
                };
                Ok(Value::Bool(suppress))
            }),
        )
}

#[test]
fn exit_slot_runs_once_with_exception_info_and_can_suppress() {
    let calls = Rc::new(RefCell::new(0u32));
    let saw = Rc::new(RefCell::new(String::new()));
    let mut interp = Interpreter::new();
    interp
        .register_class(exit_recording_class("Guard", true, &calls, &saw))
        .unwrap();

    let result = interp.execute(with_block_raising("Guard")).unwrap();
    assert_eq!(result, Object::Str("suppressed".to_string()));
    assert_eq!(*calls.borrow(), 1);
    assert_eq!(*saw.borrow(), "ValueError");
}

#[test]
fn exit_slot_returning_false_lets_the_exception_propagate() {
    let calls = Rc::new(RefCell::new(0u32));
    let saw = Rc::new(RefCell::new(String::new()));
    let mut interp = Interpreter::new();
    interp
        .register_class(exit_recording_class("Leaky", false, &calls, &saw))
        .unwrap();

    let err = interp.execute(with_block_raising("Leaky")).unwrap_err();
    assert_eq!(err.exception().unwrap().exc_type(), ExcType::ValueError);
    assert_eq!(*calls.borrow(), 1);
}

#[test]
fn equality_falls_back_to_identity_but_ordering_raises() {
    let mut interp = Interpreter::new();
    interp.register_class(ClassBuilder::new("Plain")).unwrap();

    // a = Plain(); b = Plain(); (a == a, a == b)
    let mut b = CodeBuilder::new("main", 0, 2);
    let plain = b.add_name("Plain");
    b.emit(Op::LoadGlobal(plain));
    b.emit(Op::Call(0));
    b.emit(Op::StoreLocal(0));
    b.emit(Op::LoadGlobal(plain));
    b.emit(Op::Call(0));
    b.emit(Op::StoreLocal(1));
    b.emit(Op::LoadLocal(0));
    b.emit(Op::LoadLocal(0));
    b.emit(Op::Compare(CompareOp::Eq));
    b.emit(Op::LoadLocal(0));
    b.emit(Op::LoadLocal(1));
    b.emit(Op::Compare(CompareOp::Eq));
    b.emit(Op::BuildTuple(2));
    b.emit(Op::Return);
    assert_eq!(
        interp.execute(b.finish()).unwrap(),
        Object::List(vec![Object::Bool(true), Object::Bool(false)])
    );

    let mut b = CodeBuilder::new("main", 0, 0);
    let plain = b.add_name("Plain");
    b.emit(Op::LoadGlobal(plain));
    b.emit(Op::Call(0));
    b.emit(Op::LoadGlobal(plain));
    b.emit(Op::Call(0));
    b.emit(Op::Compare(CompareOp::Lt));
    b.emit(Op::Return);
    let err = interp.execute(b.finish()).unwrap_err();
    assert_eq!(err.exception().unwrap().exc_type(), ExcType::TypeError);
}

#[test]
fn ordering_does_not_consult_the_right_operands_slot() {
    let mut interp = Interpreter::new();
    interp.register_class(ClassBuilder::new("Bare")).unwrap();
    interp
        .register_class(ClassBuilder::new("Pushy").method("__gt__", host("__gt__", |_, _| Ok(Value::Bool(true)))))
        .unwrap();

    // Bare() < Pushy(): the left operand has no __lt__, and the right
    // operand's __gt__ must not answer for it.
    let mut b = CodeBuilder::new("main", 0, 0);
    let bare = b.add_name("Bare");
    let pushy = b.add_name("Pushy");
    b.emit(Op::LoadGlobal(bare));
    b.emit(Op::Call(0));
    b.emit(Op::LoadGlobal(pushy));
    b.emit(Op::Call(0));
    b.emit(Op::Compare(CompareOp::Lt));
    b.emit(Op::Return);
    let err = interp.execute(b.finish()).unwrap_err();
    let exc = err.exception().unwrap();
    assert_eq!(exc.exc_type(), ExcType::TypeError);
    let message = exc.message().unwrap();
    assert!(
        message.contains("Bare") && message.contains("Pushy"),
        "message should name both types: {message}"
    );
}

#[test]
fn inplace_operator_falls_back_to_forward_slot() {
    let mut interp = Interpreter::new();
    interp
        .register_class(ClassBuilder::new("Adder").method("__add__", host("__add__", |_, _| Ok(Value::Int(5)))))
        .unwrap();

    let mut b = CodeBuilder::new("main", 0, 0);
    let adder = b.add_name("Adder");
    let one = b.add_const(Value::Int(1));
    b.emit(Op::LoadGlobal(adder));
    b.emit(Op::Call(0));
    b.emit(Op::LoadConst(one));
    b.emit(Op::Inplace(BinaryOp::Add));
    b.emit(Op::Return);
    assert_eq!(interp.execute(b.finish()).unwrap(), Object::Int(5));
}

#[test]
fn property_getter_and_setter_route_through_the_descriptor() {
    let mut interp = Interpreter::new();
    interp
        .register_class(
            ClassBuilder::new("Temp")
                .method(
                    "__init__",
                    host("__init__", |ctx, args| {
                        ctx.set_attr(&args[0], "_c", Value::Int(0))?;
                        Ok(Value::None)
                    }),
                )
                .property(
                    "celsius",
                    host("get_celsius", |ctx, args| ctx.get_attr(&args[0], "_c")),
                    Some(host("set_celsius", |ctx, args| {
                        ctx.set_attr(&args[0], "_c", args[1].clone())?;
                        Ok(Value::None)
                    })),
                ),
        )
        .unwrap();

    // t = Temp(); t.celsius = 21; t.celsius
    let mut b = CodeBuilder::new("main", 0, 1);
    let temp = b.add_name("Temp");
    let celsius = b.add_name("celsius");
    let twenty_one = b.add_const(Value::Int(21));
    b.emit(Op::LoadGlobal(temp));
    b.emit(Op::Call(0));
    b.emit(Op::StoreLocal(0));
    b.emit(Op::LoadLocal(0));
    b.emit(Op::LoadConst(twenty_one));
    b.emit(Op::StoreAttr(celsius));
    b.emit(Op::LoadLocal(0));
    b.emit(Op::LoadAttr(celsius));
    b.emit(Op::Return);
    assert_eq!(interp.execute(b.finish()).unwrap(), Object::Int(21));
}

#[test]
fn missing_attribute_falls_back_to_the_miss_hook() {
    let mut interp = Interpreter::new();
    interp
        .register_class(
            ClassBuilder::new("Lazy")
                .attr("present", Value::Int(1))
                .method(
                    "__getattr__",
                    host("__getattr__", |ctx, args| {
                        let missing = ctx.render(&args[1])?;
                        Ok(Value::str(format!("missing:{missing}")))
                    }),
                ),
        )
        .unwrap();

    let mut b = CodeBuilder::new("main", 0, 1);
    let lazy = b.add_name("Lazy");
    let present = b.add_name("present");
    let ghost = b.add_name("ghost");
    b.emit(Op::LoadGlobal(lazy));
    b.emit(Op::Call(0));
    b.emit(Op::StoreLocal(0));
    b.emit(Op::LoadLocal(0));
    b.emit(Op::LoadAttr(present));
    b.emit(Op::LoadLocal(0));
    b.emit(Op::LoadAttr(ghost));
    b.emit(Op::BuildTuple(2));
    b.emit(Op::Return);
    assert_eq!(
        interp.execute(b.finish()).unwrap(),
        Object::List(vec![Object::Int(1), Object::Str("missing:ghost".to_string())])
    );
}

#[test]
fn all_access_interceptor_sees_every_get() {
    let mut interp = Interpreter::new();
    interp
        .register_class(
            ClassBuilder::new("Proxy")
                .attr("real", Value::Int(42))
                .method(
                    "__getattribute__",
                    host("__getattribute__", |_, _| Ok(Value::str("intercepted"))),
                ),
        )
        .unwrap();

    let mut b = CodeBuilder::new("main", 0, 0);
    let proxy = b.add_name("Proxy");
    let real = b.add_name("real");
    b.emit(Op::LoadGlobal(proxy));
    b.emit(Op::Call(0));
    b.emit(Op::LoadAttr(real));
    b.emit(Op::Return);
    assert_eq!(interp.execute(b.finish()).unwrap(), Object::Str("intercepted".to_string()));
}

#[test]
fn assignment_interceptor_is_consulted_unconditionally() {
    let writes = Rc::new(RefCell::new(Vec::<String>::new()));
    let log = Rc::clone(&writes);
    let mut interp = Interpreter::new();
    interp
        .register_class(ClassBuilder::new("Sealed").method(
            "__setattr__",
            host("__setattr__", move |ctx, args| {
                log.borrow_mut().push(ctx.render(&args[1])?);
                Ok(Value::None)
            }),
        ))
        .unwrap();

    // obj = Sealed(); obj.x = 1; obj.x  -> AttributeError: never stored
    let mut b = CodeBuilder::new("main", 0, 1);
    let sealed = b.add_name("Sealed");
    let x = b.add_name("x");
    let one = b.add_const(Value::Int(1));
    b.emit(Op::LoadGlobal(sealed));
    b.emit(Op::Call(0));
    b.emit(Op::StoreLocal(0));
    b.emit(Op::LoadLocal(0));
    b.emit(Op::LoadConst(one));
    b.emit(Op::StoreAttr(x));
    b.emit(Op::LoadLocal(0));
    b.emit(Op::LoadAttr(x));
    b.emit(Op::Return);

    let err = interp.execute(b.finish()).unwrap_err();
    assert_eq!(err.exception().unwrap().exc_type(), ExcType::AttributeError);
    assert_eq!(*writes.borrow(), vec!["x".to_string()]);
}

#[test]
fn descriptor_get_slot_computes_the_attribute() {
    let captured = Rc::new(RefCell::new(None::<Value>));
    let cell = Rc::clone(&captured);
    let mut interp = Interpreter::new();
    interp
        .register_class(ClassBuilder::new("Computed").method(
            "__get__",
            host("__get__", |_, _| Ok(Value::str("computed"))),
        ))
        .unwrap();
    interp
        .register(
            "capture",
            move |_, args: &[Value]| {
                *cell.borrow_mut() = Some(args[0].clone());
                Ok(Value::None)
            },
        )
        .unwrap();

    // capture(Computed())
    let mut b = CodeBuilder::new("main", 0, 0);
    let capture = b.add_name("capture");
    let computed = b.add_name("Computed");
    b.emit(Op::LoadGlobal(capture));
    b.emit(Op::LoadGlobal(computed));
    b.emit(Op::Call(0));
    b.emit(Op::Call(1));
    b.emit(Op::Return);
    interp.execute(b.finish()).unwrap();

    let descriptor = captured.borrow().clone().expect("descriptor instance captured");
    interp
        .register_class(ClassBuilder::new("Owner").attr("field", descriptor))
        .unwrap();

    let mut b = CodeBuilder::new("main", 0, 0);
    let owner = b.add_name("Owner");
    let field = b.add_name("field");
    b.emit(Op::LoadGlobal(owner));
    b.emit(Op::Call(0));
    b.emit(Op::LoadAttr(field));
    b.emit(Op::Return);
    assert_eq!(interp.execute(b.finish()).unwrap(), Object::Str("computed".to_string()));
}

#[test]
fn class_level_access_invokes_the_descriptor_without_an_instance() {
    let captured = Rc::new(RefCell::new(None::<Value>));
    let cell = Rc::clone(&captured);
    let seen = Rc::new(RefCell::new(String::new()));
    let seen_in_get = Rc::clone(&seen);
    let mut interp = Interpreter::new();
    interp
        .register_class(ClassBuilder::new("Computed").method(
            "__get__",
            host("__get__", move |_, args| {
                let Value::Class(owner) = &args[2] else {
                    return Err(VmException::new(ExcType::TypeError, None).into());
                };
                *seen_in_get.borrow_mut() = format!("{}/{}", args[1].type_name(), owner.name());
                Ok(Value::str("computed"))
            }),
        ))
        .unwrap();
    interp
        .register("capture", move |_, args: &[Value]| {
            *cell.borrow_mut() = Some(args[0].clone());
            Ok(Value::None)
        })
        .unwrap();

    // capture(Computed())
    let mut b = CodeBuilder::new("main", 0, 0);
    let capture = b.add_name("capture");
    let computed = b.add_name("Computed");
    b.emit(Op::LoadGlobal(capture));
    b.emit(Op::LoadGlobal(computed));
    b.emit(Op::Call(0));
    b.emit(Op::Call(1));
    b.emit(Op::Return);
    interp.execute(b.finish()).unwrap();

    let descriptor = captured.borrow().clone().expect("descriptor instance captured");
    interp
        .register_class(ClassBuilder::new("Owner").attr("field", descriptor))
        .unwrap();

    // Owner.field without instantiating: the get slot sees no instance and
    // the owning class.
    let mut b = CodeBuilder::new("main", 0, 0);
    let owner = b.add_name("Owner");
    let field = b.add_name("field");
    b.emit(Op::LoadGlobal(owner));
    b.emit(Op::LoadAttr(field));
    b.emit(Op::Return);
    assert_eq!(interp.execute(b.finish()).unwrap(), Object::Str("computed".to_string()));
    assert_eq!(*seen.borrow(), "NoneType/Owner");
}

#[test]
fn classmethod_receives_the_class_and_staticmethod_receives_nothing() {
    let mut interp = Interpreter::new();
    interp
        .register_class(
            ClassBuilder::new("Widget")
                .classmethod(
                    "kind",
                    host("kind", |_, args| {
                        let Value::Class(class) = &args[0] else {
                            return Err(VmException::new(ExcType::TypeError, None).into());
                        };
                        Ok(Value::str(class.name()))
                    }),
                )
                .staticmethod("answer", host("answer", |_, args| {
                    assert!(args.is_empty());
                    Ok(Value::Int(42))
                })),
        )
        .unwrap();

    let mut b = CodeBuilder::new("main", 0, 0);
    let widget = b.add_name("Widget");
    let kind = b.add_name("kind");
    let answer = b.add_name("answer");
    b.emit(Op::LoadGlobal(widget));
    b.emit(Op::Call(0));
    b.emit(Op::LoadAttr(kind));
    b.emit(Op::Call(0));
    b.emit(Op::LoadGlobal(widget));
    b.emit(Op::LoadAttr(answer));
    b.emit(Op::Call(0));
    b.emit(Op::BuildTuple(2));
    b.emit(Op::Return);
    assert_eq!(
        interp.execute(b.finish()).unwrap(),
        Object::List(vec![Object::Str("Widget".to_string()), Object::Int(42)])
    );
}
