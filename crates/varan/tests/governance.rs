//! Resource governance: recursion, allocation, collection size, wall-clock
//! deadlines, instruction budgets, and external cancellation.

use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use varan::bytecode::{Code, CodeBuilder, Op};
use varan::{BinaryOp, CancelToken, ClassBuilder, ExcType, ExecError, HostFunction, Interpreter, Object, Value};

/// `20 + 22`, used to prove an interpreter still works after a failure.
fn trivial_sum() -> Code {
    let mut b = CodeBuilder::new("main", 0, 0);
    let lhs = b.add_const(Value::Int(20));
    let rhs = b.add_const(Value::Int(22));
    b.emit(Op::LoadConst(lhs));
    b.emit(Op::LoadConst(rhs));
    b.emit(Op::Binary(BinaryOp::Add));
    b.emit(Op::Return);
    b.finish()
}

/// An unconditional self-jump; only governance can stop it.
fn busy_loop() -> Code {
    let mut b = CodeBuilder::new("main", 0, 0);
    b.emit(Op::Jump(0));
    b.finish()
}

/// Wraps `body_ops` in a handler that returns "caught" when the in-flight
/// exception matches `handler_type` and re-raises otherwise.
fn guarded(body_ops: &[Op], handler_type: ExcType, mut b: CodeBuilder) -> Code {
    let body_start = b.position();
    for op in body_ops {
        b.emit(*op);
    }
    let body_end = b.position();
    let fell_through = b.add_const(Value::str("fell-through"));
    b.emit(Op::LoadConst(fell_through));
    b.emit(Op::Return);
    let handler = b.position();
    let class = b.add_const(Value::ExcClass(handler_type));
    b.emit(Op::LoadConst(class));
    b.emit(Op::CheckExcMatch);
    let no_match = b.emit_jump(Op::PopJumpIfFalse(u32::MAX));
    b.emit(Op::Pop);
    let caught = b.add_const(Value::str("caught"));
    b.emit(Op::LoadConst(caught));
    b.emit(Op::Return);
    b.patch_jump(no_match);
    b.emit(Op::Raise);
    b.add_exception_span(body_start, body_end, handler, 0);
    b.finish()
}

#[test]
fn recursion_ceiling_is_catchable_and_interpreter_survives() {
    let mut f = CodeBuilder::new("f", 0, 0);
    let f_name = f.add_name("f");
    f.emit(Op::LoadGlobal(f_name));
    f.emit(Op::Call(0));
    f.emit(Op::Return);

    let mut b = CodeBuilder::new("main", 0, 0);
    let nested = b.add_nested(f.finish());
    let f_global = b.add_name("f");
    b.emit(Op::MakeFunction(nested));
    b.emit(Op::StoreGlobal(f_global));
    let code = guarded(
        &[Op::LoadGlobal(f_global), Op::Call(0), Op::Pop],
        ExcType::RecursionError,
        b,
    );

    let mut interp = Interpreter::new();
    interp.set_max_recursion_depth(10);
    assert_eq!(interp.execute(code).unwrap(), Object::Str("caught".to_string()));

    // The failure was contained; the same interpreter keeps working.
    assert_eq!(interp.execute(trivial_sum()).unwrap(), Object::Int(42));
}

#[test]
fn host_hook_reentry_is_stopped_by_the_recursion_ceiling() {
    let mut interp = Interpreter::new();
    interp.set_max_recursion_depth(50);
    interp
        .register_class(ClassBuilder::new("Loopy").method(
            "__getattribute__",
            Value::HostFunction(Rc::new(HostFunction::new("__getattribute__", |ctx, args| {
                ctx.get_attr(&args[0], "x")
            }))),
        ))
        .unwrap();

    // Loopy().x re-enters the engine from inside the hook; the ceiling must
    // stop the host/guest ping-pong, not the native stack.
    let mut b = CodeBuilder::new("main", 0, 0);
    let loopy = b.add_name("Loopy");
    let x = b.add_name("x");
    b.emit(Op::LoadGlobal(loopy));
    b.emit(Op::Call(0));
    b.emit(Op::LoadAttr(x));
    b.emit(Op::Return);
    let err = interp.execute(b.finish()).unwrap_err();
    assert_eq!(err.exception().unwrap().exc_type(), ExcType::RecursionError);

    assert_eq!(interp.execute(trivial_sum()).unwrap(), Object::Int(42));
}

#[test]
fn deadline_expiry_bypasses_guest_handlers() {
    // Even a BaseException handler around the loop must not see the timeout.
    let mut b = CodeBuilder::new("main", 0, 0);
    let body_start = b.position();
    b.emit(Op::Jump(body_start));
    let body_end = b.position();
    let handler = b.position();
    b.emit(Op::Pop);
    let caught = b.add_const(Value::str("caught"));
    b.emit(Op::LoadConst(caught));
    b.emit(Op::Return);
    b.add_exception_span(body_start, body_end, handler, 0);

    let mut interp = Interpreter::new();
    let started = Instant::now();
    let err = interp
        .execute_with_timeout(b.finish(), Duration::from_millis(50))
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(10), "deadline was not enforced");
    let ExecError::Cancelled(exc) = err else {
        panic!("expected a cancellation, got {err:?}");
    };
    assert_eq!(exc.exc_type(), ExcType::TimeoutError);
}

#[test]
fn external_cancellation_stops_a_busy_loop() {
    let token = CancelToken::new();
    let remote = token.clone();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        remote.cancel();
    });

    let mut interp = Interpreter::new();
    let err = interp.execute_with_cancel(busy_loop(), token).unwrap_err();
    canceller.join().unwrap();

    let ExecError::Cancelled(exc) = err else {
        panic!("expected a cancellation, got {err:?}");
    };
    assert_eq!(exc.exc_type(), ExcType::CancelledError);
}

#[test]
fn instruction_budget_exhaustion_is_uncatchable() {
    let mut interp = Interpreter::new();
    interp.set_max_operations(10_000);
    let err = interp.execute(busy_loop()).unwrap_err();
    let ExecError::Cancelled(exc) = err else {
        panic!("expected a cancellation, got {err:?}");
    };
    assert_eq!(exc.exc_type(), ExcType::TimeoutError);
}

#[test]
fn allocation_ceiling_raises_catchable_memory_error() {
    let mut b = CodeBuilder::new("main", 0, 0);
    let head = b.position();
    let code = guarded(
        &[Op::BuildList(0), Op::Pop, Op::Jump(head)],
        ExcType::MemoryError,
        b,
    );

    let mut interp = Interpreter::new();
    interp.set_max_allocation_bytes(16 * 1024);
    assert_eq!(interp.execute(code).unwrap(), Object::Str("caught".to_string()));
    assert!(interp.allocated_bytes() > 0);
}

#[test]
fn collection_size_ceiling_applies_to_a_single_build() {
    let mut b = CodeBuilder::new("main", 0, 0);
    for i in 0..8 {
        let idx = b.add_const(Value::Int(i));
        b.emit(Op::LoadConst(idx));
    }
    b.emit(Op::BuildList(8));
    b.emit(Op::Return);

    let mut interp = Interpreter::new();
    interp.set_max_collection_len(4);
    let err = interp.execute(b.finish()).unwrap_err();
    assert_eq!(
        err.exception().map(varan::VmException::exc_type),
        Some(ExcType::CollectionLimitError)
    );
}

#[test]
fn unrelated_exceptions_are_reraised_by_the_guard() {
    let mut b = CodeBuilder::new("main", 0, 0);
    let exc = b.add_const(Value::ExcClass(ExcType::ValueError));
    let code = guarded(&[Op::LoadConst(exc), Op::Raise], ExcType::KeyError, b);

    let mut interp = Interpreter::new();
    let err = interp.execute(code).unwrap_err();
    assert_eq!(err.exception().unwrap().exc_type(), ExcType::ValueError);
}
