//! Interpreter lifecycle: globals, module registration and loading, and the
//! closed-instance contract (mutations fail loudly, reads go quiet).

use std::{cell::RefCell, rc::Rc};

use pretty_assertions::assert_eq;
use varan::bytecode::{Code, CodeBuilder, Op};
use varan::{
    BinaryOp, ClassBuilder, ExcType, ExecError, Interpreter, ModuleLoader, Object, Value, VmException,
};

/// A module body binding `answer = 42`.
fn answer_module(name: &str) -> Code {
    let mut b = CodeBuilder::new(name, 0, 0);
    let forty_two = b.add_const(Value::Int(42));
    let answer = b.add_name("answer");
    b.emit(Op::LoadConst(forty_two));
    b.emit(Op::StoreGlobal(answer));
    b.finish()
}

#[test]
fn globals_round_trip_between_host_and_guest() {
    let mut interp = Interpreter::new();
    interp.set_global("x", Value::Int(7)).unwrap();

    // y = x + 1
    let mut b = CodeBuilder::new("main", 0, 0);
    let x = b.add_name("x");
    let y = b.add_name("y");
    let one = b.add_const(Value::Int(1));
    b.emit(Op::LoadGlobal(x));
    b.emit(Op::LoadConst(one));
    b.emit(Op::Binary(BinaryOp::Add));
    b.emit(Op::StoreGlobal(y));
    interp.execute(b.finish()).unwrap();

    assert_eq!(interp.get_global("y"), Some(Object::Int(8)));
    let names = interp.global_names();
    assert!(names.contains(&"x".to_string()) && names.contains(&"y".to_string()));
}

#[test]
fn closed_instance_rejects_mutations_and_silences_reads() {
    let mut interp = Interpreter::new();
    interp.set_global("x", Value::Int(1)).unwrap();
    interp.close();
    assert!(interp.is_closed());

    // Mutations fail loudly.
    let mut b = CodeBuilder::new("main", 0, 0);
    let one = b.add_const(Value::Int(1));
    b.emit(Op::LoadConst(one));
    b.emit(Op::Return);
    let err = interp.execute(b.finish()).unwrap_err();
    assert!(matches!(err, ExecError::Closed));
    assert!(err.to_string().contains("closed"));
    assert!(matches!(interp.set_global("y", Value::Int(2)), Err(ExecError::Closed)));
    assert!(matches!(
        interp.register("f", |_, _| Ok(Value::None)),
        Err(ExecError::Closed)
    ));
    assert!(matches!(
        interp.register_class(ClassBuilder::new("C")),
        Err(ExecError::Closed)
    ));

    // Reads and configuration go quiet instead of failing.
    assert_eq!(interp.get_global("x"), None);
    assert!(interp.global_names().is_empty());
    assert_eq!(interp.allocated_bytes(), 0);
    interp.set_max_recursion_depth(5);
    interp.set_max_operations(5);

    // Closing again is a no-op.
    interp.close();
    assert!(interp.is_closed());
}

#[test]
fn dotted_registration_is_importable_by_full_name_and_via_packages() {
    let mut interp = Interpreter::new();
    interp.register_module("a.b.c", answer_module("a.b.c")).unwrap();

    let mut b = CodeBuilder::new("main", 0, 0);
    let full = b.add_name("a.b.c");
    let answer = b.add_name("answer");
    b.emit(Op::Import(full));
    b.emit(Op::LoadAttr(answer));
    b.emit(Op::Return);
    assert_eq!(interp.execute(b.finish()).unwrap(), Object::Int(42));

    // The same module is reachable by walking the package chain.
    let mut b = CodeBuilder::new("main", 0, 0);
    let top = b.add_name("a");
    let mid = b.add_name("b");
    let leaf = b.add_name("c");
    let answer = b.add_name("answer");
    b.emit(Op::Import(top));
    b.emit(Op::LoadAttr(mid));
    b.emit(Op::LoadAttr(leaf));
    b.emit(Op::LoadAttr(answer));
    b.emit(Op::Return);
    assert_eq!(interp.execute(b.finish()).unwrap(), Object::Int(42));
}

struct CountingLoader {
    calls: Rc<RefCell<u32>>,
}

impl ModuleLoader for CountingLoader {
    fn load(&mut self, name: &str) -> Option<Code> {
        *self.calls.borrow_mut() += 1;
        (name == "ext").then(|| answer_module("ext"))
    }
}

#[test]
fn loader_satisfies_unregistered_imports_exactly_once() {
    let calls = Rc::new(RefCell::new(0u32));
    let mut interp = Interpreter::new();
    interp
        .set_module_loader(CountingLoader { calls: Rc::clone(&calls) })
        .unwrap();

    let import_ext = || {
        let mut b = CodeBuilder::new("main", 0, 0);
        let ext = b.add_name("ext");
        let answer = b.add_name("answer");
        b.emit(Op::Import(ext));
        b.emit(Op::LoadAttr(answer));
        b.emit(Op::Return);
        b.finish()
    };
    assert_eq!(interp.execute(import_ext()).unwrap(), Object::Int(42));
    assert_eq!(interp.execute(import_ext()).unwrap(), Object::Int(42));
    assert_eq!(*calls.borrow(), 1, "second import must hit the table, not the loader");
}

#[test]
fn unresolvable_import_raises_import_error() {
    let mut interp = Interpreter::new();
    let mut b = CodeBuilder::new("main", 0, 0);
    let nope = b.add_name("nope");
    b.emit(Op::Import(nope));
    b.emit(Op::Return);
    let err = interp.execute(b.finish()).unwrap_err();
    assert_eq!(err.exception().unwrap().exc_type(), ExcType::ImportError);
}

#[test]
fn host_function_errors_surface_as_guest_exceptions() {
    let mut interp = Interpreter::new();
    interp
        .register("boom", |_, _| {
            Err(VmException::new(ExcType::ValueError, Some("kaboom".to_string())).into())
        })
        .unwrap();

    let mut b = CodeBuilder::new("main", 0, 0);
    let boom = b.add_name("boom");
    b.emit(Op::LoadGlobal(boom));
    b.emit(Op::Call(0));
    b.emit(Op::Return);
    let err = interp.execute(b.finish()).unwrap_err();
    let exc = err.exception().unwrap();
    assert_eq!(exc.exc_type(), ExcType::ValueError);
    assert_eq!(exc.message(), Some("kaboom"));
}
