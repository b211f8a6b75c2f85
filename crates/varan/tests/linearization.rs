//! Class-construction and linearization behavior through the public API.

use pretty_assertions::assert_eq;
use varan::{ClassBuilder, ExcType, Interpreter};

#[test]
fn diamond_linearizes_left_to_right() {
    let mut interp = Interpreter::new();
    let a = interp.register_class(ClassBuilder::new("A")).unwrap();
    let b = interp.register_class(ClassBuilder::new("B").base(&a)).unwrap();
    let c = interp.register_class(ClassBuilder::new("C").base(&a)).unwrap();
    let d = interp
        .register_class(ClassBuilder::new("D").base(&b).base(&c))
        .unwrap();
    assert_eq!(d.linearization_names(), vec!["D", "B", "C", "A", "object"]);
}

#[test]
fn conflicting_base_orders_fail_construction() {
    let mut interp = Interpreter::new();
    let a = interp.register_class(ClassBuilder::new("A")).unwrap();
    let b = interp.register_class(ClassBuilder::new("B")).unwrap();
    let ab = interp
        .register_class(ClassBuilder::new("AB").base(&a).base(&b))
        .unwrap();
    let ba = interp
        .register_class(ClassBuilder::new("BA").base(&b).base(&a))
        .unwrap();

    let err = interp
        .register_class(ClassBuilder::new("Broken").base(&ab).base(&ba))
        .unwrap_err();
    let exc = err.exception().expect("construction failure carries an exception");
    assert_eq!(exc.exc_type(), ExcType::InconsistentHierarchy);
}

#[test]
fn single_inheritance_chain() {
    let mut interp = Interpreter::new();
    let base = interp.register_class(ClassBuilder::new("Base")).unwrap();
    let mid = interp.register_class(ClassBuilder::new("Mid").base(&base)).unwrap();
    let leaf = interp.register_class(ClassBuilder::new("Leaf").base(&mid)).unwrap();
    assert_eq!(leaf.linearization_names(), vec!["Leaf", "Mid", "Base", "object"]);
}

#[test]
fn each_ancestor_appears_exactly_once() {
    let mut interp = Interpreter::new();
    let a = interp.register_class(ClassBuilder::new("A")).unwrap();
    let b = interp.register_class(ClassBuilder::new("B").base(&a)).unwrap();
    let c = interp.register_class(ClassBuilder::new("C").base(&a)).unwrap();
    let d = interp.register_class(ClassBuilder::new("D").base(&a)).unwrap();
    let e = interp
        .register_class(ClassBuilder::new("E").base(&b).base(&c).base(&d))
        .unwrap();

    let names = e.linearization_names();
    assert_eq!(names, vec!["E", "B", "C", "D", "A", "object"]);
}
