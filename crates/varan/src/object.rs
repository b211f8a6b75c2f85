//! Host-native representation of guest values.
//!
//! [`Object`] is the canonical bridge type the embedder works with: every
//! guest value converts to it, and scalar kinds round-trip losslessly.
//! Values with no natural host counterpart (instances, classes, functions)
//! convert to the output-only [`Object::Repr`] rendering.

use std::{cell::RefCell, rc::Rc};

use indexmap::IndexMap;

use crate::value::{Map, Value};

/// A guest value in host-native form.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Object>),
    Map(IndexMap<String, Object>),
    /// Output-only: a rendered form of a value with no host-native
    /// counterpart. Converting back to a guest value yields a string.
    Repr(String),
}

impl Object {
    /// True for the null object.
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl From<&Value> for Object {
    fn from(value: &Value) -> Self {
        match value {
            Value::None => Self::None,
            Value::Bool(b) => Self::Bool(*b),
            Value::Int(n) => Self::Int(*n),
            Value::Float(x) => Self::Float(*x),
            Value::Complex { re, im } => Self::Repr(format!(
                "({}+{}j)",
                crate::value::float_repr(*re),
                crate::value::float_repr(*im)
            )),
            Value::Str(s) => Self::Str(s.to_string()),
            Value::Bytes(bytes) => Self::Bytes(bytes.to_vec()),
            Value::List(items) => Self::List(items.borrow().iter().map(Self::from).collect()),
            Value::Tuple(items) => Self::List(items.iter().map(Self::from).collect()),
            Value::Dict(map) => Self::Map(map.borrow().iter().map(|(k, v)| (k.clone(), Self::from(v))).collect()),
            Value::Instance(inst) => Self::Repr(format!("<{} object>", inst.class().name())),
            Value::Class(class) => Self::Repr(format!("<class '{}'>", class.name())),
            Value::ExcClass(exc_type) => Self::Repr(format!("<class '{exc_type}'>")),
            Value::ExcInstance(exc) => Self::Repr(exc.to_string()),
            Value::Function(func) => Self::Repr(format!("<function {}>", func.name)),
            Value::HostFunction(host) => Self::Repr(format!("<function {}>", host.name())),
            Value::BoundMethod(_) => Self::Repr("<bound method>".to_string()),
            Value::Property(_) => Self::Repr("<property>".to_string()),
            Value::ClassMethod(_) => Self::Repr("<classmethod>".to_string()),
            Value::StaticMethod(_) => Self::Repr("<staticmethod>".to_string()),
            Value::Module(module) => Self::Repr(format!("<module '{}'>", module.name())),
            Value::Iterator(_) => Self::Repr("<iterator>".to_string()),
            Value::Opaque(data) => Self::Repr(format!("<{}>", data.name())),
            Value::NotImplemented => Self::Repr("NotImplemented".to_string()),
        }
    }
}

impl From<Object> for Value {
    fn from(object: Object) -> Self {
        match object {
            Object::None => Self::None,
            Object::Bool(b) => Self::Bool(b),
            Object::Int(n) => Self::Int(n),
            Object::Float(x) => Self::Float(x),
            Object::Str(s) | Object::Repr(s) => Self::str(s),
            Object::Bytes(bytes) => Self::Bytes(Rc::from(bytes)),
            Object::List(items) => Self::list(items.into_iter().map(Self::from).collect()),
            Object::Map(map) => {
                let converted: Map = map.into_iter().map(|(k, v)| (k, Self::from(v))).collect();
                Self::Dict(Rc::new(RefCell::new(converted)))
            }
        }
    }
}

impl From<i64> for Object {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<bool> for Object {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for Object {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<&str> for Object {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trip_is_lossless() {
        for object in [
            Object::None,
            Object::Bool(true),
            Object::Int(-7),
            Object::Float(2.5),
            Object::Str("hello".to_string()),
            Object::Bytes(vec![0, 255]),
        ] {
            let value = Value::from(object.clone());
            assert_eq!(Object::from(&value), object);
        }
    }

    #[test]
    fn containers_convert_recursively() {
        let value = Value::list(vec![Value::Int(1), Value::str("x")]);
        let object = Object::from(&value);
        assert_eq!(object, Object::List(vec![Object::Int(1), Object::Str("x".to_string())]));
    }

    #[test]
    fn instances_render_as_repr() {
        let class = crate::class::ClassBuilder::new("Widget")
            .build(&crate::class::ClassObject::new_root())
            .unwrap();
        let value = Value::Instance(Rc::new(crate::class::Instance::new(class)));
        assert_eq!(Object::from(&value), Object::Repr("<Widget object>".to_string()));
    }
}
