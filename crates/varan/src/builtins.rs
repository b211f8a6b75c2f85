//! The reserved builtin namespace.
//!
//! Builtins are ordinary host functions registered through the same
//! mechanism the embedder uses; they consult the engine through the
//! [`VmContext`] callbacks rather than reaching into VM internals.

use std::rc::Rc;

use crate::{
    exception::{ExcType, RunResult, VmException},
    value::{HostFunction, Map, PropertyDescriptor, Value},
    vm::{IterNext, VmContext},
};

/// Installs the builtin functions into a namespace.
pub(crate) fn install(builtins: &mut Map) {
    let mut add = |name: &str, f: fn(&mut dyn VmContext, &[Value]) -> RunResult<Value>| {
        builtins.insert(name.to_string(), Value::HostFunction(Rc::new(HostFunction::new(name, f))));
    };
    add("len", builtin_len);
    add("repr", builtin_repr);
    add("str", builtin_str);
    add("bool", builtin_bool);
    add("hash", builtin_hash);
    add("type", builtin_type);
    add("isinstance", builtin_isinstance);
    add("iter", builtin_iter);
    add("next", builtin_next);
    add("classmethod", builtin_classmethod);
    add("staticmethod", builtin_staticmethod);
    add("property", builtin_property);
}

fn one_arg<'v>(name: &str, args: &'v [Value]) -> RunResult<&'v Value> {
    match args {
        [value] => Ok(value),
        _ => Err(ExcType::type_error(format!(
            "{name}() takes exactly one argument ({} given)",
            args.len()
        ))),
    }
}

fn builtin_len(ctx: &mut dyn VmContext, args: &[Value]) -> RunResult<Value> {
    let len = ctx.length(one_arg("len", args)?)?;
    Ok(Value::Int(i64::try_from(len).unwrap_or(i64::MAX)))
}

fn builtin_repr(ctx: &mut dyn VmContext, args: &[Value]) -> RunResult<Value> {
    Ok(Value::str(ctx.repr(one_arg("repr", args)?)?))
}

fn builtin_str(ctx: &mut dyn VmContext, args: &[Value]) -> RunResult<Value> {
    match args {
        [] => Ok(Value::str("")),
        _ => Ok(Value::str(ctx.render(one_arg("str", args)?)?)),
    }
}

fn builtin_bool(ctx: &mut dyn VmContext, args: &[Value]) -> RunResult<Value> {
    match args {
        [] => Ok(Value::Bool(false)),
        _ => Ok(Value::Bool(ctx.truthy(one_arg("bool", args)?)?)),
    }
}

fn builtin_hash(ctx: &mut dyn VmContext, args: &[Value]) -> RunResult<Value> {
    let value = one_arg("hash", args)?;
    if let Some(hash) = value.native_hash() {
        #[expect(clippy::cast_possible_wrap, reason = "hash bits, not a quantity")]
        return Ok(Value::Int(hash as i64));
    }
    if matches!(value, Value::Instance(_)) {
        let hash_method = ctx.get_attr(value, "__hash__");
        if let Ok(method) = hash_method {
            let result = ctx.call(&method, &[])?;
            let Value::Int(_) = result else {
                return Err(ExcType::type_error(format!(
                    "__hash__ should return int, returned {}",
                    result.type_name()
                )));
            };
            return Ok(result);
        }
    }
    Err(ExcType::type_error(format!("unhashable type: '{}'", value.type_name())))
}

/// Returns the class of a value: the class object for instances, the
/// exception class for exceptions, otherwise the type name as a string.
fn builtin_type(_ctx: &mut dyn VmContext, args: &[Value]) -> RunResult<Value> {
    let value = one_arg("type", args)?;
    match value {
        Value::Instance(inst) => Ok(Value::Class(Rc::clone(inst.class()))),
        Value::ExcInstance(exc) => Ok(Value::ExcClass(exc.exc_type())),
        other => Ok(Value::str(other.type_name())),
    }
}

fn builtin_isinstance(ctx: &mut dyn VmContext, args: &[Value]) -> RunResult<Value> {
    let [value, class] = args else {
        return Err(ExcType::type_error(format!(
            "isinstance() takes exactly 2 arguments ({} given)",
            args.len()
        )));
    };
    Ok(Value::Bool(ctx.is_instance(value, class)?))
}

fn builtin_iter(ctx: &mut dyn VmContext, args: &[Value]) -> RunResult<Value> {
    ctx.iterate(one_arg("iter", args)?)
}

/// Advances an iterator; exhaustion surfaces as the sentinel exception
/// since there is no consuming loop construct here.
fn builtin_next(ctx: &mut dyn VmContext, args: &[Value]) -> RunResult<Value> {
    match ctx.next(one_arg("next", args)?)? {
        IterNext::Value(value) => Ok(value),
        IterNext::Exhausted => Err(VmException::new(ExcType::StopIteration, None).into()),
    }
}

fn builtin_classmethod(_ctx: &mut dyn VmContext, args: &[Value]) -> RunResult<Value> {
    Ok(Value::ClassMethod(Rc::new(one_arg("classmethod", args)?.clone())))
}

fn builtin_staticmethod(_ctx: &mut dyn VmContext, args: &[Value]) -> RunResult<Value> {
    Ok(Value::StaticMethod(Rc::new(one_arg("staticmethod", args)?.clone())))
}

fn builtin_property(_ctx: &mut dyn VmContext, args: &[Value]) -> RunResult<Value> {
    let (getter, setter) = match args {
        [getter] => (getter.clone(), None),
        [getter, setter] => (getter.clone(), Some(setter.clone())),
        _ => {
            return Err(ExcType::type_error(format!(
                "property() takes 1 or 2 arguments ({} given)",
                args.len()
            )));
        }
    };
    Ok(Value::Property(Rc::new(PropertyDescriptor { getter, setter })))
}
