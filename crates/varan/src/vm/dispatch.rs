//! Protocol dispatch: slot resolution, operand fallback for binary
//! operators, comparisons, iteration, context managers, descriptors, and
//! the attribute-interception pipeline.
//!
//! Slot lookup is always type-based: it reads the receiver's class slot
//! table (resolved over the linearization at class-build time) and never
//! consults the instance's own attribute store.

use std::{cell::RefCell, rc::Rc};

use smallvec::SmallVec;

use crate::{
    class::ClassObject,
    exception::{ExcType, RunError, RunResult, VmException},
    resource::ResourceTracker,
    slots::{BinaryOp, CompareOp, Slot, UnaryOp},
    value::{float_repr, string_repr_fmt, BoundMethod, IterState, NativeIter, Value},
    vm::{IterNext, Vm},
};

impl<T: ResourceTracker> Vm<'_, T> {
    /// Calls `func` and tags any escaping exception with the slot name.
    fn invoke_slot(&mut self, func: &Value, args: &[Value], slot: Slot) -> RunResult<Value> {
        match self.call_value(func, args) {
            Ok(value) => Ok(value),
            Err(mut err) => {
                if let RunError::Exc(exc) | RunError::UncatchableExc(exc) = &mut err {
                    exc.tag_slot(slot.method_name());
                }
                Err(err)
            }
        }
    }

    /// Resolves and invokes a protocol slot on an instance receiver.
    ///
    /// Returns `Ok(None)` when the receiver is not an instance or its class
    /// does not define the slot. Fixed-arity slots reject a wrong operand
    /// count before the implementation runs.
    pub(crate) fn call_slot(&mut self, receiver: &Value, slot: Slot, args: &[Value]) -> RunResult<Option<Value>> {
        let Value::Instance(inst) = receiver else {
            return Ok(None);
        };
        let Some(func) = inst.class().slot(slot).cloned() else {
            return Ok(None);
        };
        if let Some(required) = slot.required_operands() {
            if args.len() != required {
                return Err(ExcType::slot_arity_error(slot.method_name(), required + 1, args.len() + 1));
            }
        }
        let mut full: SmallVec<[Value; 4]> = SmallVec::with_capacity(args.len() + 1);
        full.push(receiver.clone());
        full.extend(args.iter().cloned());
        self.invoke_slot(&func, &full, slot).map(Some)
    }

    /// Accounts a freshly produced compound value against the allocation
    /// and collection ceilings.
    fn account_allocation(&mut self, value: &Value) -> RunResult<()> {
        if matches!(
            value,
            Value::Str(_) | Value::Bytes(_) | Value::List(_) | Value::Tuple(_) | Value::Dict(_)
        ) {
            if let Some(len) = value.native_len() {
                self.tracker.check_collection_len(len)?;
            }
            self.tracker.on_allocate(|| value.estimate_size())?;
        }
        Ok(())
    }

    /// Binary operator with full fallback: native fast path, the left
    /// operand's forward slot, the right operand's reflected slot, then
    /// `TypeError` naming both operand types.
    pub(crate) fn binary_op(&mut self, op: BinaryOp, lhs: &Value, rhs: &Value) -> RunResult<Value> {
        if let Some(result) = lhs.native_binary(op, rhs)? {
            self.account_allocation(&result)?;
            return Ok(result);
        }
        let (forward, reflected, _) = op.slots();
        if let Some(result) = self.call_slot(lhs, forward, std::slice::from_ref(rhs))? {
            if !matches!(result, Value::NotImplemented) {
                return Ok(result);
            }
        }
        if let Some(result) = self.call_slot(rhs, reflected, std::slice::from_ref(lhs))? {
            if !matches!(result, Value::NotImplemented) {
                return Ok(result);
            }
        }
        Err(ExcType::binary_type_error(op.symbol(), lhs.type_name(), rhs.type_name()))
    }

    /// In-place operator: the in-place slot first, then the full binary
    /// fallback chain (producing a new value instead of mutating).
    pub(crate) fn inplace_op(&mut self, op: BinaryOp, lhs: &Value, rhs: &Value) -> RunResult<Value> {
        let (_, _, inplace) = op.slots();
        if let Some(result) = self.call_slot(lhs, inplace, std::slice::from_ref(rhs))? {
            if !matches!(result, Value::NotImplemented) {
                return Ok(result);
            }
        }
        self.binary_op(op, lhs, rhs)
    }

    /// Comparison dispatch. Equality consults the left then the right
    /// operand's slot and falls back to identity; ordering consults only the
    /// left operand's slot and raises rather than trying the mirrored slot.
    pub(crate) fn compare_op(&mut self, op: CompareOp, lhs: &Value, rhs: &Value) -> RunResult<Value> {
        if let Some(result) = self.call_slot(lhs, op.slot(), std::slice::from_ref(rhs))? {
            if !matches!(result, Value::NotImplemented) {
                return Ok(result);
            }
        }
        if op.is_equality() {
            if let Some(result) = self.call_slot(rhs, op.slot(), std::slice::from_ref(lhs))? {
                if !matches!(result, Value::NotImplemented) {
                    return Ok(result);
                }
            }
            let eq = if matches!(lhs, Value::Instance(_)) || matches!(rhs, Value::Instance(_)) {
                lhs.is_identical(rhs)
            } else {
                lhs.native_eq(rhs)
            };
            return Ok(Value::Bool(eq == matches!(op, CompareOp::Eq)));
        }
        match lhs.native_ordering(rhs) {
            Some(ordering) => {
                let outcome = match op {
                    CompareOp::Lt => ordering.is_lt(),
                    CompareOp::Le => ordering.is_le(),
                    CompareOp::Gt => ordering.is_gt(),
                    CompareOp::Ge => ordering.is_ge(),
                    CompareOp::Eq | CompareOp::Ne => unreachable!("equality handled above"),
                };
                Ok(Value::Bool(outcome))
            }
            None => Err(ExcType::type_error(format!(
                "'{}' not supported between instances of '{}' and '{}'",
                op.symbol(),
                lhs.type_name(),
                rhs.type_name()
            ))),
        }
    }

    /// Unary operator dispatch.
    pub(crate) fn unary_op(&mut self, op: UnaryOp, operand: &Value) -> RunResult<Value> {
        if matches!(op, UnaryOp::Not) {
            let truth = self.value_truthy(operand)?;
            return Ok(Value::Bool(!truth));
        }
        if let Some(result) = operand.native_unary(op)? {
            return Ok(result);
        }
        if let Some(slot) = op.slot() {
            if let Some(result) = self.call_slot(operand, slot, &[])? {
                return Ok(result);
            }
        }
        Err(ExcType::type_error(format!(
            "bad operand type for unary {}: '{}'",
            op.symbol(),
            operand.type_name()
        )))
    }

    /// Equality between any two values, slot-aware for instances.
    pub(crate) fn values_equal(&mut self, lhs: &Value, rhs: &Value) -> RunResult<bool> {
        if matches!(lhs, Value::Instance(_)) || matches!(rhs, Value::Instance(_)) {
            let result = self.compare_op(CompareOp::Eq, lhs, rhs)?;
            return self.value_truthy(&result);
        }
        Ok(lhs.native_eq(rhs))
    }

    /// Truth value: natives directly, then `__bool__`, then `__len__`,
    /// defaulting to true.
    pub(crate) fn value_truthy(&mut self, value: &Value) -> RunResult<bool> {
        if let Some(truth) = value.native_truthy() {
            return Ok(truth);
        }
        if let Some(result) = self.call_slot(value, Slot::Bool, &[])? {
            let Value::Bool(truth) = result else {
                return Err(ExcType::type_error(format!(
                    "__bool__ should return bool, returned {}",
                    result.type_name()
                )));
            };
            return Ok(truth);
        }
        if let Value::Instance(inst) = value {
            if inst.class().slot(Slot::Len).is_some() {
                return Ok(self.value_len(value)? != 0);
            }
        }
        Ok(true)
    }

    /// Length via the native kinds or the `__len__` slot.
    pub(crate) fn value_len(&mut self, value: &Value) -> RunResult<usize> {
        if let Some(len) = value.native_len() {
            return Ok(len);
        }
        let Some(result) = self.call_slot(value, Slot::Len, &[])? else {
            return Err(ExcType::type_error(format!(
                "object of type '{}' has no len()",
                value.type_name()
            )));
        };
        match result {
            Value::Int(n) if n >= 0 => Ok(usize::try_from(n).unwrap_or(usize::MAX)),
            Value::Int(_) => Err(ExcType::value_error("__len__() should return >= 0")),
            other => Err(ExcType::type_error(format!(
                "__len__ should return int, returned {}",
                other.type_name()
            ))),
        }
    }

    // --- representations ---

    /// Developer-facing representation, cycle-safe for containers.
    pub(crate) fn repr_value(&mut self, value: &Value) -> RunResult<String> {
        let mut visited = Vec::new();
        self.repr_inner(value, &mut visited)
    }

    fn repr_inner(&mut self, value: &Value, visited: &mut Vec<usize>) -> RunResult<String> {
        let result = match value {
            Value::None => "None".to_string(),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::Int(n) => n.to_string(),
            Value::Float(x) => float_repr(*x),
            Value::Complex { re, im } => {
                if *re == 0.0 {
                    format!("{}j", float_repr(*im))
                } else if *im < 0.0 || im.is_sign_negative() {
                    format!("({}{}j)", float_repr(*re), float_repr(*im))
                } else {
                    format!("({}+{}j)", float_repr(*re), float_repr(*im))
                }
            }
            Value::Str(s) => {
                let mut out = String::with_capacity(s.len() + 2);
                string_repr_fmt(&mut out, s).map_err(|_| RunError::internal("string formatting failed"))?;
                out
            }
            Value::Bytes(bytes) => {
                let mut out = String::from("b'");
                for byte in bytes.iter() {
                    match byte {
                        b'\'' => out.push_str("\\'"),
                        b'\\' => out.push_str("\\\\"),
                        0x20..=0x7e => out.push(*byte as char),
                        b'\n' => out.push_str("\\n"),
                        other => out.push_str(&format!("\\x{other:02x}")),
                    }
                }
                out.push('\'');
                out
            }
            Value::List(items) => {
                let addr = Rc::as_ptr(items) as usize;
                if visited.contains(&addr) {
                    "[...]".to_string()
                } else {
                    visited.push(addr);
                    let parts = self.repr_items(&items.borrow().clone(), visited)?;
                    visited.pop();
                    format!("[{}]", parts.join(", "))
                }
            }
            Value::Tuple(items) => {
                let parts = self.repr_items(items, visited)?;
                if parts.len() == 1 {
                    format!("({},)", parts[0])
                } else {
                    format!("({})", parts.join(", "))
                }
            }
            Value::Dict(map) => {
                let addr = Rc::as_ptr(map) as usize;
                if visited.contains(&addr) {
                    "{...}".to_string()
                } else {
                    visited.push(addr);
                    let entries = map.borrow().clone();
                    let mut parts = Vec::with_capacity(entries.len());
                    for (key, val) in &entries {
                        let mut key_repr = String::new();
                        string_repr_fmt(&mut key_repr, key)
                            .map_err(|_| RunError::internal("string formatting failed"))?;
                        parts.push(format!("{key_repr}: {}", self.repr_inner(val, visited)?));
                    }
                    visited.pop();
                    format!("{{{}}}", parts.join(", "))
                }
            }
            Value::Instance(inst) => {
                if let Some(result) = self.call_slot(value, Slot::Repr, &[])? {
                    let Value::Str(s) = result else {
                        return Err(ExcType::type_error(format!(
                            "__repr__ returned non-string (type {})",
                            result.type_name()
                        )));
                    };
                    s.to_string()
                } else {
                    format!("<{} object>", inst.class().name())
                }
            }
            Value::Class(class) => format!("<class '{}'>", class.name()),
            Value::ExcClass(exc_type) => format!("<class '{exc_type}'>"),
            Value::ExcInstance(exc) => match exc.message() {
                Some(msg) => {
                    let mut quoted = String::new();
                    string_repr_fmt(&mut quoted, msg).map_err(|_| RunError::internal("string formatting failed"))?;
                    format!("{}({quoted})", exc.exc_type())
                }
                None => format!("{}()", exc.exc_type()),
            },
            Value::Function(func) => format!("<function {}>", func.name),
            Value::HostFunction(host) => format!("<function {}>", host.name()),
            Value::BoundMethod(method) => format!("<bound method of {}>", method.receiver.type_name()),
            Value::Property(_) => "<property>".to_string(),
            Value::ClassMethod(_) => "<classmethod>".to_string(),
            Value::StaticMethod(_) => "<staticmethod>".to_string(),
            Value::Module(module) => format!("<module '{}'>", module.name()),
            Value::Iterator(_) => "<iterator>".to_string(),
            Value::Opaque(data) => format!("<{}>", data.name()),
            Value::NotImplemented => "NotImplemented".to_string(),
        };
        Ok(result)
    }

    fn repr_items(&mut self, items: &[Value], visited: &mut Vec<usize>) -> RunResult<Vec<String>> {
        items.iter().map(|item| self.repr_inner(item, visited)).collect()
    }

    /// User-facing rendering: `__str__` when defined, strings verbatim,
    /// otherwise the repr.
    pub(crate) fn str_value(&mut self, value: &Value) -> RunResult<String> {
        match value {
            Value::Str(s) => Ok(s.to_string()),
            Value::ExcInstance(exc) => Ok(exc.message().unwrap_or_default().to_string()),
            Value::Instance(_) => {
                if let Some(result) = self.call_slot(value, Slot::Str, &[])? {
                    let Value::Str(s) = result else {
                        return Err(ExcType::type_error(format!(
                            "__str__ returned non-string (type {})",
                            result.type_name()
                        )));
                    };
                    return Ok(s.to_string());
                }
                self.repr_value(value)
            }
            other => self.repr_value(other),
        }
    }

    // --- iteration ---

    /// Obtains an iterator: native containers get index-based iterators,
    /// instances go through `__iter__` and must yield something with
    /// `__next__`.
    pub(crate) fn get_iter(&mut self, value: &Value) -> RunResult<Value> {
        let state = match value {
            Value::List(items) => NativeIter::List(Rc::clone(items), 0),
            Value::Tuple(items) => NativeIter::Tuple(Rc::clone(items), 0),
            Value::Str(s) => NativeIter::Chars(Rc::clone(s), 0),
            Value::Bytes(bytes) => NativeIter::Bytes(Rc::clone(bytes), 0),
            Value::Dict(map) => NativeIter::Keys(map.borrow().keys().cloned().collect(), 0),
            Value::Iterator(_) => return Ok(value.clone()),
            Value::Instance(_) => {
                let Some(iterator) = self.call_slot(value, Slot::Iter, &[])? else {
                    return Err(ExcType::type_error(format!(
                        "'{}' object is not iterable",
                        value.type_name()
                    )));
                };
                let valid = match &iterator {
                    Value::Iterator(_) => true,
                    Value::Instance(inst) => inst.class().slot(Slot::Next).is_some(),
                    _ => false,
                };
                if !valid {
                    return Err(ExcType::type_error(format!(
                        "iter() returned non-iterator of type '{}'",
                        iterator.type_name()
                    )));
                }
                return Ok(iterator);
            }
            other => {
                return Err(ExcType::type_error(format!(
                    "'{}' object is not iterable",
                    other.type_name()
                )));
            }
        };
        Ok(Value::Iterator(IterState(Rc::new(RefCell::new(state)))))
    }

    /// Advances an iterator. A guest `__next__` raising the exhaustion
    /// sentinel is translated to `Exhausted` here, never propagated to loop
    /// bodies.
    pub(crate) fn iter_next(&mut self, iterator: &Value) -> RunResult<IterNext> {
        match iterator {
            Value::Iterator(state) => {
                let mut state = state.0.borrow_mut();
                let next = match &mut *state {
                    NativeIter::List(items, idx) => {
                        let item = items.borrow().get(*idx).cloned();
                        *idx += 1;
                        item
                    }
                    NativeIter::Tuple(items, idx) => {
                        let item = items.get(*idx).cloned();
                        *idx += 1;
                        item
                    }
                    NativeIter::Chars(s, pos) => match s[*pos..].chars().next() {
                        Some(c) => {
                            *pos += c.len_utf8();
                            Some(Value::str(c.to_string()))
                        }
                        None => None,
                    },
                    NativeIter::Bytes(bytes, idx) => {
                        let item = bytes.get(*idx).map(|b| Value::Int(i64::from(*b)));
                        *idx += 1;
                        item
                    }
                    NativeIter::Keys(keys, idx) => {
                        let item = keys.get(*idx).map(Value::str);
                        *idx += 1;
                        item
                    }
                };
                Ok(next.map_or(IterNext::Exhausted, IterNext::Value))
            }
            Value::Instance(_) => match self.call_slot(iterator, Slot::Next, &[]) {
                Ok(Some(value)) => Ok(IterNext::Value(value)),
                Ok(None) => Err(ExcType::type_error(format!(
                    "'{}' object is not an iterator",
                    iterator.type_name()
                ))),
                Err(err) if err.is_catchable_as(ExcType::StopIteration) => Ok(IterNext::Exhausted),
                Err(err) => Err(err),
            },
            other => Err(ExcType::type_error(format!(
                "'{}' object is not an iterator",
                other.type_name()
            ))),
        }
    }

    /// Membership test: `__contains__`, native containers, then the
    /// iteration fallback.
    pub(crate) fn contains(&mut self, container: &Value, item: &Value) -> RunResult<bool> {
        if let Some(result) = self.call_slot(container, Slot::Contains, std::slice::from_ref(item))? {
            return self.value_truthy(&result);
        }
        match container {
            Value::Str(haystack) => {
                let Value::Str(needle) = item else {
                    return Err(ExcType::type_error(format!(
                        "'in <string>' requires string as left operand, not '{}'",
                        item.type_name()
                    )));
                };
                Ok(haystack.contains(&**needle))
            }
            Value::Bytes(bytes) => match item.as_i64() {
                Some(b) if (0..=255).contains(&b) => Ok(bytes.contains(&u8::try_from(b).unwrap_or(0))),
                _ => Err(ExcType::type_error("bytes membership requires an int in range(256)")),
            },
            Value::List(items) => {
                let snapshot = items.borrow().clone();
                for candidate in &snapshot {
                    if self.values_equal(candidate, item)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Value::Tuple(items) => {
                let snapshot = items.to_vec();
                for candidate in &snapshot {
                    if self.values_equal(candidate, item)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Value::Dict(map) => {
                let Value::Str(key) = item else { return Ok(false) };
                Ok(map.borrow().contains_key(&**key))
            }
            Value::Instance(_) => {
                let iterator = self.get_iter(container)?;
                loop {
                    match self.iter_next(&iterator)? {
                        IterNext::Value(candidate) => {
                            self.tracker.check_tick()?;
                            if self.values_equal(&candidate, item)? {
                                return Ok(true);
                            }
                        }
                        IterNext::Exhausted => return Ok(false),
                    }
                }
            }
            other => Err(ExcType::type_error(format!(
                "argument of type '{}' is not iterable",
                other.type_name()
            ))),
        }
    }

    // --- context managers ---

    /// Invokes the enter slot on block entry.
    pub(crate) fn context_enter(&mut self, manager: &Value) -> RunResult<Value> {
        let Some(entered) = self.call_slot(manager, Slot::Enter, &[])? else {
            return Err(ExcType::type_error(format!(
                "'{}' object does not support the context manager protocol",
                manager.type_name()
            )));
        };
        Ok(entered)
    }

    /// Invokes the exit slot with exception info (or the no-exception
    /// triple). Returns whether a pending exception is suppressed.
    pub(crate) fn context_exit(&mut self, manager: &Value, pending: Option<&Rc<VmException>>) -> RunResult<bool> {
        let args = match pending {
            Some(exc) => [
                Value::ExcClass(exc.exc_type()),
                Value::ExcInstance(Rc::clone(exc)),
                Value::None,
            ],
            None => [Value::None, Value::None, Value::None],
        };
        let Some(result) = self.call_slot(manager, Slot::Exit, &args)? else {
            return Err(ExcType::type_error(format!(
                "'{}' object does not support the context manager protocol",
                manager.type_name()
            )));
        };
        self.value_truthy(&result)
    }

    // --- attribute protocol ---

    /// Full attribute read: the all-access interceptor, default resolution
    /// (instance store, then class members with descriptor and binding
    /// behavior), then the fallback-on-miss hook.
    pub(crate) fn attr_get(&mut self, obj: &Value, name: &str) -> RunResult<Value> {
        match obj {
            Value::Instance(inst) => {
                let class = Rc::clone(inst.class());
                let primary = if let Some(hook) = class.slot(Slot::Getattribute).cloned() {
                    self.invoke_slot(&hook, &[obj.clone(), Value::str(name)], Slot::Getattribute)
                } else {
                    self.default_attr_get(obj, &class, name)
                };
                match primary {
                    Ok(value) => Ok(value),
                    Err(err) if err.is_catchable_as(ExcType::AttributeError) => {
                        match class.slot(Slot::Getattr).cloned() {
                            Some(fallback) => {
                                self.invoke_slot(&fallback, &[obj.clone(), Value::str(name)], Slot::Getattr)
                            }
                            None => Err(err),
                        }
                    }
                    Err(err) => Err(err),
                }
            }
            Value::Class(class) => self.class_attr_get(&Rc::clone(class), name),
            Value::Module(module) => module
                .get(name)
                .ok_or_else(|| ExcType::attribute_error(format!("module '{}'", module.name()), name)),
            other => Err(ExcType::attribute_error(other.type_name(), name)),
        }
    }

    /// Default resolution for an instance attribute: own store first, then
    /// class members.
    fn default_attr_get(&mut self, obj: &Value, class: &Rc<ClassObject>, name: &str) -> RunResult<Value> {
        let Value::Instance(inst) = obj else {
            return Err(RunError::internal("default attribute resolution on a non-instance"));
        };
        if let Some(value) = inst.get_attr(name) {
            return Ok(value);
        }
        if let Some(member) = class.lookup(name) {
            return self.bind_class_member(obj, class, member);
        }
        Err(ExcType::attribute_error(class.name(), name))
    }

    /// Applies descriptor and binding behavior to a class member accessed
    /// through an instance.
    fn bind_class_member(&mut self, obj: &Value, class: &Rc<ClassObject>, member: Value) -> RunResult<Value> {
        match member {
            Value::Property(property) => {
                let getter = property.getter.clone();
                self.call_value(&getter, std::slice::from_ref(obj))
            }
            Value::ClassMethod(func) => Ok(Value::BoundMethod(Rc::new(BoundMethod {
                receiver: Value::Class(Rc::clone(class)),
                func: (*func).clone(),
            }))),
            Value::StaticMethod(func) => Ok((*func).clone()),
            Value::Function(_) | Value::HostFunction(_) => Ok(Value::BoundMethod(Rc::new(BoundMethod {
                receiver: obj.clone(),
                func: member,
            }))),
            Value::Instance(ref descriptor) if descriptor.class().slot(Slot::Get).is_some() => {
                let result = self.call_slot(&member, Slot::Get, &[obj.clone(), Value::Class(Rc::clone(class))])?;
                result.ok_or_else(|| RunError::internal("descriptor lost its get slot"))
            }
            other => Ok(other),
        }
    }

    /// Attribute read on a class object itself. A get-slot descriptor is
    /// invoked with no instance (`None`) and the owning class.
    fn class_attr_get(&mut self, class: &Rc<ClassObject>, name: &str) -> RunResult<Value> {
        match class.lookup(name) {
            Some(Value::ClassMethod(func)) => Ok(Value::BoundMethod(Rc::new(BoundMethod {
                receiver: Value::Class(Rc::clone(class)),
                func: (*func).clone(),
            }))),
            Some(Value::StaticMethod(func)) => Ok((*func).clone()),
            Some(descriptor @ Value::Instance(_))
                if matches!(&descriptor, Value::Instance(d) if d.class().slot(Slot::Get).is_some()) =>
            {
                let result =
                    self.call_slot(&descriptor, Slot::Get, &[Value::None, Value::Class(Rc::clone(class))])?;
                result.ok_or_else(|| RunError::internal("descriptor lost its get slot"))
            }
            Some(other) => Ok(other),
            None => Err(ExcType::attribute_error(class.name(), name)),
        }
    }

    /// Full attribute write: the assignment interceptor, property setters
    /// and data descriptors, then the instance store.
    pub(crate) fn attr_set(&mut self, obj: &Value, name: &str, value: Value) -> RunResult<()> {
        match obj {
            Value::Instance(inst) => {
                let class = Rc::clone(inst.class());
                if let Some(hook) = class.slot(Slot::Setattr).cloned() {
                    self.invoke_slot(&hook, &[obj.clone(), Value::str(name), value], Slot::Setattr)?;
                    return Ok(());
                }
                match class.lookup(name) {
                    Some(Value::Property(property)) => match property.setter.clone() {
                        Some(setter) => {
                            self.call_value(&setter, &[obj.clone(), value])?;
                            Ok(())
                        }
                        None => Err(ExcType::attribute_error(class.name(), name)),
                    },
                    Some(descriptor @ Value::Instance(_))
                        if matches!(&descriptor, Value::Instance(d) if d.class().slot(Slot::Set).is_some()) =>
                    {
                        self.call_slot(&descriptor, Slot::Set, &[obj.clone(), value])?;
                        Ok(())
                    }
                    _ => inst.set_attr(name, value),
                }
            }
            Value::Module(module) => {
                module.set(name, value);
                Ok(())
            }
            other => Err(ExcType::type_error(format!(
                "cannot set attributes of '{}'",
                other.type_name()
            ))),
        }
    }

    /// Full attribute deletion: the deletion interceptor, descriptor delete
    /// slots, then the instance store.
    pub(crate) fn attr_del(&mut self, obj: &Value, name: &str) -> RunResult<()> {
        match obj {
            Value::Instance(inst) => {
                let class = Rc::clone(inst.class());
                if let Some(hook) = class.slot(Slot::Delattr).cloned() {
                    self.invoke_slot(&hook, &[obj.clone(), Value::str(name)], Slot::Delattr)?;
                    return Ok(());
                }
                if let Some(descriptor @ Value::Instance(_)) = class.lookup(name) {
                    if matches!(&descriptor, Value::Instance(d) if d.class().slot(Slot::Delete).is_some()) {
                        self.call_slot(&descriptor, Slot::Delete, std::slice::from_ref(obj))?;
                        return Ok(());
                    }
                }
                inst.del_attr(name)
            }
            other => Err(ExcType::type_error(format!(
                "cannot delete attributes of '{}'",
                other.type_name()
            ))),
        }
    }

    // --- items ---

    /// Subscript read over native containers or the `__getitem__` slot.
    pub(crate) fn item_get(&mut self, obj: &Value, key: &Value) -> RunResult<Value> {
        match obj {
            Value::List(items) => {
                let items = items.borrow();
                let idx = sequence_index(key, items.len(), "list")?;
                Ok(items[idx].clone())
            }
            Value::Tuple(items) => {
                let idx = sequence_index(key, items.len(), "tuple")?;
                Ok(items[idx].clone())
            }
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                let idx = sequence_index(key, chars.len(), "string")?;
                Ok(Value::str(chars[idx].to_string()))
            }
            Value::Bytes(bytes) => {
                let idx = sequence_index(key, bytes.len(), "bytes")?;
                Ok(Value::Int(i64::from(bytes[idx])))
            }
            Value::Dict(map) => {
                let key = dict_key(key)?;
                map.borrow()
                    .get(&*key)
                    .cloned()
                    .ok_or_else(|| ExcType::key_error(format!("'{key}'")))
            }
            Value::Instance(_) => {
                let result = self.call_slot(obj, Slot::Getitem, std::slice::from_ref(key))?;
                result.ok_or_else(|| {
                    ExcType::type_error(format!("'{}' object is not subscriptable", obj.type_name()))
                })
            }
            other => Err(ExcType::type_error(format!(
                "'{}' object is not subscriptable",
                other.type_name()
            ))),
        }
    }

    /// Subscript write, with collection-growth governance on dict inserts.
    pub(crate) fn item_set(&mut self, obj: &Value, key: &Value, value: Value) -> RunResult<()> {
        match obj {
            Value::List(items) => {
                let mut items = items.borrow_mut();
                let idx = sequence_index(key, items.len(), "list")?;
                items[idx] = value;
                Ok(())
            }
            Value::Dict(map) => {
                let key = dict_key(key)?;
                let mut map = map.borrow_mut();
                if !map.contains_key(&*key) {
                    self.tracker.on_container_grow(map.len() + 1)?;
                }
                map.insert(key.to_string(), value);
                Ok(())
            }
            Value::Instance(_) => {
                let result = self.call_slot(obj, Slot::Setitem, &[key.clone(), value])?;
                if result.is_none() {
                    return Err(ExcType::type_error(format!(
                        "'{}' object does not support item assignment",
                        obj.type_name()
                    )));
                }
                Ok(())
            }
            other => Err(ExcType::type_error(format!(
                "'{}' object does not support item assignment",
                other.type_name()
            ))),
        }
    }

    /// Subscript deletion.
    pub(crate) fn item_del(&mut self, obj: &Value, key: &Value) -> RunResult<()> {
        match obj {
            Value::List(items) => {
                let mut items = items.borrow_mut();
                let idx = sequence_index(key, items.len(), "list")?;
                items.remove(idx);
                Ok(())
            }
            Value::Dict(map) => {
                let key = dict_key(key)?;
                if map.borrow_mut().shift_remove(&*key).is_none() {
                    return Err(ExcType::key_error(format!("'{key}'")));
                }
                Ok(())
            }
            Value::Instance(_) => {
                let result = self.call_slot(obj, Slot::Delitem, std::slice::from_ref(key))?;
                if result.is_none() {
                    return Err(ExcType::type_error(format!(
                        "'{}' object does not support item deletion",
                        obj.type_name()
                    )));
                }
                Ok(())
            }
            other => Err(ExcType::type_error(format!(
                "'{}' object does not support item deletion",
                other.type_name()
            ))),
        }
    }

    /// Classification check against a class, exception class, or tuple of
    /// either.
    pub(crate) fn isinstance(&mut self, value: &Value, class: &Value) -> RunResult<bool> {
        match class {
            Value::Class(class) => {
                if Rc::ptr_eq(class, self.root_class) {
                    return Ok(true);
                }
                match value {
                    Value::Instance(inst) => Ok(inst.class().is_subclass_of(class)),
                    _ => Ok(false),
                }
            }
            Value::ExcClass(exc_type) => match value {
                Value::ExcInstance(exc) => Ok(exc.exc_type().is_subclass_of(*exc_type)),
                _ => Ok(false),
            },
            Value::Tuple(classes) => {
                for candidate in classes.iter() {
                    if self.isinstance(value, candidate)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            other => Err(ExcType::type_error(format!(
                "isinstance() arg 2 must be a class or tuple of classes, not '{}'",
                other.type_name()
            ))),
        }
    }
}

/// Normalizes a sequence index (negative indices count from the end).
fn sequence_index(key: &Value, len: usize, type_name: &str) -> RunResult<usize> {
    let Some(raw) = key.as_i64() else {
        return Err(ExcType::type_error(format!(
            "{type_name} indices must be integers, not '{}'",
            key.type_name()
        )));
    };
    let idx = if raw < 0 {
        raw + i64::try_from(len).unwrap_or(i64::MAX)
    } else {
        raw
    };
    usize::try_from(idx)
        .ok()
        .filter(|i| *i < len)
        .ok_or_else(|| ExcType::index_error(type_name))
}

/// Dict keys are strings; anything else is a type error.
fn dict_key(key: &Value) -> RunResult<Rc<str>> {
    match key {
        Value::Str(s) => Ok(Rc::clone(s)),
        other => Err(ExcType::type_error(format!(
            "dict keys must be strings, not '{}'",
            other.type_name()
        ))),
    }
}
