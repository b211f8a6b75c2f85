//! Primary value type representing guest objects at runtime.
//!
//! `Value` is a closed sum over every first-class runtime value. Scalars are
//! stored inline; compound values share ownership through `Rc`, which gives
//! the spec's "lifetime = longest holder" semantics without an arena. All
//! operations here are *native*: they cover the built-in kinds only and
//! return `Ok(None)` when an operand needs protocol dispatch, mirroring how
//! the fast paths hand off to dunder lookup.

use std::{
    any::Any,
    cell::RefCell,
    fmt::{self, Write},
    hash::{Hash, Hasher},
    rc::Rc,
};

use indexmap::IndexMap;

use crate::{
    bytecode::Code,
    class::{ClassObject, Instance},
    exception::{ExcType, RunResult, VmException},
    module::ModuleObject,
    slots::BinaryOp,
    vm::VmContext,
};

/// Insertion-ordered string-keyed map used for dicts, namespaces, and class
/// attribute tables.
pub(crate) type Map = IndexMap<String, Value, ahash::RandomState>;

/// A shared, mutable namespace (module globals, module dicts).
pub(crate) type Namespace = Rc<RefCell<Map>>;

/// Host-callable signature: receives a callback context and the argument
/// list, returns zero-or-one value (`Value::None` for zero).
pub type HostFnImpl = Box<dyn Fn(&mut dyn VmContext, &[Value]) -> RunResult<Value>>;

/// A host-registered function visible to guest code as an ordinary callable.
pub struct HostFunction {
    name: String,
    f: HostFnImpl,
}

impl HostFunction {
    /// Wraps a host closure under the given name.
    pub fn new(name: impl Into<String>, f: impl Fn(&mut dyn VmContext, &[Value]) -> RunResult<Value> + 'static) -> Self {
        Self {
            name: name.into(),
            f: Box::new(f),
        }
    }

    /// Returns the registered name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invokes the host closure.
    pub(crate) fn call(&self, ctx: &mut dyn VmContext, args: &[Value]) -> RunResult<Value> {
        (self.f)(ctx, args)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction").field("name", &self.name).finish()
    }
}

/// A guest function: compiled code plus the globals of its defining module.
#[derive(Debug)]
pub struct FunctionObject {
    pub(crate) name: Rc<str>,
    pub(crate) code: Rc<Code>,
    pub(crate) globals: Namespace,
}

/// A method bound to its receiver; calling it prepends the receiver.
#[derive(Debug)]
pub struct BoundMethod {
    pub(crate) receiver: Value,
    pub(crate) func: Value,
}

/// A property descriptor installed on a class: computed attribute with an
/// optional setter.
#[derive(Debug)]
pub struct PropertyDescriptor {
    pub(crate) getter: Value,
    pub(crate) setter: Option<Value>,
}

/// Opaque host-provided data carried through the guest untouched.
pub struct OpaqueData {
    name: String,
    data: Box<dyn Any>,
}

impl OpaqueData {
    /// Wraps arbitrary host data under a diagnostic name.
    #[must_use]
    pub fn new(name: impl Into<String>, data: impl Any) -> Self {
        Self {
            name: name.into(),
            data: Box::new(data),
        }
    }

    /// Returns the diagnostic name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Downcasts the payload.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.data.downcast_ref()
    }
}

impl fmt::Debug for OpaqueData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpaqueData").field("name", &self.name).finish()
    }
}

/// Opaque handle to a live native iteration. Produced by the iteration
/// protocol, advanced by `ForIter` and the `next` builtin; the host cannot
/// inspect or construct one.
#[derive(Debug, Clone)]
pub struct IterState(pub(crate) Rc<RefCell<NativeIter>>);

/// State of a live iteration, driven by `ForIter`.
#[derive(Debug)]
pub(crate) enum NativeIter {
    /// Index-based iteration over a shared list.
    List(Rc<RefCell<Vec<Value>>>, usize),
    /// Index-based iteration over a tuple.
    Tuple(Rc<[Value]>, usize),
    /// Character iteration over a string (byte offset).
    Chars(Rc<str>, usize),
    /// Byte iteration, yielding ints.
    Bytes(Rc<[u8]>, usize),
    /// Snapshot of dict keys at iteration start.
    Keys(Vec<String>, usize),
}

/// Primary value type.
///
/// `NotImplemented` is the reserved sentinel a binary slot returns to signal
/// "operand not supported"; the engine then tries the reflected slot. It is
/// never exposed to the host.
#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Complex { re: f64, im: f64 },
    Str(Rc<str>),
    Bytes(Rc<[u8]>),
    List(Rc<RefCell<Vec<Value>>>),
    Tuple(Rc<[Value]>),
    Dict(Rc<RefCell<Map>>),
    Class(Rc<ClassObject>),
    Instance(Rc<Instance>),
    Function(Rc<FunctionObject>),
    HostFunction(Rc<HostFunction>),
    BoundMethod(Rc<BoundMethod>),
    Property(Rc<PropertyDescriptor>),
    ClassMethod(Rc<Value>),
    StaticMethod(Rc<Value>),
    Module(Rc<ModuleObject>),
    ExcClass(ExcType),
    ExcInstance(Rc<VmException>),
    Iterator(IterState),
    Opaque(Rc<OpaqueData>),
    NotImplemented,
}

impl Value {
    /// Builds a string value.
    #[must_use]
    pub fn str(s: impl AsRef<str>) -> Self {
        Self::Str(Rc::from(s.as_ref()))
    }

    /// Builds a list value.
    #[must_use]
    pub fn list(items: Vec<Self>) -> Self {
        Self::List(Rc::new(RefCell::new(items)))
    }

    /// Builds a tuple value.
    #[must_use]
    pub fn tuple(items: Vec<Self>) -> Self {
        Self::Tuple(Rc::from(items))
    }

    /// The type name used in diagnostics (class name for instances).
    #[must_use]
    pub fn type_name(&self) -> String {
        match self {
            Self::None => "NoneType".to_string(),
            Self::Bool(_) => "bool".to_string(),
            Self::Int(_) => "int".to_string(),
            Self::Float(_) => "float".to_string(),
            Self::Complex { .. } => "complex".to_string(),
            Self::Str(_) => "str".to_string(),
            Self::Bytes(_) => "bytes".to_string(),
            Self::List(_) => "list".to_string(),
            Self::Tuple(_) => "tuple".to_string(),
            Self::Dict(_) => "dict".to_string(),
            Self::Class(_) | Self::ExcClass(_) => "type".to_string(),
            Self::Instance(inst) => inst.class().name().to_string(),
            Self::Function(_) | Self::HostFunction(_) => "function".to_string(),
            Self::BoundMethod(_) => "method".to_string(),
            Self::Property(_) => "property".to_string(),
            Self::ClassMethod(_) => "classmethod".to_string(),
            Self::StaticMethod(_) => "staticmethod".to_string(),
            Self::Module(_) => "module".to_string(),
            Self::ExcInstance(exc) => exc.exc_type().to_string(),
            Self::Iterator(_) => "iterator".to_string(),
            Self::Opaque(data) => data.name().to_string(),
            Self::NotImplemented => "NotImplementedType".to_string(),
        }
    }

    /// Identity comparison: pointer equality for shared kinds, value
    /// equality for immediates.
    #[must_use]
    pub fn is_identical(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) | (Self::NotImplemented, Self::NotImplemented) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => Rc::ptr_eq(a, b),
            (Self::Bytes(a), Self::Bytes(b)) => Rc::ptr_eq(a, b),
            (Self::List(a), Self::List(b)) => Rc::ptr_eq(a, b),
            (Self::Tuple(a), Self::Tuple(b)) => Rc::ptr_eq(a, b),
            (Self::Dict(a), Self::Dict(b)) => Rc::ptr_eq(a, b),
            (Self::Class(a), Self::Class(b)) => Rc::ptr_eq(a, b),
            (Self::Instance(a), Self::Instance(b)) => Rc::ptr_eq(a, b),
            (Self::Function(a), Self::Function(b)) => Rc::ptr_eq(a, b),
            (Self::HostFunction(a), Self::HostFunction(b)) => Rc::ptr_eq(a, b),
            (Self::Module(a), Self::Module(b)) => Rc::ptr_eq(a, b),
            (Self::ExcClass(a), Self::ExcClass(b)) => a == b,
            (Self::ExcInstance(a), Self::ExcInstance(b)) => Rc::ptr_eq(a, b),
            (Self::Opaque(a), Self::Opaque(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Native truthiness, or `None` when the value needs `__bool__`/`__len__`
    /// dispatch (instances).
    #[must_use]
    pub(crate) fn native_truthy(&self) -> Option<bool> {
        match self {
            Self::None => Some(false),
            Self::Bool(b) => Some(*b),
            Self::Int(n) => Some(*n != 0),
            Self::Float(x) => Some(*x != 0.0),
            Self::Complex { re, im } => Some(*re != 0.0 || *im != 0.0),
            Self::Str(s) => Some(!s.is_empty()),
            Self::Bytes(b) => Some(!b.is_empty()),
            Self::List(items) => Some(!items.borrow().is_empty()),
            Self::Tuple(items) => Some(!items.is_empty()),
            Self::Dict(map) => Some(!map.borrow().is_empty()),
            Self::Instance(_) => None,
            _ => Some(true),
        }
    }

    /// Approximate heap footprint in bytes, for allocation accounting.
    ///
    /// Shallow for containers of shared values: the elements were accounted
    /// when they were allocated.
    #[must_use]
    pub(crate) fn estimate_size(&self) -> usize {
        const WORD: usize = std::mem::size_of::<usize>();
        match self {
            Self::Str(s) => s.len() + 2 * WORD,
            Self::Bytes(b) => b.len() + 2 * WORD,
            Self::List(items) => items.borrow().len() * std::mem::size_of::<Self>() + 3 * WORD,
            Self::Tuple(items) => items.len() * std::mem::size_of::<Self>() + 2 * WORD,
            Self::Dict(map) => map.borrow().len() * (std::mem::size_of::<Self>() + 4 * WORD) + 3 * WORD,
            Self::Instance(_) => 8 * WORD,
            _ => std::mem::size_of::<Self>(),
        }
    }

    /// Native length, or `None` when the value has no length or needs
    /// `__len__` dispatch.
    #[must_use]
    pub(crate) fn native_len(&self) -> Option<usize> {
        match self {
            Self::Str(s) => Some(s.chars().count()),
            Self::Bytes(b) => Some(b.len()),
            Self::List(items) => Some(items.borrow().len()),
            Self::Tuple(items) => Some(items.len()),
            Self::Dict(map) => Some(map.borrow().len()),
            _ => None,
        }
    }

    /// Structural equality over native kinds, with numeric coercion.
    /// Instances at any depth compare by identity here; top-level instance
    /// equality goes through slot dispatch before falling back to this.
    #[must_use]
    pub(crate) fn native_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Bool(_) | Self::Int(_) | Self::Float(_), Self::Bool(_) | Self::Int(_) | Self::Float(_)) => {
                match (self.as_f64(), other.as_f64()) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                }
            }
            (Self::Complex { re: r1, im: i1 }, Self::Complex { re: r2, im: i2 }) => r1 == r2 && i1 == i2,
            (Self::Complex { re, im }, other_scalar) | (other_scalar, Self::Complex { re, im }) => {
                other_scalar.as_f64().is_some_and(|x| *re == x && *im == 0.0)
            }
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::List(a), Self::List(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.native_eq(y))
            }
            (Self::Tuple(a), Self::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.native_eq(y))
            }
            (Self::Dict(a), Self::Dict(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().all(|(k, v)| b.get(k).is_some_and(|w| v.native_eq(w)))
            }
            _ => self.is_identical(other),
        }
    }

    /// Numeric coercion to f64 for Bool/Int/Float.
    #[must_use]
    pub(crate) fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Bool(b) => Some(f64::from(i32::from(*b))),
            Self::Int(n) => Some(*n as f64),
            Self::Float(x) => Some(*x),
            _ => None,
        }
    }

    /// Numeric coercion to i64 for Bool/Int.
    #[must_use]
    pub(crate) fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Bool(b) => Some(i64::from(*b)),
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Hash over immutable native kinds, or `None` for unhashable/dispatched
    /// values. Equal numerics hash equally (1 == 1.0 == True).
    #[must_use]
    pub(crate) fn native_hash(&self) -> Option<u64> {
        fn hash_of(value: &Value, state: &mut ahash::AHasher) -> Option<()> {
            match value {
                Value::None => 0u8.hash(state),
                Value::Bool(_) | Value::Int(_) | Value::Float(_) => {
                    let x = value.as_f64()?;
                    if x.fract() == 0.0 && x.abs() < 1e18 {
                        (x as i64).hash(state);
                    } else {
                        x.to_bits().hash(state);
                    }
                }
                Value::Str(s) => s.hash(state),
                Value::Bytes(b) => b.hash(state),
                Value::Tuple(items) => {
                    items.len().hash(state);
                    for item in items.iter() {
                        hash_of(item, state)?;
                    }
                }
                _ => return None,
            }
            Some(())
        }
        let mut state = ahash::AHasher::default();
        hash_of(self, &mut state)?;
        Some(state.finish())
    }

    /// Native binary arithmetic/bitwise operation.
    ///
    /// Returns `Ok(None)` when the operand pair is not supported natively and
    /// should go to slot dispatch.
    pub(crate) fn native_binary(&self, op: BinaryOp, rhs: &Self) -> RunResult<Option<Self>> {
        use BinaryOp as B;
        // Int/Bool pairs stay in integer arithmetic.
        if let (Some(a), Some(b)) = (self.as_i64(), rhs.as_i64()) {
            return int_binary(op, a, b).map(Some);
        }
        // Mixed numeric pairs promote to float.
        if let (Some(a), Some(b)) = (self.as_f64(), rhs.as_f64()) {
            return float_binary(op, a, b).map(Some);
        }
        // Complex arithmetic (either side complex, other side numeric).
        if let Some(result) = complex_binary(op, self, rhs)? {
            return Ok(Some(result));
        }
        match (op, self, rhs) {
            (B::Add, Self::Str(a), Self::Str(b)) => {
                let mut s = String::with_capacity(a.len() + b.len());
                s.push_str(a);
                s.push_str(b);
                Ok(Some(Self::str(s)))
            }
            (B::Add, Self::Bytes(a), Self::Bytes(b)) => {
                let mut v = Vec::with_capacity(a.len() + b.len());
                v.extend_from_slice(a);
                v.extend_from_slice(b);
                Ok(Some(Self::Bytes(Rc::from(v))))
            }
            (B::Add, Self::List(a), Self::List(b)) => {
                let mut v = a.borrow().clone();
                v.extend(b.borrow().iter().cloned());
                Ok(Some(Self::list(v)))
            }
            (B::Add, Self::Tuple(a), Self::Tuple(b)) => {
                let mut v = a.to_vec();
                v.extend(b.iter().cloned());
                Ok(Some(Self::tuple(v)))
            }
            (B::Mul, Self::Str(s), n) | (B::Mul, n, Self::Str(s)) if n.as_i64().is_some() => {
                let count = usize::try_from(n.as_i64().unwrap_or(0).max(0)).unwrap_or(0);
                Ok(Some(Self::str(s.repeat(count))))
            }
            (B::Mul, Self::List(items), n) | (B::Mul, n, Self::List(items)) if n.as_i64().is_some() => {
                let count = usize::try_from(n.as_i64().unwrap_or(0).max(0)).unwrap_or(0);
                let items = items.borrow();
                let mut v = Vec::with_capacity(items.len() * count);
                for _ in 0..count {
                    v.extend(items.iter().cloned());
                }
                Ok(Some(Self::list(v)))
            }
            (B::Mod, Self::Str(_), _) => Ok(None),
            _ => Ok(None),
        }
    }

    /// Native unary negation/plus/invert/abs. `Ok(None)` hands off to dispatch.
    pub(crate) fn native_unary(&self, op: crate::slots::UnaryOp) -> RunResult<Option<Self>> {
        use crate::slots::UnaryOp as U;
        let result = match (op, self) {
            (U::Neg, Self::Int(n)) => n
                .checked_neg()
                .map(Self::Int)
                .ok_or_else(|| overflow("integer negation overflows"))?,
            (U::Neg, Self::Bool(b)) => Self::Int(-i64::from(*b)),
            (U::Neg, Self::Float(x)) => Self::Float(-x),
            (U::Neg, Self::Complex { re, im }) => Self::Complex { re: -re, im: -im },
            (U::Pos, Self::Int(_) | Self::Float(_) | Self::Complex { .. }) => self.clone(),
            (U::Pos, Self::Bool(b)) => Self::Int(i64::from(*b)),
            (U::Invert, Self::Int(n)) => Self::Int(!n),
            (U::Invert, Self::Bool(b)) => Self::Int(!i64::from(*b)),
            _ => return Ok(None),
        };
        Ok(Some(result))
    }

    /// Native ordering comparison, or `Ok(None)` for pairs needing dispatch.
    pub(crate) fn native_ordering(&self, other: &Self) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Self::Str(a), Self::Str(b)) => Some(a.cmp(b)),
            (Self::Bytes(a), Self::Bytes(b)) => Some(a.cmp(b)),
            _ => {
                let (a, b) = (self.as_f64()?, other.as_f64()?);
                a.partial_cmp(&b)
            }
        }
    }
}

/// Creates an OverflowError.
fn overflow(msg: &str) -> crate::exception::RunError {
    VmException::new(ExcType::OverflowError, Some(msg.to_string())).into()
}

/// Creates a ZeroDivisionError.
fn zero_division(msg: &str) -> crate::exception::RunError {
    VmException::new(ExcType::ZeroDivisionError, Some(msg.to_string())).into()
}

/// Integer binary operation with checked overflow and floor-division
/// semantics (quotient rounds toward negative infinity, remainder takes the
/// divisor's sign).
fn int_binary(op: BinaryOp, a: i64, b: i64) -> RunResult<Value> {
    use BinaryOp as B;
    let result = match op {
        B::Add => Value::Int(a.checked_add(b).ok_or_else(|| overflow("integer addition overflows"))?),
        B::Sub => Value::Int(
            a.checked_sub(b)
                .ok_or_else(|| overflow("integer subtraction overflows"))?,
        ),
        B::Mul => Value::Int(
            a.checked_mul(b)
                .ok_or_else(|| overflow("integer multiplication overflows"))?,
        ),
        B::Div => {
            if b == 0 {
                return Err(zero_division("division by zero"));
            }
            Value::Float(a as f64 / b as f64)
        }
        B::FloorDiv => {
            if b == 0 {
                return Err(zero_division("integer division or modulo by zero"));
            }
            let mut q = a.checked_div(b).ok_or_else(|| overflow("integer division overflows"))?;
            if (a % b != 0) && ((a < 0) != (b < 0)) {
                q -= 1;
            }
            Value::Int(q)
        }
        B::Mod => {
            if b == 0 {
                return Err(zero_division("integer division or modulo by zero"));
            }
            let r = a % b;
            Value::Int(if r != 0 && ((r < 0) != (b < 0)) { r + b } else { r })
        }
        B::Pow => {
            if b < 0 {
                Value::Float((a as f64).powf(b as f64))
            } else {
                let exp = u32::try_from(b).map_err(|_| overflow("exponent too large"))?;
                Value::Int(a.checked_pow(exp).ok_or_else(|| overflow("integer power overflows"))?)
            }
        }
        B::BitAnd => Value::Int(a & b),
        B::BitOr => Value::Int(a | b),
        B::BitXor => Value::Int(a ^ b),
        B::Shl => {
            if b < 0 {
                return Err(ExcType::value_error("negative shift count"));
            }
            let shift = u32::try_from(b).map_err(|_| overflow("shift count too large"))?;
            Value::Int(a.checked_shl(shift).ok_or_else(|| overflow("left shift overflows"))?)
        }
        B::Shr => {
            if b < 0 {
                return Err(ExcType::value_error("negative shift count"));
            }
            let shift = u32::try_from(b).unwrap_or(63).min(63);
            Value::Int(a >> shift)
        }
        B::MatMul => {
            return Err(ExcType::binary_type_error("@", "int", "int"));
        }
    };
    Ok(result)
}

/// Float binary operation.
fn float_binary(op: BinaryOp, a: f64, b: f64) -> RunResult<Value> {
    use BinaryOp as B;
    let result = match op {
        B::Add => a + b,
        B::Sub => a - b,
        B::Mul => a * b,
        B::Div => {
            if b == 0.0 {
                return Err(zero_division("float division by zero"));
            }
            a / b
        }
        B::FloorDiv => {
            if b == 0.0 {
                return Err(zero_division("float floor division by zero"));
            }
            (a / b).floor()
        }
        B::Mod => {
            if b == 0.0 {
                return Err(zero_division("float modulo"));
            }
            let r = a % b;
            if r != 0.0 && (r < 0.0) != (b < 0.0) { r + b } else { r }
        }
        B::Pow => a.powf(b),
        _ => {
            return Err(ExcType::binary_type_error(op.symbol(), "float", "float"));
        }
    };
    Ok(Value::Float(result))
}

/// Complex binary arithmetic; `Ok(None)` when neither side is complex.
fn complex_binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> RunResult<Option<Value>> {
    use BinaryOp as B;
    let as_complex = |v: &Value| match v {
        Value::Complex { re, im } => Some((*re, *im)),
        _ => v.as_f64().map(|x| (x, 0.0)),
    };
    if !matches!(lhs, Value::Complex { .. }) && !matches!(rhs, Value::Complex { .. }) {
        return Ok(None);
    }
    let (Some((ar, ai)), Some((br, bi))) = (as_complex(lhs), as_complex(rhs)) else {
        return Ok(None);
    };
    let (re, im) = match op {
        B::Add => (ar + br, ai + bi),
        B::Sub => (ar - br, ai - bi),
        B::Mul => (ar * br - ai * bi, ar * bi + ai * br),
        B::Div => {
            let denom = br * br + bi * bi;
            if denom == 0.0 {
                return Err(zero_division("complex division by zero"));
            }
            ((ar * br + ai * bi) / denom, (ai * br - ar * bi) / denom)
        }
        _ => {
            return Err(ExcType::binary_type_error(op.symbol(), lhs.type_name(), rhs.type_name()));
        }
    };
    Ok(Some(Value::Complex { re, im }))
}

/// Formats a float the way the guest language prints it (`1.0`, not `1`).
pub(crate) fn float_repr(x: f64) -> String {
    if x.is_nan() {
        return "nan".to_string();
    }
    if x.is_infinite() {
        return if x > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let mut buf = ryu::Buffer::new();
    buf.format(x).to_string()
}

/// Writes a quoted, escaped string literal.
pub(crate) fn string_repr_fmt(f: &mut impl Write, s: &str) -> fmt::Result {
    f.write_char('\'')?;
    for c in s.chars() {
        match c {
            '\'' => f.write_str("\\'")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\t' => f.write_str("\\t")?,
            '\r' => f.write_str("\\r")?,
            c => f.write_char(c)?,
        }
    }
    f.write_char('\'')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_floor_division_rounds_toward_negative_infinity() {
        let Value::Int(q) = int_binary(BinaryOp::FloorDiv, -7, 2).unwrap() else {
            panic!("expected int")
        };
        assert_eq!(q, -4);
        let Value::Int(r) = int_binary(BinaryOp::Mod, -7, 2).unwrap() else {
            panic!("expected int")
        };
        assert_eq!(r, 1);
    }

    #[test]
    fn int_overflow_is_an_error() {
        let err = int_binary(BinaryOp::Add, i64::MAX, 1).unwrap_err();
        assert_eq!(err.exc_type(), Some(ExcType::OverflowError));
    }

    #[test]
    fn division_by_zero() {
        let err = int_binary(BinaryOp::Div, 1, 0).unwrap_err();
        assert_eq!(err.exc_type(), Some(ExcType::ZeroDivisionError));
    }

    #[test]
    fn numeric_equality_coerces() {
        assert!(Value::Int(1).native_eq(&Value::Float(1.0)));
        assert!(Value::Bool(true).native_eq(&Value::Int(1)));
        assert!(Value::Complex { re: 2.0, im: 0.0 }.native_eq(&Value::Int(2)));
        assert!(!Value::Complex { re: 2.0, im: 1.0 }.native_eq(&Value::Int(2)));
    }

    #[test]
    fn equal_numerics_hash_equal() {
        assert_eq!(Value::Int(1).native_hash(), Value::Float(1.0).native_hash());
        assert_eq!(Value::Bool(true).native_hash(), Value::Int(1).native_hash());
        assert!(Value::list(vec![]).native_hash().is_none());
    }

    #[test]
    fn string_and_list_concat() {
        let v = Value::str("ab").native_binary(BinaryOp::Add, &Value::str("cd")).unwrap();
        assert!(matches!(v, Some(Value::Str(s)) if &*s == "abcd"));
        let v = Value::str("ab").native_binary(BinaryOp::Mul, &Value::Int(3)).unwrap();
        assert!(matches!(v, Some(Value::Str(s)) if &*s == "ababab"));
    }

    #[test]
    fn float_repr_keeps_trailing_zero() {
        assert_eq!(float_repr(1.0), "1.0");
        assert_eq!(float_repr(0.25), "0.25");
    }
}
