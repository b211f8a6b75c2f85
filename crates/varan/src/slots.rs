//! The fixed catalogue of protocol ("dunder") operations.
//!
//! Every specially-named operation a class may override is one variant of
//! [`Slot`]. Classes carry a dense table indexed by `Slot as usize`, resolved
//! once at build time, so hot-path dispatch never hashes method-name strings.
//!
//! Arity is per-slot metadata: the adapter layer in `class`/`dispatch` uses it
//! to reject calls with the wrong operand count before invoking the
//! implementation (a missing second argument to a binary slot is a hard
//! `TypeError`, not a default value).

use strum::{EnumCount, EnumIter, EnumString, IntoStaticStr};

/// Argument shape of a protocol slot, excluding the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotArity {
    /// Receiver only (`__repr__`, `__iter__`, ...).
    Unary,
    /// Receiver plus one operand (`__add__`, `__getitem__`, ...).
    Binary,
    /// Receiver plus two operands (`__setitem__`, `__get__`, ...).
    Ternary,
    /// Receiver plus exactly three operands (`__exit__`).
    Quaternary,
    /// Receiver plus any number of operands (`__call__`, `__init__`, ...).
    Variadic,
}

/// One named protocol operation.
///
/// The strum serialization carries the conventional method name, so
/// `Slot::Add.into(): &str == "__add__"` and `"__add__".parse()` round-trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumCount, EnumIter, EnumString, IntoStaticStr)]
pub enum Slot {
    // --- conversion & representation ---
    #[strum(serialize = "__repr__")]
    Repr,
    #[strum(serialize = "__str__")]
    Str,
    #[strum(serialize = "__bool__")]
    Bool,
    #[strum(serialize = "__hash__")]
    Hash,
    #[strum(serialize = "__int__")]
    Int,
    #[strum(serialize = "__float__")]
    Float,
    #[strum(serialize = "__index__")]
    Index,

    // --- comparison ---
    #[strum(serialize = "__lt__")]
    Lt,
    #[strum(serialize = "__le__")]
    Le,
    #[strum(serialize = "__gt__")]
    Gt,
    #[strum(serialize = "__ge__")]
    Ge,
    #[strum(serialize = "__eq__")]
    Eq,
    #[strum(serialize = "__ne__")]
    Ne,

    // --- binary arithmetic & bitwise, forward ---
    #[strum(serialize = "__add__")]
    Add,
    #[strum(serialize = "__sub__")]
    Sub,
    #[strum(serialize = "__mul__")]
    Mul,
    #[strum(serialize = "__truediv__")]
    Truediv,
    #[strum(serialize = "__floordiv__")]
    Floordiv,
    #[strum(serialize = "__mod__")]
    Mod,
    #[strum(serialize = "__pow__")]
    Pow,
    #[strum(serialize = "__matmul__")]
    Matmul,
    #[strum(serialize = "__and__")]
    And,
    #[strum(serialize = "__or__")]
    Or,
    #[strum(serialize = "__xor__")]
    Xor,
    #[strum(serialize = "__lshift__")]
    Lshift,
    #[strum(serialize = "__rshift__")]
    Rshift,

    // --- binary, reflected ---
    #[strum(serialize = "__radd__")]
    Radd,
    #[strum(serialize = "__rsub__")]
    Rsub,
    #[strum(serialize = "__rmul__")]
    Rmul,
    #[strum(serialize = "__rtruediv__")]
    Rtruediv,
    #[strum(serialize = "__rfloordiv__")]
    Rfloordiv,
    #[strum(serialize = "__rmod__")]
    Rmod,
    #[strum(serialize = "__rpow__")]
    Rpow,
    #[strum(serialize = "__rmatmul__")]
    Rmatmul,
    #[strum(serialize = "__rand__")]
    Rand,
    #[strum(serialize = "__ror__")]
    Ror,
    #[strum(serialize = "__rxor__")]
    Rxor,
    #[strum(serialize = "__rlshift__")]
    Rlshift,
    #[strum(serialize = "__rrshift__")]
    Rrshift,

    // --- binary, in-place ---
    #[strum(serialize = "__iadd__")]
    Iadd,
    #[strum(serialize = "__isub__")]
    Isub,
    #[strum(serialize = "__imul__")]
    Imul,
    #[strum(serialize = "__itruediv__")]
    Itruediv,
    #[strum(serialize = "__ifloordiv__")]
    Ifloordiv,
    #[strum(serialize = "__imod__")]
    Imod,
    #[strum(serialize = "__ipow__")]
    Ipow,
    #[strum(serialize = "__imatmul__")]
    Imatmul,
    #[strum(serialize = "__iand__")]
    Iand,
    #[strum(serialize = "__ior__")]
    Ior,
    #[strum(serialize = "__ixor__")]
    Ixor,
    #[strum(serialize = "__ilshift__")]
    Ilshift,
    #[strum(serialize = "__irshift__")]
    Irshift,

    // --- unary arithmetic ---
    #[strum(serialize = "__neg__")]
    Neg,
    #[strum(serialize = "__pos__")]
    Pos,
    #[strum(serialize = "__invert__")]
    Invert,
    #[strum(serialize = "__abs__")]
    Abs,

    // --- container ---
    #[strum(serialize = "__len__")]
    Len,
    #[strum(serialize = "__getitem__")]
    Getitem,
    #[strum(serialize = "__setitem__")]
    Setitem,
    #[strum(serialize = "__delitem__")]
    Delitem,
    #[strum(serialize = "__contains__")]
    Contains,

    // --- iteration ---
    #[strum(serialize = "__iter__")]
    Iter,
    #[strum(serialize = "__next__")]
    Next,

    // --- context manager ---
    #[strum(serialize = "__enter__")]
    Enter,
    #[strum(serialize = "__exit__")]
    Exit,

    // --- descriptor ---
    #[strum(serialize = "__get__")]
    Get,
    #[strum(serialize = "__set__")]
    Set,
    #[strum(serialize = "__delete__")]
    Delete,

    // --- attribute interception ---
    #[strum(serialize = "__getattribute__")]
    Getattribute,
    #[strum(serialize = "__getattr__")]
    Getattr,
    #[strum(serialize = "__setattr__")]
    Setattr,
    #[strum(serialize = "__delattr__")]
    Delattr,

    // --- call & lifecycle ---
    #[strum(serialize = "__call__")]
    Call,
    #[strum(serialize = "__new__")]
    New,
    #[strum(serialize = "__init__")]
    Init,
    #[strum(serialize = "__del__")]
    Del,
}

impl Slot {
    /// Returns the conventional method name (e.g. `"__add__"`).
    #[must_use]
    pub fn method_name(self) -> &'static str {
        self.into()
    }

    /// Parses a conventional method name into a slot, if it names one.
    #[must_use]
    pub fn from_method_name(name: &str) -> Option<Self> {
        name.parse().ok()
    }

    /// Index into a class's dense slot table.
    #[must_use]
    pub(crate) fn index(self) -> usize {
        self as usize
    }

    /// The argument shape of this slot, excluding the receiver.
    #[must_use]
    pub fn arity(self) -> SlotArity {
        match self {
            Self::Repr
            | Self::Str
            | Self::Bool
            | Self::Hash
            | Self::Int
            | Self::Float
            | Self::Index
            | Self::Neg
            | Self::Pos
            | Self::Invert
            | Self::Abs
            | Self::Len
            | Self::Iter
            | Self::Next
            | Self::Enter
            | Self::Del => SlotArity::Unary,

            Self::Lt
            | Self::Le
            | Self::Gt
            | Self::Ge
            | Self::Eq
            | Self::Ne
            | Self::Add
            | Self::Sub
            | Self::Mul
            | Self::Truediv
            | Self::Floordiv
            | Self::Mod
            | Self::Pow
            | Self::Matmul
            | Self::And
            | Self::Or
            | Self::Xor
            | Self::Lshift
            | Self::Rshift
            | Self::Radd
            | Self::Rsub
            | Self::Rmul
            | Self::Rtruediv
            | Self::Rfloordiv
            | Self::Rmod
            | Self::Rpow
            | Self::Rmatmul
            | Self::Rand
            | Self::Ror
            | Self::Rxor
            | Self::Rlshift
            | Self::Rrshift
            | Self::Iadd
            | Self::Isub
            | Self::Imul
            | Self::Itruediv
            | Self::Ifloordiv
            | Self::Imod
            | Self::Ipow
            | Self::Imatmul
            | Self::Iand
            | Self::Ior
            | Self::Ixor
            | Self::Ilshift
            | Self::Irshift
            | Self::Getitem
            | Self::Delitem
            | Self::Contains
            | Self::Getattribute
            | Self::Getattr
            | Self::Delattr
            | Self::Delete => SlotArity::Binary,

            Self::Setitem | Self::Setattr | Self::Get | Self::Set => SlotArity::Ternary,

            Self::Exit => SlotArity::Quaternary,

            Self::Call | Self::New | Self::Init => SlotArity::Variadic,
        }
    }

    /// Number of operands a fixed-arity slot requires, if fixed.
    #[must_use]
    pub fn required_operands(self) -> Option<usize> {
        match self.arity() {
            SlotArity::Unary => Some(0),
            SlotArity::Binary => Some(1),
            SlotArity::Ternary => Some(2),
            SlotArity::Quaternary => Some(3),
            SlotArity::Variadic => None,
        }
    }
}

/// Binary operators the VM dispatches through the slot machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    MatMul,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

impl BinaryOp {
    /// Source-level symbol for error messages.
    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::FloorDiv => "//",
            Self::Mod => "%",
            Self::Pow => "**",
            Self::MatMul => "@",
            Self::BitAnd => "&",
            Self::BitOr => "|",
            Self::BitXor => "^",
            Self::Shl => "<<",
            Self::Shr => ">>",
        }
    }

    /// The (forward, reflected, in-place) slot triple for this operator.
    #[must_use]
    pub fn slots(self) -> (Slot, Slot, Slot) {
        match self {
            Self::Add => (Slot::Add, Slot::Radd, Slot::Iadd),
            Self::Sub => (Slot::Sub, Slot::Rsub, Slot::Isub),
            Self::Mul => (Slot::Mul, Slot::Rmul, Slot::Imul),
            Self::Div => (Slot::Truediv, Slot::Rtruediv, Slot::Itruediv),
            Self::FloorDiv => (Slot::Floordiv, Slot::Rfloordiv, Slot::Ifloordiv),
            Self::Mod => (Slot::Mod, Slot::Rmod, Slot::Imod),
            Self::Pow => (Slot::Pow, Slot::Rpow, Slot::Ipow),
            Self::MatMul => (Slot::Matmul, Slot::Rmatmul, Slot::Imatmul),
            Self::BitAnd => (Slot::And, Slot::Rand, Slot::Iand),
            Self::BitOr => (Slot::Or, Slot::Ror, Slot::Ior),
            Self::BitXor => (Slot::Xor, Slot::Rxor, Slot::Ixor),
            Self::Shl => (Slot::Lshift, Slot::Rlshift, Slot::Ilshift),
            Self::Shr => (Slot::Rshift, Slot::Rrshift, Slot::Irshift),
        }
    }
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CompareOp {
    /// Source-level symbol for error messages.
    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
        }
    }

    /// The slot a receiver must implement for this comparison.
    #[must_use]
    pub fn slot(self) -> Slot {
        match self {
            Self::Lt => Slot::Lt,
            Self::Le => Slot::Le,
            Self::Gt => Slot::Gt,
            Self::Ge => Slot::Ge,
            Self::Eq => Slot::Eq,
            Self::Ne => Slot::Ne,
        }
    }

    /// Whether this is an equality comparison (identity fallback applies).
    #[must_use]
    pub fn is_equality(self) -> bool {
        matches!(self, Self::Eq | Self::Ne)
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Invert,
    Not,
}

impl UnaryOp {
    /// Source-level symbol for error messages.
    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Neg => "-",
            Self::Pos => "+",
            Self::Invert => "~",
            Self::Not => "not",
        }
    }

    /// The slot for this operator, if it dispatches through one
    /// (`not` is purely truthiness-based).
    #[must_use]
    pub fn slot(self) -> Option<Slot> {
        match self {
            Self::Neg => Some(Slot::Neg),
            Self::Pos => Some(Slot::Pos),
            Self::Invert => Some(Slot::Invert),
            Self::Not => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use strum::{EnumCount, IntoEnumIterator};

    use super::*;

    #[test]
    fn method_names_round_trip() {
        for slot in Slot::iter() {
            let name = slot.method_name();
            assert!(name.starts_with("__") && name.ends_with("__"));
            assert_eq!(Slot::from_method_name(name), Some(slot));
        }
        assert_eq!(Slot::from_method_name("__add__"), Some(Slot::Add));
        assert_eq!(Slot::from_method_name("not_a_slot"), None);
    }

    #[test]
    fn catalogue_is_dense() {
        for (i, slot) in Slot::iter().enumerate() {
            assert_eq!(slot.index(), i);
        }
        assert!(Slot::COUNT >= 60);
    }

    #[test]
    fn operator_slot_triples() {
        let (fwd, refl, inpl) = BinaryOp::Add.slots();
        assert_eq!(fwd, Slot::Add);
        assert_eq!(refl, Slot::Radd);
        assert_eq!(inpl, Slot::Iadd);
        assert_eq!(BinaryOp::Shl.slots().1, Slot::Rlshift);
    }
}
