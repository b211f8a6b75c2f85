//! Guest-visible error taxonomy and the engine's internal error channel.
//!
//! `ExcType` classifies every failure the engine can raise; `is_subclass_of`
//! drives `except`-style handler matching. `RunError` is the internal error
//! channel of the VM: catchable guest exceptions, uncatchable governance
//! failures (timeout/cancellation), and internal engine bugs are kept apart
//! so that unwinding can treat them differently.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use strum::{Display as StrumDisplay, EnumString, IntoStaticStr};

/// Result type alias for operations that can produce a runtime error.
pub type RunResult<T> = Result<T, RunError>;

/// Exception kinds supported by the runtime.
///
/// Uses strum derives for automatic `Display`, `FromStr`, and `Into<&'static str>`
/// implementations. The string representation matches the variant name exactly
/// (e.g., `ValueError` -> "ValueError").
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, StrumDisplay, EnumString, IntoStaticStr, Serialize, Deserialize,
)]
pub enum ExcType {
    /// Root of the hierarchy - matches every exception in handler checks.
    BaseException,
    /// Base class for all ordinary exceptions.
    Exception,

    /// Wrong operand/argument shape, unsupported operator, missing required slot.
    TypeError,
    /// Well-typed but semantically invalid argument.
    ValueError,

    // --- LookupError hierarchy ---
    /// Intermediate class for container lookup failures.
    LookupError,
    /// Subclass of LookupError: sequence index out of range.
    IndexError,
    /// Subclass of LookupError: mapping key missing.
    KeyError,

    // --- RuntimeError hierarchy ---
    /// Catch-all for engine-detected misuse.
    RuntimeError,
    /// Subclass of RuntimeError.
    NotImplementedError,
    /// Subclass of RuntimeError: call-stack depth ceiling exceeded.
    RecursionError,

    /// Attribute missing after full resolution including fallback hooks.
    AttributeError,
    /// Unbound global or builtin name.
    NameError,

    /// Division or modulo by zero.
    ZeroDivisionError,
    /// Int64 arithmetic overflow.
    OverflowError,

    /// Allocation byte ceiling exceeded.
    MemoryError,
    /// Single-collection growth ceiling exceeded.
    CollectionLimitError,

    /// Module resolution failure.
    ImportError,

    /// Iterator exhaustion sentinel. Consumed by loop constructs at the
    /// protocol boundary; only user-visible when raised outside a loop.
    StopIteration,

    /// Deadline expired. Never guest-catchable.
    TimeoutError,
    /// External cancellation fired. Never guest-catchable.
    CancelledError,
    /// C3 linearization failure at class-construction time. Never catchable
    /// by the class being built.
    InconsistentHierarchy,
}

impl ExcType {
    /// Checks whether this exception kind would be caught by a handler for
    /// `handler_type`.
    ///
    /// Implements the fixed hierarchy used for try/except matching:
    /// - `BaseException` catches everything
    /// - `Exception` catches everything except `BaseException` and the
    ///   uncatchable governance kinds
    /// - `LookupError` is the base for `KeyError` and `IndexError`
    /// - `RuntimeError` is the base for `NotImplementedError` and `RecursionError`
    #[must_use]
    pub fn is_subclass_of(self, handler_type: Self) -> bool {
        if self == handler_type {
            return true;
        }
        match handler_type {
            Self::BaseException => true,
            Self::Exception => !matches!(
                self,
                Self::BaseException | Self::TimeoutError | Self::CancelledError | Self::InconsistentHierarchy
            ),
            Self::LookupError => matches!(self, Self::KeyError | Self::IndexError),
            Self::RuntimeError => matches!(self, Self::NotImplementedError | Self::RecursionError),
            _ => false,
        }
    }

    /// Creates a TypeError with the given message.
    #[must_use]
    pub(crate) fn type_error(msg: impl Into<String>) -> RunError {
        VmException::new(Self::TypeError, Some(msg.into())).into()
    }

    /// Creates a ValueError with the given message.
    #[must_use]
    pub(crate) fn value_error(msg: impl Into<String>) -> RunError {
        VmException::new(Self::ValueError, Some(msg.into())).into()
    }

    /// Creates an IndexError with the standard out-of-range message.
    #[must_use]
    pub(crate) fn index_error(type_name: &str) -> RunError {
        VmException::new(Self::IndexError, Some(format!("{type_name} index out of range"))).into()
    }

    /// Creates a KeyError naming the missing key.
    #[must_use]
    pub(crate) fn key_error(key: impl Display) -> RunError {
        VmException::new(Self::KeyError, Some(key.to_string())).into()
    }

    /// Creates an AttributeError for a missing attribute.
    #[must_use]
    pub(crate) fn attribute_error(type_name: impl Display, attr: &str) -> RunError {
        VmException::new(
            Self::AttributeError,
            Some(format!("'{type_name}' object has no attribute '{attr}'")),
        )
        .into()
    }

    /// Creates a NameError for an unbound name.
    #[must_use]
    pub(crate) fn name_error(name: &str) -> RunError {
        VmException::new(Self::NameError, Some(format!("name '{name}' is not defined"))).into()
    }

    /// Creates the standard TypeError for a binary operator that neither
    /// operand supports, naming both operand types.
    #[must_use]
    pub(crate) fn binary_type_error(op: &str, lhs_type: impl Display, rhs_type: impl Display) -> RunError {
        VmException::new(
            Self::TypeError,
            Some(format!(
                "unsupported operand type(s) for {op}: '{lhs_type}' and '{rhs_type}'"
            )),
        )
        .into()
    }

    /// Creates a TypeError reporting a non-callable value.
    #[must_use]
    pub(crate) fn not_callable(type_name: impl Display) -> RunError {
        VmException::new(Self::TypeError, Some(format!("'{type_name}' object is not callable"))).into()
    }

    /// Creates a TypeError for an error raised inside a protocol slot,
    /// tagging the slot name for diagnostics.
    #[must_use]
    pub(crate) fn slot_arity_error(slot_name: &str, expected: usize, got: usize) -> RunError {
        VmException::new(
            Self::TypeError,
            Some(format!("{slot_name}() takes {expected} argument(s) ({got} given)")),
        )
        .into()
    }
}

/// One unwound activation recorded on an exception.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameInfo {
    /// Human-readable name of the code object that was executing.
    pub function: String,
}

/// A guest exception: classification, optional message, and the frames it
/// unwound through.
///
/// Used both internally (boxed inside [`RunError`]) and as the public error
/// the embedder receives for an unhandled failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmException {
    exc_type: ExcType,
    message: Option<String>,
    frames: Vec<FrameInfo>,
    /// Name of the protocol slot that raised, if any. Diagnostics only.
    slot: Option<&'static str>,
}

impl VmException {
    /// Creates an exception with no frame context.
    #[must_use]
    pub fn new(exc_type: ExcType, message: Option<String>) -> Self {
        Self {
            exc_type,
            message,
            frames: Vec::new(),
            slot: None,
        }
    }

    /// Returns the classification of this exception.
    #[must_use]
    pub fn exc_type(&self) -> ExcType {
        self.exc_type
    }

    /// Returns the message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Returns the frames this exception unwound through, innermost first.
    #[must_use]
    pub fn frames(&self) -> &[FrameInfo] {
        &self.frames
    }

    /// Returns the protocol slot the exception was raised from, if any.
    #[must_use]
    pub fn slot(&self) -> Option<&'static str> {
        self.slot
    }

    /// Records a frame during unwinding, innermost first.
    pub(crate) fn push_frame(&mut self, function: &str) {
        self.frames.push(FrameInfo {
            function: function.to_string(),
        });
    }

    /// Tags the exception with the protocol slot it escaped from.
    ///
    /// Only the innermost slot is kept.
    pub(crate) fn tag_slot(&mut self, slot: &'static str) {
        if self.slot.is_none() {
            self.slot = Some(slot);
        }
    }
}

impl Display for VmException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{}: {msg}", self.exc_type),
            None => write!(f, "{}", self.exc_type),
        }
    }
}

impl std::error::Error for VmException {}

/// Error channel of the VM, also returned by host-registered functions.
#[derive(Debug)]
pub enum RunError {
    /// Internal engine error - indicates a bug in varan, not guest code.
    Internal(String),
    /// Catchable guest exception (e.g., ValueError, TypeError).
    Exc(Box<VmException>),
    /// Uncatchable exception: timeout, cancellation, or a linearization
    /// failure. Unwinds past every guest handler to the top of the stack.
    UncatchableExc(Box<VmException>),
}

impl RunError {
    /// Creates an internal error. These indicate engine bugs (e.g. malformed
    /// bytecode), never guest mistakes.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns the exception classification, if this is an exception.
    #[must_use]
    pub fn exc_type(&self) -> Option<ExcType> {
        match self {
            Self::Internal(_) => None,
            Self::Exc(exc) | Self::UncatchableExc(exc) => Some(exc.exc_type()),
        }
    }

    /// Returns true if a guest handler for `handler_type` may catch this error.
    #[must_use]
    pub fn is_catchable_as(&self, handler_type: ExcType) -> bool {
        match self {
            Self::Exc(exc) => exc.exc_type().is_subclass_of(handler_type),
            Self::Internal(_) | Self::UncatchableExc(_) => false,
        }
    }

    /// Records an unwound frame on the carried exception, if any.
    pub(crate) fn record_frame(&mut self, function: &str) {
        if let Self::Exc(exc) | Self::UncatchableExc(exc) = self {
            exc.push_frame(function);
        }
    }
}

impl From<VmException> for RunError {
    fn from(exc: VmException) -> Self {
        Self::Exc(Box::new(exc))
    }
}

impl Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
            Self::Exc(exc) | Self::UncatchableExc(exc) => write!(f, "{exc}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subclass_matching() {
        assert!(ExcType::KeyError.is_subclass_of(ExcType::LookupError));
        assert!(ExcType::IndexError.is_subclass_of(ExcType::LookupError));
        assert!(ExcType::RecursionError.is_subclass_of(ExcType::RuntimeError));
        assert!(ExcType::TypeError.is_subclass_of(ExcType::Exception));
        assert!(!ExcType::LookupError.is_subclass_of(ExcType::KeyError));
        assert!(!ExcType::TimeoutError.is_subclass_of(ExcType::Exception));
        assert!(ExcType::TimeoutError.is_subclass_of(ExcType::BaseException));
    }

    #[test]
    fn display_matches_variant_names() {
        assert_eq!(ExcType::TypeError.to_string(), "TypeError");
        assert_eq!(ExcType::CollectionLimitError.to_string(), "CollectionLimitError");
        let exc = VmException::new(ExcType::ValueError, Some("bad".to_string()));
        assert_eq!(exc.to_string(), "ValueError: bad");
    }
}
