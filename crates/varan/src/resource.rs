//! Resource governance: limits, trackers, and cooperative cancellation.
//!
//! The VM calls into a [`ResourceTracker`] at defined points in the dispatch
//! loop: once per instruction for deadline/cancellation checks, before each
//! compound-value allocation for byte accounting, before each container
//! growth for the per-collection ceiling, and before each frame push for the
//! recursion ceiling. [`LimitedTracker`] enforces whatever subset of
//! [`ResourceLimits`] is configured; unset limits cost a branch per check.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

use crate::exception::{ExcType, RunError, VmException};

/// Recommended maximum recursion depth if not otherwise specified.
pub const DEFAULT_MAX_RECURSION_DEPTH: usize = 1000;

/// Maximum length of the linearization (MRO) for any class.
///
/// Bounds the output of C3 merging so diamond-inheritance explosions cannot
/// consume excessive memory or CPU during class construction.
pub const MAX_MRO_LENGTH: usize = 2600;

/// Maximum depth of single-path inheritance chains.
///
/// Prevents pathological hierarchies from causing stack overflow or excessive
/// work during linearization.
pub const MAX_INHERITANCE_DEPTH: usize = 1000;

/// Error returned when a resource limit is exceeded during execution.
#[derive(Debug, Clone)]
pub enum ResourceError {
    /// Allocation byte ceiling exceeded.
    Memory { limit: usize, used: usize },
    /// Single-collection growth ceiling exceeded.
    Collection { limit: usize, len: usize },
    /// Maximum execution time exceeded.
    Time { limit: Duration, elapsed: Duration },
    /// Maximum instruction count exceeded.
    Operation { limit: usize, count: usize },
    /// Maximum recursion depth exceeded.
    Recursion { limit: usize, depth: usize },
    /// External cancellation signal observed.
    Cancelled,
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory { limit, used } => {
                write!(f, "allocation limit exceeded: {used} bytes > {limit} bytes")
            }
            Self::Collection { limit, len } => {
                write!(f, "collection size limit exceeded: {len} > {limit}")
            }
            Self::Time { limit, elapsed } => {
                write!(f, "time limit exceeded: {elapsed:?} > {limit:?}")
            }
            Self::Operation { limit, count } => {
                write!(f, "operation limit exceeded: {count} > {limit}")
            }
            Self::Recursion { .. } => write!(f, "maximum recursion depth exceeded"),
            Self::Cancelled => write!(f, "execution cancelled"),
        }
    }
}

impl std::error::Error for ResourceError {}

impl From<ResourceError> for RunError {
    fn from(err: ResourceError) -> Self {
        // Recursion, memory, and collection failures are guest-catchable so a
        // program can back off and keep running. Deadline expiry and external
        // cancellation bypass guest handlers and unwind to the top.
        let catchable = matches!(
            err,
            ResourceError::Memory { .. } | ResourceError::Collection { .. } | ResourceError::Recursion { .. }
        );
        let exc_type = match err {
            ResourceError::Memory { .. } => ExcType::MemoryError,
            ResourceError::Collection { .. } => ExcType::CollectionLimitError,
            ResourceError::Recursion { .. } => ExcType::RecursionError,
            ResourceError::Time { .. } | ResourceError::Operation { .. } => ExcType::TimeoutError,
            ResourceError::Cancelled => ExcType::CancelledError,
        };
        let exc = Box::new(VmException::new(exc_type, Some(err.to_string())));
        if catchable {
            Self::Exc(exc)
        } else {
            Self::UncatchableExc(exc)
        }
    }
}

/// Cooperative cancellation handle shared between the host and the engine.
///
/// The host may clone the token, hand the clone to another thread, and call
/// [`CancelToken::cancel`] while guest code runs. The VM observes the flag at
/// its instruction cadence; cancellation is not preemptive and cannot
/// interrupt a single host-call invocation mid-flight.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a fresh, un-cancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Configuration for resource limits.
///
/// All limits are optional - set to `None` to disable a specific limit.
/// `ResourceLimits::new()` enables only the default recursion ceiling.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum call-stack depth.
    pub max_recursion_depth: Option<usize>,
    /// Maximum aggregate bytes allocated for compound values (approximate).
    pub max_allocation_bytes: Option<usize>,
    /// Maximum element/byte count of any single list, dict, string, or bytes.
    pub max_collection_len: Option<usize>,
    /// Maximum wall-clock execution time.
    pub max_duration: Option<Duration>,
    /// Maximum number of VM instructions per execution.
    pub max_operations: Option<usize>,
}

impl ResourceLimits {
    /// Creates limits with everything disabled except the default recursion ceiling.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_recursion_depth: Some(DEFAULT_MAX_RECURSION_DEPTH),
            ..Self::default()
        }
    }

    /// Sets the maximum call-stack depth.
    #[must_use]
    pub fn max_recursion_depth(mut self, limit: usize) -> Self {
        self.max_recursion_depth = Some(limit);
        self
    }

    /// Sets the maximum aggregate allocation in bytes.
    #[must_use]
    pub fn max_allocation_bytes(mut self, limit: usize) -> Self {
        self.max_allocation_bytes = Some(limit);
        self
    }

    /// Sets the maximum size of any single collection.
    #[must_use]
    pub fn max_collection_len(mut self, limit: usize) -> Self {
        self.max_collection_len = Some(limit);
        self
    }

    /// Sets the maximum wall-clock execution time.
    #[must_use]
    pub fn max_duration(mut self, limit: Duration) -> Self {
        self.max_duration = Some(limit);
        self
    }

    /// Sets the maximum number of VM instructions per execution.
    #[must_use]
    pub fn max_operations(mut self, limit: usize) -> Self {
        self.max_operations = Some(limit);
        self
    }
}

/// Trait for tracking resource usage during execution.
///
/// Implementations enforce limits on allocation, collection growth, time,
/// recursion depth, and cancellation. The VM is generic over the tracker so
/// every check monomorphizes and inlines into the dispatch loop.
pub trait ResourceTracker: fmt::Debug {
    /// Called before each compound-value allocation.
    ///
    /// `get_size` returns the approximate size in bytes; it is only invoked
    /// when a byte ceiling is configured.
    fn on_allocate(&mut self, get_size: impl FnOnce() -> usize) -> Result<(), ResourceError>;

    /// Called before growing an existing container by one element.
    ///
    /// `new_len` is the length the container would have after the insertion.
    fn on_container_grow(&mut self, new_len: usize) -> Result<(), ResourceError>;

    /// Checks whether a single collection of `len` elements/bytes would
    /// exceed the per-collection ceiling. Used at bulk construction sites.
    fn check_collection_len(&self, len: usize) -> Result<(), ResourceError>;

    /// Called once per instruction to check deadline, instruction budget,
    /// and the cancellation flag.
    fn check_tick(&mut self) -> Result<(), ResourceError>;

    /// Called before pushing a new call frame.
    ///
    /// `current_depth` is the stack depth before the new frame is pushed.
    fn check_recursion_depth(&self, current_depth: usize) -> Result<(), ResourceError>;

    /// Returns the running allocation byte counter, if this tracker keeps one.
    fn allocated_bytes(&self) -> Option<usize> {
        None
    }
}

/// A tracker that enforces configured [`ResourceLimits`], an optional
/// deadline, and an optional [`CancelToken`].
#[derive(Debug)]
pub struct LimitedTracker {
    limits: ResourceLimits,
    /// When execution started, for the wall-clock limit.
    start_time: Instant,
    /// Absolute deadline derived from `limits.max_duration`, if any.
    deadline: Option<Instant>,
    /// External cancellation signal, if the host supplied one.
    cancel: Option<CancelToken>,
    /// Running byte counter for compound-value allocations.
    allocated: usize,
    /// Number of instructions executed.
    operation_count: usize,
}

impl LimitedTracker {
    /// Creates a tracker with the given limits.
    ///
    /// The start time is recorded now, so create the tracker immediately
    /// before starting execution.
    #[must_use]
    pub fn new(limits: ResourceLimits) -> Self {
        let start_time = Instant::now();
        let deadline = limits.max_duration.map(|d| start_time + d);
        Self {
            limits,
            start_time,
            deadline,
            cancel: None,
            allocated: 0,
            operation_count: 0,
        }
    }

    /// Attaches an external cancellation token.
    #[must_use]
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Returns the running allocation byte counter.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.allocated
    }
}

impl ResourceTracker for LimitedTracker {
    fn on_allocate(&mut self, get_size: impl FnOnce() -> usize) -> Result<(), ResourceError> {
        let Some(max) = self.limits.max_allocation_bytes else {
            return Ok(());
        };
        let new_total = self.allocated.saturating_add(get_size());
        if new_total > max {
            return Err(ResourceError::Memory {
                limit: max,
                used: new_total,
            });
        }
        self.allocated = new_total;
        Ok(())
    }

    fn on_container_grow(&mut self, new_len: usize) -> Result<(), ResourceError> {
        if let Some(max) = self.limits.max_collection_len
            && new_len > max
        {
            return Err(ResourceError::Collection { limit: max, len: new_len });
        }
        // Growth also counts against the aggregate byte budget, element by
        // element, to bound unbounded in-place growth of a single container.
        self.on_allocate(|| std::mem::size_of::<usize>() * 2)
    }

    fn check_collection_len(&self, len: usize) -> Result<(), ResourceError> {
        if let Some(max) = self.limits.max_collection_len
            && len > max
        {
            return Err(ResourceError::Collection { limit: max, len });
        }
        Ok(())
    }

    fn check_tick(&mut self) -> Result<(), ResourceError> {
        if let Some(max) = self.limits.max_operations {
            self.operation_count += 1;
            if self.operation_count > max {
                return Err(ResourceError::Operation {
                    limit: max,
                    count: self.operation_count,
                });
            }
        }
        if let Some(cancel) = &self.cancel
            && cancel.is_cancelled()
        {
            return Err(ResourceError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            let now = Instant::now();
            if now >= deadline {
                let limit = self.limits.max_duration.unwrap_or_default();
                return Err(ResourceError::Time {
                    limit,
                    elapsed: now.duration_since(self.start_time),
                });
            }
        }
        Ok(())
    }

    fn check_recursion_depth(&self, current_depth: usize) -> Result<(), ResourceError> {
        let max = self.limits.max_recursion_depth.unwrap_or(DEFAULT_MAX_RECURSION_DEPTH);
        if current_depth >= max {
            return Err(ResourceError::Recursion {
                limit: max,
                depth: current_depth + 1,
            });
        }
        Ok(())
    }

    fn allocated_bytes(&self) -> Option<usize> {
        Some(self.allocated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_ceiling() {
        let mut tracker = LimitedTracker::new(ResourceLimits::new().max_allocation_bytes(100));
        assert!(tracker.on_allocate(|| 60).is_ok());
        let err = tracker.on_allocate(|| 60).unwrap_err();
        assert!(matches!(err, ResourceError::Memory { limit: 100, used: 120 }));
        // A failed allocation does not consume budget.
        assert_eq!(tracker.allocated(), 60);
    }

    #[test]
    fn collection_ceiling_independent_of_bytes() {
        let mut tracker = LimitedTracker::new(ResourceLimits::new().max_collection_len(3));
        assert!(tracker.on_container_grow(3).is_ok());
        assert!(matches!(
            tracker.on_container_grow(4),
            Err(ResourceError::Collection { limit: 3, len: 4 })
        ));
    }

    #[test]
    fn cancellation_is_uncatchable() {
        let token = CancelToken::new();
        let mut tracker = LimitedTracker::new(ResourceLimits::new()).with_cancel_token(token.clone());
        assert!(tracker.check_tick().is_ok());
        token.cancel();
        let err = tracker.check_tick().unwrap_err();
        assert!(matches!(err, ResourceError::Cancelled));
        assert!(matches!(RunError::from(err), RunError::UncatchableExc(_)));
    }

    #[test]
    fn recursion_error_is_catchable() {
        let tracker = LimitedTracker::new(ResourceLimits::new().max_recursion_depth(10));
        let err = tracker.check_recursion_depth(10).unwrap_err();
        assert!(matches!(RunError::from(err), RunError::Exc(_)));
    }
}
