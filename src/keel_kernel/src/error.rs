//! Kernel result codes.
use core::fmt;

/// Shorthand for the `Result` type returned by every fallible kernel API.
pub type Result<T = ()> = core::result::Result<T, Error>;

/// The flat error code enumeration shared by all kernel services.
///
/// Each variant corresponds to one externally visible failure condition;
/// services never invent ad-hoc codes. `Deadlock` is reserved — the mutex
/// bounds its inheritance chain walk instead of detecting cycles.
#[repr(i8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Unspecified failure.
    General = 1,
    /// The object or kernel is not in a state that permits the operation.
    InvalidState,
    /// The operation is not supported in this build.
    Unsupported,
    /// A parameter is outside its documented domain.
    InvalidParam,
    /// The handle does not refer to a live object.
    InvalidHandle,
    /// A numeric argument exceeds its admissible range (e.g. a timeout
    /// of `u32::MAX / 2` or more).
    OutOfRange,
    /// The heap cannot satisfy the request.
    OutOfMemory,
    /// The object pool has no free slot.
    NoResource,
    /// The resource was unavailable and the caller asked not to block.
    WouldBlock,
    /// A timed wait expired before the resource became available.
    Timeout,
    /// The task exists but is unusable for this operation.
    TaskInvalid,
    /// No such task.
    TaskNotFound,
    /// The requested priority collides with a reserved level.
    PriorityConflict,
    /// A synchronization counter would overflow.
    SyncOverflow,
    /// The caller does not own the mutex.
    NotOwner,
    /// Reserved.
    Deadlock,
    /// The message size does not fit the queue's element size.
    QueueSizeMismatch,
    /// A heap header failed its integrity checks.
    MemoryCorruption,
    /// The service must not be called from interrupt context.
    InIsr,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
