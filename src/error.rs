//! Error types for the managed runtime core.
//!
//! Only recoverable conditions live here. Broken caller contracts (suspend
//! count underflow, releasing the no-suspension guard twice, removing a string
//! that was never interned) abort through `panic!` instead.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the runtime core.
///
/// # Examples
///
/// ```
/// use managed_rt::error::{RuntimeError, RuntimeResult};
///
/// let oom = RuntimeError::AllocationFailed { requested: 64, available: 16 };
/// assert_eq!(
///     oom.to_string(),
///     "Allocation of 64 bytes failed (16 bytes available)"
/// );
///
/// let failure: RuntimeResult<u32> = Err(RuntimeError::ThreadNotFound(7));
/// assert!(failure.is_err());
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("Allocation of {requested} bytes failed ({available} bytes available)")]
    AllocationFailed { requested: usize, available: usize },
    #[error("Thread {0} is not attached")]
    ThreadNotFound(u32),
    #[error("Thread {0} has terminated")]
    ThreadTerminated(u32),
    #[error("Thread {0} is not suspended")]
    NotSuspended(u32),
    #[error("Thread {0} is not registered with the thread list")]
    NotRegistered(u32),
    #[error("Thread {thread_id} did not suspend within {waited:?}")]
    SuspendTimeout { thread_id: u32, waited: Duration },
    #[error("Suspend count of thread {0} cannot be modified that way")]
    InvalidSuspendCount(u32),
    #[error("Thread list is shut down")]
    ShutDown,
    #[error("Out of internal thread ids")]
    ThreadIdsExhausted,
    #[error("Malformed intern snapshot at offset {offset}: {reason}")]
    MalformedSnapshot { offset: usize, reason: &'static str },
    #[error("Snapshot entry {0:?} is already interned")]
    DuplicateInternEntry(String),
}

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;
