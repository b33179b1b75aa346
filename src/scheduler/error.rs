//! Results reported by scheduler entry points.
//!
//! Invariant violations never show up here; they go through `kpanic!`.
//! These values describe requests that were refused, or how a wait ended.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum KernelError {
    /// The waiting thread has been asked to terminate
    TerminationRequested = 1,
    /// The wait was cancelled by another thread
    Cancelled = 2,
    /// The wait deadline passed
    TimedOut = 3,
    /// The object is not in a state that allows the request
    InvalidState = 4,
    /// The thread, process or queue does not exist
    InvalidHandle = 5,
    /// Priority outside the schedulable range
    InvalidPriority = 6,
    /// Core id outside the configured cores or the affinity mask
    InvalidCoreId = 7,
    /// Ideal core and affinity mask contradict each other
    InvalidCombination = 8,
    /// Too many threads, locks or queues
    OutOfResource = 9,
    /// Lookup by key found nothing
    NotFound = 10,
    /// The target is pinned or otherwise busy
    Busy = 11,
}

impl KernelError {
    pub const fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            1 => KernelError::TerminationRequested,
            2 => KernelError::Cancelled,
            3 => KernelError::TimedOut,
            4 => KernelError::InvalidState,
            5 => KernelError::InvalidHandle,
            6 => KernelError::InvalidPriority,
            7 => KernelError::InvalidCoreId,
            8 => KernelError::InvalidCombination,
            9 => KernelError::OutOfResource,
            10 => KernelError::NotFound,
            11 => KernelError::Busy,
            _ => return None,
        })
    }

    pub const fn description(self) -> &'static str {
        match self {
            KernelError::TerminationRequested => "termination requested",
            KernelError::Cancelled => "wait cancelled",
            KernelError::TimedOut => "timed out",
            KernelError::InvalidState => "invalid state",
            KernelError::InvalidHandle => "invalid handle",
            KernelError::InvalidPriority => "invalid priority",
            KernelError::InvalidCoreId => "invalid core id",
            KernelError::InvalidCombination => "invalid combination",
            KernelError::OutOfResource => "out of resource",
            KernelError::NotFound => "not found",
            KernelError::Busy => "busy",
        }
    }

    /// Completions that end a wait without anything having gone wrong.
    pub const fn is_wait_completion(self) -> bool {
        matches!(
            self,
            KernelError::TerminationRequested | KernelError::Cancelled | KernelError::TimedOut
        )
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

pub type KResult<T> = Result<T, KernelError>;
