//! Scheduler subsystem
//!
//! Multi-core, preemptive, priority based thread scheduling with priority
//! inheritance and core affinity.
//!
//! ## Model
//!
//! - 64 priority levels, 0 is the highest. Each core runs the front of its
//!   highest non-empty scheduled list, or its idle thread.
//! - A ready thread is scheduled on its active core and suggested on every
//!   other core of its affinity mask. Idle cores pull suggestions.
//! - All scheduling state changes happen under one recursive scheduler lock.
//!   They only mark the scheduler as needing an update; the update and the
//!   resulting reschedules (local switch plus IPIs to other cores) happen
//!   once, when the lock is released to depth zero.
//! - Round robin within a level is driven by the timer through
//!   `rotate_scheduled_queue`.
//!
//! ## Module Organization
//!
//! - `types`: identifiers, priority constants, suspend and affinity sets
//! - `error`: `KernelError`, the wait and request result codes
//! - `slab`: index-stable storage for threads, locks, queues, processes
//! - `queue`: per-core per-priority scheduled and suggested lists
//! - `thread`: thread records and the effective state
//! - `process`: the scheduler's view of a process
//! - `table`: `SchedulerState`, the single table everything lives in
//! - `select`: highest-priority selection, migration, yields, context switch
//! - `lock`: the scheduler lock
//! - `priority`: priority inheritance over address-keyed locks
//! - `wait`: waits, wait queues and timeouts
//! - `affinity`: core masks, migration disable and pinning
//! - `lifecycle`: creation, suspension and the termination protocol
//! - `worker`: deferred finalization tasks
//! - `stats`: statistics, dumps and invariant checks

mod affinity;
pub mod error;
mod lifecycle;
pub mod lock;
mod priority;
pub mod process;
pub mod queue;
mod select;
pub mod slab;
mod stats;
pub mod table;
pub mod thread;
pub mod types;
mod wait;
pub mod worker;

pub use affinity::CoreMaskChange;
pub use error::{KResult, KernelError};
pub use lock::{SchedulerHooks, SchedulerLock, ScopedSchedulerLock};
pub use priority::LockInfo;
pub use process::ProcessInfo;
pub use queue::{Placement, PriorityQueue};
pub use stats::{CoreStats, InvariantViolation, SchedulerStats};
pub use table::SchedulerState;
pub use thread::{EffectiveState, ThreadInfo, ThreadParams, WaitKind};
pub use types::{
    AddressKey, AffinityMask, CoreId, IdealCore, LockId, ProcessId, SuspendSet, SuspendType,
    ThreadId, ThreadKind, ThreadState, WaitQueueId,
};
pub use types::{
    HIGHEST_CORE_MIGRATION_ALLOWED_PRIORITY, HIGHEST_THREAD_PRIORITY, IDLE_THREAD_PRIORITY,
    LOWEST_THREAD_PRIORITY, MAX_CORES, NUM_PRIORITIES, PINNED_THREAD_PRIORITY,
    SYSTEM_THREAD_PRIORITY_HIGHEST, TERMINATING_THREAD_PRIORITY,
};
pub use wait::WaitQueue;
