//! Scheduler type definitions
//!
//! Identifiers, priority constants, thread states and the small bitset
//! types shared by the queue, the thread records and the scheduler.

use core::fmt;

/// Number of priority levels. 0 is the highest priority.
pub const NUM_PRIORITIES: usize = 64;
pub const HIGHEST_THREAD_PRIORITY: i32 = 0;
pub const LOWEST_THREAD_PRIORITY: i32 = NUM_PRIORITIES as i32 - 1;

/// Idle threads sit below every schedulable level and are never queued.
pub const IDLE_THREAD_PRIORITY: i32 = LOWEST_THREAD_PRIORITY + 1;

/// User threads live in `SYSTEM_THREAD_PRIORITY_HIGHEST..=LOWEST_THREAD_PRIORITY`.
pub const SYSTEM_THREAD_PRIORITY_HIGHEST: i32 = 16;
/// Base priority given to a user thread once termination is requested.
pub const TERMINATING_THREAD_PRIORITY: i32 = SYSTEM_THREAD_PRIORITY_HIGHEST - 1;
/// Effective priority floor of a pinned thread.
pub const PINNED_THREAD_PRIORITY: i32 = SYSTEM_THREAD_PRIORITY_HIGHEST - 1;

/// Threads running at a priority numerically below this are never stolen
/// by another core.
pub const HIGHEST_CORE_MIGRATION_ALLOWED_PRIORITY: i32 = 2;

/// Core masks are `u64`, so this is a hard limit.
pub const MAX_CORES: usize = 64;

pub type CoreId = usize;
pub type AddressKey = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WaitQueueId(pub u32);

impl ThreadId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

pub fn is_valid_priority(priority: i32) -> bool {
    (HIGHEST_THREAD_PRIORITY..=LOWEST_THREAD_PRIORITY).contains(&priority)
}

/// Base state of a thread. Suspension is tracked separately.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    Initialized,
    Waiting,
    Runnable,
    Terminated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SuspendType {
    Process = 0,
    Thread = 1,
    Debug = 2,
    BacktraceDebugInfo = 3,
    Init = 4,
}

impl SuspendType {
    pub const ALL: [SuspendType; 5] = [
        SuspendType::Process,
        SuspendType::Thread,
        SuspendType::Debug,
        SuspendType::BacktraceDebugInfo,
        SuspendType::Init,
    ];

    #[inline]
    const fn bit(self) -> u8 {
        1 << self as u8
    }
}

/// Set of suspend reasons.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct SuspendSet(u8);

impl SuspendSet {
    pub const EMPTY: SuspendSet = SuspendSet(0);
    pub const ALL: SuspendSet = SuspendSet(0x1F);

    pub const fn of(kind: SuspendType) -> Self {
        SuspendSet(kind.bit())
    }

    #[inline]
    pub const fn contains(self, kind: SuspendType) -> bool {
        self.0 & kind.bit() != 0
    }

    #[inline]
    pub fn insert(&mut self, kind: SuspendType) {
        self.0 |= kind.bit();
    }

    #[inline]
    pub fn remove(&mut self, kind: SuspendType) {
        self.0 &= !kind.bit();
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn intersection(self, other: SuspendSet) -> SuspendSet {
        SuspendSet(self.0 & other.0)
    }

    pub const fn without(self, other: SuspendSet) -> SuspendSet {
        SuspendSet(self.0 & !other.0)
    }

    pub fn iter(self) -> impl Iterator<Item = SuspendType> {
        SuspendType::ALL.into_iter().filter(move |k| self.contains(*k))
    }
}

impl fmt::Debug for SuspendSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Bitmask of cores a thread may run on.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct AffinityMask(u64);

impl AffinityMask {
    pub const EMPTY: AffinityMask = AffinityMask(0);

    pub const fn from_bits(bits: u64) -> Self {
        AffinityMask(bits)
    }

    pub const fn single(core: CoreId) -> Self {
        AffinityMask(1u64 << core)
    }

    /// Every core in `0..num_cores`.
    pub const fn all(num_cores: usize) -> Self {
        if num_cores >= MAX_CORES {
            AffinityMask(u64::MAX)
        } else {
            AffinityMask((1u64 << num_cores) - 1)
        }
    }

    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn contains(self, core: CoreId) -> bool {
        core < MAX_CORES && self.0 & (1u64 << core) != 0
    }

    #[inline]
    pub fn set(&mut self, core: CoreId, allowed: bool) {
        if allowed {
            self.0 |= 1u64 << core;
        } else {
            self.0 &= !(1u64 << core);
        }
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Highest numbered allowed core.
    pub fn highest_core(self) -> Option<CoreId> {
        if self.0 == 0 {
            None
        } else {
            Some(63 - self.0.leading_zeros() as usize)
        }
    }

    pub fn cores(self) -> impl Iterator<Item = CoreId> {
        let mut bits = self.0;
        core::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let core = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            Some(core)
        })
    }
}

impl fmt::Debug for AffinityMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AffinityMask({:#x})", self.0)
    }
}

/// Ideal core request accepted by `set_core_mask`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdealCore {
    /// Keep the current ideal core.
    NoUpdate,
    /// Use the thread's process default. Kernel threads keep their own.
    UseProcessValue,
    /// No ideal core; the thread is placed on the highest allowed core.
    DontCare,
    Core(CoreId),
}

/// Kind of work a thread does; kernel threads have no owning process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadKind {
    Kernel,
    User,
    Idle,
}
