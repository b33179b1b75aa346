//! Thread records
//!
//! A `Thread` is plain data owned by the scheduler's thread slab. Every
//! field that influences scheduling is changed only while the scheduler
//! lock is held; the mutators that the scheduler relies on
//! (`set_priority`, `set_state`, `set_active_core`) are crate-private.
//!
//! ## State
//!
//! The base state (`Initialized`, `Runnable`, `Waiting`, `Terminated`) and
//! the suspend reasons are stored apart. Requested suspensions only take
//! effect through [`Thread::update_suspension`], and the scheduler only ever
//! looks at the recombined [`EffectiveState`].

use alloc::vec::Vec;

use super::error::KResult;
use super::types::{
    AddressKey, AffinityMask, CoreId, LockId, ProcessId, SuspendSet, SuspendType, ThreadId,
    ThreadKind, ThreadState, WaitQueueId,
};

/// What a waiting thread is waiting for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitKind {
    /// Plain timed sleep
    Sleep,
    /// Generic wait queue
    Queue(WaitQueueId),
    /// Address-keyed lock with priority inheritance
    Lock(LockId),
    /// Waiting for a pinned thread to unpin
    Unpin(ThreadId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitRecord {
    pub kind: WaitKind,
    /// Absolute tick at which the wait times out.
    pub deadline: Option<u64>,
}

/// Base state plus the suspend reasons currently in force.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EffectiveState {
    pub base: ThreadState,
    pub suspended: SuspendSet,
}

impl EffectiveState {
    /// Runnable and not suspended: the only state that is queued.
    #[inline]
    pub fn is_ready(self) -> bool {
        self.base == ThreadState::Runnable && self.suspended.is_empty()
    }
}

/// Creation parameters.
#[derive(Clone, Copy, Debug)]
pub struct ThreadParams {
    pub name: &'static str,
    pub kind: ThreadKind,
    pub owner: Option<ProcessId>,
    pub priority: i32,
    pub ideal_core: CoreId,
    pub affinity: AffinityMask,
}

impl ThreadParams {
    pub fn kernel(name: &'static str, priority: i32, core: CoreId) -> Self {
        Self {
            name,
            kind: ThreadKind::Kernel,
            owner: None,
            priority,
            ideal_core: core,
            affinity: AffinityMask::single(core),
        }
    }

    pub fn user(name: &'static str, owner: ProcessId, priority: i32, ideal_core: CoreId, affinity: AffinityMask) -> Self {
        Self {
            name,
            kind: ThreadKind::User,
            owner: Some(owner),
            priority,
            ideal_core,
            affinity,
        }
    }
}

pub struct Thread {
    pub(crate) id: ThreadId,
    pub(crate) name: &'static str,
    pub(crate) kind: ThreadKind,
    pub(crate) owner: Option<ProcessId>,

    pub(crate) priority: i32,
    pub(crate) base_priority: i32,

    pub(crate) state: ThreadState,
    pub(crate) suspend_requested: SuspendSet,
    pub(crate) suspend_allowed: SuspendSet,
    pub(crate) suspend_active: SuspendSet,

    pub(crate) virtual_ideal_core: Option<CoreId>,
    pub(crate) physical_ideal_core: Option<CoreId>,
    pub(crate) virtual_affinity: AffinityMask,
    pub(crate) physical_affinity: AffinityMask,
    pub(crate) original_physical_ideal_core: Option<CoreId>,
    pub(crate) original_physical_affinity: AffinityMask,
    pub(crate) core_migration_disabled: u32,
    pub(crate) pinned: bool,
    pub(crate) active_core: Option<CoreId>,

    pub(crate) held_locks: Vec<LockId>,
    pub(crate) waiting_lock: Option<LockId>,
    pub(crate) address_key: Option<AddressKey>,

    pub(crate) wait: Option<WaitRecord>,
    pub(crate) wait_result: KResult<()>,
    pub(crate) pinned_waiters: Vec<ThreadId>,

    pub(crate) termination_requested: bool,
    pub(crate) finalized: bool,
    pub(crate) references: u32,
    pub(crate) disable_dispatch_count: u32,

    pub(crate) last_scheduled_tick: u64,
    pub(crate) cpu_ticks: u64,
    pub(crate) scheduled_count: u64,
}

impl Thread {
    pub(crate) fn new(id: ThreadId, params: &ThreadParams) -> Self {
        let ideal = Some(params.ideal_core);
        let suspend_allowed = match params.kind {
            ThreadKind::User => SuspendSet::ALL,
            ThreadKind::Kernel | ThreadKind::Idle => SuspendSet::EMPTY,
        };
        Self {
            id,
            name: params.name,
            kind: params.kind,
            owner: params.owner,
            priority: params.priority,
            base_priority: params.priority,
            state: ThreadState::Initialized,
            suspend_requested: SuspendSet::EMPTY,
            suspend_allowed,
            suspend_active: SuspendSet::EMPTY,
            virtual_ideal_core: ideal,
            physical_ideal_core: ideal,
            virtual_affinity: params.affinity,
            physical_affinity: params.affinity,
            original_physical_ideal_core: ideal,
            original_physical_affinity: params.affinity,
            core_migration_disabled: 0,
            pinned: false,
            active_core: ideal,
            held_locks: Vec::new(),
            waiting_lock: None,
            address_key: None,
            wait: None,
            wait_result: Ok(()),
            pinned_waiters: Vec::new(),
            termination_requested: false,
            finalized: false,
            references: 1,
            disable_dispatch_count: 0,
            last_scheduled_tick: 0,
            cpu_ticks: 0,
            scheduled_count: 0,
        }
    }

    #[inline]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    #[inline]
    pub fn priority(&self) -> i32 {
        self.priority
    }

    #[inline]
    pub fn base_priority(&self) -> i32 {
        self.base_priority
    }

    #[inline]
    pub fn state(&self) -> ThreadState {
        self.state
    }

    #[inline]
    pub fn active_core(&self) -> Option<CoreId> {
        self.active_core
    }

    #[inline]
    pub fn is_user(&self) -> bool {
        self.kind == ThreadKind::User
    }

    pub fn effective_state(&self) -> EffectiveState {
        EffectiveState {
            base: self.state,
            suspended: self.suspend_active,
        }
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.effective_state().is_ready()
    }

    pub(crate) fn set_priority(&mut self, priority: i32) {
        self.priority = priority;
    }

    pub(crate) fn set_state(&mut self, state: ThreadState) {
        self.state = state;
    }

    pub(crate) fn set_active_core(&mut self, core: Option<CoreId>) {
        if let Some(c) = core {
            if !self.physical_affinity.contains(c) {
                crate::kpanic!(
                    "thread {} made active on core {} outside {:?}",
                    self.id,
                    c,
                    self.physical_affinity
                );
            }
        }
        self.active_core = core;
    }

    pub(crate) fn request_suspend(&mut self, kind: SuspendType) {
        self.suspend_requested.insert(kind);
    }

    pub(crate) fn clear_suspend_request(&mut self, kind: SuspendType) {
        self.suspend_requested.remove(kind);
    }

    pub fn is_suspend_requested(&self, kind: SuspendType) -> bool {
        self.suspend_requested.contains(kind)
    }

    /// Applies the requested suspensions that are currently allowed and
    /// returns the effective state from before the change.
    pub(crate) fn update_suspension(&mut self) -> EffectiveState {
        let old = self.effective_state();
        self.suspend_active = if self.termination_requested {
            SuspendSet::EMPTY
        } else {
            self.suspend_requested.intersection(self.suspend_allowed)
        };
        old
    }

    pub(crate) fn add_held_lock(&mut self, lock: LockId) {
        self.held_locks.push(lock);
    }

    pub(crate) fn remove_held_lock(&mut self, lock: LockId) {
        match self.held_locks.iter().position(|&l| l == lock) {
            Some(pos) => {
                self.held_locks.remove(pos);
            }
            None => crate::kpanic!("thread {} does not hold lock {:?}", self.id, lock),
        }
    }

    /// Ends a wait record, returning it.
    pub(crate) fn take_wait(&mut self) -> Option<WaitRecord> {
        self.wait.take()
    }

    pub(crate) fn acquire_reference(&mut self) {
        self.references += 1;
    }

    /// Returns `true` when the last reference is gone.
    pub(crate) fn release_reference(&mut self) -> bool {
        if self.references == 0 {
            crate::kpanic!("thread {} reference count underflow", self.id);
        }
        self.references -= 1;
        self.references == 0
    }
}

/// Read-only copy of a thread's scheduling fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub name: &'static str,
    pub kind: ThreadKind,
    pub owner: Option<ProcessId>,
    pub priority: i32,
    pub base_priority: i32,
    pub state: ThreadState,
    pub effective: EffectiveState,
    pub active_core: Option<CoreId>,
    pub ideal_core: Option<CoreId>,
    pub affinity: AffinityMask,
    pub physical_affinity: AffinityMask,
    pub pinned: bool,
    pub held_locks: usize,
    pub waiting_on: Option<WaitKind>,
    pub wait_result: KResult<()>,
    pub termination_requested: bool,
    pub finalized: bool,
    pub cpu_ticks: u64,
    pub scheduled_count: u64,
}

impl From<&Thread> for ThreadInfo {
    fn from(t: &Thread) -> Self {
        Self {
            id: t.id,
            name: t.name,
            kind: t.kind,
            owner: t.owner,
            priority: t.priority,
            base_priority: t.base_priority,
            state: t.state,
            effective: t.effective_state(),
            active_core: t.active_core,
            ideal_core: t.virtual_ideal_core,
            affinity: t.virtual_affinity,
            physical_affinity: t.physical_affinity,
            pinned: t.pinned,
            held_locks: t.held_locks.len(),
            waiting_on: t.wait.map(|w| w.kind),
            wait_result: t.wait_result,
            termination_requested: t.termination_requested,
            finalized: t.finalized,
            cpu_ticks: t.cpu_ticks,
            scheduled_count: t.scheduled_count,
        }
    }
}
