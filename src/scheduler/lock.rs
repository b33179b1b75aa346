//! Scheduler lock
//!
//! A single recursive lock serializing every scheduling-state mutation
//! across cores. The holder is identified by the current thread of the
//! core that took it, so nested acquisitions from the same thread only bump
//! a depth counter.
//!
//! Taking the lock first disables dispatch on the calling core. Releasing
//! it to depth zero recomputes every core's highest priority thread while
//! still holding it, then lets go and re-enables dispatch with the mask of
//! cores that need to reschedule. All mutations made under one acquisition
//! are therefore flushed as a single round of scheduling decisions.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::types::{CoreId, ThreadId};

const NO_OWNER: u64 = 0;

/// What the lock needs from the scheduler it protects.
pub trait SchedulerHooks {
    /// Thread currently running on `core`.
    fn current_thread(&self, core: CoreId) -> ThreadId;

    /// Bumps the dispatch-disable count of `core`'s current thread.
    fn disable_scheduling(&self, core: CoreId);

    /// Runs the deferred scheduler update; returns the cores whose
    /// highest priority thread changed.
    fn update_highest_priority_threads(&self) -> u64;

    /// Drops the dispatch-disable count and reschedules `cores`.
    fn enable_scheduling(&self, core: CoreId, cores_needing_scheduling: u64);
}

pub struct SchedulerLock {
    /// Holder thread id plus one; zero when free.
    owner: AtomicU64,
    depth: AtomicU32,
}

impl SchedulerLock {
    pub const fn new() -> Self {
        Self {
            owner: AtomicU64::new(NO_OWNER),
            depth: AtomicU32::new(0),
        }
    }

    #[inline]
    fn encode(id: ThreadId) -> u64 {
        id.0 as u64 + 1
    }

    pub fn owner(&self) -> Option<ThreadId> {
        match self.owner.load(Ordering::Acquire) {
            NO_OWNER => None,
            raw => Some(ThreadId((raw - 1) as u32)),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Acquire) != NO_OWNER
    }

    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::Acquire)
    }

    /// Whether the current thread of `core` holds the lock.
    pub fn is_locked_by<H: SchedulerHooks + ?Sized>(&self, hooks: &H, core: CoreId) -> bool {
        self.owner() == Some(hooks.current_thread(core))
    }

    pub fn lock<H: SchedulerHooks + ?Sized>(&self, hooks: &H, core: CoreId) {
        let me = Self::encode(hooks.current_thread(core));
        if self.owner.load(Ordering::Acquire) == me {
            self.depth.fetch_add(1, Ordering::AcqRel);
            return;
        }

        hooks.disable_scheduling(core);
        while self
            .owner
            .compare_exchange_weak(NO_OWNER, me, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        self.depth.store(1, Ordering::Release);
    }

    pub fn unlock<H: SchedulerHooks + ?Sized>(&self, hooks: &H, core: CoreId) {
        let me = Self::encode(hooks.current_thread(core));
        if self.owner.load(Ordering::Acquire) != me {
            crate::kpanic!(
                "scheduler lock released by {} on core {}, held by {:?}",
                hooks.current_thread(core),
                core,
                self.owner()
            );
        }
        let depth = self.depth.load(Ordering::Acquire);
        if depth == 0 {
            crate::kpanic!("scheduler lock depth underflow on core {}", core);
        }
        if depth > 1 {
            self.depth.store(depth - 1, Ordering::Release);
            return;
        }

        let cores_needing_scheduling = hooks.update_highest_priority_threads();
        self.depth.store(0, Ordering::Release);
        self.owner.store(NO_OWNER, Ordering::Release);
        hooks.enable_scheduling(core, cores_needing_scheduling);
    }
}

impl Default for SchedulerLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds the scheduler lock for its lifetime.
pub struct ScopedSchedulerLock<'a, H: SchedulerHooks + ?Sized> {
    lock: &'a SchedulerLock,
    hooks: &'a H,
    core: CoreId,
}

impl<'a, H: SchedulerHooks + ?Sized> ScopedSchedulerLock<'a, H> {
    pub fn new(lock: &'a SchedulerLock, hooks: &'a H, core: CoreId) -> Self {
        lock.lock(hooks, core);
        Self { lock, hooks, core }
    }

    pub fn core(&self) -> CoreId {
        self.core
    }
}

impl<H: SchedulerHooks + ?Sized> Drop for ScopedSchedulerLock<'_, H> {
    fn drop(&mut self) {
        self.lock.unlock(self.hooks, self.core);
    }
}
