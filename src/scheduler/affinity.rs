//! Core affinity, migration control and pinning
//!
//! A thread carries two views of its placement. The *virtual* ideal core
//! and mask are what was asked for; the *physical* ones are what the
//! scheduler obeys. They differ only while core migration is disabled,
//! when the physical view is narrowed to the current core and the
//! requested values are parked in `original_physical_*` until the last
//! `enable_core_migration`.

use super::error::{KResult, KernelError};
use super::table::SchedulerState;
use super::thread::WaitKind;
use super::types::{AffinityMask, CoreId, IdealCore, SuspendType, ThreadId, ThreadKind};

/// Outcome of a core mask change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoreMaskChange {
    /// The thread is already allowed where it runs.
    Applied,
    /// The thread still runs on a core it left; it moves at that core's
    /// next reschedule. Check again afterwards.
    AwaitingMigration,
    /// The thread is pinned to a core it left. The caller now waits until
    /// it is unpinned.
    WaitingForUnpin,
}

impl SchedulerState {
    fn resolve_ideal_core(&self, id: ThreadId, ideal: IdealCore, mask: AffinityMask) -> KResult<Option<CoreId>> {
        let t = self.thread(id);
        let core = match ideal {
            IdealCore::Core(c) => {
                if c >= self.num_cores {
                    return Err(KernelError::InvalidCoreId);
                }
                Some(c)
            }
            IdealCore::NoUpdate => t.virtual_ideal_core,
            IdealCore::UseProcessValue => match t.owner {
                Some(owner) => Some(self.process(owner)?.ideal_core),
                None => t.virtual_ideal_core,
            },
            IdealCore::DontCare => None,
        };
        match core {
            Some(c) if !mask.contains(c) => Err(KernelError::InvalidCombination),
            _ => Ok(core),
        }
    }

    /// Narrows or widens the physical placement of `id`, moving its active
    /// core if it is no longer allowed.
    fn apply_physical_affinity(&mut self, id: ThreadId, ideal: Option<CoreId>, mask: AffinityMask) {
        let t = self.thread_mut(id);
        let old_mask = t.physical_affinity;
        t.physical_ideal_core = ideal;
        t.physical_affinity = mask;
        if old_mask == mask {
            return;
        }
        if let Some(active) = t.active_core {
            if !mask.contains(active) {
                let target = ideal.or(mask.highest_core());
                t.set_active_core(target);
            }
        }
        self.on_thread_affinity_mask_changed(id);
    }

    /// `core` is the calling core; its current thread is the one that may
    /// have to wait.
    pub(crate) fn set_core_mask(&mut self, core: CoreId, id: ThreadId, ideal: IdealCore, mask: AffinityMask) -> KResult<CoreMaskChange> {
        self.checked_thread(id)?;
        let valid = AffinityMask::all(self.num_cores).bits();
        if mask.is_empty() || mask.bits() & !valid != 0 {
            return Err(KernelError::InvalidCombination);
        }
        let ideal_core = self.resolve_ideal_core(id, ideal, mask)?;

        {
            let t = self.thread_mut(id);
            t.virtual_ideal_core = ideal_core;
            t.virtual_affinity = mask;
        }
        if self.thread(id).core_migration_disabled == 0 {
            self.apply_physical_affinity(id, ideal_core, mask);
        } else {
            let t = self.thread_mut(id);
            t.original_physical_ideal_core = ideal_core;
            t.original_physical_affinity = mask;
        }
        crate::kdebug!("affinity: {} ideal {:?} mask {:?}", id, ideal_core, mask);

        if self.thread(id).termination_requested {
            return Ok(CoreMaskChange::Applied);
        }
        let Some(running) = self.running_core(id) else {
            return Ok(CoreMaskChange::Applied);
        };
        if mask.contains(running) {
            return Ok(CoreMaskChange::Applied);
        }

        let caller = self.current_thread(core);
        if caller == id {
            // The caller itself moves when this core reschedules, or, if
            // pinned, when it unpins.
            return Ok(CoreMaskChange::Applied);
        }
        if !self.thread(id).pinned {
            return Ok(CoreMaskChange::AwaitingMigration);
        }
        if self.thread(caller).kind == ThreadKind::Idle {
            return Err(KernelError::InvalidState);
        }
        if self.thread(caller).termination_requested {
            return Err(KernelError::TerminationRequested);
        }
        self.thread_mut(id).pinned_waiters.push(caller);
        self.begin_wait(caller, WaitKind::Unpin(id), None);
        Ok(CoreMaskChange::WaitingForUnpin)
    }

    pub(crate) fn disable_core_migration(&mut self, core: CoreId) {
        let id = self.current_thread(core);
        if self.thread(id).kind == ThreadKind::Idle {
            return;
        }
        let t = self.thread_mut(id);
        t.core_migration_disabled += 1;
        if t.core_migration_disabled > 1 {
            return;
        }
        t.original_physical_ideal_core = t.physical_ideal_core;
        t.original_physical_affinity = t.physical_affinity;
        self.apply_physical_affinity(id, Some(core), AffinityMask::single(core));
        // Keep the scheduled slot here even if nothing had to move.
        if self.thread(id).active_core != Some(core) {
            self.thread_mut(id).set_active_core(Some(core));
            self.on_thread_affinity_mask_changed(id);
        }
    }

    pub(crate) fn enable_core_migration(&mut self, core: CoreId) {
        let id = self.current_thread(core);
        if self.thread(id).kind == ThreadKind::Idle {
            return;
        }
        let t = self.thread_mut(id);
        if t.core_migration_disabled == 0 {
            crate::kpanic!("core migration enabled more often than disabled on {}", id);
        }
        t.core_migration_disabled -= 1;
        if t.core_migration_disabled > 0 {
            return;
        }
        let (ideal, mask) = (t.original_physical_ideal_core, t.original_physical_affinity);
        self.apply_physical_affinity(id, ideal, mask);
    }

    /// Binds the current thread of `core` to that core for its process.
    pub(crate) fn pin_current_thread(&mut self, core: CoreId) -> KResult<()> {
        let id = self.current_thread(core);
        let t = self.thread(id);
        let owner = t.owner.ok_or(KernelError::InvalidState)?;
        if t.pinned {
            return Err(KernelError::InvalidState);
        }
        if self.process(owner)?.pinned_thread(core).is_some() {
            return Err(KernelError::Busy);
        }

        self.thread_mut(id).pinned = true;
        self.process_mut(owner)?.pin_thread(core, id);
        self.disable_core_migration(core);
        self.restore_priority(id, core);

        let old = {
            let t = self.thread_mut(id);
            t.suspend_allowed.remove(SuspendType::Thread);
            t.update_suspension()
        };
        self.on_thread_state_changed(id, old);
        // Another thread of the process may have been chosen for this core.
        self.set_update_needed();
        crate::kdebug!("pin: {} on core {}", id, core);
        Ok(())
    }

    pub(crate) fn unpin_current_thread(&mut self, core: CoreId) -> KResult<()> {
        let id = self.current_thread(core);
        let t = self.thread(id);
        if !t.pinned {
            return Err(KernelError::InvalidState);
        }
        let Some(owner) = t.owner else {
            crate::kpanic!("pinned {} has no process", id);
        };

        self.thread_mut(id).pinned = false;
        self.process_mut(owner)?.unpin_thread(core, id);
        self.restore_priority(id, core);

        let old = {
            let t = self.thread_mut(id);
            t.suspend_allowed.insert(SuspendType::Thread);
            t.update_suspension()
        };
        self.on_thread_state_changed(id, old);
        self.enable_core_migration(core);
        self.set_update_needed();

        let waiters = core::mem::take(&mut self.thread_mut(id).pinned_waiters);
        for w in waiters {
            self.end_wait(w, Ok(()));
        }
        crate::kdebug!("unpin: {} on core {}", id, core);
        Ok(())
    }
}
