//! Priority inheritance
//!
//! Each address-keyed lock with waiters has a [`LockInfo`] owned by the
//! holder (listed in its `held_locks`). Waiters are kept ordered by
//! priority, FIFO among equals. A holder's priority is the best of its base
//! priority and the first waiter of every lock it holds; when that changes
//! the holder is re-ranked in the waiter list of whatever lock it is
//! itself waiting on, and the walk continues with that lock's owner.

use alloc::vec::Vec;

use super::error::{KResult, KernelError};
use super::table::SchedulerState;
use super::types::{AddressKey, CoreId, LockId, ThreadId, PINNED_THREAD_PRIORITY};

pub struct LockInfo {
    pub(crate) key: AddressKey,
    pub(crate) owner: ThreadId,
    pub(crate) waiters: Vec<ThreadId>,
}

impl LockInfo {
    fn new(key: AddressKey, owner: ThreadId) -> Self {
        Self {
            key,
            owner,
            waiters: Vec::new(),
        }
    }

    pub fn key(&self) -> AddressKey {
        self.key
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    pub fn highest_priority_waiter(&self) -> Option<ThreadId> {
        self.waiters.first().copied()
    }
}

impl SchedulerState {
    fn find_held_lock(&self, owner: ThreadId, key: AddressKey) -> Option<LockId> {
        self.thread(owner)
            .held_locks
            .iter()
            .copied()
            .find(|&l| self.lock_info(l).key == key)
    }

    /// Inserts `waiter` behind every waiter of equal or better priority.
    fn insert_waiter(&mut self, lock: LockId, waiter: ThreadId) {
        let priority = self.thread(waiter).priority;
        let pos = {
            let info = self.lock_info(lock);
            info.waiters
                .iter()
                .position(|&w| self.thread(w).priority > priority)
                .unwrap_or(info.waiters.len())
        };
        self.lock_info_mut(lock).waiters.insert(pos, waiter);
    }

    fn detach_waiter(&mut self, lock: LockId, waiter: ThreadId) {
        let info = self.lock_info_mut(lock);
        match info.waiters.iter().position(|&w| w == waiter) {
            Some(pos) => {
                info.waiters.remove(pos);
            }
            None => crate::kpanic!("{} is not waiting on lock {:?}", waiter, lock),
        }
    }

    /// Adds `waiter` to the lock `owner` holds under `key`, creating the
    /// lock record on first use.
    pub(crate) fn add_waiter(&mut self, owner: ThreadId, waiter: ThreadId, key: AddressKey, core: CoreId) -> KResult<LockId> {
        if self.thread(waiter).waiting_lock.is_some() {
            crate::kpanic!("{} is already waiting on a lock", waiter);
        }

        let lock = match self.find_held_lock(owner, key) {
            Some(lock) => lock,
            None => {
                let index = self
                    .locks
                    .insert(LockInfo::new(key, owner))
                    .map_err(|_| KernelError::OutOfResource)?;
                let lock = LockId(index);
                self.thread_mut(owner).add_held_lock(lock);
                lock
            }
        };

        self.insert_waiter(lock, waiter);
        {
            let t = self.thread_mut(waiter);
            t.waiting_lock = Some(lock);
            t.address_key = Some(key);
        }

        if self.thread(waiter).priority < self.thread(owner).priority {
            self.restore_priority(owner, core);
        }
        Ok(lock)
    }

    fn remove_waiter_impl(&mut self, waiter: ThreadId) -> Option<ThreadId> {
        let lock = self.thread(waiter).waiting_lock?;
        let owner = self.lock_info(lock).owner;

        self.detach_waiter(lock, waiter);
        {
            let t = self.thread_mut(waiter);
            t.waiting_lock = None;
            t.address_key = None;
        }

        if self.lock_info(lock).waiters.is_empty() {
            self.thread_mut(owner).remove_held_lock(lock);
            if self.locks.remove(lock.0).is_none() {
                crate::kpanic!("lock {:?} freed twice", lock);
            }
        }
        Some(owner)
    }

    /// Takes `waiter` off its lock and drops any priority it lent.
    pub(crate) fn remove_waiter(&mut self, waiter: ThreadId, core: CoreId) {
        let waiter_priority = self.thread(waiter).priority;
        let Some(owner) = self.remove_waiter_impl(waiter) else {
            return;
        };
        let o = self.thread(owner);
        if o.priority == waiter_priority && o.priority < o.base_priority {
            self.restore_priority(owner, core);
        }
    }

    /// Hands the lock `owner` holds under `key` to its best waiter, which
    /// inherits the remaining waiters. Returns that waiter and whether any
    /// are left behind it.
    pub(crate) fn remove_waiter_by_key(&mut self, owner: ThreadId, key: AddressKey, core: CoreId) -> (Option<ThreadId>, bool) {
        let Some(lock) = self.find_held_lock(owner, key) else {
            return (None, false);
        };
        let Some(next) = self.lock_info(lock).highest_priority_waiter() else {
            crate::kpanic!("lock {:?} is held with no waiters", lock);
        };

        let has_waiters = self.lock_info(lock).waiters.len() > 1;
        self.thread_mut(owner).remove_held_lock(lock);
        if has_waiters {
            self.detach_waiter(lock, next);
            self.lock_info_mut(lock).owner = next;
            self.thread_mut(next).add_held_lock(lock);
        } else if self.locks.remove(lock.0).is_none() {
            crate::kpanic!("lock {:?} freed twice", lock);
        }
        {
            let t = self.thread_mut(next);
            t.waiting_lock = None;
            t.address_key = None;
        }

        let next_priority = self.thread(next).priority;
        let o = self.thread(owner);
        if o.priority == next_priority && o.priority < o.base_priority {
            self.restore_priority(owner, core);
        }
        if has_waiters {
            // The new owner may now inherit from the waiters it took over.
            self.restore_priority(next, core);
        }

        crate::kdebug!("lock {:#x}: {} -> {} (waiters left: {})", key, owner, next, has_waiters);
        (Some(next), has_waiters)
    }

    /// Recomputes `id`'s priority and propagates the change up the chain of
    /// lock owners it waits on.
    pub(crate) fn restore_priority(&mut self, id: ThreadId, core: CoreId) {
        let mut thread = id;
        loop {
            let mut new_priority = self.thread(thread).base_priority;
            if self.thread(thread).pinned {
                new_priority = new_priority.min(PINNED_THREAD_PRIORITY);
            }
            for &lock in &self.thread(thread).held_locks {
                if let Some(w) = self.lock_info(lock).highest_priority_waiter() {
                    new_priority = new_priority.min(self.thread(w).priority);
                }
            }

            let old_priority = self.thread(thread).priority;
            if new_priority == old_priority {
                return;
            }

            // Keep the waiter list ordered while the priority moves.
            let waiting_lock = self.thread(thread).waiting_lock;
            if let Some(lock) = waiting_lock {
                self.detach_waiter(lock, thread);
            }
            self.thread_mut(thread).set_priority(new_priority);
            if let Some(lock) = waiting_lock {
                self.insert_waiter(lock, thread);
            }

            self.on_thread_priority_changed(thread, old_priority, core);
            crate::ktrace!("priority: {} {} -> {}", thread, old_priority, new_priority);

            match waiting_lock {
                Some(lock) => thread = self.lock_info(lock).owner,
                None => return,
            }
        }
    }

    pub(crate) fn set_base_priority(&mut self, id: ThreadId, priority: i32, core: CoreId) {
        self.thread_mut(id).base_priority = priority;
        self.restore_priority(id, core);
    }

    /// Every lock `id` holds loses its owner; the waiters are handed back.
    pub(crate) fn release_held_locks(&mut self, id: ThreadId) -> Vec<ThreadId> {
        let mut woken = Vec::new();
        let held = core::mem::take(&mut self.thread_mut(id).held_locks);
        for lock in held {
            let Some(info) = self.locks.remove(lock.0) else {
                crate::kpanic!("held lock {:?} already freed", lock);
            };
            for w in info.waiters {
                let t = self.thread_mut(w);
                t.waiting_lock = None;
                t.address_key = None;
                woken.push(w);
            }
        }
        woken
    }
}
