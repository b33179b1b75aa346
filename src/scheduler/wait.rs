//! Waiting
//!
//! A thread waits on exactly one thing at a time: a sleep, a wait queue,
//! a priority-inheriting lock, or a pinned thread's release. The wait
//! record says which, so cancelling a wait (timeout, termination, explicit
//! cancel) can unlink the thread from the right object before it becomes
//! runnable again with the given result.

use alloc::vec::Vec;

use super::error::{KResult, KernelError};
use super::table::SchedulerState;
use super::thread::{WaitKind, WaitRecord};
use super::types::{CoreId, ThreadId, ThreadState, WaitQueueId};

/// Threads blocked on a generic event, best priority first.
pub struct WaitQueue {
    pub(crate) name: &'static str,
    pub(crate) waiters: Vec<ThreadId>,
}

impl WaitQueue {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            waiters: Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

impl SchedulerState {
    /// Puts `id` to sleep on `kind`; the caller has already linked it into
    /// the object it waits on.
    pub(crate) fn begin_wait(&mut self, id: ThreadId, kind: WaitKind, deadline: Option<u64>) {
        if let Some(existing) = self.thread(id).wait {
            crate::kpanic!("{} begins {:?} while waiting on {:?}", id, kind, existing.kind);
        }
        let old = {
            let t = self.thread_mut(id);
            t.wait = Some(WaitRecord { kind, deadline });
            t.wait_result = Ok(());
            let old = t.effective_state();
            t.set_state(ThreadState::Waiting);
            old
        };
        if let Some(deadline) = deadline {
            self.timeouts.insert((deadline, id));
        }
        self.on_thread_state_changed(id, old);
    }

    /// Completes the wait of `id` with `result`. The thread must already be
    /// unlinked from the waited-on object. Returns `false` if it was not
    /// waiting.
    pub(crate) fn end_wait(&mut self, id: ThreadId, result: KResult<()>) -> bool {
        let Some(record) = self.thread_mut(id).take_wait() else {
            return false;
        };
        if let Some(deadline) = record.deadline {
            self.timeouts.remove(&(deadline, id));
        }
        let old = {
            let t = self.thread_mut(id);
            t.wait_result = result;
            let old = t.effective_state();
            t.set_state(ThreadState::Runnable);
            old
        };
        self.on_thread_state_changed(id, old);
        true
    }

    /// Unlinks `id` from whatever it waits on and wakes it with `result`.
    pub(crate) fn cancel_wait(&mut self, id: ThreadId, result: KResult<()>, core: CoreId) -> bool {
        let Some(record) = self.thread(id).wait else {
            return false;
        };
        match record.kind {
            WaitKind::Sleep => {}
            WaitKind::Lock(_) => self.remove_waiter(id, core),
            WaitKind::Queue(q) => {
                if let Some(queue) = self.wait_queues.get_mut(q.0) {
                    queue.waiters.retain(|&w| w != id);
                }
            }
            WaitKind::Unpin(target) => {
                if let Some(t) = self.threads.get_mut(target.0) {
                    t.pinned_waiters.retain(|&w| w != id);
                }
            }
        }
        self.end_wait(id, result)
    }

    pub(crate) fn create_wait_queue(&mut self, name: &'static str) -> KResult<WaitQueueId> {
        self.wait_queues
            .insert(WaitQueue::new(name))
            .map(WaitQueueId)
            .map_err(|_| KernelError::OutOfResource)
    }

    /// Links `id` into `queue` behind every waiter of equal or better
    /// priority, then waits.
    pub(crate) fn enqueue_waiter(&mut self, queue: WaitQueueId, id: ThreadId, deadline: Option<u64>) -> KResult<()> {
        let priority = self.thread(id).priority;
        let pos = {
            let Some(q) = self.wait_queues.get(queue.0) else {
                return Err(KernelError::InvalidHandle);
            };
            q.waiters
                .iter()
                .position(|&w| self.thread(w).priority > priority)
                .unwrap_or(q.waiters.len())
        };
        self.wait_queue_mut(queue)?.waiters.insert(pos, id);
        self.begin_wait(id, WaitKind::Queue(queue), deadline);
        Ok(())
    }

    pub(crate) fn wake_one(&mut self, queue: WaitQueueId) -> KResult<Option<ThreadId>> {
        let q = self.wait_queue_mut(queue)?;
        if q.waiters.is_empty() {
            return Ok(None);
        }
        let id = q.waiters.remove(0);
        self.end_wait(id, Ok(()));
        Ok(Some(id))
    }

    pub(crate) fn wake_all(&mut self, queue: WaitQueueId) -> KResult<usize> {
        let waiters = core::mem::take(&mut self.wait_queue_mut(queue)?.waiters);
        let count = waiters.len();
        for id in waiters {
            self.end_wait(id, Ok(()));
        }
        Ok(count)
    }

    /// Times out every wait whose deadline has passed.
    pub(crate) fn expire_timeouts(&mut self, core: CoreId) -> usize {
        let now = self.now;
        let expired: Vec<ThreadId> = self
            .timeouts
            .iter()
            .take_while(|&&(deadline, _)| deadline <= now)
            .map(|&(_, id)| id)
            .collect();
        for &id in &expired {
            self.cancel_wait(id, Err(KernelError::TimedOut), core);
        }
        expired.len()
    }
}
