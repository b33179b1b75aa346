//! Scheduler state table
//!
//! Everything the scheduler knows lives in one `SchedulerState`: the thread,
//! lock, wait-queue and process slabs, the ready queues, per-core state,
//! pending timeouts and deferred work. `Kernel` keeps it behind a
//! `spin::Mutex`; every mutation happens with the scheduler lock held as
//! well.
//!
//! The algorithms are split by concern across `core`, `priority`, `wait`,
//! `affinity` and `lifecycle`, each adding an `impl SchedulerState` block.

use alloc::collections::BTreeSet;
use alloc::vec::Vec;

use crate::smp::ipi::InterruptId;

use super::select::CoreState;
use super::error::{KResult, KernelError};
use super::priority::LockInfo;
use super::process::Process;
use super::queue::{Placement, PriorityQueue};
use super::slab::Slab;
use super::thread::{Thread, ThreadParams};
use super::types::{
    AffinityMask, CoreId, LockId, ProcessId, ThreadId, ThreadKind, ThreadState, WaitQueueId,
    IDLE_THREAD_PRIORITY,
};
use super::wait::WaitQueue;
use super::worker::WorkerTaskQueue;

pub const MAX_THREADS: usize = 4096;
pub const MAX_LOCKS: usize = 4096;
pub const MAX_WAIT_QUEUES: usize = 1024;
pub const MAX_PROCESSES: usize = 256;

pub struct SchedulerState {
    pub(crate) num_cores: usize,
    pub(crate) threads: Slab<Thread>,
    pub(crate) locks: Slab<LockInfo>,
    pub(crate) wait_queues: Slab<WaitQueue>,
    pub(crate) processes: Slab<Process>,
    pub(crate) queue: PriorityQueue,
    pub(crate) cores: Vec<CoreState>,
    /// Set by any change that may alter a core's highest-priority thread.
    pub(crate) update_needed: bool,
    /// `(deadline, thread)` for every timed wait.
    pub(crate) timeouts: BTreeSet<(u64, ThreadId)>,
    pub(crate) now: u64,
    pub(crate) worker: WorkerTaskQueue,
    /// Interrupts requested while the state was locked; delivered once it
    /// is released.
    pub(crate) outgoing: Vec<(InterruptId, u64)>,
}

impl SchedulerState {
    pub(crate) fn new(num_cores: usize) -> Self {
        let mut state = Self {
            num_cores,
            threads: Slab::with_limit(MAX_THREADS + num_cores),
            locks: Slab::with_limit(MAX_LOCKS),
            wait_queues: Slab::with_limit(MAX_WAIT_QUEUES),
            processes: Slab::with_limit(MAX_PROCESSES),
            queue: PriorityQueue::new(num_cores),
            cores: Vec::with_capacity(num_cores),
            update_needed: false,
            timeouts: BTreeSet::new(),
            now: 0,
            worker: WorkerTaskQueue::new(),
            outgoing: Vec::new(),
        };

        for core in 0..num_cores {
            let idle = state.spawn_idle_thread(core);
            state.cores.push(CoreState::new(core, idle));
            state.queue.set_idle_thread(core, idle);
        }
        state
    }

    fn spawn_idle_thread(&mut self, core: CoreId) -> ThreadId {
        let params = ThreadParams {
            name: "idle",
            kind: ThreadKind::Idle,
            owner: None,
            priority: IDLE_THREAD_PRIORITY,
            ideal_core: core,
            affinity: AffinityMask::single(core),
        };
        // Idle threads are created before anything else; the slab cannot be full.
        let index = match self.threads.insert_with(|i| Thread::new(ThreadId(i), &params)) {
            Ok(index) => index,
            Err(_) => crate::kpanic!("no room for idle thread of core {}", core),
        };
        let id = ThreadId(index);
        // Idle threads are always runnable but never queued.
        self.thread_mut(id).set_state(ThreadState::Runnable);
        id
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    #[inline]
    pub(crate) fn try_thread(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.get(id.0)
    }

    pub(crate) fn thread(&self, id: ThreadId) -> &Thread {
        match self.threads.get(id.0) {
            Some(t) => t,
            None => crate::kpanic!("dangling thread id {}", id),
        }
    }

    pub(crate) fn thread_mut(&mut self, id: ThreadId) -> &mut Thread {
        match self.threads.get_mut(id.0) {
            Some(t) => t,
            None => crate::kpanic!("dangling thread id {}", id),
        }
    }

    /// Lookup for ids that come from callers rather than from the
    /// scheduler's own links.
    pub(crate) fn checked_thread(&self, id: ThreadId) -> KResult<&Thread> {
        match self.threads.get(id.0) {
            Some(t) if t.kind != ThreadKind::Idle => Ok(t),
            _ => Err(KernelError::InvalidHandle),
        }
    }

    pub(crate) fn lock_info(&self, id: LockId) -> &LockInfo {
        match self.locks.get(id.0) {
            Some(l) => l,
            None => crate::kpanic!("dangling lock id {:?}", id),
        }
    }

    pub(crate) fn lock_info_mut(&mut self, id: LockId) -> &mut LockInfo {
        match self.locks.get_mut(id.0) {
            Some(l) => l,
            None => crate::kpanic!("dangling lock id {:?}", id),
        }
    }

    pub(crate) fn process(&self, id: ProcessId) -> KResult<&Process> {
        self.processes.get(id.0).ok_or(KernelError::InvalidHandle)
    }

    pub(crate) fn process_mut(&mut self, id: ProcessId) -> KResult<&mut Process> {
        self.processes.get_mut(id.0).ok_or(KernelError::InvalidHandle)
    }

    pub(crate) fn wait_queue_mut(&mut self, id: WaitQueueId) -> KResult<&mut WaitQueue> {
        self.wait_queues.get_mut(id.0).ok_or(KernelError::InvalidHandle)
    }

    #[inline]
    pub(crate) fn current_thread(&self, core: CoreId) -> ThreadId {
        self.cores[core].current_thread
    }

    pub(crate) fn check_core(&self, core: CoreId) -> KResult<()> {
        if core < self.num_cores {
            Ok(())
        } else {
            Err(KernelError::InvalidCoreId)
        }
    }

    /// Core on which `id` is the current thread, if any.
    pub(crate) fn running_core(&self, id: ThreadId) -> Option<CoreId> {
        self.cores.iter().position(|c| c.current_thread == id)
    }

    pub(crate) fn is_current_on_any_core(&self, id: ThreadId) -> bool {
        self.running_core(id).is_some()
    }

    pub(crate) fn placement_of(&self, id: ThreadId) -> Placement {
        let t = self.thread(id);
        Placement {
            priority: t.priority,
            active_core: t.active_core,
            affinity: t.physical_affinity,
        }
    }

    // ------------------------------------------------------------------
    // Flags and interrupts
    // ------------------------------------------------------------------

    #[inline]
    pub(crate) fn set_update_needed(&mut self) {
        self.update_needed = true;
    }

    pub(crate) fn send_interrupt(&mut self, irq: InterruptId, core_mask: u64) {
        if core_mask != 0 {
            self.outgoing.push((irq, core_mask));
        }
    }

    pub(crate) fn take_outgoing(&mut self) -> Vec<(InterruptId, u64)> {
        core::mem::take(&mut self.outgoing)
    }

    pub(crate) fn increment_scheduled_count(&mut self, id: ThreadId) {
        self.thread_mut(id).scheduled_count += 1;
    }
}
