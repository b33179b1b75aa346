//! Kernel context
//!
//! `Kernel` owns one scheduler instance for the whole system: the
//! scheduler lock, the scheduler state table and the interrupt controller.
//! There are no globals, so independent instances can coexist (one per
//! test, for example).
//!
//! Every entry point takes the `CoreId` it is called from and acts on
//! behalf of that core's current thread. A core is driven by one host
//! thread at a time.
//!
//! ## Locking
//!
//! Mutating calls take the scheduler lock, then the state mutex for the
//! duration of the change. The state mutex is released before the
//! scheduler lock, whose release performs the deferred scheduler update,
//! reschedules this core and raises IPIs for the others. IPIs requested
//! while the state is locked are queued and sent after it is released.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::config::{ConfigError, KernelConfig};
use crate::scheduler::lock::{SchedulerHooks, SchedulerLock, ScopedSchedulerLock};
use crate::scheduler::thread::{ThreadInfo, ThreadParams, WaitKind};
use crate::scheduler::{
    AddressKey, AffinityMask, CoreId, CoreMaskChange, CoreStats, IdealCore, InvariantViolation,
    KResult, KernelError, ProcessId, ProcessInfo, SchedulerState, SchedulerStats, SuspendType,
    ThreadId, ThreadKind, ThreadState, WaitQueueId,
};
use crate::smp::ipi::{InterruptController, InterruptId, SoftwareInterruptController};

pub struct Kernel {
    config: KernelConfig,
    lock: SchedulerLock,
    state: Mutex<SchedulerState>,
    interrupts: Arc<dyn InterruptController>,
}

impl SchedulerHooks for Kernel {
    fn current_thread(&self, core: CoreId) -> ThreadId {
        self.state.lock().current_thread(core)
    }

    fn disable_scheduling(&self, core: CoreId) {
        let mut state = self.state.lock();
        let cur = state.current_thread(core);
        state.thread_mut(cur).disable_dispatch_count += 1;
    }

    fn update_highest_priority_threads(&self) -> u64 {
        self.state.lock().update_highest_priority_threads()
    }

    fn enable_scheduling(&self, core: CoreId, cores_needing_scheduling: u64) {
        {
            let mut state = self.state.lock();
            let cur = state.current_thread(core);
            let count = state.thread(cur).disable_dispatch_count;
            if count > 1 {
                // Still inside an outer dispatch-disabled section; this core
                // reschedules when that ends. Other cores pick up their
                // `needs_scheduling` on their next interrupt.
                state.thread_mut(cur).disable_dispatch_count = count - 1;
            } else {
                state.reschedule_other_cores(core, cores_needing_scheduling);
                state.thread_mut(cur).disable_dispatch_count = 0;
                if state.cores[core].needs_scheduling {
                    state.schedule_impl(core);
                }
            }
        }
        self.flush_interrupts();
    }
}

impl Kernel {
    pub fn new(config: KernelConfig, interrupts: Arc<dyn InterruptController>) -> Result<Self, ConfigError> {
        config.validate()?;
        if let Some(level) = config.log_level {
            crate::logger::set_max_level(level);
        }
        let state = SchedulerState::new(config.num_cores);
        crate::kinfo!(
            "kernel: {} cores, preemption every {} ticks",
            config.num_cores,
            config.preemption_ticks
        );
        Ok(Self {
            config,
            lock: SchedulerLock::new(),
            state: Mutex::new(state),
            interrupts,
        })
    }

    /// Kernel wired to a software interrupt controller, which is returned
    /// so the host can see pending IPIs.
    pub fn with_software_interrupts(config: KernelConfig) -> Result<(Self, Arc<SoftwareInterruptController>), ConfigError> {
        let controller = Arc::new(SoftwareInterruptController::new(config.num_cores));
        let kernel = Self::new(config, controller.clone())?;
        Ok((kernel, controller))
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn num_cores(&self) -> usize {
        self.config.num_cores
    }

    fn check_core(&self, core: CoreId) {
        if core >= self.config.num_cores {
            crate::kpanic!("call from core {} on a {}-core kernel", core, self.config.num_cores);
        }
    }

    /// Runs `f` with the scheduler lock and the state held.
    fn locked<R>(&self, core: CoreId, f: impl FnOnce(&mut SchedulerState) -> R) -> R {
        self.check_core(core);
        let guard = ScopedSchedulerLock::new(&self.lock, self, core);
        let result = {
            let mut state = self.state.lock();
            f(&mut state)
        };
        drop(guard);
        result
    }

    fn flush_interrupts(&self) {
        let pending = self.state.lock().take_outgoing();
        for (irq, mask) in pending {
            self.interrupts.send_inter_processor_interrupt(irq, mask);
        }
    }

    /// Current thread of `core`, checked to be a real thread.
    fn caller(state: &SchedulerState, core: CoreId) -> KResult<ThreadId> {
        let id = state.current_thread(core);
        if state.thread(id).kind == ThreadKind::Idle {
            return Err(KernelError::InvalidState);
        }
        if state.thread(id).termination_requested {
            return Err(KernelError::TerminationRequested);
        }
        Ok(id)
    }

    /// Holds the scheduler lock until the guard is dropped.
    pub fn scheduler_lock(&self, core: CoreId) -> ScopedSchedulerLock<'_, Self> {
        self.check_core(core);
        ScopedSchedulerLock::new(&self.lock, self, core)
    }

    pub fn is_scheduler_locked(&self) -> bool {
        self.lock.is_locked()
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn current_thread(&self, core: CoreId) -> ThreadId {
        self.check_core(core);
        self.state.lock().current_thread(core)
    }

    pub fn idle_thread(&self, core: CoreId) -> ThreadId {
        self.check_core(core);
        self.state.lock().cores[core].idle_thread
    }

    /// What the ready queue would run on `core` now: the front of its
    /// highest non-empty level, or its idle thread.
    pub fn highest_priority_thread(&self, core: CoreId) -> Option<ThreadId> {
        self.check_core(core);
        self.state.lock().queue.highest_priority_thread(core)
    }

    /// Scheduled threads of `core`, highest level first.
    pub fn scheduled_threads(&self, core: CoreId) -> Vec<ThreadId> {
        self.check_core(core);
        self.state.lock().queue.scheduled_threads(core)
    }

    /// Scheduled threads of one level of `core` in queue order.
    pub fn scheduled_at(&self, core: CoreId, priority: i32) -> Vec<ThreadId> {
        self.check_core(core);
        self.state.lock().queue.scheduled_at(core, priority)
    }

    pub fn is_suggested_on(&self, id: ThreadId, core: CoreId) -> bool {
        self.state.lock().queue.is_suggested_on(id, core)
    }

    pub fn thread_info(&self, id: ThreadId) -> Option<ThreadInfo> {
        self.state.lock().try_thread(id).map(ThreadInfo::from)
    }

    pub fn wait_result(&self, id: ThreadId) -> Option<KResult<()>> {
        self.state.lock().try_thread(id).map(|t| t.wait_result)
    }

    pub fn process_info(&self, pid: ProcessId) -> Option<ProcessInfo> {
        self.state.lock().process(pid).ok().map(ProcessInfo::from)
    }

    pub fn core_stats(&self, core: CoreId) -> CoreStats {
        self.check_core(core);
        self.state.lock().core_stats(core)
    }

    pub fn stats(&self) -> SchedulerStats {
        self.state.lock().stats()
    }

    pub fn now(&self) -> u64 {
        self.state.lock().now
    }

    pub fn pending_worker_tasks(&self) -> usize {
        self.state.lock().worker.len()
    }

    /// Checks priority inheritance and ready-queue membership of every thread.
    /// Call with the scheduler lock released.
    pub fn verify_invariants(&self) -> Result<(), Vec<InvariantViolation>> {
        self.state.lock().verify_invariants()
    }

    pub fn dump(&self) {
        self.state.lock().dump();
    }

    // ========================================================================
    // Processes
    // ========================================================================

    pub fn create_process(&self, core: CoreId, name: &'static str, ideal_core: CoreId, affinity: AffinityMask) -> KResult<ProcessId> {
        let pid = self.locked(core, |st| st.create_process(name, ideal_core, affinity))?;
        crate::kinfo!("process {} '{}' created (ideal core {}, mask {:?})", pid, name, ideal_core, affinity);
        Ok(pid)
    }

    pub fn suspend_process(&self, core: CoreId, pid: ProcessId) -> KResult<()> {
        self.locked(core, |st| st.suspend_process(pid))
    }

    pub fn resume_process(&self, core: CoreId, pid: ProcessId) -> KResult<()> {
        self.locked(core, |st| st.resume_process(pid))
    }

    // ========================================================================
    // Threads
    // ========================================================================

    pub fn create_thread(&self, core: CoreId, params: ThreadParams) -> KResult<ThreadId> {
        let id = self.locked(core, |st| st.create_thread(&params))?;
        crate::kdebug!("thread {} '{}' created at priority {}", id, params.name, params.priority);
        Ok(id)
    }

    pub fn run(&self, core: CoreId, id: ThreadId) -> KResult<()> {
        self.locked(core, |st| st.run(core, id))
    }

    /// Creates and starts a thread.
    pub fn spawn(&self, core: CoreId, params: ThreadParams) -> KResult<ThreadId> {
        let id = self.create_thread(core, params)?;
        self.run(core, id)?;
        Ok(id)
    }

    pub fn close_thread(&self, core: CoreId, id: ThreadId) -> KResult<()> {
        self.locked(core, |st| st.close_thread(id))
    }

    pub fn set_priority(&self, core: CoreId, id: ThreadId, priority: i32) -> KResult<()> {
        self.locked(core, |st| st.set_priority(core, id, priority))
    }

    pub fn set_core_mask(&self, core: CoreId, id: ThreadId, ideal: IdealCore, mask: AffinityMask) -> KResult<CoreMaskChange> {
        self.locked(core, |st| st.set_core_mask(core, id, ideal, mask))
    }

    pub fn suspend_thread(&self, core: CoreId, id: ThreadId, kind: SuspendType) -> KResult<()> {
        self.locked(core, |st| st.suspend_thread(id, kind))
    }

    pub fn resume_thread(&self, core: CoreId, id: ThreadId, kind: SuspendType) -> KResult<()> {
        self.locked(core, |st| st.resume_thread(id, kind))
    }

    pub fn request_terminate(&self, core: CoreId, id: ThreadId) -> KResult<ThreadState> {
        self.locked(core, |st| st.request_terminate(core, id))
    }

    /// Terminates the current thread of `core`. Finalization follows from
    /// the worker once the core has switched away.
    pub fn exit_current_thread(&self, core: CoreId) -> KResult<ThreadId> {
        self.locked(core, |st| {
            let id = st.current_thread(core);
            if st.thread(id).kind == ThreadKind::Idle {
                return Err(KernelError::InvalidState);
            }
            Ok(st.start_termination(core))
        })
    }

    pub fn pin_current_thread(&self, core: CoreId) -> KResult<()> {
        self.locked(core, |st| st.pin_current_thread(core))
    }

    pub fn unpin_current_thread(&self, core: CoreId) -> KResult<()> {
        self.locked(core, |st| st.unpin_current_thread(core))
    }

    pub fn disable_core_migration(&self, core: CoreId) {
        self.locked(core, |st| st.disable_core_migration(core))
    }

    pub fn enable_core_migration(&self, core: CoreId) {
        self.locked(core, |st| st.enable_core_migration(core))
    }

    // ========================================================================
    // Waiting
    // ========================================================================

    /// Sleeps the current thread for `ticks`; zero yields instead.
    pub fn sleep(&self, core: CoreId, ticks: u64) -> KResult<()> {
        self.locked(core, |st| {
            let id = Self::caller(st, core)?;
            if ticks == 0 {
                st.yield_without_core_migration(core);
                return Ok(());
            }
            let deadline = st.now.saturating_add(ticks);
            st.begin_wait(id, WaitKind::Sleep, Some(deadline));
            Ok(())
        })
    }

    pub fn create_wait_queue(&self, core: CoreId, name: &'static str) -> KResult<WaitQueueId> {
        self.locked(core, |st| st.create_wait_queue(name))
    }

    /// Blocks the current thread on `queue`. A zero timeout fails at once
    /// with `TimedOut`; the final result is read with `wait_result`.
    pub fn wait_on_queue(&self, core: CoreId, queue: WaitQueueId, timeout: Option<u64>) -> KResult<()> {
        self.locked(core, |st| {
            let id = Self::caller(st, core)?;
            if timeout == Some(0) {
                return Err(KernelError::TimedOut);
            }
            let deadline = timeout.map(|t| st.now.saturating_add(t));
            st.enqueue_waiter(queue, id, deadline)
        })
    }

    pub fn wake_one(&self, core: CoreId, queue: WaitQueueId) -> KResult<Option<ThreadId>> {
        self.locked(core, |st| st.wake_one(queue))
    }

    pub fn wake_all(&self, core: CoreId, queue: WaitQueueId) -> KResult<usize> {
        self.locked(core, |st| st.wake_all(queue))
    }

    /// Interrupts the wait of `id` with `Cancelled`.
    pub fn cancel_wait(&self, core: CoreId, id: ThreadId) -> KResult<bool> {
        self.locked(core, |st| {
            st.checked_thread(id)?;
            Ok(st.cancel_wait(id, Err(KernelError::Cancelled), core))
        })
    }

    /// Blocks the current thread on the lock `owner` holds under `key`,
    /// lending it the caller's priority.
    pub fn wait_for_address(&self, core: CoreId, key: AddressKey, owner: ThreadId) -> KResult<()> {
        self.locked(core, |st| {
            let id = Self::caller(st, core)?;
            let o = st.checked_thread(owner)?;
            if owner == id || o.state == ThreadState::Terminated {
                return Err(KernelError::InvalidState);
            }
            let lock = st.add_waiter(owner, id, key, core)?;
            st.begin_wait(id, WaitKind::Lock(lock), None);
            Ok(())
        })
    }

    /// Releases the lock the current thread holds under `key` to its best
    /// waiter and wakes it.
    pub fn signal_to_address(&self, core: CoreId, key: AddressKey) -> KResult<Option<ThreadId>> {
        self.locked(core, |st| {
            let owner = st.current_thread(core);
            if st.thread(owner).kind == ThreadKind::Idle {
                return Err(KernelError::InvalidState);
            }
            let (next, _) = st.remove_waiter_by_key(owner, key, core);
            if let Some(next) = next {
                st.end_wait(next, Ok(()));
            }
            Ok(next)
        })
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    pub fn yield_without_core_migration(&self, core: CoreId) {
        self.locked(core, |st| st.yield_without_core_migration(core))
    }

    pub fn yield_with_core_migration(&self, core: CoreId) {
        self.locked(core, |st| st.yield_with_core_migration(core))
    }

    pub fn yield_to_any_thread(&self, core: CoreId) {
        self.locked(core, |st| st.yield_to_any_thread(core))
    }

    pub fn rotate_scheduled_queue(&self, core: CoreId, priority: i32) {
        self.locked(core, |st| st.rotate_scheduled_queue(core, priority))
    }

    /// Timer tick on `core`. Core 0 keeps time and expires timeouts; every
    /// core round-robins its preemption priority every `preemption_ticks`.
    pub fn handle_timer_interrupt(&self, core: CoreId) {
        let preemption_ticks = self.config.preemption_ticks;
        let priority = self.config.preemption_priorities[core];
        self.locked(core, |st| {
            if core == 0 {
                st.now += 1;
                let expired = st.expire_timeouts(core);
                if expired > 0 {
                    crate::ktrace!("timer: {} waits timed out at {}", expired, st.now);
                }
            }
            let state = &mut st.cores[core];
            state.preemption_ticks += 1;
            if preemption_ticks > 0 && state.preemption_ticks >= preemption_ticks {
                state.preemption_ticks = 0;
                st.rotate_scheduled_queue(core, priority);
            }
        });
        self.handle_dpc(core);
    }

    /// Reschedules `core` after an interrupt unless its current thread has
    /// dispatch disabled.
    pub fn handle_interrupt(&self, core: CoreId, irq: InterruptId) {
        self.check_core(core);
        crate::ktrace!("core {}: interrupt {:?}", core, irq);
        self.reschedule_current_core(core);
        self.handle_dpc(core);
    }

    /// Drains the software controller's pending interrupts for `core`.
    pub fn service_interrupts(&self, core: CoreId) -> usize {
        let mut handled = 0;
        while let Some(irq) = self.interrupts.acknowledge(core) {
            self.handle_interrupt(core, irq);
            handled += 1;
        }
        handled
    }

    pub fn reschedule_current_core(&self, core: CoreId) {
        self.check_core(core);
        {
            let mut state = self.state.lock();
            let cur = state.current_thread(core);
            if state.thread(cur).disable_dispatch_count == 0 && state.cores[core].needs_scheduling {
                state.schedule_impl(core);
            }
        }
        self.flush_interrupts();
    }

    /// Deferred procedure call on `core`: exits the current thread if its
    /// termination was requested, then runs worker tasks.
    pub fn handle_dpc(&self, core: CoreId) {
        self.check_core(core);
        let exit = {
            let state = self.state.lock();
            let t = state.thread(state.current_thread(core));
            t.kind != ThreadKind::Idle && t.termination_requested && t.state != ThreadState::Terminated
        };
        if exit {
            self.locked(core, |st| st.start_termination(core));
        }
        self.run_worker_tasks(core);
    }

    /// Runs up to `worker_batch` worker tasks (all when zero).
    pub fn run_worker_tasks(&self, core: CoreId) -> usize {
        let limit = match self.config.worker_batch {
            0 => usize::MAX,
            n => n,
        };
        let pending = !self.state.lock().worker.is_empty();
        if !pending {
            return 0;
        }
        self.locked(core, |st| st.run_worker_tasks(limit))
    }

    pub fn disable_dispatch(&self, core: CoreId) {
        self.check_core(core);
        let mut state = self.state.lock();
        let cur = state.current_thread(core);
        state.thread_mut(cur).disable_dispatch_count += 1;
    }

    /// Re-enables dispatch; reschedules if this was the outermost level and
    /// a reschedule is pending.
    pub fn enable_dispatch(&self, core: CoreId) {
        self.check_core(core);
        {
            let mut state = self.state.lock();
            let cur = state.current_thread(core);
            let t = state.thread_mut(cur);
            if t.disable_dispatch_count == 0 {
                crate::kpanic!("dispatch enabled more often than disabled on core {}", core);
            }
            t.disable_dispatch_count -= 1;
        }
        self.reschedule_current_core(core);
    }
}
