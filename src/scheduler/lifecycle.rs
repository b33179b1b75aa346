//! Thread and process lifecycle
//!
//! ## Termination
//!
//! 1. `request_terminate` marks the thread, lifts its suspension, raises a
//!    user priority to `TERMINATING_THREAD_PRIORITY`, interrupts any other
//!    core running it and cancels its wait.
//! 2. The thread notices on its own core (`Kernel::handle_dpc`) and runs
//!    `start_termination`: it gives up its pin and held locks, becomes
//!    `Terminated` and queues a `FinishTermination` worker task.
//! 3. The worker finalizes it once no core has it as the current thread.

use super::error::{KResult, KernelError};
use super::process::Process;
use super::table::SchedulerState;
use super::thread::{Thread, ThreadParams};
use super::types::{
    is_valid_priority, AffinityMask, CoreId, ProcessId, SuspendType, ThreadId, ThreadKind,
    ThreadState, SYSTEM_THREAD_PRIORITY_HIGHEST, TERMINATING_THREAD_PRIORITY,
};
use super::worker::WorkerTask;

impl SchedulerState {
    // ========================================================================
    // Processes
    // ========================================================================

    pub(crate) fn create_process(&mut self, name: &'static str, ideal_core: CoreId, affinity: AffinityMask) -> KResult<ProcessId> {
        self.check_core(ideal_core)?;
        if affinity.is_empty() || !affinity.contains(ideal_core) {
            return Err(KernelError::InvalidCombination);
        }
        let num_cores = self.num_cores;
        let index = self
            .processes
            .insert_with(|i| Process::new(ProcessId(i), name, ideal_core, affinity, num_cores))
            .map_err(|_| KernelError::OutOfResource)?;
        Ok(ProcessId(index))
    }

    fn set_process_suspended(&mut self, pid: ProcessId, suspended: bool) -> KResult<()> {
        let process = self.process_mut(pid)?;
        if process.suspended == suspended {
            return Err(KernelError::InvalidState);
        }
        process.suspended = suspended;
        let threads = process.threads.clone();
        for id in threads {
            let old = {
                let t = self.thread_mut(id);
                if suspended {
                    t.request_suspend(SuspendType::Process);
                } else {
                    t.clear_suspend_request(SuspendType::Process);
                }
                t.update_suspension()
            };
            self.on_thread_state_changed(id, old);
        }
        Ok(())
    }

    pub(crate) fn suspend_process(&mut self, pid: ProcessId) -> KResult<()> {
        self.set_process_suspended(pid, true)
    }

    pub(crate) fn resume_process(&mut self, pid: ProcessId) -> KResult<()> {
        self.set_process_suspended(pid, false)
    }

    // ========================================================================
    // Creation and start
    // ========================================================================

    pub(crate) fn create_thread(&mut self, params: &ThreadParams) -> KResult<ThreadId> {
        if params.kind == ThreadKind::Idle {
            return Err(KernelError::InvalidCombination);
        }
        if !is_valid_priority(params.priority) {
            return Err(KernelError::InvalidPriority);
        }
        self.check_core(params.ideal_core)?;
        let valid = AffinityMask::all(self.num_cores).bits();
        if params.affinity.is_empty() || params.affinity.bits() & !valid != 0 {
            return Err(KernelError::InvalidCombination);
        }
        if !params.affinity.contains(params.ideal_core) {
            return Err(KernelError::InvalidCombination);
        }
        match (params.kind, params.owner) {
            (ThreadKind::User, Some(owner)) => {
                self.process(owner)?;
            }
            (ThreadKind::Kernel, None) => {}
            _ => return Err(KernelError::InvalidCombination),
        }

        let index = self
            .threads
            .insert_with(|i| Thread::new(ThreadId(i), params))
            .map_err(|_| KernelError::OutOfResource)?;
        Ok(ThreadId(index))
    }

    /// `core` is the calling core.
    pub(crate) fn run(&mut self, core: CoreId, id: ThreadId) -> KResult<()> {
        let t = self.checked_thread(id)?;
        if t.state != ThreadState::Initialized {
            return Err(KernelError::InvalidState);
        }
        let caller = self.current_thread(core);
        if self.thread(caller).termination_requested {
            return Err(KernelError::TerminationRequested);
        }

        if let Some(owner) = t.owner {
            let process = self.process_mut(owner)?;
            process.register_thread(id);
            if process.suspended {
                self.thread_mut(id).request_suspend(SuspendType::Process);
            }
        }

        let old = {
            let t = self.thread_mut(id);
            t.acquire_reference();
            let old = t.effective_state();
            t.set_state(ThreadState::Runnable);
            t.update_suspension();
            old
        };
        self.on_thread_state_changed(id, old);
        Ok(())
    }

    /// Base priority change from outside the inheritance machinery.
    pub(crate) fn set_priority(&mut self, core: CoreId, id: ThreadId, priority: i32) -> KResult<()> {
        self.checked_thread(id)?;
        if !is_valid_priority(priority) {
            return Err(KernelError::InvalidPriority);
        }
        self.set_base_priority(id, priority, core);
        Ok(())
    }

    // ========================================================================
    // Suspension
    // ========================================================================

    pub(crate) fn suspend_thread(&mut self, id: ThreadId, kind: SuspendType) -> KResult<()> {
        let t = self.checked_thread(id)?;
        if t.is_suspend_requested(kind) {
            return Err(KernelError::InvalidState);
        }
        if t.termination_requested {
            return Err(KernelError::TerminationRequested);
        }
        let old = {
            let t = self.thread_mut(id);
            t.request_suspend(kind);
            t.update_suspension()
        };
        self.on_thread_state_changed(id, old);
        Ok(())
    }

    pub(crate) fn resume_thread(&mut self, id: ThreadId, kind: SuspendType) -> KResult<()> {
        let t = self.checked_thread(id)?;
        if !t.is_suspend_requested(kind) {
            return Err(KernelError::InvalidState);
        }
        let old = {
            let t = self.thread_mut(id);
            t.clear_suspend_request(kind);
            t.update_suspension()
        };
        self.on_thread_state_changed(id, old);
        Ok(())
    }

    // ========================================================================
    // Termination
    // ========================================================================

    pub(crate) fn request_terminate(&mut self, core: CoreId, id: ThreadId) -> KResult<ThreadState> {
        let t = self.checked_thread(id)?;
        if t.termination_requested || t.state == ThreadState::Terminated {
            return Ok(t.state);
        }

        self.thread_mut(id).termination_requested = true;

        if self.thread(id).state == ThreadState::Initialized {
            let t = self.thread_mut(id);
            t.set_state(ThreadState::Terminated);
            t.finalized = true;
            crate::kdebug!("terminate: {} never ran", id);
            return Ok(ThreadState::Terminated);
        }

        if self.thread(id).base_priority >= SYSTEM_THREAD_PRIORITY_HIGHEST {
            self.set_base_priority(id, TERMINATING_THREAD_PRIORITY, core);
        }

        let old = self.thread_mut(id).update_suspension();
        self.on_thread_state_changed(id, old);

        if let Some(running) = self.running_core(id) {
            if running != core {
                self.send_interrupt(crate::smp::ipi::InterruptId::ThreadTerminate, 1u64 << running);
            }
        }

        if self.thread(id).state == ThreadState::Waiting {
            self.cancel_wait(id, Err(KernelError::TerminationRequested), core);
        }

        crate::kdebug!("terminate: requested for {}", id);
        Ok(self.thread(id).state)
    }

    /// Exit path of the current thread of `core`.
    pub(crate) fn start_termination(&mut self, core: CoreId) -> ThreadId {
        let id = self.current_thread(core);
        if self.thread(id).kind == ThreadKind::Idle {
            crate::kpanic!("idle thread of core {} tried to exit", core);
        }

        if self.thread(id).pinned {
            if let Err(err) = self.unpin_current_thread(core) {
                crate::kwarn!("terminate: unpin of {} failed: {}", id, err);
            }
        }

        if self.thread(id).wait.is_some() {
            self.cancel_wait(id, Err(KernelError::TerminationRequested), core);
        }
        for waiter in self.release_held_locks(id) {
            self.end_wait(waiter, Err(KernelError::InvalidState));
        }
        self.restore_priority(id, core);
        let pinned_waiters = core::mem::take(&mut self.thread_mut(id).pinned_waiters);
        for waiter in pinned_waiters {
            self.end_wait(waiter, Ok(()));
        }

        let old = {
            let t = self.thread_mut(id);
            t.termination_requested = true;
            let old = t.effective_state();
            t.set_state(ThreadState::Terminated);
            old
        };
        self.on_thread_state_changed(id, old);
        self.worker.push(WorkerTask::FinishTermination(id));
        crate::kdebug!("terminate: {} exited on core {}", id, core);
        id
    }

    /// Returns `false` while some core still has `id` as its current thread.
    pub(crate) fn finish_termination(&mut self, id: ThreadId) -> bool {
        if self.is_current_on_any_core(id) {
            return false;
        }
        if let Some(owner) = self.thread(id).owner {
            if let Ok(process) = self.process_mut(owner) {
                process.unregister_thread(id);
            }
        }
        let last = {
            let t = self.thread_mut(id);
            t.finalized = true;
            t.release_reference()
        };
        if last {
            self.threads.remove(id.0);
        }
        crate::ktrace!("terminate: {} finalized", id);
        true
    }

    /// Runs up to `limit` worker tasks; stops at the first one that has to
    /// wait.
    pub(crate) fn run_worker_tasks(&mut self, limit: usize) -> usize {
        let mut done = 0;
        while done < limit {
            let Some(task) = self.worker.pop() else {
                break;
            };
            let finished = match task {
                WorkerTask::FinishTermination(id) => self.finish_termination(id),
            };
            if !finished {
                self.worker.defer(task);
                break;
            }
            done += 1;
        }
        done
    }

    /// Drops the creator's reference.
    pub(crate) fn close_thread(&mut self, id: ThreadId) -> KResult<()> {
        self.checked_thread(id)?;
        if self.thread_mut(id).release_reference() {
            if self.thread(id).state != ThreadState::Terminated && self.thread(id).state != ThreadState::Initialized {
                crate::kpanic!("{} released while {:?}", id, self.thread(id).state);
            }
            self.threads.remove(id.0);
        }
        Ok(())
    }
}
