//! Scheduler statistics and debugging functions
//!
//! Snapshots of per-core counters, a thread table dump for the log, and a
//! consistency check of the priority and ready-queue invariants that tests
//! and debug builds run at quiescent points.

use alloc::vec::Vec;

use super::select::CoreState;
use super::table::SchedulerState;
use super::types::{CoreId, ThreadId, ThreadKind, ThreadState, PINNED_THREAD_PRIORITY};

/// Snapshot of one core's scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoreStats {
    pub core: CoreId,
    pub current_thread: ThreadId,
    pub idle_thread: ThreadId,
    pub highest_priority_thread: Option<ThreadId>,
    pub prev_thread: Option<ThreadId>,
    pub needs_scheduling: bool,
    pub last_context_switch_tick: u64,
    pub context_switches: u64,
    pub idle_switches: u64,
}

impl From<&CoreState> for CoreStats {
    fn from(c: &CoreState) -> Self {
        Self {
            core: c.core,
            current_thread: c.current_thread,
            idle_thread: c.idle_thread,
            highest_priority_thread: c.highest_priority_thread,
            prev_thread: c.prev_thread,
            needs_scheduling: c.needs_scheduling,
            last_context_switch_tick: c.last_context_switch_tick,
            context_switches: c.context_switches,
            idle_switches: c.idle_switches,
        }
    }
}

/// Totals over every core.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub threads: usize,
    pub ready_threads: usize,
    pub waiting_threads: usize,
    pub locks: usize,
    pub pending_timeouts: usize,
    pub pending_worker_tasks: usize,
    pub total_context_switches: u64,
    pub total_idle_switches: u64,
}

/// A broken scheduler invariant found by [`SchedulerState::verify_invariants`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvariantViolation {
    /// Priority differs from base priority combined with inherited ones
    /// and the pin floor.
    Priority { thread: ThreadId, priority: i32, expected: i32 },
    /// A ready thread is not scheduled on exactly one core.
    ReadyPlacement { thread: ThreadId, scheduled_on: u32 },
    /// A thread that is not ready is still queued.
    QueuedNotReady { thread: ThreadId },
    /// Scheduled on a core outside the physical affinity mask.
    OutsideAffinity { thread: ThreadId, core: CoreId },
}

fn state_str(state: ThreadState) -> &'static str {
    match state {
        ThreadState::Initialized => "Init",
        ThreadState::Runnable => "Runnable",
        ThreadState::Waiting => "Waiting",
        ThreadState::Terminated => "Terminated",
    }
}

impl SchedulerState {
    pub(crate) fn core_stats(&self, core: CoreId) -> CoreStats {
        CoreStats::from(&self.cores[core])
    }

    pub(crate) fn stats(&self) -> SchedulerStats {
        let mut stats = SchedulerStats {
            locks: self.locks.len(),
            pending_timeouts: self.timeouts.len(),
            pending_worker_tasks: self.worker.len(),
            ..SchedulerStats::default()
        };
        for (_, t) in self.threads.iter() {
            if t.kind == ThreadKind::Idle {
                continue;
            }
            stats.threads += 1;
            if t.is_ready() {
                stats.ready_threads += 1;
            }
            if t.state == ThreadState::Waiting {
                stats.waiting_threads += 1;
            }
        }
        for c in &self.cores {
            stats.total_context_switches += c.context_switches;
            stats.total_idle_switches += c.idle_switches;
        }
        stats
    }

    /// Logs every thread, then the per-core state.
    pub(crate) fn dump(&self) {
        crate::kinfo!("=== Thread List ===");
        crate::kinfo!(
            "{:<6} {:<12} {:<10} {:<4} {:<4} {:<6} {:<10} {:<8}",
            "ID", "Name", "State", "Prio", "Base", "Core", "CpuTicks", "Locks"
        );
        for (_, t) in self.threads.iter() {
            if t.kind == ThreadKind::Idle {
                continue;
            }
            crate::kinfo!(
                "{:<6} {:<12} {:<10} {:<4} {:<4} {:<6?} {:<10} {:<8}",
                t.id,
                t.name,
                state_str(t.state),
                t.priority,
                t.base_priority,
                t.active_core,
                t.cpu_ticks,
                t.held_locks.len()
            );
        }
        crate::kinfo!("=== Cores ===");
        for c in &self.cores {
            crate::kinfo!(
                "core {}: current {} highest {:?} switches {} idle {}",
                c.core,
                c.current_thread,
                c.highest_priority_thread,
                c.context_switches,
                c.idle_switches
            );
        }
    }

    /// Checks the priority inheritance rule and ready-queue membership of
    /// every thread. Only meaningful with the scheduler lock released.
    pub(crate) fn verify_invariants(&self) -> Result<(), Vec<InvariantViolation>> {
        let mut violations = Vec::new();

        for (_, t) in self.threads.iter() {
            if t.kind == ThreadKind::Idle {
                continue;
            }

            let mut expected = t.base_priority;
            if t.pinned {
                expected = expected.min(PINNED_THREAD_PRIORITY);
            }
            for &lock in &t.held_locks {
                if let Some(w) = self.lock_info(lock).highest_priority_waiter() {
                    expected = expected.min(self.thread(w).priority);
                }
            }
            if t.priority != expected {
                violations.push(InvariantViolation::Priority {
                    thread: t.id,
                    priority: t.priority,
                    expected,
                });
            }

            let scheduled_on = (0..self.num_cores)
                .filter(|&c| self.queue.is_scheduled_on(t.id, c))
                .count() as u32;
            if t.is_ready() {
                // Threads that yielded to any core have no active core and
                // live only in suggested lists until someone takes them.
                let expected_slots = if t.active_core.is_some() { 1 } else { 0 };
                if scheduled_on != expected_slots {
                    violations.push(InvariantViolation::ReadyPlacement { thread: t.id, scheduled_on });
                }
                if let Some(core) = t.active_core {
                    if !t.physical_affinity.contains(core) {
                        violations.push(InvariantViolation::OutsideAffinity { thread: t.id, core });
                    }
                }
            } else if self.queue.contains(t.id) {
                violations.push(InvariantViolation::QueuedNotReady { thread: t.id });
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}
