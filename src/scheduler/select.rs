//! Scheduling decisions
//!
//! ## Deferred update
//!
//! Operations under the scheduler lock only edit the ready queues and set
//! `update_needed`. When the lock is released to depth zero,
//! [`SchedulerState::update_highest_priority_threads`] picks each core's
//! next thread in one pass and returns the mask of cores whose choice
//! changed. The releasing core then interrupts the others and reschedules
//! itself.
//!
//! ## Idle-core migration
//!
//! A core with nothing scheduled pulls the first suggestion that is not
//! the chosen thread of its own core. If every suggestion is some core's
//! chosen thread, the second pass takes one from a candidate core that has
//! something else to run. Threads chosen at a priority numerically below
//! `HIGHEST_CORE_MIGRATION_ALLOWED_PRIORITY` are never taken.

use alloc::vec;
use alloc::vec::Vec;

use super::table::SchedulerState;
use super::thread::EffectiveState;
use super::types::{CoreId, ThreadId, HIGHEST_CORE_MIGRATION_ALLOWED_PRIORITY};

/// Per-core scheduler bookkeeping.
pub struct CoreState {
    pub(crate) core: CoreId,
    pub(crate) needs_scheduling: bool,
    pub(crate) highest_priority_thread: Option<ThreadId>,
    pub(crate) idle_thread: ThreadId,
    pub(crate) current_thread: ThreadId,
    pub(crate) prev_thread: Option<ThreadId>,
    pub(crate) last_context_switch_tick: u64,
    pub(crate) context_switches: u64,
    pub(crate) idle_switches: u64,
    pub(crate) preemption_ticks: u64,
}

impl CoreState {
    pub(crate) fn new(core: CoreId, idle: ThreadId) -> Self {
        Self {
            core,
            needs_scheduling: false,
            highest_priority_thread: None,
            idle_thread: idle,
            current_thread: idle,
            prev_thread: None,
            last_context_switch_tick: 0,
            context_switches: 0,
            idle_switches: 0,
            preemption_ticks: 0,
        }
    }
}

impl SchedulerState {
    // ========================================================================
    // Highest priority thread selection
    // ========================================================================

    fn update_highest_priority_thread(&mut self, core: CoreId, highest: Option<ThreadId>) -> u64 {
        let prev = self.cores[core].highest_priority_thread;
        if prev == highest {
            return 0;
        }
        if let Some(prev) = prev {
            if self.try_thread(prev).is_some() {
                let now = self.now;
                let t = self.thread_mut(prev);
                t.scheduled_count += 1;
                t.last_scheduled_tick = now;
            }
        }
        let state = &mut self.cores[core];
        state.highest_priority_thread = highest;
        state.needs_scheduling = true;
        1u64 << core
    }

    /// Recomputes every core's next thread. Returns the cores whose choice
    /// changed.
    pub(crate) fn update_highest_priority_threads(&mut self) -> u64 {
        if !self.update_needed {
            return 0;
        }
        self.update_needed = false;

        let num_cores = self.num_cores;
        let mut cores_needing_scheduling = 0u64;
        let mut idle_cores = 0u64;
        let mut top_threads: Vec<Option<ThreadId>> = vec![None; num_cores];

        for core in 0..num_cores {
            let mut top = self.queue.scheduled_front(core);
            match top {
                Some(id) => {
                    // A thread pinned to this core wins over the rest of its process.
                    if let Some(owner) = self.thread(id).owner {
                        let pinned = self.process(owner).ok().and_then(|p| p.pinned_thread(core));
                        if let Some(pinned) = pinned {
                            if pinned != id {
                                top = if self.thread(pinned).is_ready() { Some(pinned) } else { None };
                            }
                        }
                    }
                }
                None => idle_cores |= 1u64 << core,
            }
            top_threads[core] = top;
            cores_needing_scheduling |= self.update_highest_priority_thread(core, top);
        }

        while idle_cores != 0 {
            let core = idle_cores.trailing_zeros() as usize;
            idle_cores &= !(1u64 << core);

            let mut suggested = self.queue.suggested_front(core);
            if suggested.is_none() {
                continue;
            }

            let mut candidates: Vec<CoreId> = Vec::with_capacity(num_cores);
            while let Some(id) = suggested {
                let suggested_core = self.thread(id).active_core;
                let top_on_core = suggested_core.and_then(|c| top_threads[c]);
                // A core held by a high priority thread keeps its suggestions;
                // look further down the list.
                let core_is_held = top_on_core
                    .is_some_and(|top| self.thread(top).priority < HIGHEST_CORE_MIGRATION_ALLOWED_PRIORITY);
                if top_on_core != Some(id) && !core_is_held {
                    self.migrate_thread(id, Some(core), false);
                    top_threads[core] = Some(id);
                    cores_needing_scheduling |= self.update_highest_priority_thread(core, Some(id));
                    crate::ktrace!("sched: core {} pulled {} from {:?}", core, id, suggested_core);
                    break;
                }
                if let Some(c) = suggested_core {
                    candidates.push(c);
                }
                suggested = self.queue.suggested_next(core, id);
            }

            if suggested.is_none() {
                for &candidate in &candidates {
                    let Some(top) = top_threads[candidate] else {
                        continue;
                    };
                    if self.thread(top).priority < HIGHEST_CORE_MIGRATION_ALLOWED_PRIORITY {
                        continue;
                    }
                    let Some(next_on_candidate) = self.queue.scheduled_next(candidate, top) else {
                        continue;
                    };
                    top_threads[candidate] = Some(next_on_candidate);
                    cores_needing_scheduling |= self.update_highest_priority_thread(candidate, Some(next_on_candidate));

                    self.migrate_thread(top, Some(core), false);
                    top_threads[core] = Some(top);
                    cores_needing_scheduling |= self.update_highest_priority_thread(core, Some(top));
                    crate::ktrace!("sched: core {} took {} from core {}", core, top, candidate);
                    break;
                }
            }
        }

        cores_needing_scheduling
    }

    /// Moves a thread's active core, keeping the queue in step.
    pub(crate) fn migrate_thread(&mut self, id: ThreadId, core: Option<CoreId>, to_front: bool) {
        self.thread_mut(id).set_active_core(core);
        if self.queue.contains(id) {
            self.queue.change_core(id, core, to_front);
        }
    }

    // ========================================================================
    // Notifications
    // ========================================================================

    pub(crate) fn on_thread_state_changed(&mut self, id: ThreadId, old: EffectiveState) {
        let new = self.thread(id).effective_state();
        if old.is_ready() && !new.is_ready() {
            self.queue.remove(id);
            self.increment_scheduled_count(id);
            self.set_update_needed();
        } else if !old.is_ready() && new.is_ready() {
            let placement = self.placement_of(id);
            self.queue.push_back(id, placement);
            self.increment_scheduled_count(id);
            self.set_update_needed();
        }
    }

    /// `core` is the calling core; its current thread keeps the front of
    /// its new level.
    pub(crate) fn on_thread_priority_changed(&mut self, id: ThreadId, old_priority: i32, core: CoreId) {
        if !self.thread(id).is_ready() {
            return;
        }
        let priority = self.thread(id).priority;
        if priority == old_priority {
            return;
        }
        let is_running = self.current_thread(core) == id;
        self.queue.change_priority(id, priority, is_running);
        self.set_update_needed();
    }

    pub(crate) fn on_thread_affinity_mask_changed(&mut self, id: ThreadId) {
        let t = self.thread(id);
        if !t.is_ready() {
            return;
        }
        let (core, affinity) = (t.active_core, t.physical_affinity);
        self.queue.change_affinity_mask(id, core, affinity);
        self.set_update_needed();
    }

    // ========================================================================
    // Round robin and yields
    // ========================================================================

    /// Moves the front of `(core, priority)` to the back, then tries to pull
    /// in a suggestion that has waited longer, then one of higher priority.
    pub(crate) fn rotate_scheduled_queue(&mut self, core: CoreId, priority: i32) {
        let top = self.queue.scheduled_front_at(core, priority);
        let mut next = None;
        if let Some(top) = top {
            next = self.queue.move_to_scheduled_back(top);
            if next != Some(top) {
                self.increment_scheduled_count(top);
                if let Some(n) = next {
                    self.increment_scheduled_count(n);
                }
            }
        }

        let mut suggested = self.queue.suggested_front_at(core, priority);
        while let Some(id) = suggested {
            let suggested_core = self.thread(id).active_core;
            let top_on_core = suggested_core.and_then(|c| self.queue.scheduled_front(c));
            if top_on_core != Some(id) {
                if top != next {
                    if let Some(n) = next {
                        if self.thread(n).last_scheduled_tick < self.thread(id).last_scheduled_tick {
                            break;
                        }
                    }
                }
                let allowed = match top_on_core {
                    None => true,
                    Some(t) => self.thread(t).priority >= HIGHEST_CORE_MIGRATION_ALLOWED_PRIORITY,
                };
                if allowed {
                    self.migrate_thread(id, Some(core), true);
                    self.increment_scheduled_count(id);
                    break;
                }
            }
            suggested = self.queue.suggested_same_priority_next(core, id);
        }

        let current = self.current_thread(core);
        let mut best = self.queue.scheduled_front(core);
        if best == Some(current) {
            best = self.queue.scheduled_next(core, current);
        }
        if let Some(best) = best {
            let best_priority = self.thread(best).priority;
            if best_priority >= priority {
                let mut suggested = self.queue.suggested_front(core);
                while let Some(id) = suggested {
                    if self.thread(id).priority >= best_priority {
                        break;
                    }
                    let suggested_core = self.thread(id).active_core;
                    let top_on_core = suggested_core.and_then(|c| self.queue.scheduled_front(c));
                    if top_on_core != Some(id) {
                        let allowed = match top_on_core {
                            None => true,
                            Some(t) => self.thread(t).priority >= HIGHEST_CORE_MIGRATION_ALLOWED_PRIORITY,
                        };
                        if allowed {
                            self.migrate_thread(id, Some(core), true);
                            self.increment_scheduled_count(id);
                            break;
                        }
                    }
                    suggested = self.queue.suggested_next(core, id);
                }
            }
        }

        self.set_update_needed();
    }

    pub(crate) fn yield_without_core_migration(&mut self, core: CoreId) {
        let cur = self.current_thread(core);
        if !self.thread(cur).is_ready() {
            return;
        }
        let next = self.queue.move_to_scheduled_back(cur);
        if next != Some(cur) {
            self.increment_scheduled_count(cur);
            self.set_update_needed();
        }
    }

    pub(crate) fn yield_with_core_migration(&mut self, core: CoreId) {
        let cur = self.current_thread(core);
        if !self.thread(cur).is_ready() {
            return;
        }
        let Some(active) = self.thread(cur).active_core else {
            return;
        };
        let cur_priority = self.thread(cur).priority;
        let next = self.queue.move_to_scheduled_back(cur);

        let mut suggested = self.queue.suggested_front(active);
        while let Some(id) = suggested {
            let suggested_core = self.thread(id).active_core;
            let running_on = suggested_core.and_then(|c| self.cores[c].highest_priority_thread);
            if running_on != Some(id) {
                let suggestion_priority = self.thread(id).priority;
                let prefer_next = match next {
                    Some(n) if n != cur => {
                        suggestion_priority == cur_priority
                            && self.thread(n).last_scheduled_tick < self.thread(id).last_scheduled_tick
                    }
                    _ => false,
                };
                if suggestion_priority > cur_priority || prefer_next {
                    suggested = None;
                    break;
                }
                let allowed = match running_on {
                    None => true,
                    Some(t) => self.thread(t).priority >= HIGHEST_CORE_MIGRATION_ALLOWED_PRIORITY,
                };
                if allowed {
                    self.migrate_thread(id, Some(active), true);
                    self.increment_scheduled_count(id);
                } else {
                    suggested = None;
                }
                break;
            }
            suggested = self.queue.suggested_next(active, id);
        }

        if suggested.is_some() || next != Some(cur) {
            self.increment_scheduled_count(cur);
            self.set_update_needed();
        }
    }

    pub(crate) fn yield_to_any_thread(&mut self, core: CoreId) {
        let cur = self.current_thread(core);
        if !self.thread(cur).is_ready() {
            return;
        }
        let Some(active) = self.thread(cur).active_core else {
            return;
        };
        self.migrate_thread(cur, None, false);

        if self.queue.scheduled_front(active).is_none() {
            let mut suggested = self.queue.suggested_front(active);
            while let Some(id) = suggested {
                let suggested_core = self.thread(id).active_core;
                let top_on_core = suggested_core.and_then(|c| self.queue.scheduled_front(c));
                if top_on_core != Some(id) {
                    let allowed = match top_on_core {
                        None => true,
                        Some(t) => self.thread(t).priority >= HIGHEST_CORE_MIGRATION_ALLOWED_PRIORITY,
                    };
                    if allowed {
                        self.migrate_thread(id, Some(active), false);
                        self.increment_scheduled_count(id);
                    }
                    break;
                }
                suggested = self.queue.suggested_next(active, id);
            }
            if suggested != Some(cur) {
                self.increment_scheduled_count(cur);
                self.set_update_needed();
            }
        } else {
            self.increment_scheduled_count(cur);
            self.set_update_needed();
        }
    }

    // ========================================================================
    // Context switch
    // ========================================================================

    /// Cores other than `core` whose choice changed get a reschedule IPI.
    pub(crate) fn reschedule_other_cores(&mut self, core: CoreId, cores_needing_scheduling: u64) {
        let mask = cores_needing_scheduling & !(1u64 << core);
        if mask != 0 {
            self.send_interrupt(crate::smp::ipi::InterruptId::Reschedule, mask);
        }
    }

    /// Switches `core` to its precomputed highest priority thread.
    pub(crate) fn schedule_impl(&mut self, core: CoreId) {
        let state = &mut self.cores[core];
        state.needs_scheduling = false;
        let idle = state.idle_thread;
        let current = state.current_thread;
        let mut next = state.highest_priority_thread.unwrap_or(idle);

        // Stale choice: the thread left the ready set after the last update.
        if next != idle && !self.try_thread(next).map(|t| t.is_ready()).unwrap_or(false) {
            next = idle;
        }

        if next == current {
            return;
        }

        // The thread is still current elsewhere; idle until that core lets
        // go of it, and get signalled then.
        if let Some(other) = self.running_core(next) {
            if other != core {
                self.cores[core].needs_scheduling = true;
                if current != idle {
                    self.switch_thread(core, idle);
                }
                return;
            }
        }

        self.switch_thread(core, next);
    }

    fn switch_thread(&mut self, core: CoreId, next: ThreadId) {
        let now = self.now;
        let prev = self.cores[core].current_thread;
        let elapsed = now.saturating_sub(self.cores[core].last_context_switch_tick);
        if let Some(t) = self.threads.get_mut(prev.0) {
            t.cpu_ticks += elapsed;
        }

        let idle = self.cores[core].idle_thread;
        {
            let state = &mut self.cores[core];
            state.prev_thread = Some(prev);
            state.current_thread = next;
            state.last_context_switch_tick = now;
            state.context_switches += 1;
            if next == idle {
                state.idle_switches += 1;
            }
        }
        self.thread_mut(next).last_scheduled_tick = now;

        #[cfg(feature = "debug_verbose")]
        crate::ktrace!("sched: core {} switch {} -> {} at {}", core, prev, next, now);

        // Cores that wanted `prev` while it was still current here may take
        // it now.
        let mut waiting = 0u64;
        for (c, s) in self.cores.iter().enumerate() {
            if c != core && s.needs_scheduling && s.highest_priority_thread == Some(prev) {
                waiting |= 1u64 << c;
            }
        }
        if waiting != 0 {
            self.send_interrupt(crate::smp::ipi::InterruptId::Reschedule, waiting);
        }
    }
}
