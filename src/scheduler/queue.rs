//! Ready queues
//!
//! Every core owns one FIFO list per priority level for the threads it is
//! going to run (the *scheduled* lists) and one list per level for threads
//! that could run on it but are currently assigned elsewhere (the
//! *suggested* lists). A thread sits in the scheduled list of its active
//! core and in the suggested list of every other core in its affinity mask.
//!
//! Lists are doubly linked through a side table indexed by
//! `thread * num_cores + core`, so threads carry no list nodes. A per-core
//! bitmap of non-empty levels gives the highest ready level in one
//! `trailing_zeros`.
//!
//! The queue remembers where it placed each thread ([`Placement`]), so
//! removal and re-placement never depend on the caller passing the old
//! values back in.

use alloc::vec;
use alloc::vec::Vec;

use super::types::{AffinityMask, CoreId, ThreadId, NUM_PRIORITIES};

/// Where a thread is queued: its level, the core that schedules it, and the
/// cores that see it as a suggestion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Placement {
    pub priority: i32,
    pub active_core: Option<CoreId>,
    pub affinity: AffinityMask,
}

#[derive(Clone, Copy, Default)]
struct Link {
    prev: Option<ThreadId>,
    next: Option<ThreadId>,
    linked: bool,
}

#[derive(Clone, Copy, Default)]
struct Root {
    head: Option<ThreadId>,
    tail: Option<ThreadId>,
}

/// One family of per-core, per-level lists.
struct LevelLists {
    num_cores: usize,
    roots: Vec<Root>,
    links: Vec<Link>,
    available: Vec<u64>,
}

impl LevelLists {
    fn new(num_cores: usize) -> Self {
        Self {
            num_cores,
            roots: vec![Root::default(); num_cores * NUM_PRIORITIES],
            links: Vec::new(),
            available: vec![0; num_cores],
        }
    }

    #[inline]
    fn root_index(&self, core: CoreId, priority: i32) -> usize {
        core * NUM_PRIORITIES + priority as usize
    }

    #[inline]
    fn link_index(&self, id: ThreadId, core: CoreId) -> usize {
        id.index() * self.num_cores + core
    }

    fn ensure(&mut self, id: ThreadId) {
        let needed = (id.index() + 1) * self.num_cores;
        if self.links.len() < needed {
            self.links.resize(needed, Link::default());
        }
    }

    fn link(&self, id: ThreadId, core: CoreId) -> Link {
        self.links
            .get(self.link_index(id, core))
            .copied()
            .unwrap_or_default()
    }

    fn link_mut(&mut self, id: ThreadId, core: CoreId) -> &mut Link {
        self.ensure(id);
        let idx = self.link_index(id, core);
        &mut self.links[idx]
    }

    fn is_linked(&self, id: ThreadId, core: CoreId) -> bool {
        self.link(id, core).linked
    }

    fn push_back(&mut self, core: CoreId, priority: i32, id: ThreadId) {
        if self.is_linked(id, core) {
            crate::kpanic!("queue: {} already linked on core {}", id, core);
        }
        let ri = self.root_index(core, priority);
        let tail = self.roots[ri].tail;
        {
            let link = self.link_mut(id, core);
            link.prev = tail;
            link.next = None;
            link.linked = true;
        }
        match tail {
            Some(t) => self.link_mut(t, core).next = Some(id),
            None => self.roots[ri].head = Some(id),
        }
        self.roots[ri].tail = Some(id);
        self.available[core] |= 1u64 << priority;
    }

    fn push_front(&mut self, core: CoreId, priority: i32, id: ThreadId) {
        if self.is_linked(id, core) {
            crate::kpanic!("queue: {} already linked on core {}", id, core);
        }
        let ri = self.root_index(core, priority);
        let head = self.roots[ri].head;
        {
            let link = self.link_mut(id, core);
            link.prev = None;
            link.next = head;
            link.linked = true;
        }
        match head {
            Some(h) => self.link_mut(h, core).prev = Some(id),
            None => self.roots[ri].tail = Some(id),
        }
        self.roots[ri].head = Some(id);
        self.available[core] |= 1u64 << priority;
    }

    fn remove(&mut self, core: CoreId, priority: i32, id: ThreadId) {
        let link = self.link(id, core);
        if !link.linked {
            crate::kpanic!("queue: removing {} which is not linked on core {}", id, core);
        }
        let ri = self.root_index(core, priority);
        match link.prev {
            Some(p) => self.link_mut(p, core).next = link.next,
            None => self.roots[ri].head = link.next,
        }
        match link.next {
            Some(n) => self.link_mut(n, core).prev = link.prev,
            None => self.roots[ri].tail = link.prev,
        }
        *self.link_mut(id, core) = Link::default();
        if self.roots[ri].head.is_none() {
            self.available[core] &= !(1u64 << priority);
        }
    }

    fn front(&self, core: CoreId) -> Option<ThreadId> {
        let bits = self.available[core];
        if bits == 0 {
            return None;
        }
        self.front_at(core, bits.trailing_zeros() as i32)
    }

    fn front_at(&self, core: CoreId, priority: i32) -> Option<ThreadId> {
        self.roots[self.root_index(core, priority)].head
    }

    fn same_level_next(&self, core: CoreId, id: ThreadId) -> Option<ThreadId> {
        self.link(id, core).next
    }

    /// Next thread in the same list, else the head of the next non-empty
    /// lower level.
    fn next(&self, core: CoreId, priority: i32, id: ThreadId) -> Option<ThreadId> {
        if let Some(next) = self.same_level_next(core, id) {
            return Some(next);
        }
        let shift = priority as u32 + 1;
        if shift >= 64 {
            return None;
        }
        let bits = self.available[core] & (u64::MAX << shift);
        if bits == 0 {
            None
        } else {
            self.front_at(core, bits.trailing_zeros() as i32)
        }
    }

    fn iter_level(&self, core: CoreId, priority: i32) -> impl Iterator<Item = ThreadId> + '_ {
        let mut cur = self.front_at(core, priority);
        core::iter::from_fn(move || {
            let id = cur?;
            cur = self.link(id, core).next;
            Some(id)
        })
    }
}

pub struct PriorityQueue {
    num_cores: usize,
    scheduled: LevelLists,
    suggested: LevelLists,
    placements: Vec<Option<Placement>>,
    idle_threads: Vec<Option<ThreadId>>,
}

impl PriorityQueue {
    pub fn new(num_cores: usize) -> Self {
        Self {
            num_cores,
            scheduled: LevelLists::new(num_cores),
            suggested: LevelLists::new(num_cores),
            placements: Vec::new(),
            idle_threads: vec![None; num_cores],
        }
    }

    pub fn num_cores(&self) -> usize {
        self.num_cores
    }

    /// Thread returned by [`highest_priority_thread`](Self::highest_priority_thread)
    /// when `core` has nothing scheduled.
    pub fn set_idle_thread(&mut self, core: CoreId, id: ThreadId) {
        self.idle_threads[core] = Some(id);
    }

    pub fn placement(&self, id: ThreadId) -> Option<Placement> {
        self.placements.get(id.index()).copied().flatten()
    }

    pub fn contains(&self, id: ThreadId) -> bool {
        self.placement(id).is_some()
    }

    fn take_placement(&mut self, id: ThreadId) -> Placement {
        match self.placements.get_mut(id.index()).and_then(Option::take) {
            Some(p) => p,
            None => crate::kpanic!("queue: {} is not queued", id),
        }
    }

    fn store_placement(&mut self, id: ThreadId, placement: Placement) {
        let priority_ok = placement.priority >= 0 && (placement.priority as usize) < NUM_PRIORITIES;
        if !priority_ok {
            crate::kpanic!("queue: {} has unschedulable priority {}", id, placement.priority);
        }
        if let Some(core) = placement.active_core {
            if core >= self.num_cores || !placement.affinity.contains(core) {
                crate::kpanic!("queue: {} active on core {} outside {:?}", id, core, placement.affinity);
            }
        }
        if self.placements.len() <= id.index() {
            self.placements.resize(id.index() + 1, None);
        }
        if self.placements[id.index()].is_some() {
            crate::kpanic!("queue: {} queued twice", id);
        }
        self.placements[id.index()] = Some(placement);
    }

    fn suggested_cores(&self, placement: &Placement) -> impl Iterator<Item = CoreId> {
        let mut mask = placement.affinity.bits() & AffinityMask::all(self.num_cores).bits();
        if let Some(core) = placement.active_core {
            mask &= !(1u64 << core);
        }
        AffinityMask::from_bits(mask).cores()
    }

    fn link_all(&mut self, id: ThreadId, placement: &Placement, front: bool) {
        if let Some(core) = placement.active_core {
            if front {
                self.scheduled.push_front(core, placement.priority, id);
            } else {
                self.scheduled.push_back(core, placement.priority, id);
            }
        }
        // Suggestions always go to the back, even for a front insertion.
        for core in self.suggested_cores(placement) {
            self.suggested.push_back(core, placement.priority, id);
        }
    }

    fn unlink_all(&mut self, id: ThreadId, placement: &Placement) {
        if let Some(core) = placement.active_core {
            self.scheduled.remove(core, placement.priority, id);
        }
        for core in self.suggested_cores(placement) {
            self.suggested.remove(core, placement.priority, id);
        }
    }

    pub fn push_back(&mut self, id: ThreadId, placement: Placement) {
        self.store_placement(id, placement);
        self.link_all(id, &placement, false);
    }

    pub fn push_front(&mut self, id: ThreadId, placement: Placement) {
        self.store_placement(id, placement);
        self.link_all(id, &placement, true);
    }

    pub fn remove(&mut self, id: ThreadId) -> Placement {
        let placement = self.take_placement(id);
        self.unlink_all(id, &placement);
        placement
    }

    /// Front of the highest non-empty level on `core`, or that core's idle
    /// thread.
    pub fn highest_priority_thread(&self, core: CoreId) -> Option<ThreadId> {
        self.scheduled.front(core).or(self.idle_threads[core])
    }

    pub fn scheduled_front(&self, core: CoreId) -> Option<ThreadId> {
        self.scheduled.front(core)
    }

    pub fn scheduled_front_at(&self, core: CoreId, priority: i32) -> Option<ThreadId> {
        self.scheduled.front_at(core, priority)
    }

    pub fn scheduled_next(&self, core: CoreId, id: ThreadId) -> Option<ThreadId> {
        let placement = self.placement(id)?;
        self.scheduled.next(core, placement.priority, id)
    }

    pub fn suggested_front(&self, core: CoreId) -> Option<ThreadId> {
        self.suggested.front(core)
    }

    pub fn suggested_front_at(&self, core: CoreId, priority: i32) -> Option<ThreadId> {
        self.suggested.front_at(core, priority)
    }

    pub fn suggested_next(&self, core: CoreId, id: ThreadId) -> Option<ThreadId> {
        let placement = self.placement(id)?;
        self.suggested.next(core, placement.priority, id)
    }

    pub fn suggested_same_priority_next(&self, core: CoreId, id: ThreadId) -> Option<ThreadId> {
        self.suggested.same_level_next(core, id)
    }

    pub fn is_scheduled_on(&self, id: ThreadId, core: CoreId) -> bool {
        self.scheduled.is_linked(id, core)
    }

    pub fn is_suggested_on(&self, id: ThreadId, core: CoreId) -> bool {
        self.suggested.is_linked(id, core)
    }

    /// Scheduled threads of one level in queue order.
    pub fn scheduled_at(&self, core: CoreId, priority: i32) -> Vec<ThreadId> {
        self.scheduled.iter_level(core, priority).collect()
    }

    /// Every scheduled thread of `core`, highest level first.
    pub fn scheduled_threads(&self, core: CoreId) -> Vec<ThreadId> {
        let mut out = Vec::new();
        let mut bits = self.scheduled.available[core];
        while bits != 0 {
            let priority = bits.trailing_zeros() as i32;
            bits &= bits - 1;
            out.extend(self.scheduled.iter_level(core, priority));
        }
        out
    }

    pub fn move_to_scheduled_front(&mut self, id: ThreadId) {
        let Some(placement) = self.placement(id) else {
            crate::kpanic!("queue: {} is not queued", id);
        };
        let Some(core) = placement.active_core else {
            return;
        };
        self.scheduled.remove(core, placement.priority, id);
        self.scheduled.push_front(core, placement.priority, id);
    }

    /// Moves `id` behind its level peers and returns the new front of that
    /// level.
    pub fn move_to_scheduled_back(&mut self, id: ThreadId) -> Option<ThreadId> {
        let Some(placement) = self.placement(id) else {
            crate::kpanic!("queue: {} is not queued", id);
        };
        let core = placement.active_core?;
        self.scheduled.remove(core, placement.priority, id);
        self.scheduled.push_back(core, placement.priority, id);
        self.scheduled.front_at(core, placement.priority)
    }

    /// Re-levels a queued thread. A running thread goes to the front of its
    /// new level so it keeps the core.
    pub fn change_priority(&mut self, id: ThreadId, priority: i32, is_running: bool) {
        let mut placement = self.remove(id);
        placement.priority = priority;
        if is_running {
            self.push_front(id, placement);
        } else {
            self.push_back(id, placement);
        }
    }

    pub fn change_affinity_mask(&mut self, id: ThreadId, active_core: Option<CoreId>, affinity: AffinityMask) {
        let mut placement = self.remove(id);
        placement.active_core = active_core;
        placement.affinity = affinity;
        self.push_back(id, placement);
    }

    /// Moves a queued thread's scheduled slot to `new_core`. The old core
    /// gets it back as a suggestion.
    pub fn change_core(&mut self, id: ThreadId, new_core: Option<CoreId>, to_front: bool) {
        let Some(mut placement) = self.placement(id) else {
            crate::kpanic!("queue: {} is not queued", id);
        };
        let prev_core = placement.active_core;
        if prev_core == new_core {
            return;
        }
        if let Some(core) = new_core {
            if !placement.affinity.contains(core) || core >= self.num_cores {
                crate::kpanic!("queue: {} cannot move to core {}", id, core);
            }
        }

        let priority = placement.priority;
        if let Some(prev) = prev_core {
            self.scheduled.remove(prev, priority, id);
        }
        if let Some(core) = new_core {
            self.suggested.remove(core, priority, id);
            if to_front {
                self.scheduled.push_front(core, priority, id);
            } else {
                self.scheduled.push_back(core, priority, id);
            }
        }
        if let Some(prev) = prev_core {
            self.suggested.push_back(prev, priority, id);
        }

        placement.active_core = new_core;
        self.placements[id.index()] = Some(placement);
    }

    /// Leaves `id` queued only as a suggestion on every core it may run on.
    pub fn move_to_suggested_queue(&mut self, id: ThreadId) {
        self.change_core(id, None, false);
    }

    /// Takes the front suggestion of `core` and schedules it there.
    pub fn pop_from_suggested_queue(&mut self, core: CoreId) -> Option<ThreadId> {
        let id = self.suggested.front(core)?;
        self.change_core(id, Some(core), false);
        Some(id)
    }
}
