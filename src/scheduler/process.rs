//! Process records as seen by the scheduler.
//!
//! Only what scheduling needs: the running threads, a pinned thread slot
//! per core, the default core placement, and the process-wide suspend
//! request.

use alloc::vec;
use alloc::vec::Vec;

use super::types::{AffinityMask, CoreId, ProcessId, ThreadId};

pub struct Process {
    pub(crate) id: ProcessId,
    pub(crate) name: &'static str,
    pub(crate) ideal_core: CoreId,
    pub(crate) affinity: AffinityMask,
    pub(crate) threads: Vec<ThreadId>,
    pub(crate) pinned: Vec<Option<ThreadId>>,
    pub(crate) suspended: bool,
}

impl Process {
    pub(crate) fn new(id: ProcessId, name: &'static str, ideal_core: CoreId, affinity: AffinityMask, num_cores: usize) -> Self {
        Self {
            id,
            name,
            ideal_core,
            affinity,
            threads: Vec::new(),
            pinned: vec![None; num_cores],
            suspended: false,
        }
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub(crate) fn register_thread(&mut self, id: ThreadId) {
        if !self.threads.contains(&id) {
            self.threads.push(id);
        }
    }

    pub(crate) fn unregister_thread(&mut self, id: ThreadId) {
        self.threads.retain(|&t| t != id);
        for slot in self.pinned.iter_mut() {
            if *slot == Some(id) {
                *slot = None;
            }
        }
    }

    pub fn pinned_thread(&self, core: CoreId) -> Option<ThreadId> {
        self.pinned.get(core).copied().flatten()
    }

    pub(crate) fn pin_thread(&mut self, core: CoreId, id: ThreadId) {
        if let Some(other) = self.pinned[core] {
            crate::kpanic!("process {} already has {} pinned on core {}", self.id, other, core);
        }
        self.pinned[core] = Some(id);
    }

    pub(crate) fn unpin_thread(&mut self, core: CoreId, id: ThreadId) {
        if self.pinned[core] != Some(id) {
            crate::kpanic!("process {}: {} is not pinned on core {}", self.id, id, core);
        }
        self.pinned[core] = None;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessInfo {
    pub id: ProcessId,
    pub name: &'static str,
    pub threads: Vec<ThreadId>,
    pub pinned: Vec<Option<ThreadId>>,
    pub suspended: bool,
}

impl From<&Process> for ProcessInfo {
    fn from(p: &Process) -> Self {
        Self {
            id: p.id,
            name: p.name,
            threads: p.threads.clone(),
            pinned: p.pinned.clone(),
            suspended: p.suspended,
        }
    }
}
