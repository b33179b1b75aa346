//! Deferred work run outside the context of the thread it concerns.
//!
//! A thread cannot tear itself down while its stack is in use, so exit
//! queues a `FinishTermination` task here. A later worker pass finalizes it
//! once no core has it as the current thread; until then the task stays at
//! the head of the queue.

use alloc::collections::VecDeque;

use super::types::ThreadId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerTask {
    FinishTermination(ThreadId),
}

#[derive(Default)]
pub struct WorkerTaskQueue {
    tasks: VecDeque<WorkerTask>,
}

impl WorkerTaskQueue {
    pub const fn new() -> Self {
        Self {
            tasks: VecDeque::new(),
        }
    }

    pub fn push(&mut self, task: WorkerTask) {
        self.tasks.push_back(task);
    }

    pub fn pop(&mut self) -> Option<WorkerTask> {
        self.tasks.pop_front()
    }

    /// Puts back a task that could not run yet.
    pub fn defer(&mut self, task: WorkerTask) {
        self.tasks.push_front(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
