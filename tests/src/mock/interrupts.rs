//! Interrupt controller that remembers every IPI

use std::sync::Mutex;

use crate::scheduler::CoreId;
use crate::smp::{InterruptController, InterruptId, SoftwareInterruptController};

/// Logs `(irq, core_mask)` for every request, then queues it like the
/// software controller so `Kernel::service_interrupts` still works.
pub struct RecordingInterruptController {
    inner: SoftwareInterruptController,
    log: Mutex<Vec<(InterruptId, u64)>>,
}

impl RecordingInterruptController {
    pub fn new(num_cores: usize) -> Self {
        Self {
            inner: SoftwareInterruptController::new(num_cores),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<(InterruptId, u64)> {
        self.log.lock().unwrap().clone()
    }

    pub fn is_pending(&self, core: CoreId, irq: InterruptId) -> bool {
        self.inner.is_pending(core, irq)
    }
}

impl InterruptController for RecordingInterruptController {
    fn send_inter_processor_interrupt(&self, irq: InterruptId, core_mask: u64) {
        self.log.lock().unwrap().push((irq, core_mask));
        self.inner.send_inter_processor_interrupt(irq, core_mask);
    }

    fn acknowledge(&self, core: CoreId) -> Option<InterruptId> {
        self.inner.acknowledge(core)
    }
}
