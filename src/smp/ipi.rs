//! IPI (Inter-Processor Interrupt) Constants and Controllers
//!
//! The scheduler only ever asks for two things from the interrupt
//! controller: "reschedule these cores" and "a thread on these cores is
//! being terminated". Both make the receiving core re-run its scheduler.
//!
//! `SoftwareInterruptController` keeps a pending bitmap per core. Hosted
//! builds and the test-suite drive cores by draining it through
//! `Kernel::service_interrupts`.

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::vec::Vec;

use crate::scheduler::types::{CoreId, MAX_CORES};

// ============================================================================
// IPI Vector Constants
// ============================================================================

/// IPI vector for reschedule requests
pub const IPI_RESCHEDULE: u8 = 0xF0;

/// IPI vector for thread termination requests
pub const IPI_THREAD_TERMINATE: u8 = 0xF4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum InterruptId {
    Reschedule = IPI_RESCHEDULE,
    ThreadTerminate = IPI_THREAD_TERMINATE,
}

impl InterruptId {
    pub const fn vector(self) -> u8 {
        self as u8
    }

    pub fn from_vector(vector: u8) -> Option<Self> {
        match vector {
            IPI_RESCHEDULE => Some(InterruptId::Reschedule),
            IPI_THREAD_TERMINATE => Some(InterruptId::ThreadTerminate),
            _ => None,
        }
    }

    const fn pending_bit(self) -> u64 {
        match self {
            InterruptId::Reschedule => 1 << 0,
            InterruptId::ThreadTerminate => 1 << 1,
        }
    }
}

/// Delivery side of the interrupt controller.
///
/// Implementations must not call back into the scheduler.
pub trait InterruptController: Send + Sync {
    /// Raise `irq` on every core set in `core_mask`.
    fn send_inter_processor_interrupt(&self, irq: InterruptId, core_mask: u64);

    /// Take the next pending interrupt for `core`, if the controller queues
    /// them in software. Hardware controllers deliver through their own
    /// vectors and return `None`.
    fn acknowledge(&self, _core: CoreId) -> Option<InterruptId> {
        None
    }
}

// ============================================================================
// Software controller
// ============================================================================

pub struct SoftwareInterruptController {
    pending: Vec<AtomicU64>,
    sent: AtomicU64,
}

impl SoftwareInterruptController {
    pub fn new(num_cores: usize) -> Self {
        let num_cores = num_cores.min(MAX_CORES);
        Self {
            pending: (0..num_cores).map(|_| AtomicU64::new(0)).collect(),
            sent: AtomicU64::new(0),
        }
    }

    pub fn is_pending(&self, core: CoreId, irq: InterruptId) -> bool {
        self.pending
            .get(core)
            .map(|p| p.load(Ordering::Acquire) & irq.pending_bit() != 0)
            .unwrap_or(false)
    }

    /// Mask of cores with anything pending.
    pub fn pending_cores(&self) -> u64 {
        self.pending
            .iter()
            .enumerate()
            .filter(|(_, p)| p.load(Ordering::Acquire) != 0)
            .fold(0u64, |mask, (core, _)| mask | (1u64 << core))
    }

    /// Number of per-core deliveries requested so far.
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        for p in &self.pending {
            p.store(0, Ordering::Release);
        }
    }
}

impl InterruptController for SoftwareInterruptController {
    fn send_inter_processor_interrupt(&self, irq: InterruptId, core_mask: u64) {
        for (core, pending) in self.pending.iter().enumerate() {
            if core_mask & (1u64 << core) != 0 {
                pending.fetch_or(irq.pending_bit(), Ordering::AcqRel);
                self.sent.fetch_add(1, Ordering::Relaxed);
            }
        }
        crate::ktrace!("ipi: vector {:#x} -> mask {:#x}", irq.vector(), core_mask);
    }

    fn acknowledge(&self, core: CoreId) -> Option<InterruptId> {
        let pending = self.pending.get(core)?;
        for irq in [InterruptId::ThreadTerminate, InterruptId::Reschedule] {
            let bit = irq.pending_bit();
            if pending.fetch_and(!bit, Ordering::AcqRel) & bit != 0 {
                return Some(irq);
            }
        }
        None
    }
}
