//! SMP support
//!
//! The only cross-core mechanism the scheduler needs is inter-processor
//! interrupts; see `ipi`.

pub mod ipi;

pub use ipi::{InterruptController, InterruptId, SoftwareInterruptController};
pub use ipi::{IPI_RESCHEDULE, IPI_THREAD_TERMINATE};
