//! Device and platform mocks for kernel core testing
//!
//! The kernel code under test runs unchanged; these stand in for what sits
//! below it:
//!
//! - `storage`: a backing store that counts and logs every request and can
//!   be told to fail
//! - `buffers`: a buffer manager with injectable allocation failures and a
//!   settable memory-pressure reading
//! - `interrupts`: an interrupt controller that logs every IPI it is asked
//!   to raise
//!
//! Everything here is plain std code with interior mutability so a single
//! `Arc` can be handed to the kernel and kept by the test for inspection.

pub mod interrupts;
pub mod storage;

pub use buffers::FlakyBufferManager;
pub use interrupts::RecordingInterruptController;
pub use storage::{RecordingStorage, StorageRequest};

/// Deterministic fill pattern for backing stores: byte `i` is `i % 251`.
pub fn pattern(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}
