//! NexaOS Kernel Core Test Suite
//!
//! This crate tests the scheduler and block cache by directly including the
//! kernel core source files. This bypasses no_std restrictions while testing
//! the actual kernel logic.
//!
//! # How it works
//! 1. We define stub macros (kinfo!, ktrace!, etc.) that map to eprintln! or no-op
//! 2. We use `#[path = "..."]` to include kernel source files directly, under
//!    the same module names the kernel uses so `crate::` paths resolve
//! 3. The `core::` references in kernel code work because std re-exports core
//!
//! Every `Kernel` is a self-contained instance, so scheduler tests build their
//! own and need no global cleanup. Only the logger keeps global state.

// Re-export alloc crate for kernel code that uses alloc::vec, alloc::sync, etc.
extern crate alloc;

// ===========================================================================
// Kernel macro stubs - these replace the kernel's logging macros for testing
// ===========================================================================

/// Stub for kernel's klog! macro - no-op in tests
#[macro_export]
macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {{
        let _ = $level;
    }};
}

/// Stub for kernel's kpanic! macro - a plain panic so `#[should_panic]` works
#[macro_export]
macro_rules! kpanic {
    ($($arg:tt)*) => {{
        panic!($($arg)*)
    }};
}

/// Stub for kernel's kinfo! macro - prints to stderr in tests
#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {{
        #[cfg(test)]
        eprintln!("[INFO] {}", format_args!($($arg)*));
    }};
}

/// Stub for kernel's ktrace! macro - no-op in tests (too verbose)
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {{}};
}

/// Stub for kernel's kwarn! macro - prints to stderr in tests
#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {{
        #[cfg(test)]
        eprintln!("[WARN] {}", format_args!($($arg)*));
    }};
}

/// Stub for kernel's kerror! macro - prints to stderr in tests
#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{
        #[cfg(test)]
        eprintln!("[ERROR] {}", format_args!($($arg)*));
    }};
}

/// Stub for kernel's kfatal! macro - prints to stderr in tests
#[macro_export]
macro_rules! kfatal {
    ($($arg:tt)*) => {{
        #[cfg(test)]
        eprintln!("[FATAL] {}", format_args!($($arg)*));
    }};
}

/// Stub for kernel's kdebug! macro - no-op in tests
#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {{}};
}

// ===========================================================================
// Import kernel source files directly using #[path]
// ===========================================================================

// Runtime configuration (scheduler and cache)
#[path = "../../src/config.rs"]
pub mod config;

// Log levels, sinks and the record ring
#[path = "../../src/logger.rs"]
pub mod logger;

// IPI vectors and the software interrupt controller
#[path = "../../src/smp/mod.rs"]
pub mod smp;

// Scheduler: priority queue, threads, scheduler lock, inheritance
#[path = "../../src/scheduler/mod.rs"]
pub mod scheduler;

// Kernel context tying the scheduler to an interrupt controller
#[path = "../../src/kernel.rs"]
pub mod kernel;

// Storage: block cache, buffer manager, pooled buffers
#[path = "../../src/fs/mod.rs"]
pub mod fs;

// ===========================================================================
// Hardware-level mocks (storage devices and memory budgets, NOT kernel code)
// ===========================================================================

pub mod mock;

// ===========================================================================
// Test modules
// ===========================================================================
