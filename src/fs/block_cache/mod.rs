//! Write-back block cache
//!
//! `BlockCacheBufferedStorage` sits on top of a block storage and keeps a
//! small table of cache entries, each one or two verification blocks long.
//!
//! ## Entries
//!
//! - A dirty entry owns its buffer. A clean entry has registered its buffer
//!   with the buffer manager, which may reclaim it at any time.
//! - Lookups take the entry out of the table; it goes back in (or is
//!   released) once the caller is done with it. Resident entries never
//!   overlap: a stored entry that overlaps a resident one is dropped.
//! - When the table is full the slot after the last stored one is flushed
//!   and reused.
//!
//! ## Reads
//!
//! Cached head and tail blocks are served first. An unaligned read of at
//! most `BULK_READ_SIZE_MAX` bytes then reads the aligned middle in one
//! request and populates the head and tail entries from it. Otherwise, or
//! if no scratch buffer of the right size is available, the range is read
//! entry by entry. With burst mode on, whole aligned blocks bypass the
//! cache.
//!
//! ## Errors
//!
//! The first failure that is not an allocation failure is latched. Every
//! later operation fails with it until `InvalidateCache` clears an
//! integrity error.

mod cache;
pub mod entry;
mod read;

pub use cache::{BlockCacheBufferedStorage, CacheStats};
pub use entry::{AssociatedBuffer, CacheEntry, EntryMemory};

/// Largest aligned span served by a single bulk read.
pub const BULK_READ_SIZE_MAX: u64 = 2 * 1024 * 1024;

#[inline]
pub(crate) const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

#[inline]
pub(crate) const fn align_up(value: u64, align: u64) -> u64 {
    align_down(value + align - 1, align)
}
