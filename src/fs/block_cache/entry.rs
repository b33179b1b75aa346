//! Cache entry records

use core::mem;

use crate::fs::buffers::{Buffer, CacheHandle};

/// Where an entry's bytes live.
#[derive(Debug, Default)]
pub enum EntryMemory {
    #[default]
    Empty,
    /// Dirty data; the cache holds the buffer until it is flushed.
    Owned(Buffer),
    /// Clean data registered with the buffer manager, which may reclaim it.
    Managed(CacheHandle),
}

impl EntryMemory {
    pub fn is_empty(&self) -> bool {
        matches!(self, EntryMemory::Empty)
    }

    pub fn take(&mut self) -> EntryMemory {
        mem::take(self)
    }
}

/// One slot of the entry table.
#[derive(Debug, Default)]
pub struct CacheEntry {
    pub offset: u64,
    pub size: usize,
    pub is_valid: bool,
    pub is_cached: bool,
    pub is_write_back: bool,
    pub is_flushing: bool,
    pub memory: EntryMemory,
}

impl CacheEntry {
    pub fn end(&self) -> u64 {
        self.offset + self.size as u64
    }

    /// Valid and backed by memory.
    pub fn is_resident(&self) -> bool {
        self.is_valid && !self.memory.is_empty()
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.offset <= offset && offset < self.end()
    }

    pub fn overlaps(&self, offset: u64, size: u64) -> bool {
        self.offset < offset.saturating_add(size) && offset < self.end()
    }

    pub fn clear(&mut self) {
        *self = CacheEntry::default();
    }
}

/// An entry taken out of the table together with its buffer. It goes back
/// with `store_associate_buffer` or is released with `destroy_buffer`.
#[derive(Debug)]
pub struct AssociatedBuffer {
    pub offset: u64,
    pub size: usize,
    pub is_cached: bool,
    pub is_write_back: bool,
    pub buffer: Buffer,
}

impl AssociatedBuffer {
    pub fn end(&self) -> u64 {
        self.offset + self.size as u64
    }

    /// True if `other` lies entirely inside this entry.
    pub fn contains_entry(&self, other: &AssociatedBuffer) -> bool {
        self.offset <= other.offset && other.end() <= self.end()
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.size]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[..self.size]
    }
}
