//! Entry table management, writes, flushing and range operations

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

use super::entry::{AssociatedBuffer, CacheEntry, EntryMemory};
use super::{align_down, align_up};
use crate::config::CacheConfig;
use crate::fs::buffers::{allocate_buffer_with_retry, BufferAttribute, BufferManager};
use crate::fs::error::{FsError, FsResult};
use crate::fs::pooled::BufferPool;
use crate::fs::storage::{OperationId, QueryRangeInfo, Storage};
use crate::fs::StorageType;

/// Counters for one cache instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Buffers allocated for new entries.
    pub entry_creations: u64,
    pub evictions: u64,
    pub flushes: u64,
    /// Flushes forced by the dirtiness limit.
    pub dirty_flushes: u64,
    /// Entries dropped because an overlapping one was already resident.
    pub redundant_drops: u64,
    pub bulk_reads: u64,
    pub bulk_fallbacks: u64,
    pub burst_reads: u64,
    pub burst_writes: u64,
}

pub(super) struct CacheState {
    pub(super) entries: Vec<CacheEntry>,
    pub(super) invalidate_index: usize,
    pub(super) last_result: FsResult<()>,
    pub(super) stats: CacheStats,
}

pub struct BlockCacheBufferedStorage {
    pub(super) storage: Arc<dyn Storage>,
    pub(super) buffer_manager: Arc<dyn BufferManager>,
    pub(super) pool: Arc<BufferPool>,
    pub(super) data_size: u64,
    pub(super) block_size: usize,
    attr: BufferAttribute,
    allocation_retries: u32,
    storage_type: StorageType,
    burst_mode: AtomicBool,
    pub(super) state: Mutex<CacheState>,
}

impl BlockCacheBufferedStorage {
    /// The backing storage size must be a multiple of the block size.
    pub fn new(
        storage: Arc<dyn Storage>,
        buffer_manager: Arc<dyn BufferManager>,
        pool: Arc<BufferPool>,
        config: &CacheConfig,
    ) -> FsResult<Self> {
        if let Err(e) = config.validate() {
            crate::kerror!("bcache: bad configuration: {}", e);
            return Err(FsError::InvalidSize);
        }

        let data_size = storage.size()?;
        if data_size % config.block_size as u64 != 0 {
            crate::kerror!(
                "bcache: storage size {:#x} is not a multiple of the block size {:#x}",
                data_size,
                config.block_size
            );
            return Err(FsError::InvalidSize);
        }

        let entries = (0..config.max_cache_entries).map(|_| CacheEntry::default()).collect();

        crate::kinfo!(
            "bcache: {:#x} bytes, {:#x} byte blocks, {} entries, {}{}",
            data_size,
            config.block_size,
            config.max_cache_entries,
            config.storage_type.as_str(),
            if config.burst_mode { ", burst" } else { "" }
        );

        Ok(Self {
            storage,
            buffer_manager,
            pool,
            data_size,
            block_size: config.block_size,
            attr: BufferAttribute::new(config.buffer_level),
            allocation_retries: config.allocation_retries,
            storage_type: config.storage_type,
            burst_mode: AtomicBool::new(config.burst_mode),
            state: Mutex::new(CacheState {
                entries,
                invalidate_index: 0,
                last_result: Ok(()),
                stats: CacheStats::default(),
            }),
        })
    }

    pub fn size(&self) -> u64 {
        self.data_size
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    pub fn max_cache_entries(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_burst_mode_enabled(&self) -> bool {
        self.burst_mode.load(Ordering::Relaxed)
    }

    pub fn set_burst_mode(&self, enabled: bool) {
        self.burst_mode.store(enabled, Ordering::Relaxed);
    }

    /// The latched failure, if any.
    pub fn last_result(&self) -> FsResult<()> {
        self.state.lock().last_result
    }

    pub fn stats(&self) -> CacheStats {
        self.state.lock().stats
    }

    pub fn valid_entry_count(&self) -> usize {
        self.state.lock().entries.iter().filter(|e| e.is_valid).count()
    }

    pub fn dirty_entry_count(&self) -> usize {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|e| e.is_valid && e.is_write_back)
            .count()
    }

    /// `(offset, size, dirty)` of every resident entry, in table order.
    pub fn resident_entries(&self) -> Vec<(u64, usize, bool)> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|e| e.is_resident())
            .map(|e| (e.offset, e.size, e.is_write_back))
            .collect()
    }

    pub(super) fn check_last_result(&self) -> FsResult<()> {
        self.state.lock().last_result
    }

    /// Latches `result` if it is the first non-allocation failure. Never
    /// call with the state lock held.
    pub(super) fn update_last_result<T>(&self, result: FsResult<T>) -> FsResult<T> {
        if let Err(e) = &result {
            let mut state = self.state.lock();
            Self::latch(&mut state, *e);
        }
        result
    }

    fn latch(state: &mut CacheState, error: FsError) {
        if !error.is_buffer_allocation_failure() && state.last_result.is_ok() {
            crate::kwarn!("bcache: latching failure: {}", error);
            state.last_result = Err(error);
        }
    }

    pub(super) fn burst_applies(&self, offset: u64, aligned_offset: u64, remaining: usize) -> bool {
        self.is_burst_mode_enabled() && offset == aligned_offset && self.block_size * 2 <= remaining
    }

    fn release_memory(&self, memory: EntryMemory) {
        match memory {
            EntryMemory::Empty => {}
            EntryMemory::Owned(buffer) => self.buffer_manager.deallocate_buffer(buffer),
            EntryMemory::Managed(handle) => {
                if let Some(buffer) = self.buffer_manager.acquire_cache(handle) {
                    self.buffer_manager.deallocate_buffer(buffer);
                }
            }
        }
    }

    pub fn destroy_buffer(&self, entry: AssociatedBuffer) {
        self.buffer_manager.deallocate_buffer(entry.buffer);
    }

    pub(super) fn destroy_pending(&self, entry: Option<AssociatedBuffer>) {
        if let Some(entry) = entry {
            self.destroy_buffer(entry);
        }
    }

    /// Takes the resident entry containing `offset` out of the table, or
    /// allocates a new uncached one of up to `ideal_size` bytes (at most two
    /// blocks, never overlapping a resident entry).
    pub fn get_associate_buffer(&self, offset: u64, ideal_size: usize) -> FsResult<AssociatedBuffer> {
        let mut state = self.state.lock();

        let mut actual_size = ideal_size;
        let mut found = None;
        for (index, entry) in state.entries.iter().enumerate() {
            if !entry.is_resident() {
                continue;
            }
            if entry.contains(offset) {
                found = Some(index);
                break;
            }
            if offset <= entry.offset && entry.offset < offset + actual_size as u64 {
                actual_size = (entry.offset - offset) as usize;
            }
        }

        if let Some(index) = found {
            let entry = &mut state.entries[index];
            let memory = entry.memory.take();
            let (entry_offset, entry_size, is_write_back) = (entry.offset, entry.size, entry.is_write_back);
            entry.clear();

            let buffer = match memory {
                EntryMemory::Owned(buffer) => Some(buffer),
                EntryMemory::Managed(handle) => self.buffer_manager.acquire_cache(handle),
                EntryMemory::Empty => None,
            };
            if let Some(buffer) = buffer {
                state.stats.hits += 1;
                return Ok(AssociatedBuffer {
                    offset: entry_offset,
                    size: entry_size,
                    is_cached: true,
                    is_write_back,
                    buffer,
                });
            }
            crate::ktrace!("bcache: entry at {:#x} was reclaimed", entry_offset);
        }

        state.stats.misses += 1;

        if self.buffer_manager.total_allocatable_size() < self.buffer_manager.total_size() / 8 {
            self.flush_range_locked(&mut state, 0, u64::MAX, false)?;
        }

        let block_size = self.block_size;
        let size = actual_size.min(block_size * 2);
        let buffer = allocate_buffer_with_retry(
            &*self.buffer_manager,
            size,
            self.attr,
            self.allocation_retries,
            |b| b.len() >= block_size,
        )?;
        state.stats.entry_creations += 1;

        let size = size.min(align_down(buffer.len() as u64, block_size as u64) as usize);
        Ok(AssociatedBuffer {
            offset,
            size,
            is_cached: false,
            is_write_back: false,
            buffer,
        })
    }

    /// Puts an entry back in the table. Returns its slot, or `None` if an
    /// overlapping entry was already resident and this one was dropped. On
    /// failure the buffer is released.
    pub fn store_associate_buffer(&self, entry: AssociatedBuffer) -> FsResult<Option<usize>> {
        let mut state = self.state.lock();

        if entry.is_write_back {
            if let Err(e) = self.control_dirtiness(&mut state) {
                self.destroy_buffer(entry);
                return Err(e);
            }
        }

        let count = state.entries.len();
        let index = match state.entries.iter().position(|e| !e.is_valid) {
            Some(index) => index,
            None => {
                state.invalidate_index = (state.invalidate_index + 1) % count;
                let victim = state.invalidate_index;
                state.stats.evictions += 1;
                crate::ktrace!(
                    "bcache: evicting slot {} ({:#x})",
                    victim,
                    state.entries[victim].offset
                );
                if let Err(e) = self.flush_cache_entry(&mut state, victim, true) {
                    self.destroy_buffer(entry);
                    return Err(e);
                }
                victim
            }
        };

        let redundant = state
            .entries
            .iter()
            .any(|e| e.is_resident() && e.overlaps(entry.offset, entry.size as u64));
        if redundant {
            state.stats.redundant_drops += 1;
            self.destroy_buffer(entry);
            return Ok(None);
        }

        let memory = if entry.is_write_back {
            EntryMemory::Owned(entry.buffer)
        } else {
            EntryMemory::Managed(self.buffer_manager.register_cache(entry.buffer, self.attr))
        };
        state.entries[index] = CacheEntry {
            offset: entry.offset,
            size: entry.size,
            is_valid: true,
            is_cached: entry.is_cached,
            is_write_back: entry.is_write_back,
            is_flushing: false,
            memory,
        };
        state.invalidate_index = index;
        Ok(Some(index))
    }

    /// Writes a dirty entry back. With `invalidate` the entry is dropped,
    /// otherwise its buffer becomes a clean reclaimable cache.
    fn flush_cache_entry(&self, state: &mut CacheState, index: usize, invalidate: bool) -> FsResult<()> {
        let last_result = state.last_result;
        let entry = &mut state.entries[index];

        if !entry.is_write_back {
            if invalidate {
                let memory = entry.memory.take();
                entry.clear();
                self.release_memory(memory);
            }
            return Ok(());
        }

        entry.is_flushing = true;
        let EntryMemory::Owned(buffer) = entry.memory.take() else {
            crate::kpanic!("bcache: dirty entry {} at {:#x} has no buffer", index, entry.offset);
        };

        let result = match last_result {
            Ok(()) => self.storage.write(entry.offset, &buffer[..entry.size]),
            Err(e) => Err(e),
        };
        crate::ktrace!(
            "bcache: flushed {:#x}+{:#x}{}",
            entry.offset,
            entry.size,
            if invalidate { " (invalidate)" } else { "" }
        );

        entry.is_write_back = false;
        if invalidate {
            self.buffer_manager.deallocate_buffer(buffer);
            entry.clear();
        } else {
            entry.memory = EntryMemory::Managed(self.buffer_manager.register_cache(buffer, self.attr));
            entry.is_flushing = false;
        }
        state.stats.flushes += 1;

        result
    }

    /// Flushes every entry overlapping the range: dirty ones only, or all of
    /// them when invalidating. Returns the first failure.
    fn flush_range_locked(&self, state: &mut CacheState, offset: u64, size: u64, invalidate: bool) -> FsResult<()> {
        let mut result = Ok(());
        for index in 0..state.entries.len() {
            let entry = &state.entries[index];
            if entry.is_valid && (entry.is_write_back || invalidate) && entry.overlaps(offset, size) {
                if let Err(e) = self.flush_cache_entry(state, index, invalidate) {
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }
        result
    }

    pub(super) fn flush_range(&self, offset: u64, size: u64, invalidate: bool) -> FsResult<()> {
        let mut state = self.state.lock();
        self.flush_range_locked(&mut state, offset, size, invalidate)
    }

    /// Flushes slot `index` if it still holds a dirty entry.
    fn flush_entry_at(&self, index: usize) -> FsResult<()> {
        let mut state = self.state.lock();
        match state.entries.get(index) {
            Some(entry) if entry.is_valid && entry.is_write_back => self.flush_cache_entry(&mut state, index, false),
            _ => Ok(()),
        }
    }

    /// Drops every entry overlapping the range without writing it back.
    fn invalidate_range_locked(&self, state: &mut CacheState, offset: u64, size: u64) {
        for entry in state.entries.iter_mut() {
            if entry.is_valid && entry.overlaps(offset, size) {
                let memory = entry.memory.take();
                entry.clear();
                self.release_memory(memory);
            }
        }
    }

    /// Once allocatable memory drops under a quarter of the manager's total,
    /// writes back every dirty entry but the first one found after the
    /// eviction cursor, and moves the cursor to the last one written.
    fn control_dirtiness(&self, state: &mut CacheState) -> FsResult<()> {
        if self.buffer_manager.total_allocatable_size() >= self.buffer_manager.total_size() / 4 {
            return Ok(());
        }

        const THRESHOLD: usize = 2;
        let count = state.entries.len();
        let start = state.invalidate_index;
        let mut dirty = 0;
        let mut flushed_index = start;
        for i in 0..count {
            let index = (start + 1 + i) % count;
            let entry = &state.entries[index];
            if entry.is_valid && entry.is_write_back {
                dirty += 1;
                if dirty >= THRESHOLD {
                    self.flush_cache_entry(state, index, false)?;
                    state.stats.dirty_flushes += 1;
                    flushed_index = index;
                }
            }
        }
        state.invalidate_index = flushed_index;
        Ok(())
    }

    pub fn write(&self, offset: u64, buf: &[u8]) -> FsResult<()> {
        self.check_last_result()?;
        if buf.is_empty() {
            return Ok(());
        }
        if offset >= self.data_size {
            return Err(FsError::InvalidOffset);
        }

        let size = buf.len().min((self.data_size - offset) as usize);
        let block = self.block_size as u64;
        let mut src = &buf[..size];
        let mut offset = offset;
        let mut aligned_offset = align_down(offset, block);
        let aligned_end = align_up(offset + size as u64, block);

        while aligned_offset < aligned_end {
            if self.burst_applies(offset, aligned_offset, src.len()) {
                let aligned_size = align_down(src.len() as u64, block) as usize;
                self.update_last_result(self.flush_range(offset, aligned_size as u64, true))?;
                self.update_last_result(self.storage.write(offset, &src[..aligned_size]))?;
                self.state.lock().stats.burst_writes += 1;

                src = &src[aligned_size..];
                offset += aligned_size as u64;
                aligned_offset += aligned_size as u64;
                continue;
            }

            let mut entry = self.update_last_result(
                self.get_associate_buffer(aligned_offset, (aligned_end - aligned_offset) as usize),
            )?;

            let partial = offset != entry.offset || offset + (src.len() as u64) < entry.end();
            if !entry.is_cached && partial {
                let entry_offset = entry.offset;
                if let Err(e) = self.storage.read(entry_offset, entry.data_mut()) {
                    self.destroy_buffer(entry);
                    return self.update_last_result(Err(e));
                }
            }
            entry.is_cached = true;

            let buffer_offset = (offset - entry.offset) as usize;
            let copy_size = src.len().min((entry.end() - offset) as usize);
            entry.buffer[buffer_offset..buffer_offset + copy_size].copy_from_slice(&src[..copy_size]);
            src = &src[copy_size..];
            offset += copy_size as u64;

            entry.is_write_back = true;
            let entry_end = entry.end();
            let index = self.update_last_result(self.store_associate_buffer(entry))?;
            aligned_offset = entry_end;

            // The rest goes straight to storage; write this entry first.
            if let Some(index) = index {
                if self.burst_applies(offset, aligned_offset, src.len()) {
                    self.update_last_result(self.flush_entry_at(index))?;
                }
            }
        }

        self.check_last_result()
    }

    /// Writes back every dirty entry, then flushes the backing storage.
    pub fn flush(&self) -> FsResult<()> {
        self.check_last_result()?;
        self.update_last_result(self.flush_range(0, u64::MAX, false))?;
        self.update_last_result(self.storage.flush())
    }

    /// Writes back every dirty entry.
    pub fn commit(&self) -> FsResult<()> {
        self.check_last_result()?;
        self.update_last_result(self.flush_range(0, u64::MAX, false))
    }

    /// Drops every entry, dirty ones included, without writing anything.
    pub fn on_rollback(&self) -> FsResult<()> {
        self.check_last_result()?;
        let mut state = self.state.lock();
        for entry in state.entries.iter_mut() {
            if entry.is_valid {
                let memory = entry.memory.take();
                self.release_memory(memory);
            }
            entry.clear();
        }
        crate::kdebug!("bcache: rolled back");
        Ok(())
    }

    pub fn operate_range(&self, op: OperationId, offset: u64, size: u64) -> FsResult<QueryRangeInfo> {
        match op {
            OperationId::Clear => {
                self.clear(offset, size)?;
                Ok(QueryRangeInfo::default())
            }
            OperationId::ClearSignature => {
                self.clear_signature(offset, size)?;
                Ok(QueryRangeInfo::default())
            }
            OperationId::InvalidateCache => {
                if self.storage_type == StorageType::SaveData {
                    return Err(FsError::UnsupportedOperation);
                }
                self.invalidate_cache(offset, size)?;
                Ok(QueryRangeInfo::default())
            }
            OperationId::QueryRange => self.query_range(offset, size),
        }
    }

    /// Zeroes the range. Partial blocks at either end are rewritten through
    /// a work buffer, the aligned middle is cleared by the backing storage.
    fn clear(&self, offset: u64, size: u64) -> FsResult<()> {
        self.check_last_result()?;
        if offset >= self.data_size {
            return Err(FsError::InvalidOffset);
        }

        let block = self.block_size as u64;
        let end = offset.saturating_add(size);
        let mut start_offset = align_down(offset, block);
        let mut end_offset = align_up(end.min(self.data_size), block);

        self.update_last_result(self.flush_range(offset, size, true))?;

        if start_offset < offset || end < end_offset {
            let mut work = vec![0u8; self.block_size];

            if start_offset < offset {
                self.update_last_result(self.storage.read(start_offset, &mut work))?;
                let clear_offset = (offset - start_offset) as usize;
                let clear_size = (self.block_size - clear_offset).min(size as usize);
                work[clear_offset..clear_offset + clear_size].fill(0);
                self.update_last_result(self.storage.write(start_offset, &work))?;
                start_offset += block;
            }

            if start_offset < end && end < end_offset {
                let last_offset = end_offset - block;
                self.update_last_result(self.storage.read(last_offset, &mut work))?;
                let clear_size = (end - last_offset) as usize;
                work[..clear_size].fill(0);
                self.update_last_result(self.storage.write(last_offset, &work))?;
                end_offset -= block;
            }
        }

        if start_offset >= end_offset {
            return Ok(());
        }
        self.update_last_result(self.storage.operate_range(
            OperationId::Clear,
            start_offset,
            end_offset - start_offset,
        ))?;
        Ok(())
    }

    /// Clears the whole blocks inside the range.
    fn clear_signature(&self, offset: u64, size: u64) -> FsResult<()> {
        self.check_last_result()?;
        if offset >= self.data_size {
            return Err(FsError::InvalidOffset);
        }

        let block = self.block_size as u64;
        let start_offset = align_up(offset, block);
        let end_offset = align_down(offset.saturating_add(size).min(self.data_size), block);

        self.update_last_result(self.flush_range(offset, size, true))?;

        if start_offset < end_offset {
            self.update_last_result(self.storage.operate_range(
                OperationId::ClearSignature,
                start_offset,
                end_offset - start_offset,
            ))?;
        }
        Ok(())
    }

    /// Drops cached entries for the range without writing them and passes
    /// the request down. Clears a latched integrity failure.
    fn invalidate_cache(&self, offset: u64, size: u64) -> FsResult<()> {
        if offset > self.data_size {
            return Err(FsError::InvalidOffset);
        }

        {
            let mut state = self.state.lock();
            self.invalidate_range_locked(&mut state, offset, size);
        }

        let (aligned_offset, aligned_size) = self.aligned_query_range(offset, size);
        self.storage
            .operate_range(OperationId::InvalidateCache, aligned_offset, aligned_size)?;

        let mut state = self.state.lock();
        if state.last_result == Err(FsError::IntegrityVerificationStorageCorrupted) {
            crate::kinfo!("bcache: cleared latched integrity failure");
            state.last_result = Ok(());
        }
        Ok(())
    }

    fn query_range(&self, offset: u64, size: u64) -> FsResult<QueryRangeInfo> {
        if offset > self.data_size {
            return Err(FsError::InvalidOffset);
        }
        let (aligned_offset, aligned_size) = self.aligned_query_range(offset, size);
        self.update_last_result(self.storage.operate_range(
            OperationId::QueryRange,
            aligned_offset,
            aligned_size,
        ))
    }

    fn aligned_query_range(&self, offset: u64, size: u64) -> (u64, u64) {
        let block = self.block_size as u64;
        let actual_size = size.min(self.data_size - offset);
        let aligned_offset = align_down(offset, block);
        let aligned_end = align_up(offset + actual_size, block);
        (aligned_offset, aligned_end - aligned_offset)
    }
}

impl Storage for BlockCacheBufferedStorage {
    fn read(&self, offset: u64, buf: &mut [u8]) -> FsResult<()> {
        BlockCacheBufferedStorage::read(self, offset, buf)
    }

    fn write(&self, offset: u64, buf: &[u8]) -> FsResult<()> {
        BlockCacheBufferedStorage::write(self, offset, buf)
    }

    fn flush(&self) -> FsResult<()> {
        BlockCacheBufferedStorage::flush(self)
    }

    fn size(&self) -> FsResult<u64> {
        Ok(self.data_size)
    }

    fn operate_range(&self, op: OperationId, offset: u64, size: u64) -> FsResult<QueryRangeInfo> {
        BlockCacheBufferedStorage::operate_range(self, op, offset, size)
    }
}

impl Drop for BlockCacheBufferedStorage {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if let Err(e) = self.flush_range_locked(&mut state, 0, u64::MAX, true) {
            crate::kwarn!("bcache: dropping dirty data on finalize: {}", e);
        }
    }
}
