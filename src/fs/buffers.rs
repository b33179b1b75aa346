//! Buffer manager interface
//!
//! Caches borrow their memory from a shared `BufferManager`. A buffer is
//! either held by its user (after `allocate_buffer` or `acquire_cache`) or
//! registered with the manager as a reclaimable cache (after
//! `register_cache`). The manager may drop registered caches whenever it
//! needs memory; `acquire_cache` then returns `None`.
//!
//! Buffers are returned explicitly with `deallocate_buffer`. A `Buffer`
//! that is simply dropped is never credited back to the budget.

use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;
use core::ops::{Deref, DerefMut};
use spin::Mutex;

use super::error::{FsError, FsResult};

/// Memory handed out by a [`BufferManager`].
#[derive(Debug, PartialEq, Eq)]
pub struct Buffer {
    data: Vec<u8>,
}

impl Buffer {
    pub fn new(size: usize) -> Self {
        Self { data: vec![0u8; size] }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Opaque ticket for a buffer registered as a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheHandle(pub u64);

/// Allocation hints. `level` selects the priority tier the allocation is
/// charged to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferAttribute {
    pub level: i32,
}

impl BufferAttribute {
    pub const fn new(level: i32) -> Self {
        Self { level }
    }
}

pub trait BufferManager: Send + Sync {
    fn allocate_buffer(&self, size: usize, attr: BufferAttribute) -> Option<Buffer>;
    fn deallocate_buffer(&self, buffer: Buffer);
    fn register_cache(&self, buffer: Buffer, attr: BufferAttribute) -> CacheHandle;
    /// Takes a registered cache back. `None` if it was reclaimed.
    fn acquire_cache(&self, handle: CacheHandle) -> Option<Buffer>;
    fn total_size(&self) -> usize;
    fn total_allocatable_size(&self) -> usize;
}

/// Allocates `size` bytes, retrying up to `attempts` times while the manager
/// is out of memory or hands back a buffer `accept` rejects.
pub fn allocate_buffer_with_retry<F>(
    manager: &dyn BufferManager,
    size: usize,
    attr: BufferAttribute,
    attempts: u32,
    accept: F,
) -> FsResult<Buffer>
where
    F: Fn(&Buffer) -> bool,
{
    for attempt in 0..attempts.max(1) {
        match manager.allocate_buffer(size, attr) {
            Some(buffer) if accept(&buffer) => return Ok(buffer),
            Some(buffer) => {
                crate::ktrace!(
                    "buffers: attempt {} got {} bytes for a {} byte request",
                    attempt,
                    buffer.len(),
                    size
                );
                manager.deallocate_buffer(buffer);
            }
            None => {
                crate::ktrace!("buffers: attempt {} for {} bytes failed", attempt, size);
            }
        }
        core::hint::spin_loop();
    }

    crate::kwarn!(
        "buffers: giving up on {} bytes after {} attempts ({} of {} allocatable)",
        size,
        attempts.max(1),
        manager.total_allocatable_size(),
        manager.total_size()
    );
    Err(FsError::BufferAllocationFailed)
}

struct ManagerState {
    allocated: usize,
    cached: usize,
    caches: VecDeque<(CacheHandle, Buffer)>,
    next_handle: u64,
    peak_allocated: usize,
    reclaimed: u64,
}

/// Budgeted heap-backed buffer manager.
///
/// Registered caches count against the budget until reclaimed. When an
/// allocation does not fit, caches are reclaimed oldest first.
pub struct MemoryBufferManager {
    total: usize,
    state: Mutex<ManagerState>,
}

impl MemoryBufferManager {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            state: Mutex::new(ManagerState {
                allocated: 0,
                cached: 0,
                caches: VecDeque::new(),
                next_handle: 1,
                peak_allocated: 0,
                reclaimed: 0,
            }),
        }
    }

    /// Bytes currently held by users.
    pub fn allocated_size(&self) -> usize {
        self.state.lock().allocated
    }

    /// Bytes currently registered as caches.
    pub fn cached_size(&self) -> usize {
        self.state.lock().cached
    }

    pub fn cache_count(&self) -> usize {
        self.state.lock().caches.len()
    }

    pub fn peak_allocated_size(&self) -> usize {
        self.state.lock().peak_allocated
    }

    /// Number of caches dropped to satisfy allocations.
    pub fn reclaimed_count(&self) -> u64 {
        self.state.lock().reclaimed
    }

    fn free_size(&self, state: &ManagerState) -> usize {
        self.total.saturating_sub(state.allocated + state.cached)
    }
}

impl BufferManager for MemoryBufferManager {
    fn allocate_buffer(&self, size: usize, _attr: BufferAttribute) -> Option<Buffer> {
        if size > self.total {
            return None;
        }

        let mut state = self.state.lock();
        while self.free_size(&state) < size {
            let (handle, victim) = state.caches.pop_front()?;
            state.cached -= victim.len();
            state.reclaimed += 1;
            crate::ktrace!("buffers: reclaimed cache {:?} ({} bytes)", handle, victim.len());
        }

        state.allocated += size;
        state.peak_allocated = state.peak_allocated.max(state.allocated);
        Some(Buffer::new(size))
    }

    fn deallocate_buffer(&self, buffer: Buffer) {
        let mut state = self.state.lock();
        state.allocated = state.allocated.saturating_sub(buffer.len());
    }

    fn register_cache(&self, buffer: Buffer, _attr: BufferAttribute) -> CacheHandle {
        let mut state = self.state.lock();
        let handle = CacheHandle(state.next_handle);
        state.next_handle += 1;
        state.allocated = state.allocated.saturating_sub(buffer.len());
        state.cached += buffer.len();
        state.caches.push_back((handle, buffer));
        handle
    }

    fn acquire_cache(&self, handle: CacheHandle) -> Option<Buffer> {
        let mut state = self.state.lock();
        let pos = state.caches.iter().position(|(h, _)| *h == handle)?;
        let (_, buffer) = state.caches.remove(pos)?;
        state.cached -= buffer.len();
        state.allocated += buffer.len();
        state.peak_allocated = state.peak_allocated.max(state.allocated);
        Some(buffer)
    }

    fn total_size(&self) -> usize {
        self.total
    }

    fn total_allocatable_size(&self) -> usize {
        let state = self.state.lock();
        self.free_size(&state)
    }
}
