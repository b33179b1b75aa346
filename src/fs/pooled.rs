//! Pooled scratch buffers
//!
//! A `BufferPool` hands out short-lived buffers from a fixed byte budget.
//! Particularly-large requests are allowed to come back smaller than asked
//! for, down to a required minimum; callers check `len()`.

use alloc::vec;
use alloc::vec::Vec;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};

use super::error::{FsError, FsResult};

/// Upper bound for a regular pooled allocation.
pub const DEFAULT_BUFFER_SIZE_MAX: usize = 128 * 1024;
/// Upper bound for a particularly-large pooled allocation.
pub const DEFAULT_PARTICULARLY_LARGE_SIZE_MAX: usize = 4 * 1024 * 1024;

pub struct BufferPool {
    capacity: usize,
    in_use: AtomicUsize,
    buffer_size_max: usize,
    particularly_large_size_max: usize,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            in_use: AtomicUsize::new(0),
            buffer_size_max: DEFAULT_BUFFER_SIZE_MAX,
            particularly_large_size_max: DEFAULT_PARTICULARLY_LARGE_SIZE_MAX,
        }
    }

    pub fn with_limits(capacity: usize, buffer_size_max: usize, particularly_large_size_max: usize) -> Self {
        Self {
            capacity,
            in_use: AtomicUsize::new(0),
            buffer_size_max,
            particularly_large_size_max,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// Between `required` and `ideal` bytes, capped at the regular maximum.
    pub fn allocate(&self, ideal: usize, required: usize) -> FsResult<PooledBuffer<'_>> {
        self.allocate_core(ideal, required, self.buffer_size_max)
    }

    /// Between `required` and `ideal` bytes, capped at the particularly-large
    /// maximum.
    pub fn allocate_particularly_large(&self, ideal: usize, required: usize) -> FsResult<PooledBuffer<'_>> {
        self.allocate_core(ideal, required, self.particularly_large_size_max)
    }

    fn allocate_core(&self, ideal: usize, required: usize, limit: usize) -> FsResult<PooledBuffer<'_>> {
        if required > ideal || required > limit {
            return Err(FsError::PooledBufferNotEnoughSize);
        }

        let mut current = self.in_use.load(Ordering::Acquire);
        loop {
            let free = self.capacity.saturating_sub(current);
            let size = ideal.min(limit).min(free);
            if size < required || size == 0 {
                crate::kdebug!(
                    "pool: cannot satisfy {}..{} bytes, {} free",
                    required,
                    ideal,
                    free
                );
                return Err(FsError::PooledBufferNotEnoughSize);
            }
            match self.in_use.compare_exchange_weak(
                current,
                current + size,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Ok(PooledBuffer {
                        pool: self,
                        data: vec![0u8; size],
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self, size: usize) {
        self.in_use.fetch_sub(size, Ordering::AcqRel);
    }
}

/// Buffer borrowed from a [`BufferPool`]; returned on drop.
pub struct PooledBuffer<'a> {
    pool: &'a BufferPool,
    data: Vec<u8>,
}

impl PooledBuffer<'_> {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Deref for PooledBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        self.pool.release(self.data.len());
    }
}
