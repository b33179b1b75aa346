//! Index-addressed object table.
//!
//! Threads, lock records and wait queues live in slabs and refer to each
//! other by index, never by pointer. Freed slots are reused lowest index
//! first so ids stay small.

use alloc::collections::BTreeSet;
use alloc::vec::Vec;

/// Errors for `Slab` operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabError {
    /// Table already holds `capacity` objects.
    Full,
}

pub struct Slab<T> {
    slots: Vec<Option<T>>,
    free: BTreeSet<u32>,
    len: usize,
    capacity: usize,
}

impl<T> Slab<T> {
    pub const fn with_limit(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: BTreeSet::new(),
            len: 0,
            capacity,
        }
    }

    pub fn insert(&mut self, value: T) -> Result<u32, SlabError> {
        self.insert_with(|_| value)
    }

    /// Inserts the value built from the index it will occupy.
    pub fn insert_with(&mut self, build: impl FnOnce(u32) -> T) -> Result<u32, SlabError> {
        if self.len >= self.capacity {
            return Err(SlabError::Full);
        }
        let index = match self.free.pop_first() {
            Some(index) => index,
            None => {
                self.slots.push(None);
                (self.slots.len() - 1) as u32
            }
        };
        self.slots[index as usize] = Some(build(index));
        self.len += 1;
        Ok(index)
    }

    pub fn remove(&mut self, index: u32) -> Option<T> {
        let value = self.slots.get_mut(index as usize)?.take()?;
        self.free.insert(index);
        self.len -= 1;
        Some(value)
    }

    #[inline]
    pub fn get(&self, index: u32) -> Option<&T> {
        self.slots.get(index as usize)?.as_ref()
    }

    #[inline]
    pub fn get_mut(&mut self, index: u32) -> Option<&mut T> {
        self.slots.get_mut(index as usize)?.as_mut()
    }

    pub fn contains(&self, index: u32) -> bool {
        self.get(index).is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|v| (i as u32, v)))
    }
}
