//! Storage subsystem
//!
//! This module contains the block storage layers the kernel stacks under
//! its filesystems:
//! - `storage`: the `Storage` trait, range operations and an in-memory
//!   backing store
//! - `buffers`: the buffer manager interface and a budgeted implementation
//! - `pooled`: particularly-large scratch buffers for bulk reads
//! - `block_cache`: the write-back block cache (`BlockCacheBufferedStorage`)
//!
//! ```text
//! ┌──────────────┐     ┌───────────────────────────┐     ┌───────────────┐
//! │  fs / caller │────▶│ BlockCacheBufferedStorage │────▶│ backing store │
//! └──────────────┘     └───────────────────────────┘     └───────────────┘
//!                          │                 │
//!                          ▼                 ▼
//!                   BufferManager       BufferPool
//! ```

pub mod block_cache;
pub mod buffers;
pub mod error;
pub mod pooled;
pub mod storage;

pub use block_cache::{BlockCacheBufferedStorage, CacheStats};
pub use buffers::{Buffer, BufferAttribute, BufferManager, CacheHandle, MemoryBufferManager};
pub use error::{FsError, FsResult};
pub use pooled::{BufferPool, PooledBuffer};
pub use storage::{MemoryStorage, OperationId, QueryRangeInfo, Storage};

/// What the cached storage holds. Save data never drops its cache on
/// request; everything else may.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    SaveData,
    Generic,
}

impl StorageType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "savedata" | "save" => Some(StorageType::SaveData),
            "generic" => Some(StorageType::Generic),
            _ => None,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            StorageType::SaveData => "savedata",
            StorageType::Generic => "generic",
        }
    }
}
