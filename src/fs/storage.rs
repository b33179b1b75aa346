//! Block storage interface
//!
//! Offsets and sizes are in bytes. Implementations use interior locking so a
//! storage can be shared between layers through `Arc<dyn Storage>`.

use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use super::error::{FsError, FsResult};

/// Range operations beyond plain read and write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationId {
    /// Zero the range.
    Clear,
    /// Zero only the whole blocks inside the range.
    ClearSignature,
    /// Drop any cached copy of the range.
    InvalidateCache,
    /// Report properties of the range.
    QueryRange,
}

/// Result of [`OperationId::QueryRange`]. Layers combine the answers of the
/// storages below them with [`QueryRangeInfo::merge`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryRangeInfo {
    pub aes_ctr_key_type: i32,
    pub speed_emulation_type: i32,
}

impl QueryRangeInfo {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn merge(&mut self, other: &QueryRangeInfo) {
        self.aes_ctr_key_type |= other.aes_ctr_key_type;
        self.speed_emulation_type |= other.speed_emulation_type;
    }
}

pub trait Storage: Send + Sync {
    fn read(&self, offset: u64, buf: &mut [u8]) -> FsResult<()>;
    fn write(&self, offset: u64, buf: &[u8]) -> FsResult<()>;
    fn flush(&self) -> FsResult<()>;
    fn size(&self) -> FsResult<u64>;
    fn operate_range(&self, op: OperationId, offset: u64, size: u64) -> FsResult<QueryRangeInfo>;
}

/// Bounds check shared by the simple storages.
pub(crate) fn check_access_range(offset: u64, size: u64, total: u64) -> FsResult<()> {
    let end = offset.checked_add(size).ok_or(FsError::OutOfRange)?;
    if end > total {
        return Err(FsError::OutOfRange);
    }
    Ok(())
}

/// Fixed-size storage backed by a heap vector.
pub struct MemoryStorage {
    data: Mutex<Vec<u8>>,
    query_info: QueryRangeInfo,
}

impl MemoryStorage {
    pub fn new(size: usize) -> Self {
        Self {
            data: Mutex::new(vec![0u8; size]),
            query_info: QueryRangeInfo::default(),
        }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
            query_info: QueryRangeInfo::default(),
        }
    }

    /// Answer `QueryRange` with `info` instead of an empty record.
    pub fn with_query_info(mut self, info: QueryRangeInfo) -> Self {
        self.query_info = info;
        self
    }

    /// Copy of the whole contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl Storage for MemoryStorage {
    fn read(&self, offset: u64, buf: &mut [u8]) -> FsResult<()> {
        let data = self.data.lock();
        check_access_range(offset, buf.len() as u64, data.len() as u64)?;
        let start = offset as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write(&self, offset: u64, buf: &[u8]) -> FsResult<()> {
        let mut data = self.data.lock();
        check_access_range(offset, buf.len() as u64, data.len() as u64)?;
        let start = offset as usize;
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> FsResult<()> {
        Ok(())
    }

    fn size(&self) -> FsResult<u64> {
        Ok(self.data.lock().len() as u64)
    }

    fn operate_range(&self, op: OperationId, offset: u64, size: u64) -> FsResult<QueryRangeInfo> {
        match op {
            OperationId::Clear | OperationId::ClearSignature => {
                let mut data = self.data.lock();
                check_access_range(offset, size, data.len() as u64)?;
                let start = offset as usize;
                data[start..start + size as usize].fill(0);
                Ok(QueryRangeInfo::default())
            }
            OperationId::InvalidateCache => Ok(QueryRangeInfo::default()),
            OperationId::QueryRange => Ok(self.query_info),
        }
    }
}
