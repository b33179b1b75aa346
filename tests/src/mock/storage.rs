//! Instrumented backing store

use std::sync::Mutex;

use crate::fs::{FsError, FsResult, MemoryStorage, OperationId, QueryRangeInfo, Storage};

/// One request seen by [`RecordingStorage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageRequest {
    Read { offset: u64, size: usize },
    Write { offset: u64, size: usize },
    Flush,
    Operate { op: OperationId, offset: u64, size: u64 },
}

#[derive(Default)]
struct Faults {
    read: Option<FsError>,
    write: Option<FsError>,
    flush: Option<FsError>,
    operate: Option<FsError>,
}

/// `MemoryStorage` that logs every request and fails on demand.
///
/// A failing request is logged but does not touch the data.
pub struct RecordingStorage {
    inner: MemoryStorage,
    log: Mutex<Vec<StorageRequest>>,
    faults: Mutex<Faults>,
}

impl RecordingStorage {
    pub fn new(data: Vec<u8>) -> Self {
        Self::with_storage(MemoryStorage::from_vec(data))
    }

    pub fn with_storage(inner: MemoryStorage) -> Self {
        Self {
            inner,
            log: Mutex::new(Vec::new()),
            faults: Mutex::new(Faults::default()),
        }
    }

    pub fn fail_reads(&self, error: Option<FsError>) {
        self.faults.lock().unwrap().read = error;
    }

    pub fn fail_writes(&self, error: Option<FsError>) {
        self.faults.lock().unwrap().write = error;
    }

    pub fn fail_flush(&self, error: Option<FsError>) {
        self.faults.lock().unwrap().flush = error;
    }

    pub fn fail_operate(&self, error: Option<FsError>) {
        self.faults.lock().unwrap().operate = error;
    }

    pub fn requests(&self) -> Vec<StorageRequest> {
        self.log.lock().unwrap().clone()
    }

    pub fn clear_requests(&self) {
        self.log.lock().unwrap().clear();
    }

    pub fn read_count(&self) -> usize {
        self.count(|r| matches!(r, StorageRequest::Read { .. }))
    }

    pub fn write_count(&self) -> usize {
        self.count(|r| matches!(r, StorageRequest::Write { .. }))
    }

    /// Offsets of every write, in order.
    pub fn write_offsets(&self) -> Vec<u64> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter_map(|r| match r {
                StorageRequest::Write { offset, .. } => Some(*offset),
                _ => None,
            })
            .collect()
    }

    pub fn operations(&self) -> Vec<(OperationId, u64, u64)> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter_map(|r| match r {
                StorageRequest::Operate { op, offset, size } => Some((*op, *offset, *size)),
                _ => None,
            })
            .collect()
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.snapshot()
    }

    fn count(&self, pred: impl Fn(&StorageRequest) -> bool) -> usize {
        self.log.lock().unwrap().iter().filter(|r| pred(r)).count()
    }

    fn record(&self, request: StorageRequest) {
        self.log.lock().unwrap().push(request);
    }
}

impl Storage for RecordingStorage {
    fn read(&self, offset: u64, buf: &mut [u8]) -> FsResult<()> {
        self.record(StorageRequest::Read { offset, size: buf.len() });
        if let Some(e) = self.faults.lock().unwrap().read {
            return Err(e);
        }
        self.inner.read(offset, buf)
    }

    fn write(&self, offset: u64, buf: &[u8]) -> FsResult<()> {
        self.record(StorageRequest::Write { offset, size: buf.len() });
        if let Some(e) = self.faults.lock().unwrap().write {
            return Err(e);
        }
        self.inner.write(offset, buf)
    }

    fn flush(&self) -> FsResult<()> {
        self.record(StorageRequest::Flush);
        if let Some(e) = self.faults.lock().unwrap().flush {
            return Err(e);
        }
        self.inner.flush()
    }

    fn size(&self) -> FsResult<u64> {
        self.inner.size()
    }

    fn operate_range(&self, op: OperationId, offset: u64, size: u64) -> FsResult<QueryRangeInfo> {
        self.record(StorageRequest::Operate { op, offset, size });
        if let Some(e) = self.faults.lock().unwrap().operate {
            return Err(e);
        }
        self.inner.operate_range(op, offset, size)
    }
}
