/// Error type for storage operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FsError {
    /// Generic allocation failure
    OutOfMemory = 1,
    /// The buffer manager could not satisfy an allocation after retrying
    BufferAllocationFailed = 2,
    /// A pooled buffer came back smaller than the request
    PooledBufferNotEnoughSize = 3,
    /// Offset at or past the end of the storage
    InvalidOffset = 4,
    /// Size or alignment not acceptable for this storage
    InvalidSize = 5,
    /// Range runs past the end of the storage
    OutOfRange = 6,
    /// Operation not supported by this storage
    UnsupportedOperation = 7,
    /// The integrity layer below reported corruption
    IntegrityVerificationStorageCorrupted = 8,
    /// I/O error
    IoError = 9,
    /// Read-only storage
    ReadOnly = 10,
    /// Storage used before initialization or after finalization
    NotInitialized = 11,
}

impl FsError {
    /// Convert to POSIX errno value
    pub fn to_errno(&self) -> i32 {
        match self {
            FsError::OutOfMemory => -12,                           // ENOMEM
            FsError::BufferAllocationFailed => -12,                // ENOMEM
            FsError::PooledBufferNotEnoughSize => -12,             // ENOMEM
            FsError::InvalidOffset => -22,                         // EINVAL
            FsError::InvalidSize => -22,                           // EINVAL
            FsError::OutOfRange => -34,                            // ERANGE
            FsError::UnsupportedOperation => -95,                  // ENOTSUP
            FsError::IntegrityVerificationStorageCorrupted => -74, // EBADMSG
            FsError::IoError => -5,                                // EIO
            FsError::ReadOnly => -30,                              // EROFS
            FsError::NotInitialized => -19,                        // ENODEV
        }
    }

    /// Allocation failures are transient and never latched.
    pub const fn is_buffer_allocation_failure(&self) -> bool {
        matches!(
            self,
            FsError::OutOfMemory | FsError::BufferAllocationFailed | FsError::PooledBufferNotEnoughSize
        )
    }

    pub const fn description(&self) -> &'static str {
        match self {
            FsError::OutOfMemory => "out of memory",
            FsError::BufferAllocationFailed => "buffer allocation failed",
            FsError::PooledBufferNotEnoughSize => "pooled buffer not enough size",
            FsError::InvalidOffset => "invalid offset",
            FsError::InvalidSize => "invalid size",
            FsError::OutOfRange => "out of range",
            FsError::UnsupportedOperation => "unsupported operation",
            FsError::IntegrityVerificationStorageCorrupted => "integrity verification storage corrupted",
            FsError::IoError => "i/o error",
            FsError::ReadOnly => "read-only storage",
            FsError::NotInitialized => "storage not initialized",
        }
    }
}

impl core::fmt::Display for FsError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.description())
    }
}

/// Result type alias for storage operations
pub type FsResult<T> = Result<T, FsError>;
