//! Range Operation Tests

use crate::fs::{FsError, MemoryStorage, OperationId, QueryRangeInfo};
use crate::mock::{pattern, RecordingStorage, StorageRequest};

use super::{cache_config, read_at, setup, setup_with, BLOCK, MIB, STORAGE_SIZE};

// ============================================================================
// Clear
// ============================================================================

#[test]
fn test_clear_rewrites_partial_blocks() {
    let fx = setup(&cache_config(8));
    fx.cache.operate_range(OperationId::Clear, 100, 8000).unwrap();

    assert_eq!(
        fx.storage.requests(),
        vec![
            StorageRequest::Read { offset: 0, size: BLOCK },
            StorageRequest::Write { offset: 0, size: BLOCK },
            StorageRequest::Read { offset: 4096, size: BLOCK },
            StorageRequest::Write { offset: 4096, size: BLOCK },
        ]
    );

    let mut expected = pattern(STORAGE_SIZE);
    expected[100..8100].fill(0);
    assert_eq!(fx.storage.snapshot(), expected);
}

#[test]
fn test_clear_inside_one_block() {
    let fx = setup(&cache_config(8));
    fx.cache.operate_range(OperationId::Clear, 100, 200).unwrap();

    let mut expected = pattern(STORAGE_SIZE);
    expected[100..300].fill(0);
    assert_eq!(fx.storage.snapshot(), expected);
    assert!(fx.storage.operations().is_empty());
}

#[test]
fn test_aligned_clear_is_passed_down() {
    let fx = setup(&cache_config(8));
    fx.cache.operate_range(OperationId::Clear, 4096, 8192).unwrap();

    assert_eq!(fx.storage.operations(), vec![(OperationId::Clear, 4096, 8192)]);
    assert_eq!(fx.storage.read_count(), 0);
    assert!(fx.storage.snapshot()[4096..12288].iter().all(|&b| b == 0));
}

#[test]
fn test_clear_mixes_partial_and_aligned_blocks() {
    let fx = setup(&cache_config(8));
    fx.cache.operate_range(OperationId::Clear, 2048, 4 * BLOCK as u64).unwrap();

    assert_eq!(fx.storage.write_offsets(), vec![0, 16384]);
    assert_eq!(fx.storage.operations(), vec![(OperationId::Clear, 4096, 12288)]);

    let mut expected = pattern(STORAGE_SIZE);
    expected[2048..2048 + 4 * BLOCK].fill(0);
    assert_eq!(fx.storage.snapshot(), expected);
}

#[test]
fn test_clear_drops_cached_copy() {
    let fx = setup(&cache_config(8));
    assert_eq!(read_at(&fx, 0, BLOCK), pattern(STORAGE_SIZE)[..BLOCK].to_vec());

    fx.cache.operate_range(OperationId::Clear, 0, BLOCK as u64).unwrap();
    assert_eq!(fx.cache.valid_entry_count(), 0);
    assert_eq!(read_at(&fx, 0, BLOCK), vec![0u8; BLOCK]);
}

#[test]
fn test_clear_signature_covers_whole_blocks_only() {
    let fx = setup(&cache_config(8));
    fx.cache.operate_range(OperationId::ClearSignature, 100, 8192).unwrap();
    assert_eq!(fx.storage.operations(), vec![(OperationId::ClearSignature, 4096, 4096)]);

    // No whole block inside: nothing is passed down.
    fx.storage.clear_requests();
    fx.cache.operate_range(OperationId::ClearSignature, 100, 200).unwrap();
    assert!(fx.storage.operations().is_empty());
}

#[test]
fn test_range_operations_check_offset() {
    let fx = setup(&cache_config(8));
    let end = STORAGE_SIZE as u64;

    assert_eq!(fx.cache.operate_range(OperationId::Clear, end, 1), Err(FsError::InvalidOffset));
    assert_eq!(
        fx.cache.operate_range(OperationId::ClearSignature, end, 1),
        Err(FsError::InvalidOffset)
    );
    assert_eq!(
        fx.cache.operate_range(OperationId::QueryRange, end + 1, 1),
        Err(FsError::InvalidOffset)
    );
    assert_eq!(
        fx.cache.operate_range(OperationId::InvalidateCache, end + 1, 1),
        Err(FsError::InvalidOffset)
    );
    assert_eq!(fx.cache.last_result(), Ok(()));
}

// ============================================================================
// InvalidateCache and QueryRange
// ============================================================================

#[test]
fn test_invalidate_drops_dirty_data() {
    let fx = setup(&cache_config(8));
    fx.cache.write(6096, b"0123456789").unwrap();

    fx.cache
        .operate_range(OperationId::InvalidateCache, 0, STORAGE_SIZE as u64)
        .unwrap();
    assert_eq!(fx.cache.valid_entry_count(), 0);
    assert_eq!(fx.storage.write_count(), 0);
    assert_eq!(
        fx.storage.operations(),
        vec![(OperationId::InvalidateCache, 0, STORAGE_SIZE as u64)]
    );
    assert_eq!(read_at(&fx, 6096, 10), pattern(STORAGE_SIZE)[6096..6106].to_vec());
}

#[test]
fn test_invalidate_only_touches_range() {
    let fx = setup(&cache_config(8));
    fx.cache.write(0, &[1u8; BLOCK]).unwrap();
    fx.cache.write(8 * BLOCK as u64, &[2u8; BLOCK]).unwrap();

    fx.cache.operate_range(OperationId::InvalidateCache, 100, 10).unwrap();
    assert_eq!(fx.cache.resident_entries(), vec![(8 * BLOCK as u64, BLOCK, true)]);
    assert_eq!(fx.storage.operations(), vec![(OperationId::InvalidateCache, 0, BLOCK as u64)]);
}

#[test]
fn test_query_range_uses_aligned_range() {
    let info = QueryRangeInfo {
        aes_ctr_key_type: 1,
        speed_emulation_type: 2,
    };
    let storage = RecordingStorage::with_storage(MemoryStorage::from_vec(pattern(STORAGE_SIZE)).with_query_info(info));
    let fx = setup_with(&cache_config(8), storage, MIB, MIB);

    assert_eq!(fx.cache.operate_range(OperationId::QueryRange, 100, 10), Ok(info));
    assert_eq!(fx.storage.operations(), vec![(OperationId::QueryRange, 0, BLOCK as u64)]);

    // Clipped to the end of the storage.
    fx.storage.clear_requests();
    let end = STORAGE_SIZE as u64;
    fx.cache.operate_range(OperationId::QueryRange, end - 100, 1000).unwrap();
    assert_eq!(
        fx.storage.operations(),
        vec![(OperationId::QueryRange, end - BLOCK as u64, BLOCK as u64)]
    );
}

#[test]
fn test_query_range_failure_is_latched() {
    let fx = setup(&cache_config(8));
    fx.storage.fail_operate(Some(FsError::IoError));

    assert_eq!(
        fx.cache.operate_range(OperationId::QueryRange, 0, 10),
        Err(FsError::IoError)
    );
    assert_eq!(fx.cache.last_result(), Err(FsError::IoError));
}
