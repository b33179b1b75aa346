//! Block Cache Read/Write Tests

use crate::config::CacheConfig;
use crate::fs::{Storage, StorageType};
use crate::mock::{pattern, RecordingStorage, StorageRequest};

use super::{cache_config, read_at, setup, setup_with, BLOCK, MIB, STORAGE_SIZE};

// ============================================================================
// Writes and hits
// ============================================================================

#[test]
fn test_partial_write_reads_block_in() {
    let fx = setup(&cache_config(8));
    fx.cache.write(6096, b"0123456789").unwrap();

    assert_eq!(fx.storage.requests(), vec![StorageRequest::Read { offset: 4096, size: BLOCK }]);
    assert_eq!(fx.cache.dirty_entry_count(), 1);
    assert_eq!(fx.cache.resident_entries(), vec![(4096, BLOCK, true)]);
    let stats = fx.cache.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.entry_creations, 1);
}

#[test]
fn test_read_back_is_served_from_cache() {
    let fx = setup(&cache_config(8));
    fx.cache.write(6096, b"0123456789").unwrap();
    fx.storage.clear_requests();

    assert_eq!(read_at(&fx, 6096, 10), b"0123456789");
    assert!(fx.storage.requests().is_empty());
    assert_eq!(fx.cache.stats().hits, 1);

    // Bytes around the write still come from the block read in earlier.
    assert_eq!(read_at(&fx, 4096, 16), pattern(STORAGE_SIZE)[4096..4112].to_vec());
}

#[test]
fn test_flush_writes_dirty_entry_back() {
    let fx = setup(&cache_config(8));
    fx.cache.write(6096, b"0123456789").unwrap();
    fx.storage.clear_requests();

    fx.cache.flush().unwrap();
    assert_eq!(
        fx.storage.requests(),
        vec![StorageRequest::Write { offset: 4096, size: BLOCK }, StorageRequest::Flush]
    );
    assert_eq!(&fx.storage.snapshot()[6096..6106], b"0123456789");
    assert_eq!(fx.cache.dirty_entry_count(), 0);
    assert_eq!(fx.cache.resident_entries(), vec![(4096, BLOCK, false)]);

    fx.cache.flush().unwrap();
    assert_eq!(fx.storage.write_count(), 1);
}

#[test]
fn test_commit_does_not_flush_storage() {
    let fx = setup(&cache_config(8));
    fx.cache.write(0, &[7u8; BLOCK]).unwrap();

    fx.cache.commit().unwrap();
    assert_eq!(fx.storage.requests(), vec![StorageRequest::Write { offset: 0, size: BLOCK }]);
}

#[test]
fn test_full_block_write_skips_read_in() {
    let fx = setup(&cache_config(8));
    fx.cache.write(BLOCK as u64, &[0x5a; BLOCK]).unwrap();
    assert_eq!(fx.storage.read_count(), 0);
    assert_eq!(fx.cache.dirty_entry_count(), 1);
}

#[test]
fn test_write_spanning_entries() {
    let fx = setup(&cache_config(8));
    fx.cache.write(2048, &[0xaa; 3 * BLOCK]).unwrap();

    assert_eq!(
        fx.storage.requests(),
        vec![
            StorageRequest::Read { offset: 0, size: 2 * BLOCK },
            StorageRequest::Read { offset: 8192, size: 2 * BLOCK },
        ]
    );
    assert_eq!(
        fx.cache.resident_entries(),
        vec![(0, 2 * BLOCK, true), (8192, 2 * BLOCK, true)]
    );
}

// ============================================================================
// Reads
// ============================================================================

#[test]
fn test_aligned_read_uses_two_block_entries() {
    let fx = setup(&cache_config(8));
    let data = read_at(&fx, 0, 4 * BLOCK);
    assert_eq!(data, pattern(STORAGE_SIZE)[..4 * BLOCK].to_vec());

    assert_eq!(
        fx.storage.requests(),
        vec![
            StorageRequest::Read { offset: 0, size: 2 * BLOCK },
            StorageRequest::Read { offset: 8192, size: 2 * BLOCK },
        ]
    );
    assert_eq!(
        fx.cache.resident_entries(),
        vec![(0, 2 * BLOCK, false), (8192, 2 * BLOCK, false)]
    );

    fx.storage.clear_requests();
    assert_eq!(read_at(&fx, 0, 4 * BLOCK), data);
    assert!(fx.storage.requests().is_empty());
    assert_eq!(fx.cache.stats().hits, 2);
}

#[test]
fn test_unaligned_read_is_one_bulk_request() {
    let fx = setup(&cache_config(8));
    let data = read_at(&fx, 4050, 100);
    assert_eq!(data, pattern(STORAGE_SIZE)[4050..4150].to_vec());

    assert_eq!(fx.storage.requests(), vec![StorageRequest::Read { offset: 0, size: 2 * BLOCK }]);
    assert_eq!(fx.cache.stats().bulk_reads, 1);
    assert_eq!(
        fx.cache.resident_entries(),
        vec![(4096, BLOCK, false), (0, BLOCK, false)]
    );
    assert_eq!(fx.pool.in_use(), 0);

    fx.storage.clear_requests();
    assert_eq!(read_at(&fx, 4050, 100), data);
    assert!(fx.storage.requests().is_empty());
}

#[test]
fn test_bulk_read_falls_back_without_pool_memory() {
    let fx = setup_with(&cache_config(8), RecordingStorage::new(pattern(STORAGE_SIZE)), MIB, 0);
    let data = read_at(&fx, 4050, 100);
    assert_eq!(data, pattern(STORAGE_SIZE)[4050..4150].to_vec());

    let stats = fx.cache.stats();
    assert_eq!(stats.bulk_fallbacks, 1);
    assert_eq!(stats.bulk_reads, 0);
    assert_eq!(fx.storage.requests(), vec![StorageRequest::Read { offset: 0, size: 2 * BLOCK }]);
    assert_eq!(fx.cache.resident_entries(), vec![(0, 2 * BLOCK, false)]);
    assert_eq!(fx.cache.last_result(), Ok(()));
}

#[test]
fn test_read_within_one_block_reads_into_entry() {
    let fx = setup(&cache_config(8));
    let end = STORAGE_SIZE as u64;

    // Runs past the end: only the last 10 bytes are read.
    let mut buf = vec![0xee; 100];
    fx.cache.read(end - 10, &mut buf).unwrap();
    assert_eq!(&buf[..10], &pattern(STORAGE_SIZE)[STORAGE_SIZE - 10..]);
    assert!(buf[10..].iter().all(|&b| b == 0xee));

    assert_eq!(
        fx.storage.requests(),
        vec![StorageRequest::Read { offset: end - BLOCK as u64, size: BLOCK }]
    );
    assert_eq!(fx.cache.resident_entries(), vec![(end - BLOCK as u64, BLOCK, false)]);
}

#[test]
fn test_read_and_write_bounds() {
    let fx = setup(&cache_config(8));
    let end = STORAGE_SIZE as u64;
    let mut buf = [0u8; 4];

    assert_eq!(fx.cache.read(end, &mut buf), Err(crate::fs::FsError::InvalidOffset));
    assert_eq!(fx.cache.write(end + 1, &buf), Err(crate::fs::FsError::InvalidOffset));
    assert_eq!(fx.cache.read(end, &mut []), Ok(()));
    assert_eq!(fx.cache.write(0, &[]), Ok(()));
    assert!(fx.storage.requests().is_empty());
    assert_eq!(fx.cache.last_result(), Ok(()));
}

#[test]
fn test_cache_matches_model_after_mixed_writes() {
    let fx = setup(&cache_config(4));
    let mut model = pattern(STORAGE_SIZE);
    let writes: [(usize, usize, u8); 3] = [(2048, 3 * BLOCK, 0xaa), (6000, 100, 0xbb), (30000, 5000, 0xcc)];
    for (offset, len, byte) in writes {
        fx.cache.write(offset as u64, &vec![byte; len]).unwrap();
        model[offset..offset + len].fill(byte);
    }

    assert_eq!(read_at(&fx, 0, STORAGE_SIZE), model);
    fx.cache.flush().unwrap();
    assert_eq!(fx.storage.snapshot(), model);
}

// ============================================================================
// Entry table
// ============================================================================

fn assert_no_overlap(entries: &[(u64, usize, bool)]) {
    for (i, a) in entries.iter().enumerate() {
        for b in &entries[i + 1..] {
            let disjoint = a.0 + a.1 as u64 <= b.0 || b.0 + b.1 as u64 <= a.0;
            assert!(disjoint, "resident entries overlap: {:?} and {:?}", a, b);
        }
    }
}

#[test]
fn test_second_entry_for_same_block_is_dropped() {
    let fx = setup(&cache_config(8));
    let first = fx.cache.get_associate_buffer(0, BLOCK).unwrap();
    let second = fx.cache.get_associate_buffer(0, BLOCK).unwrap();
    assert_eq!(fx.buffers.inner().allocated_size(), 2 * BLOCK);

    assert_eq!(fx.cache.store_associate_buffer(first), Ok(Some(0)));
    assert_eq!(fx.cache.store_associate_buffer(second), Ok(None));

    assert_eq!(fx.cache.stats().redundant_drops, 1);
    assert_eq!(fx.cache.resident_entries(), vec![(0, BLOCK, false)]);
    let manager = fx.buffers.inner();
    assert_eq!(manager.allocated_size(), 0);
    assert_eq!(manager.cached_size(), BLOCK);
}

#[test]
fn test_entry_overlapping_dirty_block_is_dropped() {
    let fx = setup(&cache_config(8));
    let mut taken = fx.cache.get_associate_buffer(0, 2 * BLOCK).unwrap();
    assert_eq!((taken.offset, taken.size), (0, 2 * BLOCK));

    // Another writer makes the second half resident meanwhile.
    fx.cache.write(BLOCK as u64, &[7u8; BLOCK]).unwrap();
    assert_eq!(fx.buffers.inner().allocated_size(), 3 * BLOCK);

    taken.is_write_back = true;
    assert_eq!(fx.cache.store_associate_buffer(taken), Ok(None));

    assert_eq!(fx.cache.stats().redundant_drops, 1);
    assert_eq!(fx.buffers.inner().allocated_size(), BLOCK);
    let resident = fx.cache.resident_entries();
    assert_eq!(resident, vec![(BLOCK as u64, BLOCK, true)]);
    assert_no_overlap(&resident);

    fx.cache.flush().unwrap();
    assert_eq!(fx.storage.write_offsets(), vec![BLOCK as u64]);
}

// ============================================================================
// Burst mode
// ============================================================================

#[test]
fn test_burst_write_bypasses_cache() {
    let mut config = cache_config(8);
    config.burst_mode = true;
    let fx = setup(&config);

    fx.cache.write(0, &[0x11; 3 * BLOCK]).unwrap();
    assert_eq!(fx.storage.requests(), vec![StorageRequest::Write { offset: 0, size: 3 * BLOCK }]);
    assert_eq!(fx.cache.valid_entry_count(), 0);
    assert_eq!(fx.cache.stats().burst_writes, 1);
}

#[test]
fn test_burst_write_flushes_leading_entry_first() {
    let fx = setup(&cache_config(8));
    fx.cache.set_burst_mode(true);
    assert!(fx.cache.is_burst_mode_enabled());

    // 4000..20384: a partial head entry, an aligned run of two blocks, a
    // partial tail.
    fx.cache.write(4000, &[0x22; 4 * BLOCK]).unwrap();
    assert_eq!(fx.storage.write_offsets(), vec![0, 8192]);
    assert_eq!(
        fx.cache.resident_entries(),
        vec![(0, 2 * BLOCK, false), (16384, 2 * BLOCK, true)]
    );

    fx.cache.flush().unwrap();
    let mut model = pattern(STORAGE_SIZE);
    model[4000..4000 + 4 * BLOCK].fill(0x22);
    assert_eq!(fx.storage.snapshot(), model);
}

#[test]
fn test_burst_read_bypasses_cache() {
    let mut config = cache_config(8);
    config.burst_mode = true;
    let fx = setup(&config);

    let data = read_at(&fx, 0, 3 * BLOCK);
    assert_eq!(data, pattern(STORAGE_SIZE)[..3 * BLOCK].to_vec());
    assert_eq!(fx.storage.requests(), vec![StorageRequest::Read { offset: 0, size: 3 * BLOCK }]);
    assert_eq!(fx.cache.stats().burst_reads, 1);
    assert_eq!(fx.cache.valid_entry_count(), 0);
}

// ============================================================================
// Lifetime
// ============================================================================

#[test]
fn test_rollback_discards_dirty_entries() {
    let fx = setup(&cache_config(8));
    fx.cache.write(6096, b"0123456789").unwrap();

    fx.cache.on_rollback().unwrap();
    assert_eq!(fx.cache.valid_entry_count(), 0);
    assert_eq!(read_at(&fx, 6096, 10), pattern(STORAGE_SIZE)[6096..6106].to_vec());
    assert_eq!(fx.storage.write_count(), 0);
}

#[test]
fn test_drop_writes_dirty_entries() {
    let fx = setup(&cache_config(8));
    fx.cache.write(0, &[0x33; 16]).unwrap();
    let storage = fx.storage.clone();

    drop(fx);
    assert_eq!(storage.write_offsets(), vec![0]);
    assert_eq!(&storage.snapshot()[..16], &[0x33; 16]);
}

#[test]
fn test_cache_is_a_storage() {
    let fx = setup(&cache_config(8));
    let storage: &dyn Storage = &fx.cache;
    assert_eq!(storage.size(), Ok(STORAGE_SIZE as u64));

    storage.write(100, &[9u8; 4]).unwrap();
    let mut buf = [0u8; 4];
    storage.read(100, &mut buf).unwrap();
    assert_eq!(buf, [9u8; 4]);
}

#[test]
fn test_accessors() {
    let fx = setup(&cache_config(8));
    assert_eq!(fx.cache.size(), STORAGE_SIZE as u64);
    assert_eq!(fx.cache.block_size(), BLOCK);
    assert_eq!(fx.cache.max_cache_entries(), 8);
    assert_eq!(fx.cache.storage_type(), StorageType::Generic);
    assert!(!fx.cache.is_burst_mode_enabled());
}

#[test]
fn test_new_rejects_bad_geometry() {
    let bad_block = CacheConfig {
        block_size: 3000,
        ..cache_config(8)
    };
    let no_entries = cache_config(0);
    for config in [bad_block, no_entries] {
        let storage = std::sync::Arc::new(RecordingStorage::new(pattern(STORAGE_SIZE)));
        let buffers = std::sync::Arc::new(crate::mock::FlakyBufferManager::new(MIB));
        let pool = std::sync::Arc::new(crate::fs::BufferPool::new(MIB));
        let result = crate::fs::BlockCacheBufferedStorage::new(storage, buffers, pool, &config);
        assert_eq!(result.err(), Some(crate::fs::FsError::InvalidSize));
    }

    // Storage size must be a whole number of blocks.
    let storage = std::sync::Arc::new(RecordingStorage::new(vec![0u8; 10_000]));
    let buffers = std::sync::Arc::new(crate::mock::FlakyBufferManager::new(MIB));
    let pool = std::sync::Arc::new(crate::fs::BufferPool::new(MIB));
    let result = crate::fs::BlockCacheBufferedStorage::new(storage, buffers, pool, &cache_config(8));
    assert_eq!(result.err(), Some(crate::fs::FsError::InvalidSize));
}
