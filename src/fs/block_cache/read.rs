//! Read path: head and tail entries, bulk reads and the per-entry loop

use super::cache::BlockCacheBufferedStorage;
use super::entry::AssociatedBuffer;
use super::{align_down, align_up, BULK_READ_SIZE_MAX};
use crate::fs::error::{FsError, FsResult};
use crate::fs::pooled::PooledBuffer;

/// Progress through one read. `buf[pos..pos + read_size]` is still unfilled
/// and maps to `read_offset..`; the aligned bounds shrink as cached blocks
/// are served from either end.
struct ReadCursor {
    read_offset: u64,
    pos: usize,
    read_size: usize,
    aligned_offset: u64,
    aligned_end: u64,
}

impl ReadCursor {
    fn is_done(&self) -> bool {
        self.aligned_offset >= self.aligned_end
    }

    fn advance(&mut self, n: usize) {
        self.pos += n;
        self.read_offset += n as u64;
        self.read_size -= n;
    }
}

/// Where a bulk read lands before it is copied out.
enum ReadTarget<'p> {
    Destination,
    Head,
    Tail,
    Pooled(PooledBuffer<'p>),
}

/// Fills `entry` from `source` (which starts at `aligned_offset`) if the
/// entry lies inside it.
fn populate(entry: &mut AssociatedBuffer, source: Option<&[u8]>, aligned_offset: u64) {
    let source_end = aligned_offset + source.map_or(0, |s| s.len() as u64);
    let inside = aligned_offset <= entry.offset && entry.end() <= source_end;
    match source {
        Some(src) if inside => {
            let start = (entry.offset - aligned_offset) as usize;
            let size = entry.size;
            entry.data_mut().copy_from_slice(&src[start..start + size]);
            entry.is_cached = true;
        }
        // The entry's own buffer was the read target.
        None => entry.is_cached = true,
        _ => {}
    }
}

impl BlockCacheBufferedStorage {
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> FsResult<()> {
        self.check_last_result()?;
        if buf.is_empty() {
            return Ok(());
        }
        if offset >= self.data_size {
            return Err(FsError::InvalidOffset);
        }

        let read_size = buf.len().min((self.data_size - offset) as usize);
        let buf = &mut buf[..read_size];
        let block = self.block_size as u64;
        let mut cur = ReadCursor {
            read_offset: offset,
            pos: 0,
            read_size,
            aligned_offset: align_down(offset, block),
            aligned_end: align_up(offset + read_size as u64, block),
        };

        let unaligned = offset != cur.aligned_offset || offset + read_size as u64 != cur.aligned_end;
        let bulk_read_enabled = unaligned && cur.aligned_end - cur.aligned_offset <= BULK_READ_SIZE_MAX;

        let (head, head_needed) = self.read_head_cache(&mut cur, buf)?;
        if cur.is_done() {
            self.destroy_pending(head);
            return Ok(());
        }

        let (tail, tail_needed) = match self.read_tail_cache(&mut cur, buf) {
            Ok(r) => r,
            Err(e) => {
                self.destroy_pending(head);
                return Err(e);
            }
        };
        if cur.is_done() {
            self.destroy_pending(head);
            self.destroy_pending(tail);
            return Ok(());
        }

        if bulk_read_enabled {
            let dst = &mut buf[cur.pos..cur.pos + cur.read_size];
            match self.bulk_read(cur.read_offset, dst, head, tail, head_needed, tail_needed) {
                Err(FsError::PooledBufferNotEnoughSize) => {
                    crate::kdebug!("bcache: bulk read at {:#x} falling back", cur.read_offset);
                    self.state.lock().stats.bulk_fallbacks += 1;
                }
                result => {
                    if result.is_ok() {
                        self.state.lock().stats.bulk_reads += 1;
                    }
                    return result;
                }
            }
        } else {
            self.destroy_pending(head);
            self.destroy_pending(tail);
        }

        self.read_entries(&mut cur, buf)
    }

    /// Serves cached blocks from the front. Stops at the first uncached one
    /// and hands it back. The flag is false once any cached block was found.
    fn read_head_cache(&self, cur: &mut ReadCursor, buf: &mut [u8]) -> FsResult<(Option<AssociatedBuffer>, bool)> {
        let mut cache_needed = true;
        while cur.aligned_offset < cur.aligned_end {
            let entry = self.update_last_result(self.get_associate_buffer(cur.aligned_offset, self.block_size))?;
            if !entry.is_cached {
                return Ok((Some(entry), cache_needed));
            }
            cache_needed = false;

            let buffer_offset = (cur.read_offset - entry.offset) as usize;
            let copy_size = cur.read_size.min((entry.end() - cur.read_offset) as usize);
            buf[cur.pos..cur.pos + copy_size]
                .copy_from_slice(&entry.buffer[buffer_offset..buffer_offset + copy_size]);
            cur.advance(copy_size);
            cur.aligned_offset = entry.end();

            self.update_last_result(self.store_associate_buffer(entry))?;
        }
        Ok((None, cache_needed))
    }

    /// Same as `read_head_cache`, working back from the end.
    fn read_tail_cache(&self, cur: &mut ReadCursor, buf: &mut [u8]) -> FsResult<(Option<AssociatedBuffer>, bool)> {
        let block = self.block_size as u64;
        let mut cache_needed = true;
        while cur.aligned_offset < cur.aligned_end {
            let entry = self.update_last_result(self.get_associate_buffer(cur.aligned_end - block, self.block_size))?;
            if !entry.is_cached {
                return Ok((Some(entry), cache_needed));
            }
            cache_needed = false;

            let read_end = cur.read_offset + cur.read_size as u64;
            let buffer_offset = cur.read_offset.saturating_sub(entry.offset) as usize;
            let copy_size = cur.read_size.min(read_end.saturating_sub(entry.offset) as usize);
            let dst_end = cur.pos + cur.read_size;
            buf[dst_end - copy_size..dst_end]
                .copy_from_slice(&entry.buffer[buffer_offset..buffer_offset + copy_size]);
            cur.read_size -= copy_size;
            cur.aligned_end = entry.offset;

            self.update_last_result(self.store_associate_buffer(entry))?;
        }
        Ok((None, cache_needed))
    }

    /// Reads the aligned span around `dst` with a single storage request and
    /// fills the pending head and tail entries from it. Consumes both
    /// pending entries on every path.
    fn bulk_read(
        &self,
        read_offset: u64,
        dst: &mut [u8],
        mut head: Option<AssociatedBuffer>,
        mut tail: Option<AssociatedBuffer>,
        head_needed: bool,
        tail_needed: bool,
    ) -> FsResult<()> {
        let block = self.block_size as u64;
        let read_size = dst.len();
        let aligned_offset = align_down(read_offset, block);
        let aligned_end = align_up(read_offset + read_size as u64, block);
        let buffer_size = (aligned_end - aligned_offset) as usize;

        if let Err(e) = self.flush_range(aligned_offset, buffer_size as u64, false) {
            self.destroy_pending(head);
            self.destroy_pending(tail);
            return self.update_last_result(Err(e));
        }

        let spans_read = |entry: &Option<AssociatedBuffer>, needed: bool| {
            needed
                && entry
                    .as_ref()
                    .is_some_and(|e| e.offset == aligned_offset && e.size == buffer_size)
        };
        let mut target = if read_offset == aligned_offset && read_size == buffer_size {
            ReadTarget::Destination
        } else if spans_read(&tail, tail_needed) {
            ReadTarget::Tail
        } else if spans_read(&head, head_needed) {
            ReadTarget::Head
        } else {
            match self.pool.allocate_particularly_large(buffer_size, 1) {
                Ok(pooled) if pooled.len() >= buffer_size => ReadTarget::Pooled(pooled),
                _ => {
                    self.destroy_pending(head);
                    self.destroy_pending(tail);
                    return Err(FsError::PooledBufferNotEnoughSize);
                }
            }
        };

        let sink: &mut [u8] = match &mut target {
            ReadTarget::Destination => &mut *dst,
            ReadTarget::Head => head.as_mut().map(|e| &mut e.buffer[..buffer_size]).unwrap_or_default(),
            ReadTarget::Tail => tail.as_mut().map(|e| &mut e.buffer[..buffer_size]).unwrap_or_default(),
            ReadTarget::Pooled(pooled) => &mut pooled[..buffer_size],
        };
        if let Err(e) = self.storage.read(aligned_offset, sink) {
            self.destroy_pending(head);
            self.destroy_pending(tail);
            return Err(e);
        }

        let skip = (read_offset - aligned_offset) as usize;
        let source: Option<&[u8]> = match &target {
            ReadTarget::Destination => None,
            ReadTarget::Head => head.as_ref().map(|e| &e.buffer[..buffer_size]),
            ReadTarget::Tail => tail.as_ref().map(|e| &e.buffer[..buffer_size]),
            ReadTarget::Pooled(pooled) => Some(&pooled[..buffer_size]),
        };
        if let Some(src) = source {
            dst.copy_from_slice(&src[skip..skip + read_size]);
        }

        if tail_needed {
            if let Some(entry) = tail.as_mut() {
                let source = match &target {
                    ReadTarget::Destination => Some(&*dst),
                    ReadTarget::Head => head.as_ref().map(|e| &e.buffer[..buffer_size]),
                    ReadTarget::Tail => None,
                    ReadTarget::Pooled(pooled) => Some(&pooled[..buffer_size]),
                };
                populate(entry, source, aligned_offset);
            }
        }
        if head_needed {
            if let Some(entry) = head.as_mut() {
                let source = match &target {
                    ReadTarget::Destination => Some(&*dst),
                    ReadTarget::Head => None,
                    ReadTarget::Tail => tail.as_ref().map(|e| &e.buffer[..buffer_size]),
                    ReadTarget::Pooled(pooled) => Some(&pooled[..buffer_size]),
                };
                populate(entry, source, aligned_offset);
            }
        }
        drop(target);

        // Keep only the larger of two nested entries.
        if let (Some(h), Some(t)) = (head.as_mut(), tail.as_mut()) {
            if h.is_cached && t.is_cached {
                if t.contains_entry(h) {
                    h.is_cached = false;
                } else if h.contains_entry(t) {
                    t.is_cached = false;
                }
            }
        }

        let result = match tail {
            Some(entry) if entry.is_cached => self.update_last_result(self.store_associate_buffer(entry)).map(|_| ()),
            other => {
                self.destroy_pending(other);
                Ok(())
            }
        };
        if let Err(e) = result {
            self.destroy_pending(head);
            return Err(e);
        }

        match head {
            Some(entry) if entry.is_cached => self.update_last_result(self.store_associate_buffer(entry)).map(|_| ()),
            other => {
                self.destroy_pending(other);
                Ok(())
            }
        }
    }

    /// Reads entry by entry, or straight from storage in burst mode.
    fn read_entries(&self, cur: &mut ReadCursor, buf: &mut [u8]) -> FsResult<()> {
        let block = self.block_size as u64;
        while cur.aligned_offset < cur.aligned_end {
            if self.burst_applies(cur.read_offset, cur.aligned_offset, cur.read_size) {
                let aligned_size = align_down(cur.read_size as u64, block) as usize;
                self.update_last_result(self.flush_range(cur.read_offset, aligned_size as u64, false))?;
                self.update_last_result(
                    self.storage
                        .read(cur.read_offset, &mut buf[cur.pos..cur.pos + aligned_size]),
                )?;
                self.state.lock().stats.burst_reads += 1;

                cur.advance(aligned_size);
                cur.aligned_offset += aligned_size as u64;
                continue;
            }

            let mut entry = self.update_last_result(
                self.get_associate_buffer(cur.aligned_offset, (cur.aligned_end - cur.aligned_offset) as usize),
            )?;
            if !entry.is_cached {
                let entry_offset = entry.offset;
                if let Err(e) = self.storage.read(entry_offset, entry.data_mut()) {
                    self.destroy_buffer(entry);
                    return self.update_last_result(Err(e));
                }
                entry.is_cached = true;
            }

            let buffer_offset = (cur.read_offset - entry.offset) as usize;
            let copy_size = cur.read_size.min((entry.end() - cur.read_offset) as usize);
            buf[cur.pos..cur.pos + copy_size]
                .copy_from_slice(&entry.buffer[buffer_offset..buffer_offset + copy_size]);
            cur.advance(copy_size);

            let entry_end = entry.end();
            self.update_last_result(self.store_associate_buffer(entry))?;
            cur.aligned_offset = entry_end;
        }
        Ok(())
    }
}
