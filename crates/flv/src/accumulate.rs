use bytes::BytesMut;

use crate::dedup::DedupCache;
use crate::realtime::DedupStats;
use crate::{
    batch_next_target, next_tag, take_header, FlvError, Tag, TimestampStore, FLV_HEADER_SIZE,
    PREV_TAG_SIZE_BYTES, TAG_HEADER_SIZE,
};

/// Batched FLV repair: accumulate a configurable amount of input, then
/// repair and emit the whole batch at once.
///
/// Compared to [`crate::RealtimeFixer`] this estimates per-track frame
/// durations from the batch itself, which gives smoother continuation
/// targets on streams with uneven pacing.
#[derive(Debug)]
pub struct AccumulateFixer {
    ts: TimestampStore,
    buf: BytesMut,
    chunk_size: usize,
    header_written: bool,
    total_processed: u64,
    dedup: DedupCache,
    dup_count: u64,
}

impl AccumulateFixer {
    /// `chunk_size_bytes` is the batch threshold checked by [`Self::accumulate`].
    pub fn new(chunk_size_bytes: usize) -> Self {
        Self {
            ts: TimestampStore::new(),
            buf: BytesMut::with_capacity(chunk_size_bytes.min(8 * 1024)),
            chunk_size: chunk_size_bytes,
            header_written: false,
            total_processed: 0,
            dedup: DedupCache::default(),
            dup_count: 0,
        }
    }

    /// Buffer more input; returns true once a full batch is ready to flush.
    pub fn accumulate(&mut self, input: &[u8]) -> bool {
        self.buf.extend_from_slice(input);
        self.buf.len() >= self.chunk_size
    }

    /// Repair and emit everything buffered so far.
    ///
    /// Call when [`Self::accumulate`] reports a full batch, and once more at
    /// end of stream to drain the remainder.
    pub fn flush_into(&mut self, out: &mut Vec<u8>) -> Result<(), FlvError> {
        if self.buf.is_empty() {
            return Ok(());
        }

        if !self.header_written {
            if self.buf.len() < FLV_HEADER_SIZE {
                return Ok(());
            }
            match take_header(&mut self.buf)? {
                None => return Ok(()),
                Some(header) => {
                    out.extend_from_slice(&header);
                    out.extend_from_slice(&[0, 0, 0, 0]);
                    self.header_written = true;
                }
            }
        }

        let mut tags: Vec<Tag> = Vec::new();
        loop {
            let before = self.buf.len();
            let Some(tag) = next_tag(&mut self.buf)? else {
                break;
            };
            if before - self.buf.len() != PREV_TAG_SIZE_BYTES + TAG_HEADER_SIZE + tag.data.len() {
                return Err(FlvError::BufferCorrupted);
            }
            if self.dedup.is_duplicate(&tag) {
                self.dup_count += 1;
                continue;
            }
            tags.push(tag);
        }

        self.fix_timestamps(&mut tags);

        let emitted_before = out.len();
        for tag in &tags {
            tag.write_into(out);
        }
        self.total_processed += (out.len() - emitted_before) as u64;

        if let Some(last) = tags.last() {
            self.dedup.clean_old(last.timestamp);
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<Vec<u8>, FlvError> {
        let mut out = Vec::new();
        self.flush_into(&mut out)?;
        Ok(out)
    }

    /// (buffered bytes, total emitted bytes)
    pub fn stats(&self) -> (usize, u64) {
        (self.buf.len(), self.total_processed)
    }

    pub fn dedup_stats(&self) -> DedupStats {
        DedupStats {
            duplicates: self.dup_count,
            cache_size: self.dedup.len(),
            cache_capacity: self.dedup.capacity(),
        }
    }

    pub fn close(&mut self) {
        self.ts.reset();
        self.buf = BytesMut::new();
        self.header_written = false;
        self.dedup.reset();
        self.dup_count = 0;
        self.total_processed = 0;
    }

    fn fix_timestamps(&mut self, tags: &mut [Tag]) {
        if tags.is_empty() {
            return;
        }

        let ts = &mut self.ts;
        if ts.first_chunk {
            ts.first_chunk = false;
            // The first batch seats the offset at its earliest timestamp.
            ts.current_offset = tags.iter().map(|t| t.timestamp).min().unwrap_or(0);
        }

        for tag in tags.iter_mut() {
            let current = tag.timestamp;
            let diff = current.wrapping_sub(ts.last_original);
            if diff < -crate::JUMP_THRESHOLD
                || (ts.last_original == 0 && diff < 0)
                || diff > crate::JUMP_THRESHOLD
            {
                ts.current_offset = current - ts.next_target;
            }
            ts.last_original = current;
            tag.timestamp = current - ts.current_offset;
        }

        ts.next_target = batch_next_target(tags);
    }
}
