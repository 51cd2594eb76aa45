use bytes::BytesMut;

use crate::dedup::DedupCache;
use crate::{next_tag, take_header, FlvError, TimestampStore, PREV_TAG_SIZE_BYTES, TAG_HEADER_SIZE};

/// Re-run dedup pruning after this much source time (ms) has elapsed.
const DEDUP_CLEAN_INTERVAL_MS: i32 = 500;

/// Counters reported when a repair session ends.
#[derive(Debug, Clone, Copy)]
pub struct DedupStats {
    pub duplicates: u64,
    pub cache_size: usize,
    pub cache_capacity: usize,
}

/// Chunk-by-chunk FLV repair.
///
/// Feed arbitrary slices of the source stream in arrival order; each call
/// appends whatever complete tags could be repaired to the output. Partial
/// tags are buffered until the next call. Feeding zero bytes is fine.
#[derive(Debug)]
pub struct RealtimeFixer {
    ts: TimestampStore,
    buf: BytesMut,
    header_written: bool,
    dedup: DedupCache,
    dup_count: u64,
    last_dedup_clean: i32,
}

impl RealtimeFixer {
    pub fn new() -> Self {
        Self {
            ts: TimestampStore::new(),
            buf: BytesMut::new(),
            header_written: false,
            dedup: DedupCache::default(),
            dup_count: 0,
            last_dedup_clean: 0,
        }
    }

    /// Process `input`, appending repaired FLV bytes to `out`.
    ///
    /// Appends nothing while the buffered input is still mid-tag.
    pub fn fix_into(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<(), FlvError> {
        self.buf.extend_from_slice(input);

        if !self.header_written {
            match take_header(&mut self.buf)? {
                None => return Ok(()),
                Some(header) => {
                    out.extend_from_slice(&header);
                    // PreviousTagSize0 precedes the first tag.
                    out.extend_from_slice(&[0, 0, 0, 0]);
                    self.header_written = true;
                }
            }
        }

        loop {
            let before = self.buf.len();
            let Some(mut tag) = next_tag(&mut self.buf)? else {
                break;
            };
            let consumed = before - self.buf.len();
            if consumed != PREV_TAG_SIZE_BYTES + TAG_HEADER_SIZE + tag.data.len() {
                return Err(FlvError::BufferCorrupted);
            }

            // Dedup runs on the original timestamp, before any rewrite.
            if self.dedup.is_duplicate(&tag) {
                self.dup_count += 1;
                continue;
            }

            self.ts.fix(&mut tag);
            tag.write_into(out);
        }

        if self.ts.last_original > 0
            && self.ts.last_original - self.last_dedup_clean > DEDUP_CLEAN_INTERVAL_MS
        {
            self.dedup.clean_old(self.ts.last_original);
            self.last_dedup_clean = self.ts.last_original;
        }

        Ok(())
    }

    /// Convenience wrapper allocating the output.
    pub fn fix(&mut self, input: &[u8]) -> Result<Vec<u8>, FlvError> {
        let mut out = Vec::new();
        self.fix_into(input, &mut out)?;
        Ok(out)
    }

    pub fn dedup_stats(&self) -> DedupStats {
        DedupStats {
            duplicates: self.dup_count,
            cache_size: self.dedup.len(),
            cache_capacity: self.dedup.capacity(),
        }
    }

    /// Reset all per-session state. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.ts.reset();
        self.buf = BytesMut::new();
        self.header_written = false;
        self.dedup.reset();
        self.dup_count = 0;
        self.last_dedup_clean = 0;
    }
}

impl Default for RealtimeFixer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{parse_output, stream_of, tag_bytes};
    use crate::{FLV_HEADER, TAG_TYPE_AUDIO, TAG_TYPE_VIDEO};

    #[test]
    fn emits_header_and_prev_tag_size_zero_once() {
        let mut fixer = RealtimeFixer::new();
        let out = fixer.fix(&FLV_HEADER).unwrap();
        assert_eq!(&out[..9], &FLV_HEADER);
        assert_eq!(&out[9..13], &[0, 0, 0, 0]);

        // Subsequent calls never repeat the header.
        let out = fixer.fix(&tag_bytes(TAG_TYPE_AUDIO, 0, b"ab")).unwrap();
        assert_eq!(out[0], TAG_TYPE_AUDIO);
    }

    #[test]
    fn rejects_non_flv_input() {
        let mut fixer = RealtimeFixer::new();
        assert_eq!(fixer.fix(b"GIF89a???"), Err(FlvError::NotFlvStream));
    }

    #[test]
    fn partial_input_yields_no_output_until_complete() {
        let mut fixer = RealtimeFixer::new();
        let stream = stream_of(&[(TAG_TYPE_VIDEO, 0, vec![0x17, 0x01, 1, 2, 3, 4])]);

        let mut emitted = Vec::new();
        // Feed one byte at a time; only complete units produce output.
        for byte in &stream {
            fixer.fix_into(&[*byte], &mut emitted).unwrap();
        }

        let whole = RealtimeFixer::new().fix(&stream).unwrap();
        assert_eq!(emitted, whole);
    }

    #[test]
    fn chunk_boundaries_do_not_change_output() {
        let tags: Vec<(u8, i32, Vec<u8>)> = (0..50)
            .map(|i| (TAG_TYPE_AUDIO, i * 22, vec![0xAF, 0x01, i as u8, 0xEE]))
            .collect();
        let stream = stream_of(&tags);

        let whole = RealtimeFixer::new().fix(&stream).unwrap();

        for chunk_size in [1, 7, 16, 64, 1024] {
            let mut fixer = RealtimeFixer::new();
            let mut out = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                fixer.fix_into(chunk, &mut out).unwrap();
            }
            assert_eq!(out, whole, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn producer_reset_keeps_timestamps_monotonic() {
        // 100 audio tags at 0,22,..,2178 then the producer restarts at 0.
        let mut tags: Vec<(u8, i32, Vec<u8>)> = Vec::new();
        for run in 0..2 {
            for i in 0..100 {
                tags.push((TAG_TYPE_AUDIO, i * 22, vec![0xAF, 0x01, run as u8, i as u8]));
            }
        }
        let out = RealtimeFixer::new().fix(&stream_of(&tags)).unwrap();
        let parsed = parse_output(&out);
        assert_eq!(parsed.len(), 200);

        // First run is untouched.
        for (i, (_, ts, _)) in parsed.iter().take(100).enumerate() {
            assert_eq!(*ts, i as i32 * 22);
        }
        // Second run continues at the projected next timestamp.
        for (i, (_, ts, _)) in parsed.iter().skip(100).enumerate() {
            assert_eq!(*ts, 2200 + i as i32 * 22);
        }
        // No backwards jumps anywhere.
        for pair in parsed.windows(2) {
            assert!(pair[1].1 >= pair[0].1);
        }
    }

    #[test]
    fn small_jitter_is_preserved() {
        let tags = vec![
            (TAG_TYPE_VIDEO, 0, vec![0x27, 0x01, 1]),
            (TAG_TYPE_VIDEO, 40, vec![0x27, 0x01, 2]),
            (TAG_TYPE_VIDEO, 65, vec![0x27, 0x01, 3]),
            (TAG_TYPE_VIDEO, 500, vec![0x27, 0x01, 4]),
        ];
        let out = RealtimeFixer::new().fix(&stream_of(&tags)).unwrap();
        let parsed = parse_output(&out);
        let ts: Vec<i32> = parsed.iter().map(|(_, t, _)| *t).collect();
        assert_eq!(ts, vec![0, 40, 65, 500]);
    }

    #[test]
    fn duplicate_flood_is_suppressed_once() {
        let segment: Vec<(u8, i32, Vec<u8>)> = (0..50)
            .map(|i| (TAG_TYPE_AUDIO, i * 22, vec![0xAF, 0x01, i as u8, 0x55]))
            .collect();

        let mut stream = stream_of(&segment);
        for (t, ts, payload) in &segment {
            stream.extend_from_slice(&tag_bytes(*t, *ts, payload));
        }

        let mut fixer = RealtimeFixer::new();
        let out = fixer.fix(&stream).unwrap();
        let parsed = parse_output(&out);
        assert_eq!(parsed.len(), 50);
        assert_eq!(fixer.dedup_stats().duplicates, 50);
    }

    #[test]
    fn zero_byte_input_is_harmless() {
        let mut fixer = RealtimeFixer::new();
        assert!(fixer.fix(&[]).unwrap().is_empty());
        fixer.fix(&FLV_HEADER).unwrap();
        assert!(fixer.fix(&[]).unwrap().is_empty());
    }

    #[test]
    fn close_is_idempotent_and_resets_session() {
        let mut fixer = RealtimeFixer::new();
        fixer.fix(&stream_of(&[(TAG_TYPE_AUDIO, 10, vec![0xAF, 0x01])])).unwrap();
        fixer.close();
        fixer.close();

        // A fresh session accepts a new header.
        let out = fixer.fix(&FLV_HEADER).unwrap();
        assert_eq!(&out[..9], &FLV_HEADER);
    }

    #[test]
    fn emitted_prev_tag_sizes_are_consistent() {
        let tags = vec![
            (TAG_TYPE_VIDEO, 0, vec![0x17, 0x00, 0, 0, 0]),
            (TAG_TYPE_AUDIO, 5, vec![0xAF, 0x00]),
            (TAG_TYPE_VIDEO, 33, vec![0x27, 0x01, 9, 9]),
        ];
        let out = RealtimeFixer::new().fix(&stream_of(&tags)).unwrap();
        // parse_output asserts every PreviousTagSize equals 11 + payload len.
        assert_eq!(parse_output(&out).len(), 3);
    }
}
