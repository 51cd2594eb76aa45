//! FLV realtime repair engine.
//!
//! Consumes an arbitrary FLV byte stream and emits a well-formed one:
//! timestamps are made monotonic across producer resets, near-duplicate tags
//! are suppressed, and partial tags split across input chunks are reassembled.
//! Two variants exist: [`RealtimeFixer`] repairs tag-by-tag per input chunk,
//! [`AccumulateFixer`] batches a configurable amount of data and repairs the
//! whole batch at once.

mod accumulate;
mod dedup;
mod realtime;

pub use accumulate::AccumulateFixer;
pub use dedup::{DedupCache, DEDUP_CACHE_CAPACITY, DEDUP_WINDOW_MS};
pub use realtime::{DedupStats, RealtimeFixer};

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

pub const TAG_TYPE_AUDIO: u8 = 0x08;
pub const TAG_TYPE_VIDEO: u8 = 0x09;
pub const TAG_TYPE_SCRIPT: u8 = 0x12;

pub const FLV_HEADER_SIZE: usize = 9;
pub const TAG_HEADER_SIZE: usize = 11;
pub const PREV_TAG_SIZE_BYTES: usize = 4;

/// Timestamp discontinuities larger than this (ms) trigger offset re-seating.
pub const JUMP_THRESHOLD: i32 = 500;

pub const AUDIO_DURATION_FALLBACK: i32 = 22;
pub const AUDIO_DURATION_MIN: i32 = 20;
pub const AUDIO_DURATION_MAX: i32 = 24;

pub const VIDEO_DURATION_FALLBACK: i32 = 33;
pub const VIDEO_DURATION_MIN: i32 = 15;
pub const VIDEO_DURATION_MAX: i32 = 50;

/// Canonical 9-byte header emitted for audio+video streams.
pub const FLV_HEADER: [u8; 9] = [b'F', b'L', b'V', 0x01, 0x05, 0x00, 0x00, 0x00, 0x09];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FlvError {
    #[error("not a valid FLV stream")]
    NotFlvStream,
    #[error("internal parse buffer corrupted")]
    BufferCorrupted,
}

/// One FLV packet: 11-byte header, payload, trailing PreviousTagSize.
///
/// The raw type byte and the 3-byte stream id are carried through verbatim;
/// tags of unknown type are passed along untouched.
#[derive(Debug, Clone)]
pub struct Tag {
    pub tag_type: u8,
    pub data_size: u32,
    pub timestamp: i32,
    pub stream_id: [u8; 3],
    pub data: Bytes,
    pub is_header: bool,
    pub is_keyframe: bool,
}

impl Tag {
    /// Serialize as header + payload + PreviousTagSize (`11 + len(payload)`).
    pub fn write_into(&self, out: &mut Vec<u8>) {
        let ds = self.data.len() as u32;
        let ts = self.timestamp as u32;
        out.push(self.tag_type);
        out.extend_from_slice(&[(ds >> 16) as u8, (ds >> 8) as u8, ds as u8]);
        // 24 low bits followed by the extended high byte.
        out.extend_from_slice(&[(ts >> 16) as u8, (ts >> 8) as u8, ts as u8, (ts >> 24) as u8]);
        out.extend_from_slice(&self.stream_id);
        out.extend_from_slice(&self.data);
        out.extend_from_slice(&(TAG_HEADER_SIZE as u32 + ds).to_be_bytes());
    }

    fn classify(&mut self) {
        if self.data.len() < 2 {
            return;
        }
        match self.tag_type {
            TAG_TYPE_VIDEO => {
                self.is_keyframe = (self.data[0] & 0xF0) == 0x10;
                self.is_header = self.data[1] == 0x00;
            }
            TAG_TYPE_AUDIO => {
                // Only AAC carries a sequence-header packet.
                if (self.data[0] >> 4) == 10 {
                    self.is_header = self.data[1] == 0x00;
                }
            }
            _ => {}
        }
    }
}

/// Per-session timestamp repair state.
#[derive(Debug)]
pub struct TimestampStore {
    pub first_chunk: bool,
    pub last_original: i32,
    pub current_offset: i32,
    pub next_target: i32,
}

impl TimestampStore {
    pub fn new() -> Self {
        Self {
            first_chunk: true,
            last_original: 0,
            current_offset: 0,
            next_target: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Rewrite one tag's timestamp so the emitted sequence stays monotonic.
    ///
    /// Invariant: the emitted timestamp equals `original - current_offset`.
    pub fn fix(&mut self, tag: &mut Tag) {
        let current = tag.timestamp;
        if self.first_chunk {
            self.first_chunk = false;
            self.current_offset = current;
        }

        let diff = current.wrapping_sub(self.last_original);
        if diff < -JUMP_THRESHOLD || (self.last_original == 0 && diff < 0) || diff > JUMP_THRESHOLD {
            self.current_offset = current - self.next_target;
        }

        self.last_original = current;
        tag.timestamp = current - self.current_offset;
        self.next_target = tag.timestamp + nominal_duration(tag.tag_type);
    }
}

impl Default for TimestampStore {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn nominal_duration(tag_type: u8) -> i32 {
    if tag_type == TAG_TYPE_AUDIO {
        AUDIO_DURATION_FALLBACK
    } else {
        VIDEO_DURATION_FALLBACK
    }
}

/// Next-target estimate for a repaired batch: whichever of the audio/video
/// tracks extends further, using the observed inter-frame gap when it falls
/// inside the accepted window and the nominal duration otherwise.
pub(crate) fn batch_next_target(tags: &[Tag]) -> i32 {
    fn track_end(tags: &[&Tag], min: i32, max: i32, fallback: i32) -> i32 {
        match tags.len() {
            0 => 0,
            1 => tags[0].timestamp + fallback,
            _ => {
                let gap = tags[1].timestamp - tags[0].timestamp;
                let dur = if (min..=max).contains(&gap) { gap } else { fallback };
                tags[tags.len() - 1].timestamp + dur
            }
        }
    }

    let video: Vec<&Tag> = tags.iter().filter(|t| t.tag_type == TAG_TYPE_VIDEO).collect();
    let audio: Vec<&Tag> = tags.iter().filter(|t| t.tag_type == TAG_TYPE_AUDIO).collect();

    let video_end = track_end(&video, VIDEO_DURATION_MIN, VIDEO_DURATION_MAX, VIDEO_DURATION_FALLBACK);
    let audio_end = track_end(&audio, AUDIO_DURATION_MIN, AUDIO_DURATION_MAX, AUDIO_DURATION_FALLBACK);
    video_end.max(audio_end)
}

/// Consume the 9-byte stream header if fully buffered.
///
/// Returns `Ok(None)` while more input is needed.
pub(crate) fn take_header(buf: &mut BytesMut) -> Result<Option<[u8; 9]>, FlvError> {
    if buf.len() < FLV_HEADER_SIZE {
        return Ok(None);
    }
    if &buf[..3] != b"FLV" {
        return Err(FlvError::NotFlvStream);
    }
    let mut header = [0u8; 9];
    header.copy_from_slice(&buf[..FLV_HEADER_SIZE]);
    buf.advance(FLV_HEADER_SIZE);
    Ok(Some(header))
}

/// Consume one PreviousTagSize + tag header + payload if fully buffered.
///
/// Lengths are peeked before anything is consumed, so a partial tag leaves
/// the buffer untouched and returns `Ok(None)`.
pub(crate) fn next_tag(buf: &mut BytesMut) -> Result<Option<Tag>, FlvError> {
    const MIN: usize = PREV_TAG_SIZE_BYTES + TAG_HEADER_SIZE;
    if buf.len() < MIN {
        return Ok(None);
    }

    let header = &buf[PREV_TAG_SIZE_BYTES..MIN];
    let tag_type = header[0];
    let data_size =
        (u32::from(header[1]) << 16) | (u32::from(header[2]) << 8) | u32::from(header[3]);
    if buf.len() < MIN + data_size as usize {
        return Ok(None);
    }

    // Timestamp is 24 low bits plus an extended high byte, signed 32-bit.
    let timestamp = (i32::from(header[7]) << 24)
        | (i32::from(header[4]) << 16)
        | (i32::from(header[5]) << 8)
        | i32::from(header[6]);
    let mut stream_id = [0u8; 3];
    stream_id.copy_from_slice(&header[8..11]);

    let before = buf.len();
    buf.advance(MIN);
    let data = buf.split_to(data_size as usize).freeze();
    if before - buf.len() != MIN + data.len() {
        return Err(FlvError::BufferCorrupted);
    }

    let mut tag = Tag {
        tag_type,
        data_size,
        timestamp,
        stream_id,
        data,
        is_header: false,
        is_keyframe: false,
    };
    tag.classify();
    Ok(Some(tag))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_roundtrip_preserves_wire_form() {
        let payload = Bytes::from_static(&[0x17, 0x01, 0xAA, 0xBB]);
        let tag = Tag {
            tag_type: TAG_TYPE_VIDEO,
            data_size: payload.len() as u32,
            timestamp: 0x0102_0304,
            stream_id: [7, 8, 9],
            data: payload,
            is_header: false,
            is_keyframe: false,
        };
        let mut out = Vec::new();
        tag.write_into(&mut out);

        assert_eq!(out.len(), TAG_HEADER_SIZE + 4 + PREV_TAG_SIZE_BYTES);
        assert_eq!(out[0], TAG_TYPE_VIDEO);
        // Timestamp split: low 24 bits then extended byte.
        assert_eq!(&out[4..8], &[0x02, 0x03, 0x04, 0x01]);
        assert_eq!(&out[8..11], &[7, 8, 9]);
        let prev = u32::from_be_bytes(out[15..19].try_into().unwrap());
        assert_eq!(prev, 15);
    }

    #[test]
    fn classify_detects_keyframe_and_headers() {
        let mut tag = Tag {
            tag_type: TAG_TYPE_VIDEO,
            data_size: 2,
            timestamp: 0,
            stream_id: [0; 3],
            data: Bytes::from_static(&[0x17, 0x00]),
            is_header: false,
            is_keyframe: false,
        };
        tag.classify();
        assert!(tag.is_keyframe);
        assert!(tag.is_header);

        let mut aac = Tag {
            tag_type: TAG_TYPE_AUDIO,
            data_size: 2,
            timestamp: 0,
            stream_id: [0; 3],
            data: Bytes::from_static(&[0xAF, 0x00]),
            is_header: false,
            is_keyframe: false,
        };
        aac.classify();
        assert!(aac.is_header);

        let mut mp3 = Tag {
            tag_type: TAG_TYPE_AUDIO,
            data_size: 2,
            timestamp: 0,
            stream_id: [0; 3],
            data: Bytes::from_static(&[0x2F, 0x00]),
            is_header: false,
            is_keyframe: false,
        };
        mp3.classify();
        assert!(!mp3.is_header);
    }

    #[test]
    fn jitter_is_preserved_and_jumps_reseat() {
        let mut ts = TimestampStore::new();
        let mut make = |t: i32| Tag {
            tag_type: TAG_TYPE_VIDEO,
            data_size: 0,
            timestamp: t,
            stream_id: [0; 3],
            data: Bytes::new(),
            is_header: false,
            is_keyframe: false,
        };

        let mut a = make(0);
        ts.fix(&mut a);
        assert_eq!(a.timestamp, 0);

        // Small jitter within the threshold passes through unchanged.
        let mut b = make(450);
        ts.fix(&mut b);
        assert_eq!(b.timestamp, 450);

        // A forward jump beyond the threshold is re-seated to the next target.
        let mut c = make(2000);
        ts.fix(&mut c);
        assert_eq!(c.timestamp, 450 + VIDEO_DURATION_FALLBACK);
    }

    #[test]
    fn batch_next_target_uses_observed_gap_within_window() {
        let make = |t: u8, ts: i32| Tag {
            tag_type: t,
            data_size: 0,
            timestamp: ts,
            stream_id: [0; 3],
            data: Bytes::new(),
            is_header: false,
            is_keyframe: false,
        };
        // Audio gap 22 within window, last at 44 -> 66. Video gap 100 out of
        // window, falls back to 33, last at 100 -> 133.
        let tags = vec![
            make(TAG_TYPE_AUDIO, 0),
            make(TAG_TYPE_AUDIO, 22),
            make(TAG_TYPE_AUDIO, 44),
            make(TAG_TYPE_VIDEO, 0),
            make(TAG_TYPE_VIDEO, 100),
        ];
        assert_eq!(batch_next_target(&tags), 133);
    }
}
