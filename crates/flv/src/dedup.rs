use std::collections::{HashMap, VecDeque};

use crate::Tag;

/// Tags whose signatures repeat within this window (ms) are duplicates.
pub const DEDUP_WINDOW_MS: i32 = 5000;
/// Maximum number of signatures retained.
pub const DEDUP_CACHE_CAPACITY: usize = 1000;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// How much payload participates in the signature.
const SIGNATURE_PAYLOAD_BYTES: usize = 32;

#[derive(Debug, Clone, Copy)]
struct Entry {
    timestamp: i32,
    tag_type: u8,
    data_size: u32,
}

/// Bounded FIFO cache of recently seen tag signatures.
///
/// A weak hash is acceptable here: a hit must also match on type, size and
/// temporal proximity before a tag is treated as a duplicate.
#[derive(Debug)]
pub struct DedupCache {
    entries: HashMap<u64, Entry>,
    order: VecDeque<u64>,
    max_size: usize,
    window_ms: i32,
}

impl DedupCache {
    pub fn new(max_size: usize, window_ms: i32) -> Self {
        Self {
            entries: HashMap::with_capacity(max_size),
            order: VecDeque::with_capacity(max_size),
            max_size,
            window_ms,
        }
    }

    /// Check a tag against the cache, recording or refreshing its signature.
    ///
    /// Must be called with the tag's original (pre-repair) timestamp.
    pub fn is_duplicate(&mut self, tag: &Tag) -> bool {
        let sig = signature(tag);

        if let Some(entry) = self.entries.get_mut(&sig) {
            let delta = tag.timestamp.wrapping_sub(entry.timestamp);
            if delta.abs() <= self.window_ms
                && entry.tag_type == tag.tag_type
                && entry.data_size == tag.data_size
            {
                return true;
            }
            // Same signature but outside the window: refresh in place.
            entry.timestamp = tag.timestamp;
            entry.tag_type = tag.tag_type;
            entry.data_size = tag.data_size;
            return false;
        }

        if self.entries.len() >= self.max_size {
            self.evict_oldest_tenth();
        }
        self.entries.insert(
            sig,
            Entry {
                timestamp: tag.timestamp,
                tag_type: tag.tag_type,
                data_size: tag.data_size,
            },
        );
        self.order.push_back(sig);
        false
    }

    /// Drop entries older than twice the window relative to `now_ms`.
    pub fn clean_old(&mut self, now_ms: i32) {
        let horizon = self.window_ms.saturating_mul(2);
        self.entries
            .retain(|_, e| now_ms.wrapping_sub(e.timestamp) <= horizon);
        let entries = &self.entries;
        self.order.retain(|sig| entries.contains_key(sig));
    }

    pub fn reset(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    fn evict_oldest_tenth(&mut self) {
        let evict = (self.max_size / 10).max(1);
        for _ in 0..evict {
            match self.order.pop_front() {
                Some(sig) => {
                    self.entries.remove(&sig);
                }
                None => break,
            }
        }
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEDUP_CACHE_CAPACITY, DEDUP_WINDOW_MS)
    }
}

/// FNV-1a over type, original timestamp, data size, and the payload prefix.
fn signature(tag: &Tag) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    let mut mix = |byte: u8| {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    };

    mix(tag.tag_type);
    for byte in tag.timestamp.to_be_bytes() {
        mix(byte);
    }
    for byte in tag.data_size.to_be_bytes() {
        mix(byte);
    }
    let prefix = tag.data.len().min(SIGNATURE_PAYLOAD_BYTES);
    for &byte in &tag.data[..prefix] {
        mix(byte);
    }
    hash
}
