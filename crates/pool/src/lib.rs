//! Reusable byte buffers for the stream capture and download hot paths.
//!
//! Two pool shapes are provided: [`BytesPool`] hands out fixed-size buffers
//! for network reads, [`BufferPool`] hands out growable buffers whose
//! retained capacity is bounded. Buffers are wrapped in a [`Lease`] guard;
//! dropping the lease returns the buffer to its pool exactly once, and
//! moving a lease over a channel transfers ownership with it.

mod file_writer;

pub use file_writer::write_stream_to_file;

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// Upper bound on buffers kept idle per pool.
const MAX_IDLE_BUFFERS: usize = 32;

#[derive(Debug)]
enum Retain {
    /// Keep only buffers whose capacity still equals the pool's chunk size.
    Exact(usize),
    /// Keep buffers up to a maximum capacity, drop anything larger.
    UpTo(usize),
}

#[derive(Debug)]
struct Shared {
    free: Mutex<VecDeque<Vec<u8>>>,
    retain: Retain,
}

impl Shared {
    fn release(&self, buf: Vec<u8>) {
        let keep = match self.retain {
            Retain::Exact(size) => buf.capacity() == size,
            Retain::UpTo(max) => buf.capacity() <= max,
        };
        if !keep {
            return;
        }
        let mut free = self.free.lock().expect("pool lock poisoned");
        if free.len() < MAX_IDLE_BUFFERS {
            free.push_back(buf);
        }
    }

    fn take(&self) -> Option<Vec<u8>> {
        self.free.lock().expect("pool lock poisoned").pop_front()
    }
}

/// Fixed-size byte pool. Every lease starts with `len == cap == buffer_size`.
#[derive(Debug, Clone)]
pub struct BytesPool {
    shared: Arc<Shared>,
    buffer_size: usize,
}

impl BytesPool {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                free: Mutex::new(VecDeque::new()),
                retain: Retain::Exact(buffer_size),
            }),
            buffer_size,
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Acquire a buffer with its full length restored.
    pub fn get(&self) -> Lease {
        let mut buf = self
            .shared
            .take()
            .unwrap_or_else(|| vec![0u8; self.buffer_size]);
        buf.resize(self.buffer_size, 0);
        Lease {
            buf,
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Growable buffer pool bounded by a maximum retained capacity.
///
/// Leases start empty with at least `initial_capacity` reserved. A buffer
/// returned with capacity above `max_retained` is dropped instead of pooled.
#[derive(Debug, Clone)]
pub struct BufferPool {
    shared: Arc<Shared>,
    initial_capacity: usize,
}

impl BufferPool {
    pub fn new(initial_capacity: usize, max_retained: usize) -> Self {
        let max_retained = max_retained.max(initial_capacity);
        Self {
            shared: Arc::new(Shared {
                free: Mutex::new(VecDeque::new()),
                retain: Retain::UpTo(max_retained),
            }),
            initial_capacity,
        }
    }

    pub fn get(&self) -> Lease {
        let mut buf = self
            .shared
            .take()
            .unwrap_or_else(|| Vec::with_capacity(self.initial_capacity));
        buf.clear();
        Lease {
            buf,
            shared: Arc::clone(&self.shared),
        }
    }
}

/// RAII handle to a pooled buffer. Dropping returns the buffer to the pool.
#[derive(Debug)]
pub struct Lease {
    buf: Vec<u8>,
    shared: Arc<Shared>,
}

impl Lease {
    /// Wrap an already-owned buffer in a lease that simply frees on drop.
    ///
    /// Lets pooled and unpooled buffers share one type at API seams.
    pub fn detached(buf: Vec<u8>) -> Self {
        Self {
            buf,
            shared: Arc::new(Shared {
                free: Mutex::new(VecDeque::new()),
                retain: Retain::UpTo(0),
            }),
        }
    }

    /// Shrink the visible contents to `len` bytes. Capacity is unchanged.
    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    /// Direct access to the underlying growable buffer.
    pub fn vec_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }
}

impl Deref for Lease {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for Lease {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl AsRef<[u8]> for Lease {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        if buf.capacity() > 0 {
            self.shared.release(buf);
        }
    }
}
