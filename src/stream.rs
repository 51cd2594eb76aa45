use std::io;

use futures_util::TryStreamExt;
use pool::{BytesPool, Lease};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

/// Size of each pooled network read buffer.
pub const STREAM_CHUNK_SIZE: usize = 256 * 1024;
/// Chunks buffered between the reader task and the pipeline.
pub const STREAM_CHANNEL_CAPACITY: usize = 10;

/// One item flowing through the capture pipeline.
///
/// Raw chunks arrive from the network still owned by the reader's byte
/// pool; the repair stage consumes them (returning the buffer on drop) and
/// emits fixed bytes in a lease of its own output pool.
#[derive(Debug)]
pub enum StreamChunk {
    Raw(Lease),
    Fixed(Lease),
}

impl StreamChunk {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            StreamChunk::Raw(lease) | StreamChunk::Fixed(lease) => lease,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl Clone for StreamChunk {
    fn clone(&self) -> Self {
        // A lease cannot be duplicated; cloning materializes the bytes.
        // Only the pipeline's continue/retry paths ever clone.
        StreamChunk::Fixed(Lease::detached(self.as_bytes().to_vec()))
    }
}

/// Bridges streaming response bodies into bounded channels of pooled chunks.
#[derive(Clone)]
pub struct StreamService {
    pool: BytesPool,
}

impl StreamService {
    pub fn new() -> Self {
        Self {
            pool: BytesPool::new(STREAM_CHUNK_SIZE),
        }
    }

    /// Drain `resp`'s body into a bounded channel of pooled chunks.
    ///
    /// The producer task closes the channel on EOF, read error, or
    /// cancellation, and returns any unsent buffer to the pool. Chunks arrive
    /// in the order the body yielded them; each received lease goes back to
    /// the pool when dropped.
    pub fn read_stream(
        &self,
        resp: reqwest::Response,
        token: CancellationToken,
    ) -> mpsc::Receiver<Lease> {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let pool = self.pool.clone();

        tokio::spawn(async move {
            let body = resp
                .bytes_stream()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
            let mut reader = StreamReader::new(Box::pin(body));

            loop {
                let mut lease = pool.get();
                let n = tokio::select! {
                    _ = token.cancelled() => return,
                    read = reader.read(&mut lease[..]) => match read {
                        Ok(0) => {
                            log::info!("stream ended");
                            return;
                        }
                        Ok(n) => n,
                        Err(e) => {
                            log::error!("error reading stream: {e}");
                            return;
                        }
                    },
                };
                lease.truncate(n);
                tokio::select! {
                    _ = token.cancelled() => return,
                    sent = tx.send(lease) => {
                        if sent.is_err() {
                            // Receiver went away; the lease inside the error
                            // is dropped back into the pool.
                            return;
                        }
                    }
                }
            }
        });

        rx
    }
}

impl Default for StreamService {
    fn default() -> Self {
        Self::new()
    }
}
