use async_trait::async_trait;
use flv::RealtimeFixer;
use pipeline::{BoxError, Processor, ProcessorInfo};
use pool::BufferPool;

use crate::stream::StreamChunk;

const OUT_BUFFER_INITIAL: usize = 8 * 1024;
const OUT_BUFFER_MAX_RETAINED: usize = 1024 * 1024;

/// Repairs the FLV byte stream chunk-by-chunk as it is captured.
struct FlvFixProcessor {
    fixer: RealtimeFixer,
    out_pool: BufferPool,
}

pub fn new_flv_fixer() -> ProcessorInfo<StreamChunk> {
    ProcessorInfo::new(
        "flv-fixer",
        Box::new(FlvFixProcessor {
            fixer: RealtimeFixer::new(),
            out_pool: BufferPool::new(OUT_BUFFER_INITIAL, OUT_BUFFER_MAX_RETAINED),
        }),
    )
}

#[async_trait]
impl Processor<StreamChunk> for FlvFixProcessor {
    async fn open(&mut self) -> Result<(), BoxError> {
        Ok(())
    }

    async fn process(&mut self, item: StreamChunk) -> Result<StreamChunk, BoxError> {
        let mut out = self.out_pool.get();
        self.fixer.fix_into(item.as_bytes(), out.vec_mut())?;
        // `item` drops here; a raw chunk's buffer returns to the reader's
        // pool while the fixed bytes ride a lease of the output pool.
        Ok(StreamChunk::Fixed(out))
    }

    async fn close(&mut self) -> Result<(), BoxError> {
        let stats = self.fixer.dedup_stats();
        log::info!(
            "dedup stats: {} duplicates detected, cache size: {}/{}",
            stats.duplicates,
            stats.cache_size,
            stats.cache_capacity
        );
        self.fixer.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flv::FLV_HEADER;
    use pipeline::Pipe;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn fixes_chunks_through_the_pipeline() {
        let pipe = Pipe::new(vec![new_flv_fixer()]);
        pipe.open().await.unwrap();
        let token = CancellationToken::new();

        let out = pipe
            .process(&token, StreamChunk::Fixed(pool::Lease::detached(FLV_HEADER.to_vec())))
            .await
            .unwrap();
        // Header plus PreviousTagSize0.
        assert_eq!(out.len(), 13);
        assert_eq!(&out.as_bytes()[..3], b"FLV");
        pipe.close().await;
    }

    #[tokio::test]
    async fn invalid_stream_fails_the_stage() {
        let pipe = Pipe::new(vec![new_flv_fixer()]);
        pipe.open().await.unwrap();
        let token = CancellationToken::new();

        let err = pipe
            .process(&token, StreamChunk::Fixed(pool::Lease::detached(b"not an flv".to_vec())))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("flv-fixer"));
    }
}
