use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pipeline::{BoxError, Processor, ProcessorInfo};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::stream::StreamChunk;

const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const SYNC_INTERVAL: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Buffered file writer for the capture path.
///
/// Writes go through a large BufWriter; a background task flushes every 5
/// seconds and fsyncs every 30 so a crash loses at most a few seconds.
struct StreamWriterProcessor {
    path: PathBuf,
    buffer_size: usize,
    writer: Option<Arc<Mutex<BufWriter<File>>>>,
    maintenance: Option<JoinHandle<()>>,
    stop: CancellationToken,
}

pub fn new_stream_writer(path: PathBuf, buffer_size: usize) -> ProcessorInfo<StreamChunk> {
    ProcessorInfo::new(
        "buffered-writer",
        Box::new(StreamWriterProcessor {
            path,
            buffer_size,
            writer: None,
            maintenance: None,
            stop: CancellationToken::new(),
        }),
    )
    .with_timeout(WRITE_TIMEOUT)
}

#[async_trait]
impl Processor<StreamChunk> for StreamWriterProcessor {
    async fn open(&mut self) -> Result<(), BoxError> {
        let file = File::create(&self.path).await?;
        let writer = Arc::new(Mutex::new(BufWriter::with_capacity(self.buffer_size, file)));
        log::info!("recording to {}", self.path.display());

        let task_writer = Arc::clone(&writer);
        let stop = self.stop.clone();
        self.maintenance = Some(tokio::spawn(async move {
            let mut flush_tick = tokio::time::interval(FLUSH_INTERVAL);
            let mut sync_tick = tokio::time::interval(SYNC_INTERVAL);
            flush_tick.tick().await;
            sync_tick.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = flush_tick.tick() => {
                        let mut w = task_writer.lock().await;
                        if let Err(e) = w.flush().await {
                            log::warn!("error flushing writer: {e}");
                        }
                    }
                    _ = sync_tick.tick() => {
                        let mut w = task_writer.lock().await;
                        if let Err(e) = w.flush().await {
                            log::warn!("error flushing writer: {e}");
                        } else if let Err(e) = w.get_ref().sync_all().await {
                            log::warn!("error syncing file: {e}");
                        }
                    }
                }
            }
        }));

        self.writer = Some(writer);
        Ok(())
    }

    async fn process(&mut self, item: StreamChunk) -> Result<StreamChunk, BoxError> {
        let writer = self.writer.as_ref().ok_or("writer not opened")?;
        writer.lock().await.write_all(item.as_bytes()).await?;
        Ok(item)
    }

    async fn close(&mut self) -> Result<(), BoxError> {
        self.stop.cancel();
        if let Some(task) = self.maintenance.take() {
            let _ = task.await;
        }
        if let Some(writer) = self.writer.take() {
            let mut w = writer.lock().await;
            if let Err(e) = w.flush().await {
                log::warn!("error flushing writer: {e}");
            } else if let Err(e) = w.get_ref().sync_all().await {
                log::warn!("error syncing file: {e}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline::Pipe;

    #[tokio::test]
    async fn writes_chunks_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.flv");
        let pipe = Pipe::new(vec![new_stream_writer(path.clone(), 1024)]);
        pipe.open().await.unwrap();

        let token = CancellationToken::new();
        pipe.process(
            &token,
            StreamChunk::Fixed(pool::Lease::detached(b"part one ".to_vec())),
        )
        .await
        .unwrap();
        pipe.process(
            &token,
            StreamChunk::Fixed(pool::Lease::detached(b"part two".to_vec())),
        )
        .await
        .unwrap();
        pipe.close().await;

        let written = tokio::fs::read(&path).await.unwrap();
        assert_eq!(written, b"part one part two");
    }

    #[tokio::test]
    async fn open_fails_for_unwritable_path() {
        let pipe = Pipe::new(vec![new_stream_writer(
            PathBuf::from("/nonexistent-dir/sub/out.flv"),
            1024,
        )]);
        assert!(pipe.open().await.is_err());
    }
}
