use std::io;
use std::path::Path;

use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;

use crate::BytesPool;

/// Stream `reader` to `out_path` using pooled copy buffers.
///
/// Data lands in a `download-*.tmp` file next to the target, is flushed and
/// fsynced, then atomically renamed over `out_path`. On any failure the temp
/// file is removed. Cancellation aborts the copy with `ErrorKind::Interrupted`.
pub async fn write_stream_to_file<R>(
    token: &CancellationToken,
    mut reader: R,
    out_path: &Path,
    pool: &BytesPool,
    writer_buffer_size: usize,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let dir = out_path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = tempfile::Builder::new()
        .prefix("download-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    // Keep only the path: the actual writing goes through tokio's fs so the
    // copy loop never blocks the runtime. TempPath removes the file on drop.
    let tmp_path = tmp.into_temp_path();

    let file = fs::File::create(&tmp_path).await?;
    let mut writer = BufWriter::with_capacity(writer_buffer_size, file);

    loop {
        let mut lease = pool.get();
        let n = tokio::select! {
            _ = token.cancelled() => {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "download cancelled"));
            }
            read = reader.read(&mut lease[..]) => read?,
        };
        if n == 0 {
            break;
        }
        writer.write_all(&lease[..n]).await?;
    }

    writer.flush().await?;
    writer.get_ref().sync_all().await?;
    drop(writer);

    // Windows refuses to rename over an existing file; best-effort removal.
    let _ = fs::remove_file(out_path).await;
    tmp_path.persist(out_path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn streams_reader_to_target() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.bin");
        let pool = BytesPool::new(8);
        let data: Vec<u8> = (0..100u8).collect();

        let token = CancellationToken::new();
        write_stream_to_file(&token, &data[..], &out, &pool, 16)
            .await
            .unwrap();

        assert_eq!(fs::read(&out).await.unwrap(), data);
        // No temp leftovers.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn replaces_existing_target() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.bin");
        fs::write(&out, b"old contents").await.unwrap();

        let pool = BytesPool::new(4);
        let token = CancellationToken::new();
        write_stream_to_file(&token, &b"new"[..], &out, &pool, 16)
            .await
            .unwrap();

        assert_eq!(fs::read(&out).await.unwrap(), b"new");
    }

    #[tokio::test]
    async fn cancellation_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.bin");
        let pool = BytesPool::new(4);

        let token = CancellationToken::new();
        token.cancel();
        // A reader that pends forever so cancellation must win the race.
        let reader = tokio::io::empty();
        let pending = PendingReader { inner: reader };
        let err = write_stream_to_file(&token, pending, &out, &pool, 16)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
        assert!(!out.exists());
    }

    struct PendingReader<R> {
        #[allow(dead_code)]
        inner: R,
    }

    impl<R: Unpin> AsyncRead for PendingReader<R> {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Pending
        }
    }
}
