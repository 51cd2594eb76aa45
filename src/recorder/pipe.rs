use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use pipeline::Pipe;

use super::Inner;
use crate::processors::{self, FileConverterOptions};
use crate::stream::StreamChunk;
use crate::util;
use crate::RecorderError;

/// Title fragment kept in the file name, in characters.
const TITLE_MAX_CHARS: usize = 15;

/// Build the capture pipeline and the FLV path it writes to.
///
/// Layout: `<outputDir>/<roomId>/<sanitized-title>-<unixStart>.flv`, or just
/// `<unixStart>.flv` when the room has no usable title.
pub(super) async fn new_stream_pipeline(
    inner: &Arc<Inner>,
    room_id: u64,
    title: Option<&str>,
    start_time: DateTime<Utc>,
) -> Result<(Pipe<StreamChunk>, PathBuf), RecorderError> {
    let dir = inner.cfg.output_dir.join(room_id.to_string());
    tokio::fs::create_dir_all(&dir).await?;

    let unix = start_time.timestamp();
    let file_name = match title.map(str::trim).filter(|t| !t.is_empty()) {
        Some(title) => {
            let safe = util::sanitize_filename(title);
            format!("{}-{unix}.flv", util::truncate_chars(&safe, TITLE_MAX_CHARS))
        }
        None => format!("{unix}.flv"),
    };
    let path = dir.join(file_name);

    let pipe = Pipe::new(vec![
        processors::new_flv_fixer(),
        processors::new_stream_writer(path.clone(), inner.cfg.live_stream_writer_buffer_size),
    ]);
    Ok((pipe, path))
}

/// Build the finalization pipeline; `None` when no transcode is configured.
///
/// Conversion either goes through the durable transcode queue or runs the
/// encoder synchronously inside this pipeline, per `queue_conversions`.
pub(super) fn new_final_pipeline(inner: &Arc<Inner>) -> Option<Pipe<String>> {
    if !inner.cfg.convert_flv_to_mp4 {
        return None;
    }
    let stage = if inner.cfg.queue_conversions {
        processors::new_convert_enqueue(
            Arc::clone(&inner.convert),
            "mp4",
            inner.cfg.delete_flv_after_convert,
        )
    } else {
        processors::new_file_converter(
            "mp4",
            FileConverterOptions {
                dest_path: None,
                delete_source: inner.cfg.delete_flv_after_convert,
                timeout: None,
            },
        )
    };
    Some(Pipe::new(vec![stage]))
}
