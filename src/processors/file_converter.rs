use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use pipeline::{BoxError, Processor, ProcessorInfo};
use tokio::process::Command;

use crate::util;

const CONVERT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Default)]
pub struct FileConverterOptions {
    /// Write to this exact path instead of swapping the input's extension.
    pub dest_path: Option<String>,
    pub delete_source: bool,
    pub timeout: Option<Duration>,
}

/// Synchronous container rewrite via a local encoder subprocess.
///
/// Unlike the queued convert service this blocks its pipeline stage until
/// the encoder finishes; it suits short finalization runs where queueing is
/// not wanted.
struct FileConverterProcessor {
    format: String,
    options: FileConverterOptions,
    old_path: Option<String>,
}

pub fn new_file_converter(
    format: impl Into<String>,
    options: FileConverterOptions,
) -> ProcessorInfo<String> {
    let format = format.into();
    let timeout = options.timeout.unwrap_or(CONVERT_TIMEOUT);
    ProcessorInfo::new(
        format!("{format}-file-converter"),
        Box::new(FileConverterProcessor {
            format,
            options,
            old_path: None,
        }),
    )
    .with_timeout(timeout)
}

#[async_trait]
impl Processor<String> for FileConverterProcessor {
    async fn open(&mut self) -> Result<(), BoxError> {
        if !util::ffmpeg_available().await {
            return Err("ffmpeg is not installed or not found in PATH".into());
        }
        if let Some(dest) = &self.options.dest_path {
            if !dest.ends_with(&format!(".{}", self.format)) {
                return Err(format!("dest path {dest} does not end with .{}", self.format).into());
            }
        }
        Ok(())
    }

    async fn process(&mut self, path: String) -> Result<String, BoxError> {
        if path.ends_with(&format!(".{}", self.format)) {
            log::debug!("{path} already in target format, skipping conversion");
            return Ok(path);
        }

        let output = match &self.options.dest_path {
            Some(dest) => dest.clone(),
            None => util::change_path_format(&path, &self.format),
        };

        let result = Command::new("ffmpeg")
            .args(["-hide_banner", "-i", &path, "-c", "copy", &output])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        for line in String::from_utf8_lossy(&result.stderr).lines() {
            log::debug!("ffmpeg: {line}");
        }
        if !result.status.success() {
            return Err(format!("ffmpeg exited with status {}", result.status).into());
        }

        self.old_path = Some(path);
        Ok(output)
    }

    async fn close(&mut self) -> Result<(), BoxError> {
        if self.options.delete_source {
            if let Some(old) = self.old_path.take() {
                tokio::fs::remove_file(&old).await?;
            }
        }
        Ok(())
    }
}
