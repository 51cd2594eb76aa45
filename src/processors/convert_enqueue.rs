use std::sync::Arc;

use async_trait::async_trait;
use pipeline::{BoxError, Processor, ProcessorInfo};

use crate::convert;

/// Finalization stage: hand the finished recording to the convert service.
struct ConvertEnqueueProcessor {
    convert: Arc<convert::Service>,
    format: String,
    delete_source: bool,
}

pub fn new_convert_enqueue(
    convert: Arc<convert::Service>,
    format: impl Into<String>,
    delete_source: bool,
) -> ProcessorInfo<String> {
    let format = format.into();
    ProcessorInfo::new(
        format!("{format}-convert-enqueue"),
        Box::new(ConvertEnqueueProcessor {
            convert,
            format,
            delete_source,
        }),
    )
}

#[async_trait]
impl Processor<String> for ConvertEnqueueProcessor {
    async fn open(&mut self) -> Result<(), BoxError> {
        Ok(())
    }

    async fn process(&mut self, path: String) -> Result<String, BoxError> {
        let task = self
            .convert
            .enqueue(&path, &self.format, self.delete_source)
            .await?;
        log::info!(
            "queued transcode task {} for {} -> {}",
            task.task_id,
            task.input_path,
            task.output_path
        );
        Ok(path)
    }

    async fn close(&mut self) -> Result<(), BoxError> {
        Ok(())
    }
}
