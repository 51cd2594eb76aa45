use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use cloudconvert::{ResultFile, TaskData, TaskStatus, VideoConvertPayload};
use dashmap::DashSet;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::{ConvertError, ConvertManager, TaskQueue};
use crate::util;

const CLOUD_BUCKET: &str = "Queue_CloudConvert";
const SCHEDULER_TICK: Duration = Duration::from_secs(3 * 60);
const ROW_RETRY_ATTEMPTS: u32 = 3;
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60 * 60);
/// Result downloads allowed in flight at once.
const CONCURRENT_DOWNLOADS: usize = 2;

/// Remote conversion backend: upload, convert with stream copy, export by
/// URL, then poll until the exported file can be pulled down.
///
/// The persisted task id is the export task's id; polling that single id
/// reflects the whole chain's state.
pub struct CloudConvertManager {
    inner: Arc<Inner>,
}

struct Inner {
    client: cloudconvert::Client,
    bucket: OnceLock<store::Bucket>,
    downloading: DashSet<String>,
    download_pool: pool::BytesPool,
    download_writer_buffer_size: usize,
    concurrent: Semaphore,
}

impl CloudConvertManager {
    pub fn new(
        client: cloudconvert::Client,
        download_buffer_size: usize,
        download_writer_buffer_size: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                bucket: OnceLock::new(),
                downloading: DashSet::new(),
                download_pool: pool::BytesPool::new(download_buffer_size),
                download_writer_buffer_size,
                concurrent: Semaphore::new(CONCURRENT_DOWNLOADS),
            }),
        }
    }
}

#[async_trait]
impl ConvertManager for CloudConvertManager {
    async fn start_worker(
        &self,
        token: CancellationToken,
        db: &store::Client,
    ) -> Result<(), ConvertError> {
        let bucket = db.bucket(CLOUD_BUCKET)?;
        let _ = self.inner.bucket.set(bucket);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.run_scheduler(token).await;
        });
        Ok(())
    }

    async fn enqueue(
        &self,
        input_path: &str,
        output_path: &str,
        format: &str,
        delete_source: bool,
    ) -> Result<TaskQueue, ConvertError> {
        self.inner
            .enqueue(input_path, output_path, format, delete_source)
            .await
    }

    async fn cancel(&self, task_id: &str) -> Result<(), ConvertError> {
        if !self.inner.client.cancel_task(task_id).await? {
            return Err(ConvertError::TaskNotFound);
        }
        self.inner.bucket()?.delete(task_id.as_bytes())?;
        Ok(())
    }

    async fn list_in_progress(&self) -> Result<Vec<TaskQueue>, ConvertError> {
        let mut tasks = Vec::new();
        self.inner.bucket()?.for_each(|_, v| {
            match TaskQueue::from_bytes(v) {
                Ok(task) => tasks.push(task),
                Err(e) => log::warn!("skipping undecodable queue row: {e}"),
            }
            Ok(())
        })?;
        Ok(tasks)
    }
}

impl Inner {
    fn bucket(&self) -> Result<&store::Bucket, ConvertError> {
        self.bucket.get().ok_or(ConvertError::NotStarted)
    }

    async fn enqueue(
        &self,
        input_path: &str,
        output_path: &str,
        format: &str,
        delete_source: bool,
    ) -> Result<TaskQueue, ConvertError> {
        let upload = self.client.create_upload_task().await?;
        self.client
            .upload_file(Path::new(input_path), &upload)
            .await?;

        let input_format = util::path_format(input_path);
        let filename = Path::new(output_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        let convert = self
            .client
            .video_convert(&VideoConvertPayload {
                input: upload.id.clone(),
                input_format: Some(input_format.clone()),
                output_format: format.to_string(),
                video_codec: Some("copy".to_string()),
                audio_codec: Some("copy".to_string()),
                filename,
            })
            .await?;

        let export = self.client.create_export_url(&convert.id).await?;

        let task = TaskQueue {
            task_id: export.id,
            input_path: input_path.to_string(),
            output_path: output_path.to_string(),
            input_format,
            output_format: format.to_string(),
            delete_source,
        };
        self.bucket()?
            .put(task.task_id.as_bytes(), &task.to_bytes()?)?;
        Ok(task)
    }

    async fn run_scheduler(&self, token: CancellationToken) {
        let mut tick = tokio::time::interval(SCHEDULER_TICK);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tick.tick() => self.check_tasks(&token).await,
            }
        }
    }

    async fn check_tasks(&self, token: &CancellationToken) {
        log::debug!("checking cloud convert task queue");
        let rows = match self.list_rows() {
            Ok(rows) => rows,
            Err(e) => {
                log::error!("failed to list in-progress tasks: {e}");
                return;
            }
        };

        for queue in rows {
            let id = queue.task_id.clone();
            if self.downloading.contains(&id) {
                log::debug!("task {id} is downloading, skip status check");
                continue;
            }

            let info = match self.client.get_task(&id).await {
                Ok(info) => info,
                Err(e) => {
                    log::error!("failed to get task info for {id}: {e}");
                    continue;
                }
            };
            log::info!("task {id} status={:?}", info.status);

            let result = match info.status {
                TaskStatus::Finished => self.on_finished(token, &queue, &info).await,
                TaskStatus::Error => self.on_failed(&queue, &info).await,
                _ => Ok(()),
            };
            if let Err(e) = result {
                log::error!("handling task {id} status={:?} failed: {e}", info.status);
            }
        }
    }

    fn list_rows(&self) -> Result<Vec<TaskQueue>, ConvertError> {
        let mut tasks = Vec::new();
        self.bucket()?.for_each(|_, v| {
            if let Ok(task) = TaskQueue::from_bytes(v) {
                tasks.push(task);
            }
            Ok(())
        })?;
        Ok(tasks)
    }

    async fn on_finished(
        &self,
        token: &CancellationToken,
        queue: &TaskQueue,
        info: &TaskData,
    ) -> Result<(), ConvertError> {
        let files = info
            .result
            .as_ref()
            .map(|r| r.files.as_slice())
            .unwrap_or_default();
        let file = select_result_file(queue, files)
            .ok_or_else(|| {
                ConvertError::Cloud(cloudconvert::CloudError::MissingResult(
                    queue.task_id.clone(),
                ))
            })?;
        let url = file.url.clone().ok_or_else(|| {
            ConvertError::Cloud(cloudconvert::CloudError::MissingResult(
                queue.task_id.clone(),
            ))
        })?;

        self.downloading.insert(queue.task_id.clone());
        let result = self.download_result(token, queue, &url).await;
        self.downloading.remove(&queue.task_id);
        result?;

        log::info!(
            "downloaded exported file for task {} to {}",
            queue.task_id,
            queue.output_path
        );

        util::with_retry(ROW_RETRY_ATTEMPTS, "delete queue row", || async {
            self.bucket()?
                .delete(queue.task_id.as_bytes())
                .map_err(ConvertError::from)
        })
        .await?;

        if !queue.delete_source || queue.input_path == queue.output_path {
            return Ok(());
        }
        util::with_retry(ROW_RETRY_ATTEMPTS, "delete source file", || async {
            if !util::file_exists(&queue.input_path).await {
                log::debug!(
                    "source file {} does not exist, skipping delete",
                    queue.input_path
                );
                return Ok(());
            }
            tokio::fs::remove_file(&queue.input_path).await
        })
        .await?;
        Ok(())
    }

    /// A failed remote task is rebuilt from scratch. The old row is removed
    /// only once the replacement is durably persisted; if that removal
    /// fails the new task is cancelled so exactly one row survives.
    async fn on_failed(&self, queue: &TaskQueue, info: &TaskData) -> Result<(), ConvertError> {
        log::error!(
            "task {} failed with message: {}",
            queue.task_id,
            info.message.as_deref().unwrap_or("<none>")
        );
        log::info!("re-enqueueing task {}", queue.task_id);

        let replacement = self
            .enqueue(
                &queue.input_path,
                &queue.output_path,
                &queue.output_format,
                queue.delete_source,
            )
            .await?;
        log::info!(
            "re-enqueued task {} as new task {}",
            queue.task_id,
            replacement.task_id
        );

        let deleted = util::with_retry(ROW_RETRY_ATTEMPTS, "delete queue row", || async {
            self.bucket()?
                .delete(queue.task_id.as_bytes())
                .map_err(ConvertError::from)
        })
        .await;

        if let Err(e) = deleted {
            log::warn!(
                "cancelling re-enqueued task {} after failing to delete old task {}",
                replacement.task_id,
                queue.task_id
            );
            if self.client.cancel_task(&replacement.task_id).await? {
                let _ = self.bucket()?.delete(replacement.task_id.as_bytes());
            }
            return Err(e);
        }
        Ok(())
    }

    async fn download_result(
        &self,
        token: &CancellationToken,
        queue: &TaskQueue,
        url: &str,
    ) -> Result<(), ConvertError> {
        let _permit = self
            .concurrent
            .acquire()
            .await
            .map_err(|_| ConvertError::NotStarted)?;

        if util::file_exists(&queue.output_path).await {
            log::warn!(
                "file {} already exists, skipping download",
                queue.output_path
            );
            return Ok(());
        }

        let reader = self.client.download_stream(url).await?;
        let write = pool::write_stream_to_file(
            token,
            reader,
            Path::new(&queue.output_path),
            &self.download_pool,
            self.download_writer_buffer_size,
        );
        tokio::time::timeout(DOWNLOAD_TIMEOUT, write)
            .await
            .map_err(|_| {
                ConvertError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "download timed out",
                ))
            })??;
        Ok(())
    }
}

/// Pick which remote result file to download: exact output name first, then
/// the first file in the target format, then whatever came first.
fn select_result_file<'a>(queue: &TaskQueue, files: &'a [ResultFile]) -> Option<&'a ResultFile> {
    if files.is_empty() {
        return None;
    }
    if files.len() == 1 {
        return Some(&files[0]);
    }

    log::warn!(
        "multiple result files for task {}, using smart detect",
        queue.task_id
    );
    let wanted_name = Path::new(&queue.output_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned());
    if let Some(file) = files
        .iter()
        .find(|f| Some(&f.filename) == wanted_name.as_ref())
    {
        return Some(file);
    }
    if let Some(file) = files
        .iter()
        .find(|f| util::path_format(&f.filename) == queue.output_format)
    {
        return Some(file);
    }
    log::debug!("no matched filename or format, fallback to first file");
    Some(&files[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> TaskQueue {
        TaskQueue {
            task_id: "exp-1".into(),
            input_path: "/r/in.flv".into(),
            output_path: "/r/in.mp4".into(),
            input_format: "flv".into(),
            output_format: "mp4".into(),
            delete_source: false,
        }
    }

    fn file(name: &str) -> ResultFile {
        serde_json::from_value(serde_json::json!({
            "filename": name,
            "url": format!("https://dl.example/{name}")
        }))
        .unwrap()
    }

    #[test]
    fn single_file_is_taken_as_is() {
        let files = vec![file("whatever.bin")];
        let picked = select_result_file(&queue(), &files).unwrap();
        assert_eq!(picked.filename, "whatever.bin");
    }

    #[test]
    fn exact_output_name_wins() {
        let files = vec![file("other.mp4"), file("in.mp4")];
        let picked = select_result_file(&queue(), &files).unwrap();
        assert_eq!(picked.filename, "in.mp4");
    }

    #[test]
    fn format_match_beats_first_file() {
        let files = vec![file("preview.png"), file("converted.mp4")];
        let picked = select_result_file(&queue(), &files).unwrap();
        assert_eq!(picked.filename, "converted.mp4");
    }

    #[test]
    fn falls_back_to_first_file() {
        let files = vec![file("a.png"), file("b.jpeg")];
        let picked = select_result_file(&queue(), &files).unwrap();
        assert_eq!(picked.filename, "a.png");
    }

    #[test]
    fn empty_result_is_none() {
        assert!(select_result_file(&queue(), &[]).is_none());
    }
}
