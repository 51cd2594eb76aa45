use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{ActiveRecordingsFn, ConvertError, ConvertManager, TaskQueue};
use crate::util;

const FFMPEG_BUCKET: &str = "Queue_FFmpeg";
const SCHEDULER_TICK: Duration = Duration::from_secs(60);
const ROW_RETRY_ATTEMPTS: u32 = 3;

/// Local encoder backend: one task at a time, container copy only, and only
/// while no recording is writing to disk.
pub struct FfmpegManager {
    inner: Arc<Inner>,
}

struct Inner {
    bucket: OnceLock<store::Bucket>,
    get_actives: ActiveRecordingsFn,
    /// taskId -> cancellation handle for the running subprocess.
    processing: DashMap<String, CancellationToken>,
}

impl FfmpegManager {
    pub fn new(get_actives: ActiveRecordingsFn) -> Self {
        Self {
            inner: Arc::new(Inner {
                bucket: OnceLock::new(),
                get_actives,
                processing: DashMap::new(),
            }),
        }
    }
}

#[async_trait]
impl ConvertManager for FfmpegManager {
    async fn start_worker(
        &self,
        token: CancellationToken,
        db: &store::Client,
    ) -> Result<(), ConvertError> {
        if !util::ffmpeg_available().await {
            return Err(ConvertError::FfmpegNotInstalled);
        }
        let bucket = db.bucket(FFMPEG_BUCKET)?;
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
        let task = TaskQueue {
            task_id: Uuid::new_v4().to_string(),
            input_path: input_path.to_string(),
            output_path: output_path.to_string(),
            input_format: util::path_format(input_path),
            output_format: format.to_string(),
            delete_source,
        };
        self.inner
            .bucket()?
            .put(task.task_id.as_bytes(), &task.to_bytes()?)?;
        Ok(task)
    }

    async fn cancel(&self, task_id: &str) -> Result<(), ConvertError> {
        let running = self.inner.processing.remove(task_id);
        if let Some((_, token)) = &running {
            token.cancel();
        }
        let bucket = self.inner.bucket()?;
        if !bucket.exists(task_id.as_bytes())? && running.is_none() {
            return Err(ConvertError::TaskNotFound);
        }
        bucket.delete(task_id.as_bytes())?;
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

    async fn run_scheduler(&self, token: CancellationToken) {
        let mut tick = tokio::time::interval(SCHEDULER_TICK);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tick.tick() => {
                    if let Err(e) = self.run_next_task(&token).await {
                        log::error!("ffmpeg queue tick failed: {e}");
                    }
                }
            }
        }
    }

    async fn run_next_task(&self, token: &CancellationToken) -> Result<(), ConvertError> {
        let actives = (self.get_actives)();
        if actives > 0 {
            log::debug!("active recordings detected ({actives}), skipping ffmpeg tasks");
            return Ok(());
        }

        let bucket = self.bucket()?;
        let Some((_, row)) = bucket.first()? else {
            return Ok(());
        };
        let task = TaskQueue::from_bytes(&row)?;
        let task_id = task.task_id.clone();

        let delete_row = || async {
            util::with_retry(ROW_RETRY_ATTEMPTS, "delete queue row", || async {
                self.bucket()?
                    .delete(task_id.as_bytes())
                    .map_err(ConvertError::from)
            })
            .await
        };

        if !util::file_exists(&task.input_path).await {
            log::warn!(
                "input file {} no longer exists, cancelling task {task_id}",
                task.input_path
            );
            delete_row().await?;
            return Ok(());
        }

        log::info!(
            "processing ffmpeg task {task_id} input={} output={}",
            task.input_path,
            task.output_path
        );
        if let Err(e) = self.process_task(token, &task).await {
            log::error!("ffmpeg task {task_id} failed: {e}");
            return Ok(());
        }

        delete_row().await?;
        log::info!("ffmpeg task {task_id} completed and removed from queue");
        Ok(())
    }

    async fn process_task(
        &self,
        token: &CancellationToken,
        task: &TaskQueue,
    ) -> Result<(), ConvertError> {
        if util::file_exists(&task.output_path).await {
            log::warn!(
                "output file {} already exists, skipping conversion",
                task.output_path
            );
            return Ok(());
        }

        let process_token = token.child_token();
        self.processing
            .insert(task.task_id.clone(), process_token.clone());
        let result = self.run_encoder(&process_token, task).await;
        self.processing.remove(&task.task_id);
        result?;

        if !task.delete_source || task.input_path == task.output_path {
            return Ok(());
        }
        util::with_retry(ROW_RETRY_ATTEMPTS, "delete source file", || async {
            if !util::file_exists(&task.input_path).await {
                log::debug!("source file {} does not exist, skipping delete", task.input_path);
                return Ok(());
            }
            tokio::fs::remove_file(&task.input_path).await
        })
        .await?;
        Ok(())
    }

    async fn run_encoder(
        &self,
        token: &CancellationToken,
        task: &TaskQueue,
    ) -> Result<(), ConvertError> {
        let mut child = Command::new("ffmpeg")
            .args([
                "-hide_banner",
                "-i",
                &task.input_path,
                "-c",
                "copy",
                &task.output_path,
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // The encoder chats on stderr; keep it in the task log at debug.
        if let Some(stderr) = child.stderr.take() {
            let task_id = task.task_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::debug!("[{task_id}] ffmpeg: {line}");
                }
            });
        }

        let status = tokio::select! {
            _ = token.cancelled() => {
                let _ = child.kill().await;
                return Err(ConvertError::Io(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    "encoder cancelled",
                )));
            }
            status = child.wait() => status?,
        };

        if !status.success() {
            return Err(ConvertError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("ffmpeg exited with status {status}"),
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, FfmpegManager, store::Client) {
        let dir = tempfile::tempdir().unwrap();
        let db = store::Client::open(dir.path().join("queues.db")).unwrap();
        let manager = FfmpegManager::new(Arc::new(|| 0));
        let bucket = db.bucket(FFMPEG_BUCKET).unwrap();
        let _ = manager.inner.bucket.set(bucket);
        (dir, manager, db)
    }

    #[tokio::test]
    async fn enqueue_persists_a_row_with_uuid_task_id() {
        let (_dir, manager, _db) = manager();
        let task = manager
            .enqueue("/r/a.flv", "/r/a.mp4", "mp4", true)
            .await
            .unwrap();

        assert!(Uuid::parse_str(&task.task_id).is_ok());
        assert_eq!(task.input_format, "flv");

        let listed = manager.list_in_progress().await.unwrap();
        assert_eq!(listed, vec![task]);
    }

    #[tokio::test]
    async fn cancel_removes_row_and_reports_missing_tasks() {
        let (_dir, manager, _db) = manager();
        let task = manager
            .enqueue("/r/a.flv", "/r/a.mp4", "mp4", false)
            .await
            .unwrap();

        manager.cancel(&task.task_id).await.unwrap();
        assert!(manager.list_in_progress().await.unwrap().is_empty());

        assert!(matches!(
            manager.cancel("unknown-task").await.unwrap_err(),
            ConvertError::TaskNotFound
        ));
    }

    #[tokio::test]
    async fn rows_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queues.db");
        let task = {
            let db = store::Client::open(&path).unwrap();
            let manager = FfmpegManager::new(Arc::new(|| 0));
            let _ = manager.inner.bucket.set(db.bucket(FFMPEG_BUCKET).unwrap());
            let task = manager
                .enqueue("/r/a.flv", "/r/a.mp4", "mp4", false)
                .await
                .unwrap();
            db.close().unwrap();
            task
        };

        let db = store::Client::open(&path).unwrap();
        let manager = FfmpegManager::new(Arc::new(|| 0));
        let _ = manager.inner.bucket.set(db.bucket(FFMPEG_BUCKET).unwrap());
        assert_eq!(manager.list_in_progress().await.unwrap(), vec![task]);
    }
}
