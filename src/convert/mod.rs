//! Transcode queueing: a dispatcher routing by file size over two durable
//! queue backends, a local encoder subprocess and a remote conversion API.

mod cloud;
mod ffmpeg;

pub use cloud::CloudConvertManager;
pub use ffmpeg::FfmpegManager;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::util;

const QUEUE_DB_FILE: &str = "queues.db";

/// Callback reporting how many recordings are currently active; the local
/// encoder defers to live captures for disk and CPU.
pub type ActiveRecordingsFn = Arc<dyn Fn() -> usize + Send + Sync>;

/// One persisted row in a transcode queue, keyed by `task_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskQueue {
    pub task_id: String,
    pub input_path: String,
    pub output_path: String,
    pub input_format: String,
    pub output_format: String,
    pub delete_source: bool,
}

impl TaskQueue {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ConvertError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ConvertError> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("convert task not found")]
    TaskNotFound,
    #[error("no convert manager available")]
    NoManagerAvailable,
    #[error("ffmpeg is not installed or not found in PATH")]
    FfmpegNotInstalled,
    #[error("cloud convert client is not configured")]
    CloudNotConfigured,
    #[error("input file not found: {0}")]
    InputNotFound(String),
    #[error("manager is not started")]
    NotStarted,
    #[error(transparent)]
    Store(#[from] store::StoreError),
    #[error(transparent)]
    Cloud(#[from] cloudconvert::CloudError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("row encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Queue backend contract shared by the local and remote managers.
#[async_trait]
pub trait ConvertManager: Send + Sync {
    /// Open the durable bucket and launch the scheduler.
    async fn start_worker(
        &self,
        token: CancellationToken,
        db: &store::Client,
    ) -> Result<(), ConvertError>;

    async fn enqueue(
        &self,
        input_path: &str,
        output_path: &str,
        format: &str,
        delete_source: bool,
    ) -> Result<TaskQueue, ConvertError>;

    async fn cancel(&self, task_id: &str) -> Result<(), ConvertError>;

    async fn list_in_progress(&self) -> Result<Vec<TaskQueue>, ConvertError>;
}

/// Front door over the queue managers, routing each file by size.
pub struct Service {
    cloud_threshold: i64,
    managers: RwLock<HashMap<&'static str, Arc<dyn ConvertManager>>>,
    db: RwLock<Option<store::Client>>,
    token: CancellationToken,
    database_dir: std::path::PathBuf,
}

impl Service {
    pub fn new(cfg: &Config, token: CancellationToken) -> Result<Self, ConvertError> {
        let mut managers: HashMap<&'static str, Arc<dyn ConvertManager>> = HashMap::new();

        if !cfg.cloud_convert_api_key.is_empty() {
            let client = cloudconvert::Client::builder(cfg.cloud_convert_api_key.clone())
                .upload_chunk_size(cfg.upload_buffer_size)
                .build()?;
            managers.insert(
                "cloudconvert",
                Arc::new(CloudConvertManager::new(
                    client,
                    cfg.download_buffer_size,
                    cfg.download_writer_buffer_size,
                )),
            );
        } else {
            log::info!("cloud convert api key not provided, cloud convert disabled");
        }

        Ok(Self {
            cloud_threshold: cfg.cloud_convert_threshold,
            managers: RwLock::new(managers),
            db: RwLock::new(None),
            token,
            database_dir: cfg.database_dir.clone(),
        })
    }

    /// Register the local encoder backend if the binary is present.
    ///
    /// Called once during wiring, before [`Self::start`]. Absence of the
    /// encoder leaves the backend unregistered rather than failing.
    pub async fn register_local_encoder(&self, get_actives: ActiveRecordingsFn) {
        if self.managers.read().expect("managers lock").contains_key("ffmpeg") {
            return;
        }
        if util::ffmpeg_available().await {
            self.managers
                .write()
                .expect("managers lock")
                .insert("ffmpeg", Arc::new(FfmpegManager::new(get_actives)));
        } else {
            log::warn!("ffmpeg not available, local convert manager not initialized");
        }
    }

    /// Open the queue database and launch every backend's scheduler.
    pub async fn start(&self) -> Result<(), ConvertError> {
        let db = store::Client::open(self.database_dir.join(QUEUE_DB_FILE))?;
        let managers: Vec<Arc<dyn ConvertManager>> = {
            self.managers
                .read()
                .expect("managers lock")
                .values()
                .cloned()
                .collect()
        };
        for manager in managers {
            manager.start_worker(self.token.clone(), &db).await?;
        }
        *self.db.write().expect("db lock") = Some(db);
        Ok(())
    }

    /// Flush the database. Must run after every scheduler has observed
    /// cancellation; the database closes last.
    pub fn shutdown(&self) {
        if let Some(db) = self.db.read().expect("db lock").as_ref() {
            if let Err(e) = db.close() {
                log::error!("error closing queue database: {e}");
            }
        }
    }

    pub async fn enqueue(
        &self,
        path: &str,
        format: &str,
        delete_source: bool,
    ) -> Result<TaskQueue, ConvertError> {
        self.check_managers()?;

        let meta = tokio::fs::metadata(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConvertError::InputNotFound(path.to_string())
            } else {
                ConvertError::Io(e)
            }
        })?;

        let output_path = util::change_path_format(path, format);
        let manager = self.route(meta.len() as i64)?;
        manager
            .enqueue(path, &output_path, format, delete_source)
            .await
    }

    pub async fn cancel(&self, task_id: &str) -> Result<(), ConvertError> {
        self.check_managers()?;
        let managers: Vec<Arc<dyn ConvertManager>> = {
            self.managers
                .read()
                .expect("managers lock")
                .values()
                .cloned()
                .collect()
        };
        for manager in managers {
            match manager.cancel(task_id).await {
                Ok(()) => return Ok(()),
                Err(ConvertError::TaskNotFound) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(ConvertError::TaskNotFound)
    }

    pub async fn list_in_progress(&self) -> Result<Vec<TaskQueue>, ConvertError> {
        self.check_managers()?;
        let managers: Vec<Arc<dyn ConvertManager>> = {
            self.managers
                .read()
                .expect("managers lock")
                .values()
                .cloned()
                .collect()
        };
        let mut all = Vec::new();
        for manager in managers {
            all.extend(manager.list_in_progress().await?);
        }
        Ok(all)
    }

    fn route(&self, file_size: i64) -> Result<Arc<dyn ConvertManager>, ConvertError> {
        let managers = self.managers.read().expect("managers lock");
        let use_cloud = managers.contains_key("cloudconvert")
            && self.cloud_threshold >= 0
            && file_size >= self.cloud_threshold;
        let key = if use_cloud { "cloudconvert" } else { "ffmpeg" };
        managers
            .get(key)
            .cloned()
            .ok_or(ConvertError::NoManagerAvailable)
    }

    fn check_managers(&self) -> Result<(), ConvertError> {
        if self.managers.read().expect("managers lock").is_empty() {
            return Err(ConvertError::NoManagerAvailable);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingManager {
        enqueued: AtomicUsize,
        known_task: Option<String>,
    }

    #[async_trait]
    impl ConvertManager for RecordingManager {
        async fn start_worker(
            &self,
            _token: CancellationToken,
            _db: &store::Client,
        ) -> Result<(), ConvertError> {
            Ok(())
        }

        async fn enqueue(
            &self,
            input_path: &str,
            output_path: &str,
            format: &str,
            delete_source: bool,
        ) -> Result<TaskQueue, ConvertError> {
            self.enqueued.fetch_add(1, Ordering::SeqCst);
            Ok(TaskQueue {
                task_id: "stub".into(),
                input_path: input_path.into(),
                output_path: output_path.into(),
                input_format: util::path_format(input_path),
                output_format: format.into(),
                delete_source,
            })
        }

        async fn cancel(&self, task_id: &str) -> Result<(), ConvertError> {
            match &self.known_task {
                Some(known) if known == task_id => Ok(()),
                _ => Err(ConvertError::TaskNotFound),
            }
        }

        async fn list_in_progress(&self) -> Result<Vec<TaskQueue>, ConvertError> {
            Ok(Vec::new())
        }
    }

    fn service_with(
        threshold: i64,
        local: Option<Arc<RecordingManager>>,
        cloud: Option<Arc<RecordingManager>>,
    ) -> Service {
        let mut managers: HashMap<&'static str, Arc<dyn ConvertManager>> = HashMap::new();
        if let Some(local) = local {
            managers.insert("ffmpeg", local);
        }
        if let Some(cloud) = cloud {
            managers.insert("cloudconvert", cloud);
        }
        Service {
            cloud_threshold: threshold,
            managers: RwLock::new(managers),
            db: RwLock::new(None),
            token: CancellationToken::new(),
            database_dir: std::path::PathBuf::from("unused"),
        }
    }

    async fn file_of_size(dir: &tempfile::TempDir, name: &str, size: usize) -> String {
        let path = dir.path().join(name);
        tokio::fs::write(&path, vec![0u8; size]).await.unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn routes_small_files_to_local_and_large_to_cloud() {
        let dir = tempfile::tempdir().unwrap();
        let local = Arc::new(RecordingManager::default());
        let cloud = Arc::new(RecordingManager::default());
        let svc = service_with(1000, Some(Arc::clone(&local)), Some(Arc::clone(&cloud)));

        let small = file_of_size(&dir, "small.flv", 100).await;
        svc.enqueue(&small, "mp4", false).await.unwrap();
        assert_eq!(local.enqueued.load(Ordering::SeqCst), 1);
        assert_eq!(cloud.enqueued.load(Ordering::SeqCst), 0);

        let large = file_of_size(&dir, "large.flv", 2000).await;
        let task = svc.enqueue(&large, "mp4", true).await.unwrap();
        assert_eq!(cloud.enqueued.load(Ordering::SeqCst), 1);
        assert!(task.output_path.ends_with("large.mp4"));
        assert!(task.delete_source);
    }

    #[tokio::test]
    async fn negative_threshold_disables_cloud_routing() {
        let dir = tempfile::tempdir().unwrap();
        let local = Arc::new(RecordingManager::default());
        let cloud = Arc::new(RecordingManager::default());
        let svc = service_with(-1, Some(Arc::clone(&local)), Some(Arc::clone(&cloud)));

        let huge = file_of_size(&dir, "huge.flv", 10_000).await;
        svc.enqueue(&huge, "mp4", false).await.unwrap();
        assert_eq!(local.enqueued.load(Ordering::SeqCst), 1);
        assert_eq!(cloud.enqueued.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_input_is_reported() {
        let local = Arc::new(RecordingManager::default());
        let svc = service_with(1000, Some(local), None);
        let err = svc.enqueue("/no/such/file.flv", "mp4", false).await.unwrap_err();
        assert!(matches!(err, ConvertError::InputNotFound(_)));
    }

    #[tokio::test]
    async fn no_managers_is_an_error() {
        let svc = service_with(1000, None, None);
        let err = svc.enqueue("/ignored.flv", "mp4", false).await.unwrap_err();
        assert!(matches!(err, ConvertError::NoManagerAvailable));
    }

    #[tokio::test]
    async fn cancel_first_match_wins() {
        let local = Arc::new(RecordingManager {
            enqueued: AtomicUsize::new(0),
            known_task: Some("t-local".into()),
        });
        let cloud = Arc::new(RecordingManager::default());
        let svc = service_with(1000, Some(local), Some(cloud));

        svc.cancel("t-local").await.unwrap();
        assert!(matches!(
            svc.cancel("unknown").await.unwrap_err(),
            ConvertError::TaskNotFound
        ));
    }

    #[test]
    fn task_queue_row_encoding_is_stable() {
        let task = TaskQueue {
            task_id: "abc".into(),
            input_path: "/r/1.flv".into(),
            output_path: "/r/1.mp4".into(),
            input_format: "flv".into(),
            output_format: "mp4".into(),
            delete_source: true,
        };
        let bytes = task.to_bytes().unwrap();
        // Field names are part of the persisted contract.
        let text = String::from_utf8(bytes.clone()).unwrap();
        for field in [
            "task_id",
            "input_path",
            "output_path",
            "input_format",
            "output_format",
            "delete_source",
        ] {
            assert!(text.contains(field), "missing field {field}");
        }
        assert_eq!(TaskQueue::from_bytes(&bytes).unwrap(), task);
    }
}
