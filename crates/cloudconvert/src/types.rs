use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Remote task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Waiting,
    Processing,
    Finished,
    Error,
    #[serde(other)]
    Unknown,
}

/// Payload for a convert task mirroring `ffmpeg -i in.flv -c copy out.mp4`.
#[derive(Debug, Clone, Serialize)]
pub struct VideoConvertPayload {
    /// Id of the import task providing the input file.
    pub input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_format: Option<String>,
    pub output_format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_codec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_codec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadForm {
    pub url: String,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadTaskResult {
    pub form: UploadForm,
}

/// Import/upload task: carries the presigned form to post the file to.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadTask {
    pub id: String,
    pub status: TaskStatus,
    pub result: UploadTaskResult,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadTaskResponse {
    pub data: UploadTask,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultFile {
    pub filename: String,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskResult {
    #[serde(default)]
    pub files: Vec<ResultFile>,
}

/// Generic task record returned by status queries and task creation.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskData {
    pub id: String,
    #[serde(default)]
    pub operation: Option<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub result: Option<TaskResult>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskResponse {
    pub data: TaskData,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportUrlRequest {
    /// Id of the task whose output should be exported.
    pub input: String,
}
