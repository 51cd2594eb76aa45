use std::path::Path;

use reqwest::multipart::{Form, Part};
use reqwest::Body;
use tokio_util::io::ReaderStream;

use crate::{Client, CloudError, UploadTask, UploadTaskResponse};

impl Client {
    /// Create an import/upload task; its result carries the presigned form.
    pub async fn create_upload_task(&self) -> Result<UploadTask, CloudError> {
        let resp = self
            .authorized(self.json.post(self.url("import/upload")))
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        Ok(resp.json::<UploadTaskResponse>().await?.data)
    }

    /// Stream a file to the upload task's form URL as a multipart body.
    ///
    /// The file is read in pooled-size chunks and never buffered whole in
    /// memory, so multi-gigabyte recordings upload at constant memory.
    pub async fn upload_file(&self, path: &Path, task: &UploadTask) -> Result<(), CloudError> {
        let file = tokio::fs::File::open(path).await?;
        let len = file.metadata().await?.len();

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());

        let mut form = Form::new();
        // Presigned form fields must precede the file part.
        for (key, value) in &task.result.form.parameters {
            let text = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            form = form.text(key.clone(), text);
        }

        let stream = ReaderStream::with_capacity(file, self.upload_chunk_size);
        let part = Part::stream_with_length(Body::wrap_stream(stream), len).file_name(file_name);
        form = form.part("file", part);

        let resp = self
            .stream
            .post(&task.result.form.url)
            .multipart(form)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Client, CloudError, TaskStatus, UploadForm, UploadTaskResult};
    use std::collections::HashMap;

    fn task_with_url(url: &str) -> UploadTask {
        UploadTask {
            id: "u1".to_string(),
            status: TaskStatus::Waiting,
            result: UploadTaskResult {
                form: UploadForm {
                    url: url.to_string(),
                    parameters: HashMap::from([
                        ("key".to_string(), serde_json::json!("abc")),
                        ("expires".to_string(), serde_json::json!(42)),
                    ]),
                },
            },
        }
    }

    #[tokio::test]
    async fn missing_input_file_is_an_io_error() {
        let client = Client::new("test-key").unwrap();
        let err = client
            .upload_file(
                Path::new("/no/such/upload.flv"),
                &task_with_url("http://127.0.0.1:9/upload"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Io(_)));
    }

    #[tokio::test]
    async fn unreachable_form_url_surfaces_a_network_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.flv");
        tokio::fs::write(&path, b"FLV\x01\x05\x00\x00\x00\x09")
            .await
            .unwrap();

        let client = Client::new("test-key").unwrap();
        // Port 9 (discard) has no listener on loopback; the multipart body
        // is built from the on-disk file, then the connect fails.
        let err = client
            .upload_file(&path, &task_with_url("http://127.0.0.1:9/upload"))
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Network(_)));
    }
}
