use crate::{
    Client, CloudError, ExportUrlRequest, TaskData, TaskResponse, VideoConvertPayload,
};

impl Client {
    /// Fetch the current state of a task.
    pub async fn get_task(&self, task_id: &str) -> Result<TaskData, CloudError> {
        let resp = self
            .authorized(self.json.get(self.url(&format!("tasks/{task_id}"))))
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        Ok(resp.json::<TaskResponse>().await?.data)
    }

    /// Create a convert task chained to an import task. Codecs are `copy`,
    /// so the remote side only rewrites the container.
    pub async fn video_convert(
        &self,
        payload: &VideoConvertPayload,
    ) -> Result<TaskData, CloudError> {
        let resp = self
            .authorized(self.json.post(self.url("convert")))
            .json(payload)
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        Ok(resp.json::<TaskResponse>().await?.data)
    }

    /// Create an export-url task chained to a convert task. Its id is the
    /// one worth persisting: polling it yields the downloadable result.
    pub async fn create_export_url(&self, input: &str) -> Result<TaskData, CloudError> {
        let resp = self
            .authorized(self.json.post(self.url("export/url")))
            .json(&ExportUrlRequest {
                input: input.to_string(),
            })
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        Ok(resp.json::<TaskResponse>().await?.data)
    }

    /// Cancel a task. Returns false when the remote side does not know it.
    pub async fn cancel_task(&self, task_id: &str) -> Result<bool, CloudError> {
        let resp = self
            .authorized(self.json.post(self.url(&format!("tasks/{task_id}/cancel"))))
            .send()
            .await?;
        match resp.status().as_u16() {
            200 | 204 => Ok(true),
            404 => Ok(false),
            _ => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                Err(CloudError::Api { status, body })
            }
        }
    }

    /// Ask the remote side to retry a failed task in place.
    pub async fn retry_task(&self, task_id: &str) -> Result<bool, CloudError> {
        let resp = self
            .authorized(self.json.post(self.url(&format!("tasks/{task_id}/retry"))))
            .send()
            .await?;
        match resp.status().as_u16() {
            200 | 204 => Ok(true),
            404 => Ok(false),
            _ => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                Err(CloudError::Api { status, body })
            }
        }
    }

    /// Delete a task record remotely.
    pub async fn delete_task(&self, task_id: &str) -> Result<bool, CloudError> {
        let resp = self
            .authorized(self.json.delete(self.url(&format!("tasks/{task_id}"))))
            .send()
            .await?;
        match resp.status().as_u16() {
            200 | 204 => Ok(true),
            404 => Ok(false),
            _ => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                Err(CloudError::Api { status, body })
            }
        }
    }
}
