//! Client for the CloudConvert v2 API, covering the task flow this service
//! needs: import/upload, convert with stream copy, export by URL, task
//! status polling, and result download.

mod download;
mod task;
mod types;
mod upload;

pub use types::*;

use std::time::Duration;

use thiserror::Error;

const DEFAULT_BASE_URL: &str = "https://api.cloudconvert.com/v2/";
const JSON_TIMEOUT: Duration = Duration::from_secs(30);

/// Upload bodies are streamed in chunks of this size by default.
pub const DEFAULT_UPLOAD_CHUNK_SIZE: usize = 5 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("api request failed with status {status}: {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("task {0} returned no usable result")]
    MissingResult(String),
}

/// API client. JSON calls go through a timed client; upload and download
/// bodies go through a separate client with no overall timeout so large
/// transfers are not cut off mid-stream.
pub struct Client {
    json: reqwest::Client,
    stream: reqwest::Client,
    base_url: String,
    api_key: String,
    upload_chunk_size: usize,
}

impl Client {
    pub fn new(api_key: impl Into<String>) -> Result<Self, CloudError> {
        Self::builder(api_key).build()
    }

    pub fn builder(api_key: impl Into<String>) -> ClientBuilder {
        ClientBuilder {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            upload_chunk_size: DEFAULT_UPLOAD_CHUNK_SIZE,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.bearer_auth(&self.api_key)
    }

    pub(crate) async fn check(resp: reqwest::Response) -> Result<reqwest::Response, CloudError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(CloudError::Api { status, body })
    }
}

pub struct ClientBuilder {
    api_key: String,
    base_url: String,
    upload_chunk_size: usize,
}

impl ClientBuilder {
    /// Point at a different API root. Used by tests.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        let mut url = base_url.into();
        if !url.ends_with('/') {
            url.push('/');
        }
        self.base_url = url;
        self
    }

    pub fn upload_chunk_size(mut self, size: usize) -> Self {
        if size > 0 {
            self.upload_chunk_size = size;
        }
        self
    }

    pub fn build(self) -> Result<Client, CloudError> {
        let json = reqwest::Client::builder().timeout(JSON_TIMEOUT).build()?;
        let stream = reqwest::Client::builder().build()?;
        Ok(Client {
            json,
            stream,
            base_url: self.base_url,
            api_key: self.api_key,
            upload_chunk_size: self.upload_chunk_size,
        })
    }
}
