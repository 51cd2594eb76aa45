use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

/// Room metadata from the upstream live platform.
#[derive(Debug, Clone, Deserialize)]
pub struct RoomInfo {
    pub room_id: u64,
    #[serde(default)]
    pub title: Option<String>,
    pub is_live: bool,
}

#[derive(Debug, Error)]
pub enum LiveError {
    #[error("room {0} not found")]
    RoomNotFound(u64),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("upstream error: {0}")]
    Upstream(String),
}

/// Boundary to the credentialed live-platform client.
///
/// The recorder only needs three questions answered: is the room live, which
/// URLs can be played, and an open byte stream for one of them.
#[async_trait]
pub trait LiveClient: Send + Sync {
    async fn room_info(&self, room_id: u64) -> Result<RoomInfo, LiveError>;
    async fn stream_urls(&self, room_id: u64) -> Result<Vec<String>, LiveError>;
    async fn open_stream(&self, url: &str) -> Result<reqwest::Response, LiveError>;
}

/// Thin HTTP adapter used by the daemon binary.
pub struct HttpLiveClient {
    http: reqwest::Client,
    // Live stream bodies must not carry an overall timeout.
    stream_http: reqwest::Client,
    base: String,
}

impl HttpLiveClient {
    pub fn new(base: impl Into<String>) -> Result<Self, LiveError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        let stream_http = reqwest::Client::builder().build()?;
        let mut base = base.into();
        while base.ends_with('/') {
            base.pop();
        }
        Ok(Self {
            http,
            stream_http,
            base,
        })
    }
}

#[async_trait]
impl LiveClient for HttpLiveClient {
    async fn room_info(&self, room_id: u64) -> Result<RoomInfo, LiveError> {
        let resp = self
            .http
            .get(format!("{}/rooms/{room_id}", self.base))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(LiveError::RoomNotFound(room_id));
        }
        if !resp.status().is_success() {
            return Err(LiveError::Upstream(format!(
                "room info request failed with status {}",
                resp.status()
            )));
        }
        Ok(resp.json().await?)
    }

    async fn stream_urls(&self, room_id: u64) -> Result<Vec<String>, LiveError> {
        let resp = self
            .http
            .get(format!("{}/rooms/{room_id}/streams", self.base))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(LiveError::RoomNotFound(room_id));
        }
        if !resp.status().is_success() {
            return Err(LiveError::Upstream(format!(
                "stream url request failed with status {}",
                resp.status()
            )));
        }
        Ok(resp.json().await?)
    }

    async fn open_stream(&self, url: &str) -> Result<reqwest::Response, LiveError> {
        let resp = self.stream_http.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(LiveError::Upstream(format!(
                "stream fetch failed with status {}",
                resp.status()
            )));
        }
        Ok(resp)
    }
}
