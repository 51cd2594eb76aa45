use futures_util::TryStreamExt;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

use crate::{Client, CloudError};

impl Client {
    /// Open a byte stream over an exported result file.
    ///
    /// The returned reader has no overall timeout; callers bound the whole
    /// download themselves.
    pub async fn download_stream(
        &self,
        url: &str,
    ) -> Result<impl AsyncRead + Unpin, CloudError> {
        let resp = self.stream.get(url).send().await?;
        let resp = Self::check(resp).await?;
        let stream = resp
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        Ok(StreamReader::new(Box::pin(stream)))
    }
}
