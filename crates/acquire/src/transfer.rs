use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use kairos_common::{Error, Result};
use kairos_config::DownloadConfig;
use reqwest::Client;
use std::pin::Pin;
use std::time::Duration;
use tracing::debug;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Response headers are available before the body is consumed
pub struct TransferResponse {
    /// Total size, when the source announced one
    pub total_bytes: Option<u64>,
    pub body: ByteStream,
}

/// Streamed GET
#[async_trait]
pub trait Transfer: Send + Sync {
    async fn get(&self, url: &str) -> Result<TransferResponse>;
}

/// reqwest-backed transfer
pub struct HttpTransfer {
    client: Client,
}

impl HttpTransfer {
    pub fn new(config: &DownloadConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transfer for HttpTransfer {
    async fn get(&self, url: &str) -> Result<TransferResponse> {
        let response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let total_bytes = response.content_length();
        debug!(url, ?total_bytes, "Transfer started");

        let body = response.bytes_stream().map(|chunk| chunk.map_err(Error::from));
        Ok(TransferResponse {
            total_bytes,
            body: Box::pin(body),
        })
    }
}
