use futures::StreamExt as _;
use tracing::debug;

use crate::config::ClientConfig;
use crate::errors::{HarnessError, StreamError};
use crate::model::ProviderId;
use crate::sse::ByteStream;

/// Opens a streamed chat completion and hands back its raw body bytes.
///
/// The pipeline owns SSE decoding; implementations only deal with
/// connection setup and status handling.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Name used in logs and failures.
    fn provider(&self) -> ProviderId;

    /// Sends `payload` and returns the response body as a byte stream.
    async fn open(&self, payload: &serde_json::Value) -> Result<ByteStream, StreamError>;
}

/// `reqwest`-backed transport for OpenAI-compatible chat-completions endpoints.
pub struct HttpTransport {
    client: reqwest::Client,
    config: ClientConfig,
}

impl HttpTransport {
    pub fn new(config: ClientConfig) -> Result<Self, HarnessError> {
        if config.api_key.trim().is_empty() {
            return Err(HarnessError::Config(format!(
                "api_key must not be empty for provider {}",
                config.provider
            )));
        }
        if config.api_url.trim().is_empty() {
            return Err(HarnessError::Config("api_url must not be empty".into()));
        }
        let mut builder = reqwest::Client::builder().connect_timeout(config.connect_timeout);
        if let Some(timeout) = config.read_timeout {
            builder = builder.read_timeout(timeout);
        }
        let client = builder.build().map_err(|e| {
            HarnessError::Config(format!("failed to build http client: {e}"))
        })?;
        Ok(Self { client, config })
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    fn provider(&self) -> ProviderId {
        self.config.provider.clone()
    }

    async fn open(&self, payload: &serde_json::Value) -> Result<ByteStream, StreamError> {
        let provider = self.provider();
        debug!(provider = %provider, url = %self.config.api_url, "opening chat completions stream");

        let response = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(payload)
            .send()
            .await
            .map_err(|e| StreamError::transport(provider.clone(), format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(StreamError::provider(
                provider,
                format!("request failed with status {status}: {body}"),
                Some(status.as_u16()),
            ));
        }

        let stream = response.bytes_stream().map(move |chunk| {
            chunk.map_err(|e| {
                StreamError::transport(provider.clone(), format!("stream read failed: {e}"))
            })
        });
        Ok(Box::pin(stream))
    }
}
