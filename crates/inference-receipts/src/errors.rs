use std::path::PathBuf;
use std::time::Duration;

use crate::model::ProviderId;

/// Stream-level failures raised while opening or reading a provider stream.
///
/// These are distinct from malformed events, which are surfaced in-band as
/// `EventKind::Error` values and never abort the reader on their own.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// Provider answered with a non-success HTTP status before streaming.
    #[error("provider error ({provider}): {message}")]
    Provider {
        provider: ProviderId,
        message: String,
        status_code: Option<u16>,
    },
    /// Connection, TLS or body read failed mid-stream.
    #[error("transport error ({provider}): {message}")]
    Transport {
        provider: ProviderId,
        message: String,
    },
    /// No bytes arrived within the configured idle interval.
    #[error("stream idle for {idle:?}")]
    IdleTimeout { idle: Duration },
}

impl StreamError {
    /// Creates a provider-level error.
    pub fn provider(
        provider: impl Into<ProviderId>,
        message: impl Into<String>,
        status_code: Option<u16>,
    ) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
            status_code,
        }
    }

    /// Creates a transport-level error.
    pub fn transport(provider: impl Into<ProviderId>, message: impl Into<String>) -> Self {
        Self::Transport {
            provider: provider.into(),
            message: message.into(),
        }
    }
}

/// Terminal run failure reported through `RunEvent::Failed`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
pub enum RunFailure {
    /// Provider rejected the request.
    #[error("provider failure ({provider}): {message}")]
    Provider { provider: String, message: String },
    /// Network/stream transport failed or went idle.
    #[error("transport failure ({provider}): {message}")]
    Transport { provider: String, message: String },
    /// The stream ended with an error event and the receipt policy refused it.
    #[error("stream aborted: {message}")]
    Aborted { message: String },
    /// The pipeline detected a protocol or invariant error.
    #[error("protocol failure: {message}")]
    Protocol { message: String },
    /// The run was cancelled by the caller.
    #[error("run cancelled")]
    Cancelled,
}

impl RunFailure {
    pub(crate) fn from_stream_error(err: &StreamError) -> Self {
        match err {
            StreamError::Provider {
                provider, message, ..
            } => Self::Provider {
                provider: provider.to_string(),
                message: message.clone(),
            },
            StreamError::Transport { provider, message } => Self::Transport {
                provider: provider.to_string(),
                message: message.clone(),
            },
            StreamError::IdleTimeout { .. } => Self::Transport {
                provider: "stream".to_string(),
                message: err.to_string(),
            },
        }
    }
}

/// Errors raised while persisting or loading receipts.
#[derive(Debug, thiserror::Error)]
pub enum ReceiptError {
    #[error("receipt io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("receipt serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    /// A receipt with the same file name already exists; receipts are never overwritten.
    #[error("receipt already exists: {0}")]
    AlreadyExists(PathBuf),
    #[error("no receipts found in {0}")]
    NotFound(PathBuf),
}

impl ReceiptError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors raised by the tamper simulator.
#[derive(Debug, thiserror::Error)]
pub enum TamperError {
    #[error("raw event index {index} out of range (receipt has {len} events)")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("raw event {index} is not a content delta")]
    NotADelta { index: usize },
    #[error(transparent)]
    Receipt(#[from] ReceiptError),
}

/// Errors raised while recording benchmark results.
#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    #[error("bench output io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("bench record serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid bench config: {0}")]
    Config(String),
}

/// Top-level error type for the public client API.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// Invalid client/transport configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Invalid request input.
    #[error("validation error: {0}")]
    Validation(String),
    /// Stream could not be opened or read.
    #[error(transparent)]
    Stream(#[from] StreamError),
    /// Terminal failure returned from a started run.
    #[error(transparent)]
    RunFailed(RunFailure),
    /// Receipt could not be written.
    #[error(transparent)]
    Receipt(#[from] ReceiptError),
    /// Internal protocol misuse or invariant violation.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl HarnessError {
    pub(crate) fn protocol_msg(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}

impl From<RunFailure> for HarnessError {
    fn from(value: RunFailure) -> Self {
        HarnessError::RunFailed(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_timeout_counts_as_transport_failure() {
        let err = StreamError::IdleTimeout {
            idle: Duration::from_secs(5),
        };
        assert!(matches!(
            RunFailure::from_stream_error(&err),
            RunFailure::Transport { .. }
        ));
    }

    #[test]
    fn provider_status_maps_to_provider_failure() {
        let err = StreamError::provider("ambient", "401 unauthorized", Some(401));
        assert_eq!(
            RunFailure::from_stream_error(&err),
            RunFailure::Provider {
                provider: "ambient".into(),
                message: "401 unauthorized".into(),
            }
        );
    }
}
