use std::path::PathBuf;
use std::time::Duration;

use crate::errors::HarnessError;
use crate::model::ProviderId;

/// Chat-completions endpoint used when nothing else is configured.
pub const AMBIENT_CHAT_COMPLETIONS_URL: &str = "https://api.ambient.xyz/v1/chat/completions";

/// Default directory for persisted receipts.
pub const DEFAULT_RECEIPT_DIR: &str = "data/receipts";

/// Configuration for the HTTP transport.
///
/// Passed explicitly to `HttpTransport::new`; nothing in the stream or
/// receipt pipeline reads process environment.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Name used in logs and errors.
    pub provider: ProviderId,
    /// Full chat-completions URL.
    pub api_url: String,
    /// API key used for bearer auth.
    pub api_key: String,
    /// Connection establishment timeout.
    pub connect_timeout: Duration,
    /// Optional cap on the wait for each body read. Stream idleness is
    /// normally bounded by `RunOptions::idle_timeout` instead.
    pub read_timeout: Option<Duration>,
}

impl ClientConfig {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            provider: ProviderId::new("ambient"),
            api_url: api_url.into(),
            api_key: api_key.into(),
            connect_timeout: Duration::from_secs(30),
            read_timeout: None,
        }
    }

    /// Builds a config from `{PREFIX}_API_URL` / `{PREFIX}_BASE_URL` and
    /// `{PREFIX}_API_KEY`. Intended for binaries; the library never calls it.
    pub fn from_env_prefix(prefix: &str) -> Result<Self, HarnessError> {
        let var = |suffix: &str| {
            std::env::var(format!("{prefix}_{suffix}"))
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let api_key = var("API_KEY").ok_or_else(|| {
            HarnessError::Config(format!("missing {prefix}_API_KEY for provider"))
        })?;
        let api_url = chat_completions_url(
            var("API_URL").as_deref(),
            var("BASE_URL").as_deref(),
            AMBIENT_CHAT_COMPLETIONS_URL,
        );
        Ok(Self::new(api_url, api_key).provider(prefix.to_ascii_lowercase()))
    }

    pub fn provider(mut self, provider: impl Into<ProviderId>) -> Self {
        self.provider = provider.into();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }
}

/// Resolves the endpoint: an explicit URL wins, then a base URL with
/// `/chat/completions` appended when missing, then the default.
pub fn chat_completions_url(
    api_url: Option<&str>,
    base_url: Option<&str>,
    default_url: &str,
) -> String {
    if let Some(url) = api_url.map(str::trim).filter(|u| !u.is_empty()) {
        return url.to_string();
    }
    if let Some(base) = base_url.map(str::trim).filter(|b| !b.is_empty()) {
        let base = base.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            return base.to_string();
        }
        return format!("{base}/chat/completions");
    }
    default_url.to_string()
}

/// What the pipeline does with a malformed record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MalformedPolicy {
    /// Finalize the response as aborted.
    #[default]
    Abort,
    /// Keep the record in the event log, count it and continue.
    Skip,
}

/// When a finalized stream is persisted as a receipt.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReceiptPolicy {
    #[default]
    Disabled,
    /// Save only when the stream completed or closed normally.
    CompletedOnly,
    /// Save aborted streams too.
    Always,
}

/// Per-run pipeline options.
#[derive(Clone, Debug)]
pub struct RunOptions {
    /// Abandon the stream when no bytes arrive for this long.
    pub idle_timeout: Option<Duration>,
    /// Gap between events counted as a stall.
    pub stall_threshold: Duration,
    /// Bounded event buffer between the run task and the consumer.
    pub stream_buffer_capacity: usize,
    pub malformed: MalformedPolicy,
    pub receipt: ReceiptPolicy,
    pub receipt_dir: PathBuf,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Some(Duration::from_secs(60)),
            stall_threshold: Duration::from_millis(2000),
            stream_buffer_capacity: 128,
            malformed: MalformedPolicy::default(),
            receipt: ReceiptPolicy::default(),
            receipt_dir: PathBuf::from(DEFAULT_RECEIPT_DIR),
        }
    }
}

impl RunOptions {
    pub fn idle_timeout(mut self, idle: Option<Duration>) -> Self {
        self.idle_timeout = idle;
        self
    }

    pub fn stall_threshold(mut self, threshold: Duration) -> Self {
        self.stall_threshold = threshold;
        self
    }

    pub fn stream_buffer_capacity(mut self, capacity: usize) -> Self {
        self.stream_buffer_capacity = capacity;
        self
    }

    pub fn malformed(mut self, policy: MalformedPolicy) -> Self {
        self.malformed = policy;
        self
    }

    /// Enables receipts under `dir` with the given policy.
    pub fn save_receipts(mut self, policy: ReceiptPolicy, dir: impl Into<PathBuf>) -> Self {
        self.receipt = policy;
        self.receipt_dir = dir.into();
        self
    }
}
