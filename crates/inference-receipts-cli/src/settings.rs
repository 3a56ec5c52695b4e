use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context as _, bail};
use inference_receipts::ClientConfig;
use inference_receipts::config::{
    AMBIENT_CHAT_COMPLETIONS_URL, DEFAULT_RECEIPT_DIR, chat_completions_url,
};

pub const DEFAULT_MODEL: &str = "zai-org/GLM-4.6";
pub const DEFAULT_PROMPT: &str =
    "What is compound interest? Give a brief definition and a worked example.";
pub const DEFAULT_BENCH_OUTPUT: &str = "data/bench.jsonl";

/// Loads `.env` from the crate directory and then the working directory.
pub fn load_dotenv() {
    let _ = dotenvy::from_path(concat!(env!("CARGO_MANIFEST_DIR"), "/.env"));
    dotenvy::dotenv().ok();
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

/// Parses an optional variable, warning and falling back to `None` on bad input.
fn parse_opt<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment value");
            None
        }
    }
}

fn parse_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    parse_opt::<f64>(lookup, key)
        .filter(|secs| secs.is_finite() && *secs > 0.0)
        .map(Duration::from_secs_f64)
}

/// Endpoint, credentials and models for one provider prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderSettings {
    pub prefix: String,
    pub api_url: String,
    pub api_key: Option<String>,
    pub models: Vec<String>,
    pub connect_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
}

impl ProviderSettings {
    pub fn from_env(prefix: &str) -> Self {
        Self::from_lookup(prefix, env_lookup)
    }

    /// Resolves `{P}_API_URL` / `{P}_BASE_URL`, `{P}_API_KEY` and
    /// `{P}_MODELS` (comma or newline separated) or `{P}_MODEL`. A model is
    /// dropped when `{P}_MODEL_{NAME}_ENABLED` is set to a false value.
    /// `{P}_CONNECT_TIMEOUT_SECS` and `{P}_READ_TIMEOUT_SECS` are optional.
    pub fn from_lookup(prefix: &str, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let key = |suffix: &str| format!("{prefix}_{suffix}");
        let api_url = chat_completions_url(
            lookup(&key("API_URL")).as_deref(),
            lookup(&key("BASE_URL")).as_deref(),
            AMBIENT_CHAT_COMPLETIONS_URL,
        );
        let models = match lookup(&key("MODELS")) {
            Some(raw) => parse_models(&raw),
            None => vec![lookup(&key("MODEL")).unwrap_or_else(|| DEFAULT_MODEL.to_string())],
        };
        let models = models
            .into_iter()
            .filter(|model| {
                lookup(&model_flag_key(prefix, model))
                    .and_then(|v| parse_bool(&v))
                    .unwrap_or(true)
            })
            .collect();
        Self {
            prefix: prefix.to_string(),
            api_url,
            api_key: lookup(&key("API_KEY")),
            models,
            connect_timeout: parse_secs(&lookup, &key("CONNECT_TIMEOUT_SECS")),
            read_timeout: parse_secs(&lookup, &key("READ_TIMEOUT_SECS")),
        }
    }

    pub fn default_model(&self) -> anyhow::Result<&str> {
        match self.models.first() {
            Some(model) => Ok(model),
            None => bail!("{}: no models configured", self.prefix),
        }
    }

    pub fn client_config(&self) -> anyhow::Result<ClientConfig> {
        let api_key = self
            .api_key
            .clone()
            .with_context(|| format!("{}_API_KEY is not set", self.prefix))?;
        let mut config = ClientConfig::new(&self.api_url, api_key)
            .provider(self.prefix.to_ascii_lowercase())
            .read_timeout(self.read_timeout);
        if let Some(timeout) = self.connect_timeout {
            config = config.connect_timeout(timeout);
        }
        Ok(config)
    }
}

/// Splits on commas and newlines, trims, and drops blanks and duplicates.
fn parse_models(raw: &str) -> Vec<String> {
    let mut models: Vec<String> = Vec::new();
    for model in raw.split([',', '\n']).map(str::trim) {
        if !model.is_empty() && !models.iter().any(|m| m == model) {
            models.push(model.to_string());
        }
    }
    models
}

fn model_flag_key(prefix: &str, model: &str) -> String {
    let sanitized: String = model
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{prefix}_MODEL_{sanitized}_ENABLED")
}

/// Request and pipeline defaults shared by every subcommand.
#[derive(Clone, Debug, PartialEq)]
pub struct RunDefaults {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f64>,
    pub prompt: String,
    pub receipt_dir: PathBuf,
    pub stall_threshold: Duration,
    pub bench_warmup: usize,
    pub bench_runs: usize,
    pub bench_output: PathBuf,
}

impl RunDefaults {
    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let stall_ms: f64 = parse_opt(&lookup, "BENCH_STALL_THRESHOLD_MS").unwrap_or(2000.0);
        Self {
            temperature: parse_opt(&lookup, "REQUEST_TEMPERATURE"),
            max_tokens: parse_opt(&lookup, "REQUEST_MAX_TOKENS"),
            top_p: parse_opt(&lookup, "REQUEST_TOP_P"),
            prompt: lookup("AMBIENT_PROMPT").unwrap_or_else(|| DEFAULT_PROMPT.to_string()),
            receipt_dir: lookup("AMBIENT_RECEIPT_DIR")
                .unwrap_or_else(|| DEFAULT_RECEIPT_DIR.to_string())
                .into(),
            stall_threshold: Duration::from_secs_f64(stall_ms.max(0.0) / 1000.0),
            bench_warmup: parse_opt(&lookup, "BENCH_WARMUP_RUNS").unwrap_or(1),
            bench_runs: parse_opt(&lookup, "BENCH_RUNS").unwrap_or(3),
            bench_output: lookup("BENCH_OUTPUT")
                .unwrap_or_else(|| DEFAULT_BENCH_OUTPUT.to_string())
                .into(),
        }
    }
}
