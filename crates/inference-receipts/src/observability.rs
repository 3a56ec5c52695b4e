use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INIT: OnceCell<()> = OnceCell::new();

const DEFAULT_JSON_LOG_FILE: &str = "receipts.logs.jsonl";

/// Where log output goes.
#[derive(Clone, Debug, PartialEq, Eq)]
enum LogTarget {
    Disabled,
    /// Compact human-readable lines on stderr.
    Console,
    /// JSON lines appended to a file.
    JsonFile(PathBuf),
}

fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

fn resolve_target(var: impl Fn(&str) -> Option<String>) -> LogTarget {
    let enabled = var("RECEIPTS_OBSERVABILITY")
        .map(|v| parse_bool_env(&v).unwrap_or(true))
        .unwrap_or(true);
    if !enabled {
        return LogTarget::Disabled;
    }
    match var("RECEIPTS_JSON_LOG_PATH").filter(|p| !p.trim().is_empty()) {
        Some(path) => LogTarget::JsonFile(PathBuf::from(path)),
        None => LogTarget::Console,
    }
}

fn resolve_env_filter() -> tracing_subscriber::EnvFilter {
    if let Ok(level) = std::env::var("RECEIPTS_LOG_LEVEL")
        && let Ok(filter) = tracing_subscriber::EnvFilter::try_new(level)
    {
        return filter;
    }
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

/// Initialize logging once per process.
///
/// Environment variables:
/// - `RECEIPTS_OBSERVABILITY`: optional enable/disable flag (default enabled).
/// - `RECEIPTS_LOG_LEVEL`: level/filter override (`info`, `debug`, ...).
/// - `RUST_LOG`: fallback filter.
/// - `RECEIPTS_JSON_LOG_PATH`: when set, logs are written as JSONL to this file.
///   Otherwise they go to stderr, leaving stdout to streamed tokens and reports.
pub fn init_observability() {
    INIT.get_or_init(|| {
        let target = resolve_target(|key| std::env::var(key).ok());
        let env_filter = resolve_env_filter();
        match target {
            LogTarget::Disabled => {}
            LogTarget::JsonFile(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    let _ = std::fs::create_dir_all(parent);
                }
                let dir = path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or_else(|| Path::new("."));
                let file_name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or(DEFAULT_JSON_LOG_FILE);
                let writer = tracing_appender::rolling::never(dir, file_name);
                let json_layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(false)
                    .with_writer(writer);
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(json_layer)
                    .try_init();
            }
            LogTarget::Console => {
                let console_layer = tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr);
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(console_layer)
                    .try_init();
            }
        }
    });
}
