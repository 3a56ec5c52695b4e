//! Receipt construction, hashing and persistence.
//!
//! A receipt binds the raw SSE bodies of one stream to the request that
//! produced them. Hashes are computed once, when the receipt is built, over
//! exactly the strings that end up in the file:
//!
//! - `events_hash = sha256(raw_events.join("\n"))`
//! - `payload_hash = sha256(canonical_json(prompt_payload))`
//! - `content_hash = sha256(accumulated text)`

use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::accumulator::{AccumulatedResponse, EndState};
use crate::errors::ReceiptError;
use crate::event::{StreamEvent, Usage};
use crate::model::sanitize_model_id;

/// Current receipt schema version.
pub const RECEIPT_VERSION: u32 = 1;

/// Separator placed between raw events before hashing.
pub const EVENT_SEPARATOR: &str = "\n";

/// Latency marks copied from the finalized response.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ReceiptTiming {
    pub ttfb_ms: Option<f64>,
    pub ttc_ms: Option<f64>,
}

/// Persisted record of one inference stream.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Receipt {
    pub receipt_version: u32,
    pub run_id: uuid::Uuid,
    pub model_id: String,
    /// Outgoing request body exactly as sent.
    pub prompt_payload: serde_json::Value,
    /// SSE `data` bodies in arrival order, verbatim.
    pub raw_events: Vec<String>,
    pub event_count: usize,
    pub events_hash: String,
    pub payload_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    /// Set when the stream produced no content.
    #[serde(default)]
    pub empty_content: bool,
    pub end_state: EndState,
    #[serde(default)]
    pub timing: ReceiptTiming,
    pub saved_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl Receipt {
    /// Loads a typed receipt from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ReceiptError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| ReceiptError::io(path, e))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Overwrites `path` with this receipt. Used for deliberate rewrites only;
    /// new receipts go through `ReceiptStore::save`.
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<(), ReceiptError> {
        let path = path.as_ref();
        let body = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, body).map_err(|e| ReceiptError::io(path, e))
    }
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// True for a 64-character lowercase hex digest.
pub fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Order-sensitive hash over raw event bodies.
pub fn events_hash<S: AsRef<str>>(raw_events: &[S]) -> String {
    let mut hasher = Sha256::new();
    for (i, raw) in raw_events.iter().enumerate() {
        if i > 0 {
            hasher.update(EVENT_SEPARATOR.as_bytes());
        }
        hasher.update(raw.as_ref().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Hash of the canonical serialization of a request payload.
pub fn payload_hash(payload: &serde_json::Value) -> Result<String, serde_json::Error> {
    Ok(sha256_hex(&canonical_json(payload)?))
}

/// Compact JSON with object keys sorted recursively.
pub fn canonical_json(value: &serde_json::Value) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&sorted(value))
}

fn sorted(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = serde_json::Map::with_capacity(map.len());
            for key in keys {
                out.insert(key.clone(), sorted(&map[key]));
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(sorted).collect())
        }
        other => other.clone(),
    }
}

/// Builds a `Receipt` from a finalized response and its source events.
pub struct ReceiptBuilder {
    run_id: uuid::Uuid,
    model_id: String,
    prompt_payload: serde_json::Value,
}

impl ReceiptBuilder {
    pub fn new(model_id: impl Into<String>, prompt_payload: serde_json::Value) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4(),
            model_id: model_id.into(),
            prompt_payload,
        }
    }

    /// Uses an existing run id instead of a fresh one.
    pub fn run_id(mut self, run_id: uuid::Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn build(
        &self,
        response: &AccumulatedResponse,
        events: &[StreamEvent],
    ) -> Result<Receipt, ReceiptError> {
        self.build_at(response, events, Utc::now())
    }

    pub fn build_at(
        &self,
        response: &AccumulatedResponse,
        events: &[StreamEvent],
        saved_at: DateTime<Utc>,
    ) -> Result<Receipt, ReceiptError> {
        let raw_events: Vec<String> = events.iter().map(|e| e.raw_text.clone()).collect();
        let events_hash = events_hash(&raw_events);
        let payload_hash = payload_hash(&self.prompt_payload)?;
        let empty_content = response.event_count == 0 || response.text.is_empty();
        if empty_content {
            warn!(run_id = %self.run_id, model = %self.model_id, "building receipt for a stream without content");
        }

        Ok(Receipt {
            receipt_version: RECEIPT_VERSION,
            run_id: self.run_id,
            model_id: self.model_id.clone(),
            prompt_payload: self.prompt_payload.clone(),
            event_count: raw_events.len(),
            raw_events,
            events_hash,
            payload_hash,
            content_hash: Some(sha256_hex(response.text.as_bytes())),
            empty_content,
            end_state: response.end.clone().unwrap_or(EndState::Closed),
            timing: ReceiptTiming {
                ttfb_ms: response.ttfb_ms(),
                ttc_ms: response.ttc_ms(),
            },
            saved_at,
            usage: (!response.usage.is_empty()).then_some(response.usage),
        })
    }
}

/// Directory of receipt files, one per run.
#[derive(Clone, Debug)]
pub struct ReceiptStore {
    dir: PathBuf,
}

impl ReceiptStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `{saved_at millis}_{model}_{run id prefix}.json`
    pub fn file_name(receipt: &Receipt) -> String {
        let run = receipt.run_id.simple().to_string();
        format!(
            "{}_{}_{}.json",
            receipt.saved_at.timestamp_millis(),
            sanitize_model_id(&receipt.model_id),
            &run[..8]
        )
    }

    /// Writes the receipt to a new file; never replaces an existing one.
    ///
    /// The body is written and synced under a hidden staging name first and
    /// then linked into place, so a failed write never leaves a partial
    /// `.json` behind.
    pub fn save(&self, receipt: &Receipt) -> Result<PathBuf, ReceiptError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| ReceiptError::io(&self.dir, e))?;
        let name = Self::file_name(receipt);
        let path = self.dir.join(&name);
        let staging = self.dir.join(format!(".{name}.partial"));
        let body = serde_json::to_vec_pretty(receipt)?;

        let linked = write_synced(&staging, &body).and_then(|()| {
            std::fs::hard_link(&staging, &path).map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => ReceiptError::AlreadyExists(path.clone()),
                _ => ReceiptError::io(&path, e),
            })
        });
        if let Err(e) = std::fs::remove_file(&staging)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %staging.display(), error = %e, "could not remove staging file");
        }
        linked?;

        info!(path = %path.display(), run_id = %receipt.run_id, events = receipt.event_count, "receipt saved");
        Ok(path)
    }

    /// All `*.json` receipts, oldest first.
    pub fn list(&self) -> Result<Vec<PathBuf>, ReceiptError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ReceiptError::io(&self.dir, e)),
        };
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| ReceiptError::io(&self.dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .map_err(|e| ReceiptError::io(&path, e))?;
            found.push((modified, path));
        }
        found.sort();
        Ok(found.into_iter().map(|(_, path)| path).collect())
    }

    /// Most recently written receipt.
    pub fn latest(&self) -> Result<PathBuf, ReceiptError> {
        self.list()?
            .pop()
            .ok_or_else(|| ReceiptError::NotFound(self.dir.clone()))
    }
}

fn write_synced(path: &Path, body: &[u8]) -> Result<(), ReceiptError> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| ReceiptError::io(path, e))?;
    file.write_all(body)
        .and_then(|_| file.sync_all())
        .map_err(|e| ReceiptError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::ResponseAccumulator;
    use crate::sse::parse_event;

    fn sample_events() -> Vec<StreamEvent> {
        vec![
            parse_event(r#"{"choices":[{"delta":{"content":"Hi"}}]}"#),
            parse_event(
                r#"{"choices":[{"delta":{"content":"!"}}],"usage":{"prompt_tokens":3,"completion_tokens":2}}"#,
            ),
            parse_event("[DONE]"),
        ]
    }

    fn sample_receipt() -> Receipt {
        let events = sample_events();
        let mut acc = ResponseAccumulator::start();
        for event in &events {
            acc.apply(event);
        }
        ReceiptBuilder::new("zai-org/glm-4.6", serde_json::json!({"model":"zai-org/glm-4.6"}))
            .build(&acc.finish(), &events)
            .expect("receipt")
    }

    #[test]
    fn events_hash_matches_joined_digest() {
        let raw = ["a", "b", "[DONE]"];
        assert_eq!(events_hash(&raw), sha256_hex(b"a\nb\n[DONE]"));
    }

    #[test]
    fn events_hash_is_order_sensitive() {
        assert_ne!(events_hash(&["x", "y"]), events_hash(&["y", "x"]));
    }

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let a = serde_json::json!({"b":1,"a":{"d":[{"z":1,"y":2}],"c":null}});
        let bytes = canonical_json(&a).expect("canonical");
        assert_eq!(
            String::from_utf8(bytes).expect("utf8"),
            r#"{"a":{"c":null,"d":[{"y":2,"z":1}]},"b":1}"#
        );
    }

    #[test]
    fn builder_copies_raw_text_and_usage() {
        let receipt = sample_receipt();
        assert_eq!(receipt.raw_events.len(), 3);
        assert_eq!(receipt.event_count, 3);
        assert_eq!(receipt.raw_events[2], "[DONE]");
        assert_eq!(receipt.usage, Some(Usage::new(3, 2)));
        assert_eq!(receipt.content_hash.as_deref(), Some(sha256_hex(b"Hi!").as_str()));
        assert!(is_sha256_hex(&receipt.events_hash));
        assert!(is_sha256_hex(&receipt.payload_hash));
        assert!(!receipt.empty_content);
    }

    #[test]
    fn empty_stream_still_builds_a_flagged_receipt() {
        let events = vec![parse_event("[DONE]")];
        let mut acc = ResponseAccumulator::start();
        acc.apply(&events[0]);
        let receipt = ReceiptBuilder::new("m", serde_json::json!({}))
            .build(&acc.finish(), &events)
            .expect("receipt");
        assert!(receipt.empty_content);
        assert!(receipt.usage.is_none());
    }

    #[test]
    fn store_never_overwrites_and_finds_latest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ReceiptStore::new(dir.path().join("receipts"));
        let receipt = sample_receipt();

        let path = store.save(&receipt).expect("save");
        assert!(
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.contains("zai-org_glm-4.6"))
        );
        assert!(matches!(
            store.save(&receipt),
            Err(ReceiptError::AlreadyExists(_))
        ));
        assert_eq!(store.latest().expect("latest"), path);
        assert_eq!(Receipt::load(&path).expect("load"), receipt);
    }

    #[test]
    fn failed_write_leaves_no_receipt_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ReceiptStore::new(dir.path());
        let receipt = sample_receipt();
        let name = ReceiptStore::file_name(&receipt);
        // A directory squatting on the staging name makes the body write fail.
        std::fs::create_dir(dir.path().join(format!(".{name}.partial"))).expect("blocker");

        assert!(matches!(store.save(&receipt), Err(ReceiptError::Io { .. })));
        assert!(!dir.path().join(&name).exists());
        assert!(matches!(store.latest(), Err(ReceiptError::NotFound(_))));
    }

    #[test]
    fn latest_on_missing_dir_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ReceiptStore::new(dir.path().join("absent"));
        assert!(matches!(store.latest(), Err(ReceiptError::NotFound(_))));
    }
}
