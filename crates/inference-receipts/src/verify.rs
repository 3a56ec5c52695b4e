//! Receipt verification.
//!
//! Receipts are read back as untyped JSON so that a missing or mistyped field
//! fails the check that depends on it instead of the whole load. All five
//! checks always run and are all reported.

use std::fmt;
use std::path::Path;

use tracing::info;

use crate::errors::ReceiptError;
use crate::event::{EventKind, Usage};
use crate::receipt::{Receipt, events_hash, is_sha256_hex, payload_hash, sha256_hex};
use crate::sse::{DONE_SENTINEL, parse_event};

pub const CHECK_EVENTS_HASH: &str = "events_hash";
pub const CHECK_PAYLOAD_HASH: &str = "payload_hash";
pub const CHECK_EVENT_PARSING: &str = "event parsing";
pub const CHECK_CONTENT: &str = "content";
pub const CHECK_USAGE: &str = "usage";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckStatus {
    Pass,
    Fail,
}

/// Outcome of a single verification check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckResult {
    pub name: &'static str,
    pub status: CheckStatus,
    pub detail: String,
}

impl CheckResult {
    fn pass(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Pass,
            detail: detail.into(),
        }
    }

    fn fail(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Fail,
            detail: detail.into(),
        }
    }

    pub fn passed(&self) -> bool {
        self.status == CheckStatus::Pass
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Rejected,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted => f.write_str("ACCEPTED"),
            Self::Rejected => f.write_str("REJECTED"),
        }
    }
}

/// Per-check results for one receipt. Produced fresh on every run.
#[derive(Clone, Debug)]
pub struct VerificationReport {
    /// Where the receipt came from (path or label).
    pub source: String,
    pub model_id: String,
    pub event_count: usize,
    pub content_deltas: usize,
    pub content_chars: usize,
    pub usage: Option<Usage>,
    pub checks: Vec<CheckResult>,
}

impl VerificationReport {
    /// `Accepted` iff every check passed.
    pub fn verdict(&self) -> Verdict {
        if self.checks.iter().all(CheckResult::passed) {
            Verdict::Accepted
        } else {
            Verdict::Rejected
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.verdict() == Verdict::Accepted
    }

    pub fn failed_checks(&self) -> Vec<&CheckResult> {
        self.checks.iter().filter(|c| !c.passed()).collect()
    }

    pub fn check(&self, name: &str) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.name == name)
    }
}

const REPORT_WIDTH: usize = 62;

impl fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "─".repeat(REPORT_WIDTH);
        let usage = self.usage.unwrap_or_default();
        writeln!(f, "{rule}")?;
        writeln!(f, "  Receipt  : {}", self.source)?;
        writeln!(f, "  Model    : {}", self.model_id)?;
        writeln!(
            f,
            "  Events   : {}  |  Tokens: {} prompt + {} completion",
            self.event_count,
            usage.prompt_tokens.unwrap_or(0),
            usage.completion_tokens.unwrap_or(0)
        )?;
        writeln!(f)?;
        for check in &self.checks {
            let (icon, tag) = match check.status {
                CheckStatus::Pass => ("✓", "[PASS]"),
                CheckStatus::Fail => ("✗", "[FAIL]"),
            };
            writeln!(f, "  {icon} {tag:<6} {:<16} {}", check.name, check.detail)?;
        }
        writeln!(f)?;
        match self.verdict() {
            Verdict::Accepted => writeln!(f, "  Status: ACCEPTED ✓")?,
            Verdict::Rejected => {
                let reasons: Vec<&str> = self.failed_checks().iter().map(|c| c.name).collect();
                writeln!(f, "  Status: REJECTED ✗  (reason: {})", reasons.join(", "))?;
            }
        }
        write!(f, "{rule}")
    }
}

/// Runs the receipt checks. Read-only and free of side effects.
pub struct ReceiptVerifier;

impl ReceiptVerifier {
    /// Reads a receipt file and verifies it.
    pub fn verify_path(path: impl AsRef<Path>) -> Result<VerificationReport, ReceiptError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| ReceiptError::io(path, e))?;
        let report = Self::verify_bytes(&bytes, path.display().to_string());
        info!(
            path = %path.display(),
            verdict = %report.verdict(),
            failed = report.failed_checks().len(),
            "receipt verified"
        );
        Ok(report)
    }

    /// Verifies raw receipt bytes. Bytes that are not JSON fail every check.
    pub fn verify_bytes(bytes: &[u8], source: impl Into<String>) -> VerificationReport {
        let value = serde_json::from_slice::<serde_json::Value>(bytes)
            .unwrap_or(serde_json::Value::Null);
        Self::verify_value(&value, source)
    }

    /// Verifies an in-memory typed receipt (for example after tampering).
    pub fn verify_receipt(
        receipt: &Receipt,
        source: impl Into<String>,
    ) -> Result<VerificationReport, ReceiptError> {
        let value = serde_json::to_value(receipt)?;
        Ok(Self::verify_value(&value, source))
    }

    pub fn verify_value(
        value: &serde_json::Value,
        source: impl Into<String>,
    ) -> VerificationReport {
        let raw = raw_events(value);
        let reconstruction = raw.as_ref().ok().map(|events| reconstruct(events));

        let mut report = VerificationReport {
            source: source.into(),
            model_id: value
                .get("model_id")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string(),
            event_count: raw.as_ref().map(Vec::len).unwrap_or(0),
            content_deltas: reconstruction.as_ref().map(|r| r.deltas).unwrap_or(0),
            content_chars: reconstruction
                .as_ref()
                .map(|r| r.text.chars().count())
                .unwrap_or(0),
            usage: value
                .get("usage")
                .and_then(|u| serde_json::from_value(u.clone()).ok()),
            checks: Vec::with_capacity(5),
        };

        report.checks.push(check_events_hash(value, &raw));
        report.checks.push(check_payload_hash(value));
        report.checks.push(check_event_parsing(&raw, reconstruction.as_ref()));
        report.checks.push(check_content(value, &raw, reconstruction.as_ref()));
        report.checks.push(check_usage(value));
        report
    }
}

/// Rebuilds response text from raw event bodies, in order.
pub fn reconstruct_text<S: AsRef<str>>(raw_events: &[S]) -> String {
    let events: Vec<&str> = raw_events.iter().map(|s| s.as_ref()).collect();
    reconstruct(&events).text
}

struct Reconstruction {
    text: String,
    deltas: usize,
    malformed: usize,
    records: usize,
}

fn reconstruct(raw_events: &[&str]) -> Reconstruction {
    let mut out = Reconstruction {
        text: String::new(),
        deltas: 0,
        malformed: 0,
        records: 0,
    };
    for raw in raw_events {
        if raw.trim() == DONE_SENTINEL {
            continue;
        }
        out.records += 1;
        let event = parse_event(raw);
        match &event.kind {
            EventKind::Delta(payload) => {
                if !payload.content.is_empty() {
                    out.deltas += 1;
                }
                out.text.push_str(&payload.content);
            }
            EventKind::Error(_) if event.is_malformed() => out.malformed += 1,
            EventKind::Error(_) | EventKind::Done => {}
        }
    }
    out
}

fn raw_events(value: &serde_json::Value) -> Result<Vec<&str>, String> {
    let Some(field) = value.get("raw_events") else {
        return Err("raw_events missing from receipt".into());
    };
    let Some(items) = field.as_array() else {
        return Err("raw_events is not an array".into());
    };
    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            item.as_str()
                .ok_or_else(|| format!("raw_events[{i}] is not a string"))
        })
        .collect()
}

fn short(hash: &str) -> &str {
    hash.get(..16).unwrap_or(hash)
}

fn check_events_hash(value: &serde_json::Value, raw: &Result<Vec<&str>, String>) -> CheckResult {
    let Some(stored) = value.get("events_hash").and_then(|v| v.as_str()) else {
        return CheckResult::fail(CHECK_EVENTS_HASH, "field missing in receipt");
    };
    let events = match raw {
        Ok(events) => events,
        Err(detail) => return CheckResult::fail(CHECK_EVENTS_HASH, detail.clone()),
    };
    let derived = events_hash(events);
    if derived == stored {
        CheckResult::pass(CHECK_EVENTS_HASH, format!("sha256 matches ({}…)", short(stored)))
    } else {
        CheckResult::fail(
            CHECK_EVENTS_HASH,
            format!(
                "mismatch: stored {}… recomputed {}…",
                short(stored),
                short(&derived)
            ),
        )
    }
}

fn check_payload_hash(value: &serde_json::Value) -> CheckResult {
    let Some(stored) = value.get("payload_hash").and_then(|v| v.as_str()) else {
        return CheckResult::fail(CHECK_PAYLOAD_HASH, "field missing in receipt");
    };
    if !is_sha256_hex(stored) {
        return CheckResult::fail(CHECK_PAYLOAD_HASH, format!("malformed hash value: {stored:?}"));
    }
    let Some(payload) = value.get("prompt_payload").filter(|p| !p.is_null()) else {
        return CheckResult::pass(
            CHECK_PAYLOAD_HASH,
            format!("present and well-formed ({}…)", short(stored)),
        );
    };
    match payload_hash(payload) {
        Ok(derived) if derived == stored => CheckResult::pass(
            CHECK_PAYLOAD_HASH,
            format!("matches prompt_payload ({}…)", short(stored)),
        ),
        Ok(derived) => CheckResult::fail(
            CHECK_PAYLOAD_HASH,
            format!(
                "mismatch: stored {}… recomputed {}…",
                short(stored),
                short(&derived)
            ),
        ),
        Err(e) => CheckResult::fail(
            CHECK_PAYLOAD_HASH,
            format!("cannot serialize prompt_payload: {e}"),
        ),
    }
}

fn check_event_parsing(
    raw: &Result<Vec<&str>, String>,
    reconstruction: Option<&Reconstruction>,
) -> CheckResult {
    let (events, rec) = match (raw, reconstruction) {
        (Ok(events), Some(rec)) => (events, rec),
        (Err(detail), _) => return CheckResult::fail(CHECK_EVENT_PARSING, detail.clone()),
        (Ok(_), None) => return CheckResult::fail(CHECK_EVENT_PARSING, "raw_events unavailable"),
    };
    if rec.malformed == 0 {
        CheckResult::pass(
            CHECK_EVENT_PARSING,
            format!("{} / {} records valid", rec.records, events.len()),
        )
    } else {
        CheckResult::fail(
            CHECK_EVENT_PARSING,
            format!(
                "{} parse error(s) out of {} events",
                rec.malformed,
                events.len()
            ),
        )
    }
}

fn check_content(
    value: &serde_json::Value,
    raw: &Result<Vec<&str>, String>,
    reconstruction: Option<&Reconstruction>,
) -> CheckResult {
    let rec = match (raw, reconstruction) {
        (Ok(_), Some(rec)) => rec,
        (Err(detail), _) => return CheckResult::fail(CHECK_CONTENT, detail.clone()),
        (Ok(_), None) => return CheckResult::fail(CHECK_CONTENT, "raw_events unavailable"),
    };
    if rec.text.is_empty() {
        return CheckResult::fail(CHECK_CONTENT, "no content tokens found in events");
    }
    match value.get("content_hash") {
        None | Some(serde_json::Value::Null) => {}
        Some(serde_json::Value::String(declared)) => {
            let derived = sha256_hex(rec.text.as_bytes());
            if &derived != declared {
                return CheckResult::fail(
                    CHECK_CONTENT,
                    format!(
                        "reconstructed content does not match content_hash (stored {}… recomputed {}…)",
                        short(declared),
                        short(&derived)
                    ),
                );
            }
        }
        Some(_) => return CheckResult::fail(CHECK_CONTENT, "content_hash is not a string"),
    }
    CheckResult::pass(
        CHECK_CONTENT,
        format!(
            "{} deltas, {} chars reconstructed",
            rec.deltas,
            rec.text.chars().count()
        ),
    )
}

fn check_usage(value: &serde_json::Value) -> CheckResult {
    let Some(raw_usage) = value.get("usage").filter(|u| !u.is_null()) else {
        return CheckResult::fail(CHECK_USAGE, "no usage block in receipt");
    };
    let usage: Usage = match serde_json::from_value(raw_usage.clone()) {
        Ok(usage) => usage,
        Err(e) => return CheckResult::fail(CHECK_USAGE, format!("malformed usage block: {e}")),
    };
    match (usage.prompt_tokens, usage.completion_tokens) {
        (Some(prompt), Some(completion)) => CheckResult::pass(
            CHECK_USAGE,
            format!("{prompt} prompt + {completion} completion tokens"),
        ),
        _ => CheckResult::fail(CHECK_USAGE, "token counts missing from usage block"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::ResponseAccumulator;
    use crate::receipt::ReceiptBuilder;
    use crate::sse::parse_event;

    fn receipt_for(bodies: &[&str]) -> Receipt {
        let events: Vec<_> = bodies.iter().map(|b| parse_event(b)).collect();
        let mut acc = ResponseAccumulator::start();
        for event in &events {
            acc.apply(event);
        }
        ReceiptBuilder::new("test-model", serde_json::json!({"model":"test-model","stream":true}))
            .build(&acc.finish(), &events)
            .expect("receipt")
    }

    fn good_receipt() -> Receipt {
        receipt_for(&[
            r#"{"choices":[{"delta":{"content":"Hello"}}]}"#,
            r#"{"choices":[{"delta":{"content":" there"}}],"usage":{"prompt_tokens":4,"completion_tokens":2}}"#,
            "[DONE]",
        ])
    }

    fn to_value(receipt: &Receipt) -> serde_json::Value {
        serde_json::to_value(receipt).expect("value")
    }

    #[test]
    fn fresh_receipt_is_accepted_with_five_passing_checks() {
        let report = ReceiptVerifier::verify_receipt(&good_receipt(), "mem").expect("report");
        assert_eq!(report.verdict(), Verdict::Accepted);
        assert_eq!(report.checks.len(), 5);
        assert_eq!(
            report.checks.iter().map(|c| c.name).collect::<Vec<_>>(),
            vec![
                CHECK_EVENTS_HASH,
                CHECK_PAYLOAD_HASH,
                CHECK_EVENT_PARSING,
                CHECK_CONTENT,
                CHECK_USAGE
            ]
        );
        assert_eq!(report.content_chars, "Hello there".len());
    }

    #[test]
    fn missing_usage_fails_only_usage_check() {
        let mut value = to_value(&good_receipt());
        value.as_object_mut().expect("object").remove("usage");
        let report = ReceiptVerifier::verify_value(&value, "mem");
        assert_eq!(report.verdict(), Verdict::Rejected);
        let failed: Vec<_> = report.failed_checks().iter().map(|c| c.name).collect();
        assert_eq!(failed, vec![CHECK_USAGE]);
    }

    #[test]
    fn zero_delta_receipt_fails_content_check() {
        let receipt = receipt_for(&[
            r#"{"choices":[],"usage":{"prompt_tokens":4,"completion_tokens":0}}"#,
            "[DONE]",
        ]);
        let report = ReceiptVerifier::verify_receipt(&receipt, "mem").expect("report");
        let failed: Vec<_> = report.failed_checks().iter().map(|c| c.name).collect();
        assert_eq!(failed, vec![CHECK_CONTENT]);
    }

    #[test]
    fn edited_raw_event_fails_events_hash_and_content() {
        let mut receipt = good_receipt();
        receipt.raw_events[0] = r#"{"choices":[{"delta":{"content":"Howdy"}}]}"#.into();
        let report = ReceiptVerifier::verify_receipt(&receipt, "mem").expect("report");
        assert_eq!(report.verdict(), Verdict::Rejected);
        assert!(!report.check(CHECK_EVENTS_HASH).expect("check").passed());
        assert!(!report.check(CHECK_CONTENT).expect("check").passed());
        assert!(report.check(CHECK_EVENT_PARSING).expect("check").passed());
    }

    #[test]
    fn corrupt_entry_fails_event_parsing() {
        let mut receipt = good_receipt();
        receipt.raw_events[1].push('}');
        let report = ReceiptVerifier::verify_receipt(&receipt, "mem").expect("report");
        let parsing = report.check(CHECK_EVENT_PARSING).expect("check");
        assert!(!parsing.passed());
        assert!(parsing.detail.contains("1 parse error"));
    }

    #[test]
    fn payload_hash_must_be_well_formed_and_match_payload() {
        let mut value = to_value(&good_receipt());
        value["payload_hash"] = serde_json::json!("ABC");
        let report = ReceiptVerifier::verify_value(&value, "mem");
        assert!(!report.check(CHECK_PAYLOAD_HASH).expect("check").passed());

        let mut value = to_value(&good_receipt());
        value["prompt_payload"]["stream"] = serde_json::json!(false);
        let report = ReceiptVerifier::verify_value(&value, "mem");
        let check = report.check(CHECK_PAYLOAD_HASH).expect("check");
        assert!(!check.passed());
        assert!(check.detail.contains("mismatch"));

        let mut value = to_value(&good_receipt());
        value.as_object_mut().expect("object").remove("prompt_payload");
        let report = ReceiptVerifier::verify_value(&value, "mem");
        assert!(report.check(CHECK_PAYLOAD_HASH).expect("check").passed());
    }

    #[test]
    fn non_json_bytes_fail_every_check() {
        let report = ReceiptVerifier::verify_bytes(b"not json at all", "garbage");
        assert_eq!(report.failed_checks().len(), 5);
        assert_eq!(report.model_id, "unknown");
    }

    #[test]
    fn reconstruction_matches_live_text() {
        let receipt = good_receipt();
        assert_eq!(reconstruct_text(&receipt.raw_events), "Hello there");
    }

    #[test]
    fn rejected_report_lists_failed_checks() {
        let mut value = to_value(&good_receipt());
        value.as_object_mut().expect("object").remove("usage");
        let rendered = ReceiptVerifier::verify_value(&value, "mem").to_string();
        assert!(rendered.contains("REJECTED"));
        assert!(rendered.contains("reason: usage"));
    }
}
