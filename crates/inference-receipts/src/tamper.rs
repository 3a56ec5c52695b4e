//! Deliberate post-save mutation of receipts.
//!
//! Every mutation touches `raw_events` only. The stored hashes are left as
//! they were, so verification of the result must reject it.

use std::path::Path;

use tracing::info;

use crate::errors::TamperError;
use crate::receipt::Receipt;
use crate::sse::parse_event;

/// Fragment injected by `TamperSimulator::inject_midpoint`.
pub const INJECTED_FRAGMENT: &str = " [INJECTED_TOKEN]";

/// The single mutation to perform.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Tamper {
    /// Rewrite the content fragment of the delta at `index`.
    ReplaceFragment { index: usize, content: String },
    /// Replace the raw body at `index` wholesale.
    ReplaceRaw { index: usize, raw: String },
    /// Insert a fabricated delta at the midpoint of the event log.
    InjectFragment { content: String },
}

pub struct TamperSimulator {
    tamper: Tamper,
}

impl TamperSimulator {
    pub fn new(tamper: Tamper) -> Self {
        Self { tamper }
    }

    pub fn inject_midpoint() -> Self {
        Self::new(Tamper::InjectFragment {
            content: INJECTED_FRAGMENT.to_string(),
        })
    }

    pub fn replace_fragment(index: usize, content: impl Into<String>) -> Self {
        Self::new(Tamper::ReplaceFragment {
            index,
            content: content.into(),
        })
    }

    /// Returns a mutated copy of `receipt`.
    pub fn apply(&self, receipt: &Receipt) -> Result<Receipt, TamperError> {
        let mut tampered = receipt.clone();
        let len = tampered.raw_events.len();
        match &self.tamper {
            Tamper::ReplaceFragment { index, content } => {
                let raw = tampered
                    .raw_events
                    .get_mut(*index)
                    .ok_or(TamperError::IndexOutOfRange { index: *index, len })?;
                *raw = rewrite_fragment(raw, content)
                    .ok_or(TamperError::NotADelta { index: *index })?;
            }
            Tamper::ReplaceRaw { index, raw } => {
                let slot = tampered
                    .raw_events
                    .get_mut(*index)
                    .ok_or(TamperError::IndexOutOfRange { index: *index, len })?;
                *slot = raw.clone();
            }
            Tamper::InjectFragment { content } => {
                let fake = serde_json::json!({
                    "choices": [{"delta": {"content": content}, "finish_reason": null}]
                });
                tampered.raw_events.insert(len / 2, fake.to_string());
            }
        }
        Ok(tampered)
    }

    /// Loads the receipt at `path`, mutates it and writes it back in place.
    pub fn apply_to_file(&self, path: impl AsRef<Path>) -> Result<Receipt, TamperError> {
        let path = path.as_ref();
        let receipt = Receipt::load(path)?;
        let tampered = self.apply(&receipt)?;
        tampered.write_to(path)?;
        info!(path = %path.display(), tamper = ?self.tamper, "receipt rewritten without rehashing");
        Ok(tampered)
    }
}

/// Sets the first content fragment in `raw` to `content`.
fn rewrite_fragment(raw: &str, content: &str) -> Option<String> {
    if !parse_event(raw).is_delta() {
        return None;
    }
    let mut value: serde_json::Value = serde_json::from_str(raw).ok()?;
    let choices = value.get_mut("choices")?.as_array_mut()?;
    let slot = choices.iter_mut().find_map(|choice| {
        choice
            .get_mut("delta")
            .and_then(|delta| delta.get_mut("content"))
            .filter(|c| c.is_string())
    })?;
    *slot = serde_json::Value::String(content.to_string());
    Some(value.to_string())
}
