/// Token usage counters reported by the provider.
///
/// Either counter may be absent: providers only attach usage to the final
/// chunk, and some never report it at all.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: Option<u64>,
    #[serde(default)]
    pub completion_tokens: Option<u64>,
}

impl Usage {
    /// Creates usage with both counters set.
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens: Some(prompt_tokens),
            completion_tokens: Some(completion_tokens),
        }
    }

    /// Overwrites each counter with `latest` when `latest` carries a value.
    pub fn merge_latest(&mut self, latest: &Usage) {
        if latest.prompt_tokens.is_some() {
            self.prompt_tokens = latest.prompt_tokens;
        }
        if latest.completion_tokens.is_some() {
            self.completion_tokens = latest.completion_tokens;
        }
    }

    /// True when neither counter is present.
    pub fn is_empty(&self) -> bool {
        self.prompt_tokens.is_none() && self.completion_tokens.is_none()
    }
}

/// Parsed content of one chat-completion chunk.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeltaPayload {
    /// Concatenated `choices[*].delta.content` fragments of this chunk.
    pub content: String,
    /// Concatenated `choices[*].delta.reasoning_content` fragments.
    pub reasoning: String,
    pub usage: Option<Usage>,
    pub finish_reason: Option<String>,
}

/// Why an event could not be treated as content.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    /// Body was not JSON, or not a chunk-shaped JSON object.
    #[error("malformed event: {message}")]
    Malformed { message: String },
    /// Body was a well-formed error object sent by the provider mid-stream.
    #[error("provider reported error: {message}")]
    Provider { message: String },
}

/// Classification of a stream record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    Delta(DeltaPayload),
    Done,
    Error(EventError),
}

/// One parsed SSE record plus its body exactly as received.
///
/// `raw_text` is what receipts hash, so it is never re-serialized or
/// normalized after decoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamEvent {
    pub kind: EventKind,
    pub raw_text: String,
}

impl StreamEvent {
    pub fn is_delta(&self) -> bool {
        matches!(self.kind, EventKind::Delta(_))
    }

    pub fn is_done(&self) -> bool {
        matches!(self.kind, EventKind::Done)
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self.kind, EventKind::Error(EventError::Malformed { .. }))
    }

    /// Content fragment carried by a delta, if any.
    pub fn content(&self) -> Option<&str> {
        match &self.kind {
            EventKind::Delta(payload) => Some(payload.content.as_str()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_latest_keeps_previous_counter_when_new_one_is_null() {
        let mut usage = Usage::new(12, 3);
        usage.merge_latest(&Usage {
            prompt_tokens: None,
            completion_tokens: Some(40),
        });
        assert_eq!(usage, Usage::new(12, 40));
    }

    #[test]
    fn usage_deserializes_with_missing_and_null_counters() {
        let usage: Usage =
            serde_json::from_str(r#"{"prompt_tokens":null,"total_tokens":9}"#).expect("usage");
        assert!(usage.is_empty());
    }
}
