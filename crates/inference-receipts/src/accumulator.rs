use std::time::{Duration, Instant};

use tracing::debug;

use crate::event::{EventKind, StreamEvent, Usage};

/// How an accumulation was finalized.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum EndState {
    /// Terminal `[DONE]` sentinel observed.
    Completed,
    /// Byte stream closed without a sentinel.
    Closed,
    /// An error record ended the stream.
    Aborted { message: String },
}

impl EndState {
    pub fn is_abnormal(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Closed => "closed",
            Self::Aborted { .. } => "aborted",
        }
    }
}

/// Response state built up from a single stream.
#[derive(Clone, Debug)]
pub struct AccumulatedResponse {
    /// In-order concatenation of every delta's content fragment.
    pub text: String,
    /// In-order concatenation of reasoning fragments.
    pub reasoning: String,
    pub usage: Usage,
    pub started_at: Instant,
    pub first_byte_at: Option<Instant>,
    pub completed_at: Option<Instant>,
    /// Number of delta events applied.
    pub event_count: usize,
    /// Gaps between events longer than the stall threshold, after the first delta.
    pub stall_count: u32,
    /// Malformed records skipped without finalizing.
    pub malformed_events: usize,
    pub finish_reason: Option<String>,
    pub end: Option<EndState>,
}

impl AccumulatedResponse {
    fn new(started_at: Instant) -> Self {
        Self {
            text: String::new(),
            reasoning: String::new(),
            usage: Usage::default(),
            started_at,
            first_byte_at: None,
            completed_at: None,
            event_count: 0,
            stall_count: 0,
            malformed_events: 0,
            finish_reason: None,
            end: None,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.end.is_some()
    }

    /// Time to first delta.
    pub fn ttfb(&self) -> Option<Duration> {
        self.first_byte_at
            .map(|at| at.saturating_duration_since(self.started_at))
    }

    /// Time to completion.
    pub fn ttc(&self) -> Option<Duration> {
        self.completed_at
            .map(|at| at.saturating_duration_since(self.started_at))
    }

    pub fn ttfb_ms(&self) -> Option<f64> {
        self.ttfb().map(duration_ms)
    }

    pub fn ttc_ms(&self) -> Option<f64> {
        self.ttc().map(duration_ms)
    }

    pub fn ended_abnormally(&self) -> bool {
        self.end.as_ref().is_some_and(EndState::is_abnormal)
    }
}

pub(crate) fn duration_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Folds stream events, in arrival order, into an `AccumulatedResponse`.
///
/// The `*_at` variants take the observation time explicitly; the plain
/// variants read the monotonic clock.
pub struct ResponseAccumulator {
    response: AccumulatedResponse,
    stall_threshold: Option<Duration>,
    last_event_at: Option<Instant>,
}

impl ResponseAccumulator {
    /// Starts accumulating now.
    pub fn start() -> Self {
        Self::start_at(Instant::now())
    }

    pub fn start_at(started_at: Instant) -> Self {
        Self {
            response: AccumulatedResponse::new(started_at),
            stall_threshold: None,
            last_event_at: None,
        }
    }

    /// Enables stall counting for gaps longer than `threshold`.
    pub fn with_stall_threshold(mut self, threshold: Duration) -> Self {
        self.stall_threshold = Some(threshold);
        self
    }

    /// Current (possibly unfinished) state.
    pub fn response(&self) -> &AccumulatedResponse {
        &self.response
    }

    pub fn is_finalized(&self) -> bool {
        self.response.is_finalized()
    }

    pub fn apply(&mut self, event: &StreamEvent) {
        self.apply_at(event, Instant::now());
    }

    pub fn apply_at(&mut self, event: &StreamEvent, now: Instant) {
        if self.response.is_finalized() {
            debug!("ignoring event received after finalization");
            return;
        }
        self.observe_gap(now);
        match &event.kind {
            EventKind::Delta(payload) => {
                if self.response.first_byte_at.is_none() {
                    self.response.first_byte_at = Some(now);
                }
                self.response.text.push_str(&payload.content);
                self.response.reasoning.push_str(&payload.reasoning);
                if let Some(usage) = &payload.usage {
                    self.response.usage.merge_latest(usage);
                }
                if payload.finish_reason.is_some() {
                    self.response.finish_reason = payload.finish_reason.clone();
                }
                self.response.event_count += 1;
            }
            EventKind::Done => self.finalize(EndState::Completed, now),
            EventKind::Error(err) => self.finalize(
                EndState::Aborted {
                    message: err.to_string(),
                },
                now,
            ),
        }
    }

    /// Records a malformed event the consumer chose to skip.
    pub fn note_malformed(&mut self) {
        self.note_malformed_at(Instant::now());
    }

    pub fn note_malformed_at(&mut self, now: Instant) {
        if self.response.is_finalized() {
            return;
        }
        self.observe_gap(now);
        self.response.malformed_events += 1;
    }

    /// Marks the stream as closed; no-op when already finalized.
    pub fn close(&mut self) {
        self.close_at(Instant::now());
    }

    pub fn close_at(&mut self, now: Instant) {
        if !self.response.is_finalized() {
            self.finalize(EndState::Closed, now);
        }
    }

    /// Finalizes (as closed, if still open) and returns the response.
    pub fn finish(mut self) -> AccumulatedResponse {
        self.close();
        self.response
    }

    fn observe_gap(&mut self, now: Instant) {
        if let (Some(threshold), Some(last)) = (self.stall_threshold, self.last_event_at)
            && self.response.first_byte_at.is_some()
            && now.saturating_duration_since(last) > threshold
        {
            self.response.stall_count += 1;
        }
        self.last_event_at = Some(now);
    }

    fn finalize(&mut self, end: EndState, now: Instant) {
        self.response.completed_at = Some(now);
        self.response.end = Some(end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sse::parse_event;

    fn delta(content: &str) -> StreamEvent {
        parse_event(&serde_json::json!({"choices":[{"delta":{"content":content}}]}).to_string())
    }

    #[test]
    fn concatenates_fragments_in_arrival_order() {
        let mut acc = ResponseAccumulator::start();
        for fragment in ["Hello", ", ", "world."] {
            acc.apply(&delta(fragment));
        }
        acc.apply(&parse_event("[DONE]"));
        let response = acc.finish();
        assert_eq!(response.text, "Hello, world.");
        assert_eq!(response.event_count, 3);
        assert_eq!(response.end, Some(EndState::Completed));
    }

    #[test]
    fn first_byte_is_stamped_once() {
        let t0 = Instant::now();
        let mut acc = ResponseAccumulator::start_at(t0);
        acc.apply_at(&delta("a"), t0 + Duration::from_millis(40));
        acc.apply_at(&delta("b"), t0 + Duration::from_millis(90));
        acc.close_at(t0 + Duration::from_millis(120));
        let response = acc.finish();
        assert_eq!(response.ttfb(), Some(Duration::from_millis(40)));
        assert_eq!(response.ttc(), Some(Duration::from_millis(120)));
        assert_eq!(response.end, Some(EndState::Closed));
    }

    #[test]
    fn latest_non_null_usage_wins() {
        let mut acc = ResponseAccumulator::start();
        acc.apply(&parse_event(
            r#"{"choices":[],"usage":{"prompt_tokens":5,"completion_tokens":1}}"#,
        ));
        acc.apply(&parse_event(
            r#"{"choices":[],"usage":{"prompt_tokens":null,"completion_tokens":7}}"#,
        ));
        assert_eq!(acc.response().usage, Usage::new(5, 7));
    }

    #[test]
    fn error_event_finalizes_with_partial_text() {
        let mut acc = ResponseAccumulator::start();
        acc.apply(&delta("partial"));
        acc.apply(&parse_event("{oops"));
        acc.apply(&delta(" ignored"));
        let response = acc.finish();
        assert_eq!(response.text, "partial");
        assert!(response.ended_abnormally());
        assert!(response.completed_at.is_some());
    }

    #[test]
    fn skipped_malformed_events_do_not_finalize() {
        let mut acc = ResponseAccumulator::start();
        acc.apply(&delta("a"));
        acc.note_malformed();
        acc.apply(&delta("b"));
        let response = acc.finish();
        assert_eq!(response.text, "ab");
        assert_eq!(response.malformed_events, 1);
        assert_eq!(response.end, Some(EndState::Closed));
    }

    #[test]
    fn stalls_count_only_after_first_delta() {
        let t0 = Instant::now();
        let mut acc =
            ResponseAccumulator::start_at(t0).with_stall_threshold(Duration::from_millis(100));
        acc.apply_at(&delta("a"), t0 + Duration::from_millis(500));
        acc.apply_at(&delta("b"), t0 + Duration::from_millis(550));
        acc.apply_at(&delta("c"), t0 + Duration::from_millis(800));
        acc.apply_at(&parse_event("[DONE]"), t0 + Duration::from_millis(820));
        assert_eq!(acc.finish().stall_count, 1);
    }

    #[test]
    fn zero_delta_stream_has_no_first_byte() {
        let mut acc = ResponseAccumulator::start();
        acc.apply(&parse_event("[DONE]"));
        let response = acc.finish();
        assert!(response.text.is_empty());
        assert!(response.ttfb().is_none());
        assert!(response.ttc().is_some());
    }
}
