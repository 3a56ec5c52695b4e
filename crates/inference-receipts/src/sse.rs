use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use futures::StreamExt as _;
use tracing::{debug, warn};

use crate::errors::StreamError;
use crate::event::{DeltaPayload, EventError, EventKind, StreamEvent, Usage};

/// Terminal sentinel sent by OpenAI-compatible providers.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Chunked response body as delivered by a `Transport`.
pub type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, StreamError>> + Send + 'static>>;

/// One SSE record: optional `event:` tag plus the joined `data:` lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
    /// Set when the record bytes were not valid UTF-8; `data` then holds a
    /// lossy rendering fit only for diagnostics.
    pub invalid_utf8: bool,
}

/// Incremental SSE frame splitter.
///
/// Bytes may arrive split at any position, including inside a UTF-8
/// sequence; frames are only decoded once their blank-line delimiter is seen.
#[derive(Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some((idx, delim_len)) = find_frame_delimiter(&self.buf) {
            let frame_bytes = self.buf[..idx].to_vec();
            self.buf.drain(..idx + delim_len);
            if let Some(frame) = parse_sse_frame(&frame_bytes) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flushes a trailing frame left without its delimiter when the stream closed.
    pub fn finish(&mut self) -> Option<SseFrame> {
        let rest = std::mem::take(&mut self.buf);
        parse_sse_frame(&rest)
    }
}

fn find_frame_delimiter(buf: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i + 1 < buf.len() {
        if buf[i] == b'\n' && buf[i + 1] == b'\n' {
            return Some((i, 2));
        }
        if i + 3 < buf.len()
            && buf[i] == b'\r'
            && buf[i + 1] == b'\n'
            && buf[i + 2] == b'\r'
            && buf[i + 3] == b'\n'
        {
            return Some((i, 4));
        }
        i += 1;
    }
    None
}

fn parse_sse_frame(bytes: &[u8]) -> Option<SseFrame> {
    if bytes.is_empty() {
        return None;
    }
    let invalid_utf8 = std::str::from_utf8(bytes).is_err();
    let text = String::from_utf8_lossy(bytes);
    let mut event: Option<String> = None;
    let mut data_lines: Vec<&str> = Vec::new();
    for raw_line in text.split('\n') {
        let line = raw_line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim_start().to_string());
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            // The SSE grammar drops exactly one leading space; the rest is payload.
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if data_lines.is_empty() {
        return None;
    }
    Some(SseFrame {
        event,
        data: data_lines.join("\n"),
        invalid_utf8,
    })
}

#[derive(serde::Deserialize)]
struct ChunkBody {
    #[serde(default)]
    choices: Option<Vec<ChunkChoice>>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(serde::Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(serde::Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

/// Classifies one record body. Total: every input maps to an event.
pub fn parse_event(body: &str) -> StreamEvent {
    let kind = classify_body(body);
    StreamEvent {
        kind,
        raw_text: body.to_string(),
    }
}

fn classify_body(body: &str) -> EventKind {
    if body.trim() == DONE_SENTINEL {
        return EventKind::Done;
    }
    let value: serde_json::Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(e) => {
            return EventKind::Error(EventError::Malformed {
                message: format!("invalid JSON: {e}"),
            });
        }
    };
    if !value.is_object() {
        return EventKind::Error(EventError::Malformed {
            message: "chunk is not a JSON object".into(),
        });
    }
    let chunk: ChunkBody = match serde_json::from_value(value) {
        Ok(chunk) => chunk,
        Err(e) => {
            return EventKind::Error(EventError::Malformed {
                message: format!("chunk does not match schema: {e}"),
            });
        }
    };
    if let Some(error) = chunk.error.filter(|e| !e.is_null()) {
        let message = error
            .get("message")
            .and_then(|v| v.as_str())
            .or_else(|| error.as_str())
            .unwrap_or("provider stream error")
            .to_string();
        return EventKind::Error(EventError::Provider { message });
    }

    let mut payload = DeltaPayload {
        usage: chunk.usage,
        ..DeltaPayload::default()
    };
    for choice in chunk.choices.unwrap_or_default() {
        if let Some(delta) = choice.delta {
            if let Some(content) = delta.content {
                payload.content.push_str(&content);
            }
            if let Some(reasoning) = delta.reasoning_content {
                payload.reasoning.push_str(&reasoning);
            }
        }
        if choice.finish_reason.is_some() {
            payload.finish_reason = choice.finish_reason;
        }
    }
    EventKind::Delta(payload)
}

/// Lazy, ordered, non-restartable reader turning a byte stream into events.
///
/// Yields `Ok(event)` for every record (including malformed ones), stops
/// after `[DONE]` or when the byte stream closes, and yields a single
/// `Err` followed by `None` on transport failure or idle timeout.
pub struct EventStreamReader {
    bytes: ByteStream,
    decoder: SseDecoder,
    pending: VecDeque<StreamEvent>,
    idle_timeout: Option<Duration>,
    closed: bool,
    finished: bool,
}

impl EventStreamReader {
    pub fn new(bytes: ByteStream, idle_timeout: Option<Duration>) -> Self {
        Self {
            bytes,
            decoder: SseDecoder::default(),
            pending: VecDeque::new(),
            idle_timeout,
            closed: false,
            finished: false,
        }
    }

    /// Waits for the next event. Returns `None` once the sequence has ended.
    pub async fn next_event(&mut self) -> Option<Result<StreamEvent, StreamError>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                if event.is_done() {
                    self.finish_sequence();
                }
                return Some(Ok(event));
            }
            if self.finished || self.closed {
                return None;
            }

            match self.read_chunk().await {
                Ok(Some(chunk)) => {
                    for frame in self.decoder.push_chunk(&chunk) {
                        self.queue_frame(frame);
                    }
                }
                Ok(None) => {
                    self.closed = true;
                    if let Some(frame) = self.decoder.finish() {
                        self.queue_frame(frame);
                    }
                }
                Err(err) => {
                    warn!(error = %err, "event stream terminated by transport failure");
                    self.finish_sequence();
                    return Some(Err(err));
                }
            }
        }
    }

    /// Adapts the reader into a `futures::Stream`.
    pub fn into_stream(
        self,
    ) -> impl futures::Stream<Item = Result<StreamEvent, StreamError>> + Send {
        futures::stream::unfold(self, |mut reader| async move {
            reader.next_event().await.map(|item| (item, reader))
        })
    }

    async fn read_chunk(&mut self) -> Result<Option<bytes::Bytes>, StreamError> {
        let next = match self.idle_timeout {
            Some(idle) => tokio::time::timeout(idle, self.bytes.next())
                .await
                .map_err(|_| StreamError::IdleTimeout { idle })?,
            None => self.bytes.next().await,
        };
        next.transpose()
    }

    fn queue_frame(&mut self, frame: SseFrame) {
        let event = if frame.invalid_utf8 {
            StreamEvent {
                kind: EventKind::Error(EventError::Malformed {
                    message: "record is not valid UTF-8".into(),
                }),
                raw_text: frame.data,
            }
        } else {
            parse_event(&frame.data)
        };
        if let EventKind::Error(err) = &event.kind {
            debug!(error = %err, tag = ?frame.event, "stream record did not parse as a delta");
        }
        self.pending.push_back(event);
    }

    fn finish_sequence(&mut self) {
        self.finished = true;
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt as _;

    fn byte_stream(chunks: Vec<Result<&'static str, StreamError>>) -> ByteStream {
        Box::pin(futures::stream::iter(
            chunks
                .into_iter()
                .map(|c| c.map(|s| bytes::Bytes::from_static(s.as_bytes()))),
        ))
    }

    async fn drain(mut reader: EventStreamReader) -> Vec<Result<StreamEvent, StreamError>> {
        let mut out = Vec::new();
        while let Some(item) = reader.next_event().await {
            out.push(item);
        }
        out
    }

    #[test]
    fn sse_decoder_handles_partial_chunk_boundaries() {
        let mut decoder = SseDecoder::default();
        let part1 = b"event: message\ndata: {\"choices\":[{\"delta\":{\"content\":\"hel";
        let part2 = b"lo\"}}]}\n\n";
        assert!(decoder.push_chunk(part1).is_empty());
        let frames = decoder.push_chunk(part2);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("message"));
        assert_eq!(frames[0].data, r#"{"choices":[{"delta":{"content":"hello"}}]}"#);
    }

    #[test]
    fn decoder_skips_comments_and_keeps_crlf_frames() {
        let mut decoder = SseDecoder::default();
        let frames = decoder.push_chunk(b": keep-alive\r\n\r\ndata: [DONE]\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "[DONE]");
    }

    #[test]
    fn data_keeps_payload_whitespace_beyond_the_first_space() {
        let mut decoder = SseDecoder::default();
        let frames = decoder.push_chunk(b"data:  {\"a\":1}\n\n");
        assert_eq!(frames[0].data, " {\"a\":1}");
    }

    #[test]
    fn parse_event_classifies_delta_done_and_errors() {
        let delta = parse_event(
            r#"{"choices":[{"delta":{"content":"Hi","reasoning_content":"hmm"},"finish_reason":null}]}"#,
        );
        let EventKind::Delta(payload) = &delta.kind else {
            panic!("expected delta, got {delta:?}");
        };
        assert_eq!(payload.content, "Hi");
        assert_eq!(payload.reasoning, "hmm");

        assert!(parse_event(" [DONE] ").is_done());
        assert!(parse_event("{not json").is_malformed());
        assert!(parse_event("[1,2]").is_malformed());
        assert!(parse_event(r#"{"choices":"nope"}"#).is_malformed());

        let provider = parse_event(r#"{"error":{"message":"rate limited"}}"#);
        assert_eq!(
            provider.kind,
            EventKind::Error(EventError::Provider {
                message: "rate limited".into()
            })
        );
    }

    #[test]
    fn usage_only_chunk_is_a_delta_with_empty_content() {
        let event = parse_event(
            r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":4}}"#,
        );
        let EventKind::Delta(payload) = event.kind else {
            panic!("expected delta");
        };
        assert!(payload.content.is_empty());
        assert_eq!(payload.usage, Some(Usage::new(10, 4)));
    }

    #[test]
    fn raw_text_is_preserved_verbatim() {
        let body = r#"{ "choices" : [ { "delta" : { "content" : "x" } } ] }"#;
        assert_eq!(parse_event(body).raw_text, body);
    }

    #[tokio::test]
    async fn invalid_utf8_record_is_malformed_not_repaired() {
        let bytes: Vec<Result<bytes::Bytes, StreamError>> = vec![Ok(bytes::Bytes::from_static(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"\xff\"}}]}\n\ndata: [DONE]\n\n",
        ))];
        let reader = EventStreamReader::new(Box::pin(futures::stream::iter(bytes)), None);
        let events = drain(reader).await;
        assert_eq!(events.len(), 2);
        let bad = events[0].as_ref().expect("event");
        assert!(bad.is_malformed());
        assert!(matches!(
            &bad.kind,
            EventKind::Error(EventError::Malformed { message }) if message.contains("UTF-8")
        ));
        assert!(events[1].as_ref().expect("done").is_done());
    }

    #[tokio::test]
    async fn reader_stops_at_done_and_ignores_trailing_records() {
        let reader = EventStreamReader::new(
            byte_stream(vec![
                Ok("data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\ndata: [DO"),
                Ok("NE]\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n\n"),
            ]),
            None,
        );
        let events = drain(reader).await;
        assert_eq!(events.len(), 2);
        assert!(events[0].as_ref().expect("delta").is_delta());
        assert!(events[1].as_ref().expect("done").is_done());
    }

    #[tokio::test]
    async fn reader_surfaces_malformed_record_and_continues() {
        let reader = EventStreamReader::new(
            byte_stream(vec![Ok(
                "data: {broken\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n\n",
            )]),
            None,
        );
        let events = drain(reader).await;
        assert_eq!(events.len(), 2);
        assert!(events[0].as_ref().expect("malformed").is_malformed());
        assert_eq!(events[1].as_ref().expect("delta").content(), Some("ok"));
    }

    #[tokio::test]
    async fn reader_flushes_unterminated_frame_on_close() {
        let reader = EventStreamReader::new(
            byte_stream(vec![Ok("data: {\"choices\":[{\"delta\":{\"content\":\"tail\"}}]}")]),
            None,
        );
        let events = drain(reader).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].as_ref().expect("delta").content(), Some("tail"));
    }

    #[tokio::test]
    async fn transport_failure_ends_sequence_with_distinct_error() {
        let reader = EventStreamReader::new(
            byte_stream(vec![
                Ok("data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n"),
                Err(StreamError::transport("test", "connection reset")),
                Ok("data: [DONE]\n\n"),
            ]),
            None,
        );
        let events = drain(reader).await;
        assert_eq!(events.len(), 2);
        assert!(events[0].is_ok());
        assert!(matches!(events[1], Err(StreamError::Transport { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_stream_times_out_as_transport_failure() {
        let bytes: ByteStream = Box::pin(
            futures::stream::iter(vec![Ok::<_, StreamError>(bytes::Bytes::from_static(
                b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n",
            ))])
            .chain(futures::stream::pending()),
        );
        let mut reader = EventStreamReader::new(bytes, Some(Duration::from_secs(2)));
        assert!(reader.next_event().await.expect("first").is_ok());
        let err = reader.next_event().await.expect("timeout").expect_err("idle");
        assert!(matches!(err, StreamError::IdleTimeout { .. }));
        assert!(reader.next_event().await.is_none());
    }

    #[tokio::test]
    async fn into_stream_yields_same_sequence() {
        let reader = EventStreamReader::new(
            byte_stream(vec![Ok("data: {\"choices\":[]}\n\ndata: [DONE]\n\n")]),
            None,
        );
        let events: Vec<_> = reader.into_stream().collect().await;
        assert_eq!(events.len(), 2);
    }
}
