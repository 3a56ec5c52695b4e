use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::accumulator::{AccumulatedResponse, EndState, ResponseAccumulator};
use crate::config::{MalformedPolicy, ReceiptPolicy, RunOptions};
use crate::errors::{HarnessError, RunFailure};
use crate::event::{StreamEvent, Usage};
use crate::model::ProviderId;
use crate::receipt::{Receipt, ReceiptBuilder, ReceiptStore};
use crate::request::ChatRequest;
use crate::sse::EventStreamReader;
use crate::transport::Transport;

/// Handle used to request cancellation of a running stream.
#[derive(Clone)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

impl AbortHandle {
    /// Requests cancellation.
    ///
    /// Cancellation is best-effort and becomes visible as a terminal
    /// `RunEvent::Failed` with `RunFailure::Cancelled`. No receipt is written.
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }
}

/// Events emitted to the consumer of a `RunStream`.
#[derive(Clone, Debug, PartialEq)]
pub enum RunEvent {
    Started {
        run_id: uuid::Uuid,
        provider: ProviderId,
        model: String,
    },
    /// A content fragment, numbered from zero.
    Delta {
        run_id: uuid::Uuid,
        seq: u64,
        text: String,
    },
    Finished {
        run_id: uuid::Uuid,
        summary: RunSummary,
    },
    Failed {
        run_id: uuid::Uuid,
        error: RunFailure,
    },
}

impl RunEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished { .. } | Self::Failed { .. })
    }
}

/// Metrics of a finished stream, carried by `RunEvent::Finished`.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct RunSummary {
    pub end_state: EndState,
    pub ttfb_ms: Option<f64>,
    pub ttc_ms: Option<f64>,
    pub usage: Usage,
    pub delta_count: usize,
    pub stall_count: u32,
    pub malformed_events: usize,
    pub receipt_path: Option<PathBuf>,
}

impl RunSummary {
    fn new(response: &AccumulatedResponse, receipt_path: Option<PathBuf>) -> Self {
        Self {
            end_state: response.end.clone().unwrap_or(EndState::Closed),
            ttfb_ms: response.ttfb_ms(),
            ttc_ms: response.ttc_ms(),
            usage: response.usage,
            delta_count: response.event_count,
            stall_count: response.stall_count,
            malformed_events: response.malformed_events,
            receipt_path,
        }
    }
}

/// Final result of a run.
#[derive(Clone, Debug)]
pub struct RunOutcome {
    pub run_id: uuid::Uuid,
    pub response: AccumulatedResponse,
    /// Every record read from the stream, in order, including the sentinel.
    pub events: Vec<StreamEvent>,
    /// Request body sent to the provider.
    pub payload: serde_json::Value,
    pub receipt: Option<Receipt>,
    pub receipt_path: Option<PathBuf>,
}

impl RunOutcome {
    pub fn text(&self) -> &str {
        &self.response.text
    }
}

/// Starts isolated streaming runs over a shared transport.
#[derive(Clone)]
pub struct InferenceClient {
    transport: Arc<dyn Transport>,
}

impl InferenceClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub fn provider(&self) -> ProviderId {
        self.transport.provider()
    }

    /// Validates the request and spawns the run task.
    ///
    /// The returned `RunStream` yields `Started`, zero or more `Delta`
    /// events, then exactly one terminal `Finished` or `Failed` event.
    pub async fn start_stream(
        &self,
        request: ChatRequest,
        options: RunOptions,
    ) -> Result<RunStream, HarnessError> {
        request.validate()?;
        if options.stream_buffer_capacity == 0 {
            return Err(HarnessError::Validation(
                "stream_buffer_capacity must be greater than 0".into(),
            ));
        }

        let (tx, rx) = mpsc::channel(options.stream_buffer_capacity);
        let (final_tx, final_rx) = oneshot::channel();
        let (abort_tx, abort_rx) = watch::channel(false);

        let run_id = uuid::Uuid::new_v4();
        let provider = self.transport.provider();
        let model = request.model.clone();
        tokio::spawn(run_task(
            self.transport.clone(),
            RunContext {
                run_id,
                request,
                options,
            },
            tx,
            final_tx,
            abort_rx,
        ));

        Ok(RunStream {
            run_id,
            provider,
            model,
            rx,
            final_rx,
            abort_handle: AbortHandle { tx: abort_tx },
            saw_terminal: false,
        })
    }

    /// Runs to completion and returns the outcome.
    pub async fn collect(
        &self,
        request: ChatRequest,
        options: RunOptions,
    ) -> Result<RunOutcome, HarnessError> {
        self.start_stream(request, options).await?.finish().await
    }
}

/// Streaming handle returned by `InferenceClient::start_stream`.
pub struct RunStream {
    run_id: uuid::Uuid,
    provider: ProviderId,
    model: String,
    rx: mpsc::Receiver<RunEvent>,
    final_rx: oneshot::Receiver<Result<RunOutcome, HarnessError>>,
    abort_handle: AbortHandle,
    saw_terminal: bool,
}

impl RunStream {
    pub fn run_id(&self) -> uuid::Uuid {
        self.run_id
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort_handle.clone()
    }

    /// Waits for the next event. Returns `None` after the channel closes.
    pub async fn next_event(&mut self) -> Option<RunEvent> {
        let event = self.rx.recv().await;
        if event.as_ref().is_some_and(RunEvent::is_terminal) {
            self.saw_terminal = true;
        }
        event
    }

    /// Drains remaining events and returns the terminal result.
    ///
    /// Safe to call after consuming events with `next_event()`.
    pub async fn finish(mut self) -> Result<RunOutcome, HarnessError> {
        while !self.saw_terminal {
            match self.rx.recv().await {
                Some(event) if event.is_terminal() => self.saw_terminal = true,
                Some(_) => {}
                None => break,
            }
        }

        match self.final_rx.await {
            Ok(result) => result,
            Err(_) => Err(HarnessError::protocol_msg(format!(
                "run task ended without final result (provider={}, model={})",
                self.provider, self.model
            ))),
        }
    }
}

struct RunContext {
    run_id: uuid::Uuid,
    request: ChatRequest,
    options: RunOptions,
}

async fn run_task(
    transport: Arc<dyn Transport>,
    ctx: RunContext,
    tx: mpsc::Sender<RunEvent>,
    final_tx: oneshot::Sender<Result<RunOutcome, HarnessError>>,
    mut abort_rx: watch::Receiver<bool>,
) {
    let run_id = ctx.run_id;
    let provider = transport.provider();
    let model = ctx.request.model.clone();

    if !send_event(
        &tx,
        RunEvent::Started {
            run_id,
            provider: provider.clone(),
            model: model.clone(),
        },
    )
    .await
    {
        let _ = final_tx.send(Err(HarnessError::protocol_msg(
            "run stream receiver dropped before Started",
        )));
        return;
    }

    let payload = ctx.request.to_payload();
    let mut accumulator =
        ResponseAccumulator::start().with_stall_threshold(ctx.options.stall_threshold);
    let bytes = match transport.open(&payload).await {
        Ok(bytes) => bytes,
        Err(err) => {
            fail(&tx, final_tx, run_id, RunFailure::from_stream_error(&err)).await;
            return;
        }
    };
    let mut reader = EventStreamReader::new(bytes, ctx.options.idle_timeout);

    let mut events: Vec<StreamEvent> = Vec::new();
    let mut seq = 0_u64;
    // Cleared once every abort handle is gone; the idle timeout then bounds the run.
    let mut abortable = true;
    while !accumulator.is_finalized() {
        tokio::select! {
            changed = abort_rx.changed(), if abortable => {
                match changed {
                    Ok(()) if *abort_rx.borrow() => {
                        info!(run_id = %run_id, "run cancelled");
                        fail(&tx, final_tx, run_id, RunFailure::Cancelled).await;
                        return;
                    }
                    Ok(()) => {}
                    Err(_) => {
                        debug!(run_id = %run_id, "abort handles dropped");
                        abortable = false;
                    }
                }
            }
            next = reader.next_event() => {
                match next {
                    Some(Ok(event)) => {
                        if event.is_malformed() && ctx.options.malformed == MalformedPolicy::Skip {
                            warn!(run_id = %run_id, raw = %event.raw_text, "skipping malformed stream record");
                            accumulator.note_malformed();
                            events.push(event);
                            continue;
                        }
                        accumulator.apply(&event);
                        let text = event.content().filter(|t| !t.is_empty()).map(str::to_string);
                        events.push(event);
                        if let Some(text) = text {
                            debug!(run_id = %run_id, provider = %provider, model = %model, seq, "content delta");
                            let sent = send_event(&tx, RunEvent::Delta { run_id, seq, text }).await;
                            seq = seq.saturating_add(1);
                            if !sent {
                                let _ = final_tx.send(Err(HarnessError::protocol_msg(
                                    "run stream receiver dropped during output",
                                )));
                                return;
                            }
                        }
                    }
                    Some(Err(err)) => {
                        fail(&tx, final_tx, run_id, RunFailure::from_stream_error(&err)).await;
                        return;
                    }
                    None => accumulator.close(),
                }
            }
        }
    }

    let response = accumulator.finish();
    if let Some(EndState::Aborted { message }) = &response.end
        && ctx.options.receipt != ReceiptPolicy::Always
    {
        warn!(run_id = %run_id, error = %message, "stream aborted by error record");
        let failure = RunFailure::Aborted {
            message: message.clone(),
        };
        fail(&tx, final_tx, run_id, failure).await;
        return;
    }

    let (receipt, receipt_path) = match persist_receipt(&ctx, &payload, &response, &events) {
        Ok(saved) => saved,
        Err(err) => {
            let failure = RunFailure::Protocol {
                message: format!("receipt not written: {err}"),
            };
            let _ = send_event(&tx, RunEvent::Failed { run_id, error: failure }).await;
            let _ = final_tx.send(Err(err));
            return;
        }
    };

    let summary = RunSummary::new(&response, receipt_path.clone());
    let sent = send_event(&tx, RunEvent::Finished { run_id, summary }).await;
    let outcome = RunOutcome {
        run_id,
        response,
        events,
        payload,
        receipt,
        receipt_path,
    };
    let _ = final_tx.send(if sent {
        Ok(outcome)
    } else {
        Err(HarnessError::protocol_msg(
            "run stream receiver dropped before completion",
        ))
    });
}

fn persist_receipt(
    ctx: &RunContext,
    payload: &serde_json::Value,
    response: &AccumulatedResponse,
    events: &[StreamEvent],
) -> Result<(Option<Receipt>, Option<PathBuf>), HarnessError> {
    let wanted = match ctx.options.receipt {
        ReceiptPolicy::Disabled => false,
        ReceiptPolicy::CompletedOnly => !response.ended_abnormally(),
        ReceiptPolicy::Always => true,
    };
    if !wanted {
        return Ok((None, None));
    }
    let receipt = ReceiptBuilder::new(ctx.request.model.clone(), payload.clone())
        .run_id(ctx.run_id)
        .build(response, events)?;
    let path = ReceiptStore::new(&ctx.options.receipt_dir).save(&receipt)?;
    Ok((Some(receipt), Some(path)))
}

async fn fail(
    tx: &mpsc::Sender<RunEvent>,
    final_tx: oneshot::Sender<Result<RunOutcome, HarnessError>>,
    run_id: uuid::Uuid,
    failure: RunFailure,
) {
    let _ = send_event(
        tx,
        RunEvent::Failed {
            run_id,
            error: failure.clone(),
        },
    )
    .await;
    let _ = final_tx.send(Err(HarnessError::RunFailed(failure)));
}

async fn send_event(tx: &mpsc::Sender<RunEvent>, event: RunEvent) -> bool {
    tx.send(event).await.is_ok()
}
