//! Streaming chat-completions client that records tamper-evident receipts.
//!
//! A run opens one SSE stream, folds its records into an
//! `AccumulatedResponse`, and can persist every raw record together with
//! SHA-256 hashes of the event log, the request payload and the final text.
//! `ReceiptVerifier` later recomputes those hashes from the file alone.
//!
//! # Streaming a run and saving a receipt
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use inference_receipts::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), HarnessError> {
//! let transport = HttpTransport::new(ClientConfig::from_env_prefix("AMBIENT")?)?;
//! let client = InferenceClient::new(Arc::new(transport));
//!
//! let outcome = client
//!     .collect(
//!         ChatRequest::new("zai-org/GLM-4.6").user_text("Say hello"),
//!         RunOptions::default().save_receipts(ReceiptPolicy::CompletedOnly, "data/receipts"),
//!     )
//!     .await?;
//!
//! if let Some(path) = &outcome.receipt_path {
//!     let report = ReceiptVerifier::verify_path(path)?;
//!     println!("{report}");
//! }
//! # Ok(())
//! # }
//! ```

/// Folding stream events into a response with timing marks.
pub mod accumulator;
/// Repeated-run latency benchmarking.
pub mod bench;
/// Transport configuration and per-run options.
pub mod config;
/// Public error types.
pub mod errors;
/// Parsed stream records.
pub mod event;
/// Provider identifiers and model id helpers.
pub mod model;
/// Tracing subscriber setup.
pub mod observability;
/// Common imports for typical usage.
pub mod prelude;
pub mod receipt;
/// Chat request body construction.
pub mod request;
/// Run task, streaming handle and cancellation handle.
pub mod run;
/// SSE framing and event classification.
pub mod sse;
pub mod tamper;
/// Byte-stream transport seam and its HTTP implementation.
pub mod transport;
/// Receipt integrity verification.
pub mod verify;

pub use accumulator::{AccumulatedResponse, EndState, ResponseAccumulator};
pub use bench::{BenchConfig, BenchRecord, BenchRecorder, BenchReport, BenchSummary, run_benchmark};
pub use config::{ClientConfig, MalformedPolicy, ReceiptPolicy, RunOptions};
pub use errors::{BenchError, HarnessError, ReceiptError, RunFailure, StreamError, TamperError};
pub use event::{DeltaPayload, EventError, EventKind, StreamEvent, Usage};
pub use model::ProviderId;
pub use observability::init_observability;
pub use receipt::{Receipt, ReceiptBuilder, ReceiptStore};
pub use request::{ChatMessage, ChatRequest};
pub use run::{AbortHandle, InferenceClient, RunEvent, RunOutcome, RunStream, RunSummary};
pub use sse::{EventStreamReader, SseDecoder, parse_event};
pub use tamper::{Tamper, TamperSimulator};
pub use transport::{HttpTransport, Transport};
pub use verify::{ReceiptVerifier, Verdict, VerificationReport};
