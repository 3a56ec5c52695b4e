//! Common imports for streaming, receipt and verification workflows.
pub use crate::{
    AbortHandle, ChatRequest, ClientConfig, HarnessError, HttpTransport, InferenceClient,
    MalformedPolicy, ReceiptPolicy, ReceiptStore, ReceiptVerifier, RunEvent, RunOptions,
    RunOutcome, RunStream, TamperSimulator, Transport, Verdict,
};
