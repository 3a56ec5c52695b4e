//! Repeated-run latency benchmarking.
//!
//! Warmup runs execute one at a time; measured runs execute with bounded
//! concurrency. Every run is an isolated stream with its own accumulator and
//! event log. Measured records are appended to a JSONL file as runs complete.

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use futures::StreamExt as _;
use tracing::{info, warn};

use crate::config::RunOptions;
use crate::errors::{BenchError, HarnessError};
use crate::receipt::sha256_hex;
use crate::request::ChatRequest;
use crate::run::{InferenceClient, RunOutcome};

/// Position of one run in a benchmark.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunSpec {
    pub index: usize,
    pub total: usize,
    pub warmup: bool,
    /// Human-readable suffix such as ` [run 2/5]`.
    pub label_suffix: String,
}

/// Lays out `warmup` warmup specs followed by `runs` measured specs.
pub fn run_specs(warmup: usize, runs: usize) -> Vec<RunSpec> {
    let total = warmup + runs;
    let warmups = (0..warmup).map(|i| RunSpec {
        index: i,
        total,
        warmup: true,
        label_suffix: format!(" [warmup {}/{warmup}]", i + 1),
    });
    let measured = (0..runs).map(|i| RunSpec {
        index: warmup + i,
        total,
        warmup: false,
        label_suffix: format!(" [run {}/{runs}]", i + 1),
    });
    warmups.chain(measured).collect()
}

/// Header line describing a benchmark session.
#[derive(Clone, Debug, serde::Serialize)]
pub struct BenchMeta {
    pub timestamp_utc: DateTime<Utc>,
    pub warmup_runs: usize,
    pub bench_runs: usize,
    pub concurrency: usize,
    pub stall_threshold_ms: u128,
    /// First 16 hex chars of the prompt hash; the prompt itself is not logged.
    pub prompt_hash: String,
    pub request_params: serde_json::Value,
}

impl BenchMeta {
    pub fn new(config: &BenchConfig) -> Self {
        let prompt: String = config
            .request
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let mut prompt_hash = sha256_hex(prompt.as_bytes());
        prompt_hash.truncate(16);
        Self {
            timestamp_utc: Utc::now(),
            warmup_runs: config.warmup,
            bench_runs: config.runs,
            concurrency: config.concurrency,
            stall_threshold_ms: config.options.stall_threshold.as_millis(),
            prompt_hash,
            request_params: serde_json::json!({
                "temperature": config.request.temperature,
                "max_tokens": config.request.max_tokens,
                "top_p": config.request.top_p,
            }),
        }
    }
}

/// Metrics of one benchmark run.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BenchRecord {
    pub provider: String,
    pub model: String,
    pub run_index: usize,
    pub warmup: bool,
    pub ttfb_ms: Option<f64>,
    pub ttc_ms: Option<f64>,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub text_chars: usize,
    pub reasoning_chars: usize,
    pub stall_count: u32,
    pub parse_errors: usize,
    pub error: Option<String>,
    pub receipt_path: Option<PathBuf>,
}

impl BenchRecord {
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        spec: &RunSpec,
        result: &Result<RunOutcome, HarnessError>,
    ) -> Self {
        let mut record = Self {
            provider: provider.into(),
            model: model.into(),
            run_index: spec.index,
            warmup: spec.warmup,
            ttfb_ms: None,
            ttc_ms: None,
            prompt_tokens: None,
            completion_tokens: None,
            text_chars: 0,
            reasoning_chars: 0,
            stall_count: 0,
            parse_errors: 0,
            error: None,
            receipt_path: None,
        };
        match result {
            Ok(outcome) => {
                let response = &outcome.response;
                record.ttfb_ms = response.ttfb_ms().map(round2);
                record.ttc_ms = response.ttc_ms().map(round2);
                record.prompt_tokens = response.usage.prompt_tokens;
                record.completion_tokens = response.usage.completion_tokens;
                record.text_chars = response.text.chars().count();
                record.reasoning_chars = response.reasoning.chars().count();
                record.stall_count = response.stall_count;
                record.parse_errors = response.malformed_events;
                record.receipt_path = outcome.receipt_path.clone();
            }
            Err(err) => record.error = Some(err.to_string()),
        }
        record
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Appends benchmark lines to a JSONL file.
pub struct BenchRecorder {
    path: PathBuf,
    file: File,
}

impl BenchRecorder {
    /// Opens `path` for appending, creating parent directories as needed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, BenchError> {
        let path = path.into();
        let io_err = |source| BenchError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes one JSON line and flushes it.
    pub fn write<T: serde::Serialize>(&mut self, line: &T) -> Result<(), BenchError> {
        let mut body = serde_json::to_vec(line)?;
        body.push(b'\n');
        self.file
            .write_all(&body)
            .and_then(|_| self.file.flush())
            .map_err(|source| BenchError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

/// Aggregate statistics over measured runs.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize)]
pub struct BenchSummary {
    pub runs: usize,
    pub errors: usize,
    pub mean_ttfb_ms: Option<f64>,
    pub median_ttfb_ms: Option<f64>,
    pub mean_ttc_ms: Option<f64>,
    pub median_ttc_ms: Option<f64>,
    pub total_stalls: u64,
    pub total_parse_errors: usize,
}

impl BenchSummary {
    /// Summarizes non-warmup records. Failed runs count as errors and are
    /// left out of the latency statistics.
    pub fn from_records(records: &[BenchRecord]) -> Self {
        let measured: Vec<&BenchRecord> = records.iter().filter(|r| !r.warmup).collect();
        let ttfb: Vec<f64> = measured.iter().filter_map(|r| r.ttfb_ms).collect();
        let ttc: Vec<f64> = measured.iter().filter_map(|r| r.ttc_ms).collect();
        Self {
            runs: measured.len(),
            errors: measured.iter().filter(|r| r.error.is_some()).count(),
            mean_ttfb_ms: mean(&ttfb),
            median_ttfb_ms: median(&ttfb),
            mean_ttc_ms: mean(&ttc),
            median_ttc_ms: median(&ttc),
            total_stalls: measured.iter().map(|r| u64::from(r.stall_count)).sum(),
            total_parse_errors: measured.iter().map(|r| r.parse_errors).sum(),
        }
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    })
}

/// Benchmark parameters.
#[derive(Clone, Debug)]
pub struct BenchConfig {
    pub request: ChatRequest,
    pub options: RunOptions,
    pub warmup: usize,
    pub runs: usize,
    /// Upper bound on measured runs in flight.
    pub concurrency: usize,
}

impl BenchConfig {
    pub fn new(request: ChatRequest, options: RunOptions) -> Self {
        Self {
            request,
            options,
            warmup: 1,
            runs: 5,
            concurrency: 1,
        }
    }

    pub fn warmup(mut self, warmup: usize) -> Self {
        self.warmup = warmup;
        self
    }

    pub fn runs(mut self, runs: usize) -> Self {
        self.runs = runs;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }
}

/// Records of every run (ordered by run index) plus the summary.
#[derive(Clone, Debug)]
pub struct BenchReport {
    pub records: Vec<BenchRecord>,
    pub summary: BenchSummary,
}

/// Runs the benchmark, appending each measured record to `recorder` as it
/// completes. Warmup records are returned but not written.
pub async fn run_benchmark(
    client: &InferenceClient,
    config: &BenchConfig,
    mut recorder: Option<&mut BenchRecorder>,
) -> Result<BenchReport, BenchError> {
    if config.concurrency == 0 {
        return Err(BenchError::Config("concurrency must be greater than 0".into()));
    }
    if let Some(recorder) = recorder.as_deref_mut() {
        recorder.write(&serde_json::json!({ "meta": BenchMeta::new(config) }))?;
    }

    let provider = client.provider().to_string();
    let model = config.request.model.clone();
    let specs = run_specs(config.warmup, config.runs);
    let (warmups, measured): (Vec<RunSpec>, Vec<RunSpec>) =
        specs.into_iter().partition(|s| s.warmup);

    let mut records = Vec::with_capacity(warmups.len() + measured.len());
    for spec in &warmups {
        let result = client
            .collect(config.request.clone(), config.options.clone())
            .await;
        let record = BenchRecord::new(&provider, &model, spec, &result);
        log_record(spec, &record);
        records.push(record);
    }

    let mut completed = futures::stream::iter(measured)
        .map(|spec| {
            let request = config.request.clone();
            let options = config.options.clone();
            async move {
                let result = client.collect(request, options).await;
                (spec, result)
            }
        })
        .buffer_unordered(config.concurrency);
    while let Some((spec, result)) = completed.next().await {
        let record = BenchRecord::new(&provider, &model, &spec, &result);
        log_record(&spec, &record);
        if let Some(recorder) = recorder.as_deref_mut() {
            recorder.write(&record)?;
        }
        records.push(record);
    }

    records.sort_by_key(|r| r.run_index);
    let summary = BenchSummary::from_records(&records);
    info!(
        runs = summary.runs,
        errors = summary.errors,
        median_ttfb_ms = ?summary.median_ttfb_ms,
        median_ttc_ms = ?summary.median_ttc_ms,
        "benchmark finished"
    );
    Ok(BenchReport { records, summary })
}

fn log_record(spec: &RunSpec, record: &BenchRecord) {
    match &record.error {
        Some(error) => {
            warn!(run = %spec.label_suffix.trim(), error = %error, "benchmark run failed")
        }
        None => info!(
            run = %spec.label_suffix.trim(),
            ttfb_ms = ?record.ttfb_ms,
            ttc_ms = ?record.ttc_ms,
            stalls = record.stall_count,
            "benchmark run finished"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StreamError;
    use crate::model::ProviderId;
    use crate::sse::ByteStream;
    use crate::transport::Transport;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTransport {
        opened: AtomicUsize,
        fail_every: Option<usize>,
    }

    #[async_trait::async_trait]
    impl Transport for CountingTransport {
        fn provider(&self) -> ProviderId {
            ProviderId::new("fake")
        }

        async fn open(&self, _payload: &serde_json::Value) -> Result<ByteStream, StreamError> {
            let n = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_every.is_some_and(|every| n % every == 0) {
                return Err(StreamError::provider("fake", "rate limited", Some(429)));
            }
            let body = "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}],\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":1}}\n\ndata: [DONE]\n\n";
            let chunks: Vec<Result<bytes::Bytes, StreamError>> =
                vec![Ok(bytes::Bytes::from_static(body.as_bytes()))];
            Ok(Box::pin(futures::stream::iter(chunks)))
        }
    }

    fn client(fail_every: Option<usize>) -> (InferenceClient, Arc<CountingTransport>) {
        let transport = Arc::new(CountingTransport {
            opened: AtomicUsize::new(0),
            fail_every,
        });
        (InferenceClient::new(transport.clone()), transport)
    }

    fn config() -> BenchConfig {
        BenchConfig::new(
            ChatRequest::new("model-a").user_text("count to three"),
            RunOptions::default(),
        )
    }

    #[test]
    fn run_specs_put_warmups_first() {
        let specs = run_specs(2, 3);
        assert_eq!(specs.len(), 5);
        assert!(specs[0].warmup && specs[1].warmup);
        assert!(!specs[2].warmup);
        assert_eq!(specs[2].index, 2);
        assert_eq!(specs[0].label_suffix, " [warmup 1/2]");
        assert_eq!(specs[4].label_suffix, " [run 3/3]");
        assert!(specs.iter().all(|s| s.total == 5));
    }

    #[test]
    fn summary_ignores_warmups_and_failed_latencies() {
        let spec = |index, warmup| RunSpec {
            index,
            total: 4,
            warmup,
            label_suffix: String::new(),
        };
        let ok = |index, warmup, ttfb: f64| {
            let mut record = BenchRecord::new(
                "p",
                "m",
                &spec(index, warmup),
                &Err(HarnessError::Protocol("placeholder".into())),
            );
            record.error = None;
            record.ttfb_ms = Some(ttfb);
            record.ttc_ms = Some(ttfb * 2.0);
            record.stall_count = 1;
            record
        };
        let failed = BenchRecord::new(
            "p",
            "m",
            &spec(3, false),
            &Err(HarnessError::Protocol("boom".into())),
        );
        let summary = BenchSummary::from_records(&[
            ok(0, true, 1000.0),
            ok(1, false, 10.0),
            ok(2, false, 30.0),
            failed,
        ]);
        assert_eq!(summary.runs, 3);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.mean_ttfb_ms, Some(20.0));
        assert_eq!(summary.median_ttfb_ms, Some(20.0));
        assert_eq!(summary.median_ttc_ms, Some(40.0));
        assert_eq!(summary.total_stalls, 2);
    }

    #[test]
    fn median_of_odd_and_empty_sets() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[]), None);
        assert_eq!(mean(&[]), None);
    }

    #[tokio::test]
    async fn benchmark_runs_every_spec_and_writes_jsonl() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bench").join("runs.jsonl");
        let mut recorder = BenchRecorder::open(&path).expect("recorder");
        let (client, transport) = client(None);

        let report = run_benchmark(
            &client,
            &config().warmup(1).runs(4).concurrency(2),
            Some(&mut recorder),
        )
        .await
        .expect("bench");

        assert_eq!(transport.opened.load(Ordering::SeqCst), 5);
        assert_eq!(report.records.len(), 5);
        let indices: Vec<_> = report.records.iter().map(|r| r.run_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        assert_eq!(report.summary.runs, 4);
        assert_eq!(report.summary.errors, 0);
        assert!(report.records.iter().all(|r| r.text_chars == 2));

        let body = std::fs::read_to_string(&path).expect("read jsonl");
        let lines: Vec<serde_json::Value> = body
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[0].get("meta").is_some());
        assert!(lines[1..].iter().all(|l| l["warmup"] == false));
        assert_eq!(lines[0]["meta"]["prompt_hash"].as_str().map(str::len), Some(16));
    }

    #[tokio::test]
    async fn failed_runs_are_recorded_not_raised() {
        let (client, _) = client(Some(2));
        let report = run_benchmark(&client, &config().warmup(0).runs(4), None)
            .await
            .expect("bench");
        assert_eq!(report.summary.runs, 4);
        assert_eq!(report.summary.errors, 2);
        assert!(
            report
                .records
                .iter()
                .filter_map(|r| r.error.as_deref())
                .all(|e| e.contains("rate limited"))
        );
    }

    #[tokio::test]
    async fn zero_concurrency_is_rejected() {
        let (client, _) = client(None);
        let err = run_benchmark(&client, &config().concurrency(0), None).await;
        assert!(matches!(err, Err(BenchError::Config(_))));
    }
}
