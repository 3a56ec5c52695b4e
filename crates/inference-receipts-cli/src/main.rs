//! `receipts`: stream a completion, verify saved receipts, or benchmark latency.

mod settings;

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use inference_receipts::bench::{BenchConfig, BenchRecorder, run_benchmark};
use inference_receipts::prelude::*;
use inference_receipts::receipt::Receipt;

use crate::settings::{ProviderSettings, RunDefaults};

/// Streaming inference with tamper-evident receipts.
#[derive(Parser)]
#[command(name = "receipts", version)]
struct Cli {
    /// Environment prefix of the provider settings.
    #[arg(long, default_value = "AMBIENT", global = true)]
    provider: String,

    /// Model id; defaults to the first configured model.
    #[arg(long, global = true)]
    model: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Stream one completion, printing tokens as they arrive.
    Stream {
        #[arg(short, long)]
        prompt: Option<String>,

        /// System message sent ahead of the prompt.
        #[arg(long)]
        system: Option<String>,

        #[arg(long)]
        max_tokens: Option<u32>,

        #[arg(short, long)]
        temperature: Option<f64>,

        /// Save a receipt for the finished stream.
        #[arg(long)]
        save: bool,
    },
    /// Verify a receipt file, or the most recent one in the receipt directory.
    Verify {
        path: Option<PathBuf>,

        #[arg(long)]
        receipt_dir: Option<PathBuf>,

        /// Stream a fresh completion and verify its receipt.
        #[arg(long)]
        generate: bool,

        /// Also verify a tampered in-memory copy, which should be rejected.
        #[arg(long)]
        tamper: bool,
    },
    /// Run repeated streams and record latency metrics as JSONL.
    Bench {
        #[arg(long)]
        runs: Option<usize>,

        #[arg(long)]
        warmup: Option<usize>,

        #[arg(long, default_value_t = 1)]
        concurrency: usize,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    settings::load_dotenv();
    inference_receipts::init_observability();

    let cli = Cli::parse();
    let defaults = RunDefaults::from_env();
    let provider = ProviderSettings::from_env(&cli.provider);

    match cli.command {
        Command::Stream {
            prompt,
            system,
            max_tokens,
            temperature,
            save,
        } => {
            let client = client(&provider)?;
            let model = model(&cli.model, &provider)?;
            let mut request = ChatRequest::new(model);
            if let Some(system) = system {
                request = request.system_prompt(system);
            }
            let request = request
                .user_text(prompt.unwrap_or_else(|| defaults.prompt.clone()))
                .temperature(temperature.or(defaults.temperature))
                .max_tokens(max_tokens.or(defaults.max_tokens))
                .top_p(defaults.top_p);
            let policy = if save {
                ReceiptPolicy::CompletedOnly
            } else {
                ReceiptPolicy::Disabled
            };
            let options = run_options(&defaults, policy, None);
            let outcome = stream_to_stdout(&client, request, options).await?;
            if let Some(path) = &outcome.receipt_path {
                println!("receipt: {}", path.display());
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Verify {
            path,
            receipt_dir,
            generate,
            tamper,
        } => {
            let receipt_dir = receipt_dir.unwrap_or_else(|| defaults.receipt_dir.clone());
            let path = if generate {
                let client = client(&provider)?;
                let model = model(&cli.model, &provider)?;
                let request = ChatRequest::new(model)
                    .user_text(defaults.prompt.clone())
                    .temperature(defaults.temperature)
                    .max_tokens(defaults.max_tokens)
                    .top_p(defaults.top_p);
                let options = run_options(
                    &defaults,
                    ReceiptPolicy::CompletedOnly,
                    Some(receipt_dir.as_path()),
                );
                stream_to_stdout(&client, request, options)
                    .await?
                    .receipt_path
                    .context("stream finished without saving a receipt")?
            } else {
                match path {
                    Some(path) => path,
                    None => ReceiptStore::new(&receipt_dir).latest()?,
                }
            };
            verify(&path, tamper)
        }
        Command::Bench {
            runs,
            warmup,
            concurrency,
            output,
        } => {
            let client = client(&provider)?;
            let model = model(&cli.model, &provider)?;
            let request = ChatRequest::new(model)
                .user_text(defaults.prompt.clone())
                .temperature(defaults.temperature)
                .max_tokens(defaults.max_tokens)
                .top_p(defaults.top_p);
            let options = run_options(&defaults, ReceiptPolicy::Disabled, None);
            let config = BenchConfig::new(request, options)
                .warmup(warmup.unwrap_or(defaults.bench_warmup))
                .runs(runs.unwrap_or(defaults.bench_runs))
                .concurrency(concurrency);
            let output = output.unwrap_or_else(|| defaults.bench_output.clone());
            let mut recorder = BenchRecorder::open(&output)?;
            let report = run_benchmark(&client, &config, Some(&mut recorder)).await?;
            println!("{}", serde_json::to_string_pretty(&report.summary)?);
            println!("records: {}", recorder.path().display());
            Ok(if report.summary.errors == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

fn client(provider: &ProviderSettings) -> anyhow::Result<InferenceClient> {
    let transport = HttpTransport::new(provider.client_config()?)?;
    Ok(InferenceClient::new(Arc::new(transport)))
}

fn model(explicit: &Option<String>, provider: &ProviderSettings) -> anyhow::Result<String> {
    match explicit {
        Some(model) => Ok(model.clone()),
        None => Ok(provider.default_model()?.to_string()),
    }
}

fn run_options(defaults: &RunDefaults, policy: ReceiptPolicy, dir: Option<&Path>) -> RunOptions {
    let dir = dir.unwrap_or(defaults.receipt_dir.as_path());
    RunOptions::default()
        .stall_threshold(defaults.stall_threshold)
        .save_receipts(policy, dir)
}

async fn stream_to_stdout(
    client: &InferenceClient,
    request: ChatRequest,
    options: RunOptions,
) -> anyhow::Result<RunOutcome> {
    let mut stream = client.start_stream(request, options).await?;
    let mut stdout = std::io::stdout();
    while let Some(event) = stream.next_event().await {
        match event {
            RunEvent::Started { provider, model, .. } => {
                eprintln!("--- {provider} / {model} ---");
            }
            RunEvent::Delta { text, .. } => {
                write!(stdout, "{text}")?;
                stdout.flush()?;
            }
            RunEvent::Finished { summary, .. } => {
                println!();
                let fmt_ms =
                    |ms: Option<f64>| ms.map_or_else(|| "-".to_string(), |v| format!("{v:.0}ms"));
                let tokens = summary
                    .usage
                    .completion_tokens
                    .map_or_else(|| "-".to_string(), |t| t.to_string());
                println!(
                    "[ttfb={} ttc={} tokens={} stalls={} end={}]",
                    fmt_ms(summary.ttfb_ms),
                    fmt_ms(summary.ttc_ms),
                    tokens,
                    summary.stall_count,
                    summary.end_state.as_str(),
                );
                break;
            }
            RunEvent::Failed { error, .. } => {
                eprintln!("\nerror: {error}");
                break;
            }
        }
    }
    Ok(stream.finish().await?)
}

fn verify(path: &Path, tamper: bool) -> anyhow::Result<ExitCode> {
    let report = ReceiptVerifier::verify_path(path)?;
    println!("{report}");
    let accepted = report.is_accepted();

    if tamper {
        let receipt = Receipt::load(path)
            .with_context(|| format!("receipt {} is not structurally valid", path.display()))?;
        let tampered = TamperSimulator::inject_midpoint().apply(&receipt)?;
        let label = format!("{} (tampered copy)", path.display());
        let tampered_report = ReceiptVerifier::verify_receipt(&tampered, label)?;
        println!("{tampered_report}");
        if tampered_report.verdict() == Verdict::Accepted {
            tracing::warn!(path = %path.display(), "tampered copy was accepted");
        }
    }

    Ok(if accepted {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
