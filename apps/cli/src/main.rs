//! Headless driver for the utterance-intent pipeline.
//!
//! `run` streams `AsrEvent` JSON from stdin through a fresh pipeline and
//! prints every emitted event to stdout as JSONL. `record` does the same
//! while persisting the full event stream to a session file. `replay`
//! loads a session file and replays its input events through a fresh
//! pipeline, printing the regenerated output.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use utterance_detect::HttpLlmBackend;
use utterance_events::AsrEvent;
use utterance_pipeline::{Pipeline, PipelineConfig};
use utterance_recorder::{PlaybackControl, ReplayInput, SessionPlayer, SessionRecorder};

#[derive(Parser)]
#[command(name = "utterance-cli", about = "Drive the utterance-intent pipeline from newline-delimited ASR JSON")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Optional TOML config file. Defaults and UTTERANCE_* env vars still apply on top.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Read AsrEvent JSON from stdin, print emitted events to stdout as JSONL.
    Run,
    /// Same as `run`, plus persists the session to a file.
    Record {
        #[arg(long)]
        output: PathBuf,
    },
    /// Load a recorded session and replay it through a fresh pipeline.
    Replay { input: PathBuf },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<PipelineConfig> {
    let base = match path {
        Some(p) => {
            let contents = std::fs::read_to_string(p)?;
            PipelineConfig::from_toml_str(&contents)?
        }
        None => PipelineConfig::default(),
    };
    Ok(base.apply_env_overrides())
}

fn build_backend(config: &PipelineConfig) -> HttpLlmBackend {
    HttpLlmBackend::new(config.llm.base_url.clone(), config.llm.model.clone(), config.llm.api_key.clone())
}

fn print_jsonl<T: serde::Serialize>(value: &T) {
    if let Ok(line) = serde_json::to_string(value) {
        let stdout = std::io::stdout();
        let mut handle = stdout.lock();
        let _ = writeln!(handle, "{line}");
    }
}

/// Spawns one print-only task per event stream. Recording, when active, is
/// handled synchronously inside the pipeline itself (see
/// `Pipeline::attach_recorder`) so the session file's line order always
/// matches non-decreasing `offset_ms` — these tasks only need to keep
/// stdout roughly live, and run until their channel closes (the pipeline,
/// and all its `Arc` clones, have been dropped).
fn attach_sinks(pipeline: &Pipeline<HttpLlmBackend>) {
    macro_rules! spawn_printer {
        ($stream:expr) => {{
            let mut rx = $stream.subscribe();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    print_jsonl(&event);
                }
            });
        }};
    }

    spawn_printer!(pipeline.streams.asr_partial);
    spawn_printer!(pipeline.streams.asr_final);
    spawn_printer!(pipeline.streams.utterance_open);
    spawn_printer!(pipeline.streams.utterance_update);
    spawn_printer!(pipeline.streams.utterance_final);
    spawn_printer!(pipeline.streams.intent_candidate);
    spawn_printer!(pipeline.streams.intent_final);
    spawn_printer!(pipeline.streams.intent_corrected);
    spawn_printer!(pipeline.streams.action_triggered);
}

/// Periodic ticker driving the builder's timeouts and the router's
/// conflict window, per the ≤100 ms scheduling model.
fn spawn_ticker(pipeline: Arc<Pipeline<HttpLlmBackend>>, interval_ms: u64) -> tokio::task::JoinHandle<()> {
    let cancel = pipeline.cancellation_token();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(interval_ms.max(1)));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let now = Utc::now();
                    pipeline.check_timeouts(now).await;
                    pipeline.check_conflict_window(now);
                    pipeline.check_llm_triggers(now, std::time::Instant::now()).await;
                }
            }
        }
    })
}

async fn run_from_stdin(pipeline: Arc<Pipeline<HttpLlmBackend>>) -> anyhow::Result<()> {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event: AsrEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(error = %err, "skipping unparsable input line");
                continue;
            }
        };
        let now = event.received_at;
        pipeline.process_asr_event(event, now).await;
    }
    pipeline.force_close(Utc::now()).await;
    Ok(())
}

async fn run_replay(pipeline: Arc<Pipeline<HttpLlmBackend>>, input: &PathBuf) -> anyhow::Result<()> {
    let player = SessionPlayer::load(input)?;
    if player.skipped_lines() > 0 {
        tracing::warn!(skipped = player.skipped_lines(), "some recorded lines were unparsable");
    }

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ReplayInput>();
    let consumer_pipeline = pipeline.clone();
    let consumer = tokio::spawn(async move {
        while let Some(input) = rx.recv().await {
            match input {
                ReplayInput::Asr(event) => {
                    let now = Utc::now();
                    consumer_pipeline.process_asr_event(event, now).await;
                }
                ReplayInput::UtteranceEnd => {
                    consumer_pipeline.signal_utterance_end(Utc::now()).await;
                }
            }
        }
    });

    let control = PlaybackControl::new();
    let _outcome = player.replay_into(&control, |input| {
        let _ = tx.send(input);
    }).await;
    drop(tx);
    consumer.await?;
    pipeline.force_close(Utc::now()).await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    let backend = build_backend(&config);
    let pipeline = Arc::new(Pipeline::new(&config, backend));

    match cli.command {
        Command::Run => {
            attach_sinks(&pipeline);
            let ticker = spawn_ticker(pipeline.clone(), config.tick_interval_ms);
            run_from_stdin(pipeline.clone()).await?;
            pipeline.stop();
            ticker.abort();
        }
        Command::Record { output } => {
            let recorder = Arc::new(SessionRecorder::create(
                &output,
                Utc::now(),
                utterance_events::SessionConfig {
                    detection_mode: Some(format!("{:?}", config.detection_mode)),
                    ..Default::default()
                },
                config.recording.recorder_correlation_tolerance_ms,
            )?);
            pipeline.attach_recorder(recorder);
            attach_sinks(&pipeline);
            let ticker = spawn_ticker(pipeline.clone(), config.tick_interval_ms);
            run_from_stdin(pipeline.clone()).await?;
            pipeline.stop();
            ticker.abort();
        }
        Command::Replay { input } => {
            attach_sinks(&pipeline);
            let ticker = spawn_ticker(pipeline.clone(), config.tick_interval_ms);
            run_replay(pipeline.clone(), &input).await?;
            pipeline.stop();
            ticker.abort();
        }
    }

    Ok(())
}
