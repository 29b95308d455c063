//! # cbench-cli
//!
//! Binary entry point for the cbench orchestrator.
//!
//! This crate provides:
//! - CLI argument parsing using `clap`
//! - Logging and configuration setup
//! - `cbench run`: the orchestrator on the in-process broker, fed from a
//!   JSONL replay file
//! - `cbench check-config`: configuration validation

use anyhow::{Context, Result, bail};
use cbench_core::broker::{InMemoryBroker, Message};
use cbench_core::{Orchestrator, OrchestratorConfig, ServiceRunner, Settings};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Quiet polls in a row before `--exit-when-idle` stops the service.
const IDLE_POLLS: u32 = 4;

/// cbench - continuous benchmark orchestration
#[derive(Parser, Debug)]
#[command(name = "cbench", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, default_value = "cbench.yml", global = true)]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the orchestrator against the in-process broker
    Run(RunArgs),

    /// Validate the configuration file and print warnings
    CheckConfig,
}

/// Arguments for the run subcommand.
#[derive(Parser, Debug)]
struct RunArgs {
    /// JSONL file of `{"queue": ..., "payload": ...}` lines to publish on start
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Stop once every inbound message has been handled
    #[arg(long)]
    exit_when_idle: bool,
}

/// One line of a replay file, and of `run` output.
#[derive(Debug, Serialize, Deserialize)]
struct ReplayLine {
    queue: String,
    payload: serde_json::Value,
}

impl ReplayLine {
    /// String payloads are published as-is; anything else as its JSON text.
    fn into_message(self) -> (String, Message) {
        let text = match self.payload {
            serde_json::Value::String(text) => text,
            other => other.to_string(),
        };
        (self.queue, Message::Text(text))
    }

    fn from_message(queue: &str, message: &Message) -> Self {
        let payload = match message {
            Message::Text(text) => serde_json::from_str(text)
                .unwrap_or_else(|_| serde_json::Value::String(text.clone())),
            Message::Binary(bytes) => serde_json::Value::from(bytes.clone()),
        };
        Self {
            queue: queue.to_string(),
            payload,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run(args) => run_command(&cli.config, args).await,
        Commands::CheckConfig => check_config_command(&cli.config),
    }
}

fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    if path.exists() {
        OrchestratorConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))
    } else {
        warn!("Config file {:?} not found, using defaults", path);
        Ok(OrchestratorConfig::default())
    }
}

fn load_settings(path: &Path) -> Result<Settings> {
    let config = load_config(path)?;
    let warnings = config
        .validate()
        .context("Configuration validation failed")?;
    for warning in &warnings {
        eprintln!("{warning}");
    }
    config
        .settings()
        .context("Configuration validation failed")
}

fn check_config_command(path: &Path) -> Result<()> {
    let settings = load_settings(path)?;
    println!("events:   {}", settings.event_queue);
    println!("results:  {}", settings.result_queue);
    println!("requests: {}", settings.work_queue);
    println!("outputs:  {}", settings.output_queue);
    if settings.target_patterns.is_empty() {
        println!("targets:  all");
    } else {
        for pattern in &settings.target_patterns {
            println!("targets:  {}", pattern.as_str());
        }
    }
    println!("admit all: {}", settings.admit_all);
    println!("handler concurrency: {}", settings.handler_concurrency);
    println!("Configuration OK");
    Ok(())
}

async fn run_command(config_path: &Path, args: RunArgs) -> Result<()> {
    let settings = load_settings(config_path)?;
    let broker = InMemoryBroker::new();
    let runner = ServiceRunner::new(Orchestrator::new(settings.clone()), Arc::new(broker.clone()));
    let handle = runner
        .run_async()
        .await
        .context("Failed to start orchestrator")?;

    if let Some(path) = &args.replay {
        let lines = read_replay(path)?;
        let count = lines.len();
        for line in lines {
            let (queue, message) = line.into_message();
            if queue != settings.event_queue && queue != settings.result_queue {
                warn!(queue = %queue, "Replaying to a queue the orchestrator does not consume");
            }
            broker.publish(&queue, message);
        }
        info!(count, path = %path.display(), "Replay published");
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    let interrupted_sigint = Arc::clone(&interrupted);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received (SIGINT), shutting down...");
            interrupted_sigint.store(true, Ordering::SeqCst);
        }
    });

    let outbound = [settings.work_queue.as_str(), settings.output_queue.as_str()];
    let mut quiet_polls = 0;
    while !interrupted.load(Ordering::SeqCst) {
        tokio::time::sleep(POLL_INTERVAL).await;

        let mut printed = 0;
        for queue in outbound {
            for message in broker.drain(queue) {
                let line = serde_json::to_string(&ReplayLine::from_message(queue, &message))
                    .context("Failed to encode output line")?;
                println!("{line}");
                printed += 1;
            }
        }

        if args.exit_when_idle {
            if printed == 0 && inbound_settled(&broker, &settings) {
                quiet_polls += 1;
            } else {
                quiet_polls = 0;
            }
            if quiet_polls >= IDLE_POLLS {
                debug!("Inbound queues drained");
                break;
            }
        }
    }

    handle.close().await.context("Failed to stop orchestrator")?;

    let orchestrator = runner.service();
    info!(
        tracked = orchestrator.registry().len(),
        backlogged = orchestrator.backlog().len(),
        "Orchestrator stopped"
    );
    Ok(())
}

fn inbound_settled(broker: &InMemoryBroker, settings: &Settings) -> bool {
    [&settings.event_queue, &settings.result_queue]
        .iter()
        .all(|queue| broker.ready_len(queue) == 0 && broker.unacked_len(queue) == 0)
}

/// Parses a JSONL replay file. Blank lines are skipped.
fn read_replay(path: &Path) -> Result<Vec<ReplayLine>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read replay file {:?}", path))?;

    let mut lines = Vec::new();
    for (index, raw) in content.lines().enumerate() {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let line: ReplayLine = serde_json::from_str(raw)
            .with_context(|| format!("{}:{}: invalid replay line", path.display(), index + 1))?;
        if line.queue.trim().is_empty() {
            bail!("{}:{}: replay line has an empty queue", path.display(), index + 1);
        }
        lines.push(line);
    }
    Ok(lines)
}
