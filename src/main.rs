//! pewma-sentry — replay / ingest front-end for the PEWMA engine.
//!
//! Reads observations as JSON from a file (a JSON array or newline-delimited
//! records) or as a newline-delimited stream on stdin, runs each through the
//! processor, and writes one flattened diagnostics record per line to stdout.
//!
//! # Usage
//!
//! ```bash
//! # Replay a captured event file against an on-disk state database
//! pewma-sentry --config pewma.toml --input events.json --state-dir ./data/state
//!
//! # Live ingest from a sensor feed, in-memory state
//! sensor-feed | pewma-sentry --config pewma.toml
//! ```
//!
//! # Environment Variables
//!
//! - `PEWMA_CONFIG`: config TOML path (used when `--config` is not given)
//! - `PEWMA_STATE_DIR`: sled state directory (same as `--state-dir`)
//! - `RUST_LOG`: logging level (default: info)

use anyhow::{Context, Result};
use clap::Parser;
use pewma_sentry::{
    EngineConfig, InMemoryStore, Observation, Processor, ReplayStats, SledStore, StateStore,
};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use tracing::{error, info};

/// Streaming PEWMA anomaly detection over per-station telemetry
#[derive(Parser, Debug)]
#[command(name = "pewma-sentry", version, about)]
struct Cli {
    /// Engine config TOML (default: $PEWMA_CONFIG, then ./pewma.toml, then built-ins)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Observation file, a JSON array or one JSON object per line; stdin if omitted
    #[arg(long)]
    input: Option<PathBuf>,

    /// Directory for the sled state database; state is in-memory if omitted
    #[arg(long, env = "PEWMA_STATE_DIR")]
    state_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::load_from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => EngineConfig::load(),
    };

    let store: Box<dyn StateStore> = match &cli.state_dir {
        Some(dir) => {
            let store = SledStore::open(dir)
                .with_context(|| format!("failed to open state database at {}", dir.display()))?;
            info!(path = %dir.display(), keys = store.count(), "Opened sled state store");
            Box::new(store)
        }
        None => Box::new(InMemoryStore::new()),
    };

    info!(
        backend = store.backend_name(),
        tracked_columns = ?config.tracked_columns,
        key_field = %config.key_field,
        warmup_window = config.warmup_window,
        "Starting pewma-sentry"
    );

    let mut processor =
        Processor::new(store, config).context("invalid engine configuration")?;

    let stats = match &cli.input {
        Some(path) => replay_file(&mut processor, path)?,
        None => ingest_stdin(&mut processor)?,
    };

    if let Err(e) = processor.store().flush() {
        error!(error = %e, "failed to flush state store at shutdown");
    }

    info!(
        records = stats.records,
        rejected = stats.rejected,
        anomalies = stats.total_anomalies(),
        keys = processor.store().count(),
        "Run complete"
    );
    for (col, count) in &stats.anomalies {
        info!(column = %col, count, "Anomalies flagged");
    }

    Ok(())
}

/// Replay a captured observation file (JSON array or NDJSON).
fn replay_file<S: StateStore>(
    processor: &mut Processor<S>,
    path: &std::path::Path,
) -> Result<ReplayStats> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let observations: Vec<Observation> = if raw.trim_start().starts_with('[') {
        serde_json::from_str(&raw).with_context(|| {
            format!("{} is not a valid JSON array of observations", path.display())
        })?
    } else {
        raw.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                serde_json::from_str(line)
                    .with_context(|| format!("invalid observation line: {line}"))
            })
            .collect::<Result<_>>()?
    };

    info!(path = %path.display(), count = observations.len(), "Replaying observation file");

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut stats = ReplayStats::default();
    for obs in &observations {
        emit(processor, obs, &mut out, &mut stats)?;
    }
    Ok(stats)
}

/// Ingest a live newline-delimited stream from stdin until EOF.
fn ingest_stdin<S: StateStore>(processor: &mut Processor<S>) -> Result<ReplayStats> {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut stats = ReplayStats::default();

    for line in stdin.lock().lines() {
        let line = line.context("failed to read from stdin")?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Observation>(line) {
            Ok(obs) => emit(processor, &obs, &mut out, &mut stats)?,
            Err(e) => {
                error!(error = %e, "skipping malformed observation line");
                stats.record_rejected();
            }
        }
    }
    Ok(stats)
}

/// Process one observation and write its diagnostics line.
///
/// Engine validation failures reject the single record and keep going; I/O
/// failures on stdout abort the run.
fn emit<S: StateStore>(
    processor: &mut Processor<S>,
    obs: &Observation,
    out: &mut impl Write,
    stats: &mut ReplayStats,
) -> Result<()> {
    match processor.process(obs) {
        Ok(record) => {
            let line = serde_json::to_string(&record).context("failed to encode diagnostics")?;
            writeln!(out, "{line}").context("failed to write diagnostics")?;
            stats.record(&record, processor.config());
        }
        Err(e) => {
            error!(error = %e, "observation rejected");
            stats.record_rejected();
        }
    }
    Ok(())
}
