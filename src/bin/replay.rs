//! Scenario Replay Binary
//!
//! Runs a recorded scenario (scheduled order intents plus venue events)
//! through a backtest Clock, EventBus and OrderTracker, and logs a JSON
//! summary of the final order states and engine counters.
//!
//! Usage:
//!   replay scenario.json --output summary.json
//!
//! Environment:
//!   ENGINE_CONFIG_PATH - Engine config TOML (default: engine.toml, optional)
//!   RUST_LOG - Log filter (default: execution_engine=info,replay=info)

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::prelude::*;

use execution_engine::engine::time::{nanos_to_datetime, nanos_to_secs, parse_timestamp, secs_to_nanos};
use execution_engine::engine::{run_scenario, EngineConfig, ReplayScenario};

#[derive(Parser, Debug)]
#[command(name = "replay")]
#[command(about = "Replay an order scenario through the execution engine")]
struct Args {
    /// Scenario JSON file
    scenario: PathBuf,

    /// Engine config TOML; defaults apply when absent
    #[arg(long, env = "ENGINE_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Window start override (RFC 3339)
    #[arg(long)]
    start: Option<String>,

    /// Window end override (RFC 3339)
    #[arg(long)]
    end: Option<String>,

    /// Tick size override in seconds
    #[arg(long)]
    tick_size_secs: Option<f64>,

    /// Write the JSON summary here as well
    #[arg(long)]
    output: Option<PathBuf>,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "execution_engine=info,replay=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn parse_rfc3339_secs(s: &str) -> Result<f64> {
    parse_timestamp(s)
        .map(nanos_to_secs)
        .with_context(|| format!("invalid RFC 3339 timestamp: {}", s))
}

fn render(secs: f64) -> String {
    nanos_to_datetime(secs_to_nanos(secs))
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| format!("{}s", secs))
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::from_env(),
    };

    let mut scenario = ReplayScenario::load(&args.scenario)?;
    if let Some(start) = &args.start {
        scenario.start_secs = parse_rfc3339_secs(start)?;
    }
    if let Some(end) = &args.end {
        scenario.end_secs = parse_rfc3339_secs(end)?;
    }
    if let Some(tick_size) = args.tick_size_secs {
        scenario.tick_size_secs = Some(tick_size);
    }

    info!(
        scenario = %args.scenario.display(),
        start = %render(scenario.start_secs),
        end = %render(scenario.end_secs),
        intents = scenario.intents.len(),
        events = scenario.events.len(),
        "Starting replay"
    );

    let summary = run_scenario(&config, scenario)?;
    let json = serde_json::to_string_pretty(&summary)?;

    info!(
        cycles = summary.clock.cycles,
        orders = summary.orders.len(),
        anomalies = summary.tracker.anomalies,
        "Replay complete"
    );
    info!("Summary:\n{}", json);

    if let Some(path) = &args.output {
        std::fs::write(path, &json)
            .with_context(|| format!("writing summary {}", path.display()))?;
        info!("Summary written to {}", path.display());
    }

    Ok(())
}
