//! policyd entry point.
//!
//! Runs a scenario file and prints the resulting map states.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use ces_manager::{CesManagerConfig, DEFAULT_MAX_CEPS_PER_CES};
use clap::Parser;
use policyd::{DriverConfig, Scenario};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Network policy control-plane driver
#[derive(Parser, Debug)]
#[command(name = "policyd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Scenario file (JSON)
    #[arg(short = 's', long)]
    scenario: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Maximum number of endpoints per endpoint slice
    #[arg(long, default_value_t = DEFAULT_MAX_CEPS_PER_CES)]
    max_ceps_per_slice: usize,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .init();
}

async fn run(args: &Args) -> anyhow::Result<bool> {
    let scenario = Scenario::load(&args.scenario)
        .with_context(|| format!("loading {}", args.scenario.display()))?;
    info!(
        endpoints = scenario.endpoints.len(),
        rules = scenario.rules.len(),
        selections = scenario.selections.len(),
        "Loaded scenario"
    );

    let config = DriverConfig::default()
        .with_ces(CesManagerConfig::new().with_max_ceps_per_ces(args.max_ceps_per_slice));
    let report = policyd::run(scenario, config).await.context("running scenario")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report).context("rendering report")?);
    } else {
        print!("{report}");
    }
    Ok(report.converged())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    match run(&args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            error!("Map states did not converge");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("policyd error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
