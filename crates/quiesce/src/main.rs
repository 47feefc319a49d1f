//! `quiesce` — minimal PID-1 supervisor for containers.
//!
//! Runs one application, exposes a lifecycle-aware health endpoint, drains
//! TCP connections before stopping, and reaps orphaned descendants.

use std::process::ExitCode;

use clap::Parser;
use tracing::{Level, error, info};

use quiesce::config::Config;
use quiesce::supervisor;

#[derive(Parser)]
#[command(name = "quiesce", version, about = "Run one application as PID 1 with draining shutdown")]
struct Cli {
    /// Application command to run under supervision. Left optional here so
    /// an empty command surfaces as a supervisor error (exit code 1), not a
    /// usage error.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    config.app.command = cli.command;

    init_tracing(&config.log_level);
    info!(version = env!("CARGO_PKG_VERSION"), "starting quiesce");
    info!(command = ?config.app.command, "application command");

    match supervisor::run(config).await {
        Ok(()) => {
            info!("supervisor shutting down");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "supervisor error");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(level: &str) {
    let level = match level.to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    tracing_subscriber::fmt().with_max_level(level).init();
}
