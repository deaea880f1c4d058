mod app;
mod dashboard;
mod process;
mod shutdown;

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use common::config::{load_config, BridgeConfig};

/// Bridges heart-rate telemetry to an actuator device.
#[derive(Parser, Debug)]
#[command(name = "heart-rate-bridge")]
#[command(version)]
#[command(about = "Drive an actuator from live heart-rate telemetry")]
struct Cli {
    /// TOML config file; defaults are used when omitted
    #[arg(short, long, env = "HRB_CONFIG")]
    config: Option<String>,

    /// Engage below this bpm, disengage at or above it
    #[arg(long, env = "HRB_THRESHOLD")]
    threshold: Option<u32>,

    /// Port for telemetry producers
    #[arg(long, env = "HRB_TELEMETRY_PORT")]
    telemetry_port: Option<u16>,

    /// Port for the dashboard socket
    #[arg(long, env = "HRB_DASHBOARD_PORT")]
    dashboard_port: Option<u16>,

    /// Actuator control service URL
    #[arg(long, env = "HRB_ACTUATOR_URL")]
    actuator_url: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn build_config(cli: &Cli) -> Result<BridgeConfig> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => BridgeConfig::default(),
    };
    if let Some(threshold) = cli.threshold {
        config.heart_rate_threshold = threshold;
    }
    if let Some(port) = cli.telemetry_port {
        config.telemetry_port = port;
    }
    if let Some(port) = cli.dashboard_port {
        config.dashboard_port = port;
    }
    if let Some(url) = &cli.actuator_url {
        config.actuator_url = url.clone();
    }
    config.validate()?;
    Ok(config)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {e:#}");
            return ExitCode::from(1);
        }
    };

    // Everything runs cooperatively on one thread.
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to start runtime: {e}");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(app::run(config)) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(1)
        }
    }
}
