use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use wattline_collector::{Collector, Config, authenticate};

/// Wattline - streaming telemetry collector for Wattline energy monitors
#[derive(Parser)]
#[command(name = "wattline", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,wattline_collector=info",
        1 => "info,wattline_collector=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting wattline collector");

    let config = Config::from_env()?;
    config.log_summary();

    let http = reqwest::Client::new();
    let session = authenticate(
        &http,
        &config.api.api_base,
        &config.api.email,
        &config.api.password,
    )
    .await?;
    tracing::info!(
        user_id = %session.user_id,
        monitor_id = %session.monitor_id,
        "authenticated"
    );

    Collector::new(config, session).run().await?;

    Ok(())
}
