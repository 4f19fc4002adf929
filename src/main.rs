use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use cascade_telemetry::app;
use cascade_telemetry::cli::{Cli, Commands};
use cascade_telemetry::config::SyncConfig;
use cascade_telemetry::util::setup_tracing;

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("cascade-telemetry error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<u8> {
    setup_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::load_or_init()?;
    let base_url = cli
        .base_url
        .as_deref()
        .map(|url| url.trim().trim_end_matches('/').to_string())
        .filter(|url| !url.is_empty())
        .unwrap_or_else(|| config.effective_base_url());

    match cli.command {
        Commands::Watch { session_id } => {
            app::watch(&config, &base_url, &session_id)?;
            Ok(0)
        }
        Commands::Status { session_id, json } => {
            app::print_status(&config, &base_url, &session_id, json)?;
            Ok(0)
        }
        Commands::Doctor => app::doctor(&config, &base_url),
    }
}
