//! Webreplay CLI
//!
//! Records web pages against live origins and replays them under
//! simulated network conditions. Must run with enough privilege to bind
//! port 53/80 and adjust system DNS.

use std::path::Path;
use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use webreplay::config::{Cli, LogLevel};
use webreplay::{supervisor, ReplayError};

fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.log_level, cli.log_file.as_deref()) {
        eprintln!("failed to initialise logging: {e}");
        process::exit(1);
    }

    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            process::exit(e.exit_code());
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(supervisor::run(config)) {
        report_fatal(&e);
        process::exit(e.exit_code());
    }
}

fn report_fatal(e: &ReplayError) {
    match e {
        ReplayError::Privilege(_) => error!("{e} (try running with sudo)"),
        _ => error!("{e}"),
    }
}

fn init_logging(level: LogLevel, log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_filter()));
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    match log_file {
        Some(path) => {
            let file = std::fs::File::create(path)?;
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(file));
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
        }
    }
    Ok(())
}
