use chrono::Local;
use clap::Parser;
use color_eyre::{Report, Result};

mod audit;
mod config;
mod runtime;
mod sweep;

use audit::AuditLog;
use config::Config;
use runtime::{DockerRuntime, Endpoint, API_VERSION};

/// Force-remove running containers older than a configured age.
///
/// Every removal is appended to an audit log as
/// `<timestamp> <container-id> <age> minutes`.
#[derive(Parser)]
#[command(
    version,
    after_help = "\
Environment:
  DOCKER_RUNNING_TIME  Maximum container age in minutes [default: 60]
  DOCKER_CLEANUP_LOG   Audit log path [default: docker_cleanup.log]
  DOCKER_HOST          Docker daemon endpoint (unix://, tcp://, http://, npipe://)
  DOCKER_TLS_VERIFY    Use TLS for tcp:// endpoints when non-empty
  DOCKER_CERT_PATH     Directory with ca.pem, cert.pem, key.pem [default: ~/.docker]
  RUST_LOG             Diagnostic log filter [default: info]"
)]
struct Cli {}

/// Install and configure the tracing/logging system.
///
/// Diagnostics go to stderr, filtered by RUST_LOG and defaulting to 'info'.
/// The audit log is written separately and never passes through here.
fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let fmt_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

/// One reaping pass. Setup failures abort before any container is touched.
fn run() -> Result<()> {
    let config = Config::from_env()?;
    tracing::debug!("{config:?}");

    let mut audit = AuditLog::open(&config.log_path)?;

    let endpoint = Endpoint::from_env()?;
    let runtime = DockerRuntime::connect(&endpoint, &API_VERSION)?;

    let summary = sweep::sweep(&runtime, &mut audit, config.threshold_minutes, Local::now)?;
    tracing::info!(
        "Examined {} container(s): {} removed, {} skipped",
        summary.examined,
        summary.removed,
        summary.skipped
    );
    Ok(())
}

fn main() -> Result<(), Report> {
    install_tracing();
    color_eyre::install()?;

    let _cli = Cli::parse();
    run()
}
