//! Process entry point: parse CLI flags, initialize logging, bind the
//! control socket, optionally autostart, then serve the control plane
//! until a client sends `exit` or the process is signaled.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer};

use desyncd::cli::{Cli, LogFormat};
use desyncd::control::ControlPlane;
use desyncd::firewall::IptablesFirewall;

fn build_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initializes the global subscriber: stderr always, plus an appended copy
/// to `--log-file` when given, matching the reference daemon's
/// always-on log file without giving up structured logging.
fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let stderr_layer = match cli.log_format {
        LogFormat::Json => stderr_layer.json().boxed(),
        LogFormat::Pretty => stderr_layer.boxed(),
    };

    let registry = tracing_subscriber::registry()
        .with(build_filter())
        .with(stderr_layer);

    if let Some(path) = &cli.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .json();
        registry.with(file_layer).init();
    } else {
        registry.init();
    }

    Ok(())
}

fn write_pid_file(path: &std::path::Path) -> anyhow::Result<()> {
    std::fs::write(path, std::process::id().to_string())
        .with_context(|| format!("failed to write pid file {}", path.display()))
}

fn remove_pid_file(path: &std::path::Path) {
    let _ = std::fs::remove_file(path);
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    write_pid_file(&cli.pid_file)?;

    let plane = Arc::new(ControlPlane::new(
        cli.queue_num,
        Box::new(IptablesFirewall::new()),
        cli.initial_settings(),
    ));

    let listener = ControlPlane::bind_socket(&cli.socket_path)
        .with_context(|| format!("failed to bind control socket {}", cli.socket_path.display()))?;
    plane.set_cleanup_paths(cli.pid_file.clone(), cli.socket_path.clone());

    if cli.autostart {
        plane
            .autostart()
            .map_err(|reason| anyhow::anyhow!("autostart failed: {reason}"))?;
    }

    tracing::info!(socket = %cli.socket_path.display(), queue = cli.queue_num, "desyncd ready");
    plane.accept_loop(listener);

    remove_pid_file(&cli.pid_file);
    Ok(())
}

fn main() {
    if let Err(err) = run() {
        tracing::error!(%err, "desyncd exiting after fatal error");
        eprintln!("desyncd: {err:#}");
        std::process::exit(1);
    }
}
