//! trainlog-server: training session telemetry recorder.
//!
//! Buffers GPS fixes and step counts per session, periodically buckets them
//! and rewrites each session's artifact. Commands arrive one per line on
//! stdin; responses go to stdout and logs to stderr.

mod command;
mod config;
mod session;
mod store;

use clap::Parser;
use config::ServerConfig;
use session::SessionRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use store::ArtifactStore;
use tokio::io::BufReader;
use tracing::{error, info, warn};

/// trainlog-server — training session telemetry recorder
#[derive(Parser, Debug)]
#[command(name = "trainlog-server", version, about = "Training session telemetry recorder")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.trainlog/config.toml")]
    config: String,

    /// Directory for session artifacts
    #[arg(long)]
    data_dir: Option<String>,

    /// Flush period in milliseconds
    #[arg(long)]
    flush_period_ms: Option<u64>,

    /// Bucket width in seconds
    #[arg(long)]
    bucket_secs: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting trainlog-server");

    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(
        Some(config_path.as_path()),
        cli.data_dir.as_deref(),
        cli.flush_period_ms,
        cli.bucket_secs,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let store = match ArtifactStore::open(&server_config.data_dir) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(path = %server_config.data_dir.display(), error = %e, "failed to open data dir");
            std::process::exit(1);
        }
    };
    info!(
        data_dir = %store.dir().display(),
        period_ms = server_config.flush.period.as_millis() as u64,
        bucket_secs = server_config.flush.bucket_width.get(),
        "artifact store ready"
    );

    let registry = SessionRegistry::new(store, server_config.flush);

    let input = BufReader::new(tokio::io::stdin());
    let output = tokio::io::stdout();

    tokio::select! {
        result = command::serve(&registry, input, output) => {
            match result {
                Ok(()) => info!("input closed"),
                Err(e) => error!(error = %e, "command loop failed"),
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    let report = registry.end_all().await;
    for (id, e) in &report.failures {
        warn!(session_id = %id, error = %e, "session not flushed on shutdown");
    }

    info!("trainlog-server stopped");
    // Exit explicitly: a pending stdin read would otherwise hold up runtime shutdown.
    std::process::exit(if report.failures.is_empty() { 0 } else { 1 });
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
