#![forbid(unsafe_code)]

//! `nailgun` — persistent command server binary.
//!
//! Loads configuration, binds the listening socket, and serves nails until
//! interrupted or asked to stop with `ng ng-stop`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use nailgun::config::GlobalConfig;
use nailgun::nail::CommandRegistry;
use nailgun::server::NailgunServer;
use nailgun::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "nailgun", about = "Persistent command server", version, long_about = None)]
struct Cli {
    /// Listening address: `port`, `ip`, `ip:port`, or `local:<name-or-path>`.
    address: Option<String>,

    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the client heartbeat timeout in milliseconds (0 disables it).
    #[arg(long)]
    heartbeat_timeout_ms: Option<u64>,

    /// Override the maximum number of cached idle sessions.
    #[arg(long)]
    max_idle_sessions: Option<usize>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("nailgun server bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };
    if let Some(address) = args.address {
        config.listen = address;
    }
    if let Some(timeout) = args.heartbeat_timeout_ms {
        config.heartbeat_timeout_ms = timeout;
    }
    if let Some(max_idle) = args.max_idle_sessions {
        config.max_idle_sessions = max_idle;
    }
    config.validate()?;
    info!(
        listen = %config.listen,
        heartbeat_timeout_ms = config.heartbeat_timeout_ms,
        max_idle_sessions = config.max_idle_sessions,
        "configuration loaded"
    );

    // ── Bind and serve ──────────────────────────────────
    let server = NailgunServer::bind(&config, CommandRegistry::with_builtins()).await?;
    let control = server.control();
    info!(address = %server.local_addr(), "nailgun server started");

    let signal_control = control.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_control.request_shutdown();
    });

    if let Err(err) = server.run().await {
        error!(%err, "nailgun server stopped with an error");
        return Err(err);
    }

    info!("nailgun server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
