#![forbid(unsafe_code)]

//! `ng` — command-line client for the `nailgun` server.
//!
//! Sends the command, its arguments, the local environment and working
//! directory to the server, streams stdin/stdout/stderr, and exits with the
//! code the server reports.

use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use nailgun::client::{
    self, CommandRequest, CLIENT_CONNECTION_BROKEN, CLIENT_CONNECT_FAILED,
    CLIENT_UNEXPECTED_CHUNK,
};
use nailgun::transport::ListenAddress;
use nailgun::AppError;

#[derive(Debug, Parser)]
#[command(name = "ng", about = "Run a command on a nailgun server", version, long_about = None)]
struct Cli {
    /// Server address: `port`, `ip`, `ip:port`, or `local:<name-or-path>`.
    #[arg(long, default_value = "127.0.0.1:2113")]
    server: ListenAddress,

    /// Interval between heartbeats in milliseconds (0 disables them).
    #[arg(long, default_value_t = 500)]
    heartbeat_interval_ms: u64,

    /// Command (or alias) to run.
    command: String,

    /// Arguments passed to the command.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn main() {
    let cli = Cli::parse();
    init_tracing();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("ng: failed to build tokio runtime: {err}");
            std::process::exit(CLIENT_CONNECT_FAILED);
        }
    };

    let code = runtime.block_on(run(cli));
    // Stdin forwarding may still be parked on a blocking read.
    runtime.shutdown_timeout(Duration::from_millis(100));
    std::process::exit(code);
}

async fn run(cli: Cli) -> i32 {
    let stream = match client::connect(&cli.server).await {
        Ok(stream) => stream,
        Err(err) => {
            eprintln!("ng: {err}");
            return CLIENT_CONNECT_FAILED;
        }
    };

    let request = build_request(cli.command, cli.args);
    match client::run_command(
        stream,
        &request,
        Duration::from_millis(cli.heartbeat_interval_ms),
        tokio::io::stdin(),
        tokio::io::stdout(),
        tokio::io::stderr(),
    )
    .await
    {
        Ok(code) => code,
        Err(err @ AppError::Protocol(_)) => {
            eprintln!("ng: {err}");
            CLIENT_UNEXPECTED_CHUNK
        }
        Err(err) => {
            eprintln!("ng: {err}");
            CLIENT_CONNECTION_BROKEN
        }
    }
}

fn build_request(command: String, arguments: Vec<String>) -> CommandRequest {
    let mut environment: Vec<(String, String)> = std::env::vars().collect();
    environment.push((
        "NAILGUN_FILESEPARATOR".into(),
        std::path::MAIN_SEPARATOR.to_string(),
    ));
    environment.push((
        "NAILGUN_PATHSEPARATOR".into(),
        if cfg!(windows) { ";" } else { ":" }.into(),
    ));

    let working_directory = std::env::current_dir()
        .map(|dir| dir.to_string_lossy().into_owned())
        .unwrap_or_default();

    CommandRequest {
        command,
        arguments,
        environment,
        working_directory,
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}
