//! Built-in nails: server management commands and a few small utilities.
//!
//! | Command      | Behavior                                                |
//! |--------------|---------------------------------------------------------|
//! | `ng-version` | Print the server version                                |
//! | `ng-stop`    | Ask the server to shut down                             |
//! | `ng-stats`   | Print per-command run statistics as JSON                |
//! | `ng-alias`   | List commands and aliases                               |
//! | `echo`       | Copy stdin to stdout                                    |
//! | `exit`       | Exit with the code given as first argument              |
//! | `hash`       | Print the SHA-2 digest of stdin                         |
//! | `heartbeat`  | Print `H` per client heartbeat until disconnect         |
//! | `dump-all`   | Print the command context                               |

use std::fmt::Write as _;
use std::time::Duration;

use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::communicator::DisconnectReason;
use crate::nail::{Completion, Nail, NailContext, NailFuture};
use crate::{AppError, Result};

const HASH_ALGORITHMS: [&str; 4] = ["sha224", "sha256", "sha384", "sha512"];

/// Exit code of `heartbeat` when the session is cancelled.
pub const HEARTBEAT_CANCELLED_EXIT: i32 = 42;

/// Register every built-in nail in `registry`.
pub fn register_all(registry: &mut super::CommandRegistry) {
    registry.register("ng-version", Version);
    registry.register("ng-stop", Stop);
    registry.register("ng-stats", Stats);
    registry.register("ng-alias", AliasList);
    registry.register("echo", Echo);
    registry.register("exit", Exit);
    registry.register("hash", Hash);
    registry.register("heartbeat", Heartbeat);
    registry.register("dump-all", DumpAll);
}

/// Prints the server version.
pub struct Version;

impl Nail for Version {
    fn run<'a>(&'a self, ctx: &'a mut NailContext) -> NailFuture<'a> {
        Box::pin(async move {
            ctx.stdout
                .write_line(&format!("nailgun server version {}", env!("CARGO_PKG_VERSION")))
                .await?;
            Ok(Completion::Returned)
        })
    }

    fn description(&self) -> &str {
        "Prints the server version"
    }
}

/// Asks the server to stop accepting connections and drain.
pub struct Stop;

impl Nail for Stop {
    fn run<'a>(&'a self, ctx: &'a mut NailContext) -> NailFuture<'a> {
        Box::pin(async move {
            info!(peer = %ctx.peer, "shutdown requested by client");
            ctx.server().request_shutdown();
            Ok(Completion::Returned)
        })
    }

    fn description(&self) -> &str {
        "Shuts down the server"
    }
}

/// Prints run statistics for every command started so far.
pub struct Stats;

impl Nail for Stats {
    fn run<'a>(&'a self, ctx: &'a mut NailContext) -> NailFuture<'a> {
        Box::pin(async move {
            let snapshot = ctx.server().stats().snapshot();
            let json = serde_json::to_string_pretty(&snapshot)?;
            ctx.stdout.write_line(&json).await?;
            Ok(Completion::Returned)
        })
    }

    fn description(&self) -> &str {
        "Prints per-command run statistics"
    }
}

/// Lists registered commands and aliases.
pub struct AliasList;

impl Nail for AliasList {
    fn run<'a>(&'a self, ctx: &'a mut NailContext) -> NailFuture<'a> {
        Box::pin(async move {
            let mut listing = String::new();
            for name in ctx.registry().names() {
                let description = ctx.registry().description(name).unwrap_or_default();
                let _ = writeln!(listing, "{name:<16}{description}");
            }
            for (alias, target) in ctx.registry().aliases() {
                let _ = writeln!(listing, "{alias:<16}-> {target}");
            }
            ctx.stdout.write_all(listing.as_bytes()).await?;
            Ok(Completion::Returned)
        })
    }

    fn description(&self) -> &str {
        "Lists commands and aliases"
    }
}

/// Copies stdin to stdout.
pub struct Echo;

impl Nail for Echo {
    fn run<'a>(&'a self, ctx: &'a mut NailContext) -> NailFuture<'a> {
        Box::pin(async move {
            let mut buf = vec![0_u8; 1024];
            loop {
                let n = ctx.stdin.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                ctx.stdout.write_all(&buf[..n]).await?;
            }
            Ok(Completion::Returned)
        })
    }

    fn description(&self) -> &str {
        "Echoes stdin to stdout"
    }
}

/// Exits with the code given as first argument.
pub struct Exit;

impl Nail for Exit {
    fn run<'a>(&'a self, ctx: &'a mut NailContext) -> NailFuture<'a> {
        Box::pin(async move {
            let code = ctx
                .arguments
                .first()
                .and_then(|arg| arg.trim().parse::<i32>().ok())
                .unwrap_or(0);
            Ok(ctx.exit(code).await)
        })
    }

    fn description(&self) -> &str {
        "Exits with the given code"
    }
}

/// Prints the SHA-2 digest of stdin.
pub struct Hash;

impl Hash {
    fn hasher(algorithm: &str) -> Result<Box<dyn sha2::digest::DynDigest + Send>> {
        match algorithm.to_ascii_lowercase().replace('-', "").as_str() {
            "sha224" => Ok(Box::new(Sha224::new())),
            "sha256" => Ok(Box::new(Sha256::new())),
            "sha384" => Ok(Box::new(Sha384::new())),
            "sha512" => Ok(Box::new(Sha512::new())),
            _ => Err(AppError::Nail(format!(
                "unknown hash algorithm '{algorithm}'"
            ))),
        }
    }
}

impl Nail for Hash {
    fn run<'a>(&'a self, ctx: &'a mut NailContext) -> NailFuture<'a> {
        Box::pin(async move {
            let Some(algorithm) = ctx.arguments.first().cloned() else {
                for name in HASH_ALGORITHMS {
                    ctx.stdout.write_line(name).await?;
                }
                return Ok(Completion::Returned);
            };

            let mut hasher = Self::hasher(&algorithm)?;
            let mut buf = vec![0_u8; 1024];
            loop {
                let n = ctx.stdin.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }

            let digest = hasher.finalize();
            let mut hex = String::with_capacity(digest.len() * 2);
            for byte in digest.iter() {
                let _ = write!(hex, "{byte:02x}");
            }
            ctx.stdout.write_line(&hex).await?;
            Ok(Completion::Returned)
        })
    }

    fn description(&self) -> &str {
        "Prints the SHA-2 digest of stdin"
    }
}

/// Prints `H` for every client heartbeat until the client disconnects.
///
/// An optional first argument bounds the run time in milliseconds.
pub struct Heartbeat;

impl Nail for Heartbeat {
    fn run<'a>(&'a self, ctx: &'a mut NailContext) -> NailFuture<'a> {
        Box::pin(async move {
            let budget = ctx
                .arguments
                .first()
                .and_then(|arg| arg.trim().parse::<u64>().ok())
                .map(Duration::from_millis);

            let (beat_tx, mut beat_rx) = mpsc::unbounded_channel();
            let (gone_tx, mut gone_rx) = oneshot::channel();
            let gone_tx = std::sync::Mutex::new(Some(gone_tx));

            let heartbeat_id = ctx.add_heartbeat_listener(move || {
                let _ = beat_tx.send(());
            });
            let disconnect_id = ctx.add_disconnect_listener(move |reason: DisconnectReason| {
                let sender = gone_tx
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .take();
                if let Some(sender) = sender {
                    let _ = sender.send(reason);
                }
            });

            let deadline = async {
                match budget {
                    Some(budget) => tokio::time::sleep(budget).await,
                    None => std::future::pending().await,
                }
            };
            tokio::pin!(deadline);

            let completion = loop {
                tokio::select! {
                    biased;
                    () = ctx.cancelled() => break Completion::Exit(HEARTBEAT_CANCELLED_EXIT),
                    reason = &mut gone_rx => {
                        debug!(reason = ?reason.ok(), "heartbeat nail saw client disconnect");
                        break Completion::Returned;
                    }
                    () = &mut deadline => break Completion::Returned,
                    Some(()) = beat_rx.recv() => {
                        if ctx.stdout.write_all(b"H").await.is_err() {
                            break Completion::Returned;
                        }
                    }
                }
            };

            ctx.remove_heartbeat_listener(heartbeat_id);
            ctx.remove_disconnect_listener(disconnect_id);
            Ok(completion)
        })
    }

    fn description(&self) -> &str {
        "Prints H for every heartbeat until disconnect"
    }
}

/// Prints the command context.
pub struct DumpAll;

impl Nail for DumpAll {
    fn run<'a>(&'a self, ctx: &'a mut NailContext) -> NailFuture<'a> {
        Box::pin(async move {
            let mut out = String::new();
            let _ = writeln!(out, "command: {}", ctx.command);
            let _ = writeln!(out, "peer: {}", ctx.peer);
            let _ = writeln!(out, "working directory: {}", ctx.working_directory);
            let _ = writeln!(out, "arguments:");
            for (index, arg) in ctx.arguments.iter().enumerate() {
                let _ = writeln!(out, "  args[{index}]={arg}");
            }
            let _ = writeln!(out, "environment:");
            let mut entries: Vec<(&str, &str)> = ctx.environment.iter().collect();
            entries.sort_unstable();
            for (key, value) in entries {
                let _ = writeln!(out, "  env[\"{key}\"]={value}");
            }
            ctx.stdout.write_all(out.as_bytes()).await?;
            Ok(Completion::Returned)
        })
    }

    fn description(&self) -> &str {
        "Prints the command context"
    }
}
