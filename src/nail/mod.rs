//! Command handlers ("nails") and the context they run in.
//!
//! A nail receives everything it needs through an explicit
//! [`NailContext`]: arguments, environment, working directory, stdio
//! handles backed by the connection, and an exit callback. Nothing is
//! redirected process-wide.

pub mod builtins;
pub mod io;
pub mod registry;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

pub use io::{NailInput, NailOutput};
pub use registry::CommandRegistry;

use crate::communicator::{
    Communicator, DisconnectListener, HeartbeatListener, ListenerId,
};
use crate::protocol::{ChunkType, CommandContext, Environment};
use crate::server::ServerControl;
use crate::transport::PeerAddr;
use crate::Result;

/// Exit code sent after a nail returns normally.
pub const EXIT_SUCCESS: i32 = 0;

/// Exit code sent when the command is not registered.
pub const EXIT_NO_SUCH_COMMAND: i32 = 898;

/// Exit code sent when a nail fails or panics.
pub const EXIT_EXCEPTION: i32 = 899;

/// How a nail finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Returned normally; exit code 0.
    Returned,
    /// Exited explicitly with the given code.
    Exit(i32),
}

impl Completion {
    /// Exit code reported to the client.
    #[must_use]
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Returned => EXIT_SUCCESS,
            Self::Exit(code) => code,
        }
    }
}

/// Boxed future returned by [`Nail::run`].
pub type NailFuture<'a> = Pin<Box<dyn Future<Output = Result<Completion>> + Send + 'a>>;

/// A server-resident command.
///
/// Returning `Err` (or panicking) reports [`EXIT_EXCEPTION`] to the client.
pub trait Nail: Send + Sync {
    /// Run the command to completion.
    fn run<'a>(&'a self, ctx: &'a mut NailContext) -> NailFuture<'a>;

    /// One-line description shown by `ng-alias`.
    fn description(&self) -> &str {
        ""
    }
}

/// Everything a running nail can see and touch.
pub struct NailContext {
    /// Command name as sent by the client (possibly an alias).
    pub command: String,
    /// Command-line arguments.
    pub arguments: Vec<String>,
    /// Client environment.
    pub environment: Environment,
    /// Client working directory.
    pub working_directory: String,
    /// Client address.
    pub peer: PeerAddr,
    /// Client stdin.
    pub stdin: NailInput,
    /// Client stdout.
    pub stdout: NailOutput,
    /// Client stderr.
    pub stderr: NailOutput,
    comm: Arc<Communicator>,
    cancel: CancellationToken,
    server: ServerControl,
    registry: Arc<CommandRegistry>,
}

impl NailContext {
    /// Build the context for one invocation.
    #[must_use]
    pub fn new(
        context: CommandContext,
        comm: Arc<Communicator>,
        cancel: CancellationToken,
        server: ServerControl,
        registry: Arc<CommandRegistry>,
    ) -> Self {
        Self {
            command: context.command,
            arguments: context.arguments,
            environment: context.environment,
            working_directory: context.working_directory,
            peer: comm.peer(),
            stdin: NailInput::new(Arc::clone(&comm), cancel.clone()),
            stdout: NailOutput::new(Arc::clone(&comm), ChunkType::Stdout),
            stderr: NailOutput::new(Arc::clone(&comm), ChunkType::Stderr),
            comm,
            cancel,
            server,
            registry,
        }
    }

    /// Send `code` to the client now and end the connection.
    ///
    /// Return the resulting [`Completion`] from the nail; the session will
    /// not overwrite the code.
    pub async fn exit(&self, code: i32) -> Completion {
        self.comm.exit(code).await;
        Completion::Exit(code)
    }

    /// Whether the client is still connected.
    #[must_use]
    pub fn is_client_connected(&self) -> bool {
        self.comm.is_client_connected()
    }

    /// See [`Communicator::add_disconnect_listener`].
    pub fn add_disconnect_listener(
        &self,
        listener: impl DisconnectListener + 'static,
    ) -> ListenerId {
        self.comm.add_disconnect_listener(listener)
    }

    /// See [`Communicator::remove_disconnect_listener`].
    pub fn remove_disconnect_listener(&self, id: ListenerId) -> bool {
        self.comm.remove_disconnect_listener(id)
    }

    /// See [`Communicator::add_heartbeat_listener`].
    pub fn add_heartbeat_listener(&self, listener: impl HeartbeatListener + 'static) -> ListenerId {
        self.comm.add_heartbeat_listener(listener)
    }

    /// See [`Communicator::remove_heartbeat_listener`].
    pub fn remove_heartbeat_listener(&self, id: ListenerId) -> bool {
        self.comm.remove_heartbeat_listener(id)
    }

    /// Resolves when the session is shutting down.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Whether the session asked this nail to stop.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Server-wide controls and statistics.
    #[must_use]
    pub fn server(&self) -> &ServerControl {
        &self.server
    }

    /// Commands known to this server.
    #[must_use]
    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }
}
