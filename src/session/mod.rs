//! Session workers.
//!
//! A [`Session`] is a long-lived task that serves one connection at a time:
//! it waits for a stream on its single-slot assignment queue, reads the
//! command header, runs the resolved nail, sends the exit code, closes the
//! connection and returns itself to its [`SessionPool`].

pub mod pool;

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

pub use pool::SessionPool;

use crate::communicator::Communicator;
use crate::nail::{CommandRegistry, NailContext, EXIT_EXCEPTION, EXIT_NO_SUCH_COMMAND};
use crate::protocol::CommandContext;
use crate::server::ServerControl;
use crate::transport::ClientStream;
use crate::{AppError, Result};

use pool::PoolInner;

/// Collaborators every session needs.
pub struct SessionDeps {
    /// Command lookup.
    pub registry: Arc<CommandRegistry>,
    /// Heartbeat timeout handed to each communicator.
    pub heartbeat_timeout: Duration,
    /// Server controls and statistics.
    pub server: ServerControl,
}

impl SessionDeps {
    /// Bundle session collaborators.
    #[must_use]
    pub fn new(
        registry: Arc<CommandRegistry>,
        heartbeat_timeout: Duration,
        server: ServerControl,
    ) -> Self {
        Self {
            registry,
            heartbeat_timeout,
            server,
        }
    }
}

struct SessionInner {
    id: u64,
    assign_tx: mpsc::Sender<ClientStream>,
    shutdown: CancellationToken,
    /// Cancelled when the worker task ends, however it ends.
    stopped: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap handle to a session worker.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Start a session worker task.
    pub(crate) fn spawn(id: u64, deps: Arc<SessionDeps>, pool: Weak<PoolInner>) -> Self {
        let (assign_tx, assign_rx) = mpsc::channel(1);
        let session = Self {
            inner: Arc::new(SessionInner {
                id,
                assign_tx,
                shutdown: CancellationToken::new(),
                stopped: CancellationToken::new(),
                task: Mutex::new(None),
            }),
        };

        let stopped = session.inner.stopped.clone().drop_guard();
        let worker = run(session.clone(), assign_rx, deps, pool);
        let task = tokio::spawn(
            async move {
                let _stopped = stopped;
                worker.await;
            }
            .instrument(info_span!("session", session_id = id)),
        );
        *session
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
        session
    }

    /// Pool-assigned identifier.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Hand a connection to this session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Session` if a connection is already queued or the
    /// session has stopped.
    pub fn assign(&self, stream: ClientStream) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(AppError::Session(format!(
                "session {} is shut down",
                self.inner.id
            )));
        }
        self.inner.assign_tx.try_send(stream).map_err(|err| {
            AppError::Session(format!(
                "session {} cannot take a connection: {err}",
                self.inner.id
            ))
        })
    }

    /// Stop the worker: wake an idle wait and cancel a running nail.
    pub fn shutdown(&self) {
        debug!(session_id = self.inner.id, "session shutdown requested");
        self.inner.shutdown.cancel();
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Wait for the worker task to end.
    ///
    /// Dropping this future early leaves the session joinable.
    pub async fn join(&self) {
        self.inner.stopped.cancelled().await;
        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                error!(session_id = self.inner.id, %err, "session task failed");
            }
        }
    }

    /// Whether the worker task is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.inner.stopped.is_cancelled()
    }
}

async fn run(
    session: Session,
    mut assignments: mpsc::Receiver<ClientStream>,
    deps: Arc<SessionDeps>,
    pool: Weak<PoolInner>,
) {
    debug!("session waiting for first connection");
    let shutdown = session.inner.shutdown.clone();

    loop {
        let stream = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            next = assignments.recv() => match next {
                Some(stream) => stream,
                None => break,
            },
        };

        let connection_id = uuid::Uuid::new_v4();
        serve(stream, &deps, &shutdown)
            .instrument(info_span!("connection", %connection_id))
            .await;

        match pool.upgrade() {
            Some(pool) => pool.give(session.clone()),
            None => break,
        }
    }

    debug!("session stopped");
}

/// Serve one connection from header to close.
async fn serve(stream: ClientStream, deps: &SessionDeps, shutdown: &CancellationToken) {
    let peer = stream.peer;
    debug!(%peer, "connection accepted");

    let mut comm = Communicator::new(stream, deps.heartbeat_timeout);
    match comm.read_command_context().await {
        Ok(context) => {
            let comm = Arc::new(comm);
            let exit_code = run_nail(context, &comm, deps, shutdown).await;
            comm.exit(exit_code).await;
            comm.close().await;
        }
        Err(err) => {
            warn!(%peer, %err, "failed to read command header");
            comm.exit(EXIT_EXCEPTION).await;
            comm.close().await;
        }
    }
}

/// Resolve and run the nail, translating its outcome into an exit code.
async fn run_nail(
    context: CommandContext,
    comm: &Arc<Communicator>,
    deps: &SessionDeps,
    shutdown: &CancellationToken,
) -> i32 {
    let command = context.command.clone();
    let Some(nail) = deps.registry.resolve(&command) else {
        warn!(%command, "no such command");
        return EXIT_NO_SUCH_COMMAND;
    };

    info!(%command, arguments = context.arguments.len(), "running command");
    deps.server.stats().started(&command);

    let mut ctx = NailContext::new(
        context,
        Arc::clone(comm),
        shutdown.child_token(),
        deps.server.clone(),
        Arc::clone(&deps.registry),
    );
    let task = tokio::spawn(async move { nail.run(&mut ctx).await }.in_current_span());

    let exit_code = match task.await {
        Ok(Ok(completion)) => completion.exit_code(),
        Ok(Err(err)) => {
            warn!(%command, %err, "command failed");
            EXIT_EXCEPTION
        }
        Err(err) => {
            error!(%command, %err, "command panicked");
            EXIT_EXCEPTION
        }
    };

    deps.server.stats().finished(&command);
    info!(%command, exit_code, "command finished");
    exit_code
}
