//! Accept loop and server-wide controls.
//!
//! [`NailgunServer`] binds the configured address, hands every accepted
//! connection to a pooled [`Session`](crate::session::Session), and drains
//! the pool when its [`ServerControl`] is asked to stop.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::GlobalConfig;
use crate::nail::CommandRegistry;
use crate::session::{SessionDeps, SessionPool};
use crate::stats::NailStatsRegistry;
use crate::transport::{ClientStream, ListenAddress, Listener};
use crate::Result;

/// Handle for stopping the server and reading its statistics.
#[derive(Clone, Default)]
pub struct ServerControl {
    shutdown: CancellationToken,
    stats: Arc<NailStatsRegistry>,
}

impl ServerControl {
    /// New control with no shutdown requested.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the server to stop accepting and drain its sessions.
    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once shutdown is requested.
    pub async fn shutdown_requested(&self) {
        self.shutdown.cancelled().await;
    }

    /// Per-command statistics.
    #[must_use]
    pub fn stats(&self) -> &NailStatsRegistry {
        &self.stats
    }
}

/// Bound nailgun server.
pub struct NailgunServer {
    listener: Listener,
    address: ListenAddress,
    pool: SessionPool,
    control: ServerControl,
}

impl NailgunServer {
    /// Bind the configured address and prepare the session pool.
    ///
    /// Aliases from the configuration are added to `registry`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for an invalid address or alias, and
    /// `AppError::Io` if binding fails.
    pub async fn bind(config: &GlobalConfig, mut registry: CommandRegistry) -> Result<Self> {
        for (alias, target) in &config.aliases {
            registry.alias(alias.clone(), target)?;
        }

        let configured = config.listen_address()?;
        let listener = Listener::bind(&configured).await?;
        let address = listener.local_addr(&configured)?;

        let control = ServerControl::new();
        let deps = SessionDeps::new(
            Arc::new(registry),
            config.heartbeat_timeout(),
            control.clone(),
        );
        let pool = SessionPool::new(
            config.max_idle_sessions,
            config.session_termination_timeout(),
            deps,
        );

        Ok(Self {
            listener,
            address,
            pool,
            control,
        })
    }

    /// Address actually bound; resolves an ephemeral TCP port.
    #[must_use]
    pub fn local_addr(&self) -> &ListenAddress {
        &self.address
    }

    /// Control handle for this server.
    #[must_use]
    pub fn control(&self) -> ServerControl {
        self.control.clone()
    }

    /// Session pool, mostly for inspection.
    #[must_use]
    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    /// Accept connections until shutdown is requested, then drain the pool.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Shutdown` if sessions fail to stop in time.
    pub async fn run(self) -> Result<()> {
        let span = info_span!("nailgun_server", address = %self.address);
        async move {
            info!("nailgun server accepting connections");
            loop {
                tokio::select! {
                    biased;
                    () = self.control.shutdown_requested() => {
                        info!("nailgun server shutting down");
                        break;
                    }
                    accepted = self.listener.accept() => {
                        match accepted {
                            Ok(stream) => self.dispatch(stream),
                            Err(err) => warn!(%err, "accept failed"),
                        }
                    }
                }
            }

            drop(self.listener);
            remove_socket_file(&self.address);
            self.pool.shutdown().await.map_err(|err| {
                error!(%err, "session pool did not drain");
                err
            })?;
            info!("nailgun server stopped");
            Ok(())
        }
        .instrument(span)
        .await
    }

    fn dispatch(&self, stream: ClientStream) {
        let peer = stream.peer;
        match self.pool.take() {
            Ok(session) => {
                if let Err(err) = session.assign(stream) {
                    warn!(%peer, %err, "dropping connection");
                    self.pool.give(session);
                }
            }
            Err(err) => warn!(%peer, %err, "dropping connection"),
        }
    }
}

/// Unlink a filesystem-path local socket left behind by the listener.
#[cfg(unix)]
fn remove_socket_file(address: &ListenAddress) {
    let ListenAddress::Local(name) = address else {
        return;
    };
    if !name.contains('/') {
        return;
    }
    match std::fs::remove_file(name) {
        Ok(()) => debug!(path = %name, "removed local socket file"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %name, %err, "failed to remove local socket file"),
    }
}

#[cfg(not(unix))]
fn remove_socket_file(_address: &ListenAddress) {}
