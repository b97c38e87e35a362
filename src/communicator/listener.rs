//! Client liveness listeners.

use std::fmt::{Display, Formatter};

/// Why a connection was deemed dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// The transport reported a read timeout.
    SocketTimeout,
    /// No chunk, not even a heartbeat, arrived within the heartbeat window.
    HeartbeatTimeout,
    /// The stream ended or failed.
    SocketError,
    /// The server stopped reading because the session finished or shut down.
    SessionShutdown,
    /// Protocol violation or unexpected failure in the reader.
    InternalError,
}

impl Display for DisconnectReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::SocketTimeout => "socket_timeout",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::SocketError => "socket_error",
            Self::SessionShutdown => "session_shutdown",
            Self::InternalError => "internal_error",
        };
        f.write_str(name)
    }
}

/// Handle returned on listener registration, used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

/// Notified once when the client disconnects.
///
/// Callbacks run on the connection's reader task and must not block for
/// long.
pub trait DisconnectListener: Send + Sync {
    /// The client is gone.
    fn on_disconnect(&self, reason: DisconnectReason);
}

impl<F> DisconnectListener for F
where
    F: Fn(DisconnectReason) + Send + Sync,
{
    fn on_disconnect(&self, reason: DisconnectReason) {
        self(reason);
    }
}

/// Notified on every heartbeat chunk.
pub trait HeartbeatListener: Send + Sync {
    /// A heartbeat arrived.
    fn on_heartbeat(&self);
}

impl<F> HeartbeatListener for F
where
    F: Fn() + Send + Sync,
{
    fn on_heartbeat(&self) {
        self();
    }
}
