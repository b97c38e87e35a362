//! Transport abstraction.
//!
//! The protocol engine only needs a duplex byte stream. This module wraps
//! TCP and local sockets (Unix domain sockets or Windows named pipes, via
//! `interprocess`) behind [`ClientStream`] and [`Listener`].

pub mod address;

use std::fmt::{Display, Formatter};
use std::net::SocketAddr;

use interprocess::local_socket::tokio::prelude::*;
use interprocess::local_socket::tokio::{Listener as LocalListener, Stream as LocalStream};
use interprocess::local_socket::{
    GenericFilePath, GenericNamespaced, ListenerOptions, Name, ToFsName, ToNsName,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::info;

pub use address::{ListenAddress, DEFAULT_PORT};

use crate::{AppError, Result};

/// Any byte stream usable as a nailgun connection.
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T> DuplexStream for T where T: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

/// Remote end of a connection, as far as the transport can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAddr {
    /// TCP peer.
    Tcp(SocketAddr),
    /// Local socket or named pipe peer.
    Local,
    /// In-memory or otherwise anonymous stream.
    Unknown,
}

impl Display for PeerAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            Self::Local => f.write_str("local"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// An accepted (or connected) stream plus its peer address.
pub struct ClientStream {
    /// Underlying byte stream.
    pub io: Box<dyn DuplexStream>,
    /// Remote end.
    pub peer: PeerAddr,
}

impl ClientStream {
    /// Wrap an arbitrary stream.
    pub fn new(io: impl DuplexStream + 'static, peer: PeerAddr) -> Self {
        Self {
            io: Box::new(io),
            peer,
        }
    }
}

impl std::fmt::Debug for ClientStream {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientStream")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// Convert a local socket name into an `interprocess` name.
///
/// Values containing a path separator are filesystem paths; anything else
/// goes into the platform's socket namespace.
///
/// # Errors
///
/// Returns `AppError::Config` if the platform rejects the name.
pub fn local_socket_name(name: &str) -> Result<Name<'_>> {
    let converted = if name.contains('/') || name.contains('\\') {
        name.to_fs_name::<GenericFilePath>()
    } else {
        name.to_ns_name::<GenericNamespaced>()
    };
    converted.map_err(|err| AppError::Config(format!("invalid local socket name '{name}': {err}")))
}

/// Bound server socket.
pub enum Listener {
    /// TCP listener.
    Tcp(TcpListener),
    /// Local socket listener.
    Local(LocalListener),
}

impl Listener {
    /// Bind `address`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the socket cannot be bound.
    pub async fn bind(address: &ListenAddress) -> Result<Self> {
        match address {
            ListenAddress::Tcp(addr) => {
                let listener = TcpListener::bind(addr)
                    .await
                    .map_err(|err| AppError::Io(format!("failed to bind {addr}: {err}")))?;
                info!(address = %addr, "tcp listener bound");
                Ok(Self::Tcp(listener))
            }
            ListenAddress::Local(name) => {
                let listener = ListenerOptions::new()
                    .name(local_socket_name(name)?)
                    .create_tokio()
                    .map_err(|err| {
                        AppError::Io(format!("failed to create local listener '{name}': {err}"))
                    })?;
                info!(name = %name, "local socket listener bound");
                Ok(Self::Local(listener))
            }
        }
    }

    /// Actual bound address; resolves port 0 for TCP.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the OS cannot report the address.
    pub fn local_addr(&self, configured: &ListenAddress) -> Result<ListenAddress> {
        match self {
            Self::Tcp(listener) => Ok(ListenAddress::Tcp(listener.local_addr()?)),
            Self::Local(_) => Ok(configured.clone()),
        }
    }

    /// Wait for the next client.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if accepting fails.
    pub async fn accept(&self) -> Result<ClientStream> {
        match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(ClientStream::new(stream, PeerAddr::Tcp(peer)))
            }
            Self::Local(listener) => {
                let stream = listener.accept().await?;
                Ok(ClientStream::new(stream, PeerAddr::Local))
            }
        }
    }
}

/// Open a client connection to `address`.
///
/// # Errors
///
/// Returns `AppError::Io` if the connection cannot be established.
pub async fn connect(address: &ListenAddress) -> Result<ClientStream> {
    match address {
        ListenAddress::Tcp(addr) => {
            let stream = TcpStream::connect(addr)
                .await
                .map_err(|err| AppError::Io(format!("failed to connect to {addr}: {err}")))?;
            stream.set_nodelay(true)?;
            Ok(ClientStream::new(stream, PeerAddr::Tcp(*addr)))
        }
        ListenAddress::Local(name) => {
            let stream = LocalStream::connect(local_socket_name(name)?)
                .await
                .map_err(|err| AppError::Io(format!("failed to connect to '{name}': {err}")))?;
            Ok(ClientStream::new(stream, PeerAddr::Local))
        }
    }
}
