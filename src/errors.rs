//! Error types shared across the server, the protocol engine and the client.

use std::fmt::{Display, Formatter};
use std::io::ErrorKind;

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Malformed or out-of-order chunk on the wire.
    Protocol(String),
    /// Transport or file-system I/O failure.
    Io(String),
    /// A bounded wait expired before the peer produced data.
    Timeout(String),
    /// Requested command or entity does not exist.
    NotFound(String),
    /// A command handler failed.
    Nail(String),
    /// Session assignment or lifecycle failure.
    Session(String),
    /// The server or session pool is shutting down, or failed to drain.
    Shutdown(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Nail(msg) => write!(f, "nail: {msg}"),
            Self::Session(msg) => write!(f, "session: {msg}"),
            Self::Shutdown(msg) => write!(f, "shutdown: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => Self::Timeout(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Io(format!("json: {err}"))
    }
}
