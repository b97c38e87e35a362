#![forbid(unsafe_code)]

//! Persistent command server speaking the nailgun chunk protocol.

pub mod client;
pub mod communicator;
pub mod config;
pub mod errors;
pub mod nail;
pub mod protocol;
pub mod server;
pub mod session;
pub mod stats;
pub mod transport;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
