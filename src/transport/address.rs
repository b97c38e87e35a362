//! Listening address parsing.
//!
//! Accepted forms:
//!
//! | Input               | Meaning                                  |
//! |---------------------|------------------------------------------|
//! | `2113`              | TCP, all interfaces, given port          |
//! | `10.0.0.5`          | TCP, given interface, [`DEFAULT_PORT`]   |
//! | `10.0.0.5:2200`     | TCP, given interface and port            |
//! | `[::1]:2200`        | TCP over IPv6                            |
//! | `local:/tmp/ng.sock`| Local socket at a filesystem path        |
//! | `local:nailgun`     | Namespaced local socket / named pipe     |

use std::fmt::{Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use crate::AppError;

/// Default TCP port.
pub const DEFAULT_PORT: u16 = 2113;

const LOCAL_PREFIX: &str = "local:";

/// Where the server listens, or where the client connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddress {
    /// TCP socket address.
    Tcp(SocketAddr),
    /// Local socket name or path.
    Local(String),
}

impl Default for ListenAddress {
    fn default() -> Self {
        Self::Tcp(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            DEFAULT_PORT,
        ))
    }
}

impl FromStr for ListenAddress {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(AppError::Config("empty listen address".into()));
        }

        if let Some(name) = raw.strip_prefix(LOCAL_PREFIX) {
            if name.is_empty() {
                return Err(AppError::Config(
                    "local socket address needs a name or path".into(),
                ));
            }
            return Ok(Self::Local(name.to_owned()));
        }

        if let Ok(port) = raw.parse::<u16>() {
            return Ok(Self::Tcp(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                port,
            )));
        }

        if let Ok(ip) = raw.parse::<IpAddr>() {
            return Ok(Self::Tcp(SocketAddr::new(ip, DEFAULT_PORT)));
        }

        raw.parse::<SocketAddr>()
            .map(Self::Tcp)
            .map_err(|err| AppError::Config(format!("invalid listen address '{raw}': {err}")))
    }
}

impl Display for ListenAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            Self::Local(name) => write!(f, "{LOCAL_PREFIX}{name}"),
        }
    }
}
