//! Server configuration parsing and validation.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::transport::ListenAddress;
use crate::{AppError, Result};

fn default_listen() -> String {
    "127.0.0.1:2113".into()
}

fn default_heartbeat_timeout_ms() -> u64 {
    10_000
}

fn default_max_idle_sessions() -> usize {
    2
}

fn default_session_termination_timeout_ms() -> u64 {
    5_000
}

/// Global configuration parsed from `nailgun.toml`.
///
/// Every field has a default, so an empty file is valid.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct GlobalConfig {
    /// Listening address: `port`, `ip`, `ip:port`, or `local:<name>`.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Client heartbeat timeout; 0 disables the read timeout.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// Upper bound on cached idle sessions.
    #[serde(default = "default_max_idle_sessions")]
    pub max_idle_sessions: usize,
    /// Total time allowed for sessions to stop on shutdown.
    #[serde(default = "default_session_termination_timeout_ms")]
    pub session_termination_timeout_ms: u64,
    /// Extra command aliases: alias name → registered command.
    #[serde(default)]
    pub aliases: HashMap<String, String>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            max_idle_sessions: default_max_idle_sessions(),
            session_termination_timeout_ms: default_session_termination_timeout_ms(),
            aliases: HashMap::new(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read, contains
    /// invalid TOML, or fails validation.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` on an unparsable listen address, a zero
    /// termination timeout, or an alias that names itself.
    pub fn validate(&self) -> Result<()> {
        self.listen_address()?;

        if self.session_termination_timeout_ms == 0 {
            return Err(AppError::Config(
                "session_termination_timeout_ms must be greater than zero".into(),
            ));
        }

        if let Some((alias, _)) = self.aliases.iter().find(|(alias, target)| alias == target) {
            return Err(AppError::Config(format!("alias '{alias}' points at itself")));
        }

        Ok(())
    }

    /// Parsed listening address.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `listen` does not parse.
    pub fn listen_address(&self) -> Result<ListenAddress> {
        self.listen.parse()
    }

    /// Heartbeat timeout as a [`Duration`].
    #[must_use]
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Pool shutdown bound as a [`Duration`].
    #[must_use]
    pub fn session_termination_timeout(&self) -> Duration {
        Duration::from_millis(self.session_termination_timeout_ms)
    }
}
