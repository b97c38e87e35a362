//! Per-command execution statistics.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Counters for one command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NailStats {
    /// Invocations started since the server came up.
    pub runs: u64,
    /// Invocations currently running.
    pub active: u64,
    /// Start time of the most recent invocation.
    pub last_started_at: Option<DateTime<Utc>>,
}

/// Thread-safe statistics registry keyed by command name.
#[derive(Debug, Default)]
pub struct NailStatsRegistry {
    inner: Mutex<BTreeMap<String, NailStats>>,
}

impl NailStatsRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `command` started.
    pub fn started(&self, command: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = inner.entry(command.to_owned()).or_default();
        entry.runs += 1;
        entry.active += 1;
        entry.last_started_at = Some(Utc::now());
    }

    /// Record that `command` finished, however it ended.
    pub fn finished(&self, command: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = inner.get_mut(command) {
            entry.active = entry.active.saturating_sub(1);
        }
    }

    /// Copy of the current counters, sorted by command name.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, NailStats> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
