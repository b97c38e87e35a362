//! Command context assembled from the client's header chunks.

use tracing::debug;

/// Ordered environment map.
///
/// Keeps first-arrival order; setting an existing key replaces its value
/// in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    entries: Vec<(String, String)>,
}

impl Environment {
    /// Empty environment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace `key`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    /// Apply one `NAME=VALUE` entry, splitting on the first `=`.
    ///
    /// Returns `false` and leaves the map untouched when the entry has no
    /// `=` or an empty name.
    pub fn apply_entry(&mut self, entry: &str) -> bool {
        match entry.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                self.set(key, value);
                true
            }
            _ => {
                debug!(entry, "ignoring malformed environment entry");
                false
            }
        }
    }

    /// Value for `key`, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Iterate entries in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Everything the client sent before its first stdin chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandContext {
    /// Command name or alias from the `COMMAND` chunk.
    pub command: String,
    /// Client working directory; empty if none was sent.
    pub working_directory: String,
    /// Client environment.
    pub environment: Environment,
    /// Arguments in arrival order.
    pub arguments: Vec<String>,
}
