//! Log deduplication for repeated delete failures
//!
//! A resource that cannot be deleted yet (dependency still attached, API
//! throttling) fails the same way on every poll. The tracker logs the first
//! failure and every change at `warn`, and demotes exact repeats to `debug`.
//! It never affects retry or control flow.

use std::fmt::Display;

use dashmap::DashMap;
use tracing::{debug, warn};

/// Last error message seen per resource key
#[derive(Debug, Default)]
pub struct ErrorTracker {
    history: DashMap<String, String>,
}

impl ErrorTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Log `err` for `key` unless it repeats the last recorded message
    ///
    /// Returns `true` when the error was logged at `warn`.
    pub fn suppress_warning(&self, key: &str, err: &impl Display) -> bool {
        let message = err.to_string();

        if self.history.get(key).is_some_and(|last| *last == message) {
            debug!(key = %key, error = %message, "Repeated failure");
            return false;
        }

        warn!(key = %key, error = %message, "Delete failed");
        self.history.insert(key.to_string(), message);
        true
    }

    /// Drop the record for a key that has converged
    pub fn forget(&self, key: &str) {
        self.history.remove(key);
    }

    /// Last recorded message for a key
    pub fn last_error(&self, key: &str) -> Option<String> {
        self.history.get(key).map(|m| m.clone())
    }
}
