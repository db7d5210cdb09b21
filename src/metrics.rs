//! In-memory counters exposed at `/metrics`.

use std::collections::HashMap;
use std::sync::Mutex;

/// Tiny counter store for instrumentation hooks; process-wide, never persisted.
#[derive(Debug, Default)]
pub struct Metrics {
    counters: Mutex<HashMap<String, u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the named counter by one.
    pub fn inc(&self, name: &str) {
        let mut counters = self.counters.lock().unwrap();
        *counters.entry(name.to_string()).or_insert(0) += 1;
    }

    /// Current value of a counter, zero when never incremented.
    pub fn get(&self, name: &str) -> u64 {
        self.counters.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    /// Copy of all counters for serialization.
    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.counters.lock().unwrap().clone()
    }
}
