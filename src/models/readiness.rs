//! TTL cache of "is provider+model usable right now".

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReadinessEntry {
    checked_at: Instant,
    valid: bool,
}

/// Probe results keyed by `provider:model`.
#[derive(Debug)]
pub struct ReadinessCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, ReadinessEntry>>,
}

impl ReadinessCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn key(provider: &str, model: &str) -> String {
        format!("{provider}:{model}")
    }

    /// Cached verdict, if one was recorded less than `ttl` ago.
    pub fn lookup(&self, key: &str, now: Instant) -> Option<bool> {
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|e| now.saturating_duration_since(e.checked_at) < self.ttl)
            .map(|e| e.valid)
    }

    pub fn record(&self, key: &str, valid: bool, now: Instant) {
        self.entries.lock().insert(
            key.to_string(),
            ReadinessEntry {
                checked_at: now,
                valid,
            },
        );
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}
