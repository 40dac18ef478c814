//! Per-model cooldown timers.
//!
//! A model that hit a quota or timeout error is suspended until its expiry
//! instant. Entries are evicted lazily by the first lookup after expiry.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug)]
pub struct CooldownRegistry {
    duration: Duration,
    until: Mutex<HashMap<String, Instant>>,
}

impl CooldownRegistry {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            until: Mutex::new(HashMap::new()),
        }
    }

    /// Suspend `model` for the configured duration starting at `now`.
    pub fn start(&self, model: &str, now: Instant) -> Instant {
        let expiry = now + self.duration;
        self.until.lock().insert(model.to_string(), expiry);
        expiry
    }

    /// Whether `model` is suspended at `now`. Evicts an expired entry.
    pub fn is_active(&self, model: &str, now: Instant) -> bool {
        self.remaining(model, now).is_some()
    }

    /// Time left on `model`'s cooldown. Evicts an expired entry.
    pub fn remaining(&self, model: &str, now: Instant) -> Option<Duration> {
        let mut until = self.until.lock();
        match until.get(model) {
            Some(&expiry) if now < expiry => Some(expiry - now),
            Some(_) => {
                until.remove(model);
                debug!("cooldown for model '{}' expired", model);
                None
            }
            None => None,
        }
    }

    /// Number of entries currently stored, expired or not.
    pub fn len(&self) -> usize {
        self.until.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.until.lock().clear();
    }
}
