//! Consecutive-failure tracking and debounce.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

/// Raw failures in a row before a service is reported down.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 2;

/// Debounced up/down decision for a raw result.
pub fn adjusted_ok(raw_ok: bool, consecutive_failures: u32, threshold: u32) -> bool {
    raw_ok || consecutive_failures < threshold
}

/// Per-service consecutive raw-failure counters.
///
/// Shared between the scheduler loop and on-demand checks.
#[derive(Debug, Default)]
pub struct FailureTracker {
    counts: Mutex<HashMap<String, u32>>,
}

impl FailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a raw result and return the new consecutive-failure count.
    pub fn update(&self, key: &str, raw_ok: bool) -> u32 {
        let mut counts = self.counts.lock();
        if raw_ok {
            counts.remove(key);
            return 0;
        }
        let count = counts.entry(key.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    /// Forget a service's streak, e.g. when monitoring is disabled.
    pub fn reset(&self, key: &str) {
        self.counts.lock().remove(key);
    }

    /// Drop counters for services that are no longer configured.
    pub fn prune<'a, I>(&self, valid_keys: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let valid: HashSet<&str> = valid_keys.into_iter().collect();
        self.counts.lock().retain(|key, _| valid.contains(key.as_str()));
    }

    /// Current streak for a service.
    pub fn count(&self, key: &str) -> u32 {
        self.counts.lock().get(key).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.counts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
