//! Freshness throttle for mutable resources.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Entries kept before expired ones are pruned.
const PRUNE_THRESHOLD: usize = 4096;

/// Remembers when each resource was last re-validated upstream.
///
/// A resource is due for a check when it was never checked or its last check
/// is older than the window. Granting a check records it, so concurrent
/// callers inside one window get at most one re-check.
#[derive(Debug)]
pub struct FreshnessTracker {
    window: Duration,
    checked: Mutex<HashMap<String, Instant>>,
}

impl FreshnessTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            checked: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Whether `key` must be re-validated now; records the check if so.
    pub fn check_due(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut checked = self.checked.lock();

        if let Some(at) = checked.get(key) {
            if now.duration_since(*at) < self.window {
                return false;
            }
        }

        if checked.len() >= PRUNE_THRESHOLD {
            let window = self.window;
            checked.retain(|_, at| now.duration_since(*at) < window);
        }
        checked.insert(key.to_string(), now);
        true
    }

    /// Record that `key` was just validated.
    pub fn mark_checked(&self, key: &str) {
        self.checked.lock().insert(key.to_string(), Instant::now());
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.checked.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.checked.lock().is_empty()
    }
}
