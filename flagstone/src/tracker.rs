use crate::ports::Clock;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::fmt::Debug;
use std::sync::Arc;

/// Last successful refresh time per flag identifier.
///
/// Entries are created on the first successful fetch of a flag and only ever
/// overwritten afterwards; they live as long as the tracker does.
pub struct RefreshTracker {
    last_refresh: DashMap<String, DateTime<Utc>>,
    clock: Arc<dyn Clock>,
}

impl RefreshTracker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            last_refresh: DashMap::new(),
            clock,
        }
    }

    /// Record the current time as the last refresh of `flag_key`
    pub fn touch(&self, flag_key: &str) {
        let now = self.clock.now();
        self.last_refresh.insert(flag_key.to_string(), now);
    }

    /// Point-in-time copy of the tracked identifiers. Concurrent touches may or may not be included.
    pub fn snapshot(&self) -> Vec<String> {
        self.last_refresh.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn last_refresh(&self, flag_key: &str) -> Option<DateTime<Utc>> {
        self.last_refresh.get(flag_key).map(|entry| *entry.value())
    }

    pub fn len(&self) -> usize {
        self.last_refresh.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_refresh.is_empty()
    }
}

impl Debug for RefreshTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshTracker")
            .field("tracked", &self.last_refresh.len())
            .finish()
    }
}
