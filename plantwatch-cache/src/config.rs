//! Cache store configuration.

use std::time::Duration;

/// Freshness windows applied when a fetch result is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// TTL for ordinary query results.
    pub default_ttl: Duration,
    /// TTL for live telemetry. Usually shorter than the poll interval so a
    /// view that mounts between ticks refreshes straight away.
    pub telemetry_ttl: Duration,
    /// How long an unwatched, stale entry is kept before `sweep` drops it.
    pub gc_window: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            telemetry_ttl: Duration::from_secs(5),
            gc_window: Duration::from_secs(300),
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default TTL.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the telemetry TTL.
    pub fn with_telemetry_ttl(mut self, ttl: Duration) -> Self {
        self.telemetry_ttl = ttl;
        self
    }

    pub fn with_gc_window(mut self, window: Duration) -> Self {
        self.gc_window = window;
        self
    }
}
