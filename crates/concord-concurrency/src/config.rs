// Session configuration
// Lease time-to-live and keepalive tuning shared by every session

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default lease time-to-live in seconds
pub const DEFAULT_SESSION_TTL_SECS: u64 = 60;

/// Default number of consecutive failed renewals tolerated before the lease
/// is declared lost
pub const DEFAULT_MAX_KEEPALIVE_FAILURES: u32 = 3;

/// Configuration for a session and its lease keepalive
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Lease time-to-live in seconds (default: 60s)
    /// Bounds how long a crashed holder can block waiters
    pub ttl_secs: u64,

    /// Keepalive interval in milliseconds (default: ttl/3)
    /// Values above ttl/3 are clamped down to ttl/3
    pub keepalive_interval_ms: Option<u64>,

    /// Consecutive renewal failures tolerated before the lease is declared lost
    pub max_keepalive_failures: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_SESSION_TTL_SECS,
            keepalive_interval_ms: None,
            max_keepalive_failures: DEFAULT_MAX_KEEPALIVE_FAILURES,
        }
    }
}

impl SessionConfig {
    /// Create a config with the given ttl and default keepalive settings
    pub fn with_ttl_secs(ttl_secs: u64) -> Self {
        Self {
            ttl_secs,
            ..Default::default()
        }
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    pub fn with_max_keepalive_failures(mut self, failures: u32) -> Self {
        self.max_keepalive_failures = failures;
        self
    }

    /// Get lease ttl as Duration
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Get the effective keepalive interval: never more than ttl/3 and never zero
    pub fn keepalive_interval(&self) -> Duration {
        keepalive_interval_for(self.ttl(), self.keepalive_interval_ms)
    }
}

/// Renewal interval for a lease of `ttl`, honoring an optional configured interval
pub(crate) fn keepalive_interval_for(ttl: Duration, configured_ms: Option<u64>) -> Duration {
    let ceiling = ttl / 3;
    let interval = match configured_ms {
        Some(ms) => Duration::from_millis(ms).min(ceiling),
        None => ceiling,
    };
    interval.max(Duration::from_millis(1))
}
