use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Signal threshold bounds in dBm
pub const MIN_SIGNAL_THRESHOLD: i16 = -100;
pub const MAX_SIGNAL_THRESHOLD: i16 = -40;
pub const DEFAULT_SIGNAL_THRESHOLD: i16 = -60;

/// Grace period bounds in seconds
pub const MIN_GRACE_PERIOD_SECS: u64 = 10;
pub const MAX_GRACE_PERIOD_SECS: u64 = 120;
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 30;

/// Polling interval bounds in seconds
pub const MIN_POLLING_INTERVAL_SECS: u64 = 1;
pub const MAX_POLLING_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_POLLING_INTERVAL_SECS: u64 = 1;

/// Tuning of the lock policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Weakest acceptable RSSI. Readings below it count as "too far".
    pub signal_threshold: i16,

    /// Debounce window after a wake event or a lock.
    pub grace_period_secs: u64,

    /// Time between two RSSI reads.
    pub polling_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            signal_threshold: DEFAULT_SIGNAL_THRESHOLD,
            grace_period_secs: DEFAULT_GRACE_PERIOD_SECS,
            polling_interval_secs: DEFAULT_POLLING_INTERVAL_SECS,
        }
    }
}

impl Settings {
    /// Clamps every value into its permitted range.
    pub fn clamped(self) -> Self {
        Settings {
            signal_threshold: self
                .signal_threshold
                .clamp(MIN_SIGNAL_THRESHOLD, MAX_SIGNAL_THRESHOLD),
            grace_period_secs: self
                .grace_period_secs
                .clamp(MIN_GRACE_PERIOD_SECS, MAX_GRACE_PERIOD_SECS),
            polling_interval_secs: self
                .polling_interval_secs
                .clamp(MIN_POLLING_INTERVAL_SECS, MAX_POLLING_INTERVAL_SECS),
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs.max(MIN_POLLING_INTERVAL_SECS))
    }
}
