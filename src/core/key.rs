//! The tracked key and its identity.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Signal strength reported for a key whose link timed out.
/// Sits below every permitted threshold, so it always reads as "too far".
pub const OUT_OF_RANGE_RSSI: i16 = -130;

/// Name used when the peripheral does not advertise one.
pub const UNNAMED_DEVICE: &str = "Unnamed Device";

/// Platform-specific identifier of a peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeripheralId(pub String);

impl PeripheralId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Snapshot of the tracked peripheral.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Key {
    /// Human label, a placeholder if unknown
    pub name: String,
    /// Stable hardware identifier
    pub address: PeripheralId,
    /// Time of the last successful signal sample
    pub last_seen: Option<DateTime<Local>>,
    /// RSSI in dBm, absent until the first sample
    pub signal_strength: Option<i16>,
    /// False once the reading is older than the current connection
    pub signal_fresh: bool,
    pub connected: bool,
}

impl Key {
    /// A freshly selected key: nothing measured yet, not connected.
    pub fn new(address: PeripheralId, name: Option<String>) -> Self {
        Self {
            name: name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| UNNAMED_DEVICE.to_string()),
            address,
            last_seen: None,
            signal_strength: None,
            signal_fresh: false,
            connected: false,
        }
    }

    /// Whether this snapshot is evidence that the owner is away.
    ///
    /// A missing connection is dispositive; otherwise only a measured strength
    /// below the threshold counts.
    pub fn is_out_of_range(&self, signal_threshold: i16) -> bool {
        !self.connected
            || self
                .signal_strength
                .is_some_and(|strength| strength < signal_threshold)
    }
}
