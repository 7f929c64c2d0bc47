//! Bluetooth functionality for the proximity lock
//! This module owns the link to the key: connecting, reading the signal
//! strength, and finding candidate keys.

mod constants;
mod link;
mod manager;
mod scanner;
mod transport;
mod types;

// Re-export types that should be publicly accessible
pub use constants::*;
pub use link::{Connecting, LinkPolicy, SignalLink};
pub use manager::BluetoothManager;
pub use scanner::{BluetoothScanner, extract_mac_address};
pub use transport::Transport;
pub use types::{BluetoothDevice, ConnectionState, DisconnectReason, Generation, LinkEvent};
