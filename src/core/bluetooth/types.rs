//! Defines shared data structures for the Bluetooth module.

use serde::Serialize;

use crate::core::bluetooth::constants::GENERIC_FAILURE_CODE;
use crate::core::error::TransportError;

/// Stamp identifying one connection attempt sequence of the link.
/// Events carrying an older generation belong to a superseded connection.
pub type Generation = u64;

/// Why a link is (or stayed) down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DisconnectReason {
    /// The transport gave up waiting; treated as "out of range".
    TransportTimeout,
    /// The radio reported a failure code.
    OperationFailed(i32),
    /// Orderly disconnect, or the link dropped without a failure code.
    Disconnected,
}

impl From<&TransportError> for DisconnectReason {
    fn from(e: &TransportError) -> Self {
        match e {
            TransportError::Timeout => DisconnectReason::TransportTimeout,
            TransportError::OperationFailed { code, .. } => DisconnectReason::OperationFailed(*code),
            TransportError::NotConnected => DisconnectReason::Disconnected,
            TransportError::NotFound(_) | TransportError::Unavailable(_) => {
                DisconnectReason::OperationFailed(GENERIC_FAILURE_CODE)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Connected,
    Disconnected(DisconnectReason),
}

/// Everything the link reports to its subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    ConnectionStateChanged {
        generation: Generation,
        state: ConnectionState,
    },
    SampleReady {
        generation: Generation,
        rssi: i16,
    },
    SampleFailed {
        generation: Generation,
        reason: DisconnectReason,
    },
    /// The peripheral reported its name after connecting.
    NameResolved {
        generation: Generation,
        name: String,
    },
    /// The peripheral cannot be reached at all; the link has stopped trying.
    ConnectFailed {
        generation: Generation,
        error: String,
    },
}

impl LinkEvent {
    pub fn generation(&self) -> Generation {
        match self {
            LinkEvent::ConnectionStateChanged { generation, .. }
            | LinkEvent::SampleReady { generation, .. }
            | LinkEvent::SampleFailed { generation, .. }
            | LinkEvent::NameResolved { generation, .. }
            | LinkEvent::ConnectFailed { generation, .. } => *generation,
        }
    }
}

/// A peripheral that could be selected as the key
#[derive(Debug, Clone, Serialize)]
pub struct BluetoothDevice {
    /// The name of the device, if available
    pub name: Option<String>,
    /// The address of the device (MAC address on most platforms, N/A on macOS)
    pub address: String,
    /// Platform-specific unique identifier, used to link the key
    pub id: String,
    /// The signal strength (RSSI) of the device
    pub rssi: Option<i16>,
    /// Whether the device is already connected to this host
    pub is_connected: bool,
}

impl BluetoothDevice {
    pub fn new(
        id: String,
        name: Option<String>,
        address: String,
        rssi: Option<i16>,
        is_connected: bool,
    ) -> Self {
        Self {
            name,
            address,
            id,
            rssi,
            is_connected,
        }
    }
}
