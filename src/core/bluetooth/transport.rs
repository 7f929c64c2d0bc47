//! The radio seam the link drives.

use std::time::Duration;

use crate::core::bluetooth::types::{BluetoothDevice, DisconnectReason};
use crate::core::error::TransportError;
use crate::core::key::PeripheralId;

/// Bluetooth LE central operations needed to track a key.
///
/// Implementations must be cheap to call concurrently; the link may have a
/// connection watcher and an RSSI read outstanding at the same time.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Connect to the peripheral. Returns once the link is up.
    async fn connect(&self, peripheral: &PeripheralId) -> Result<(), TransportError>;

    /// Tear down the link. Disconnecting an idle peripheral is not an error.
    async fn disconnect(&self, peripheral: &PeripheralId) -> Result<(), TransportError>;

    /// Read the remote RSSI over the live link.
    async fn read_rssi(&self, peripheral: &PeripheralId) -> Result<i16, TransportError>;

    /// Resolves when the live link goes down, with the reason.
    async fn wait_for_disconnect(&self, peripheral: &PeripheralId) -> DisconnectReason;

    /// The name the peripheral reports, if any.
    async fn peripheral_name(&self, peripheral: &PeripheralId) -> Option<String>;

    /// Peripherals that could be selected as the key.
    async fn available_keys(&self, scan_for: Duration)
    -> Result<Vec<BluetoothDevice>, TransportError>;
}
