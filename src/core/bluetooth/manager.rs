//! Bluetooth manager for the proximity lock
//! This module provides the `bluest` backed transport the link drives

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use bluest::error::ErrorKind;
use bluest::{Adapter, ConnectionEvent, Device};
use futures_util::StreamExt;
use log::{debug, info, warn};

use crate::core::bluetooth::constants::{
    DEFAULT_SCAN_DURATION_SECS, GENERIC_FAILURE_CODE, MIN_RSSI_THRESHOLD,
};
use crate::core::bluetooth::scanner::BluetoothScanner;
use crate::core::bluetooth::transport::Transport;
use crate::core::bluetooth::types::{BluetoothDevice, DisconnectReason};
use crate::core::error::TransportError;
use crate::core::key::PeripheralId;

/// Manages Bluetooth operations
pub struct BluetoothManager {
    adapter: Adapter,
    /// Map of device ids to devices
    devices: Arc<Mutex<HashMap<String, Device>>>,
    /// Bluetooth scanner
    scanner: BluetoothScanner,
}

impl BluetoothManager {
    /// Creates a new BluetoothManager on the default adapter
    pub async fn new() -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;
        adapter.wait_available().await?;
        info!("Bluetooth adapter is available.");

        let devices = Arc::new(Mutex::new(HashMap::new()));
        let scanner = BluetoothScanner::new(adapter.clone(), devices.clone());

        Ok(Self {
            adapter,
            devices,
            scanner,
        })
    }

    fn cached(&self, id: &str) -> Option<Device> {
        self.devices.lock().ok().and_then(|d| d.get(id).cloned())
    }

    /// Finds the device handle for an id: cache, then connected devices, then a short scan.
    async fn resolve(&self, peripheral: &PeripheralId) -> Result<Device, TransportError> {
        let id = peripheral.as_str();
        if let Some(device) = self.cached(id) {
            return Ok(device);
        }

        let connected = self
            .adapter
            .connected_devices()
            .await
            .map_err(map_bluest_error)?;
        if let Some(device) = connected.into_iter().find(|d| d.id().to_string() == id) {
            if let Ok(mut devices) = self.devices.lock() {
                devices.insert(id.to_string(), device.clone());
            }
            return Ok(device);
        }

        debug!("Device {} not cached, scanning for it", id);
        self.scanner
            .find(id, Duration::from_secs(DEFAULT_SCAN_DURATION_SECS))
            .await?
            .ok_or_else(|| TransportError::NotFound(id.to_string()))
    }
}

#[async_trait::async_trait]
impl Transport for BluetoothManager {
    async fn connect(&self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        let device = self.resolve(peripheral).await?;
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        info!("Device details - ID: {}, Name: {:?}", peripheral, name);

        if device.is_connected().await {
            info!("Device already connected.");
            return Ok(());
        }

        info!("Initiating connection to {}...", peripheral);
        self.adapter
            .connect_device(&device)
            .await
            .map_err(map_bluest_error)?;
        info!("Connection to {} successful", peripheral);
        Ok(())
    }

    async fn disconnect(&self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        let Some(device) = self.cached(peripheral.as_str()) else {
            debug!("Device {} unknown, nothing to disconnect", peripheral);
            return Ok(());
        };

        if device.is_connected().await {
            info!("Disconnecting from device {}", peripheral);
            self.adapter
                .disconnect_device(&device)
                .await
                .map_err(map_bluest_error)?;
            info!("Successfully disconnected");
        } else {
            info!("Device {} not connected", peripheral);
        }
        Ok(())
    }

    async fn read_rssi(&self, peripheral: &PeripheralId) -> Result<i16, TransportError> {
        let device = self
            .cached(peripheral.as_str())
            .ok_or(TransportError::NotConnected)?;
        if !device.is_connected().await {
            return Err(TransportError::NotConnected);
        }
        device.rssi().await.map_err(map_bluest_error)
    }

    async fn wait_for_disconnect(&self, peripheral: &PeripheralId) -> DisconnectReason {
        let Some(device) = self.cached(peripheral.as_str()) else {
            return DisconnectReason::Disconnected;
        };

        let mut events = match self.adapter.device_connection_events(&device).await {
            Ok(events) => events,
            Err(e) => {
                warn!("Cannot watch connection of {}: {}", peripheral, e);
                return DisconnectReason::from(&map_bluest_error(e));
            }
        };

        while let Some(event) = events.next().await {
            match event {
                ConnectionEvent::Disconnected => {
                    info!("Device {} lost connection", peripheral);
                    return DisconnectReason::Disconnected;
                }
                ConnectionEvent::Connected => debug!("Device {} reconnected", peripheral),
            }
        }

        info!("Connection event stream for {} ended", peripheral);
        DisconnectReason::Disconnected
    }

    async fn peripheral_name(&self, peripheral: &PeripheralId) -> Option<String> {
        let device = self.cached(peripheral.as_str())?;
        device.name_async().await.ok().filter(|n| !n.is_empty())
    }

    async fn available_keys(
        &self,
        scan_for: Duration,
    ) -> Result<Vec<BluetoothDevice>, TransportError> {
        self.scanner.discover(scan_for, MIN_RSSI_THRESHOLD).await
    }
}

/// Normalizes a `bluest` error into the transport vocabulary.
pub(crate) fn map_bluest_error(e: bluest::Error) -> TransportError {
    match e.kind() {
        ErrorKind::Timeout => TransportError::Timeout,
        ErrorKind::NotConnected => TransportError::NotConnected,
        ErrorKind::NotFound => TransportError::NotFound(e.to_string()),
        ErrorKind::AdapterUnavailable => TransportError::Unavailable(e.to_string()),
        _ => TransportError::OperationFailed {
            code: GENERIC_FAILURE_CODE,
            message: e.to_string(),
        },
    }
}
