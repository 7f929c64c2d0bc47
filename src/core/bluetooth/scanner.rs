use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bluest::{Adapter, Device};
use futures_util::StreamExt;
use log::{debug, info};
use regex::Regex;
use tokio::time::{Instant, sleep_until};

use crate::core::bluetooth::manager::map_bluest_error;
use crate::core::bluetooth::types::BluetoothDevice;
use crate::core::error::TransportError;

/// Discovers peripherals and remembers their handles by id, so the link can
/// later open them without another scan.
pub struct BluetoothScanner {
    adapter: Adapter,
    devices: Arc<Mutex<HashMap<String, Device>>>,
}

impl BluetoothScanner {
    pub fn new(adapter: Adapter, devices: Arc<Mutex<HashMap<String, Device>>>) -> Self {
        Self { adapter, devices }
    }

    /// Lists already-connected peripherals, then scans for advertising ones.
    pub async fn discover(&self, scan_for: Duration, min_rssi: i16) -> Result<Vec<BluetoothDevice>, TransportError> {
        let mut found: HashMap<String, BluetoothDevice> = HashMap::new();

        info!("Checking for connected devices");
        let connected = self.adapter.connected_devices().await.map_err(map_bluest_error)?;
        for device in connected {
            let rssi = device.rssi().await.ok();
            let entry = self.remember(device, rssi, true);
            found.insert(entry.id.clone(), entry);
        }

        info!("Starting bluetooth scan for {:?}", scan_for);
        let mut scan_stream = self.adapter.scan(&[]).await.map_err(map_bluest_error)?;
        let deadline = Instant::now() + scan_for;

        loop {
            tokio::select! {
                result = scan_stream.next() => {
                    match result {
                        Some(discovered) => {
                            debug!("Found device - Device: {:?}, RSSI: {:?}", discovered.device, discovered.rssi);
                            // Only include devices with medium or stronger signal strength
                            if discovered.rssi.is_some_and(|rssi| rssi >= min_rssi) {
                                let entry = self.remember(discovered.device, discovered.rssi, false);
                                found.entry(entry.id.clone()).or_insert(entry);
                            }
                        }
                        None => {
                            info!("Bluetooth scan stream has ended.");
                            break;
                        }
                    }
                }
                _ = sleep_until(deadline) => break,
            }
        }

        let mut devices: Vec<BluetoothDevice> = found.into_values().collect();
        devices.sort_by(|a, b| b.rssi.cmp(&a.rssi));
        info!("Discovery complete, {} candidate key(s)", devices.len());
        Ok(devices)
    }

    /// Scans until the given id shows up or the time runs out.
    pub async fn find(&self, id: &str, scan_for: Duration) -> Result<Option<Device>, TransportError> {
        let mut scan_stream = self.adapter.scan(&[]).await.map_err(map_bluest_error)?;
        let deadline = Instant::now() + scan_for;

        loop {
            tokio::select! {
                result = scan_stream.next() => {
                    let Some(discovered) = result else { return Ok(None) };
                    if discovered.device.id().to_string() == id {
                        let device = discovered.device;
                        self.remember(device.clone(), discovered.rssi, false);
                        return Ok(Some(device));
                    }
                }
                _ = sleep_until(deadline) => return Ok(None),
            }
        }
    }

    fn remember(&self, device: Device, rssi: Option<i16>, is_connected: bool) -> BluetoothDevice {
        let id = device.id().to_string();
        let name = device.name().ok().filter(|n| !n.is_empty());
        let address = extract_mac_address(&id).unwrap_or_else(|| "N/A".to_string());

        if let Ok(mut devices) = self.devices.lock() {
            devices.insert(id.clone(), device);
        }
        BluetoothDevice::new(id, name, address, rssi, is_connected)
    }
}

/// Pulls a MAC address out of a platform device id, if it embeds one.
pub fn extract_mac_address(device_id_str: &str) -> Option<String> {
    let re = Regex::new(r"([0-9A-Fa-f]{2}[:_-]){5}([0-9A-Fa-f]{2})").ok()?;
    re.find_iter(device_id_str)
        .last()
        .map(|m| m.as_str().replace(['_', '-'], ":").to_uppercase())
}
