//! Application state management
//! This module wires the Bluetooth transport, the lock gate and the settings
//! store into a running controller.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use log::{info, warn};

use crate::config::{FileSettingsStore, SavedKey};
use crate::core::bluetooth::{LinkPolicy, Transport};
use crate::core::error::ControllerError;
use crate::core::{BluetoothManager, CommandLockGate, Controller, LockGate, PeripheralId};

/// Global application state
pub struct AppState {
    pub transport: Arc<dyn Transport>,
    pub lock_gate: Arc<dyn LockGate>,
    pub settings_store: Arc<FileSettingsStore>,
    pub controller: Controller,
}

impl AppState {
    /// Opens the Bluetooth adapter, loads the config and starts the controller.
    pub async fn new(config_path: impl AsRef<Path>) -> Result<Self> {
        info!("Initializing BluetoothManager...");
        let manager = BluetoothManager::new().await?;
        let store = FileSettingsStore::load(config_path).await?;
        let gate = CommandLockGate::new(store.config().await.lock);

        Ok(Self::with_parts(Arc::new(manager), Arc::new(gate), Arc::new(store)))
    }

    pub fn with_parts(
        transport: Arc<dyn Transport>,
        lock_gate: Arc<dyn LockGate>,
        settings_store: Arc<FileSettingsStore>,
    ) -> Self {
        let controller = Controller::start(
            transport.clone(),
            lock_gate.clone(),
            settings_store.clone(),
            LinkPolicy::default(),
        );
        Self {
            transport,
            lock_gate,
            settings_store,
            controller,
        }
    }

    /// Relinks the key selected last and re-arms if the policy was active.
    pub async fn resume(&self) -> Result<()> {
        if !self.lock_gate.is_authorized().await {
            warn!("Lock command is not available, locking will fail until it is");
        }

        let config = self.settings_store.config().await;
        let Some(SavedKey { id, name }) = config.last_key else {
            return Ok(());
        };

        info!("Relinking last key {}", id);
        self.controller.select_and_link(PeripheralId::new(id), name).await?;
        if config.armed {
            match self.controller.arm().await {
                Err(ControllerError::LockNotAuthorized(reason)) => {
                    warn!("Re-armed, but the first lock attempt failed: {}", reason)
                }
                result => result?,
            }
        }
        Ok(())
    }

    /// Links `peripheral` and remembers it for the next start.
    pub async fn link(&self, peripheral: PeripheralId, name: Option<String>) -> Result<()> {
        self.controller.select_and_link(peripheral.clone(), name.clone()).await?;
        self.settings_store
            .set_last_key(Some(SavedKey { id: peripheral.0, name }))
            .await
    }

    pub async fn unlink(&self) -> Result<()> {
        self.controller.unlink().await?;
        self.settings_store.set_last_key(None).await
    }
}
