//! Core functionality for the proximity lock
//! This module contains the link to the key, the proximity tracker and the
//! lock policy, tied together by the controller.

pub mod bluetooth;
pub mod controller;
pub mod engine;
pub mod error;
pub mod gate;
pub mod key;
pub mod polling;
pub mod tracker;

// Re-export commonly used types
pub use bluetooth::BluetoothManager;
pub use controller::{Controller, ControllerNotice, ControllerStatus};
pub use error::ControllerError;
pub use gate::{CommandLockGate, LockGate};
pub use key::{Key, PeripheralId};
