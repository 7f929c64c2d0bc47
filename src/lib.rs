//! Proximity lock library
//! Locks the device when a paired Bluetooth key moves out of range.

// Module declarations
pub mod commands;
pub mod config;
pub mod core;
pub mod logging;
pub mod state;
