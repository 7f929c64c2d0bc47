//! Error types shared by the proximity core.

use thiserror::Error;

/// Failures reported by a [`Transport`](crate::core::bluetooth::Transport).
///
/// These never cross the `SignalLink` boundary as errors; the link folds them
/// into link events instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The operation did not complete in time.
    #[error("Bluetooth operation timed out")]
    Timeout,

    /// The radio reported a failure with a platform status code.
    #[error("Bluetooth operation failed (code {code}): {message}")]
    OperationFailed { code: i32, message: String },

    /// The peripheral is not connected.
    #[error("Peripheral is not connected")]
    NotConnected,

    /// The peripheral is unknown to the adapter.
    #[error("Peripheral not found: {0}")]
    NotFound(String),

    /// No usable Bluetooth adapter.
    #[error("Bluetooth adapter unavailable: {0}")]
    Unavailable(String),
}

impl TransportError {
    /// True when retrying cannot help until the environment changes.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Unavailable(_))
    }
}

/// Failure of the platform lock primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// The lock capability has not been granted, or was revoked.
    #[error("Lock not authorized: {0}")]
    NotAuthorized(String),
}

/// Errors surfaced to whoever drives the controller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControllerError {
    /// A lock decision fired but the lock capability refused it.
    #[error("Device lock is not authorized: {0}")]
    LockNotAuthorized(String),

    /// The controller task has shut down.
    #[error("Controller is not running")]
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_missing_peripheral_or_adapter_is_fatal() {
        assert!(TransportError::NotFound("AA".into()).is_fatal());
        assert!(TransportError::Unavailable("off".into()).is_fatal());
        assert!(!TransportError::Timeout.is_fatal());
        assert!(!TransportError::NotConnected.is_fatal());
        assert!(
            !TransportError::OperationFailed { code: 133, message: "gatt".into() }.is_fatal()
        );
    }
}
