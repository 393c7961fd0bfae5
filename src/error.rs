//! Transport error types

use thiserror::Error;

/// Errors that can occur during transport operations
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    // Common errors
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Exchange timeout")]
    Timeout,

    #[error("Payload too large: {0} bytes (max {max})", max = u16::MAX)]
    PayloadTooLarge(usize),

    #[error("Malformed report: {0}")]
    MalformedReport(String),

    #[error("Command failed: {0}")]
    CommandFailed(String),

    // HID-specific errors
    #[error("HID error: {0}")]
    HidError(String),

    #[error("HID permission denied: {0}")]
    HidPermissionDenied(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<hidapi::HidError> for TransportError {
    fn from(e: hidapi::HidError) -> Self {
        let msg = e.to_string();
        if msg.contains("Permission denied") || msg.contains("EPERM") {
            TransportError::HidPermissionDenied(msg)
        } else {
            TransportError::HidError(msg)
        }
    }
}
