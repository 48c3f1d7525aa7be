//! Error types for mesh controller operations
//!
//! [`LinkError`] covers the physical BLE link only. [`MeshError`] is the
//! crate-level error returned by the controller handle; it wraps link,
//! decode and configuration failures.

use meshlight_protocol::{DecodeError, OpcodeTableError};
use thiserror::Error;
use uuid::Uuid;

/// Link-level failure reported by a [`BleTransport`](crate::BleTransport)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// No Bluetooth adapter available on this host
    #[error("No Bluetooth adapter found")]
    NoAdapter,

    /// Peripheral not seen during the scan window
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Connection attempt rejected by the stack or the peripheral
    #[error("Failed to connect to {device}: {reason}")]
    ConnectFailed {
        /// Device address or name
        device: String,
        /// Failure reason
        reason: String,
    },

    /// Connection attempt did not finish in time
    #[error("Connection timeout after {duration_ms}ms")]
    ConnectTimeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Required GATT characteristic missing on the peripheral
    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    /// GATT write failed or timed out
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// Link is not connected
    #[error("Link disconnected")]
    Disconnected,

    /// Any other error from the underlying BLE stack
    #[error("BLE transport error: {0}")]
    Transport(String),
}

impl LinkError {
    /// Check if another attempt may succeed
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            LinkError::NoAdapter | LinkError::CharacteristicNotFound(_)
        )
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            LinkError::NoAdapter => "NO_ADAPTER",
            LinkError::DeviceNotFound(_) => "DEVICE_NOT_FOUND",
            LinkError::ConnectFailed { .. } => "CONNECT_FAILED",
            LinkError::ConnectTimeout { .. } => "CONNECT_TIMEOUT",
            LinkError::CharacteristicNotFound(_) => "CHARACTERISTIC_NOT_FOUND",
            LinkError::WriteFailed(_) => "WRITE_FAILED",
            LinkError::Disconnected => "DISCONNECTED",
            LinkError::Transport(_) => "TRANSPORT_ERROR",
        }
    }
}

#[cfg(feature = "ble")]
impl From<btleplug::Error> for LinkError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::DeviceNotFound => LinkError::DeviceNotFound(err.to_string()),
            btleplug::Error::NotConnected => LinkError::Disconnected,
            other => LinkError::Transport(other.to_string()),
        }
    }
}

/// Main error type for mesh controller operations
#[derive(Error, Debug)]
pub enum MeshError {
    /// Physical link failure
    #[error(transparent)]
    Link(#[from] LinkError),

    /// Undecodable frame
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Unusable opcode table
    #[error("Opcode table error: {0}")]
    OpcodeTable(#[from] OpcodeTableError),

    /// Address cannot be used for this operation
    #[error("Invalid sub-device address: {0}")]
    InvalidAddress(u8),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Controller task is no longer running
    #[error("Mesh controller stopped")]
    ControllerStopped,

    /// Configuration file could not be parsed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MeshError {
    /// Check if this error is recoverable/retriable
    pub fn is_retriable(&self) -> bool {
        match self {
            MeshError::Link(err) => err.is_retriable(),
            _ => false,
        }
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            MeshError::Link(err) => err.error_code(),
            MeshError::Decode(err) => err.error_code(),
            MeshError::OpcodeTable(_) => "OPCODE_TABLE",
            MeshError::InvalidAddress(_) => "INVALID_ADDRESS",
            MeshError::InvalidConfig(_) => "INVALID_CONFIG",
            MeshError::ControllerStopped => "CONTROLLER_STOPPED",
            MeshError::Json(_) => "JSON_ERROR",
            MeshError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias for mesh controller operations
pub type Result<T> = std::result::Result<T, MeshError>;

// Conversion from tokio mpsc send error
impl<T> From<tokio::sync::mpsc::error::SendError<T>> for MeshError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        MeshError::ControllerStopped
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for MeshError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        MeshError::ControllerStopped
    }
}
