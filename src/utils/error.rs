//! Error handling for the hardware service.
//!
//! All hardware-facing failures are absorbed at the driver/transport boundary
//! and translated into status fields or boolean results; these error types
//! never cross the device manager's public operations.

use thiserror::Error;

/// Hardware service error type
#[derive(Error, Debug, Clone)]
pub enum PvSrvError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    IoError(String),

    /// Serial port open/access errors
    #[error("Serial error: {0}")]
    SerialError(String),

    /// Malformed or unexpected protocol frames
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Operation timeout errors
    #[error("Timeout error: {0}")]
    TimeoutError(String),

    /// Modbus exception response from the remote station
    #[error("Modbus exception 0x{0:02X}")]
    ModbusException(u8),

    /// Not connected error
    #[error("Not connected")]
    NotConnected,

    /// Invalid data format or content errors
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Device lookup failures
    #[error("Device not found: {0}")]
    DeviceNotFound(String),
}

/// Result type alias for the hardware service
pub type Result<T> = std::result::Result<T, PvSrvError>;

impl From<std::io::Error> for PvSrvError {
    fn from(err: std::io::Error) -> Self {
        PvSrvError::IoError(err.to_string())
    }
}

impl From<tokio_serial::Error> for PvSrvError {
    fn from(err: tokio_serial::Error) -> Self {
        PvSrvError::SerialError(err.to_string())
    }
}

impl From<serde_yaml::Error> for PvSrvError {
    fn from(err: serde_yaml::Error) -> Self {
        PvSrvError::ConfigError(err.to_string())
    }
}
