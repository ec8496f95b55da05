//! Error types for ymuploader.

use std::io;
use thiserror::Error;

/// Result type for ymuploader operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for ymuploader operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Device did not respond or never entered DFU mode.
    #[error("Device not found or did not enter boot mode")]
    DeviceNotFound,

    /// Baud-rate auto-detection exhausted every candidate rate.
    #[error("Detect baudrate fail, can not get the baudrate")]
    BaudDetectFailed,

    /// AT-command handshake did not reach the expected state.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Unexpected byte or framing at a protocol wait point.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// YMODEM transfer was cancelled or exhausted its retry budget.
    #[error("YMODEM error: {0}")]
    Ymodem(String),
}
