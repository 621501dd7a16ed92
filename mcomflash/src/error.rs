//! Error types for mcomflash.

use std::io;
use thiserror::Error;

/// Result type for mcomflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for mcomflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Expected terminator was not received before the deadline.
    #[error("Timeout while {context}, received {partial:?}")]
    Timeout {
        /// What the channel was waiting for.
        context: String,
        /// Text captured before the deadline expired.
        partial: String,
    },

    /// Response arrived but lacks an expected marker or cannot be parsed.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The flasher explicitly reported a failure.
    #[error("Device error: {0}")]
    Device(String),

    /// A write block was rejected as corrupt on every attempt.
    #[error("CRC errors threshold exceeded: block at offset {offset:#x} rejected {attempts} times")]
    CrcThresholdExceeded {
        /// Byte offset of the rejected block within the source stream.
        offset: usize,
        /// Number of transmissions performed.
        attempts: usize,
    },

    /// Whole-range checksum mismatch after programming.
    #[error("Verification failed. Expected CRC {expected:#06x}, but read {actual:#06x}")]
    CrcMismatch {
        /// CRC computed over the source data.
        expected: u16,
        /// CRC reported by the flasher.
        actual: u16,
    },

    /// The request was rejected before talking to the device.
    #[error("Invalid request: {0}")]
    Precondition(String),

    /// No monitor prompt was seen on the serial line.
    #[error("BootROM UART terminal prompt not found")]
    MonitorNotFound,

    /// The uploaded flasher did not identify itself after `run`.
    #[error("QSPI Flasher does not respond, response {0:?}")]
    FlasherNotStarted(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn timeout(context: impl Into<String>, partial: impl Into<String>) -> Self {
        Self::Timeout {
            context: context.into(),
            partial: partial.into(),
        }
    }
}
