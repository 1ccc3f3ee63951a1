//! Custom error types for the application.
//!
//! Two error enums, both built with `thiserror`:
//!
//! - **`DaqError`**: crate-level errors surfaced to the caller of the session manager,
//!   the configuration loader and the CSV import. Connection failures at start carry the
//!   failing [`DeviceKind`] so the caller can tell which device could not be opened.
//! - **`ReadError`**: a single failed device read. These are transient by nature; each
//!   reader decides what a failure means for its channel (the power meter drops the whole
//!   sample, the analog module falls back to a fixed value, the distance sensor keeps its
//!   last reading).
//!
//! By using `#[from]`, `DaqError` can be created from underlying error types with `?`.

use crate::devices::DeviceKind;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Errors surfaced by the session manager, configuration and import.
#[derive(Error, Debug)]
pub enum DaqError {
    /// The configuration sources could not be read or merged.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// A loaded configuration value is out of range.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// A session CSV could not be read.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// A device could not be opened at start.
    #[error("Failed to connect {device}: {source:#}")]
    DeviceConnect {
        /// The device that failed
        device: DeviceKind,
        /// Why the connector gave up
        #[source]
        source: anyhow::Error,
    },

    /// The session file could not be created, written or moved.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A recorded session file could not be imported.
    #[error("Import error: {0}")]
    Import(String),

    /// `start` was called while a session is running.
    #[error("Acquisition already running")]
    AlreadyAcquiring,

    /// A stop is finalizing the previous session.
    #[error("Session is finalizing")]
    Finalizing,
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl DaqError {
    /// The device that failed to connect, if this is a start-time connection error.
    pub fn failed_device(&self) -> Option<DeviceKind> {
        match self {
            DaqError::DeviceConnect { device, .. } => Some(*device),
            _ => None,
        }
    }
}

/// A single failed read from a device.
#[derive(Error, Debug)]
pub enum ReadError {
    /// No complete answer within the I/O timeout.
    #[error("Device did not answer within {0:?}")]
    Timeout(std::time::Duration),

    /// The port reported an error.
    #[error("Serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The port was closed under the reader.
    #[error("Unexpected EOF from serial port")]
    UnexpectedEof,

    /// The frame trailer does not match its content.
    #[error("CRC mismatch: expected {expected:#06x}, received {received:#06x}")]
    CrcMismatch {
        /// CRC computed over the received frame
        expected: u16,
        /// CRC carried in the frame trailer
        received: u16,
    },

    /// The device answered with a Modbus exception.
    #[error("Modbus exception {code:#04x} for function {function:#04x}")]
    Exception {
        /// Function code of the request
        function: u8,
        /// Exception code
        code: u8,
    },

    /// A frame with the wrong address, function or length.
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// A reply whose payload is not a number.
    #[error("Failed to parse response '{0}'")]
    Parse(String),
}
