//! Hardware-side error types

use msa_core::CoreError;
use thiserror::Error;

/// Result type for hardware operations
pub type HalResult<T> = Result<T, HalError>;

/// Errors surfaced by the device link, sweep controller and session.
///
/// Sync mismatches and read timeouts are not errors: they are counted in
/// [`crate::link::SyncStats`] and recorded as zero points respectively.
#[derive(Error, Debug)]
pub enum HalError {
    /// No device answered
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// The byte channel failed or returned something unframeable
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Device firmware is not the required version
    #[error("Firmware mismatch: device has {found}, need {required}")]
    FirmwareMismatch { found: String, required: String },

    /// Invalid setting (frequency out of synthesizer range, bad sweep)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Request rejected because an operation is in progress
    #[error("Busy: {0}")]
    Busy(&'static str),

    /// Worker thread could not be started or joined
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Calibration, trace or configuration error
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl HalError {
    /// Transport errors end the session's ability to acquire
    pub fn is_fatal(&self) -> bool {
        matches!(self, HalError::DeviceNotFound(_) | HalError::ConnectionLost(_))
    }
}
