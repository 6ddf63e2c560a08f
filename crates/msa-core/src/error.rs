//! Core error types

use thiserror::Error;

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by the calibration, trace and configuration layers.
///
/// Numeric degeneracy is deliberately absent: near-zero denominators are
/// absorbed by the fallback helpers in [`crate::numeric`] and only counted.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Calibration file written by an incompatible version
    #[error("Calibration version mismatch: file has {found}, need {expected}")]
    CalibrationVersionMismatch { found: String, expected: String },

    /// Calibration file is unreadable or malformed
    #[error("Calibration parse error: {0}")]
    CalibrationParse(String),

    /// A calibration was requested before all reference sweeps were taken
    #[error("Calibration incomplete: missing {0} reference")]
    CalibrationIncomplete(&'static str),

    /// A reference sweep does not line up with the calibration frequencies
    #[error("Frequency mismatch: expected {expected} points, got {actual}")]
    FrequencyMismatch { expected: usize, actual: usize },

    /// Sweep points must be strictly increasing in frequency
    #[error("Non-monotonic frequency: {next} Hz does not follow {previous} Hz")]
    NonMonotonicFrequency { previous: f64, next: f64 },

    /// Operation not allowed in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Underlying file I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
