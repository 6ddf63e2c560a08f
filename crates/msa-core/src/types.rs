//! Core types shared by the acquisition and calibration layers.
//!
//! All complex values are `num_complex::Complex64`. A raw value is the
//! baseband (magnitude, phase) reading of the front end converted to
//! rectangular form; a corrected value has the active calibration applied.

use num_complex::Complex64;
use serde::{Deserialize, Serialize};

/// Type alias for complex numbers using f64 precision
pub type Complex = Complex64;

/// What a sweep measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepMode {
    /// Reflection through a bridge (S11). OSL correction applies.
    #[default]
    Reflection,
    /// Transmission through a fixture (S21).
    Transmission,
}

/// How a DUT is attached in a transmission fixture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JigType {
    /// DUT in series between source and load
    Series,
    /// DUT shunted to ground across the through line
    Shunt,
}

/// Raw ADC codes decoded from one capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AdcSample {
    /// Magnitude detector code
    pub magnitude: u32,
    /// Phase detector code (already complemented to count upward)
    pub phase: u32,
}

impl AdcSample {
    /// Create a sample from decoded codes
    pub fn new(magnitude: u32, phase: u32) -> Self {
        Self { magnitude, phase }
    }
}

/// One measured point of a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepPoint {
    /// Point frequency in Hz
    pub frequency_hz: f64,
    /// Raw baseband value before correction
    pub raw: Complex,
    /// Value after calibration (equal to `raw` when uncalibrated)
    pub corrected: Complex,
    /// Set when the capture timed out and the point holds zero data
    #[serde(default)]
    pub timed_out: bool,
}

impl SweepPoint {
    /// Create an uncorrected point
    pub fn new(frequency_hz: f64, raw: Complex) -> Self {
        Self {
            frequency_hz,
            raw,
            corrected: raw,
            timed_out: false,
        }
    }

    /// Create the zero point recorded for a timed-out capture
    pub fn timed_out(frequency_hz: f64) -> Self {
        Self {
            frequency_hz,
            raw: Complex::new(0.0, 0.0),
            corrected: Complex::new(0.0, 0.0),
            timed_out: true,
        }
    }

    /// Replace the corrected value
    pub fn with_corrected(mut self, corrected: Complex) -> Self {
        self.corrected = corrected;
        self
    }
}
