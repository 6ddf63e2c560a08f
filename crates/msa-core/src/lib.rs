//! # MSA Core
//!
//! Pure measurement math for the MSA vector front end: sweep planning,
//! Open/Short/Load calibration, series/shunt two-port transforms and the
//! shared trace store. Nothing here touches the hardware; `msa-hal` drives
//! the device and feeds raw sweeps into these types.
//!
//! ## Data flow
//!
//! ```text
//! SweepConfig ──▶ frequency_points ──▶ (msa-hal captures raw Complex per point)
//!                                              │
//!                   CalibrationTable ──▶ PointCorrection ──▶ TraceStore ──▶ display
//! ```
//!
//! ## Example
//!
//! ```rust
//! use msa_core::sweep::SweepConfig;
//! use msa_core::two_port::{vswr, s11_from_impedance};
//! use msa_core::Complex;
//!
//! let freqs = SweepConfig::linear(10e6, 20e6, 11).frequency_points();
//! assert_eq!(freqs[1], 11e6);
//!
//! let s11 = s11_from_impedance(Complex::new(100.0, 0.0), 50.0);
//! assert!((vswr(s11) - 2.0).abs() < 1e-12);
//! ```

pub mod calibration;
pub mod config;
pub mod detector;
pub mod error;
pub mod numeric;
pub mod observe;
pub mod sweep;
pub mod trace;
pub mod two_port;
pub mod types;

pub use calibration::{
    ActiveCalibration, CalibrationEngine, CalibrationState, CalibrationStatus, CalibrationTable,
    ErrorTerms, OslStandards, Standard, CALIBRATION_VERSION,
};
pub use config::MsaConfig;
pub use detector::Detector;
pub use error::{CoreError, CoreResult};
pub use sweep::{Spacing, SweepConfig};
pub use trace::{PointCorrection, Trace, TraceStore, TraceUpdate};
pub use types::{AdcSample, Complex, JigType, SweepMode, SweepPoint};
