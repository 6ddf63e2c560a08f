//! Calibration Engine: Open/Short/Load vector error correction
//!
//! The engine walks a strictly linear procedure:
//!
//! ```text
//!   Idle ──begin──▶ MeasuringOpen ──▶ MeasuringShort ──▶ MeasuringLoad ──▶ Built
//!    ▲                   │                  │                  │
//!    └───────────── failure / cancel ───────┴──────────────────┘
//! ```
//!
//! Each measuring state consumes one full raw sweep of its standard. When the
//! load sweep arrives the table is solved and installed as the active
//! calibration in one step. A failure anywhere returns to `Idle` and leaves
//! the previously active calibration untouched.
//!
//! ## Example
//!
//! ```rust
//! use msa_core::calibration::{CalibrationEngine, CalibrationState};
//! use msa_core::types::{Complex, SweepPoint};
//!
//! let freqs = vec![1e6, 2e6, 3e6];
//! let sweep = |g: Complex| -> Vec<SweepPoint> {
//!     freqs.iter().map(|&f| SweepPoint::new(f, g)).collect()
//! };
//!
//! let mut engine = CalibrationEngine::default();
//! engine.begin(freqs.clone()).unwrap();
//! engine.submit(&sweep(Complex::new(1.0, 0.0))).unwrap();
//! engine.submit(&sweep(Complex::new(-1.0, 0.0))).unwrap();
//! let table = engine.submit(&sweep(Complex::new(0.0, 0.0))).unwrap().unwrap();
//!
//! assert_eq!(engine.state(), CalibrationState::Built);
//! assert!(table.apply_correction(Complex::new(0.0, 0.0), 2e6).norm() < 1e-12);
//! ```

pub mod osl;
pub mod persist;
pub mod table;

use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{info, warn};

pub use osl::{solve_osl, ErrorTerms, OslMeasurement, OslStandards};
pub use persist::{load_calibration, read_calibration, save_calibration, write_calibration};
pub use table::{CalibrationTable, ReferenceSweeps};

use crate::error::{CoreError, CoreResult};
use crate::sweep::Spacing;
use crate::types::{Complex, SweepPoint};

/// Compatibility tag written to and required of calibration files
pub const CALIBRATION_VERSION: &str = "1.03";

/// Relative tolerance when matching a reference sweep to the plan
const FREQUENCY_MATCH_TOLERANCE: f64 = 1e-9;

/// One of the three reference standards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Standard {
    Open,
    Short,
    Load,
}

impl Standard {
    /// Lowercase name
    pub fn name(self) -> &'static str {
        match self {
            Standard::Open => "open",
            Standard::Short => "short",
            Standard::Load => "load",
        }
    }
}

impl std::fmt::Display for Standard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Position in the calibration procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationState {
    Idle,
    MeasuringOpen,
    MeasuringShort,
    MeasuringLoad,
    Built,
}

impl CalibrationState {
    /// The standard this state is waiting for, if any
    pub fn pending_standard(self) -> Option<Standard> {
        match self {
            CalibrationState::MeasuringOpen => Some(Standard::Open),
            CalibrationState::MeasuringShort => Some(Standard::Short),
            CalibrationState::MeasuringLoad => Some(Standard::Load),
            CalibrationState::Idle | CalibrationState::Built => None,
        }
    }

    /// True while reference sweeps are being collected
    pub fn is_measuring(self) -> bool {
        self.pending_standard().is_some()
    }
}

/// Calibration status as reported to the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CalibrationStatus {
    /// No calibration is active
    Uncalibrated,
    /// Reference sweeps are in progress
    Building,
    /// A calibration is active over `[start_hz, stop_hz]`
    ValidForRange { start_hz: f64, stop_hz: f64 },
}

/// Read-mostly handle on the active calibration.
///
/// Readers take an `Arc` snapshot, so every point of one sweep sees a single
/// consistent table even if a new one is installed meanwhile.
#[derive(Debug, Clone, Default)]
pub struct ActiveCalibration {
    inner: Arc<RwLock<Option<Arc<CalibrationTable>>>>,
}

impl ActiveCalibration {
    /// Snapshot of the current table
    pub fn current(&self) -> Option<Arc<CalibrationTable>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace(&self, table: Option<Arc<CalibrationTable>>) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = table;
    }
}

/// Drives the OSL procedure and owns replacement of the active calibration.
#[derive(Debug)]
pub struct CalibrationEngine {
    state: CalibrationState,
    standards: OslStandards,
    reference_impedance: f64,
    spacing: Spacing,
    frequencies: Vec<f64>,
    open: Vec<Complex>,
    short: Vec<Complex>,
    active: ActiveCalibration,
}

impl Default for CalibrationEngine {
    fn default() -> Self {
        Self::new(OslStandards::default(), 50.0)
    }
}

impl CalibrationEngine {
    /// Create an engine with the given standard definitions
    pub fn new(standards: OslStandards, reference_impedance: f64) -> Self {
        Self {
            state: CalibrationState::Idle,
            standards,
            reference_impedance,
            spacing: Spacing::Linear,
            frequencies: Vec::new(),
            open: Vec::new(),
            short: Vec::new(),
            active: ActiveCalibration::default(),
        }
    }

    /// Current procedure state
    pub fn state(&self) -> CalibrationState {
        self.state
    }

    /// Shared handle on the active calibration
    pub fn active(&self) -> ActiveCalibration {
        self.active.clone()
    }

    /// Frequencies of the procedure in progress
    pub fn planned_frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    /// Status for the presentation layer
    pub fn status(&self) -> CalibrationStatus {
        if self.state.is_measuring() {
            return CalibrationStatus::Building;
        }
        match self.active.current() {
            Some(table) => {
                let (start_hz, stop_hz) = table.range();
                CalibrationStatus::ValidForRange { start_hz, stop_hz }
            }
            None => CalibrationStatus::Uncalibrated,
        }
    }

    /// Start a procedure over `frequencies` (strictly increasing).
    pub fn begin(&mut self, frequencies: Vec<f64>) -> CoreResult<()> {
        self.begin_with_spacing(frequencies, Spacing::Linear)
    }

    /// Start a procedure and record the spacing the sweeps use
    pub fn begin_with_spacing(&mut self, frequencies: Vec<f64>, spacing: Spacing) -> CoreResult<()> {
        if self.state.is_measuring() {
            return Err(CoreError::InvalidState(format!(
                "calibration already in progress ({:?})",
                self.state
            )));
        }
        if frequencies.is_empty() {
            return Err(CoreError::FrequencyMismatch {
                expected: 1,
                actual: 0,
            });
        }
        if let Some(w) = frequencies.windows(2).find(|w| w[1] <= w[0]) {
            return Err(CoreError::NonMonotonicFrequency {
                previous: w[0],
                next: w[1],
            });
        }
        info!(points = frequencies.len(), "Calibration started, measure open");
        self.frequencies = frequencies;
        self.spacing = spacing;
        self.open.clear();
        self.short.clear();
        self.state = CalibrationState::MeasuringOpen;
        Ok(())
    }

    /// Feed the raw sweep of the pending standard.
    ///
    /// Returns the new table after the load sweep. Any error returns the
    /// engine to `Idle` and leaves the active calibration unchanged.
    pub fn submit(&mut self, sweep: &[SweepPoint]) -> CoreResult<Option<Arc<CalibrationTable>>> {
        let Some(standard) = self.state.pending_standard() else {
            return Err(CoreError::InvalidState(format!(
                "no reference sweep expected in state {:?}",
                self.state
            )));
        };
        match self.accept(standard, sweep) {
            Ok(table) => Ok(table),
            Err(e) => {
                warn!(%standard, error = %e, "Calibration failed, back to idle");
                self.reset();
                Err(e)
            }
        }
    }

    fn accept(
        &mut self,
        standard: Standard,
        sweep: &[SweepPoint],
    ) -> CoreResult<Option<Arc<CalibrationTable>>> {
        let raw = self.match_sweep(sweep)?;
        match standard {
            Standard::Open => {
                self.open = raw;
                self.state = CalibrationState::MeasuringShort;
                info!("Open measured, measure short");
                Ok(None)
            }
            Standard::Short => {
                self.short = raw;
                self.state = CalibrationState::MeasuringLoad;
                info!("Short measured, measure load");
                Ok(None)
            }
            Standard::Load => {
                let references = ReferenceSweeps {
                    open: std::mem::take(&mut self.open),
                    short: std::mem::take(&mut self.short),
                    load: raw,
                };
                let table = Arc::new(CalibrationTable::build(
                    self.frequencies.clone(),
                    references,
                    &self.standards,
                    self.reference_impedance,
                    self.spacing,
                )?);
                self.active.replace(Some(table.clone()));
                self.state = CalibrationState::Built;
                info!(
                    points = table.len(),
                    degenerate_points = table.degenerate_points(),
                    "Calibration built"
                );
                Ok(Some(table))
            }
        }
    }

    fn match_sweep(&self, sweep: &[SweepPoint]) -> CoreResult<Vec<Complex>> {
        if sweep.len() != self.frequencies.len() {
            return Err(CoreError::FrequencyMismatch {
                expected: self.frequencies.len(),
                actual: sweep.len(),
            });
        }
        for (p, &f) in sweep.iter().zip(&self.frequencies) {
            if (p.frequency_hz - f).abs() > FREQUENCY_MATCH_TOLERANCE * f.abs().max(1.0) {
                return Err(CoreError::InvalidState(format!(
                    "reference point at {} Hz, expected {} Hz",
                    p.frequency_hz, f
                )));
            }
        }
        Ok(sweep.iter().map(|p| p.raw).collect())
    }

    /// Abandon a procedure in progress.
    pub fn cancel(&mut self) {
        if self.state.is_measuring() {
            info!(state = ?self.state, "Calibration cancelled");
            self.reset();
        }
    }

    fn reset(&mut self) {
        self.open.clear();
        self.short.clear();
        self.state = CalibrationState::Idle;
    }

    /// Install an externally built table as the active calibration.
    pub fn install(&mut self, table: CalibrationTable) -> CoreResult<Arc<CalibrationTable>> {
        if self.state.is_measuring() {
            return Err(CoreError::InvalidState(
                "cannot install a calibration while measuring".into(),
            ));
        }
        if table.version != CALIBRATION_VERSION {
            return Err(CoreError::CalibrationVersionMismatch {
                found: table.version.clone(),
                expected: CALIBRATION_VERSION.to_string(),
            });
        }
        let table = Arc::new(table);
        self.active.replace(Some(table.clone()));
        self.state = CalibrationState::Built;
        Ok(table)
    }

    /// Load a calibration file and make it active.
    ///
    /// On any error the previous calibration stays active.
    pub fn load(&mut self, path: &Path) -> CoreResult<Arc<CalibrationTable>> {
        if self.state.is_measuring() {
            return Err(CoreError::InvalidState(
                "cannot load a calibration while measuring".into(),
            ));
        }
        let table = load_calibration(path)?;
        self.install(table)
    }

    /// Save the active calibration
    pub fn save(&self, path: &Path) -> CoreResult<()> {
        let table = self
            .active
            .current()
            .ok_or_else(|| CoreError::InvalidState("no active calibration".into()))?;
        save_calibration(&table, path)
    }

    /// Drop the active calibration
    pub fn clear(&mut self) {
        self.cancel();
        self.active.replace(None);
        self.state = CalibrationState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;
    use tempfile::TempDir;

    const FREQS: [f64; 3] = [1e6, 2e6, 3e6];

    fn sweep_of(freqs: &[f64], g: Complex) -> Vec<SweepPoint> {
        freqs.iter().map(|&f| SweepPoint::new(f, g)).collect()
    }

    fn calibrate_ideal(engine: &mut CalibrationEngine) -> Arc<CalibrationTable> {
        engine.begin(FREQS.to_vec()).unwrap();
        engine
            .submit(&sweep_of(&FREQS, Complex::from_polar(1.0, 0.0)))
            .unwrap();
        engine
            .submit(&sweep_of(&FREQS, Complex::from_polar(1.0, PI)))
            .unwrap();
        engine
            .submit(&sweep_of(&FREQS, Complex::new(0.0, 0.0)))
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_state_sequence() {
        let mut engine = CalibrationEngine::default();
        assert_eq!(engine.status(), CalibrationStatus::Uncalibrated);
        engine.begin(FREQS.to_vec()).unwrap();
        assert_eq!(engine.state(), CalibrationState::MeasuringOpen);
        assert_eq!(engine.status(), CalibrationStatus::Building);
        engine.submit(&sweep_of(&FREQS, Complex::new(1.0, 0.0))).unwrap();
        assert_eq!(engine.state(), CalibrationState::MeasuringShort);
        engine.submit(&sweep_of(&FREQS, Complex::new(-1.0, 0.0))).unwrap();
        assert_eq!(engine.state(), CalibrationState::MeasuringLoad);
        engine.submit(&sweep_of(&FREQS, Complex::new(0.0, 0.0))).unwrap();
        assert_eq!(engine.state(), CalibrationState::Built);
        assert_eq!(
            engine.status(),
            CalibrationStatus::ValidForRange {
                start_hz: 1e6,
                stop_hz: 3e6
            }
        );
    }

    #[test]
    fn test_remeasured_load_corrects_to_zero() {
        let mut engine = CalibrationEngine::default();
        let table = calibrate_ideal(&mut engine);
        for p in sweep_of(&FREQS, Complex::new(0.0, 0.0)) {
            let corrected = table.apply_correction(p.raw, p.frequency_hz);
            assert!(corrected.norm() < 1e-12);
        }
    }

    #[test]
    fn test_failure_preserves_previous_calibration() {
        let mut engine = CalibrationEngine::default();
        let first = calibrate_ideal(&mut engine);

        engine.begin(FREQS.to_vec()).unwrap();
        engine.submit(&sweep_of(&FREQS, Complex::new(1.0, 0.0))).unwrap();
        // Short sweep with a missing point
        let err = engine
            .submit(&sweep_of(&FREQS[..2], Complex::new(-1.0, 0.0)))
            .unwrap_err();
        assert!(matches!(err, CoreError::FrequencyMismatch { .. }));
        assert_eq!(engine.state(), CalibrationState::Idle);

        let active = engine.active().current().unwrap();
        assert!(Arc::ptr_eq(&active, &first));
    }

    #[test]
    fn test_submit_when_idle_is_rejected() {
        let mut engine = CalibrationEngine::default();
        let err = engine.submit(&sweep_of(&FREQS, Complex::new(1.0, 0.0)));
        assert!(matches!(err, Err(CoreError::InvalidState(_))));
    }

    #[test]
    fn test_begin_twice_is_rejected() {
        let mut engine = CalibrationEngine::default();
        engine.begin(FREQS.to_vec()).unwrap();
        assert!(engine.begin(FREQS.to_vec()).is_err());
        engine.cancel();
        assert_eq!(engine.state(), CalibrationState::Idle);
        assert!(engine.begin(FREQS.to_vec()).is_ok());
    }

    #[test]
    fn test_wrong_frequencies_rejected() {
        let mut engine = CalibrationEngine::default();
        engine.begin(FREQS.to_vec()).unwrap();
        let err = engine.submit(&sweep_of(&[1e6, 2e6, 4e6], Complex::new(1.0, 0.0)));
        assert!(err.is_err());
        assert_eq!(engine.state(), CalibrationState::Idle);
    }

    #[test]
    fn test_bad_load_keeps_prior_table() {
        let dir = TempDir::new().unwrap();
        let mut engine = CalibrationEngine::default();
        let first = calibrate_ideal(&mut engine);

        let path = dir.path().join("old.json");
        std::fs::write(
            &path,
            r#"{"version": "0.99", "reference_impedance": 50.0, "records": []}"#,
        )
        .unwrap();
        let err = engine.load(&path).unwrap_err();
        assert!(matches!(err, CoreError::CalibrationVersionMismatch { .. }));
        assert!(Arc::ptr_eq(&engine.active().current().unwrap(), &first));
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cal.json");
        let mut engine = CalibrationEngine::default();
        let built = calibrate_ideal(&mut engine);
        engine.save(&path).unwrap();

        let mut other = CalibrationEngine::default();
        let loaded = other.load(&path).unwrap();
        assert_eq!(loaded.terms(), built.terms());
        assert_eq!(other.state(), CalibrationState::Built);
    }
}
