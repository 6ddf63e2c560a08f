//! Detector conversion: ADC codes to magnitude and phase.
//!
//! The magnitude channel is a log detector. Without a path calibration its
//! code maps linearly onto a 200 dB span centred on 0 dBm:
//!
//! ```text
//!   dB = (code / 2^bits - 0.5) · 200
//! ```
//!
//! A magnitude table replaces that estimate with a measured ADC to dBm curve
//! and supplies a phase offset per code. A frequency table adds a dB
//! correction that depends on the point frequency. Both come from the text
//! files the path calibration writes: header lines start with `*` or carry a
//! `Key=` tag, data lines hold `adc dbm phase` or `mhz db`, ordered by their
//! first column.
//!
//! Raw values are referenced to 0 dBm, so a 0 dBm reading has unit
//! magnitude.
//!
//! ## Example
//!
//! ```rust
//! use msa_core::detector::{linear_code, Detector};
//! use msa_core::AdcSample;
//!
//! let detector = Detector::new(16);
//! let sample = AdcSample::new(linear_code(-6.0, 16), 0);
//! let z = detector.to_complex(sample, 10e6);
//! assert!((z.norm() - 0.501).abs() < 1e-3);
//! ```

use std::path::Path;

use tracing::info;

use crate::config::DetectorConfig;
use crate::error::{CoreError, CoreResult};
use crate::numeric::{from_db_deg, interp, mod_degree};
use crate::types::{AdcSample, Complex};

/// dB covered by the full magnitude code range
pub const DETECTOR_SPAN_DB: f64 = 200.0;

/// A phase offset at least this large marks the phase reading invalid
const INVALID_PHASE_OFFSET_DEG: f64 = 179.0;

fn full_scale(bits: u32) -> f64 {
    (1u64 << bits.clamp(1, 32)) as f64
}

/// Code that the fixed mapping reads as `db`, clamped to the code range.
pub fn linear_code(db: f64, bits: u32) -> u32 {
    let full = full_scale(bits);
    let code = ((db / DETECTOR_SPAN_DB + 0.5) * full).round();
    if code.is_nan() {
        return 0;
    }
    code.clamp(0.0, full - 1.0) as u32
}

/// Rows of `fields` numbers, skipping headers and lines of other widths.
fn data_rows(text: &str, fields: usize, what: &str) -> CoreResult<Vec<Vec<f64>>> {
    let mut rows = Vec::new();
    for (n, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('*') || line.contains('=') {
            continue;
        }
        let words: Vec<&str> = line.split_whitespace().collect();
        if words.len() != fields {
            continue;
        }
        let row = words
            .iter()
            .map(|w| w.parse::<f64>())
            .collect::<Result<Vec<f64>, _>>()
            .map_err(|e| {
                CoreError::CalibrationParse(format!("{} line {}: {}", what, n + 1, e))
            })?;
        rows.push(row);
    }
    Ok(rows)
}

fn check_increasing(xs: &[f64], what: &str) -> CoreResult<()> {
    if xs.is_empty() {
        return Err(CoreError::CalibrationParse(format!("{} has no entries", what)));
    }
    if let Some(w) = xs.windows(2).find(|w| w[1] <= w[0] || w[1].is_nan()) {
        return Err(CoreError::CalibrationParse(format!(
            "{} not in increasing order: {} follows {}",
            what, w[1], w[0]
        )));
    }
    Ok(())
}

fn read_table(path: &Path) -> CoreResult<String> {
    std::fs::read_to_string(path).map_err(|e| {
        CoreError::CalibrationParse(format!("{}: {}", path.display(), e))
    })
}

/// Measured detector curve: dBm and phase offset per ADC code.
#[derive(Debug, Clone, PartialEq)]
pub struct MagnitudeTable {
    adc: Vec<f64>,
    dbm: Vec<f64>,
    phase_deg: Vec<f64>,
}

impl MagnitudeTable {
    /// Build from `(adc, dbm, phase_deg)` rows in increasing ADC order.
    pub fn new(rows: Vec<(u32, f64, f64)>) -> CoreResult<Self> {
        let mut table = Self {
            adc: Vec::with_capacity(rows.len()),
            dbm: Vec::with_capacity(rows.len()),
            phase_deg: Vec::with_capacity(rows.len()),
        };
        for (adc, dbm, phase) in rows {
            table.adc.push(f64::from(adc));
            table.dbm.push(dbm);
            table.phase_deg.push(phase);
        }
        check_increasing(&table.adc, "magnitude table")?;
        Ok(table)
    }

    /// Parse the `adc dbm phase` text form.
    pub fn parse(text: &str) -> CoreResult<Self> {
        let rows = data_rows(text, 3, "magnitude table")?;
        let mut table = Self {
            adc: Vec::with_capacity(rows.len()),
            dbm: Vec::with_capacity(rows.len()),
            phase_deg: Vec::with_capacity(rows.len()),
        };
        for r in rows {
            table.adc.push(r[0]);
            table.dbm.push(r[1]);
            table.phase_deg.push(r[2]);
        }
        check_increasing(&table.adc, "magnitude table")?;
        Ok(table)
    }

    pub fn load(path: &Path) -> CoreResult<Self> {
        Self::parse(&read_table(path)?)
    }

    pub fn len(&self) -> usize {
        self.adc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adc.is_empty()
    }

    /// Input level in dBm for `code`
    pub fn dbm(&self, code: u32) -> f64 {
        interp(f64::from(code), &self.adc, &self.dbm)
    }

    /// Phase error of the detector at `code`, in degrees
    pub fn phase_offset_deg(&self, code: u32) -> f64 {
        interp(f64::from(code), &self.adc, &self.phase_deg)
    }
}

/// Path gain correction in dB against frequency.
#[derive(Debug, Clone, PartialEq)]
pub struct FrequencyTable {
    mhz: Vec<f64>,
    db: Vec<f64>,
}

impl FrequencyTable {
    /// Build from `(mhz, db)` rows in increasing frequency order.
    pub fn new(rows: Vec<(f64, f64)>) -> CoreResult<Self> {
        let (mhz, db): (Vec<f64>, Vec<f64>) = rows.into_iter().unzip();
        check_increasing(&mhz, "frequency table")?;
        Ok(Self { mhz, db })
    }

    /// Parse the `mhz db` text form.
    pub fn parse(text: &str) -> CoreResult<Self> {
        let rows = data_rows(text, 2, "frequency table")?;
        Self::new(rows.into_iter().map(|r| (r[0], r[1])).collect())
    }

    pub fn load(path: &Path) -> CoreResult<Self> {
        Self::parse(&read_table(path)?)
    }

    pub fn len(&self) -> usize {
        self.mhz.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mhz.is_empty()
    }

    /// dB to add at `frequency_hz`; the edge values hold outside the table
    pub fn correction_db(&self, frequency_hz: f64) -> f64 {
        interp(frequency_hz / 1e6, &self.mhz, &self.db)
    }
}

/// Converts one capture to a complex value referenced to 0 dBm.
#[derive(Debug, Clone, PartialEq)]
pub struct Detector {
    bits: u32,
    magnitude: Option<MagnitudeTable>,
    frequency: Option<FrequencyTable>,
}

impl Detector {
    /// Fixed log mapping for a `bits`-wide ADC
    pub fn new(bits: u32) -> Self {
        Self {
            bits: bits.clamp(1, 32),
            magnitude: None,
            frequency: None,
        }
    }

    /// Load the tables named in `config`.
    pub fn from_config(bits: u32, config: &DetectorConfig) -> CoreResult<Self> {
        let mut detector = Self::new(bits);
        if let Some(path) = &config.magnitude_table {
            let table = MagnitudeTable::load(path)?;
            info!(path = %path.display(), entries = table.len(), "Magnitude table loaded");
            detector.magnitude = Some(table);
        }
        if let Some(path) = &config.frequency_table {
            let table = FrequencyTable::load(path)?;
            info!(path = %path.display(), entries = table.len(), "Frequency table loaded");
            detector.frequency = Some(table);
        }
        Ok(detector)
    }

    pub fn with_magnitude_table(mut self, table: MagnitudeTable) -> Self {
        self.magnitude = Some(table);
        self
    }

    pub fn with_frequency_table(mut self, table: FrequencyTable) -> Self {
        self.frequency = Some(table);
        self
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Level in dB for a magnitude code taken at `frequency_hz`.
    pub fn magnitude_db(&self, code: u32, frequency_hz: f64) -> f64 {
        let db = match &self.magnitude {
            Some(t) => t.dbm(code),
            None => (f64::from(code) / full_scale(self.bits) - 0.5) * DETECTOR_SPAN_DB,
        };
        match &self.frequency {
            Some(t) => db + t.correction_db(frequency_hz),
            None => db,
        }
    }

    /// Phase in degrees, (-180, 180].
    ///
    /// With a magnitude table the offset at the sample's magnitude code is
    /// removed; an offset near ±180° means the phase is unusable and reads 0.
    pub fn phase_deg(&self, sample: AdcSample) -> f64 {
        let deg = mod_degree(f64::from(sample.phase) / full_scale(self.bits) * 360.0);
        match &self.magnitude {
            Some(t) => {
                let offset = t.phase_offset_deg(sample.magnitude);
                if offset.abs() >= INVALID_PHASE_OFFSET_DEG {
                    0.0
                } else {
                    mod_degree(deg - offset)
                }
            }
            None => deg,
        }
    }

    pub fn to_complex(&self, sample: AdcSample, frequency_hz: f64) -> Complex {
        from_db_deg(
            self.magnitude_db(sample.magnitude, frequency_hz),
            self.phase_deg(sample),
        )
    }
}
