//! Per-frequency calibration table and correction lookup.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use super::osl::{solve_osl, ErrorTerms, OslMeasurement, OslStandards};
use super::CALIBRATION_VERSION;
use crate::error::{CoreError, CoreResult};
use crate::sweep::Spacing;
use crate::types::Complex;

/// Raw responses to the three standards, one value per table frequency.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferenceSweeps {
    pub open: Vec<Complex>,
    pub short: Vec<Complex>,
    pub load: Vec<Complex>,
}

/// A complete calibration: error terms for every table frequency.
///
/// Built only by the calibration procedure or loaded whole from a file, then
/// shared read-only. Recalibration replaces the table; it is never patched.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationTable {
    /// Compatibility version tag
    pub version: String,
    /// Creation time, seconds since the Unix epoch
    pub created: u64,
    /// Reference impedance the standards were defined against
    pub reference_impedance: f64,
    /// Spacing of the reference sweeps
    pub spacing: Spacing,
    frequencies: Vec<f64>,
    terms: Vec<ErrorTerms>,
    references: Option<ReferenceSweeps>,
    degenerate_points: usize,
}

impl CalibrationTable {
    /// Solve a table from three reference sweeps taken at `frequencies`.
    ///
    /// A frequency whose system is degenerate reuses the previous frequency's
    /// terms, or [`ErrorTerms::saturated`] when it is the first.
    pub fn build(
        frequencies: Vec<f64>,
        references: ReferenceSweeps,
        standards: &OslStandards,
        reference_impedance: f64,
        spacing: Spacing,
    ) -> CoreResult<Self> {
        check_monotonic(&frequencies)?;
        let sweeps = [
            ("open", &references.open),
            ("short", &references.short),
            ("load", &references.load),
        ];
        for (name, r) in sweeps {
            if r.is_empty() {
                return Err(CoreError::CalibrationIncomplete(name));
            }
            if r.len() != frequencies.len() {
                return Err(CoreError::FrequencyMismatch {
                    expected: frequencies.len(),
                    actual: r.len(),
                });
            }
        }

        let mut terms: Vec<ErrorTerms> = Vec::with_capacity(frequencies.len());
        let mut degenerate_points = 0;
        for (i, &f) in frequencies.iter().enumerate() {
            let m = OslMeasurement {
                open: references.open[i],
                short: references.short[i],
                load: references.load[i],
            };
            let t = match solve_osl(standards, &m) {
                Some(t) => t,
                None => {
                    degenerate_points += 1;
                    warn!(frequency_hz = f, "Degenerate OSL system, reusing previous terms");
                    terms.last().copied().unwrap_or_else(ErrorTerms::saturated)
                }
            };
            terms.push(t);
        }
        debug!(
            points = frequencies.len(),
            degenerate_points, "Calibration table solved"
        );

        Ok(Self {
            version: CALIBRATION_VERSION.to_string(),
            created: now_unix(),
            reference_impedance,
            spacing,
            frequencies,
            terms,
            references: Some(references),
            degenerate_points,
        })
    }

    /// Assemble a table from stored records (no reference sweeps).
    pub fn from_records(
        version: String,
        created: u64,
        reference_impedance: f64,
        spacing: Spacing,
        records: Vec<(f64, ErrorTerms)>,
    ) -> CoreResult<Self> {
        if records.is_empty() {
            return Err(CoreError::CalibrationParse("no calibration records".into()));
        }
        let (frequencies, terms): (Vec<f64>, Vec<ErrorTerms>) = records.into_iter().unzip();
        check_monotonic(&frequencies)?;
        Ok(Self {
            version,
            created,
            reference_impedance,
            spacing,
            frequencies,
            terms,
            references: None,
            degenerate_points: 0,
        })
    }

    /// Table frequencies in Hz
    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    /// Error terms, parallel to [`Self::frequencies`]
    pub fn terms(&self) -> &[ErrorTerms] {
        &self.terms
    }

    /// Reference sweeps, present when the table was built in this session
    pub fn references(&self) -> Option<&ReferenceSweeps> {
        self.references.as_ref()
    }

    /// Number of frequencies that needed the degeneracy fallback
    pub fn degenerate_points(&self) -> usize {
        self.degenerate_points
    }

    /// Number of table frequencies
    pub fn len(&self) -> usize {
        self.frequencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frequencies.is_empty()
    }

    /// Frequency range covered by the table
    pub fn range(&self) -> (f64, f64) {
        match (self.frequencies.first(), self.frequencies.last()) {
            (Some(&lo), Some(&hi)) => (lo, hi),
            _ => (0.0, 0.0),
        }
    }

    /// True when `[start_hz, stop_hz]` lies within the table range.
    pub fn covers(&self, start_hz: f64, stop_hz: f64) -> bool {
        let (lo, hi) = self.range();
        let (a, b) = if start_hz <= stop_hz {
            (start_hz, stop_hz)
        } else {
            (stop_hz, start_hz)
        };
        let slack = 1e-9 * hi.abs().max(1.0);
        !self.is_empty() && a >= lo - slack && b <= hi + slack
    }

    /// Error terms at `frequency_hz`.
    ///
    /// Interpolates linearly between the bracketing table frequencies and
    /// clamps to the edge terms outside the table.
    pub fn coefficients_at(&self, frequency_hz: f64) -> ErrorTerms {
        let n = self.frequencies.len();
        if n == 0 {
            return ErrorTerms::identity();
        }
        if frequency_hz <= self.frequencies[0] {
            return self.terms[0];
        }
        if frequency_hz >= self.frequencies[n - 1] {
            return self.terms[n - 1];
        }
        // First index with f > frequency_hz; 1 <= hi <= n - 1 here
        let hi = self.frequencies.partition_point(|&f| f <= frequency_hz);
        let lo = hi - 1;
        if self.frequencies[lo] == frequency_hz {
            return self.terms[lo];
        }
        ErrorTerms::lerp(
            frequency_hz,
            self.frequencies[lo],
            self.frequencies[hi],
            &self.terms[lo],
            &self.terms[hi],
        )
    }

    /// Apply the correction at `frequency_hz` to a raw reflection value.
    pub fn apply_correction(&self, raw: Complex, frequency_hz: f64) -> Complex {
        self.coefficients_at(frequency_hz).apply(raw)
    }
}

fn check_monotonic(frequencies: &[f64]) -> CoreResult<()> {
    if frequencies.is_empty() {
        return Err(CoreError::FrequencyMismatch {
            expected: 1,
            actual: 0,
        });
    }
    for w in frequencies.windows(2) {
        if w[1] <= w[0] || w[1].is_nan() {
            return Err(CoreError::NonMonotonicFrequency {
                previous: w[0],
                next: w[1],
            });
        }
    }
    Ok(())
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
