//! Sweep planning: frequency grids and start/stop ⇄ center/span conversion.
//!
//! Invalid ranges are normalized rather than rejected: a reversed range is
//! reordered, and a zero span or a point count of one produces exactly one
//! point at the start frequency.

use serde::{Deserialize, Serialize};

use crate::types::{JigType, SweepMode};

/// Lowest start frequency accepted for a logarithmic sweep
pub const MIN_LOG_START_HZ: f64 = 1e-6;

/// Frequency spacing of a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Spacing {
    /// Equal steps in Hz
    #[default]
    Linear,
    /// Equal ratios between adjacent points
    Log,
}

/// Configuration for one sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Start frequency in Hz
    pub start_hz: f64,
    /// Stop frequency in Hz
    pub stop_hz: f64,
    /// Number of points
    pub points: usize,
    /// Linear or logarithmic spacing
    pub spacing: Spacing,
    /// Step attenuator setting in dB
    pub attenuation_db: f64,
    /// Reflection or transmission measurement
    pub mode: SweepMode,
    /// Transmission fixture, if any
    pub jig: Option<JigType>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            start_hz: 1e6,
            stop_hz: 100e6,
            points: 201,
            spacing: Spacing::Linear,
            attenuation_db: 0.0,
            mode: SweepMode::Reflection,
            jig: None,
        }
    }
}

impl SweepConfig {
    /// Linear sweep over `[start_hz, stop_hz]`
    pub fn linear(start_hz: f64, stop_hz: f64, points: usize) -> Self {
        Self {
            start_hz,
            stop_hz,
            points,
            ..Default::default()
        }
    }

    /// Sweep described by center and span
    pub fn from_center_span(center_hz: f64, span_hz: f64, points: usize, spacing: Spacing) -> Self {
        let (start_hz, stop_hz) = cent_span_to_start_stop(center_hz, span_hz, spacing);
        Self {
            start_hz,
            stop_hz,
            points,
            spacing,
            ..Default::default()
        }
    }

    /// Builder: set the measurement mode
    pub fn with_mode(mut self, mode: SweepMode) -> Self {
        self.mode = mode;
        self
    }

    /// Builder: set the transmission fixture
    pub fn with_jig(mut self, jig: JigType) -> Self {
        self.jig = Some(jig);
        self
    }

    /// Builder: set the attenuator
    pub fn with_attenuation(mut self, db: f64) -> Self {
        self.attenuation_db = db;
        self
    }

    /// Ordered `(low, high)` range after normalization.
    pub fn range(&self) -> (f64, f64) {
        let (mut lo, hi) = if self.start_hz <= self.stop_hz {
            (self.start_hz, self.stop_hz)
        } else {
            (self.stop_hz, self.start_hz)
        };
        if self.spacing == Spacing::Log {
            lo = lo.max(MIN_LOG_START_HZ);
        }
        (lo, hi.max(lo))
    }

    /// True when the sweep collapses to a single point.
    pub fn is_single_point(&self) -> bool {
        let (lo, hi) = self.range();
        self.points <= 1 || lo == hi
    }

    /// Center and span of this sweep
    pub fn center_span(&self) -> (f64, f64) {
        let (lo, hi) = self.range();
        start_stop_to_cent_span(lo, hi, self.spacing)
    }

    /// Strictly increasing point frequencies.
    ///
    /// The first point is exactly the normalized start and the last exactly
    /// the stop, so 10–20 MHz in 11 linear points is exactly 10, 11, …, 20 MHz.
    pub fn frequency_points(&self) -> Vec<f64> {
        let (lo, hi) = self.range();
        if self.is_single_point() {
            return vec![lo];
        }
        let n = self.points;
        let last = (n - 1) as f64;
        let mut freqs: Vec<f64> = match self.spacing {
            Spacing::Linear => {
                let span = hi - lo;
                (0..n).map(|i| lo + span * i as f64 / last).collect()
            }
            Spacing::Log => {
                let log_lo = lo.log10();
                let log_span = hi.log10() - log_lo;
                (0..n)
                    .map(|i| 10f64.powf(log_lo + log_span * i as f64 / last))
                    .collect()
            }
        };
        freqs[0] = lo;
        freqs[n - 1] = hi;
        // Rounding on very narrow spans can repeat a value
        freqs.dedup_by(|b, a| *b <= *a);
        freqs
    }
}

/// Convert start/stop to center/span.
///
/// Log spacing uses the geometric center `sqrt(start·stop)`; span is always
/// `stop − start`.
pub fn start_stop_to_cent_span(start_hz: f64, stop_hz: f64, spacing: Spacing) -> (f64, f64) {
    let span = stop_hz - start_hz;
    let center = match spacing {
        Spacing::Linear => start_hz + span / 2.0,
        Spacing::Log => (start_hz * stop_hz).sqrt(),
    };
    (center, span)
}

/// Convert center/span back to start/stop; inverse of
/// [`start_stop_to_cent_span`].
pub fn cent_span_to_start_stop(center_hz: f64, span_hz: f64, spacing: Spacing) -> (f64, f64) {
    match spacing {
        Spacing::Linear => (center_hz - span_hz / 2.0, center_hz + span_hz / 2.0),
        Spacing::Log => {
            if center_hz <= 0.0 {
                return (center_hz, center_hz);
            }
            // start·stop = c², stop − start = span  ⇒  stop = c·g, start = c/g
            let r = span_hz / (2.0 * center_hz);
            let g = r + (r * r + 1.0).sqrt();
            (center_hz / g, center_hz * g)
        }
    }
}
