//! One-port OSL error model.
//!
//! The bridge is modelled by three complex terms per frequency:
//!
//! ```text
//!   S = (M - b) / (a - c·M)
//! ```
//!
//! where `M` is the raw measurement and `S` the corrected reflection
//! coefficient. The terms are solved from the raw responses to three
//! standards with known reflection coefficients.

use serde::{Deserialize, Serialize};

use crate::numeric::{div_or, is_degenerate, safe_div, DEGENERACY_TOLERANCE, SATURATION_BOUND};
use crate::types::Complex;

/// Error-correction terms at one frequency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ErrorTerms {
    pub a: Complex,
    pub b: Complex,
    pub c: Complex,
}

impl Default for ErrorTerms {
    fn default() -> Self {
        Self::identity()
    }
}

impl ErrorTerms {
    /// Terms that leave a measurement unchanged
    pub fn identity() -> Self {
        Self {
            a: Complex::new(1.0, 0.0),
            b: Complex::new(0.0, 0.0),
            c: Complex::new(0.0, 0.0),
        }
    }

    /// Terms used when the first frequency is degenerate.
    ///
    /// A saturated `a` drives every corrected value toward zero instead of
    /// producing non-finite output.
    pub fn saturated() -> Self {
        Self {
            a: Complex::new(SATURATION_BOUND, 0.0),
            b: Complex::new(0.0, 0.0),
            c: Complex::new(0.0, 0.0),
        }
    }

    /// Correct one raw measurement
    pub fn apply(&self, measured: Complex) -> Complex {
        safe_div(measured - self.b, self.a - self.c * measured)
    }

    /// Component-wise interpolation between two term sets
    pub fn lerp(x: f64, x0: f64, x1: f64, lo: &ErrorTerms, hi: &ErrorTerms) -> ErrorTerms {
        use crate::numeric::lerp;
        ErrorTerms {
            a: lerp(x, x0, x1, lo.a, hi.a),
            b: lerp(x, x0, x1, lo.b, hi.b),
            c: lerp(x, x0, x1, lo.c, hi.c),
        }
    }
}

/// Actual reflection coefficients of the three standards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OslStandards {
    pub open: Complex,
    pub short: Complex,
    pub load: Complex,
}

impl Default for OslStandards {
    fn default() -> Self {
        Self {
            open: Complex::new(1.0, 0.0),
            short: Complex::new(-1.0, 0.0),
            load: Complex::new(0.0, 0.0),
        }
    }
}

/// Raw responses to the three standards at one frequency.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OslMeasurement {
    pub open: Complex,
    pub short: Complex,
    pub load: Complex,
}

/// Solve the error terms for one frequency.
///
/// Returns `None` when the system is degenerate (two standards measured
/// alike, or a null determinant); the caller substitutes its fallback.
pub fn solve_osl(standards: &OslStandards, measured: &OslMeasurement) -> Option<ErrorTerms> {
    let (s_o, s_s, s_l) = (standards.open, standards.short, standards.load);
    let (m_o, m_s, m_l) = (measured.open, measured.short, measured.load);

    let k1 = m_l - m_s;
    let k2 = m_s - m_o;
    let k3 = m_o - m_l;
    let k4 = s_l * s_s * k1;
    let k5 = s_o * s_s * k2;
    let k6 = s_l * s_o * k3;
    let k7 = s_o * k1;
    let k8 = s_l * k2;
    let k9 = s_s * k3;
    let d = k4 + k5 + k6;

    if is_degenerate(d, DEGENERACY_TOLERANCE) {
        return None;
    }
    let zero = Complex::new(0.0, 0.0);
    let (a, fa) = div_or(m_o * k7 + m_l * k8 + m_s * k9, d, zero, DEGENERACY_TOLERANCE);
    let (b, fb) = div_or(m_o * k4 + m_l * k5 + m_s * k6, d, zero, DEGENERACY_TOLERANCE);
    let (c, fc) = div_or(k7 + k8 + k9, d, zero, DEGENERACY_TOLERANCE);
    if fa || fb || fc {
        return None;
    }
    Some(ErrorTerms { a, b, c })
}
