//! Two-Port Transform: S21/S11 conversion and derived reflection quantities
//!
//! Pure functions relating a DUT impedance to the reflection coefficient seen
//! through a bridge and to the transmission coefficient seen through a series
//! or shunt fixture:
//!
//! ```text
//!   S11 = (Z - R0) / (Z + R0)
//!   series jig:  S21 = 2·R0 / (Z + 2·R0)      Z = 2·R0·(1/S21 - 1)
//!   shunt jig:   S21 = 2·Z / (2·Z + R0)       Z = R0 / (2·(1/S21 - 1))
//! ```
//!
//! ## Example
//!
//! ```rust
//! use msa_core::two_port::{equiv_s11_from_s21, s21_from_s11};
//! use msa_core::types::{Complex, JigType};
//!
//! let s11 = Complex::new(0.2, -0.1);
//! let s21 = s21_from_s11(s11, JigType::Series, 50.0);
//! let (back, _z) = equiv_s11_from_s21(s21, JigType::Series, 50.0, false);
//! assert!((back - s11).norm() < 1e-12);
//! ```

use crate::numeric::{
    div_or, par2, par3, polar_db_deg, safe_div, safe_log10, saturate, saturating_recip,
    CircuitMode, DEGENERACY_TOLERANCE, SATURATION_BOUND,
};
use crate::types::{Complex, JigType};

/// Largest |S11| used when computing VSWR
const VSWR_MAG_LIMIT: f64 = 0.9999;

/// Derive the equivalent one-port S11 (and DUT impedance) from a measured S21.
///
/// An infinite intermediate saturates to [`SATURATION_BOUND`] and NaN becomes
/// zero, so zero transmission reads as an open through a series jig and a
/// short across a shunt jig. With `truncate_to_unity` set, an |S11| above 1 is
/// moved onto the unit circle keeping its phase.
pub fn equiv_s11_from_s21(
    s21: Complex,
    jig: JigType,
    r0: f64,
    truncate_to_unity: bool,
) -> (Complex, Complex) {
    let r0c = Complex::new(r0, 0.0);
    let s_inv = saturating_recip(s21);
    let z = match jig {
        JigType::Series => saturate((s_inv - 1.0) * (2.0 * r0)),
        JigType::Shunt => saturate(r0c * saturating_recip((s_inv - 1.0) * 2.0)),
    };
    let mut s11 = safe_div(z - r0c, z + r0c);
    if truncate_to_unity {
        s11 = truncate_to_unit_circle(s11);
    }
    (s11, z)
}

/// Forward fixture model: the S21 a DUT with reflection `s11` produces.
///
/// Series: the DUT sits in the loop between source and load resistances.
/// Shunt: the DUT parallels the load resistance.
pub fn s21_from_s11(s11: Complex, jig: JigType, r0: f64) -> Complex {
    let z = impedance_from_s11(s11, r0);
    let r0c = Complex::new(r0, 0.0);
    match jig {
        JigType::Series => safe_div(r0c * 2.0, par3(r0c, z, r0c, CircuitMode::Series)),
        JigType::Shunt => {
            let load = par2(z, r0c, CircuitMode::Parallel);
            safe_div(load * 2.0, par2(r0c, load, CircuitMode::Series))
        }
    }
}

/// Move a value with magnitude above 1 onto the unit circle, keeping phase.
pub fn truncate_to_unit_circle(s: Complex) -> Complex {
    if s.norm() > 1.0 {
        Complex::from_polar(1.0, s.arg())
    } else {
        s
    }
}

/// Reflection coefficient of impedance `z` against reference `r0`.
pub fn s11_from_impedance(z: Complex, r0: f64) -> Complex {
    safe_div(z - r0, z + r0)
}

/// Impedance from reflection coefficient: Z = R0·(1 + S11)/(1 - S11).
///
/// An open (S11 → 1) saturates to [`SATURATION_BOUND`] ohms.
pub fn impedance_from_s11(s11: Complex, r0: f64) -> Complex {
    let one = Complex::new(1.0, 0.0);
    let (ratio, _) = div_or(
        one + s11,
        one - s11,
        Complex::new(SATURATION_BOUND / r0.max(f64::MIN_POSITIVE), 0.0),
        DEGENERACY_TOLERANCE,
    );
    ratio * r0
}

/// VSWR = (1 + |S11|)/(1 - |S11|), with |S11| capped just below 1.
pub fn vswr(s11: Complex) -> f64 {
    let mag = s11.norm().min(VSWR_MAG_LIMIT);
    (1.0 + mag) / (1.0 - mag)
}

/// Return loss in dB: -20·log10(|S11|).
pub fn return_loss_db(s11: Complex) -> f64 {
    -20.0 * safe_log10(s11.norm())
}

/// Resistance and reactance that, in parallel, equal the series `r + jx`.
///
/// Zero components map to the saturating bound (an absent parallel element).
pub fn equiv_parallel_impedance(r: f64, x: f64) -> (f64, f64) {
    let mag_squared = if r.is_infinite() {
        f64::INFINITY
    } else {
        r * r + x * x
    };
    if r == 0.0 {
        if x == 0.0 {
            return (0.0, SATURATION_BOUND);
        }
        return (SATURATION_BOUND, mag_squared / x);
    }
    let rp = mag_squared / r;
    if x == 0.0 {
        return (rp, SATURATION_BOUND);
    }
    (rp, mag_squared / x)
}

/// Quantities derived from one reflection coefficient.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReflectionSummary {
    /// |S11| in dB
    pub magnitude_db: f64,
    /// S11 phase in degrees, (-180, 180]
    pub phase_deg: f64,
    /// Return loss in dB
    pub return_loss_db: f64,
    /// Voltage standing wave ratio
    pub vswr: f64,
    /// Series impedance in ohms
    pub impedance: Complex,
}

impl ReflectionSummary {
    /// Summarize `s11` against reference impedance `r0`
    pub fn from_s11(s11: Complex, r0: f64) -> Self {
        let (magnitude_db, phase_deg) = polar_db_deg(s11);
        Self {
            magnitude_db,
            phase_deg: crate::numeric::mod_degree(phase_deg),
            return_loss_db: return_loss_db(s11),
            vswr: vswr(s11),
            impedance: impedance_from_s11(s11, r0),
        }
    }
}
