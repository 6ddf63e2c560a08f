//! Numeric fallback policy and small circuit helpers.
//!
//! The instrument measures physical standards that can never be perfect
//! nulls, so a sweep must stay usable when a denominator collapses. Every
//! substitution (non-finite to zero, degenerate to a fallback, saturate to
//! [`SATURATION_BOUND`]) lives here as an explicit function rather than as a
//! side effect of IEEE arithmetic.

use crate::types::Complex;

/// Large finite value used in place of an infinite result
pub const SATURATION_BOUND: f64 = 1e12;

/// Magnitudes at or below this are treated as zero when taking logs
pub const LOG_FLOOR: f64 = 1e-20;

/// Default tolerance for a complex denominator to count as zero
pub const DEGENERACY_TOLERANCE: f64 = 1e-18;

/// Circuit combination mode for [`par2`] and [`par3`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitMode {
    /// Elements in series: impedances add
    Series,
    /// Elements in parallel: admittances add
    Parallel,
}

/// Replace a non-finite complex value by zero.
#[inline]
pub fn finite_or_zero(z: Complex) -> Complex {
    if z.re.is_finite() && z.im.is_finite() {
        z
    } else {
        Complex::new(0.0, 0.0)
    }
}

/// Reciprocal whose infinite result saturates to [`SATURATION_BOUND`].
///
/// The reciprocal of zero is `+SATURATION_BOUND` on the real axis. A NaN
/// component becomes zero.
#[inline]
pub fn saturating_recip(z: Complex) -> Complex {
    if z.norm_sqr() == 0.0 {
        return Complex::new(SATURATION_BOUND, 0.0);
    }
    saturate(z.inv())
}

/// Division that yields zero instead of a non-finite result.
#[inline]
pub fn safe_div(num: Complex, den: Complex) -> Complex {
    if den.norm_sqr() == 0.0 {
        return Complex::new(0.0, 0.0);
    }
    finite_or_zero(num / den)
}

/// True when `den` is within `tolerance` of zero or not finite.
#[inline]
pub fn is_degenerate(den: Complex, tolerance: f64) -> bool {
    !(den.re.is_finite() && den.im.is_finite()) || den.norm() <= tolerance
}

/// Divide, substituting `fallback` when the denominator is degenerate.
///
/// Returns the quotient and whether the fallback was used.
pub fn div_or(num: Complex, den: Complex, fallback: Complex, tolerance: f64) -> (Complex, bool) {
    if is_degenerate(den, tolerance) {
        return (fallback, true);
    }
    let q = num / den;
    if q.re.is_finite() && q.im.is_finite() {
        (q, false)
    } else {
        (fallback, true)
    }
}

/// Clamp each component of `z` to ±[`SATURATION_BOUND`].
#[inline]
pub fn saturate(z: Complex) -> Complex {
    let clamp = |v: f64| {
        if v.is_nan() {
            0.0
        } else {
            v.clamp(-SATURATION_BOUND, SATURATION_BOUND)
        }
    };
    Complex::new(clamp(z.re), clamp(z.im))
}

/// log10 with a floor: values at or below [`LOG_FLOOR`] map to -20.
#[inline]
pub fn safe_log10(x: f64) -> f64 {
    if x <= LOG_FLOOR {
        -20.0
    } else {
        x.log10()
    }
}

/// Magnitude in dB (20·log10) and phase in degrees.
///
/// A magnitude at or below 1e-20 reports -400 dB rather than -inf.
pub fn polar_db_deg(z: Complex) -> (f64, f64) {
    let (mag, phase) = z.to_polar();
    (20.0 * safe_log10(mag), phase.to_degrees())
}

/// Build a complex value from dB magnitude and degrees.
pub fn from_db_deg(db: f64, deg: f64) -> Complex {
    Complex::from_polar(10f64.powf(db / 20.0), deg.to_radians())
}

/// Normalize an angle in degrees to (-180, 180].
pub fn mod_degree(deg: f64) -> f64 {
    let r = (deg + 180.0).rem_euclid(360.0) - 180.0;
    if r <= -180.0 {
        r + 360.0
    } else {
        r
    }
}

/// Combine two impedances in series or parallel.
pub fn par2(a: Complex, b: Complex, mode: CircuitMode) -> Complex {
    match mode {
        CircuitMode::Series => a + b,
        CircuitMode::Parallel => safe_div(a * b, a + b),
    }
}

/// Combine three impedances in series or parallel.
pub fn par3(a: Complex, b: Complex, c: Complex, mode: CircuitMode) -> Complex {
    match mode {
        CircuitMode::Series => a + b + c,
        CircuitMode::Parallel => safe_div(a * b * c, b * c + a * c + a * b),
    }
}

/// Piecewise-linear lookup in a table with increasing `xp`, clamped to the
/// end values outside it.
pub fn interp(x: f64, xp: &[f64], fp: &[f64]) -> f64 {
    let n = xp.len().min(fp.len());
    if n == 0 {
        return 0.0;
    }
    if x.is_nan() || x <= xp[0] {
        return fp[0];
    }
    if x >= xp[n - 1] {
        return fp[n - 1];
    }
    let hi = xp[..n].partition_point(|&v| v <= x);
    let lo = hi - 1;
    let span = xp[hi] - xp[lo];
    if span == 0.0 {
        return fp[lo];
    }
    fp[lo] + (fp[hi] - fp[lo]) * (x - xp[lo]) / span
}

/// Linear interpolation of a complex value, component-wise.
#[inline]
pub fn lerp(x: f64, x0: f64, x1: f64, y0: Complex, y1: Complex) -> Complex {
    let span = x1 - x0;
    if span == 0.0 {
        return y0;
    }
    let t = (x - x0) / span;
    Complex::new(y0.re + (y1.re - y0.re) * t, y0.im + (y1.im - y0.im) * t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_saturating_recip() {
        assert_eq!(
            saturating_recip(Complex::new(0.0, 0.0)),
            Complex::new(SATURATION_BOUND, 0.0)
        );
        let tiny = saturating_recip(Complex::new(0.0, 1e-20));
        assert_eq!(tiny, Complex::new(0.0, -SATURATION_BOUND));
        assert_eq!(saturating_recip(Complex::new(f64::NAN, 0.0)), Complex::new(0.0, 0.0));
        assert_relative_eq!(saturating_recip(Complex::new(4.0, 0.0)).re, 0.25);
    }

    #[test]
    fn test_interp_clamps_at_ends() {
        let xp = [0.0, 10.0, 20.0];
        let fp = [1.0, 3.0, -1.0];
        assert_eq!(interp(-5.0, &xp, &fp), 1.0);
        assert_eq!(interp(25.0, &xp, &fp), -1.0);
        assert_relative_eq!(interp(5.0, &xp, &fp), 2.0);
        assert_relative_eq!(interp(15.0, &xp, &fp), 1.0);
        assert_eq!(interp(10.0, &xp, &fp), 3.0);
        assert_eq!(interp(f64::NAN, &xp, &fp), 1.0);
        assert_eq!(interp(1.0, &[], &[]), 0.0);
    }

    #[test]
    fn test_finite_or_zero() {
        assert_eq!(
            finite_or_zero(Complex::new(f64::INFINITY, 1.0)),
            Complex::new(0.0, 0.0)
        );
        assert_eq!(
            finite_or_zero(Complex::new(1.0, f64::NAN)),
            Complex::new(0.0, 0.0)
        );
        assert_eq!(finite_or_zero(Complex::new(1.0, 2.0)), Complex::new(1.0, 2.0));
    }

    #[test]
    fn test_div_or_fallback() {
        let fb = Complex::new(7.0, 0.0);
        let (q, used) = div_or(Complex::new(1.0, 0.0), Complex::new(1e-30, 0.0), fb, 1e-18);
        assert!(used);
        assert_eq!(q, fb);

        let (q, used) = div_or(Complex::new(4.0, 0.0), Complex::new(2.0, 0.0), fb, 1e-18);
        assert!(!used);
        assert_relative_eq!(q.re, 2.0);
    }

    #[test]
    fn test_saturate() {
        let z = saturate(Complex::new(f64::INFINITY, -f64::INFINITY));
        assert_eq!(z.re, SATURATION_BOUND);
        assert_eq!(z.im, -SATURATION_BOUND);
    }

    #[test]
    fn test_polar_db_deg() {
        let (db, deg) = polar_db_deg(Complex::new(0.0, 0.1));
        assert_relative_eq!(db, -20.0, epsilon = 1e-9);
        assert_relative_eq!(deg, 90.0, epsilon = 1e-9);

        let (db, _) = polar_db_deg(Complex::new(0.0, 0.0));
        assert_eq!(db, -400.0);
    }

    #[test]
    fn test_mod_degree_range() {
        assert_relative_eq!(mod_degree(190.0), -170.0);
        assert_relative_eq!(mod_degree(-190.0), 170.0);
        assert_relative_eq!(mod_degree(180.0), 180.0);
        assert_relative_eq!(mod_degree(-180.0), 180.0);
        assert_relative_eq!(mod_degree(720.0 + 45.0), 45.0);
    }

    #[test]
    fn test_par_helpers() {
        let r = Complex::new(100.0, 0.0);
        assert_relative_eq!(par2(r, r, CircuitMode::Parallel).re, 50.0);
        assert_relative_eq!(par2(r, r, CircuitMode::Series).re, 200.0);
        let p3 = par3(r, r, r, CircuitMode::Parallel);
        assert_relative_eq!(p3.re, 100.0 / 3.0, epsilon = 1e-9);
        assert_relative_eq!(par3(r, r, r, CircuitMode::Series).re, 300.0);

        // L and C at resonance in parallel: denominator vanishes
        let l = Complex::new(0.0, 10.0);
        let c = Complex::new(0.0, -10.0);
        assert_eq!(par2(l, c, CircuitMode::Parallel), Complex::new(0.0, 0.0));
    }

    #[test]
    fn test_lerp() {
        let y = lerp(
            1.5,
            1.0,
            2.0,
            Complex::new(0.0, 2.0),
            Complex::new(2.0, 0.0),
        );
        assert_relative_eq!(y.re, 1.0);
        assert_relative_eq!(y.im, 1.0);
    }
}
