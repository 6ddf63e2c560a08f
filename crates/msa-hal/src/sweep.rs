//! Sweep Controller.
//!
//! Walks the planned frequencies of a [`SweepConfig`], programming the DDS,
//! settling on the device side and taking one ADC capture per point. Each
//! raw reading is converted by the [`Detector`] to a complex value and
//! corrected with the [`PointCorrection`] fixed at the start of the sweep.
//!
//! Cancellation is cooperative. A halt is honoured between points and keeps
//! everything captured so far. An abort also stops between points, but a
//! capture already in flight when it arrives is thrown away and the link is
//! cleared.

use std::sync::atomic::{AtomicBool, Ordering};

use msa_core::{AdcSample, Complex, Detector, MsaConfig, PointCorrection, SweepConfig, SweepPoint};
use tracing::{debug, info, warn};

use crate::channel::ByteChannel;
use crate::error::{HalError, HalResult};
use crate::link::DeviceLink;
use crate::synth::{program_attenuator, Synthesizer};

/// Halt and abort flags shared between the control surface and the worker.
#[derive(Debug, Default)]
pub struct SweepControl {
    halt: AtomicBool,
    abort: AtomicBool,
}

impl SweepControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop after the current point
    pub fn request_halt(&self) {
        self.halt.store(true, Ordering::SeqCst);
    }

    /// Stop now, discarding the point in flight
    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn is_halt_requested(&self) -> bool {
        self.halt.load(Ordering::SeqCst)
    }

    pub fn is_abort_requested(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Clear both flags before a new sweep
    pub fn reset(&self) {
        self.halt.store(false, Ordering::SeqCst);
        self.abort.store(false, Ordering::SeqCst);
    }
}

/// How a sweep ended, with the number of points delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    Completed { points: usize },
    Halted { points: usize },
    Aborted { points: usize },
}

impl SweepOutcome {
    pub fn points(&self) -> usize {
        match *self {
            SweepOutcome::Completed { points }
            | SweepOutcome::Halted { points }
            | SweepOutcome::Aborted { points } => points,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, SweepOutcome::Completed { .. })
    }
}

/// Per-point acquisition loop.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepController {
    pub synth: Synthesizer,
    pub settle_ms: u32,
    pub first_point_settle_ms: u32,
    pub adc_bits: u8,
    pub detector: Detector,
}

impl Default for SweepController {
    fn default() -> Self {
        Self::from_config(&MsaConfig::default())
    }
}

impl SweepController {
    /// Controller with the fixed detector mapping; path tables are loaded
    /// separately with [`Detector::from_config`].
    pub fn from_config(config: &MsaConfig) -> Self {
        let adc_bits = config.link.adc_bits.clamp(1, 32);
        Self {
            synth: Synthesizer::from(&config.synth),
            settle_ms: config.synth.settle_ms,
            first_point_settle_ms: config.synth.first_point_settle_ms,
            adc_bits: adc_bits as u8,
            detector: Detector::new(adc_bits),
        }
    }

    pub fn with_detector(mut self, detector: Detector) -> Self {
        self.detector = detector;
        self
    }

    /// Complex value of a raw capture taken at `frequency_hz`
    pub fn to_complex(&self, sample: AdcSample, frequency_hz: f64) -> Complex {
        self.detector.to_complex(sample, frequency_hz)
    }

    /// Run one sweep, handing every finished point to `on_point`.
    ///
    /// All frequencies are checked against the synthesizer range before
    /// anything is sent. A capture timeout records a zero point and the
    /// sweep carries on; transport errors end the sweep with `Err`.
    pub fn run<C, F>(
        &self,
        link: &mut DeviceLink<C>,
        config: &SweepConfig,
        correction: &PointCorrection,
        control: &SweepControl,
        mut on_point: F,
    ) -> HalResult<SweepOutcome>
    where
        C: ByteChannel,
        F: FnMut(SweepPoint) -> HalResult<()>,
    {
        let frequencies = config.frequency_points();
        for &f in &frequencies {
            self.synth.tuning_word(f)?;
        }
        if frequencies.is_empty() {
            return Err(HalError::Config("sweep has no points".into()));
        }
        info!(
            start_hz = frequencies[0],
            stop_hz = frequencies[frequencies.len() - 1],
            points = frequencies.len(),
            mode = ?config.mode,
            "Sweep started"
        );
        program_attenuator(link, config.attenuation_db)?;

        let mut delivered = 0;
        let mut timeouts = 0;
        for (index, &f) in frequencies.iter().enumerate() {
            if control.is_abort_requested() {
                return self.abort(link, delivered);
            }
            if control.is_halt_requested() {
                info!(points = delivered, "Sweep halted");
                return Ok(SweepOutcome::Halted { points: delivered });
            }

            self.synth.program(link, f)?;
            if index == 0 {
                link.wait_ms(self.first_point_settle_ms)?;
            }
            link.wait_ms(self.settle_ms)?;
            let reading = link.capture(self.adc_bits)?;

            if control.is_abort_requested() {
                debug!(frequency_hz = f, "In-flight point discarded");
                return self.abort(link, delivered);
            }

            let point = if reading.timed_out {
                timeouts += 1;
                warn!(frequency_hz = f, index, "Point timed out, recorded as zero");
                SweepPoint::timed_out(f)
            } else {
                correction.point(f, self.to_complex(reading.sample, f))
            };
            debug!(
                index,
                frequency_hz = f,
                re = point.corrected.re,
                im = point.corrected.im,
                "Point captured"
            );
            on_point(point)?;
            delivered += 1;
        }
        info!(points = delivered, timeouts, "Sweep completed");
        Ok(SweepOutcome::Completed { points: delivered })
    }

    fn abort<C: ByteChannel>(
        &self,
        link: &mut DeviceLink<C>,
        delivered: usize,
    ) -> HalResult<SweepOutcome> {
        link.clear()?;
        info!(points = delivered, "Sweep aborted");
        Ok(SweepOutcome::Aborted { points: delivered })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkSettings;
    use crate::sim::SimulatedFrontEnd;
    use approx::assert_relative_eq;
    use msa_core::{Complex, SweepMode};

    fn setup(dut: Complex) -> (SimulatedFrontEnd, DeviceLink<SimulatedFrontEnd>) {
        let sim = SimulatedFrontEnd::new(move |_| dut);
        let link = DeviceLink::new(sim.clone(), LinkSettings::default());
        (sim, link)
    }

    #[test]
    fn test_sweep_collects_every_point() {
        let (sim, mut link) = setup(Complex::new(0.5, 0.0));
        let ctl = SweepControl::new();
        let cfg = SweepConfig::linear(10e6, 20e6, 11);
        let mut points = Vec::new();
        let outcome = SweepController::default()
            .run(&mut link, &cfg, &PointCorrection::default(), &ctl, |p| {
                points.push(p);
                Ok(())
            })
            .unwrap();
        assert_eq!(outcome, SweepOutcome::Completed { points: 11 });
        for (i, p) in points.iter().enumerate() {
            assert_eq!(p.frequency_hz, 10e6 + i as f64 * 1e6);
            assert_relative_eq!(p.raw.re, 0.5, epsilon = 1e-3);
        }
        // The DDS ended on the last point
        let last = sim.handle().dds_frequency_hz();
        assert!((last - 20e6).abs() < 0.1);
    }

    #[test]
    fn test_first_point_gets_extra_settle() {
        let (sim, mut link) = setup(Complex::new(0.1, 0.0));
        let ctl = SweepControl::new();
        let cfg = SweepConfig::linear(1e6, 2e6, 2);
        SweepController::default()
            .run(&mut link, &cfg, &PointCorrection::default(), &ctl, |_| Ok(()))
            .unwrap();
        assert_eq!(sim.handle().waited_ms(), 200 + 10 + 10);
    }

    #[test]
    fn test_attenuator_programmed_once() {
        let (sim, mut link) = setup(Complex::new(0.1, 0.0));
        let ctl = SweepControl::new();
        let cfg = SweepConfig::linear(1e6, 5e6, 5).with_attenuation(10.0);
        SweepController::default()
            .run(&mut link, &cfg, &PointCorrection::default(), &ctl, |_| Ok(()))
            .unwrap();
        let h = sim.handle();
        assert_eq!(h.attenuator_code(), Some(20));
        assert_eq!(h.attenuator_latches(), 1);
    }

    #[test]
    fn test_single_point_sweep() {
        let (_sim, mut link) = setup(Complex::new(0.2, 0.2));
        let ctl = SweepControl::new();
        let cfg = SweepConfig::linear(5e6, 5e6, 50);
        let mut points = Vec::new();
        let outcome = SweepController::default()
            .run(&mut link, &cfg, &PointCorrection::default(), &ctl, |p| {
                points.push(p);
                Ok(())
            })
            .unwrap();
        assert_eq!(outcome.points(), 1);
        assert_eq!(points[0].frequency_hz, 5e6);
    }

    #[test]
    fn test_out_of_range_rejected_before_sending() {
        let (sim, mut link) = setup(Complex::new(0.2, 0.0));
        let ctl = SweepControl::new();
        let cfg = SweepConfig::linear(1e6, 40e6, 3);
        let err = SweepController::default()
            .run(&mut link, &cfg, &PointCorrection::default(), &ctl, |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, HalError::Config(_)));
        assert_eq!(sim.handle().captures(), 0);
    }

    #[test]
    fn test_timeout_records_zero_and_continues() {
        let (sim, mut link) = setup(Complex::new(0.4, 0.3));
        sim.handle().timeout_capture(2);
        let ctl = SweepControl::new();
        let cfg = SweepConfig::linear(1e6, 5e6, 5);
        let mut points = Vec::new();
        let outcome = SweepController::default()
            .run(&mut link, &cfg, &PointCorrection::default(), &ctl, |p| {
                points.push(p);
                Ok(())
            })
            .unwrap();
        assert!(outcome.is_complete());
        assert_eq!(points.len(), 5);
        assert!(points[2].timed_out);
        assert_eq!(points[2].raw, Complex::new(0.0, 0.0));
        for i in [0, 1, 3, 4] {
            assert!(!points[i].timed_out);
            assert_relative_eq!(points[i].raw.norm(), 0.5, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_halt_between_points() {
        let (_sim, mut link) = setup(Complex::new(0.2, 0.0));
        let ctl = SweepControl::new();
        let cfg = SweepConfig::linear(1e6, 10e6, 10);
        let mut n = 0;
        let outcome = SweepController::default()
            .run(&mut link, &cfg, &PointCorrection::default(), &ctl, |_| {
                n += 1;
                if n == 3 {
                    ctl.request_halt();
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(outcome, SweepOutcome::Halted { points: 3 });
    }

    #[test]
    fn test_abort_clears_link() {
        let (_sim, mut link) = setup(Complex::new(0.2, 0.0));
        let ctl = SweepControl::new();
        let cfg = SweepConfig::linear(1e6, 10e6, 10);
        let outcome = SweepController::default()
            .run(&mut link, &cfg, &PointCorrection::default(), &ctl, |_| {
                ctl.request_abort();
                Ok(())
            })
            .unwrap();
        assert_eq!(outcome, SweepOutcome::Aborted { points: 1 });
        assert_eq!(link.pending_write(), 0);
        assert!(link.is_connected());
    }

    #[test]
    fn test_transmission_with_jig_is_corrected() {
        let s21 = Complex::new(0.5, 0.0);
        let (_sim, mut link) = setup(s21);
        let ctl = SweepControl::new();
        let cfg = SweepConfig::linear(1e6, 2e6, 2)
            .with_mode(SweepMode::Transmission)
            .with_jig(msa_core::JigType::Series);
        let correction = PointCorrection {
            mode: SweepMode::Transmission,
            jig: Some(msa_core::JigType::Series),
            reference_impedance: 50.0,
            ..Default::default()
        };
        let mut points = Vec::new();
        SweepController::default()
            .run(&mut link, &cfg, &correction, &ctl, |p| {
                points.push(p);
                Ok(())
            })
            .unwrap();
        // Series S21 of 0.5 is a 100 ohm DUT, S11 = 1/3
        assert_relative_eq!(points[0].corrected.re, 1.0 / 3.0, epsilon = 5e-3);
        assert_relative_eq!(points[0].raw.re, 0.5, epsilon = 1e-3);
    }

    #[test]
    fn test_disconnect_is_an_error() {
        let (sim, mut link) = setup(Complex::new(0.2, 0.0));
        sim.handle().disconnect_after(2);
        let ctl = SweepControl::new();
        let cfg = SweepConfig::linear(1e6, 10e6, 10);
        let mut n = 0;
        let err = SweepController::default()
            .run(&mut link, &cfg, &PointCorrection::default(), &ctl, |_| {
                n += 1;
                Ok(())
            })
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(n, 2);
        assert!(!link.is_connected());
    }
}
