use std::sync::Arc;
use std::thread;
use std::time::Duration;

use msa_core::{
    CalibrationState, CalibrationStatus, Complex, CoreError, JigType, MsaConfig, Standard,
    SweepConfig, SweepMode,
};
use msa_hal::{ErrorBox, HalError, Session, SimHandle, SimulatedFrontEnd};
use tempfile::TempDir;

const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

fn bridge() -> ErrorBox {
    ErrorBox {
        e00: Complex::new(0.05, 0.02),
        e11: Complex::new(0.1, -0.05),
        e01: Complex::new(0.8, 0.1),
    }
}

fn open_with_bridge() -> (Session, SimHandle) {
    let sim = SimulatedFrontEnd::new(|_| Complex::new(1.0, 0.0));
    let handle = sim.handle();
    handle.set_error_box(Some(bridge()));
    let session = Session::open(sim, MsaConfig::default()).unwrap();
    (session, handle)
}

fn calibrate(session: &Session, h: &SimHandle, config: SweepConfig) {
    session.begin_calibration(config).unwrap();
    assert_eq!(session.calibration_status(), CalibrationStatus::Building);
    let standards = [
        (Standard::Open, Complex::new(1.0, 0.0)),
        (Standard::Short, Complex::new(-1.0, 0.0)),
        (Standard::Load, Complex::new(0.0, 0.0)),
    ];
    for (standard, gamma) in standards {
        h.set_dut(move |_| gamma);
        assert_eq!(session.measure_next_standard().unwrap(), standard);
        assert!(session.wait_idle(IDLE_TIMEOUT));
        assert_eq!(session.last_error(), None);
    }
    assert_eq!(session.calibration_state(), CalibrationState::Built);
}

#[test]
fn osl_through_bridge_corrects_load_to_zero() {
    let (session, h) = open_with_bridge();
    calibrate(&session, &h, SweepConfig::linear(1e6, 3e6, 3));

    assert_eq!(
        session.calibration_status(),
        CalibrationStatus::ValidForRange {
            start_hz: 1e6,
            stop_hz: 3e6
        }
    );
    // The load sweep left in the trace was recorrected with the new table
    let trace = session.trace();
    assert_eq!(trace.len(), 3);
    for p in &trace.points {
        assert!(p.raw.norm() > 0.04);
        assert!(p.corrected.norm() < 1e-2, "load at {} Hz: {}", p.frequency_hz, p.corrected);
    }

    session.start_sweep(SweepConfig::linear(1e6, 3e6, 3)).unwrap();
    assert!(session.wait_idle(IDLE_TIMEOUT));
    for p in session.trace().points {
        assert!(p.corrected.norm() < 1e-2);
    }
}

#[test]
fn corrected_dut_between_calibration_points() {
    let (session, h) = open_with_bridge();
    calibrate(&session, &h, SweepConfig::linear(1e6, 5e6, 5));

    // 100 ohm resistor
    let gamma = Complex::new(1.0 / 3.0, 0.0);
    h.set_dut(move |_| gamma);
    session.start_sweep(SweepConfig::linear(1e6, 5e6, 9)).unwrap();
    assert!(session.wait_idle(IDLE_TIMEOUT));
    let trace = session.trace();
    assert_eq!(trace.len(), 9);
    for p in &trace.points {
        assert!((p.corrected - gamma).norm() < 1e-2);
    }
    let summaries = trace.summaries(50.0);
    assert!((summaries[0].1.vswr - 2.0).abs() < 0.05);
}

#[test]
fn saved_calibration_loads_in_a_new_session() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bridge.cal");
    {
        let (session, h) = open_with_bridge();
        calibrate(&session, &h, SweepConfig::linear(2e6, 4e6, 3));
        session.save_calibration(&path).unwrap();
    }

    let (session, h) = open_with_bridge();
    assert_eq!(session.calibration_status(), CalibrationStatus::Uncalibrated);
    let status = session.load_calibration(&path).unwrap();
    assert_eq!(
        status,
        CalibrationStatus::ValidForRange {
            start_hz: 2e6,
            stop_hz: 4e6
        }
    );
    h.set_dut(|_| Complex::new(0.0, 0.0));
    session.start_sweep(SweepConfig::linear(2e6, 4e6, 3)).unwrap();
    assert!(session.wait_idle(IDLE_TIMEOUT));
    for p in session.trace().points {
        assert!(p.corrected.norm() < 1e-2);
    }
}

#[test]
fn version_mismatch_preserves_active_calibration() {
    let dir = TempDir::new().unwrap();
    let good = dir.path().join("good.cal");
    let old = dir.path().join("old.cal");

    let (session, h) = open_with_bridge();
    calibrate(&session, &h, SweepConfig::linear(1e6, 3e6, 3));
    session.save_calibration(&good).unwrap();
    let text = std::fs::read_to_string(&good).unwrap();
    std::fs::write(&old, text.replace("\"1.03\"", "\"1.02\"")).unwrap();

    let before = session.active_calibration().unwrap();
    let before_status = session.calibration_status();
    match session.load_calibration(&old) {
        Err(HalError::Core(CoreError::CalibrationVersionMismatch { found, expected })) => {
            assert_eq!(found, "1.02");
            assert_eq!(expected, "1.03");
        }
        other => panic!("expected version mismatch, got {:?}", other),
    }
    let after = session.active_calibration().unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(session.calibration_status(), before_status);

    assert!(session.load_calibration(&dir.path().join("missing.cal")).is_err());
    assert!(Arc::ptr_eq(&before, &session.active_calibration().unwrap()));
}

#[test]
fn interrupted_reference_sweep_cancels_procedure() {
    let (session, h) = open_with_bridge();
    h.set_capture_delay(Duration::from_millis(20));
    session
        .begin_calibration(SweepConfig::linear(1e6, 30e6, 60))
        .unwrap();
    assert_eq!(session.measure_next_standard().unwrap(), Standard::Open);
    thread::sleep(Duration::from_millis(100));
    session.halt();
    assert!(session.wait_idle(IDLE_TIMEOUT));

    assert_eq!(session.calibration_state(), CalibrationState::Idle);
    assert_eq!(session.calibration_status(), CalibrationStatus::Uncalibrated);
    assert!(session.last_error().is_some());
    assert!(session.active_calibration().is_none());
}

#[test]
fn measuring_without_procedure_is_an_error() {
    let sim = SimulatedFrontEnd::new(|_| Complex::new(0.0, 0.0));
    let session = Session::open(sim, MsaConfig::default()).unwrap();
    assert!(matches!(
        session.measure_next_standard(),
        Err(HalError::Core(CoreError::InvalidState(_)))
    ));
    assert!(session.save_calibration(std::path::Path::new("unused.cal")).is_err());
}

#[test]
fn cancel_returns_to_idle() {
    let (session, _h) = open_with_bridge();
    session
        .begin_calibration(SweepConfig::linear(1e6, 3e6, 3))
        .unwrap();
    assert_eq!(session.calibration_state(), CalibrationState::MeasuringOpen);
    session.cancel_calibration().unwrap();
    // A synchronous round trip orders us after the cancel
    let _ = session.save_calibration(std::path::Path::new("unused.cal"));
    assert_eq!(session.calibration_state(), CalibrationState::Idle);
    assert_eq!(session.calibration_status(), CalibrationStatus::Uncalibrated);
}

#[test]
fn sweep_past_calibration_range_is_flagged() {
    let (session, h) = open_with_bridge();
    session.start_sweep(SweepConfig::linear(1e6, 5e6, 5)).unwrap();
    assert!(session.wait_idle(IDLE_TIMEOUT));
    assert!(!session.trace().outside_calibration);

    calibrate(&session, &h, SweepConfig::linear(1e6, 3e6, 3));
    h.set_dut(|_| Complex::new(0.2, 0.0));
    session.start_sweep(SweepConfig::linear(1e6, 5e6, 5)).unwrap();
    assert!(session.wait_idle(IDLE_TIMEOUT));
    let trace = session.trace();
    assert_eq!(trace.len(), 5);
    assert!(trace.outside_calibration);

    session.start_sweep(SweepConfig::linear(1e6, 3e6, 5)).unwrap();
    assert!(session.wait_idle(IDLE_TIMEOUT));
    assert!(!session.trace().outside_calibration);
}

#[test]
fn loading_after_a_failed_sweep_keeps_its_mode() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ideal.cal");
    let sim = SimulatedFrontEnd::new(|_| Complex::new(1.0, 0.0));
    let h = sim.handle();
    let session = Session::open(sim, MsaConfig::default()).unwrap();
    calibrate(&session, &h, SweepConfig::linear(1e6, 5e6, 5));
    session.save_calibration(&path).unwrap();

    h.set_dut(|_| Complex::new(0.5, 0.0));
    let through = SweepConfig {
        mode: SweepMode::Transmission,
        jig: Some(JigType::Series),
        ..SweepConfig::linear(1e6, 5e6, 5)
    };
    session.start_sweep(through).unwrap();
    assert!(session.wait_idle(IDLE_TIMEOUT));
    assert_eq!(session.last_error(), None);

    // The reflection sweep dies after two points
    h.disconnect_after(h.captures() + 2);
    session.start_sweep(SweepConfig::linear(1e6, 5e6, 5)).unwrap();
    assert!(session.wait_idle(IDLE_TIMEOUT));
    assert!(!session.is_connected());
    let trace = session.trace();
    assert_eq!(trace.mode, SweepMode::Reflection);
    assert_eq!(trace.jig, None);
    assert_eq!(trace.len(), 2);

    session.load_calibration(&path).unwrap();
    let trace = session.trace();
    assert_eq!(trace.mode, SweepMode::Reflection);
    for p in &trace.points {
        assert!(
            (p.corrected - Complex::new(0.5, 0.0)).norm() < 1e-2,
            "at {} Hz: {}",
            p.frequency_hz,
            p.corrected
        );
    }
}

#[test]
fn relative_paths_use_the_calibration_directory() {
    let dir = TempDir::new().unwrap();
    let mut config = MsaConfig::default();
    config.calibration.directory = Some(dir.path().join("cal"));
    let sim = SimulatedFrontEnd::new(|_| Complex::new(1.0, 0.0));
    let h = sim.handle();
    h.set_error_box(Some(bridge()));
    let session = Session::open(sim, config).unwrap();
    calibrate(&session, &h, SweepConfig::linear(1e6, 3e6, 3));

    session.save_calibration(std::path::Path::new("bridge.cal")).unwrap();
    assert!(dir.path().join("cal").join("bridge.cal").is_file());

    session.clear_calibration().unwrap();
    let status = session
        .load_calibration(std::path::Path::new("bridge.cal"))
        .unwrap();
    assert_eq!(
        status,
        CalibrationStatus::ValidForRange {
            start_hz: 1e6,
            stop_hz: 3e6
        }
    );

    // Absolute paths are taken as given
    let elsewhere = dir.path().join("elsewhere.cal");
    session.save_calibration(&elsewhere).unwrap();
    assert!(elsewhere.is_file());
}
