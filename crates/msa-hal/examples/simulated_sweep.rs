//! Calibrate the simulated front end and sweep a series RLC
//!
//! Run with: cargo run --example simulated_sweep -p msa-hal

use std::f64::consts::TAU;
use std::time::Duration;

use msa_core::observe::{init_logging, LogConfig};
use msa_core::two_port::s11_from_impedance;
use msa_core::{Complex, MsaConfig, SweepConfig};
use msa_hal::{ErrorBox, Session, SimulatedFrontEnd};

const R0: f64 = 50.0;

fn series_rlc(f: f64) -> Complex {
    let w = TAU * f;
    let (r, l, c) = (25.0, 1e-6, 1e-9);
    s11_from_impedance(Complex::new(r, w * l - 1.0 / (w * c)), R0)
}

fn wait(session: &Session) {
    assert!(session.wait_idle(Duration::from_secs(30)), "sweep did not finish");
    if let Some(e) = session.last_error() {
        panic!("sweep failed: {}", e);
    }
}

fn main() {
    init_logging(&LogConfig::default());

    let sim = SimulatedFrontEnd::new(|_| Complex::new(1.0, 0.0));
    let h = sim.handle();
    h.set_error_box(Some(ErrorBox {
        e00: Complex::new(0.04, -0.03),
        e11: Complex::new(0.08, 0.02),
        e01: Complex::new(0.7, 0.2),
    }));
    let session = Session::open(sim, MsaConfig::default()).expect("open session");
    println!("Firmware {}", session.firmware());

    let config = SweepConfig::linear(2e6, 10e6, 33);
    session
        .begin_calibration(config.clone())
        .expect("begin calibration");
    for gamma in [1.0, -1.0, 0.0] {
        h.set_dut(move |_| Complex::new(gamma, 0.0));
        let standard = session.measure_next_standard().expect("measure");
        wait(&session);
        println!("Measured {}", standard);
    }
    println!("Calibration: {:?}", session.calibration_status());

    h.set_dut(series_rlc);
    session.start_sweep(config).expect("start sweep");
    wait(&session);

    let trace = session.trace();
    println!("\n{:>10}  {:>8}  {:>8}  {:>6}  {:>16}", "MHz", "|S11| dB", "deg", "VSWR", "Z ohms");
    for (f, s) in trace.summaries(R0) {
        println!(
            "{:>10.3}  {:>8.2}  {:>8.1}  {:>6.2}  {:>7.1}{:+8.1}j",
            f / 1e6,
            s.magnitude_db,
            s.phase_deg,
            s.vswr,
            s.impedance.re,
            s.impedance.im
        );
    }

    let path = std::env::temp_dir().join("msa_series_rlc.s1p");
    trace.save_touchstone(&path, R0).expect("write touchstone");
    println!("\nTouchstone written to {}", path.display());
}
