//! Acquisition session
//!
//! A [`Session`] owns one device link on a background worker thread. The
//! control surface (any thread holding the `Session`) sends requests over a
//! channel and reads shared state: sweep status, calibration status and the
//! [`TraceStore`]. Only the worker talks to the hardware and only the worker
//! writes the trace.
//!
//! ```text
//!  control surface                         worker thread "msa-sweep"
//!  ───────────────                         ─────────────────────────
//!  start_sweep ──┐                          ┌─► SweepController::run
//!  halt / abort ─┼─ flags (SweepControl) ───┤       │
//!  calibration ──┘─ Request channel ────────┘       ▼
//!                                             TraceStore ──► subscribers
//!  trace() / subscribe() ◄───────────────────────┘
//! ```
//!
//! A transport failure marks the session disconnected. The trace captured so
//! far is kept and every later acquisition request fails with
//! [`HalError::ConnectionLost`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use msa_core::calibration::CalibrationTable;
use msa_core::config::CalibrationConfig;
use msa_core::{
    ActiveCalibration, CalibrationEngine, CalibrationState, CalibrationStatus, CoreError, Detector,
    MsaConfig, PointCorrection, Standard, SweepConfig, SweepMode, Trace, TraceStore, TraceUpdate,
};
use tracing::{error, info, warn};

use crate::channel::ByteChannel;
use crate::error::{HalError, HalResult};
use crate::link::{DeviceLink, LinkSettings, SyncStats};
use crate::sweep::{SweepControl, SweepController, SweepOutcome};

/// Acquisition state as shown to the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SweepStatus {
    #[default]
    Idle,
    Running,
    /// A halt or abort was requested and the worker has not stopped yet
    Halting,
}

enum Request {
    Sweep(SweepConfig),
    BeginCalibration {
        config: SweepConfig,
        reply: Sender<HalResult<()>>,
    },
    MeasureStandard,
    CancelCalibration,
    ClearCalibration,
    LoadCalibration {
        path: PathBuf,
        reply: Sender<HalResult<CalibrationStatus>>,
    },
    SaveCalibration {
        path: PathBuf,
        reply: Sender<HalResult<()>>,
    },
    Shutdown,
}

struct Shared {
    status: Mutex<SweepStatus>,
    status_changed: Condvar,
    control: SweepControl,
    trace: TraceStore,
    calibration: ActiveCalibration,
    calibration_status: Mutex<CalibrationStatus>,
    calibration_state: Mutex<CalibrationState>,
    last_error: Mutex<Option<String>>,
    sync: Mutex<SyncStats>,
    connected: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn set_status(&self, status: SweepStatus) {
        *lock(&self.status) = status;
        self.status_changed.notify_all();
    }

    fn set_error(&self, message: String) {
        *lock(&self.last_error) = Some(message);
    }
}

/// Handle on a running acquisition session.
pub struct Session {
    shared: Arc<Shared>,
    requests: Sender<Request>,
    worker: Option<JoinHandle<()>>,
    firmware: String,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("firmware", &self.firmware)
            .field("status", &self.sweep_status())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Session {
    /// Validate the configuration, load the detector tables it names, check
    /// the device firmware and start the worker thread.
    pub fn open<C>(channel: C, config: MsaConfig) -> HalResult<Self>
    where
        C: ByteChannel + 'static,
    {
        config.validate()?;
        let detector = Detector::from_config(config.link.adc_bits, &config.detector)?;
        let mut link = DeviceLink::new(channel, LinkSettings::from(&config.link));
        link.clear()?;
        let firmware = link.validate_firmware()?;

        let engine = CalibrationEngine::new(
            config.calibration.standards,
            config.calibration.reference_impedance,
        );
        let shared = Arc::new(Shared {
            status: Mutex::new(SweepStatus::Idle),
            status_changed: Condvar::new(),
            control: SweepControl::new(),
            trace: TraceStore::new(),
            calibration: engine.active(),
            calibration_status: Mutex::new(engine.status()),
            calibration_state: Mutex::new(engine.state()),
            last_error: Mutex::new(None),
            sync: Mutex::new(link.sync_stats()),
            connected: AtomicBool::new(true),
        });

        let (tx, rx) = mpsc::channel();
        let worker = Worker {
            link,
            controller: SweepController::from_config(&config).with_detector(detector),
            engine,
            shared: shared.clone(),
            calibration: config.calibration.clone(),
            calibration_sweep: None,
        };
        let handle = thread::Builder::new()
            .name("msa-sweep".into())
            .spawn(move || worker.run(rx))?;

        info!(firmware = %firmware, "Session opened");
        Ok(Self {
            shared,
            requests: tx,
            worker: Some(handle),
            firmware,
        })
    }

    /// Firmware version reported by the control board
    pub fn firmware(&self) -> &str {
        &self.firmware
    }

    fn ensure_connected(&self) -> HalResult<()> {
        if self.shared.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(HalError::ConnectionLost("device disconnected".into()))
        }
    }

    fn send(&self, request: Request) -> HalResult<()> {
        self.requests
            .send(request)
            .map_err(|_| HalError::ConnectionLost("sweep worker stopped".into()))
    }

    /// Claim the worker for one acquisition and hand it `request`.
    fn start(&self, request: Request) -> HalResult<()> {
        self.ensure_connected()?;
        {
            let mut status = lock(&self.shared.status);
            if *status != SweepStatus::Idle {
                return Err(HalError::Busy("sweep in progress"));
            }
            self.shared.control.reset();
            *status = SweepStatus::Running;
        }
        *lock(&self.shared.last_error) = None;
        self.send(request).map_err(|e| {
            self.shared.set_status(SweepStatus::Idle);
            e
        })
    }

    fn call<T>(&self, make: impl FnOnce(Sender<HalResult<T>>) -> Request) -> HalResult<T> {
        let (tx, rx) = mpsc::channel();
        self.send(make(tx))?;
        rx.recv()
            .map_err(|_| HalError::ConnectionLost("sweep worker stopped".into()))?
    }

    fn ensure_idle(&self) -> HalResult<()> {
        if self.sweep_status() == SweepStatus::Idle {
            Ok(())
        } else {
            Err(HalError::Busy("sweep in progress"))
        }
    }

    /// Start a sweep; returns as soon as the worker has it.
    pub fn start_sweep(&self, config: SweepConfig) -> HalResult<()> {
        self.start(Request::Sweep(config))
    }

    /// Stop after the point in progress, keeping the partial trace.
    pub fn halt(&self) {
        let mut status = lock(&self.shared.status);
        if *status == SweepStatus::Running {
            self.shared.control.request_halt();
            *status = SweepStatus::Halting;
        }
    }

    /// Stop now; the point in flight is discarded and the link cleared.
    pub fn abort(&self) {
        let mut status = lock(&self.shared.status);
        if *status != SweepStatus::Idle {
            self.shared.control.request_abort();
            *status = SweepStatus::Halting;
        }
    }

    /// Block until the worker is idle or `timeout` passes; true if idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let status = lock(&self.shared.status);
        let (status, _) = self
            .shared
            .status_changed
            .wait_timeout_while(status, timeout, |s| *s != SweepStatus::Idle)
            .unwrap_or_else(PoisonError::into_inner);
        *status == SweepStatus::Idle
    }

    /// Start an Open/Short/Load procedure over the points of `config`.
    ///
    /// Reference sweeps are always taken in reflection mode.
    pub fn begin_calibration(&self, config: SweepConfig) -> HalResult<()> {
        self.ensure_connected()?;
        self.ensure_idle()?;
        self.call(|reply| Request::BeginCalibration { config, reply })
    }

    /// Sweep the standard the procedure is waiting for.
    ///
    /// Returns which standard is being measured; the sweep itself runs on
    /// the worker like any other.
    pub fn measure_next_standard(&self) -> HalResult<Standard> {
        let state = self.calibration_state();
        let standard = state.pending_standard().ok_or_else(|| {
            HalError::Core(CoreError::InvalidState(format!(
                "no standard to measure in state {:?}",
                state
            )))
        })?;
        self.start(Request::MeasureStandard)?;
        Ok(standard)
    }

    /// Abandon the procedure; the active calibration is untouched.
    pub fn cancel_calibration(&self) -> HalResult<()> {
        self.send(Request::CancelCalibration)
    }

    /// Drop the active calibration.
    pub fn clear_calibration(&self) -> HalResult<()> {
        self.ensure_idle()?;
        self.send(Request::ClearCalibration)
    }

    /// Load and activate a calibration file.
    ///
    /// A relative `path` is taken from the calibration directory. A failed
    /// load, including a version mismatch, leaves the previous calibration
    /// active.
    pub fn load_calibration(&self, path: &Path) -> HalResult<CalibrationStatus> {
        self.ensure_idle()?;
        let path = path.to_path_buf();
        self.call(|reply| Request::LoadCalibration { path, reply })
    }

    /// Save the active calibration; a relative `path` goes in the calibration
    /// directory.
    pub fn save_calibration(&self, path: &Path) -> HalResult<()> {
        let path = path.to_path_buf();
        self.call(|reply| Request::SaveCalibration { path, reply })
    }

    /// Copy of the current trace
    pub fn trace(&self) -> Trace {
        self.shared.trace.snapshot()
    }

    /// Shared read access to the trace
    pub fn trace_store(&self) -> TraceStore {
        self.shared.trace.clone()
    }

    /// Receive every subsequent trace change
    pub fn subscribe(&self) -> Receiver<TraceUpdate> {
        self.shared.trace.subscribe()
    }

    pub fn sweep_status(&self) -> SweepStatus {
        *lock(&self.shared.status)
    }

    pub fn calibration_status(&self) -> CalibrationStatus {
        *lock(&self.shared.calibration_status)
    }

    pub fn calibration_state(&self) -> CalibrationState {
        *lock(&self.shared.calibration_state)
    }

    /// Table applied to new sweeps
    pub fn active_calibration(&self) -> Option<Arc<CalibrationTable>> {
        self.shared.calibration.current()
    }

    /// Message of the last failed operation, cleared when a sweep starts
    pub fn last_error(&self) -> Option<String> {
        lock(&self.shared.last_error).clone()
    }

    /// Sync counters as of the last finished sweep
    pub fn sync_stats(&self) -> SyncStats {
        *lock(&self.shared.sync)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Stop the worker and wait for it to exit.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.worker.take() else {
            return;
        };
        self.shared.control.request_abort();
        let _ = self.requests.send(Request::Shutdown);
        if handle.join().is_err() {
            error!("Sweep worker panicked");
        }
        info!("Session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker<C: ByteChannel> {
    link: DeviceLink<C>,
    controller: SweepController,
    engine: CalibrationEngine,
    shared: Arc<Shared>,
    calibration: CalibrationConfig,
    calibration_sweep: Option<SweepConfig>,
}

impl<C: ByteChannel> Worker<C> {
    fn run(mut self, requests: Receiver<Request>) {
        while let Ok(request) = requests.recv() {
            match request {
                Request::Sweep(config) => {
                    self.measure(config);
                    self.shared.set_status(SweepStatus::Idle);
                }
                Request::MeasureStandard => {
                    self.measure_standard();
                    self.shared.set_status(SweepStatus::Idle);
                }
                Request::BeginCalibration { config, reply } => {
                    let _ = reply.send(self.begin_calibration(config));
                }
                Request::CancelCalibration => {
                    self.engine.cancel();
                    self.calibration_sweep = None;
                    self.publish_calibration();
                }
                Request::ClearCalibration => {
                    self.engine.clear();
                    self.recorrect();
                    self.publish_calibration();
                }
                Request::LoadCalibration { path, reply } => {
                    let path = self.calibration_path(&path);
                    let result = self.engine.load(&path).map_err(HalError::from);
                    if let Err(e) = &result {
                        warn!(path = %path.display(), error = %e, "Calibration load rejected");
                    } else {
                        info!(path = %path.display(), "Calibration loaded");
                        self.recorrect();
                    }
                    self.publish_calibration();
                    let _ = reply.send(result.map(|_| self.engine.status()));
                }
                Request::SaveCalibration { path, reply } => {
                    let path = self.calibration_path(&path);
                    let _ = reply.send(self.engine.save(&path).map_err(HalError::from));
                }
                Request::Shutdown => break,
            }
        }
    }

    /// Relative calibration paths live under the calibration directory
    fn calibration_path(&self, path: &Path) -> PathBuf {
        match self.calibration.resolved_directory() {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }

    fn correction(
        &self,
        config: &SweepConfig,
        table: Option<Arc<CalibrationTable>>,
    ) -> PointCorrection {
        PointCorrection {
            mode: config.mode,
            jig: config.jig,
            table,
            reference_impedance: self.calibration.reference_impedance,
            truncate_to_unity: self.calibration.truncate_s11_to_unity,
        }
    }

    fn sweep(
        &mut self,
        config: &SweepConfig,
        correction: &PointCorrection,
    ) -> HalResult<SweepOutcome> {
        let trace = self.shared.trace.clone();
        trace.begin(config.mode, config.jig);
        let frequencies = config.frequency_points();
        if let (Some(&lo), Some(&hi)) = (frequencies.first(), frequencies.last()) {
            if !correction.covers(lo, hi) {
                warn!(
                    start_hz = lo,
                    stop_hz = hi,
                    "Sweep extends past the calibration range, edge terms used beyond it"
                );
                trace.set_outside_calibration(true);
            }
        }
        let result = self.controller.run(
            &mut self.link,
            config,
            correction,
            &self.shared.control,
            |point| trace.push(point).map_err(HalError::from),
        );
        *lock(&self.shared.sync) = self.link.sync_stats();
        result
    }

    fn fail(&self, e: HalError) {
        if e.is_fatal() {
            self.shared.connected.store(false, Ordering::SeqCst);
            error!(error = %e, "Acquisition stopped, device disconnected");
        } else {
            warn!(error = %e, "Operation failed");
        }
        self.shared.set_error(e.to_string());
    }

    fn measure(&mut self, config: SweepConfig) {
        // One table for the whole sweep
        let table = self.shared.calibration.current();
        let correction = self.correction(&config, table);
        if let Err(e) = self.sweep(&config, &correction) {
            self.fail(e);
        }
    }

    fn begin_calibration(&mut self, config: SweepConfig) -> HalResult<()> {
        let config = SweepConfig {
            mode: SweepMode::Reflection,
            jig: None,
            ..config
        };
        let frequencies = config.frequency_points();
        for &f in &frequencies {
            self.controller.synth.tuning_word(f)?;
        }
        self.engine.begin_with_spacing(frequencies, config.spacing)?;
        self.calibration_sweep = Some(config);
        self.publish_calibration();
        Ok(())
    }

    fn measure_standard(&mut self) {
        let (Some(standard), Some(config)) = (
            self.engine.state().pending_standard(),
            self.calibration_sweep.clone(),
        ) else {
            self.fail(CoreError::InvalidState("no calibration in progress".into()).into());
            return;
        };
        info!(%standard, "Measuring reference standard");
        // Reference sweeps are raw
        let correction = self.correction(&config, None);
        match self.sweep(&config, &correction) {
            Ok(SweepOutcome::Completed { .. }) => {
                let points = self.shared.trace.snapshot().points;
                match self.engine.submit(&points) {
                    Ok(Some(_)) => {
                        self.calibration_sweep = None;
                        self.recorrect();
                    }
                    Ok(None) => {}
                    Err(e) => {
                        self.calibration_sweep = None;
                        self.fail(e.into());
                    }
                }
            }
            Ok(outcome) => {
                self.engine.cancel();
                self.calibration_sweep = None;
                self.shared.set_error(format!(
                    "{} sweep interrupted after {} points, calibration cancelled",
                    standard,
                    outcome.points()
                ));
            }
            Err(e) => {
                self.engine.cancel();
                self.calibration_sweep = None;
                self.fail(e);
            }
        }
        self.publish_calibration();
    }

    /// Reapply the active calibration to the stored raw values.
    ///
    /// The trace supplies its own mode and jig.
    fn recorrect(&self) {
        let table = self.shared.calibration.current();
        let correction = self.correction(&SweepConfig::default(), table);
        self.shared.trace.recorrect(&correction);
    }

    fn publish_calibration(&self) {
        *lock(&self.shared.calibration_status) = self.engine.status();
        *lock(&self.shared.calibration_state) = self.engine.state();
    }
}
