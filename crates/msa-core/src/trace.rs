//! Trace Store: ordered corrected sweep points shared with the display.
//!
//! One writer (the acquisition worker) and any number of readers. Points are
//! appended one at a time during a sweep, or the whole sequence is replaced
//! at once (after recalibration). Every write happens under the store lock,
//! so a reader sees a point either completely or not at all.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::calibration::CalibrationTable;
use crate::error::{CoreError, CoreResult};
use crate::two_port::{equiv_s11_from_s21, ReflectionSummary};
use crate::types::{Complex, JigType, SweepMode, SweepPoint};

/// Updates buffered per subscriber before further ones are dropped
pub const SUBSCRIBER_CAPACITY: usize = 4096;

/// Vertical axis of the trace display.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VerticalScale {
    pub top: f64,
    pub bottom: f64,
}

impl Default for VerticalScale {
    fn default() -> Self {
        Self {
            top: 0.0,
            bottom: -100.0,
        }
    }
}

/// An ordered sequence of sweep points plus display metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub mode: SweepMode,
    /// Fixture of a transmission sweep
    #[serde(default)]
    pub jig: Option<JigType>,
    /// The reflection table does not span the sweep; points beyond it were
    /// corrected with the edge terms
    #[serde(default)]
    pub outside_calibration: bool,
    pub scale: VerticalScale,
    pub units: String,
    pub points: Vec<SweepPoint>,
}

impl Default for Trace {
    fn default() -> Self {
        Self::new(SweepMode::Reflection)
    }
}

impl Trace {
    /// Empty trace for `mode`
    pub fn new(mode: SweepMode) -> Self {
        Self {
            mode,
            jig: None,
            outside_calibration: false,
            scale: VerticalScale::default(),
            units: "dB".to_string(),
            points: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Point frequencies in Hz
    pub fn frequencies(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.frequency_hz).collect()
    }

    /// Derived reflection quantities for each corrected point
    pub fn summaries(&self, reference_impedance: f64) -> Vec<(f64, ReflectionSummary)> {
        self.points
            .iter()
            .map(|p| {
                (
                    p.frequency_hz,
                    ReflectionSummary::from_s11(p.corrected, reference_impedance),
                )
            })
            .collect()
    }

    /// Write the corrected points as a Touchstone one-port file
    /// (`# Hz S RI R <r0>`).
    pub fn write_touchstone<W: Write>(&self, mut w: W, reference_impedance: f64) -> CoreResult<()> {
        writeln!(w, "! {} points, {:?}", self.points.len(), self.mode)?;
        writeln!(w, "# Hz S RI R {}", reference_impedance)?;
        for p in &self.points {
            writeln!(
                w,
                "{} {:.9e} {:.9e}",
                p.frequency_hz, p.corrected.re, p.corrected.im
            )?;
        }
        Ok(())
    }

    /// Write a Touchstone file to `path`
    pub fn save_touchstone(&self, path: &Path, reference_impedance: f64) -> CoreResult<()> {
        let mut w = BufWriter::new(File::create(path)?);
        self.write_touchstone(&mut w, reference_impedance)?;
        w.flush()?;
        Ok(())
    }
}

/// Change notification sent to trace subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum TraceUpdate {
    /// A new sweep started; the trace is empty
    Cleared,
    /// One point was appended at `index`
    PointAppended { index: usize, point: SweepPoint },
    /// The whole sequence was replaced
    Replaced { len: usize },
}

/// How raw values become corrected values for one sweep.
#[derive(Debug, Clone, Default)]
pub struct PointCorrection {
    pub mode: SweepMode,
    pub jig: Option<JigType>,
    pub table: Option<Arc<CalibrationTable>>,
    pub reference_impedance: f64,
    pub truncate_to_unity: bool,
}

impl PointCorrection {
    /// Correct one raw value.
    ///
    /// Reflection applies the OSL table when one is active. Transmission with
    /// a fixture yields the equivalent S11; without one the raw S21 passes
    /// through. A timed-out point stays zero.
    pub fn apply(&self, raw: Complex, frequency_hz: f64) -> Complex {
        match self.mode {
            SweepMode::Reflection => match &self.table {
                Some(t) => t.apply_correction(raw, frequency_hz),
                None => raw,
            },
            SweepMode::Transmission => match self.jig {
                Some(jig) => {
                    equiv_s11_from_s21(raw, jig, self.reference_impedance, self.truncate_to_unity)
                        .0
                }
                None => raw,
            },
        }
    }

    /// Build a corrected point from a raw capture
    pub fn point(&self, frequency_hz: f64, raw: Complex) -> SweepPoint {
        SweepPoint::new(frequency_hz, raw).with_corrected(self.apply(raw, frequency_hz))
    }

    /// False when a reflection table is applied to a range it does not span
    pub fn covers(&self, start_hz: f64, stop_hz: f64) -> bool {
        match (&self.table, self.mode) {
            (Some(t), SweepMode::Reflection) => t.covers(start_hz, stop_hz),
            _ => true,
        }
    }

    fn recorrect(&self, p: &SweepPoint) -> SweepPoint {
        if p.timed_out {
            return *p;
        }
        p.with_corrected(self.apply(p.raw, p.frequency_hz))
    }
}

/// Shared, lock-protected trace with change notification.
#[derive(Debug, Clone, Default)]
pub struct TraceStore {
    trace: Arc<RwLock<Trace>>,
    subscribers: Arc<Mutex<Vec<SyncSender<TraceUpdate>>>>,
}

impl TraceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new sweep: drop all points and record how they are measured.
    pub fn begin(&self, mode: SweepMode, jig: Option<JigType>) {
        {
            let mut t = self.trace.write().unwrap_or_else(PoisonError::into_inner);
            t.mode = mode;
            t.jig = jig;
            t.outside_calibration = false;
            t.points.clear();
        }
        self.notify(TraceUpdate::Cleared);
    }

    /// Append one point. Frequencies must be strictly increasing.
    pub fn push(&self, point: SweepPoint) -> CoreResult<()> {
        let index = {
            let mut t = self.trace.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(last) = t.points.last() {
                if point.frequency_hz <= last.frequency_hz || point.frequency_hz.is_nan() {
                    return Err(CoreError::NonMonotonicFrequency {
                        previous: last.frequency_hz,
                        next: point.frequency_hz,
                    });
                }
            }
            t.points.push(point);
            t.points.len() - 1
        };
        self.notify(TraceUpdate::PointAppended { index, point });
        Ok(())
    }

    /// Mark the current sweep as corrected beyond its calibration range
    pub fn set_outside_calibration(&self, outside: bool) {
        self.trace
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .outside_calibration = outside;
    }

    /// Replace the whole point sequence in one write.
    pub fn replace(&self, points: Vec<SweepPoint>) -> CoreResult<()> {
        if let Some(w) = points
            .windows(2)
            .find(|w| w[1].frequency_hz <= w[0].frequency_hz)
        {
            return Err(CoreError::NonMonotonicFrequency {
                previous: w[0].frequency_hz,
                next: w[1].frequency_hz,
            });
        }
        let len = points.len();
        self.trace
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .points = points;
        self.notify(TraceUpdate::Replaced { len });
        Ok(())
    }

    /// Recompute every corrected value from the stored raw values and
    /// replace the sequence.
    ///
    /// Mode and jig come from the trace itself, whatever `correction` says,
    /// so the points are transformed the way they were measured.
    pub fn recorrect(&self, correction: &PointCorrection) {
        let (len, mode) = {
            let mut t = self.trace.write().unwrap_or_else(PoisonError::into_inner);
            let correction = PointCorrection {
                mode: t.mode,
                jig: t.jig,
                ..correction.clone()
            };
            let points: Vec<SweepPoint> =
                t.points.iter().map(|p| correction.recorrect(p)).collect();
            t.outside_calibration = match (points.first(), points.last()) {
                (Some(a), Some(b)) => !correction.covers(a.frequency_hz, b.frequency_hz),
                _ => false,
            };
            t.points = points;
            (t.points.len(), t.mode)
        };
        debug!(points = len, ?mode, "Trace recorrected");
        self.notify(TraceUpdate::Replaced { len });
    }

    /// Copy of the current trace
    pub fn snapshot(&self) -> Trace {
        self.trace
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of points currently stored
    pub fn len(&self) -> usize {
        self.trace
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .points
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Receive subsequent [`TraceUpdate`]s.
    ///
    /// Each subscriber buffers at most [`SUBSCRIBER_CAPACITY`] updates. While
    /// its buffer is full, new updates for it are dropped and the writer never
    /// blocks; a gap in `PointAppended` indices means updates were lost and
    /// [`Self::snapshot`] resynchronizes. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> Receiver<TraceUpdate> {
        let (tx, rx) = sync_channel(SUBSCRIBER_CAPACITY);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    fn notify(&self, update: TraceUpdate) {
        let mut subs = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subs.retain(|tx| match tx.try_send(update.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("Trace subscriber lagging, update dropped");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{OslStandards, ReferenceSweeps};
    use crate::sweep::Spacing;
    use std::thread;

    fn pt(f: f64, re: f64) -> SweepPoint {
        SweepPoint::new(f, Complex::new(re, 0.0))
    }

    #[test]
    fn test_push_and_snapshot() {
        let store = TraceStore::new();
        store.begin(SweepMode::Reflection, None);
        store.push(pt(1e6, 0.1)).unwrap();
        store.push(pt(2e6, 0.2)).unwrap();
        let snap = store.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap.frequencies(), vec![1e6, 2e6]);
    }

    #[test]
    fn test_push_rejects_non_monotonic() {
        let store = TraceStore::new();
        store.push(pt(2e6, 0.0)).unwrap();
        assert!(store.push(pt(2e6, 0.0)).is_err());
        assert!(store.push(pt(1e6, 0.0)).is_err());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_replace_rejects_unordered() {
        let store = TraceStore::new();
        assert!(store.replace(vec![pt(2e6, 0.0), pt(1e6, 0.0)]).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn test_subscription_sequence() {
        let store = TraceStore::new();
        let rx = store.subscribe();
        store.begin(SweepMode::Transmission, Some(JigType::Shunt));
        store.push(pt(1e6, 0.5)).unwrap();
        store.replace(vec![pt(1e6, 0.4), pt(2e6, 0.3)]).unwrap();

        assert_eq!(rx.recv().unwrap(), TraceUpdate::Cleared);
        match rx.recv().unwrap() {
            TraceUpdate::PointAppended { index, point } => {
                assert_eq!(index, 0);
                assert_eq!(point.frequency_hz, 1e6);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(rx.recv().unwrap(), TraceUpdate::Replaced { len: 2 });
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let store = TraceStore::new();
        drop(store.subscribe());
        store.push(pt(1e6, 0.0)).unwrap();
        assert!(store.subscribers.lock().unwrap().is_empty());
    }

    #[test]
    fn test_idle_subscriber_is_bounded() {
        let store = TraceStore::new();
        let rx = store.subscribe();
        for i in 0..SUBSCRIBER_CAPACITY + 100 {
            store.push(pt((i + 1) as f64, 0.0)).unwrap();
        }
        assert_eq!(store.len(), SUBSCRIBER_CAPACITY + 100);
        assert_eq!(rx.try_iter().count(), SUBSCRIBER_CAPACITY);
        // Still subscribed once drained
        store.push(pt(1e9, 0.0)).unwrap();
        assert!(matches!(
            rx.try_recv(),
            Ok(TraceUpdate::PointAppended { .. })
        ));
    }

    #[test]
    fn test_recorrect_uses_raw_values() {
        let store = TraceStore::new();
        let freqs = vec![1e6, 2e6];
        // Bridge that halves every reflection
        let refs = ReferenceSweeps {
            open: vec![Complex::new(0.5, 0.0); 2],
            short: vec![Complex::new(-0.5, 0.0); 2],
            load: vec![Complex::new(0.0, 0.0); 2],
        };
        let table = Arc::new(
            CalibrationTable::build(freqs, refs, &OslStandards::default(), 50.0, Spacing::Linear)
                .unwrap(),
        );
        store.push(pt(1e6, 0.25)).unwrap();
        store.push(SweepPoint::timed_out(2e6)).unwrap();

        store.recorrect(&PointCorrection {
            table: Some(table.clone()),
            reference_impedance: 50.0,
            ..Default::default()
        });
        let snap = store.snapshot();
        assert!((snap.points[0].corrected - Complex::new(0.5, 0.0)).norm() < 1e-12);
        assert_eq!(snap.points[0].raw, Complex::new(0.25, 0.0));
        assert_eq!(snap.points[1].corrected, Complex::new(0.0, 0.0));
        assert!(!snap.outside_calibration);

        // Wider sweep than the table
        store.push(pt(5e6, 0.25)).unwrap();
        store.recorrect(&PointCorrection {
            table: Some(table),
            reference_impedance: 50.0,
            ..Default::default()
        });
        assert!(store.snapshot().outside_calibration);
    }

    #[test]
    fn test_recorrect_follows_trace_mode() {
        let store = TraceStore::new();
        store.begin(SweepMode::Reflection, None);
        store.push(pt(1e6, 0.5)).unwrap();
        // A correction left over from an earlier transmission sweep
        store.recorrect(&PointCorrection {
            mode: SweepMode::Transmission,
            jig: Some(JigType::Series),
            reference_impedance: 50.0,
            ..Default::default()
        });
        let snap = store.snapshot();
        assert_eq!(snap.mode, SweepMode::Reflection);
        assert_eq!(snap.points[0].corrected, Complex::new(0.5, 0.0));

        store.begin(SweepMode::Transmission, Some(JigType::Series));
        store.push(pt(1e6, 0.5)).unwrap();
        store.recorrect(&PointCorrection {
            reference_impedance: 50.0,
            ..Default::default()
        });
        // Series S21 of 0.5 is a 100 ohm element
        let s11 = store.snapshot().points[0].corrected;
        assert!((s11 - Complex::new(1.0 / 3.0, 0.0)).norm() < 1e-12);
    }

    #[test]
    fn test_transmission_with_jig_yields_equivalent_s11() {
        let correction = PointCorrection {
            mode: SweepMode::Transmission,
            jig: Some(JigType::Series),
            reference_impedance: 50.0,
            ..Default::default()
        };
        // Perfect through: zero-ohm series element
        let p = correction.point(1e6, Complex::new(1.0, 0.0));
        assert!((p.corrected - Complex::new(-1.0, 0.0)).norm() < 1e-12);
    }

    #[test]
    fn test_readers_see_whole_points() {
        let store = TraceStore::new();
        let writer = store.clone();
        let handle = thread::spawn(move || {
            for i in 1..=500 {
                writer.push(pt(i as f64, i as f64)).unwrap();
            }
        });
        for _ in 0..200 {
            let snap = store.snapshot();
            for p in &snap.points {
                assert_eq!(p.raw.re, p.frequency_hz);
            }
        }
        handle.join().unwrap();
        assert_eq!(store.len(), 500);
    }

    #[test]
    fn test_touchstone_export() {
        let mut trace = Trace::new(SweepMode::Reflection);
        trace.points.push(pt(1e6, 0.5));
        let mut buf = Vec::new();
        trace.write_touchstone(&mut buf, 50.0).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[1], "# Hz S RI R 50");
        assert!(lines[2].starts_with("1000000 5.000000000e-1"));
    }
}
