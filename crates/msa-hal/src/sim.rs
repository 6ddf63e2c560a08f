//! Simulated MSA front end
//!
//! A pure-software stand-in for the control board, usable anywhere a
//! [`ByteChannel`] is expected. It decodes the command frames, emulates the
//! four latched output ports, the DDS serial register, the step attenuator
//! and the bit-serial ADC, and measures a pluggable device under test. The
//! magnitude detector follows the fixed log mapping, so a unit reflection
//! reads as 0 dBm.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                     SimulatedFrontEnd                         │
//! │                                                               │
//! │  write() ──► frame decoder ──► ports P1..P4 ──► DDS / atten   │
//! │                   │                                  │        │
//! │                   │ A n          DUT(f) ──► error box ┘        │
//! │                   ▼                   │                       │
//! │             ADC serializer ◄──────────┘                       │
//! │                   │                                           │
//! │              pending ──(F)──► outbox ──► read()               │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Waits are virtual: `W` frames only add to a counter, so simulated sweeps
//! run at full speed. Faults can be injected through [`SimHandle`].

use std::collections::{BTreeSet, VecDeque};
use std::f64::consts::TAU;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use msa_core::detector::linear_code;
use msa_core::numeric::polar_db_deg;
use msa_core::Complex;
use tracing::{debug, trace};

use crate::channel::{ByteChannel, MAX_FRAME_SIZE};
use crate::error::{HalError, HalResult};
use crate::frame::Command;
use crate::link::{encode_status_byte, Port, STATUS_SEQ_MASK};
use crate::synth::{
    dds_frequency, ATTEN_BITS, ATTEN_STEP_DB, DDS_WORD_BITS, P1_CLK, P1_DDS1_DATA, P2_FQUD1,
    P4_ATTEN_CLK, P4_ATTEN_DATA, P4_ATTEN_LE,
};

/// Reflection (or transmission) of the device under test at a frequency
pub type DutModel = Box<dyn Fn(f64) -> Complex + Send>;

/// One-port bridge error model.
///
/// The detector sees `e00 + e01·Γ / (1 − e11·Γ)` for a DUT reflection `Γ`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ErrorBox {
    /// Directivity
    pub e00: Complex,
    /// Source match
    pub e11: Complex,
    /// Reflection tracking
    pub e01: Complex,
}

impl Default for ErrorBox {
    fn default() -> Self {
        Self {
            e00: Complex::new(0.0, 0.0),
            e11: Complex::new(0.0, 0.0),
            e01: Complex::new(1.0, 0.0),
        }
    }
}

impl ErrorBox {
    /// Value the detector measures for `gamma`
    pub fn measure(&self, gamma: Complex) -> Complex {
        self.e00 + self.e01 * gamma / (Complex::new(1.0, 0.0) - self.e11 * gamma)
    }
}

struct SimState {
    /// DDS reference clock
    master_clock_hz: f64,
    /// Partially received frame bytes
    inbuf: Vec<u8>,
    /// Last value written to the data bus
    data_bus: u8,
    /// Latched port outputs, P1..P4
    ports: [u8; 4],
    /// DDS serial shift register, 40 bits
    dds_shift: u64,
    /// Tuning word loaded by the last update pulse
    dds_word: Option<u32>,
    /// Attenuator shift register
    atten_shift: u8,
    /// Code loaded by the last latch
    atten_code: Option<u8>,
    atten_latches: usize,
    waited_ms: u64,
    firmware: Option<(u8, u8)>,
    /// Byte returned by an `S` request
    status_register: u8,
    /// Bytes produced but not yet pushed to the host
    pending: Vec<u8>,
    /// Bytes the host can read
    outbox: VecDeque<u8>,
    dut: DutModel,
    error_box: Option<ErrorBox>,
    captures: usize,
    status_bytes: usize,
    corrupt_status: BTreeSet<usize>,
    timeout_captures: BTreeSet<usize>,
    disconnect_after: Option<usize>,
    connected: bool,
    capture_delay: Duration,
}

impl SimState {
    fn port(&self, port: Port) -> u8 {
        self.ports[port_index(port)]
    }

    fn push_pending(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        if self.pending.len() >= MAX_FRAME_SIZE {
            self.flush_pending();
        }
    }

    fn flush_pending(&mut self) {
        self.outbox.extend(self.pending.drain(..));
    }

    fn execute(&mut self, cmd: Command) -> HalResult<()> {
        trace!(?cmd, "sim");
        match cmd {
            Command::Data(b) => self.data_bus = b,
            Command::Control(c) => {
                if let Some(port) = Port::from_strobe(c) {
                    self.latch(port);
                }
            }
            Command::Status => {
                let b = self.status_register;
                self.push_pending(&[b]);
            }
            Command::Program {
                clock_mask,
                payload,
            } => {
                if clock_mask & P1_CLK != 0 {
                    for b in payload {
                        let bit = u64::from(b & P1_DDS1_DATA != 0);
                        self.dds_shift =
                            (self.dds_shift >> 1) | (bit << (DDS_WORD_BITS as u64 - 1));
                    }
                }
            }
            Command::Wait(ms) => self.waited_ms += u64::from(ms),
            Command::FlushRead => self.flush_pending(),
            Command::AdcRead(bits) => self.adc_capture(bits)?,
            Command::Version => {
                if let Some((major, minor)) = self.firmware {
                    self.push_pending(&[major, minor]);
                }
            }
        }
        Ok(())
    }

    fn latch(&mut self, port: Port) {
        let idx = port_index(port);
        let old = self.ports[idx];
        let new = self.data_bus;
        self.ports[idx] = new;
        let rising = |mask: u8| new & mask != 0 && old & mask == 0;
        match port {
            Port::P2 if rising(P2_FQUD1) => {
                let word = (self.dds_shift & 0xffff_ffff) as u32;
                self.dds_word = Some(word);
                debug!(
                    word,
                    frequency_hz = dds_frequency(word, self.master_clock_hz),
                    "sim DDS loaded"
                );
            }
            Port::P4 => {
                if rising(P4_ATTEN_CLK) {
                    let bit = u8::from(new & P4_ATTEN_DATA != 0);
                    self.atten_shift = ((self.atten_shift << 1) | bit) & ((1 << ATTEN_BITS) - 1);
                }
                if rising(P4_ATTEN_LE) {
                    self.atten_code = Some(self.atten_shift);
                    self.atten_latches += 1;
                }
            }
            _ => {}
        }
    }

    fn frequency_hz(&self) -> f64 {
        self.dds_word
            .map(|w| dds_frequency(w, self.master_clock_hz))
            .unwrap_or(0.0)
    }

    fn adc_capture(&mut self, bits: u8) -> HalResult<()> {
        let index = self.captures;
        self.captures += 1;
        if self.disconnect_after.map_or(false, |k| index >= k) {
            self.connected = false;
            return Err(HalError::ConnectionLost("simulated device unplugged".into()));
        }
        if self.timeout_captures.contains(&index) {
            debug!(index, "sim capture dropped");
            return Ok(());
        }

        let f = self.frequency_hz();
        let gamma = (self.dut)(f);
        let mut m = match &self.error_box {
            Some(eb) => eb.measure(gamma),
            None => gamma,
        };
        if let Some(code) = self.atten_code {
            m *= 10f64.powf(-f64::from(code) * ATTEN_STEP_DB / 20.0);
        }

        let n = u32::from(bits).min(32);
        let full = 1u64 << n;
        let mask = full - 1;
        let (level_db, _) = polar_db_deg(m);
        let mag = u64::from(linear_code(level_db, n)).min(mask);
        let turns = (m.arg() / TAU * full as f64).round() as i64;
        let phase = turns.rem_euclid(full as i64) as u64;
        let raw_phase = full.wrapping_sub(phase) & mask;

        let mut out = Vec::with_capacity(n as usize);
        for i in 0..n {
            let bit = n - 1 - i;
            let seq = (0x0f_u32.wrapping_sub(i) & u32::from(STATUS_SEQ_MASK)) as u8;
            let mut b =
                encode_status_byte((mag >> bit) & 1 == 1, (raw_phase >> bit) & 1 == 1, seq);
            if self.corrupt_status.contains(&self.status_bytes) {
                b ^= 0x05;
            }
            self.status_bytes += 1;
            out.push(b);
        }
        self.push_pending(&out);
        Ok(())
    }
}

fn port_index(port: Port) -> usize {
    match port {
        Port::P1 => 0,
        Port::P2 => 1,
        Port::P3 => 2,
        Port::P4 => 3,
    }
}

/// Simulated control board and RF path.
#[derive(Clone)]
pub struct SimulatedFrontEnd {
    state: Arc<Mutex<SimState>>,
}

impl std::fmt::Debug for SimulatedFrontEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = lock(&self.state);
        f.debug_struct("SimulatedFrontEnd")
            .field("frequency_hz", &s.frequency_hz())
            .field("captures", &s.captures)
            .field("connected", &s.connected)
            .finish()
    }
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimulatedFrontEnd {
    /// Create a front end measuring `dut`, with a 64 MHz master clock and
    /// firmware 0.1.
    pub fn new<F>(dut: F) -> Self
    where
        F: Fn(f64) -> Complex + Send + 'static,
    {
        Self::with_master_clock(64e6, dut)
    }

    /// Create a front end with a specific DDS reference clock
    pub fn with_master_clock<F>(master_clock_hz: f64, dut: F) -> Self
    where
        F: Fn(f64) -> Complex + Send + 'static,
    {
        let state = SimState {
            master_clock_hz,
            inbuf: Vec::new(),
            data_bus: 0,
            ports: [0; 4],
            dds_shift: 0,
            dds_word: None,
            atten_shift: 0,
            atten_code: None,
            atten_latches: 0,
            waited_ms: 0,
            firmware: Some((0, 1)),
            status_register: 0x0f,
            pending: Vec::new(),
            outbox: VecDeque::new(),
            dut: Box::new(dut),
            error_box: None,
            captures: 0,
            status_bytes: 0,
            corrupt_status: BTreeSet::new(),
            timeout_captures: BTreeSet::new(),
            disconnect_after: None,
            connected: true,
            capture_delay: Duration::ZERO,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Handle for inspection and fault injection; shares this front end's
    /// state.
    pub fn handle(&self) -> SimHandle {
        SimHandle {
            state: self.state.clone(),
        }
    }
}

impl ByteChannel for SimulatedFrontEnd {
    fn write(&mut self, data: &[u8]) -> HalResult<()> {
        let delay = {
            let mut s = lock(&self.state);
            if !s.connected {
                return Err(HalError::ConnectionLost("simulated device unplugged".into()));
            }
            s.inbuf.extend_from_slice(data);
            let before = s.captures;
            let mut pos = 0;
            let result = loop {
                let decoded = Command::decode(&s.inbuf[pos..]);
                match decoded {
                    Ok(Some((cmd, used))) => {
                        pos += used;
                        if let Err(e) = s.execute(cmd) {
                            break Err(e);
                        }
                    }
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                }
            };
            s.inbuf.drain(..pos);
            if result.is_err() {
                s.inbuf.clear();
            }
            result?;
            (s.captures > before).then_some(s.capture_delay)
        };
        if let Some(d) = delay.filter(|d| !d.is_zero()) {
            std::thread::sleep(d);
        }
        Ok(())
    }

    fn read(&mut self, max: usize, _timeout: Duration) -> HalResult<Vec<u8>> {
        let mut s = lock(&self.state);
        if !s.connected {
            return Err(HalError::ConnectionLost("simulated device unplugged".into()));
        }
        let n = max.min(s.outbox.len());
        Ok(s.outbox.drain(..n).collect())
    }
}

/// Inspection and fault-injection handle on a [`SimulatedFrontEnd`].
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl std::fmt::Debug for SimHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimHandle").finish_non_exhaustive()
    }
}

impl SimHandle {
    fn state(&self) -> MutexGuard<'_, SimState> {
        lock(&self.state)
    }

    /// Replace the device under test
    pub fn set_dut<F>(&self, dut: F)
    where
        F: Fn(f64) -> Complex + Send + 'static,
    {
        self.state().dut = Box::new(dut);
    }

    /// Put a bridge error model between the DUT and the detector
    pub fn set_error_box(&self, error_box: Option<ErrorBox>) {
        self.state().error_box = error_box;
    }

    /// Firmware version reported to `V`; `None` makes the board silent
    pub fn set_firmware(&self, version: Option<(u8, u8)>) {
        self.state().firmware = version;
    }

    /// Flip sync bits of the `index`-th status byte sent (counting from 0)
    pub fn corrupt_status_byte(&self, index: usize) {
        self.state().corrupt_status.insert(index);
    }

    /// Send nothing for the `index`-th capture (counting from 0)
    pub fn timeout_capture(&self, index: usize) {
        self.state().timeout_captures.insert(index);
    }

    /// Drop the link when capture number `count` is requested
    pub fn disconnect_after(&self, count: usize) {
        self.state().disconnect_after = Some(count);
    }

    /// Drop the link immediately
    pub fn unplug(&self) {
        self.state().connected = false;
    }

    /// Real-time delay after each write that requests a capture
    pub fn set_capture_delay(&self, delay: Duration) {
        self.state().capture_delay = delay;
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    /// Frequency of the last loaded tuning word, 0 before the first
    pub fn dds_frequency_hz(&self) -> f64 {
        self.state().frequency_hz()
    }

    pub fn dds_word(&self) -> Option<u32> {
        self.state().dds_word
    }

    /// Code loaded by the last attenuator latch
    pub fn attenuator_code(&self) -> Option<u8> {
        self.state().atten_code
    }

    pub fn attenuator_latches(&self) -> usize {
        self.state().atten_latches
    }

    /// Total device-side wait requested so far
    pub fn waited_ms(&self) -> u64 {
        self.state().waited_ms
    }

    /// Captures requested so far
    pub fn captures(&self) -> usize {
        self.state().captures
    }

    /// Latched value of an output port
    pub fn port(&self, port: Port) -> u8 {
        self.state().port(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{decode_adc_bits, DeviceLink, LinkSettings};
    use crate::synth::{program_attenuator, Synthesizer};
    use approx::assert_relative_eq;

    fn link(sim: &SimulatedFrontEnd) -> DeviceLink<SimulatedFrontEnd> {
        DeviceLink::new(sim.clone(), LinkSettings::default())
    }

    #[test]
    fn test_dds_word_reaches_the_register() {
        let sim = SimulatedFrontEnd::new(|_| Complex::new(0.0, 0.0));
        let mut l = link(&sim);
        let word = Synthesizer::default().program(&mut l, 12.5e6).unwrap();
        l.flush().unwrap();
        let h = sim.handle();
        assert_eq!(h.dds_word(), Some(word));
        assert_relative_eq!(h.dds_frequency_hz(), 12.5e6, epsilon = 0.02);
        assert_eq!(h.port(Port::P2), 0);
    }

    #[test]
    fn test_attenuator_shift_and_latch() {
        let sim = SimulatedFrontEnd::new(|_| Complex::new(0.0, 0.0));
        let mut l = link(&sim);
        program_attenuator(&mut l, 21.5).unwrap();
        l.flush().unwrap();
        assert_eq!(sim.handle().attenuator_code(), Some(43));
        assert_eq!(sim.handle().attenuator_latches(), 1);
    }

    #[test]
    fn test_capture_encodes_dut() {
        let sim = SimulatedFrontEnd::new(|_| Complex::from_polar(0.25, -1.0));
        let mut l = link(&sim);
        let r = l.capture(16).unwrap();
        assert!(!r.timed_out);
        let z = msa_core::Detector::new(16).to_complex(r.sample, 0.0);
        assert_relative_eq!(z.norm(), 0.25, epsilon = 1e-4);
        assert_relative_eq!(z.arg(), -1.0, epsilon = 1e-3);
        assert_eq!(l.sync_stats().errors, 0);
    }

    #[test]
    fn test_error_box_applied() {
        let eb = ErrorBox {
            e00: Complex::new(0.1, 0.0),
            ..Default::default()
        };
        assert_eq!(eb.measure(Complex::new(0.0, 0.0)), Complex::new(0.1, 0.0));
        assert_eq!(
            ErrorBox::default().measure(Complex::new(-1.0, 0.0)),
            Complex::new(-1.0, 0.0)
        );
    }

    #[test]
    fn test_status_bytes_wait_for_flush_read() {
        let sim = SimulatedFrontEnd::new(|_| Complex::new(0.5, 0.0));
        let mut ch = sim.clone();
        ch.write(b"A\x10").unwrap();
        assert!(ch.read(512, Duration::ZERO).unwrap().is_empty());
        ch.write(b"F\x00").unwrap();
        let bytes = ch.read(512, Duration::ZERO).unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes[0] & STATUS_SEQ_MASK, 0x0f);
        assert_eq!(bytes[15] & STATUS_SEQ_MASK, 0x00);
        // -6.02 dB on the log scale
        let code = decode_adc_bits(&bytes, 16).magnitude;
        assert_eq!(code, linear_code(-20.0 * 2f64.log10(), 16));
        assert!((30794..=30796).contains(&code));
    }

    #[test]
    fn test_frames_split_across_writes() {
        let sim = SimulatedFrontEnd::new(|_| Complex::new(0.0, 0.0));
        let mut ch = sim.clone();
        ch.write(b"W").unwrap();
        ch.write(b"\x07W\x03").unwrap();
        assert_eq!(sim.handle().waited_ms(), 10);
    }

    #[test]
    fn test_faults() {
        let sim = SimulatedFrontEnd::new(|_| Complex::new(0.5, 0.0));
        let h = sim.handle();
        h.timeout_capture(0);
        h.disconnect_after(1);
        let mut l = link(&sim);
        assert!(l.capture(16).unwrap().timed_out);
        assert!(l.capture(16).is_err());
        assert!(!h.is_connected());
    }

    #[test]
    fn test_unknown_opcode_is_fatal() {
        let sim = SimulatedFrontEnd::new(|_| Complex::new(0.0, 0.0));
        let mut ch = sim.clone();
        assert!(ch.write(b"Q\x00").unwrap_err().is_fatal());
    }
}
