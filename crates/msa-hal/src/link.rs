//! Device Link: framed command session over a [`ByteChannel`].
//!
//! Writes are buffered and sent as one transfer once the buffer would pass
//! the flush watermark, or on [`DeviceLink::flush`]. Each channel read is
//! bounded by `read_timeout`, but one status byte may take up to
//! `read_retries` such reads, so the wait per byte is bounded by
//! [`LinkSettings::status_wait`] (500 ms with the default 5 x 100 ms). A
//! status read that runs out of attempts yields a defined fallback instead of
//! blocking.
//!
//! ## ADC captures and the sync sequence
//!
//! A capture of `n` bits arrives as `n` status bytes. Each byte carries one
//! magnitude bit (bit 5, active low), one phase bit (bit 4) and a sync
//! nibble in bits 0-3. The nibble starts at `0xF` for the first byte of a
//! capture and decrements by one per byte:
//!
//! ```text
//!   bit   7   6   5     4     3..0
//!         -   -   /MAG  PHASE SEQ (F, E, D, ...)
//! ```
//!
//! A nibble mismatch is counted and otherwise ignored. After
//! `sync_error_limit` consecutive mismatches the link stops checking for the
//! rest of the session.

use std::collections::VecDeque;
use std::time::Duration;

use msa_core::config::LinkConfig;
use msa_core::AdcSample;
use tracing::{debug, error, info, trace, warn};

use crate::channel::ByteChannel;
use crate::error::{HalError, HalResult};
use crate::frame::Command;

/// Magnitude bit position in a status byte (active low)
pub const STATUS_MAG_BIT: u8 = 5;
/// Phase bit position in a status byte
pub const STATUS_PHASE_BIT: u8 = 4;
/// Sync nibble mask
pub const STATUS_SEQ_MASK: u8 = 0x0f;

/// Control-board output ports, each latched by its own strobe line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port {
    P1,
    P2,
    P3,
    P4,
}

impl Port {
    /// Control-line byte that latches the data bus into this port
    pub fn strobe(self) -> u8 {
        match self {
            Port::P1 => 0x01,
            Port::P2 => 0x02,
            Port::P3 => 0x04,
            Port::P4 => 0x08,
        }
    }

    /// Port latched by a control byte, if any
    pub fn from_strobe(control: u8) -> Option<Port> {
        match control {
            0x01 => Some(Port::P1),
            0x02 => Some(Port::P2),
            0x04 => Some(Port::P3),
            0x08 => Some(Port::P4),
            _ => None,
        }
    }
}

/// Sync checking counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    /// Status bytes checked
    pub checked: u64,
    /// Total nibble mismatches
    pub errors: u64,
    /// Mismatches since the last good byte
    pub consecutive: u32,
    /// False once the consecutive limit was reached
    pub enabled: bool,
}

impl Default for SyncStats {
    fn default() -> Self {
        Self {
            checked: 0,
            errors: 0,
            consecutive: 0,
            enabled: true,
        }
    }
}

#[derive(Debug)]
struct SyncTracker {
    expected: u8,
    limit: u32,
    stats: SyncStats,
}

impl SyncTracker {
    fn new(limit: u32) -> Self {
        Self {
            expected: STATUS_SEQ_MASK,
            limit,
            stats: SyncStats::default(),
        }
    }

    fn start_capture(&mut self) {
        self.expected = STATUS_SEQ_MASK;
    }

    fn check(&mut self, status: u8) {
        let expected = self.expected;
        self.expected = expected.wrapping_sub(1) & STATUS_SEQ_MASK;
        if !self.stats.enabled {
            return;
        }
        self.stats.checked += 1;
        let seq = status & STATUS_SEQ_MASK;
        if seq == expected {
            self.stats.consecutive = 0;
            return;
        }
        self.stats.errors += 1;
        self.stats.consecutive += 1;
        warn!(
            expected = format_args!("{:x}", expected),
            got = format_args!("{:x}", seq),
            errors = self.stats.errors,
            "Status byte out of sync"
        );
        if self.stats.consecutive >= self.limit {
            self.stats.enabled = false;
            warn!(
                consecutive = self.stats.consecutive,
                "Sync checking disabled for this session"
            );
        }
    }
}

/// Fold a capture's status bytes into magnitude and phase codes.
///
/// Bits arrive most significant first. The phase detector counts downward,
/// so the phase code is `2^bits - raw`, wrapped to `bits` bits.
pub fn decode_adc_bits(status: &[u8], bits: u32) -> AdcSample {
    let (mag, raw_phase) = status.iter().fold((0u64, 0u64), |(mag, phase), &b| {
        let m = u64::from((!b >> STATUS_MAG_BIT) & 1);
        let p = u64::from((b >> STATUS_PHASE_BIT) & 1);
        ((mag << 1) | m, (phase << 1) | p)
    });
    let bits = bits.min(32);
    let full = 1u64 << bits;
    let mask = full - 1;
    AdcSample::new(
        (mag & mask) as u32,
        (full.wrapping_sub(raw_phase) & mask) as u32,
    )
}

/// Encode one status byte; the inverse of what [`decode_adc_bits`] reads.
pub fn encode_status_byte(mag_bit: bool, phase_bit: bool, seq: u8) -> u8 {
    let mut b = seq & STATUS_SEQ_MASK;
    if !mag_bit {
        b |= 1 << STATUS_MAG_BIT;
    }
    if phase_bit {
        b |= 1 << STATUS_PHASE_BIT;
    }
    b
}

/// Result of one ADC capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdcReading {
    pub sample: AdcSample,
    /// Fewer status bytes than requested arrived before the timeout
    pub timed_out: bool,
}

/// Timing and protocol settings of a link.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSettings {
    pub flush_watermark: usize,
    pub read_timeout: Duration,
    pub sync_error_limit: u32,
    pub read_retries: u32,
    pub required_firmware: String,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self::from(&LinkConfig::default())
    }
}

impl From<&LinkConfig> for LinkSettings {
    fn from(cfg: &LinkConfig) -> Self {
        Self {
            flush_watermark: cfg.flush_watermark,
            read_timeout: Duration::from_millis(cfg.read_timeout_ms),
            sync_error_limit: cfg.sync_error_limit,
            read_retries: cfg.read_retries.max(1),
            required_firmware: cfg.required_firmware.clone(),
        }
    }
}

impl LinkSettings {
    /// Longest wait for a single status byte: every retry spends at most
    /// one read timeout.
    pub fn status_wait(&self) -> Duration {
        self.read_timeout * self.read_retries
    }
}

/// Framed command session over a byte channel.
pub struct DeviceLink<C: ByteChannel> {
    channel: C,
    settings: LinkSettings,
    write_buf: Vec<u8>,
    read_buf: VecDeque<u8>,
    sync: SyncTracker,
    connected: bool,
}

impl<C: ByteChannel> std::fmt::Debug for DeviceLink<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLink")
            .field("pending_write", &self.write_buf.len())
            .field("pending_read", &self.read_buf.len())
            .field("sync", &self.sync.stats)
            .field("connected", &self.connected)
            .finish()
    }
}

impl<C: ByteChannel> DeviceLink<C> {
    pub fn new(channel: C, settings: LinkSettings) -> Self {
        let watermark = settings.flush_watermark.min(channel.max_frame_size()).max(1);
        let settings = LinkSettings {
            flush_watermark: watermark,
            ..settings
        };
        Self {
            sync: SyncTracker::new(settings.sync_error_limit),
            write_buf: Vec::with_capacity(watermark),
            read_buf: VecDeque::new(),
            channel,
            settings,
            connected: true,
        }
    }

    /// Link settings in effect
    pub fn settings(&self) -> &LinkSettings {
        &self.settings
    }

    /// Sync counters for this session
    pub fn sync_stats(&self) -> SyncStats {
        self.sync.stats
    }

    /// False after a transport failure
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Bytes waiting to be sent
    pub fn pending_write(&self) -> usize {
        self.write_buf.len()
    }

    /// Access the underlying channel
    pub fn channel(&self) -> &C {
        &self.channel
    }

    fn ensure_connected(&self) -> HalResult<()> {
        if self.connected {
            Ok(())
        } else {
            Err(HalError::ConnectionLost("link is disconnected".into()))
        }
    }

    fn lost(&mut self, e: HalError) -> HalError {
        if e.is_fatal() && self.connected {
            self.connected = false;
            error!(error = %e, "Device link lost");
        }
        e
    }

    fn push(&mut self, cmd: Command) -> HalResult<()> {
        self.ensure_connected()?;
        let len = cmd.encoded_len();
        if self.write_buf.len() + len > self.settings.flush_watermark {
            self.flush()?;
        }
        trace!(?cmd, "queue");
        cmd.encode_into(&mut self.write_buf);
        Ok(())
    }

    /// Queue a write of `byte` to the data port.
    pub fn out_port(&mut self, byte: u8) -> HalResult<()> {
        self.push(Command::Data(byte))
    }

    /// Queue a write of `byte` to the control port.
    pub fn out_control(&mut self, byte: u8) -> HalResult<()> {
        self.push(Command::Control(byte))
    }

    /// Latch `data` into `port`: data byte, strobe, then strobes idle.
    pub fn set_port(&mut self, port: Port, data: u8) -> HalResult<()> {
        self.out_port(data)?;
        self.out_control(port.strobe())?;
        self.out_control(0)
    }

    /// Queue one register-programming frame clocked out port P1.
    pub fn send_registers(&mut self, bytes: &[u8], clock_mask: u8) -> HalResult<()> {
        self.push(Command::program(clock_mask, bytes)?)
    }

    /// Queue a capture of `bits` serialized status bytes.
    pub fn request_adc_read(&mut self, bits: u8) -> HalResult<()> {
        self.push(Command::AdcRead(bits))
    }

    /// Queue a device-side wait; zero rounds up to 1 ms and long waits are
    /// split into several frames.
    pub fn wait_ms(&mut self, ms: u32) -> HalResult<()> {
        let mut left = ms.max(1);
        while left > 0 {
            let chunk = left.min(u32::from(u8::MAX));
            self.push(Command::Wait(chunk as u8))?;
            left -= chunk;
        }
        Ok(())
    }

    /// Queue a request for the device to send its pending read bytes.
    pub fn flush_read(&mut self) -> HalResult<()> {
        self.push(Command::FlushRead)
    }

    /// Send everything buffered as one transfer.
    pub fn flush(&mut self) -> HalResult<()> {
        self.ensure_connected()?;
        if self.write_buf.is_empty() {
            return Ok(());
        }
        trace!(bytes = self.write_buf.len(), "flush");
        let result = self.channel.write(&self.write_buf);
        self.write_buf.clear();
        result.map_err(|e| self.lost(e))
    }

    /// One bounded read from the channel into the local buffer.
    fn fill(&mut self) -> HalResult<usize> {
        let max = self.channel.max_frame_size();
        let timeout = self.settings.read_timeout;
        let data = self.channel.read(max, timeout).map_err(|e| self.lost(e))?;
        self.read_buf.extend(&data);
        Ok(data.len())
    }

    /// Read the status register.
    ///
    /// Returns 0 when the device does not answer within the read timeout.
    pub fn read_status(&mut self) -> HalResult<u8> {
        self.push(Command::Status)?;
        self.flush_read()?;
        self.flush()?;
        if self.read_buf.is_empty() {
            self.fill()?;
        }
        Ok(self.read_buf.pop_front().unwrap_or(0))
    }

    /// Next already-requested status byte, retrying bounded reads.
    ///
    /// Blocks for at most [`LinkSettings::status_wait`]. `None` when every
    /// attempt timed out.
    pub fn in_status(&mut self) -> HalResult<Option<u8>> {
        let mut attempts = self.settings.read_retries;
        while self.read_buf.is_empty() && attempts > 0 {
            self.fill()?;
            attempts -= 1;
        }
        Ok(self.read_buf.pop_front())
    }

    /// Collect the `bits` status bytes of a requested capture and decode
    /// them.
    ///
    /// On timeout the partial capture is discarded and the reading is zero.
    pub fn read_adcs(&mut self, bits: u8) -> HalResult<AdcReading> {
        self.sync.start_capture();
        let mut status = Vec::with_capacity(bits as usize);
        for _ in 0..bits {
            match self.in_status()? {
                Some(b) => {
                    self.sync.check(b);
                    status.push(b);
                }
                None => {
                    warn!(
                        received = status.len(),
                        requested = bits,
                        "ADC read timed out"
                    );
                    self.read_buf.clear();
                    return Ok(AdcReading {
                        sample: AdcSample::default(),
                        timed_out: true,
                    });
                }
            }
        }
        let sample = decode_adc_bits(&status, u32::from(bits));
        debug!(
            magnitude = sample.magnitude,
            phase = sample.phase,
            "ADC capture"
        );
        Ok(AdcReading {
            sample,
            timed_out: false,
        })
    }

    /// Request, push and read one capture.
    pub fn capture(&mut self, bits: u8) -> HalResult<AdcReading> {
        self.request_adc_read(bits)?;
        self.flush_read()?;
        self.flush()?;
        self.read_adcs(bits)
    }

    /// Query the firmware version as `(major, minor)`.
    ///
    /// `None` when the device sent fewer than two bytes.
    pub fn firmware_version(&mut self) -> HalResult<Option<(u8, u8)>> {
        self.push(Command::Version)?;
        self.flush_read()?;
        self.flush()?;
        let mut attempts = self.settings.read_retries;
        while self.read_buf.len() < 2 && attempts > 0 {
            self.fill()?;
            attempts -= 1;
        }
        if self.read_buf.len() < 2 {
            self.read_buf.clear();
            return Ok(None);
        }
        let major = self.read_buf.pop_front().unwrap_or(0);
        let minor = self.read_buf.pop_front().unwrap_or(0);
        Ok(Some((major, minor)))
    }

    /// Check the firmware against the required version.
    pub fn validate_firmware(&mut self) -> HalResult<String> {
        let required = self.settings.required_firmware.clone();
        match self.firmware_version()? {
            None => Err(HalError::DeviceNotFound(
                "no reply to firmware version request".into(),
            )),
            Some((major, minor)) => {
                let found = format!("{}.{}", major, minor);
                if found != required {
                    return Err(HalError::FirmwareMismatch { found, required });
                }
                info!(firmware = %found, "Control board firmware accepted");
                Ok(found)
            }
        }
    }

    /// Drop all buffered traffic and restart the sync sequence.
    ///
    /// Unsent commands are discarded, the device is told to push anything it
    /// still holds, and whatever arrives within one read timeout is thrown
    /// away. Sync error counters survive; only the sequence restarts.
    pub fn clear(&mut self) -> HalResult<()> {
        self.write_buf.clear();
        self.read_buf.clear();
        self.sync.start_capture();
        self.sync.stats.consecutive = 0;
        if !self.connected {
            return Ok(());
        }
        self.flush_read()?;
        self.flush()?;
        let drained = self.fill()?;
        self.read_buf.clear();
        debug!(drained, "Link cleared");
        Ok(())
    }
}
