//! Frequency synthesizer and step attenuator programming.
//!
//! The DDS takes a 40-bit serial word: 32 tuning bits, least significant
//! first, then 8 control bits (all zero for normal operation). The control
//! board clocks one payload byte per bit out port P1, with the DDS data line
//! on bit 2; a pulse on the P2 frequency-update line then loads the word.
//!
//! The step attenuator takes a 6-bit code in 0.5 dB steps, shifted most
//! significant bit first on port P4 and latched with its enable line.

use msa_core::config::SynthConfig;
use tracing::debug;

use crate::channel::ByteChannel;
use crate::error::{HalError, HalResult};
use crate::link::{DeviceLink, Port};

/// P1: common serial clock
pub const P1_CLK: u8 = 1 << 0;
/// P1: DDS1 serial data
pub const P1_DDS1_DATA: u8 = 1 << 2;
/// P2: DDS1 frequency update
pub const P2_FQUD1: u8 = 1 << 1;
/// P4: attenuator latch enable
pub const P4_ATTEN_LE: u8 = 1 << 3;
/// P4: attenuator clock
pub const P4_ATTEN_CLK: u8 = 1 << 4;
/// P4: attenuator data
pub const P4_ATTEN_DATA: u8 = 1 << 5;

/// Bits in one DDS serial word
pub const DDS_WORD_BITS: usize = 40;
/// Attenuator resolution in dB
pub const ATTEN_STEP_DB: f64 = 0.5;
/// Bits in an attenuator code
pub const ATTEN_BITS: u32 = 6;
/// Largest attenuation in dB
pub const ATTEN_MAX_DB: f64 = 31.5;

/// Tuning word for `frequency_hz` against `master_clock_hz`.
///
/// The DDS output must stay below Nyquist; anything at or above half the
/// master clock, or negative, is a configuration error.
pub fn dds_tuning_word(frequency_hz: f64, master_clock_hz: f64) -> HalResult<u32> {
    if master_clock_hz.is_nan() || master_clock_hz <= 0.0 {
        return Err(HalError::Config(format!(
            "master clock must be positive, got {} Hz",
            master_clock_hz
        )));
    }
    if !(0.0..master_clock_hz / 2.0).contains(&frequency_hz) {
        return Err(HalError::Config(format!(
            "{} Hz is outside the synthesizer range [0, {})",
            frequency_hz,
            master_clock_hz / 2.0
        )));
    }
    let word = (frequency_hz * 4_294_967_296.0 / master_clock_hz).round();
    Ok(word as u32)
}

/// Frequency produced by a tuning word.
pub fn dds_frequency(word: u32, master_clock_hz: f64) -> f64 {
    f64::from(word) * master_clock_hz / 4_294_967_296.0
}

/// Serialize a tuning word as 40 port-P1 bytes, one per bit.
pub fn dds_serial_bytes(word: u32) -> Vec<u8> {
    (0..DDS_WORD_BITS)
        .map(|i| {
            let bit = i < 32 && (word >> i) & 1 == 1;
            if bit {
                P1_DDS1_DATA
            } else {
                0
            }
        })
        .collect()
}

/// Attenuator code for `db`, clamped to 0..=31.5 dB.
pub fn attenuator_code(db: f64) -> u8 {
    let db = if db.is_nan() { 0.0 } else { db.clamp(0.0, ATTEN_MAX_DB) };
    (db / ATTEN_STEP_DB).round() as u8
}

/// The DDS on the signal path.
#[derive(Debug, Clone, PartialEq)]
pub struct Synthesizer {
    pub master_clock_hz: f64,
    pub frequency_offset_hz: f64,
}

impl From<&SynthConfig> for Synthesizer {
    fn from(cfg: &SynthConfig) -> Self {
        Self {
            master_clock_hz: cfg.master_clock_hz,
            frequency_offset_hz: cfg.frequency_offset_hz,
        }
    }
}

impl Default for Synthesizer {
    fn default() -> Self {
        Self::from(&SynthConfig::default())
    }
}

impl Synthesizer {
    /// Tuning word for a sweep point, offset applied
    pub fn tuning_word(&self, frequency_hz: f64) -> HalResult<u32> {
        dds_tuning_word(frequency_hz + self.frequency_offset_hz, self.master_clock_hz)
    }

    /// Queue the register frame and update pulse for `frequency_hz`.
    pub fn program<C: ByteChannel>(
        &self,
        link: &mut DeviceLink<C>,
        frequency_hz: f64,
    ) -> HalResult<u32> {
        let word = self.tuning_word(frequency_hz)?;
        link.send_registers(&dds_serial_bytes(word), P1_CLK)?;
        link.set_port(Port::P1, 0)?;
        link.set_port(Port::P2, P2_FQUD1)?;
        link.set_port(Port::P2, 0)?;
        debug!(frequency_hz, word, "DDS programmed");
        Ok(word)
    }
}

/// Shift an attenuation setting into the step attenuator.
pub fn program_attenuator<C: ByteChannel>(link: &mut DeviceLink<C>, db: f64) -> HalResult<u8> {
    let code = attenuator_code(db);
    for bit in (0..ATTEN_BITS).rev() {
        let data = if (code >> bit) & 1 == 1 {
            P4_ATTEN_DATA
        } else {
            0
        };
        link.set_port(Port::P4, data)?;
        link.set_port(Port::P4, data | P4_ATTEN_CLK)?;
    }
    link.set_port(Port::P4, P4_ATTEN_LE)?;
    link.set_port(Port::P4, 0)?;
    debug!(db, code, "Attenuator programmed");
    Ok(code)
}
