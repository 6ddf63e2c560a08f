//! Framed command codec.
//!
//! Every command is a single-letter opcode followed by a fixed payload:
//!
//! | Opcode | Payload                               | Meaning                          |
//! |--------|---------------------------------------|----------------------------------|
//! | `D`    | data byte                             | drive the data port              |
//! | `C`    | control byte                          | drive the control (strobe) lines |
//! | `S`    | `0`                                   | queue one status byte            |
//! | `P`    | clock mask, length, `length` bytes    | clock bytes out port P1          |
//! | `W`    | milliseconds (1..=255)                | device-side wait                 |
//! | `F`    | `0`                                   | push queued read bytes to host   |
//! | `A`    | bit count                             | serialize one ADC capture        |
//! | `V`    | `0`                                   | queue the firmware version       |

use crate::error::{HalError, HalResult};

pub const OP_DATA: u8 = b'D';
pub const OP_CONTROL: u8 = b'C';
pub const OP_STATUS: u8 = b'S';
pub const OP_PROGRAM: u8 = b'P';
pub const OP_WAIT: u8 = b'W';
pub const OP_FLUSH_READ: u8 = b'F';
pub const OP_ADC_READ: u8 = b'A';
pub const OP_VERSION: u8 = b'V';

/// Longest register payload one `P` frame can carry
pub const MAX_PROGRAM_PAYLOAD: usize = u8::MAX as usize;

/// One command to the control board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Data(u8),
    Control(u8),
    Status,
    Program { clock_mask: u8, payload: Vec<u8> },
    Wait(u8),
    FlushRead,
    AdcRead(u8),
    Version,
}

impl Command {
    /// Register-programming frame; the payload must fit one length byte.
    pub fn program(clock_mask: u8, payload: &[u8]) -> HalResult<Self> {
        if payload.len() > MAX_PROGRAM_PAYLOAD {
            return Err(HalError::Config(format!(
                "register payload of {} bytes exceeds {}",
                payload.len(),
                MAX_PROGRAM_PAYLOAD
            )));
        }
        Ok(Command::Program {
            clock_mask,
            payload: payload.to_vec(),
        })
    }

    /// Encoded size in bytes
    pub fn encoded_len(&self) -> usize {
        match self {
            Command::Program { payload, .. } => 3 + payload.len(),
            _ => 2,
        }
    }

    /// Append the wire form to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Command::Data(b) => out.extend_from_slice(&[OP_DATA, *b]),
            Command::Control(b) => out.extend_from_slice(&[OP_CONTROL, *b]),
            Command::Status => out.extend_from_slice(&[OP_STATUS, 0]),
            Command::Program {
                clock_mask,
                payload,
            } => {
                out.extend_from_slice(&[OP_PROGRAM, *clock_mask, payload.len() as u8]);
                out.extend_from_slice(payload);
            }
            Command::Wait(ms) => out.extend_from_slice(&[OP_WAIT, *ms]),
            Command::FlushRead => out.extend_from_slice(&[OP_FLUSH_READ, 0]),
            Command::AdcRead(bits) => out.extend_from_slice(&[OP_ADC_READ, *bits]),
            Command::Version => out.extend_from_slice(&[OP_VERSION, 0]),
        }
    }

    /// Wire form as a new buffer
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out);
        out
    }

    /// Decode the first frame of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` holds only part of a frame, and the
    /// command with its encoded length otherwise.
    pub fn decode(buf: &[u8]) -> HalResult<Option<(Command, usize)>> {
        let Some(&op) = buf.first() else {
            return Ok(None);
        };
        if op == OP_PROGRAM {
            if buf.len() < 3 {
                return Ok(None);
            }
            let len = buf[2] as usize;
            if buf.len() < 3 + len {
                return Ok(None);
            }
            let cmd = Command::Program {
                clock_mask: buf[1],
                payload: buf[3..3 + len].to_vec(),
            };
            return Ok(Some((cmd, 3 + len)));
        }
        if buf.len() < 2 {
            return Ok(None);
        }
        let arg = buf[1];
        let cmd = match op {
            OP_DATA => Command::Data(arg),
            OP_CONTROL => Command::Control(arg),
            OP_STATUS => Command::Status,
            OP_WAIT => Command::Wait(arg),
            OP_FLUSH_READ => Command::FlushRead,
            OP_ADC_READ => Command::AdcRead(arg),
            OP_VERSION => Command::Version,
            other => {
                return Err(HalError::ConnectionLost(format!(
                    "malformed frame: unknown opcode 0x{:02x}",
                    other
                )))
            }
        };
        Ok(Some((cmd, 2)))
    }
}
