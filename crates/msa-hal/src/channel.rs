//! Byte Channel: raw duplex link to the control board.
//!
//! Device discovery and the USB bulk endpoints live outside this crate; a
//! transport only has to move bytes in both directions with a bounded read.

use std::time::Duration;

use crate::error::HalResult;

/// Largest transfer in either direction
pub const MAX_FRAME_SIZE: usize = 512;

/// Duplex byte transport with bounded frame size.
pub trait ByteChannel: Send {
    /// Send `data` as one transfer.
    ///
    /// Fails with [`crate::HalError::ConnectionLost`] when the device is gone.
    fn write(&mut self, data: &[u8]) -> HalResult<()>;

    /// Receive up to `max` bytes, waiting at most `timeout`.
    ///
    /// Returns an empty vector on timeout.
    fn read(&mut self, max: usize, timeout: Duration) -> HalResult<Vec<u8>>;

    /// Largest transfer this channel accepts
    fn max_frame_size(&self) -> usize {
        MAX_FRAME_SIZE
    }
}

impl<C: ByteChannel + ?Sized> ByteChannel for Box<C> {
    fn write(&mut self, data: &[u8]) -> HalResult<()> {
        (**self).write(data)
    }

    fn read(&mut self, max: usize, timeout: Duration) -> HalResult<Vec<u8>> {
        (**self).read(max, timeout)
    }

    fn max_frame_size(&self) -> usize {
        (**self).max_frame_size()
    }
}
