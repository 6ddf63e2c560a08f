//! # MSA HAL
//!
//! Hardware side of the MSA vector front end: the byte channel to the
//! control board, the framed command link on top of it, synthesizer and
//! attenuator programming, the per-point sweep loop and the acquisition
//! session that runs it on a worker thread.
//!
//! ```text
//! Session ──► SweepController ──► Synthesizer / attenuator
//!    │               │
//!    │               ▼
//!    │          DeviceLink (frames, buffering, sync check)
//!    │               │
//!    │               ▼
//!    │          ByteChannel (USB bulk endpoints or SimulatedFrontEnd)
//!    ▼
//! TraceStore / CalibrationEngine (msa-core)
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use msa_core::{Complex, MsaConfig, SweepConfig};
//! use msa_hal::{Session, SimulatedFrontEnd};
//!
//! let sim = SimulatedFrontEnd::new(|_| Complex::new(0.2, -0.1));
//! let session = Session::open(sim, MsaConfig::default())?;
//! session.start_sweep(SweepConfig::linear(10e6, 20e6, 11))?;
//! session.wait_idle(Duration::from_secs(5));
//! assert_eq!(session.trace().len(), 11);
//! # Ok::<(), msa_hal::HalError>(())
//! ```

pub mod channel;
pub mod error;
pub mod frame;
pub mod link;
pub mod session;
pub mod sim;
pub mod sweep;
pub mod synth;

pub use channel::{ByteChannel, MAX_FRAME_SIZE};
pub use error::{HalError, HalResult};
pub use frame::Command;
pub use link::{AdcReading, DeviceLink, LinkSettings, Port, SyncStats};
pub use session::{Session, SweepStatus};
pub use sim::{ErrorBox, SimHandle, SimulatedFrontEnd};
pub use sweep::{SweepControl, SweepController, SweepOutcome};
pub use synth::Synthesizer;
