//! # Observability
//!
//! Structured logging for the acquisition and calibration layers. Library
//! code only emits `tracing` events; an application installs a subscriber
//! once at startup with [`init_logging`].
//!
//! Event conventions:
//!
//! - `debug!` per frame and per sweep point
//! - `info!` on sweep, calibration and session state changes
//! - `warn!` on sync errors, read timeouts and numeric fallbacks
//! - `error!` on transport failures

pub mod logging;

pub use logging::{init_logging, LogConfig, LogFormat, LogLevel};
