//! # Configuration
//!
//! YAML configuration for the analyzer: link timing, synthesizer constants,
//! default sweep, calibration standards and logging. Every section has
//! defaults, so a file only needs the values it changes.
//!
//! ## Search path
//!
//! The first file found wins:
//! 1. Path in the `MSA_CONFIG` environment variable
//! 2. `./msa.yaml`
//! 3. The per-user config directory (`~/.config/msa/config.yaml` on Linux)
//! 4. `/etc/msa/config.yaml`
//!
//! ## Example
//!
//! ```yaml
//! link:
//!   read_timeout_ms: 150
//! synth:
//!   master_clock_hz: 64.0e6
//! sweep:
//!   start_hz: 1.0e6
//!   stop_hz: 30.0e6
//!   points: 401
//!   spacing: log
//! calibration:
//!   reference_impedance: 50.0
//!   directory: /var/lib/msa/cal
//! detector:
//!   magnitude_table: /var/lib/msa/path1.mag
//!   frequency_table: /var/lib/msa/freq.cal
//! logging:
//!   level: debug
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::calibration::OslStandards;
use crate::error::{CoreError, CoreResult};
use crate::observe::LogConfig;
use crate::sweep::SweepConfig;

/// Environment variable naming a config file
pub const CONFIG_ENV: &str = "MSA_CONFIG";

/// Device link settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Buffered bytes that force a flush before the next write
    pub flush_watermark: usize,
    /// Bound on each channel read, in milliseconds; a status byte may
    /// take `read_retries` of these
    pub read_timeout_ms: u64,
    /// Consecutive sync mismatches before checking is switched off
    pub sync_error_limit: u32,
    /// Bits per ADC capture
    pub adc_bits: u32,
    /// Attempts for a single status byte outside a capture
    pub read_retries: u32,
    /// Firmware version the link requires, `major.minor`
    pub required_firmware: String,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            flush_watermark: 512,
            read_timeout_ms: 100,
            sync_error_limit: 20,
            adc_bits: 16,
            read_retries: 5,
            required_firmware: "0.1".to_string(),
        }
    }
}

/// Synthesizer and settling settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthConfig {
    /// DDS reference clock in Hz
    pub master_clock_hz: f64,
    /// Added to every programmed frequency
    pub frequency_offset_hz: f64,
    /// Device-side wait after programming each point
    pub settle_ms: u32,
    /// Extra wait before the first point of a sweep
    pub first_point_settle_ms: u32,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            master_clock_hz: 64e6,
            frequency_offset_hz: 0.0,
            settle_ms: 10,
            first_point_settle_ms: 200,
        }
    }
}

/// Calibration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Reference impedance R0 in ohms
    pub reference_impedance: f64,
    /// Clip transmission-derived |S11| to 1
    pub truncate_s11_to_unity: bool,
    /// Where calibration files live
    pub directory: Option<PathBuf>,
    /// Reflection coefficients of the standards
    pub standards: OslStandards,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            reference_impedance: 50.0,
            truncate_s11_to_unity: false,
            directory: None,
            standards: OslStandards::default(),
        }
    }
}

impl CalibrationConfig {
    /// Directory for calibration files, defaulting to the user data dir
    pub fn resolved_directory(&self) -> Option<PathBuf> {
        self.directory.clone().or_else(|| {
            directories::ProjectDirs::from("", "", "msa")
                .map(|d| d.data_dir().join("calibration"))
        })
    }
}

/// Path calibration of the magnitude detector.
///
/// Without tables the detector code is read with the fixed log mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// ADC code to dBm and phase offset table
    pub magnitude_table: Option<PathBuf>,
    /// Frequency to dB correction table
    pub frequency_table: Option<PathBuf>,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MsaConfig {
    pub link: LinkConfig,
    pub synth: SynthConfig,
    pub sweep: SweepConfig,
    pub calibration: CalibrationConfig,
    pub detector: DetectorConfig,
    pub logging: LogConfig,
}

impl MsaConfig {
    /// Load from the search path, or defaults when no file exists.
    pub fn load() -> CoreResult<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Self::load_from(&path);
            }
        }
        match Self::config_search_paths().into_iter().find(|p| p.exists()) {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load and validate a specific file.
    pub fn load_from(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("{}: {}", path.display(), e)))?;
        let config = Self::parse(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse YAML text.
    pub fn parse(yaml: &str) -> CoreResult<Self> {
        serde_yaml::from_str(yaml).map_err(|e| CoreError::Config(e.to_string()))
    }

    /// Write as YAML.
    pub fn save(&self, path: &Path) -> CoreResult<()> {
        let content =
            serde_yaml::to_string(self).map_err(|e| CoreError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Candidate files after the environment variable.
    pub fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("./msa.yaml")];
        if let Some(dirs) = directories::ProjectDirs::from("", "", "msa") {
            paths.push(dirs.config_dir().join("config.yaml"));
        }
        paths.push(PathBuf::from("/etc/msa/config.yaml"));
        paths
    }

    /// Reject values the link or synthesizer cannot work with.
    pub fn validate(&self) -> CoreResult<()> {
        let invalid = |msg: &str| Err(CoreError::Config(msg.to_string()));
        if self.link.read_timeout_ms == 0 {
            return invalid("link.read_timeout_ms must be positive");
        }
        if self.link.flush_watermark == 0 {
            return invalid("link.flush_watermark must be > 0");
        }
        if !(1..=32).contains(&self.link.adc_bits) {
            return invalid("link.adc_bits must be 1-32");
        }
        if self.link.read_retries == 0 {
            return invalid("link.read_retries must be > 0");
        }
        if self.synth.master_clock_hz.is_nan() || self.synth.master_clock_hz <= 0.0 {
            return invalid("synth.master_clock_hz must be positive");
        }
        let r0 = self.calibration.reference_impedance;
        if r0.is_nan() || r0 <= 0.0 {
            return invalid("calibration.reference_impedance must be positive");
        }
        if !(0.0..=31.5).contains(&self.sweep.attenuation_db) {
            return invalid("sweep.attenuation_db must be 0-31.5");
        }
        Ok(())
    }

    /// Example file with every section spelled out.
    pub fn example_yaml() -> String {
        let config = Self {
            calibration: CalibrationConfig {
                directory: Some(PathBuf::from("/var/lib/msa/calibration")),
                ..Default::default()
            },
            ..Default::default()
        };
        serde_yaml::to_string(&config).unwrap_or_default()
    }
}
