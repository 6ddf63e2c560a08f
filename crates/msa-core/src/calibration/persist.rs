//! Calibration file format.
//!
//! A calibration is stored as one JSON document:
//!
//! ```json
//! {
//!   "version": "1.03",
//!   "created": 1700000000,
//!   "reference_impedance": 50.0,
//!   "spacing": "linear",
//!   "records": [
//!     { "frequency_hz": 1000000.0, "a": [1.0, 0.0], "b": [0.0, 0.0], "c": [0.0, 0.0] }
//!   ]
//! }
//! ```
//!
//! The version tag is read on its own before the rest of the document, so a
//! file from an incompatible release is rejected without being interpreted.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::osl::ErrorTerms;
use super::table::CalibrationTable;
use super::CALIBRATION_VERSION;
use crate::error::{CoreError, CoreResult};
use crate::sweep::Spacing;
use crate::types::Complex;

#[derive(Debug, Serialize, Deserialize)]
struct CalibrationRecord {
    frequency_hz: f64,
    a: Complex,
    b: Complex,
    c: Complex,
}

#[derive(Debug, Serialize, Deserialize)]
struct CalibrationFile {
    version: String,
    #[serde(default)]
    created: u64,
    reference_impedance: f64,
    #[serde(default)]
    spacing: Spacing,
    records: Vec<CalibrationRecord>,
}

#[derive(Debug, Deserialize)]
struct VersionTag {
    version: Option<String>,
}

/// Serialize `table` as a calibration document.
pub fn write_calibration<W: Write>(table: &CalibrationTable, writer: W) -> CoreResult<()> {
    let doc = CalibrationFile {
        version: table.version.clone(),
        created: table.created,
        reference_impedance: table.reference_impedance,
        spacing: table.spacing,
        records: table
            .frequencies()
            .iter()
            .zip(table.terms())
            .map(|(&frequency_hz, t)| CalibrationRecord {
                frequency_hz,
                a: t.a,
                b: t.b,
                c: t.c,
            })
            .collect(),
    };
    serde_json::to_writer_pretty(writer, &doc)
        .map_err(|e| CoreError::CalibrationParse(format!("Failed to write calibration: {}", e)))
}

/// Parse a calibration document, rejecting any version other than the
/// current one.
pub fn read_calibration<R: Read>(mut reader: R) -> CoreResult<CalibrationTable> {
    let mut text = String::new();
    reader.read_to_string(&mut text)?;

    let tag: VersionTag = serde_json::from_str(&text)
        .map_err(|e| CoreError::CalibrationParse(format!("Not a calibration file: {}", e)))?;
    let found = tag
        .version
        .ok_or_else(|| CoreError::CalibrationParse("missing version tag".into()))?;
    if found != CALIBRATION_VERSION {
        return Err(CoreError::CalibrationVersionMismatch {
            found,
            expected: CALIBRATION_VERSION.to_string(),
        });
    }

    let doc: CalibrationFile = serde_json::from_str(&text)
        .map_err(|e| CoreError::CalibrationParse(format!("Malformed calibration: {}", e)))?;
    if doc.reference_impedance.is_nan() || doc.reference_impedance <= 0.0 {
        return Err(CoreError::CalibrationParse(format!(
            "reference impedance must be positive, got {}",
            doc.reference_impedance
        )));
    }
    let records = doc
        .records
        .into_iter()
        .map(|r| (r.frequency_hz, ErrorTerms { a: r.a, b: r.b, c: r.c }))
        .collect();
    CalibrationTable::from_records(
        doc.version,
        doc.created,
        doc.reference_impedance,
        doc.spacing,
        records,
    )
}

/// Save `table` to `path`.
///
/// Written to a sibling `.tmp` file first and renamed into place.
pub fn save_calibration(table: &CalibrationTable, path: &Path) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("tmp");
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        write_calibration(table, &mut writer)?;
        writer.flush()?;
    }
    std::fs::rename(&tmp, path)?;
    info!(path = %path.display(), points = table.len(), "Saved calibration");
    Ok(())
}

/// Load a calibration from `path`.
pub fn load_calibration(path: &Path) -> CoreResult<CalibrationTable> {
    let file = File::open(path)?;
    let table = read_calibration(BufReader::new(file)).map_err(|e| {
        warn!(path = %path.display(), error = %e, "Calibration load rejected");
        e
    })?;
    info!(path = %path.display(), points = table.len(), "Loaded calibration");
    Ok(table)
}
