//! Export of raw readings
use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::acquisition::PolarityReadings;
use crate::error::Result;
use crate::polarity::Polarity;

#[derive(Serialize)]
struct Row<'a> {
    run: &'a str,
    step: usize,
    polarity: Polarity,
    setpoint: f64,
    reading: f64,
}

/// Write every accepted reading of the labelled acquisitions to a CSV file at `path`
///
/// # Errors
/// The file or its parent directory cannot be created or written.
pub fn write_readings_csv(path: &Path, acquisitions: &[(&str, &PolarityReadings)]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut writer = csv::Writer::from_path(path)?;
    for (run, readings) in acquisitions {
        for sample in readings.samples() {
            writer.serialize(Row {
                run,
                step: sample.step,
                polarity: sample.polarity,
                setpoint: sample.setpoint,
                reading: sample.reading,
            })?;
        }
    }
    writer.flush()?;

    tracing::info!(?path, "raw readings written");
    Ok(())
}
