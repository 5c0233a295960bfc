//! Run configuration
//!
//! Read from a TOML file. Every field has a default, so an empty file (or no file at all) gives a
//! usable configuration for a simulated run.
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::acquisition::AcquisitionSettings;
use crate::error::{Error, Result};
use crate::fit::FitMethod;
use crate::uncertain::UncertainValue;

/// Soak and auto-zero delay used for a resistor missing from the delay table
const DEFAULT_DELAY_SECONDS: f64 = 1.0;

/// Delay table key for the run with the series resistor shorted
pub const SHORTED: &str = "short";

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the resistor table and all result files
    pub data_directory: PathBuf,
    /// Serial number suffix of the DVM under test
    pub meter_serial: String,
    /// Defaults to `RESISTORS.json` in the data directory
    pub resistor_table: Option<PathBuf>,
    pub instruments: InstrumentAddresses,
    pub bias_current: AcquisitionConfig,
    pub input_resistance: AcquisitionConfig,
    pub source_cal: SourceCalConfig,
    /// Soak delay in seconds per resistor, keyed by resistor name
    pub delays: BTreeMap<String, f64>,
    pub temperature: TypeB,
    /// Uncertainty of the elapsed time since characterisation, in days
    pub elapsed_time: TypeB,
    pub fit_method: FitMethod,
}

impl Default for Config {
    fn default() -> Self {
        let delays = [
            ("C 10G", 100.0),
            ("C 1G", 30.0),
            ("C9620 100M", 10.0),
            ("G003 100M", 10.0),
            ("C9736 10M", 5.0),
            ("Al969 1M", 2.0),
            ("G493 100k", 1.0),
            (SHORTED, 1.0),
        ]
        .into_iter()
        .map(|(name, seconds)| (name.to_owned(), seconds))
        .collect();

        Self {
            data_directory: PathBuf::from("."),
            meter_serial: "000".to_owned(),
            resistor_table: None,
            instruments: InstrumentAddresses::default(),
            bias_current: AcquisitionConfig {
                samples_per_step: 20,
                ..AcquisitionConfig::default()
            },
            input_resistance: AcquisitionConfig::default(),
            source_cal: SourceCalConfig::default(),
            delays,
            temperature: TypeB {
                uncertainty: 0.05,
                dof: 8.0,
            },
            elapsed_time: TypeB {
                uncertainty: 0.1,
                dof: 8.0,
            },
            fit_method: FitMethod::default(),
        }
    }
}

impl Config {
    /// # Errors
    /// The file cannot be read, is not valid TOML, or fails validation.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        tracing::info!(?path, "loaded configuration");
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for settings in [&self.bias_current, &self.input_resistance, &self.source_cal.acquisition] {
            if settings.samples_per_step < 2 {
                return Err(Error::Config(
                    "at least two samples per step are needed to estimate an uncertainty"
                        .to_owned(),
                ));
            }
            if settings.max_attempts_factor == 0 {
                return Err(Error::Config("max_attempts_factor must be positive".to_owned()));
            }
        }
        let invalid = |seconds: f64| !(seconds.is_finite() && seconds >= 0.0);
        if let Some(name) = self
            .delays
            .iter()
            .find_map(|(name, seconds)| invalid(*seconds).then_some(name))
        {
            return Err(Error::Config(format!("delay for `{name}` is not a valid duration")));
        }
        Ok(())
    }

    pub fn resistor_table_path(&self) -> PathBuf {
        self.resistor_table
            .clone()
            .unwrap_or_else(|| self.data_directory.join("RESISTORS.json"))
    }

    pub fn bias_current_results(&self) -> PathBuf {
        self.data_directory
            .join(format!("HP3458A-{}_Ib_Rin.json", self.meter_serial))
    }

    pub fn input_resistance_results(&self) -> PathBuf {
        self.data_directory
            .join(format!("HP3458A-{}_Rin.json", self.meter_serial))
    }

    pub fn source_cal_results(&self) -> PathBuf {
        self.data_directory.join(&self.source_cal.results_file)
    }

    /// Soak delay for resistor `name`
    pub fn delay_for(&self, name: &str) -> Duration {
        let seconds = self.delays.get(name).copied().unwrap_or_else(|| {
            tracing::debug!(resistor = name, "no delay configured, using the default");
            DEFAULT_DELAY_SECONDS
        });
        Duration::from_secs_f64(seconds)
    }
}

/// Type-B uncertainty attached to a quantity read once per test
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct TypeB {
    pub uncertainty: f64,
    pub dof: f64,
}

impl TypeB {
    pub fn attach(self, value: f64) -> UncertainValue {
        UncertainValue::new(value, self.uncertainty, self.dof)
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct InstrumentAddresses {
    /// VISA resource strings, for example `GPIB0::25::INSTR`
    pub meter: String,
    pub voltage_source: String,
    pub current_source: String,
    /// Open timeout of each VISA session
    pub timeout_ms: u64,
    /// Channel of the temperature probe reading the resistor
    pub probe_channel: String,
}

impl Default for InstrumentAddresses {
    fn default() -> Self {
        Self {
            meter: "GPIB0::25::INSTR".to_owned(),
            voltage_source: "GPIB0::4::INSTR".to_owned(),
            current_source: "GPIB0::20::INSTR".to_owned(),
            timeout_ms: 2000,
            probe_channel: "T".to_owned(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub samples_per_step: usize,
    /// Fixed auto-zero delay in seconds; when absent the resistor's soak delay is used
    pub auto_zero_delay: Option<f64>,
    pub line_sync_delay: f64,
    pub range_settle: f64,
    pub outlier_multiplier: f64,
    pub max_attempts_factor: usize,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            samples_per_step: 10,
            auto_zero_delay: None,
            line_sync_delay: 1.0,
            range_settle: 0.1,
            outlier_multiplier: 10.0,
            max_attempts_factor: 10,
        }
    }
}

impl AcquisitionConfig {
    /// Acquisition settings for a resistor whose soak delay is `soak_delay`
    pub fn settings(&self, soak_delay: Duration) -> AcquisitionSettings {
        AcquisitionSettings {
            samples_per_step: self.samples_per_step,
            soak_delay,
            auto_zero_delay: self
                .auto_zero_delay
                .map_or(soak_delay, Duration::from_secs_f64),
            line_sync_delay: Duration::from_secs_f64(self.line_sync_delay),
            range_settle: Duration::from_secs_f64(self.range_settle),
            outlier_multiplier: self.outlier_multiplier,
            max_attempts_factor: self.max_attempts_factor,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SourceCalConfig {
    pub results_file: PathBuf,
    pub acquisition: AcquisitionConfig,
    /// Gain correction of the meter range used to read the sense resistor
    pub gain: UncertainValue,
    /// Input resistance of the meter, loading the sense resistor
    pub meter_input_resistance: UncertainValue,
}

impl Default for SourceCalConfig {
    fn default() -> Self {
        Self {
            results_file: PathBuf::from("Keithley6430_source-cal.json"),
            acquisition: AcquisitionConfig::default(),
            gain: UncertainValue::exact(1.0),
            meter_input_resistance: UncertainValue::new(1e12, 1.6e11, 10.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{Config, SHORTED};
    use crate::fit::FitMethod;

    #[test]
    fn an_empty_file_gives_the_defaults() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.bias_current.samples_per_step, 20);
        assert_eq!(config.input_resistance.samples_per_step, 10);
        assert_eq!(config.fit_method, FitMethod::WeightedLeastSquares);
        assert_eq!(config.delay_for("C 10G"), Duration::from_secs(100));
        assert_eq!(config.delay_for(SHORTED), Duration::from_secs(1));
        assert!(config
            .bias_current_results()
            .ends_with("HP3458A-000_Ib_Rin.json"));
    }

    #[test]
    fn unknown_resistors_fall_back_to_one_second() {
        let config = Config::default();
        assert_eq!(config.delay_for("nonesuch"), Duration::from_secs(1));
    }

    #[test]
    fn partial_files_override_only_what_they_name() {
        let text = r#"
            meter_serial = "452"
            fit_method = "weighted_total_least_squares"

            [input_resistance]
            samples_per_step = 5
            auto_zero_delay = 2.5

            [source_cal.meter_input_resistance]
            is_uncertain_value = true
            value = 2e12
            standard_uncertainty = 1e11
            degrees_of_freedom = 12

            [delays]
            "G493 100k" = 3

            [instruments]
            voltage_source = "GPIB0::6::INSTR"
        "#;
        let config: Config = toml::from_str(text).unwrap();

        assert_eq!(config.meter_serial, "452");
        assert_eq!(config.instruments.voltage_source, "GPIB0::6::INSTR");
        assert_eq!(config.instruments.meter, "GPIB0::25::INSTR");
        assert_eq!(config.fit_method, FitMethod::WeightedTotalLeastSquares);
        assert!(config.input_resistance_results().ends_with("HP3458A-452_Rin.json"));

        let settings = config
            .input_resistance
            .settings(config.delay_for("G493 100k"));
        assert_eq!(settings.samples_per_step, 5);
        assert_eq!(settings.soak_delay, Duration::from_secs(3));
        assert_eq!(settings.auto_zero_delay, Duration::from_secs_f64(2.5));
        approx::assert_relative_eq!(config.source_cal.meter_input_resistance.value(), 2e12);
        approx::assert_relative_eq!(config.source_cal.gain.value(), 1.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn too_few_samples_are_rejected() {
        let config: Config = toml::from_str("[bias_current]\nsamples_per_step = 1").unwrap();
        assert!(config.validate().is_err());
    }
}
