//! Persisted test results
//!
//! Each procedure keeps a JSON file mapping a test key to its [`ReducedMeasurement`]. The bias
//! current file also carries the reserved keys `Ib` and `Rin`, holding the latest global fit. The
//! file is read once at start-up and rewritten after every completed test; a key may be
//! overwritten by a later test but is never removed.
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::calculators::any_dud;
use crate::error::{Error, Result};
use crate::fit::FitResult;
use crate::uncertain::UncertainValue;

/// Names of the quantities recorded in a [`ReducedMeasurement`]
pub mod quantity {
    pub const TEMPERATURE: &str = "T";
    pub const VOLTAGE: &str = "V";
    pub const SOURCE_VOLTAGE: &str = "Vs";
    pub const BIAS_CURRENT_APPROX: &str = "Ib_approx";
    pub const INPUT_RESISTANCE: &str = "Rin";
    pub const INPUT_RESISTANCE_APPROX: &str = "Rin_approx";
    pub const CURRENT: &str = "I";
    pub const CORRECTION: &str = "correction";
}

const RESERVED_KEYS: [&str; 2] = ["Ib", "Rin"];

/// Key of a bias-current test on resistor `name`
pub fn bias_key(name: &str) -> String {
    name.to_owned()
}

/// A level as spelled in keys: shortest round-trip digits, and in exponent form a signed exponent
/// of at least two digits (`10.0`, `0.001`, `1e-05`, `2.5e+16`)
fn level_key(x: f64) -> String {
    let shortest = format!("{x:?}");
    match shortest.split_once('e') {
        Some((mantissa, exponent)) => {
            let (sign, digits) = exponent
                .strip_prefix('-')
                .map_or(("+", exponent), |digits| ("-", digits));
            format!("{mantissa}e{sign}{digits:0>2}")
        }
        None => shortest,
    }
}

/// Key of an input-resistance test on resistor `name` at source voltage `volts`
pub fn voltage_key(name: &str, volts: f64) -> String {
    format!("{name}_V{}", level_key(volts))
}

/// Key of a source-current calibration with sense resistor `name` at current `amps`
pub fn current_key(name: &str, amps: f64) -> String {
    format!("{name}_I{}", level_key(amps))
}

/// The outcome of one test
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReducedMeasurement {
    #[serde(with = "timestamp")]
    pub t: NaiveDateTime,
    /// Effective resistance of the resistor under test
    #[serde(rename = "R")]
    pub resistance: UncertainValue,
    pub quantities: BTreeMap<String, UncertainValue>,
    /// Raw accepted readings, keyed by list name
    #[serde(default)]
    pub readings: BTreeMap<String, Vec<f64>>,
}

impl ReducedMeasurement {
    pub fn new(t: NaiveDateTime, resistance: UncertainValue) -> Self {
        Self {
            t,
            resistance,
            quantities: BTreeMap::new(),
            readings: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_quantity(mut self, name: &str, value: UncertainValue) -> Self {
        self.quantities.insert(name.to_owned(), value);
        self
    }

    #[must_use]
    pub fn with_readings(mut self, name: &str, readings: Vec<f64>) -> Self {
        self.readings.insert(name.to_owned(), readings);
        self
    }

    pub fn quantity(&self, name: &str) -> Option<&UncertainValue> {
        self.quantities.get(name)
    }

    /// Whether the resistance or any recorded quantity is unusable
    pub fn is_dud(&self) -> bool {
        any_dud(std::iter::once(&self.resistance).chain(self.quantities.values()))
    }
}

/// All results of one procedure, bound to the file they persist to
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ResultStore {
    #[serde(skip)]
    path: PathBuf,
    #[serde(rename = "Ib", default, skip_serializing_if = "Option::is_none")]
    bias_current: Option<UncertainValue>,
    #[serde(rename = "Rin", default, skip_serializing_if = "Option::is_none")]
    input_resistance: Option<UncertainValue>,
    #[serde(flatten)]
    measurements: BTreeMap<String, ReducedMeasurement>,
}

impl ResultStore {
    /// Load the results at `path`, or start an empty store if there is no file yet
    ///
    /// # Errors
    /// A file that exists but cannot be read or parsed is an error; it is never silently
    /// replaced.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            tracing::info!(?path, "no stored results yet, starting afresh");
            return Ok(Self {
                path,
                ..Self::default()
            });
        }

        let text = fs::read_to_string(&path)?;
        let mut store: Self = serde_json::from_str(&text)?;
        tracing::info!(?path, tests = store.measurements.len(), "loaded stored results");
        store.path = path;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the store back to its file
    ///
    /// The file is replaced in one step, so an interrupted write leaves the previous contents.
    ///
    /// # Errors
    /// Any failure to create, write or rename the file.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut staging = self.path.clone().into_os_string();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);

        fs::write(&staging, serde_json::to_string_pretty(self)?)?;
        fs::rename(&staging, &self.path)?;
        tracing::info!(path = ?self.path, tests = self.measurements.len(), "results saved");
        Ok(())
    }

    /// Record a test, returning whatever was previously stored under `key`
    ///
    /// # Errors
    /// The keys holding the global fit cannot be used for a test.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        measurement: ReducedMeasurement,
    ) -> Result<Option<ReducedMeasurement>> {
        let key = key.into();
        if RESERVED_KEYS.contains(&key.as_str()) {
            return Err(Error::Config(format!("`{key}` is reserved for the fitted values")));
        }
        Ok(self.measurements.insert(key, measurement))
    }

    pub fn get(&self, key: &str) -> Option<&ReducedMeasurement> {
        self.measurements.get(key)
    }

    pub fn measurements(&self) -> impl Iterator<Item = (&str, &ReducedMeasurement)> {
        self.measurements.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }

    pub const fn bias_current(&self) -> Option<&UncertainValue> {
        self.bias_current.as_ref()
    }

    pub const fn input_resistance(&self) -> Option<&UncertainValue> {
        self.input_resistance.as_ref()
    }

    pub fn set_fit(&mut self, fit: &FitResult) {
        self.bias_current = Some(fit.bias_current.clone());
        self.input_resistance = Some(fit.input_resistance.clone());
    }

    /// `(resistance, open-circuit voltage)` of every test that recorded a voltage
    pub fn fit_points(&self) -> Vec<(UncertainValue, UncertainValue)> {
        self.measurements
            .values()
            .filter_map(|m| {
                m.quantity(quantity::VOLTAGE)
                    .map(|v| (m.resistance.clone(), v.clone()))
            })
            .collect()
    }
}

/// Results of the bias-current stage, as needed by the input-resistance stage
#[derive(Debug)]
pub struct BiasHandoff {
    path: PathBuf,
    store: ResultStore,
    bias_current: UncertainValue,
}

impl BiasHandoff {
    /// # Errors
    /// [`Error::Handoff`] if the file is missing, malformed, or holds no fitted bias current.
    pub fn load(path: &Path) -> Result<Self> {
        let handoff_error = |message: String| Error::Handoff {
            path: path.to_owned(),
            message,
        };

        if !path.exists() {
            return Err(handoff_error(
                "file not found; run the bias-current stage first".to_owned(),
            ));
        }
        let store = ResultStore::open(path).map_err(|e| handoff_error(e.to_string()))?;
        let bias_current = store.bias_current().cloned().ok_or_else(|| {
            handoff_error("no fitted `Ib`; more bias-current tests are needed".to_owned())
        })?;

        Ok(Self {
            path: path.to_owned(),
            store,
            bias_current,
        })
    }

    /// Bias current fitted across all resistors
    pub const fn ib(&self) -> &UncertainValue {
        &self.bias_current
    }

    /// Bias current measured with resistor `name` alone
    ///
    /// # Errors
    /// [`Error::Handoff`] if that resistor was never measured.
    pub fn ib_approx(&self, name: &str) -> Result<&UncertainValue> {
        self.store
            .get(&bias_key(name))
            .and_then(|m| m.quantity(quantity::BIAS_CURRENT_APPROX))
            .ok_or_else(|| Error::Handoff {
                path: self.path.clone(),
                message: format!("no `{}` for resistor `{name}`", quantity::BIAS_CURRENT_APPROX),
            })
    }
}

mod timestamp {
    use chrono::NaiveDateTime;
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    use crate::resistor::TIMESTAMP_FORMAT;

    pub fn serialize<S: Serializer>(t: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&t.format(TIMESTAMP_FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<NaiveDateTime, D::Error> {
        let text = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&text, TIMESTAMP_FORMAT).map_err(D::Error::custom)
    }
}
