//! Reference resistors and their correction model
//!
//! A resistor is characterised once against a standard, giving its resistance `R0` at reference
//! temperature `T0`, reference voltage `V0` and reference time `t0`, together with temperature
//! (`alpha`), voltage (`gamma`) and drift (`tau`, per day) coefficients. The resistance at the
//! time of a measurement is
//!
//! $$
//!     R = R_0 \left[1 + \alpha (T - T_0) + \gamma (V - V_0) + \tau \Delta t\right].
//! $$
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::uncertain::UncertainValue;

/// Timestamp layout used by the resistor table and the result files
pub const TIMESTAMP_FORMAT: &str = "%d/%m/%Y %H:%M:%S";

#[derive(Clone, Debug)]
pub struct ResistorProfile {
    pub nominal_resistance: UncertainValue,
    pub alpha: UncertainValue,
    pub reference_temperature: UncertainValue,
    pub gamma: UncertainValue,
    pub reference_voltage: UncertainValue,
    /// Fractional drift per day
    pub tau: UncertainValue,
    pub reference_time: NaiveDateTime,
}

impl ResistorProfile {
    /// Resistance at temperature `temperature`, applied voltage `voltage` and `elapsed_days` after
    /// characterisation
    pub fn effective_resistance(
        &self,
        temperature: &UncertainValue,
        voltage: &UncertainValue,
        elapsed_days: &UncertainValue,
    ) -> UncertainValue {
        let temperature_term = &self.alpha * (temperature - &self.reference_temperature);
        let voltage_term = &self.gamma * (voltage - &self.reference_voltage);
        let drift_term = &self.tau * elapsed_days;

        &self.nominal_resistance * (1.0 + temperature_term + voltage_term + drift_term)
    }

    /// Days between characterisation and `now`
    ///
    /// Timestamps are only known to the nearest reading burst, so the elapsed time carries a fixed
    /// type-B uncertainty.
    #[allow(clippy::cast_precision_loss)]
    pub fn elapsed_days(
        &self,
        now: NaiveDateTime,
        uncertainty_days: f64,
        dof: f64,
    ) -> UncertainValue {
        let elapsed = now - self.reference_time;
        let days = elapsed.num_milliseconds() as f64 / 86_400_000.0;
        UncertainValue::new(days, uncertainty_days, dof)
    }
}

/// On-disk form of a resistor record
#[derive(Deserialize, Serialize)]
struct ResistorRecord {
    #[serde(rename = "R0")]
    r0: UncertainValue,
    alpha: UncertainValue,
    #[serde(rename = "T0")]
    t0_temperature: UncertainValue,
    gamma: UncertainValue,
    #[serde(rename = "V0")]
    v0: UncertainValue,
    tau: UncertainValue,
    t0: String,
}

impl TryFrom<ResistorRecord> for ResistorProfile {
    type Error = String;

    fn try_from(record: ResistorRecord) -> std::result::Result<Self, Self::Error> {
        let reference_time = NaiveDateTime::parse_from_str(&record.t0, TIMESTAMP_FORMAT)
            .map_err(|e| format!("bad t0 `{}`: {e}", record.t0))?;

        let nominal = record.r0.value();
        if !(nominal.is_finite() && nominal > 0.0) {
            return Err(format!("R0 must be positive, found {nominal}"));
        }

        for (name, quantity) in [
            ("R0", &record.r0),
            ("alpha", &record.alpha),
            ("T0", &record.t0_temperature),
            ("gamma", &record.gamma),
            ("V0", &record.v0),
            ("tau", &record.tau),
        ] {
            if quantity.is_dud() {
                return Err(format!("{name} is not a usable uncertain value"));
            }
        }

        Ok(Self {
            nominal_resistance: record.r0,
            alpha: record.alpha,
            reference_temperature: record.t0_temperature,
            gamma: record.gamma,
            reference_voltage: record.v0,
            tau: record.tau,
            reference_time,
        })
    }
}

/// All reference resistors available for a run, keyed by their short label
#[derive(Clone, Debug, Default)]
pub struct ResistorTable(BTreeMap<String, ResistorProfile>);

impl ResistorTable {
    /// Read and validate a resistor table
    ///
    /// # Errors
    /// Every entry is validated here, so a malformed or incomplete record fails the load rather
    /// than a measurement part way through.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| Error::ResistorTable {
            path: path.to_owned(),
            message: e.to_string(),
        })?;
        Self::from_json(&text).map_err(|message| Error::ResistorTable {
            path: path.to_owned(),
            message,
        })
    }

    fn from_json(text: &str) -> std::result::Result<Self, String> {
        let raw: BTreeMap<String, serde_json::Value> =
            serde_json::from_str(text).map_err(|e| e.to_string())?;

        let mut profiles = BTreeMap::new();
        for (name, value) in raw {
            let record: ResistorRecord =
                serde_json::from_value(value).map_err(|e| format!("resistor `{name}`: {e}"))?;
            let profile = ResistorProfile::try_from(record)
                .map_err(|message| format!("resistor `{name}`: {message}"))?;
            profiles.insert(name, profile);
        }

        tracing::info!(resistors = profiles.len(), "loaded resistor table");
        Ok(Self(profiles))
    }

    pub fn insert(&mut self, name: impl Into<String>, profile: ResistorProfile) {
        self.0.insert(name.into(), profile);
    }

    /// # Errors
    /// [`Error::UnknownResistor`] if there is no resistor called `name`.
    pub fn get(&self, name: &str) -> Result<&ResistorProfile> {
        self.0
            .get(name)
            .ok_or_else(|| Error::UnknownResistor(name.to_owned()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDateTime;
    use proptest::prelude::*;

    use super::{ResistorProfile, ResistorTable, TIMESTAMP_FORMAT};
    use crate::uncertain::UncertainValue;

    fn g493() -> ResistorProfile {
        ResistorProfile {
            nominal_resistance: UncertainValue::new(100_000.255, 0.145, 125.0),
            alpha: UncertainValue::new(-9.6e-7, 6.1e-7, 74.0),
            reference_temperature: UncertainValue::new(20.476, 0.035, 75.0),
            gamma: UncertainValue::new(1.53e-8, 6.9e-9, 73.0),
            reference_voltage: UncertainValue::new(20.26, 2.97, 75.0),
            tau: UncertainValue::new(4.18e-9, 2.8e-10, 74.0),
            reference_time: NaiveDateTime::parse_from_str("25/05/2019 16:26:30", TIMESTAMP_FORMAT)
                .unwrap(),
        }
    }

    const G493_JSON: &str = r#"{
        "G493": {
            "R0": {"is_uncertain_value": true, "value": 100000.255, "standard_uncertainty": 0.145, "degrees_of_freedom": 125},
            "alpha": {"is_uncertain_value": true, "value": -9.6e-7, "standard_uncertainty": 6.1e-7, "degrees_of_freedom": 74},
            "T0": {"is_uncertain_value": true, "value": 20.476, "standard_uncertainty": 0.035, "degrees_of_freedom": 75},
            "gamma": {"is_uncertain_value": true, "value": 1.53e-8, "standard_uncertainty": 6.9e-9, "degrees_of_freedom": 73},
            "V0": {"is_uncertain_value": true, "value": 20.26, "standard_uncertainty": 2.97, "degrees_of_freedom": 75},
            "tau": {"is_uncertain_value": true, "value": 4.18e-9, "standard_uncertainty": 2.8e-10, "degrees_of_freedom": 74},
            "t0": "25/05/2019 16:26:30"
        }
    }"#;

    #[test]
    fn well_formed_tables_load() {
        let table = ResistorTable::from_json(G493_JSON).unwrap();
        let profile = table.get("G493").unwrap();

        approx::assert_relative_eq!(profile.nominal_resistance.value(), 100_000.255);
        approx::assert_relative_eq!(profile.tau.uncertainty(), 2.8e-10);
        assert_eq!(table.names().collect::<Vec<_>>(), vec!["G493"]);
        assert!(table.get("C10G").is_err());
    }

    #[test]
    fn empty_placeholder_records_are_rejected_at_load() {
        let text = r#"{"G003": {}}"#;
        let err = ResistorTable::from_json(text).unwrap_err();
        assert!(err.contains("G003"), "{err}");
    }

    #[test]
    fn bad_reference_times_are_rejected_at_load() {
        let text = G493_JSON.replace("25/05/2019 16:26:30", "2019-05-25");
        assert!(ResistorTable::from_json(&text).is_err());
    }

    #[test]
    fn correction_vanishes_at_reference_conditions() {
        let profile = g493();

        let resistance = profile.effective_resistance(
            &UncertainValue::exact(profile.reference_temperature.value()),
            &UncertainValue::exact(profile.reference_voltage.value()),
            &UncertainValue::exact(0.0),
        );

        assert_eq!(resistance.value(), profile.nominal_resistance.value());
    }

    #[test]
    fn elapsed_days_are_fractional() {
        let profile = g493();
        let now =
            NaiveDateTime::parse_from_str("26/05/2019 04:26:30", TIMESTAMP_FORMAT).unwrap();

        let elapsed = profile.elapsed_days(now, 0.1, 8.0);

        approx::assert_relative_eq!(elapsed.value(), 0.5);
        approx::assert_relative_eq!(elapsed.uncertainty(), 0.1);
    }

    proptest! {
        #[test]
        fn reference_conditions_return_r0_exactly(
            r0 in 1.0..1e13f64,
            t0 in 15.0..25.0f64,
            v0 in 0.0..1000.0f64,
            alpha in -1e-5..1e-5f64,
        ) {
            let mut profile = g493();
            profile.nominal_resistance = UncertainValue::new(r0, r0 * 1e-6, 50.0);
            profile.reference_temperature = UncertainValue::new(t0, 0.01, 50.0);
            profile.reference_voltage = UncertainValue::new(v0, 0.1, 50.0);
            profile.alpha = UncertainValue::new(alpha, 1e-7, 50.0);

            let resistance = profile.effective_resistance(
                &UncertainValue::exact(t0),
                &UncertainValue::exact(v0),
                &UncertainValue::exact(0.0),
            );

            prop_assert_eq!(resistance.value(), r0);
        }
    }
}
