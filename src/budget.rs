//! Uncertainty budgets
//!
//! A budget lists, for each named input of a result, the sensitivity coefficient
//! $\partial y / \partial x_i$ and the signed contribution $c_i u(x_i)$ it makes to the combined
//! standard uncertainty of $y$.
use std::fmt;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::calculators::sensed_current;
use crate::error::Result;
use crate::uncertain::UncertainValue;

#[derive(Clone, Debug)]
pub struct BudgetLine {
    pub name: String,
    pub value: f64,
    pub sensitivity: f64,
    pub component: f64,
}

impl fmt::Display for BudgetLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<8} sens. coef = {:+.6e}  u contrib = {:+.3e}",
            self.name, self.sensitivity, self.component
        )
    }
}

/// Contribution of each of `inputs` to the uncertainty of `result`
///
/// Inputs known exactly have no identity to trace and contribute nothing.
pub fn budget(result: &UncertainValue, inputs: &[(&str, &UncertainValue)]) -> Vec<BudgetLine> {
    inputs
        .iter()
        .map(|(name, input)| {
            let (sensitivity, component) = input.input_id().map_or((0.0, 0.0), |id| {
                (result.sensitivity(id), result.component(id))
            });
            BudgetLine {
                name: (*name).to_owned(),
                value: input.value(),
                sensitivity,
                component,
            }
        })
        .collect()
}

/// Inputs to the current measured through a sense resistor by a loading meter
///
/// Times are in days.
#[derive(Debug, Deserialize)]
pub struct SourceCurrentInputs {
    #[serde(rename = "V1")]
    pub voltage: UncertainValue,
    #[serde(rename = "V2")]
    pub zero_voltage: UncertainValue,
    pub g1: UncertainValue,
    pub g2: UncertainValue,
    #[serde(rename = "Rdvm")]
    pub meter_input_resistance: UncertainValue,
    #[serde(rename = "R0")]
    pub nominal_resistance: UncertainValue,
    pub alpha: UncertainValue,
    #[serde(rename = "T")]
    pub temperature: UncertainValue,
    #[serde(rename = "T0")]
    pub reference_temperature: UncertainValue,
    pub gamma: UncertainValue,
    #[serde(rename = "V0")]
    pub reference_voltage: UncertainValue,
    pub tau: UncertainValue,
    pub t: UncertainValue,
    pub t0: UncertainValue,
}

impl SourceCurrentInputs {
    /// # Errors
    /// The file cannot be read or lacks one of the inputs.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Sense resistance at the time and conditions of the measurement
    pub fn sense_resistance(&self) -> UncertainValue {
        let correction = 1.0
            + &self.alpha * (&self.temperature - &self.reference_temperature)
            + &self.gamma * (&self.voltage - &self.reference_voltage)
            + &self.tau * (&self.t - &self.t0);
        &self.nominal_resistance * correction
    }

    pub fn current(&self) -> UncertainValue {
        sensed_current(
            &self.voltage,
            &self.g1,
            &self.zero_voltage,
            &self.g2,
            &self.sense_resistance(),
            &self.meter_input_resistance,
        )
    }

    fn named(&self) -> [(&str, &UncertainValue); 14] {
        [
            ("V1", &self.voltage),
            ("V2", &self.zero_voltage),
            ("g1", &self.g1),
            ("g2", &self.g2),
            ("R0", &self.nominal_resistance),
            ("alpha", &self.alpha),
            ("T", &self.temperature),
            ("T0", &self.reference_temperature),
            ("gamma", &self.gamma),
            ("V0", &self.reference_voltage),
            ("tau", &self.tau),
            ("t", &self.t),
            ("t0", &self.t0),
            ("Rdvm", &self.meter_input_resistance),
        ]
    }

    /// The measured current and its budget over every input
    pub fn budget(&self) -> (UncertainValue, Vec<BudgetLine>) {
        let current = self.current();
        let lines = budget(&current, &self.named());
        (current, lines)
    }
}
