//! A simulated measurement bench
//!
//! The bench models a DVM with a finite input resistance `Rin` and an input bias current `Ib`,
//! connected through a series resistor `R` to either a voltage or a current source. With a
//! voltage source `Vs` the meter reads
//!
//! $$
//!     V = \left(V_s + I_b R\right) \frac{R_\text{in}}{R + R_\text{in}},
//! $$
//!
//! and with a current source `I` it reads $V = (I + I_b) R \parallel R_\text{in}$. On top of this
//! each reading carries a fixed thermal offset, a slow linear drift, white noise and, with a
//! configurable probability, an overload spike while the source is energised.
//!
//! The bench is used for dry runs of the procedures and by the tests.
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use ndarray_rand::rand::{Rng, SeedableRng};
use ndarray_rand::rand_distr::{Distribution, StandardNormal};
use rand_isaac::Isaac64Rng;

use super::{Meter, Source};
use crate::error::{Error, Result};
use crate::procedure::{Operator, Prompt};

#[derive(Clone, Copy, Debug)]
pub struct BenchModel {
    pub bias_current: f64,
    pub input_resistance: f64,
    /// Offset present in every reading, whatever the source polarity
    pub thermal_offset: f64,
    /// Change in offset between consecutive readings
    pub drift_per_reading: f64,
    /// Standard deviation of the reading noise
    pub noise: f64,
    pub spike_probability: f64,
}

impl Default for BenchModel {
    fn default() -> Self {
        Self {
            bias_current: 2.5e-11,
            input_resistance: 1e11,
            thermal_offset: 1.5e-7,
            drift_per_reading: 1e-10,
            noise: 5e-8,
            spike_probability: 0.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stimulus {
    Voltage,
    Current,
}

struct BenchState {
    model: BenchModel,
    series_resistance: f64,
    stimulus: Stimulus,
    level: f64,
    operating: bool,
    readings_taken: u32,
    rng: Isaac64Rng,
}

impl BenchState {
    fn next_reading(&mut self) -> f64 {
        let model = self.model;
        let r = self.series_resistance;
        let rin = model.input_resistance;

        let ideal = match self.stimulus {
            Stimulus::Voltage => (self.level + model.bias_current * r) * rin / (r + rin),
            Stimulus::Current => (self.level + model.bias_current) * r * rin / (r + rin),
        };

        let noise: f64 = StandardNormal.sample(&mut self.rng);
        let drift = model.drift_per_reading * f64::from(self.readings_taken);
        self.readings_taken += 1;

        if self.level != 0.0 && self.rng.gen_bool(model.spike_probability) {
            return ideal.signum() * 1e3 * ideal.abs().max(1.0);
        }

        ideal + model.thermal_offset + drift + model.noise * noise
    }
}

/// Shared state behind the simulated meter and sources
#[derive(Clone)]
pub struct SimulatedBench(Rc<RefCell<BenchState>>);

impl SimulatedBench {
    pub fn new(model: BenchModel, seed: u64) -> Self {
        Self(Rc::new(RefCell::new(BenchState {
            model,
            series_resistance: 0.0,
            stimulus: Stimulus::Voltage,
            level: 0.0,
            operating: false,
            readings_taken: 0,
            rng: Isaac64Rng::seed_from_u64(seed),
        })))
    }

    /// Place a resistor of `resistance` between the source and the meter; zero shorts it
    pub fn connect(&self, resistance: f64) {
        tracing::debug!(resistance, "simulated bench: resistor connected");
        self.0.borrow_mut().series_resistance = resistance;
    }

    /// Level currently driven by whichever simulated source was last applied
    pub fn source_level(&self) -> f64 {
        self.0.borrow().level
    }

    /// Whether a simulated source is out of standby
    pub fn is_operating(&self) -> bool {
        self.0.borrow().operating
    }

    pub fn meter(&self) -> SimulatedMeter {
        SimulatedMeter(self.clone())
    }

    pub fn voltage_source(&self) -> SimulatedSource {
        SimulatedSource {
            bench: self.clone(),
            stimulus: Stimulus::Voltage,
        }
    }

    pub fn current_source(&self) -> SimulatedSource {
        SimulatedSource {
            bench: self.clone(),
            stimulus: Stimulus::Current,
        }
    }
}

pub struct SimulatedMeter(SimulatedBench);

impl Meter for SimulatedMeter {
    fn name(&self) -> &str {
        "simulated meter"
    }

    fn configure(&mut self, _range: f64) -> Result<()> {
        Ok(())
    }

    fn sync_to_line(&mut self) -> Result<()> {
        Ok(())
    }

    fn auto_zero_once(&mut self) -> Result<()> {
        Ok(())
    }

    fn auto_zero_continuous(&mut self) -> Result<()> {
        Ok(())
    }

    fn read(&mut self) -> Result<String> {
        let reading = self.0 .0.borrow_mut().next_reading();
        Ok(format!("{reading:+.9E}"))
    }
}

pub struct SimulatedSource {
    bench: SimulatedBench,
    stimulus: Stimulus,
}

impl Source for SimulatedSource {
    fn name(&self) -> &str {
        match self.stimulus {
            Stimulus::Voltage => "simulated voltage source",
            Stimulus::Current => "simulated current source",
        }
    }

    fn apply(&mut self, level: f64) -> Result<()> {
        let mut state = self.bench.0.borrow_mut();
        state.stimulus = self.stimulus;
        state.level = level;
        state.operating = true;
        Ok(())
    }

    fn standby(&mut self) -> Result<()> {
        let mut state = self.bench.0.borrow_mut();
        state.level = 0.0;
        state.operating = false;
        Ok(())
    }
}

/// Stands in for the operator by rewiring the simulated bench on request
pub struct SimulatedOperator {
    bench: SimulatedBench,
    resistances: BTreeMap<String, f64>,
    retries: usize,
}

impl SimulatedOperator {
    pub fn new(bench: SimulatedBench, resistances: BTreeMap<String, f64>) -> Self {
        Self {
            bench,
            resistances,
            retries: 0,
        }
    }

    /// Agree to repeat a failed test this many times before declining
    #[must_use]
    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }
}

impl Operator for SimulatedOperator {
    fn request(&mut self, prompt: Prompt<'_>) -> Result<()> {
        match prompt {
            Prompt::ConnectResistor(name) => {
                let resistance = self
                    .resistances
                    .get(name)
                    .ok_or_else(|| Error::UnknownResistor(name.to_owned()))?;
                self.bench.connect(*resistance);
            }
            Prompt::BypassResistor => self.bench.connect(0.0),
        }
        Ok(())
    }

    fn retry(&mut self, reason: &str) -> Result<bool> {
        let again = self.retries > 0;
        self.retries = self.retries.saturating_sub(1);
        tracing::info!(reason, again, "simulated operator asked to repeat the test");
        Ok(again)
    }
}

#[cfg(test)]
mod tests {
    use super::{BenchModel, SimulatedBench};
    use crate::instrument::{Meter, Source};

    fn quiet() -> BenchModel {
        BenchModel {
            thermal_offset: 0.0,
            drift_per_reading: 0.0,
            noise: 0.0,
            ..BenchModel::default()
        }
    }

    #[test]
    fn open_circuit_voltage_is_the_bias_current_times_the_parallel_resistance() {
        let model = quiet();
        let bench = SimulatedBench::new(model, 40);
        bench.connect(1e9);

        let reading: f64 = bench.meter().read().unwrap().parse().unwrap();

        let parallel = 1e9 * model.input_resistance / (1e9 + model.input_resistance);
        approx::assert_relative_eq!(reading, model.bias_current * parallel, max_relative = 1e-8);
    }

    #[test]
    fn shorted_resistor_reads_the_source_voltage() {
        let bench = SimulatedBench::new(quiet(), 40);
        bench.connect(0.0);
        let mut source = bench.voltage_source();
        source.apply(10.0).unwrap();

        let reading: f64 = bench.meter().read().unwrap().parse().unwrap();

        approx::assert_relative_eq!(reading, 10.0, max_relative = 1e-9);
    }

    #[test]
    fn spikes_only_occur_with_the_source_energised() {
        let model = BenchModel {
            spike_probability: 1.0,
            ..quiet()
        };
        let bench = SimulatedBench::new(model, 40);
        bench.connect(1e5);
        let mut meter = bench.meter();

        let at_zero: f64 = meter.read().unwrap().parse().unwrap();
        assert!(at_zero.abs() < 1.0);

        bench.voltage_source().apply(1.0).unwrap();
        let energised: f64 = meter.read().unwrap().parse().unwrap();
        assert!(energised.abs() > 10.0);
    }
}
