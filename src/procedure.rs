//! The measurement procedures
//!
//! Each procedure runs one test end to end: it asks the operator to wire the bench, reads the
//! resistor temperature, acquires, reduces, applies the resistor correction and records the
//! outcome. A test whose result is a dud is reported but never stored.
//!
//! Three procedures share the machinery:
//!
//! - **bias current**: the meter alone across a resistor, source off, zero-polarity readings only;
//! - **input resistance**: a voltage source in series with a resistor, chopped sequence, once with
//!   the resistor in circuit and once with it shorted;
//! - **source current**: a current source driving a sense resistor, chopped sequence.
use std::fmt;
use std::io::{BufRead, Write};

use chrono::{Local, NaiveDateTime, SubsecRound};

use crate::acquisition::{acquire, AbortFlag, Pause, PolarityReadings, Setpoint};
use crate::calculators::{bias_current_approx, input_resistance, sensed_current, source_correction};
use crate::config::{Config, SHORTED};
use crate::error::{Error, Result};
use crate::fit::{fit_bias_and_input_resistance, FitMethod, FitResult};
use crate::instrument::{InstrumentSession, TemperatureProbe};
use crate::math::estimate;
use crate::polarity::{Polarity, CHOPPED_SEQUENCE, ZERO_ONLY_SEQUENCE};
use crate::reduce::DriftCorrected;
use crate::resistor::{ResistorProfile, ResistorTable};
use crate::store::{
    bias_key, current_key, quantity, voltage_key, BiasHandoff, ReducedMeasurement, ResultStore,
};
use crate::uncertain::UncertainValue;

/// The bias-current store is refitted once it holds more tests than this
pub const REFIT_THRESHOLD: usize = 3;

/// Something the operator has to do at the bench before the procedure can continue
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Prompt<'a> {
    ConnectResistor(&'a str),
    BypassResistor,
}

impl fmt::Display for Prompt<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectResistor(name) => {
                write!(f, "Connect resistor `{name}`; ensure it is NOT shorted")
            }
            Self::BypassResistor => write!(f, "Bypass the series resistor"),
        }
    }
}

pub trait Operator {
    /// Ask for `prompt` to be carried out, returning once it has been
    fn request(&mut self, prompt: Prompt<'_>) -> Result<()>;

    /// Ask whether a test that failed for `reason` should be repeated
    fn retry(&mut self, reason: &str) -> Result<bool>;
}

/// An operator at a terminal, who presses Enter once each prompt is done and answers `y` to
/// repeat a failed test
pub struct ConsoleOperator<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> ConsoleOperator<R, W> {
    pub const fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl<R: BufRead, W: Write> ConsoleOperator<R, W> {
    fn answer(&mut self, question: fmt::Arguments<'_>) -> Result<String> {
        self.output.write_fmt(question)?;
        self.output.flush()?;

        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Err(Error::Aborted);
        }
        Ok(line)
    }
}

impl<R: BufRead, W: Write> Operator for ConsoleOperator<R, W> {
    fn request(&mut self, prompt: Prompt<'_>) -> Result<()> {
        self.answer(format_args!("{prompt}, then press Enter: ")).map(drop)
    }

    fn retry(&mut self, reason: &str) -> Result<bool> {
        let line = self.answer(format_args!("{reason}. Repeat the test? [y/N]: "))?;
        Ok(matches!(line.trim(), "y" | "Y" | "yes"))
    }
}

/// Everything a procedure needs besides the instrument session and the result store
pub struct Context<'a> {
    pub config: &'a Config,
    pub resistors: &'a ResistorTable,
    pub probe: &'a mut dyn TemperatureProbe,
    pub operator: &'a mut dyn Operator,
    pub pause: &'a mut dyn Pause,
    pub abort: AbortFlag,
}

impl Context<'_> {
    fn temperature(&mut self) -> Result<UncertainValue> {
        let channel = &self.config.instruments.probe_channel;
        let celsius = self.probe.measure(channel)?;
        tracing::info!(celsius, "resistor temperature");
        Ok(self.config.temperature.attach(celsius))
    }

    /// Time of a test, and the days since `profile` was characterised
    fn timestamp(&self, profile: &ResistorProfile) -> (NaiveDateTime, UncertainValue) {
        let t = Local::now().naive_local().trunc_subsecs(0);
        let elapsed = self.config.elapsed_time;
        (t, profile.elapsed_days(t, elapsed.uncertainty, elapsed.dof))
    }
}

/// The result of one test, whether or not it was stored
#[derive(Debug)]
pub struct TestOutcome {
    pub key: String,
    pub measurement: ReducedMeasurement,
    pub committed: bool,
    /// Raw acquisitions, labelled by circuit configuration
    pub acquisitions: Vec<(&'static str, PolarityReadings)>,
}

fn commit(
    store: &mut ResultStore,
    key: String,
    measurement: ReducedMeasurement,
    acquisitions: Vec<(&'static str, PolarityReadings)>,
) -> Result<TestOutcome> {
    let committed = if measurement.is_dud() {
        tracing::warn!(%key, "test is a dud and will not be stored");
        false
    } else {
        store.insert(key.as_str(), measurement.clone())?;
        store.save()?;
        true
    };

    Ok(TestOutcome {
        key,
        measurement,
        committed,
        acquisitions,
    })
}

/// Run `test` until its result is stored or the operator declines to repeat it
///
/// Duds and incomplete tests are offered for a retry; any other error ends the run. Every
/// completed attempt is passed to `report`. Returns the last completed attempt, if any.
///
/// # Errors
/// Errors of `test` other than an incomplete acquisition, and errors of `report` or the operator.
pub fn repeat_until_stored<T, F>(
    ctx: &mut Context<'_>,
    session: &mut InstrumentSession,
    mut test: T,
    mut report: F,
) -> Result<Option<TestOutcome>>
where
    T: FnMut(&mut Context<'_>, &mut InstrumentSession) -> Result<TestOutcome>,
    F: FnMut(&TestOutcome) -> Result<()>,
{
    let mut last = None;
    loop {
        let reason = match test(ctx, session) {
            Ok(outcome) => {
                report(&outcome)?;
                if outcome.committed {
                    return Ok(Some(outcome));
                }
                let reason = format!("`{}` is a dud", outcome.key);
                last = Some(outcome);
                reason
            }
            Err(e) if e.is_recoverable() => {
                tracing::warn!(%e, "test abandoned");
                e.to_string()
            }
            Err(e) => return Err(e),
        };

        if !ctx.operator.retry(&reason)? {
            return Ok(last);
        }
        tracing::info!(reason, "repeating test");
    }
}

/// Measure the open-circuit voltage across resistor `name` and derive the bias current
///
/// # Errors
/// Unknown resistor, instrument or probe failures, an incomplete acquisition, or a failure to
/// save the store.
pub fn measure_bias_current(
    ctx: &mut Context<'_>,
    session: &mut InstrumentSession,
    store: &mut ResultStore,
    name: &str,
) -> Result<TestOutcome> {
    let span = tracing::info_span!("bias_current", resistor = name);
    let _entered = span.enter();

    let profile = ctx.resistors.get(name)?;
    ctx.operator.request(Prompt::ConnectResistor(name))?;

    let temperature = ctx.temperature()?;
    let (t, elapsed) = ctx.timestamp(profile);

    let settings = ctx.config.bias_current.settings(ctx.config.delay_for(name));
    let readings = acquire(
        session,
        &ZERO_ONLY_SEQUENCE,
        Setpoint::none(),
        &settings,
        ctx.pause,
        &ctx.abort,
    )?;

    let zero = readings.readings(Polarity::Zero);
    let voltage = estimate(&zero);
    let resistance = profile.effective_resistance(&temperature, &voltage, &elapsed);
    let ib_approx = bias_current_approx(&voltage, &resistance);
    tracing::info!(%resistance, %ib_approx, "bias current");

    let measurement = ReducedMeasurement::new(t, resistance)
        .with_quantity(quantity::TEMPERATURE, temperature)
        .with_quantity(quantity::VOLTAGE, voltage)
        .with_quantity(quantity::BIAS_CURRENT_APPROX, ib_approx)
        .with_readings("V_data", zero);

    commit(store, bias_key(name), measurement, vec![("open", readings)])
}

/// Refit the global bias current and input resistance once the store holds enough tests
///
/// # Errors
/// A failed fit, or a failure to save the updated store.
pub fn refit(store: &mut ResultStore, method: FitMethod) -> Result<Option<FitResult>> {
    if store.len() <= REFIT_THRESHOLD {
        tracing::info!(tests = store.len(), "too few tests to refit");
        return Ok(None);
    }
    fit_store(store, method).map(Some)
}

/// Fit every test in the store and record the result under the reserved keys
///
/// # Errors
/// Fewer than two distinct resistors, a failed fit, or a failure to save the store.
pub fn fit_store(store: &mut ResultStore, method: FitMethod) -> Result<FitResult> {
    let fit = fit_bias_and_input_resistance(&store.fit_points(), method)?;
    store.set_fit(&fit);
    store.save()?;
    Ok(fit)
}

/// Measure the input resistance with resistor `name` in series with a source at `source_voltage`
///
/// The bias current of the prior stage is checked before anything on the bench is touched.
///
/// # Errors
/// As for [`measure_bias_current`], plus a missing bias current for this resistor.
pub fn measure_input_resistance(
    ctx: &mut Context<'_>,
    session: &mut InstrumentSession,
    store: &mut ResultStore,
    handoff: &BiasHandoff,
    name: &str,
    source_voltage: f64,
) -> Result<TestOutcome> {
    let span = tracing::info_span!("input_resistance", resistor = name, source_voltage);
    let _entered = span.enter();

    let profile = ctx.resistors.get(name)?;
    let ib_approx = handoff.ib_approx(name)?;
    let ib = handoff.ib();
    tracing::info!(
        nominal_current = source_voltage / profile.nominal_resistance.value(),
        "test parameters locked in"
    );

    ctx.operator.request(Prompt::ConnectResistor(name))?;
    let temperature = ctx.temperature()?;
    let (t, elapsed) = ctx.timestamp(profile);

    let setpoint = Setpoint::voltage(source_voltage);
    let loaded_settings = ctx.config.input_resistance.settings(ctx.config.delay_for(name));
    let loaded = acquire(
        session,
        &CHOPPED_SEQUENCE,
        setpoint,
        &loaded_settings,
        ctx.pause,
        &ctx.abort,
    )?;

    ctx.operator.request(Prompt::BypassResistor)?;
    let shorted_settings = ctx.config.input_resistance.settings(ctx.config.delay_for(SHORTED));
    let shorted = acquire(
        session,
        &CHOPPED_SEQUENCE,
        setpoint,
        &shorted_settings,
        ctx.pause,
        &ctx.abort,
    )?;

    let voltage = DriftCorrected::from(&loaded).signal;
    let source = DriftCorrected::from(&shorted).signal;

    // Self-heating follows the drop across the resistor
    let drop = &source - &voltage;
    let resistance = profile.effective_resistance(&temperature, &drop, &elapsed);

    let rin = input_resistance(&resistance, &voltage, &source, ib);
    let rin_approx = input_resistance(&resistance, &voltage, &source, ib_approx);
    tracing::info!(%rin, %rin_approx, "input resistance");

    let measurement = ReducedMeasurement::new(t, resistance)
        .with_quantity(quantity::TEMPERATURE, temperature)
        .with_quantity(quantity::VOLTAGE, voltage)
        .with_quantity(quantity::SOURCE_VOLTAGE, source)
        .with_quantity(quantity::INPUT_RESISTANCE, rin)
        .with_quantity(quantity::INPUT_RESISTANCE_APPROX, rin_approx)
        .with_readings("V0_data", loaded.readings(Polarity::Zero))
        .with_readings("Vp_data", loaded.readings(Polarity::Positive))
        .with_readings("Vn_data", loaded.readings(Polarity::Negative))
        .with_readings("Vs0_data", shorted.readings(Polarity::Zero))
        .with_readings("Vsp_data", shorted.readings(Polarity::Positive))
        .with_readings("Vsn_data", shorted.readings(Polarity::Negative));

    commit(
        store,
        voltage_key(name, source_voltage),
        measurement,
        vec![("loaded", loaded), ("shorted", shorted)],
    )
}

/// Calibrate a current source at `current` by the drop across sense resistor `name`
///
/// The session's source must be the current source under calibration.
///
/// # Errors
/// As for [`measure_bias_current`].
pub fn calibrate_source_current(
    ctx: &mut Context<'_>,
    session: &mut InstrumentSession,
    store: &mut ResultStore,
    name: &str,
    current: f64,
) -> Result<TestOutcome> {
    let span = tracing::info_span!("source_current", resistor = name, current);
    let _entered = span.enter();

    let profile = ctx.resistors.get(name)?;
    ctx.operator.request(Prompt::ConnectResistor(name))?;
    let temperature = ctx.temperature()?;
    let (t, elapsed) = ctx.timestamp(profile);

    let setpoint = Setpoint::current(current, profile.nominal_resistance.value());
    let settings = ctx.config.source_cal.acquisition.settings(ctx.config.delay_for(name));
    let readings = acquire(
        session,
        &CHOPPED_SEQUENCE,
        setpoint,
        &settings,
        ctx.pause,
        &ctx.abort,
    )?;

    let voltage = DriftCorrected::from(&readings).signal;
    let resistance = profile.effective_resistance(&temperature, &voltage, &elapsed);

    let gain = &ctx.config.source_cal.gain;
    let measured = sensed_current(
        &voltage,
        gain,
        &UncertainValue::exact(0.0),
        gain,
        &resistance,
        &ctx.config.source_cal.meter_input_resistance,
    );
    let correction = source_correction(&measured, current);
    tracing::info!(%measured, %correction, "source current");

    let measurement = ReducedMeasurement::new(t, resistance)
        .with_quantity(quantity::TEMPERATURE, temperature)
        .with_quantity(quantity::VOLTAGE, voltage)
        .with_quantity(quantity::CURRENT, measured)
        .with_quantity(quantity::CORRECTION, correction)
        .with_readings("V0_data", readings.readings(Polarity::Zero))
        .with_readings("Vp_data", readings.readings(Polarity::Positive))
        .with_readings("Vn_data", readings.readings(Polarity::Negative));

    commit(
        store,
        current_key(name, current),
        measurement,
        vec![("sense", readings)],
    )
}
