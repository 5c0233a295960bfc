//! The alternating-polarity acquisition loop
//!
//! For every step of a polarity sequence the source is driven to the signed setpoint, left to
//! soak, the meter is auto-zeroed and a burst of readings is collected. Readings far above the
//! expected magnitude at non-zero polarity are overload artifacts and are dropped without counting
//! towards the burst.
//!
//! The instruments are returned to their safe state after every step and, through the
//! [`Armed`](crate::instrument::Armed) guard, whenever the loop exits early.
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::instrument::InstrumentSession;
use crate::polarity::{Polarity, PolaritySample};

/// Fixed parameters of one acquisition
#[derive(Clone, Debug, PartialEq)]
pub struct AcquisitionSettings {
    /// Accepted readings to collect at each step
    pub samples_per_step: usize,
    /// Wait after the source is applied, before the meter is prepared
    pub soak_delay: Duration,
    /// Wait after the auto-zero cycle is triggered
    pub auto_zero_delay: Duration,
    pub line_sync_delay: Duration,
    pub range_settle: Duration,
    /// Readings larger than this multiple of the expected magnitude are discarded
    pub outlier_multiplier: f64,
    /// Raw reads allowed per step, as a multiple of `samples_per_step`
    pub max_attempts_factor: usize,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            samples_per_step: 10,
            soak_delay: Duration::from_secs(1),
            auto_zero_delay: Duration::from_secs(1),
            line_sync_delay: Duration::from_secs(1),
            range_settle: Duration::from_millis(100),
            outlier_multiplier: 10.0,
            max_attempts_factor: 10,
        }
    }
}

/// What the source is driven to, and what the meter is expected to read, at positive polarity
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Setpoint {
    /// Source output magnitude, in the source's units
    pub level: f64,
    /// Meter reading magnitude expected at this level, in volts
    pub reading_scale: f64,
}

impl Setpoint {
    /// A voltage stimulus read back directly by the meter
    pub const fn voltage(volts: f64) -> Self {
        Self {
            level: volts,
            reading_scale: volts,
        }
    }

    /// A current stimulus read as the drop across a sense resistance
    pub fn current(amps: f64, sense_resistance: f64) -> Self {
        Self {
            level: amps,
            reading_scale: amps * sense_resistance,
        }
    }

    /// No stimulus at all
    pub const fn none() -> Self {
        Self::voltage(0.0)
    }
}

/// Blocking waits between instrument actions
pub trait Pause {
    fn pause(&mut self, duration: Duration, reason: &str);
}

/// Longest uninterrupted sleep of [`ThreadSleep`]
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Wait in real time, giving up early once `abort` is raised
#[derive(Debug, Default)]
pub struct ThreadSleep {
    abort: AbortFlag,
}

impl ThreadSleep {
    pub const fn new(abort: AbortFlag) -> Self {
        Self { abort }
    }
}

impl Pause for ThreadSleep {
    fn pause(&mut self, duration: Duration, reason: &str) {
        tracing::debug!(seconds = duration.as_secs_f64(), reason, "waiting");
        let deadline = Instant::now() + duration;
        while !self.abort.is_raised() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            std::thread::sleep(remaining.min(SLEEP_SLICE));
        }
    }
}

/// Skip every wait, for simulated runs
#[derive(Debug, Default)]
pub struct NoPause;

impl Pause for NoPause {
    fn pause(&mut self, _duration: Duration, _reason: &str) {}
}

/// Operator-initiated cancellation, shared between the acquisition and whoever may raise it
#[derive(Clone, Debug, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Accepted readings of one acquisition, in the order they were taken
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PolarityReadings {
    samples: Vec<PolaritySample>,
}

impl PolarityReadings {
    pub fn samples(&self) -> &[PolaritySample] {
        &self.samples
    }

    /// Every accepted reading taken at `polarity`, across all steps
    pub fn readings(&self, polarity: Polarity) -> Vec<f64> {
        self.samples
            .iter()
            .filter(|sample| sample.polarity == polarity)
            .map(|sample| sample.reading)
            .collect()
    }

    fn push(&mut self, sample: PolaritySample) {
        self.samples.push(sample);
    }
}

fn wait(pause: &mut dyn Pause, abort: &AbortFlag, duration: Duration, reason: &str) -> Result<()> {
    pause.pause(duration, reason);
    if abort.is_raised() {
        return Err(Error::Aborted);
    }
    Ok(())
}

/// Run `sequence` on the session and collect the accepted readings per polarity
///
/// # Errors
/// Instrument failures and an operator abort end the acquisition immediately. If any polarity of
/// the sequence collected no readings at all the test is incomplete; this is reported after the
/// instruments have been made safe.
pub fn acquire(
    session: &mut InstrumentSession,
    sequence: &[Polarity],
    setpoint: Setpoint,
    settings: &AcquisitionSettings,
    pause: &mut dyn Pause,
    abort: &AbortFlag,
) -> Result<PolarityReadings> {
    let mut collected = PolarityReadings::default();

    {
        let mut armed = session.arm();
        for (step, &polarity) in sequence.iter().enumerate() {
            let span = tracing::info_span!("step", step, %polarity);
            let _entered = span.enter();

            if abort.is_raised() {
                return Err(Error::Aborted);
            }

            let level = polarity.setpoint(setpoint.level);
            let expected = polarity.setpoint(setpoint.reading_scale);

            armed.meter.configure(expected)?;
            wait(pause, abort, settings.range_settle, "range settle")?;
            armed.source.apply(level)?;
            wait(pause, abort, settings.soak_delay, "soak")?;

            armed.meter.configure(setpoint.reading_scale)?;
            armed.meter.sync_to_line()?;
            wait(pause, abort, settings.line_sync_delay, "line sync")?;
            armed.meter.auto_zero_once()?;
            wait(pause, abort, settings.auto_zero_delay, "auto-zero")?;

            let max_attempts = settings.samples_per_step * settings.max_attempts_factor;
            let mut accepted = 0;
            let mut attempts = 0;
            while accepted < settings.samples_per_step && attempts < max_attempts {
                if abort.is_raised() {
                    return Err(Error::Aborted);
                }
                attempts += 1;

                let raw = armed.meter.read()?;
                let reading: f64 = raw.trim().parse().map_err(|e| {
                    Error::instrument(
                        armed.meter.name(),
                        format!("unreadable reply `{raw}`: {e}"),
                    )
                })?;

                if polarity.is_overload(reading, expected, settings.outlier_multiplier) {
                    tracing::warn!(reading, "overload, reading skipped");
                    continue;
                }

                tracing::debug!(reading);
                collected.push(PolaritySample {
                    step,
                    polarity,
                    setpoint: level,
                    reading,
                });
                accepted += 1;
            }

            if accepted < settings.samples_per_step {
                tracing::warn!(
                    accepted,
                    wanted = settings.samples_per_step,
                    "gave up on step after {attempts} reads"
                );
            }

            armed.make_safe()?;
        }
    }

    let polarities: BTreeSet<Polarity> = sequence.iter().copied().collect();
    for polarity in polarities {
        if collected.readings(polarity).is_empty() {
            return Err(Error::IncompleteTest(polarity));
        }
    }

    Ok(collected)
}
