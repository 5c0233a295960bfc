//! Instrument handles used by the measurement procedures
//!
//! The procedures only need a small contract from the bench: a meter that can be ranged,
//! auto-zeroed and read, a source that can be set to a signed level and put in standby, and a
//! temperature probe. Everything else about an instrument stays behind these traits.
//!
//! # Safe state
//! An [`InstrumentSession`] owns one meter and one source for the lifetime of a run. Acquisition
//! arms the session through [`InstrumentSession::arm`]; the returned guard puts the source in
//! standby at zero output and the meter back to continuous auto-zero when it is dropped, whether
//! the acquisition finished, failed part way or was aborted.
use std::io::{BufRead, Write};
use std::ops::{Deref, DerefMut};

use crate::error::{Error, Result};

pub mod gpib;
pub mod simulated;
pub mod transport;

pub trait Meter {
    fn name(&self) -> &str;

    /// Select the measurement range able to read values of magnitude `range`
    fn configure(&mut self, range: f64) -> Result<()>;

    /// Lock the integration time to the mains frequency
    fn sync_to_line(&mut self) -> Result<()>;

    /// Run a single auto-zero cycle before a burst of readings
    fn auto_zero_once(&mut self) -> Result<()>;

    /// Return to continuous auto-zero, the idle state
    fn auto_zero_continuous(&mut self) -> Result<()>;

    /// Take the next reading, as returned by the instrument
    fn read(&mut self) -> Result<String>;
}

pub trait Source {
    fn name(&self) -> &str;

    /// Drive the output to `level` (volts or amps, signed) and enable it
    fn apply(&mut self, level: f64) -> Result<()>;

    /// Zero the output and put the source in standby
    fn standby(&mut self) -> Result<()>;
}

pub trait TemperatureProbe {
    /// Read the temperature on `channel`, in degrees Celsius
    fn measure(&mut self, channel: &str) -> Result<f64>;
}

/// Stand-in source for procedures that need no stimulus
#[derive(Debug, Default)]
pub struct NoSource;

impl Source for NoSource {
    fn name(&self) -> &str {
        "none"
    }

    fn apply(&mut self, _level: f64) -> Result<()> {
        Ok(())
    }

    fn standby(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A probe that always reports the same temperature
#[derive(Debug)]
pub struct FixedProbe(pub f64);

impl TemperatureProbe for FixedProbe {
    fn measure(&mut self, _channel: &str) -> Result<f64> {
        Ok(self.0)
    }
}

/// A probe read by eye, with the operator typing in the temperature
pub struct ManualProbe<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> ManualProbe<R, W> {
    pub const fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl<R: BufRead, W: Write> TemperatureProbe for ManualProbe<R, W> {
    fn measure(&mut self, channel: &str) -> Result<f64> {
        loop {
            write!(self.output, "Resistor temperature on channel {channel} (deg C): ")?;
            self.output.flush()?;

            let mut line = String::new();
            if self.input.read_line(&mut line)? == 0 {
                return Err(Error::Aborted);
            }
            match line.trim().parse::<f64>() {
                Ok(celsius) if celsius.is_finite() => return Ok(celsius),
                _ => writeln!(self.output, "`{}` is not a temperature", line.trim())?,
            }
        }
    }
}

/// The meter and source used for one measurement run
pub struct InstrumentSession {
    pub meter: Box<dyn Meter>,
    pub source: Box<dyn Source>,
}

impl InstrumentSession {
    pub fn new(meter: Box<dyn Meter>, source: Box<dyn Source>) -> Self {
        Self { meter, source }
    }

    /// Put both instruments in their idle state
    ///
    /// Both instruments are always visited; the first error is returned.
    pub fn make_safe(&mut self) -> Result<()> {
        let source = self.source.standby();
        let meter = self.meter.auto_zero_continuous();
        source.and(meter)
    }

    /// Energise the session for an acquisition; it is made safe again when the guard drops
    pub fn arm(&mut self) -> Armed<'_> {
        Armed { session: self }
    }
}

impl Drop for InstrumentSession {
    fn drop(&mut self) {
        if let Err(e) = self.make_safe() {
            tracing::error!(%e, "failed to leave instruments in a safe state on close");
        }
    }
}

/// An instrument session with a live source
pub struct Armed<'s> {
    session: &'s mut InstrumentSession,
}

impl Deref for Armed<'_> {
    type Target = InstrumentSession;

    fn deref(&self) -> &InstrumentSession {
        self.session
    }
}

impl DerefMut for Armed<'_> {
    fn deref_mut(&mut self) -> &mut InstrumentSession {
        self.session
    }
}

impl Drop for Armed<'_> {
    fn drop(&mut self) {
        match self.session.make_safe() {
            Ok(()) => tracing::debug!("instruments returned to safe state"),
            Err(e) => tracing::error!(%e, "failed to return instruments to a safe state"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::{InstrumentSession, ManualProbe, Meter, Source, TemperatureProbe};
    use crate::error::{Error, Result};

    #[derive(Default)]
    struct Log(Rc<RefCell<Vec<String>>>);

    struct LoggingMeter(Rc<RefCell<Vec<String>>>);
    struct LoggingSource(Rc<RefCell<Vec<String>>>);

    impl Meter for LoggingMeter {
        fn name(&self) -> &str {
            "meter"
        }
        fn configure(&mut self, range: f64) -> Result<()> {
            self.0.borrow_mut().push(format!("range {range}"));
            Ok(())
        }
        fn sync_to_line(&mut self) -> Result<()> {
            Ok(())
        }
        fn auto_zero_once(&mut self) -> Result<()> {
            Ok(())
        }
        fn auto_zero_continuous(&mut self) -> Result<()> {
            self.0.borrow_mut().push("azero on".to_owned());
            Ok(())
        }
        fn read(&mut self) -> Result<String> {
            Err(Error::instrument("meter", "timeout"))
        }
    }

    impl Source for LoggingSource {
        fn name(&self) -> &str {
            "source"
        }
        fn apply(&mut self, level: f64) -> Result<()> {
            self.0.borrow_mut().push(format!("out {level}"));
            Ok(())
        }
        fn standby(&mut self) -> Result<()> {
            self.0.borrow_mut().push("standby".to_owned());
            Ok(())
        }
    }

    #[test]
    fn armed_sessions_are_made_safe_on_early_return() {
        let log = Log::default();
        let mut session = InstrumentSession::new(
            Box::new(LoggingMeter(log.0.clone())),
            Box::new(LoggingSource(log.0.clone())),
        );

        let outcome: Result<String> = (|| {
            let mut armed = session.arm();
            armed.source.apply(10.0)?;
            armed.meter.read()
        })();

        assert!(outcome.is_err());
        assert_eq!(
            *log.0.borrow(),
            vec!["out 10".to_owned(), "standby".to_owned(), "azero on".to_owned()]
        );
    }

    #[test]
    fn manual_probe_asks_again_until_it_gets_a_number() {
        let mut output = Vec::new();
        let mut probe = ManualProbe::new(&b"twenty\n20.3\n"[..], &mut output);

        let celsius = probe.measure("T").unwrap();

        approx::assert_relative_eq!(celsius, 20.3);
        let transcript = String::from_utf8(output).unwrap();
        assert_eq!(transcript.matches("channel T").count(), 2);
        assert!(transcript.contains("`twenty` is not a temperature"));
    }

    #[test]
    fn manual_probe_gives_up_at_end_of_input() {
        let mut probe = ManualProbe::new(&b""[..], Vec::new());
        assert!(matches!(probe.measure("T"), Err(Error::Aborted)));
    }
}
