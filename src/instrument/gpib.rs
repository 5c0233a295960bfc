//! Command sets for the bench instruments
//!
//! Each handle wraps a [`LineInstrument`] and maps the [`Meter`]/[`Source`] contract onto the
//! instrument's own command language. Ranges and levels are sent in base units.
use std::io::{Read, Write};

use super::transport::LineInstrument;
use super::{Meter, Source};
use crate::error::Result;

/// HP/Agilent 3458A-style precision DVM
pub struct Hp3458a<T> {
    io: LineInstrument<T>,
}

impl<T: Read + Write> Hp3458a<T> {
    /// Identify the meter and put it on its highest DC voltage range
    pub fn open(mut io: LineInstrument<T>) -> Result<Self> {
        let id = io.query("ID?")?;
        tracing::info!(instrument = io.name(), %id, "meter identified");
        io.write_line("DCV 1000; NPLC 20; AZERO ON")?;
        Ok(Self { io })
    }
}

impl<T: Read + Write> Meter for Hp3458a<T> {
    fn name(&self) -> &str {
        self.io.name()
    }

    fn configure(&mut self, range: f64) -> Result<()> {
        self.io.write_line(&format!("DCV {}", range.abs()))
    }

    fn sync_to_line(&mut self) -> Result<()> {
        self.io.write_line("LFREQ LINE")
    }

    fn auto_zero_once(&mut self) -> Result<()> {
        self.io.write_line("AZERO ONCE")
    }

    fn auto_zero_continuous(&mut self) -> Result<()> {
        self.io.write_line("AZERO ON")
    }

    fn read(&mut self) -> Result<String> {
        self.io.read_line()
    }
}

/// Fluke 5720-style calibrator used as a DC voltage source
pub struct Fluke5720<T> {
    io: LineInstrument<T>,
}

impl<T: Read + Write> Fluke5720<T> {
    pub fn open(mut io: LineInstrument<T>) -> Result<Self> {
        io.write_line("STBY")?;
        Ok(Self { io })
    }
}

impl<T: Read + Write> Source for Fluke5720<T> {
    fn name(&self) -> &str {
        self.io.name()
    }

    fn apply(&mut self, level: f64) -> Result<()> {
        self.io.write_line(&format!("OUT {level}V,0Hz"))?;
        self.io.write_line("OPER")
    }

    fn standby(&mut self) -> Result<()> {
        self.io.write_line("OUT 0V,0Hz")?;
        self.io.write_line("STBY")
    }
}

/// Keithley 6430-style source-meter used as a DC current source
pub struct Keithley6430<T> {
    io: LineInstrument<T>,
}

impl<T: Read + Write> Keithley6430<T> {
    pub fn open(mut io: LineInstrument<T>) -> Result<Self> {
        let id = io.query("*IDN?")?;
        tracing::info!(instrument = io.name(), %id, "source-meter identified");
        io.write_line(":SOUR:FUNC CURR")?;
        io.write_line(":OUTP OFF")?;
        Ok(Self { io })
    }
}

impl<T: Read + Write> Source for Keithley6430<T> {
    fn name(&self) -> &str {
        self.io.name()
    }

    fn apply(&mut self, level: f64) -> Result<()> {
        self.io.write_line(&format!(":SOUR:CURR:RANG {:e}", level.abs()))?;
        self.io.write_line(&format!(":SOUR:CURR {level:e}"))?;
        self.io.write_line(":OUTP ON")
    }

    fn standby(&mut self) -> Result<()> {
        self.io.write_line(":SOUR:CURR 0")?;
        self.io.write_line(":OUTP OFF")
    }
}

#[cfg(test)]
mod tests {
    use super::{Fluke5720, Hp3458a, Keithley6430};
    use crate::instrument::transport::{LineInstrument, ScriptedStream};
    use crate::instrument::{Meter, Source};

    #[test]
    fn voltage_source_enters_operate_and_standby() {
        let io = LineInstrument::with("src", "\n", ScriptedStream::new(b""));
        let mut source = Fluke5720::open(io).unwrap();

        source.apply(-10.0).unwrap();
        source.standby().unwrap();

        let written = String::from_utf8(source.io.io_handle().written.clone()).unwrap();
        assert_eq!(written, "STBY\nOUT -10V,0Hz\nOPER\nOUT 0V,0Hz\nSTBY\n");
    }

    #[test]
    fn current_source_switches_output_off_in_standby() {
        let io = LineInstrument::with("k6430", "\n", ScriptedStream::new(b"KEITHLEY 6430\n"));
        let mut source = Keithley6430::open(io).unwrap();

        source.standby().unwrap();

        let written = String::from_utf8(source.io.io_handle().written.clone()).unwrap();
        assert!(written.ends_with(":SOUR:CURR 0\n:OUTP OFF\n"), "{written}");
    }

    #[test]
    fn meter_readings_are_passed_through() {
        let io = LineInstrument::with(
            "dvm",
            "\r\n",
            ScriptedStream::new(b"HP3458A\r\n+9.9999E+00\r\n"),
        );
        let mut meter = Hp3458a::open(io).unwrap();

        assert_eq!(meter.read().unwrap(), "+9.9999E+00");
        meter.configure(-10.0).unwrap();

        let written = String::from_utf8(meter.io.io_handle().written.clone()).unwrap();
        assert!(written.starts_with("ID?\r\n"));
        assert!(written.ends_with("DCV 10\r\n"));
    }
}
