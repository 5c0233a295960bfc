use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use dvm_zin::acquisition::{AbortFlag, NoPause, Pause};
use dvm_zin::budget::SourceCurrentInputs;
use dvm_zin::config::Config;
use dvm_zin::fit::FitMethod;
use dvm_zin::instrument::simulated::{BenchModel, SimulatedBench, SimulatedOperator};
use dvm_zin::instrument::{FixedProbe, InstrumentSession, NoSource, Source, TemperatureProbe};
use dvm_zin::output::write_readings_csv;
use dvm_zin::procedure::{
    calibrate_source_current, fit_store, measure_bias_current, measure_input_resistance, refit,
    repeat_until_stored, Context, Operator, TestOutcome,
};
use dvm_zin::resistor::ResistorTable;
use dvm_zin::store::{BiasHandoff, ResultStore};
use dvm_zin::{Error, Result};

/// Resistor temperature reported by the simulated probe, in degrees Celsius
const SIMULATED_TEMPERATURE: f64 = 20.5;

/// Drift-corrected DVM input-impedance, bias-current and current-source calibration
#[derive(Parser)]
#[command(name = "dvm-zin", version)]
struct Cli {
    /// TOML run configuration; defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run against a simulated bench instead of the real instruments
    #[arg(long)]
    simulate: bool,

    /// Seed of the simulated bench
    #[arg(long, default_value_t = 40)]
    seed: u64,

    /// Also write the raw readings of each test to CSV files in this directory
    #[arg(long)]
    export: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Measure the meter's input bias current across each resistor in turn
    BiasCurrent {
        /// Resistors to test; all of the table when omitted
        resistors: Vec<String>,
    },
    /// Measure the meter's input resistance with each resistor in series with a voltage source
    InputResistance {
        /// Source voltage, in volts
        #[arg(long, default_value_t = 10.0)]
        voltage: f64,
        #[arg(required = true)]
        resistors: Vec<String>,
    },
    /// Calibrate a current source by the drop across a sense resistor
    SourceCal {
        /// Sense resistor
        #[arg(long)]
        resistor: String,
        /// Source currents, in amps
        #[arg(required = true, allow_negative_numbers = true)]
        currents: Vec<f64>,
    },
    /// Refit the bias current and input resistance from the stored bias-current tests
    Fit {
        #[arg(long, value_enum)]
        method: Option<FitMethod>,
    },
    /// Print the uncertainty budget of a sense-resistor current measurement
    Budget {
        /// TOML file of the model inputs
        inputs: PathBuf,
    },
}

#[derive(Clone, Copy)]
enum Stimulus {
    Nothing,
    Voltage,
    Current,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    if let Err(e) = run(&cli) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    match &cli.command {
        Command::Fit { method } => {
            let mut store = ResultStore::open(config.bias_current_results())?;
            let fit = fit_store(&mut store, method.unwrap_or(config.fit_method))?;
            println!("Ib  = {}", fit.bias_current);
            println!("Rin = {}", fit.input_resistance);
            Ok(())
        }
        Command::Budget { inputs } => {
            let (current, lines) = SourceCurrentInputs::from_file(inputs)?.budget();
            for line in &lines {
                println!("{line}");
            }
            println!("\nI = {current}");
            Ok(())
        }
        Command::BiasCurrent { resistors } => {
            let table = ResistorTable::from_file(&config.resistor_table_path())?;
            let names = if resistors.is_empty() {
                table.names().map(str::to_owned).collect()
            } else {
                resistors.clone()
            };
            let mut bench = Bench::open(cli, &config, &table, Stimulus::Nothing)?;
            let mut store = ResultStore::open(config.bias_current_results())?;

            for name in &names {
                let outcome = bench.run(cli, &config, &table, |ctx, session| {
                    measure_bias_current(ctx, session, &mut store, name)
                })?;
                if outcome.is_some_and(|outcome| outcome.committed) {
                    if let Some(fit) = refit(&mut store, config.fit_method)? {
                        println!("Ib  = {}", fit.bias_current);
                        println!("Rin = {}", fit.input_resistance);
                    }
                }
            }
            Ok(())
        }
        Command::InputResistance { voltage, resistors } => {
            let table = ResistorTable::from_file(&config.resistor_table_path())?;
            let handoff = BiasHandoff::load(&config.bias_current_results())?;
            let mut bench = Bench::open(cli, &config, &table, Stimulus::Voltage)?;
            let mut store = ResultStore::open(config.input_resistance_results())?;

            for name in resistors {
                bench.run(cli, &config, &table, |ctx, session| {
                    measure_input_resistance(ctx, session, &mut store, &handoff, name, *voltage)
                })?;
            }
            Ok(())
        }
        Command::SourceCal { resistor, currents } => {
            let table = ResistorTable::from_file(&config.resistor_table_path())?;
            let mut bench = Bench::open(cli, &config, &table, Stimulus::Current)?;
            let mut store = ResultStore::open(config.source_cal_results())?;

            for &current in currents {
                bench.run(cli, &config, &table, |ctx, session| {
                    calibrate_source_current(ctx, session, &mut store, resistor, current)
                })?;
            }
            Ok(())
        }
    }
}

/// Raise `abort` on the first interrupt; a second one ends the process at once
fn install_interrupt_handler(abort: &AbortFlag) -> Result<()> {
    let abort = abort.clone();
    ctrlc::set_handler(move || {
        if abort.is_raised() {
            tracing::error!("second interrupt, exiting without waiting for the instruments");
            std::process::exit(130);
        }
        tracing::warn!("interrupt received, stopping the test and making the instruments safe");
        abort.raise();
    })
    .map_err(|e| Error::Config(format!("cannot install the interrupt handler: {e}")))
}

/// The instruments, operator and probe for a run, real or simulated
struct Bench {
    session: InstrumentSession,
    operator: Box<dyn Operator>,
    probe: Box<dyn TemperatureProbe>,
    pause: Box<dyn Pause>,
    abort: AbortFlag,
    /// Owns the VISA sessions inside `session`, so it must drop after it
    #[cfg(feature = "visa")]
    _resource_manager: Option<visa_rs::DefaultRM>,
}

impl Bench {
    fn open(cli: &Cli, config: &Config, table: &ResistorTable, stimulus: Stimulus) -> Result<Self> {
        let abort = AbortFlag::default();
        install_interrupt_handler(&abort)?;

        if !cli.simulate {
            return Self::open_instruments(config, stimulus, abort);
        }

        let bench = SimulatedBench::new(BenchModel::default(), cli.seed);
        let source: Box<dyn Source> = match stimulus {
            Stimulus::Nothing => Box::new(NoSource),
            Stimulus::Voltage => Box::new(bench.voltage_source()),
            Stimulus::Current => Box::new(bench.current_source()),
        };
        let resistances: BTreeMap<String, f64> = table
            .names()
            .filter_map(|name| {
                let profile = table.get(name).ok()?;
                Some((name.to_owned(), profile.nominal_resistance.value()))
            })
            .collect();

        Ok(Self {
            session: InstrumentSession::new(Box::new(bench.meter()), source),
            operator: Box::new(SimulatedOperator::new(bench, resistances)),
            probe: Box::new(FixedProbe(SIMULATED_TEMPERATURE)),
            pause: Box::new(NoPause),
            abort,
            #[cfg(feature = "visa")]
            _resource_manager: None,
        })
    }

    #[cfg(feature = "visa")]
    fn open_instruments(config: &Config, stimulus: Stimulus, abort: AbortFlag) -> Result<Self> {
        use std::io::BufReader;

        use dvm_zin::acquisition::ThreadSleep;
        use dvm_zin::instrument::gpib::{Fluke5720, Hp3458a, Keithley6430};
        use dvm_zin::instrument::transport::LineInstrument;
        use dvm_zin::instrument::{ManualProbe, Meter};
        use dvm_zin::procedure::ConsoleOperator;

        let addresses = &config.instruments;
        let timeout = std::time::Duration::from_millis(addresses.timeout_ms);
        let rm = visa_rs::DefaultRM::new().map_err(|e| Error::Instrument {
            instrument: "VISA resource manager".to_owned(),
            message: e.to_string(),
        })?;
        let open = |name: &str, resource: &str| {
            LineInstrument::<visa_rs::Instrument>::open_visa(&rm, name, resource, "\n", timeout)
        };

        let meter: Box<dyn Meter> = Box::new(Hp3458a::open(open("HP3458A", &addresses.meter)?)?);
        let source: Box<dyn Source> = match stimulus {
            Stimulus::Nothing => Box::new(NoSource),
            Stimulus::Voltage => Box::new(Fluke5720::open(open(
                "F5720A",
                &addresses.voltage_source,
            )?)?),
            Stimulus::Current => Box::new(Keithley6430::open(open(
                "K6430",
                &addresses.current_source,
            )?)?),
        };

        Ok(Self {
            session: InstrumentSession::new(meter, source),
            // Unbuffered, so the operator and the probe can share the terminal
            operator: Box::new(ConsoleOperator::new(
                BufReader::with_capacity(1, io::stdin()),
                io::stdout(),
            )),
            probe: Box::new(ManualProbe::new(
                BufReader::with_capacity(1, io::stdin()),
                io::stdout(),
            )),
            pause: Box::new(ThreadSleep::new(abort.clone())),
            abort,
            _resource_manager: Some(rm),
        })
    }

    #[cfg(not(feature = "visa"))]
    fn open_instruments(_config: &Config, _stimulus: Stimulus, _abort: AbortFlag) -> Result<Self> {
        Err(Error::Config(
            "built without the `visa` feature; only --simulate runs are available".to_owned(),
        ))
    }

    /// Run one test, offering to repeat it until it is stored, and report every attempt
    fn run(
        &mut self,
        cli: &Cli,
        config: &Config,
        table: &ResistorTable,
        test: impl FnMut(&mut Context<'_>, &mut InstrumentSession) -> Result<TestOutcome>,
    ) -> Result<Option<TestOutcome>> {
        let mut ctx = Context {
            config,
            resistors: table,
            probe: self.probe.as_mut(),
            operator: self.operator.as_mut(),
            pause: self.pause.as_mut(),
            abort: self.abort.clone(),
        };

        repeat_until_stored(&mut ctx, &mut self.session, test, |outcome| {
            report(outcome);
            cli.export
                .as_deref()
                .map_or(Ok(()), |directory| export(directory, outcome))
        })
    }
}

fn report(outcome: &TestOutcome) {
    let status = if outcome.committed {
        "stored"
    } else {
        "NOT stored"
    };
    println!("{} ({status})", outcome.key);
    println!("    R = {}", outcome.measurement.resistance);
    for (name, value) in &outcome.measurement.quantities {
        println!("    {name} = {value}");
    }
}

fn export(directory: &Path, outcome: &TestOutcome) -> Result<()> {
    let path = directory.join(format!("{}.csv", outcome.key));
    let acquisitions: Vec<_> = outcome
        .acquisitions
        .iter()
        .map(|(run, readings)| (*run, readings))
        .collect();
    write_readings_csv(&path, &acquisitions)
}
