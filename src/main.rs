use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{Context, Result, anyhow};
use clap::{ArgAction, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use lightwave_sweep::config::{Config, OutputConfig, load_config};
use lightwave_sweep::instruments::{Agilent8163, Instrument, Keithley2400};
use lightwave_sweep::logging;
use lightwave_sweep::plot::plot_measurements;
use lightwave_sweep::simulator::simulated_bench;
use lightwave_sweep::storage::save_raw_measurements;
use lightwave_sweep::sweep::{
    ParameterRange, Progress, ResultTable, measure_iv_curve, measure_liv_curve,
    measure_liv_curve_current, measure_resistance, perform_laser_sweep,
};
use lightwave_sweep::transport::{ManagerHandle, ResourceManager, available_resources};

#[derive(Parser, Debug)]
#[command(name = "lightwave_sweep", version, about = "Wavelength, IV and LIV sweeps on a SCPI bench")]
struct Args {
    /// YAML bench configuration; built-in defaults when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Run against a simulated bench instead of real instruments
    #[arg(long, global = true)]
    simulate: bool,

    /// Debug logging, including every command sent
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Save data but skip the chart
    #[arg(long, global = true)]
    no_plot: bool,

    /// Query the source meter's error queue after the measurement
    #[arg(long, global = true)]
    check_errors: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List instrument addresses visible on the bus
    Resources,

    /// Step the laser wavelength and record optical power
    LaserSweep {
        /// Base name of the CSV and chart files
        #[arg(short, long, default_value = "laser_sweep")]
        name: String,
    },

    /// Source voltage, record current
    Iv {
        #[arg(short, long, default_value = "iv_curve")]
        name: String,
    },

    /// Source voltage, record current and optical power at a fixed wavelength
    Liv {
        #[arg(short, long, default_value = "liv_curve")]
        name: String,
    },

    /// Source current, record voltage and optical power
    LivCurrent {
        #[arg(short, long, default_value = "liv_curve_current")]
        name: String,
    },

    /// Take one configured resistance reading
    Resistance,
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.verbose).map_err(|err| anyhow!("failed to set up logging: {err}"))?;

    let config = match &args.config {
        Some(path) => load_config(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => Config::default(),
    };

    let manager = resource_manager(&args, &config)?;
    let result = run(&args, &config, &manager);
    if let Err(err) = manager.close() {
        warn!(error = %err, "failed to close resource manager");
    }
    result
}

fn resource_manager(args: &Args, config: &Config) -> Result<Rc<dyn ResourceManager>> {
    if args.simulate {
        info!("Simulation mode: no hardware will be contacted.");
        return Ok(Rc::new(simulated_bench(&config.instruments)));
    }
    visa_manager()
}

#[cfg(feature = "visa")]
fn visa_manager() -> Result<Rc<dyn ResourceManager>> {
    let manager = lightwave_sweep::transport::visa::VisaResourceManager::new()
        .context("failed to open the VISA resource manager")?;
    Ok(Rc::new(manager))
}

#[cfg(not(feature = "visa"))]
fn visa_manager() -> Result<Rc<dyn ResourceManager>> {
    Err(anyhow!(
        "built without the `visa` feature: rerun with --simulate or rebuild with `--features visa`"
    ))
}

fn run(args: &Args, config: &Config, manager: &Rc<dyn ResourceManager>) -> Result<()> {
    let output = Output {
        config: &config.output,
        plot: config.output.plot && !args.no_plot,
    };

    match &args.command {
        Command::Resources => {
            available_resources(&**manager);
        }
        Command::LaserSweep { name } => {
            let sweep = config.laser_sweep.to_sweep()?;
            let multimeter = connect_multimeter(config, manager)?;
            let table = with_progress(&sweep.range, "nm", |progress| {
                perform_laser_sweep(&multimeter, &sweep, progress)
            })?;
            output.save(&table, name)?;
        }
        Command::Iv { name } => {
            let sweep = config.iv_sweep.to_sweep()?;
            let sourcemeter = connect_sourcemeter(config, manager)?;
            let table = with_progress(&sweep.range, "V", |progress| {
                measure_iv_curve(&sourcemeter, &sweep, progress)
            });
            check_errors(args, &sourcemeter);
            output.save(&table?, name)?;
        }
        Command::Liv { name } => {
            let sweep = config.liv_sweep.to_sweep()?;
            let sourcemeter = connect_sourcemeter(config, manager)?;
            let multimeter = connect_multimeter(config, manager)?;
            let table = with_progress(&sweep.range, "V", |progress| {
                measure_liv_curve(&sourcemeter, &multimeter, &multimeter, &sweep, progress)
            });
            check_errors(args, &sourcemeter);
            output.save(&table?, name)?;
        }
        Command::LivCurrent { name } => {
            let sweep = config.liv_current_sweep.to_sweep()?;
            let sourcemeter = connect_sourcemeter(config, manager)?;
            let multimeter = connect_multimeter(config, manager)?;
            let table = with_progress(&sweep.range, "A", |progress| {
                measure_liv_curve_current(&sourcemeter, &multimeter, &sweep, progress)
            });
            check_errors(args, &sourcemeter);
            output.save(&table?, name)?;
        }
        Command::Resistance => {
            let settings = config.resistance.to_settings()?;
            let sourcemeter = connect_sourcemeter(config, manager)?;
            let samples = measure_resistance(&sourcemeter, &settings);
            check_errors(args, &sourcemeter);
            let samples = samples?;
            info!(
                "Resistance ({} sample(s)): {}",
                samples.len(),
                samples
                    .iter()
                    .map(|ohms| format!("{ohms:.6e} ohm"))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
    }
    Ok(())
}

fn connect_sourcemeter(config: &Config, manager: &Rc<dyn ResourceManager>) -> Result<Keithley2400> {
    let instruments = &config.instruments;
    let address = &instruments.sourcemeter.address;
    let sourcemeter = Keithley2400::builder(address)
        .manager(ManagerHandle::shared(Rc::clone(manager)))
        .echo(instruments.echo)
        .connect()
        .with_context(|| format!("failed to connect to the source meter at {address}"))?;
    info!("{sourcemeter}");
    Ok(sourcemeter)
}

fn connect_multimeter(config: &Config, manager: &Rc<dyn ResourceManager>) -> Result<Agilent8163> {
    let instruments = &config.instruments;
    let settings = &instruments.multimeter;
    let multimeter = Agilent8163::builder(&settings.address)
        .laser_slot(settings.laser_slot)
        .power_slot(settings.power_slot)
        .power_channel(settings.power_channel)
        .manager(ManagerHandle::shared(Rc::clone(manager)))
        .echo(instruments.echo)
        .connect()
        .with_context(|| {
            format!(
                "failed to connect to the lightwave multimeter at {}",
                settings.address
            )
        })?;
    info!("{multimeter}");
    Ok(multimeter)
}

fn check_errors(args: &Args, sourcemeter: &Keithley2400) {
    if !args.check_errors || !sourcemeter.is_connected() {
        return;
    }
    match sourcemeter.error_status() {
        Ok(status) => info!("Source meter error queue: {status}"),
        Err(err) => warn!(error = %err, "failed to read the source meter error queue"),
    }
}

/// Run `sweep` behind a terminal progress bar.
fn with_progress<T>(
    range: &ParameterRange,
    unit: &str,
    sweep: impl FnOnce(&mut dyn Progress) -> lightwave_sweep::Result<T>,
) -> lightwave_sweep::Result<T> {
    let bar = ProgressBar::new(range.len().unwrap_or(0) as u64);
    let style = ProgressStyle::with_template("{msg} [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
    bar.set_style(style);
    bar.set_message(format!("Sweeping {} → {} {unit}", range.start, range.stop));

    let result = sweep(&mut |completed: usize, total: usize| {
        bar.set_length(total as u64);
        bar.set_position(completed as u64);
    });
    match &result {
        Ok(_) => bar.finish(),
        Err(_) => bar.abandon(),
    }
    result
}

struct Output<'a> {
    config: &'a OutputConfig,
    plot: bool,
}

impl Output<'_> {
    fn save<const N: usize>(&self, table: &ResultTable<N>, name: &str) -> Result<()> {
        save_raw_measurements(table, &self.config.data_dir, name)
            .with_context(|| format!("failed to save {name}"))?;
        if self.plot {
            plot_measurements(table, &self.config.plot_dir, name)
                .with_context(|| format!("failed to plot {name}"))?;
        }
        Ok(())
    }
}
