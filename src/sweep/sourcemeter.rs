//! Source-meter driven sweeps: IV, LIV (voltage or current driven) and a
//! one-off resistance measurement.

use std::thread;
use std::time::Duration;

use tracing::{info, info_span};

use crate::error::Result;
use crate::instruments::{
    CurrentSource, LaserSource, PowerMeter, ResistanceSettings, SourceMeter, VoltageSource,
    WireMode,
};
use crate::sweep::{
    ParameterRange, Progress, ResultTable, TurnOffGuard, ensure_connected, mean,
};

pub const IV_HEADERS: [&str; 2] = ["Voltage (V)", "Current (A)"];
pub const LIV_HEADERS: [&str; 3] = ["Voltage (V)", "Current (A)", "Optical Power (dBm)"];
pub const LIV_CURRENT_HEADERS: [&str; 3] = ["Current (A)", "Voltage (V)", "Optical Power (dBm)"];

#[derive(Debug, Clone, PartialEq)]
pub struct IvSweep {
    /// Volts.
    pub range: ParameterRange,
    /// Current measurement range, amperes.
    pub current_range: f64,
    /// Compliance, amperes.
    pub current_limit: f64,
    pub wire_mode: WireMode,
    pub delay: Duration,
}

impl Default for IvSweep {
    fn default() -> Self {
        Self {
            range: ParameterRange::new(-1.0, 1.0, 0.01),
            current_range: 1e-3,
            current_limit: 0.01,
            wire_mode: WireMode::TwoWire,
            delay: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LivSweep {
    /// Volts.
    pub range: ParameterRange,
    pub current_range: f64,
    pub current_limit: f64,
    pub wire_mode: WireMode,
    /// Laser wavelength held for the whole sweep, nanometres.
    pub center_wavelength: f64,
    pub sourcemeter_delay: Duration,
    /// Extra settle time before reading the power meter.
    pub powermeter_delay: Duration,
}

impl Default for LivSweep {
    fn default() -> Self {
        Self {
            range: ParameterRange::new(-1.0, 1.0, 0.01),
            current_range: 1e-3,
            current_limit: 0.01,
            wire_mode: WireMode::TwoWire,
            center_wavelength: 1550.0,
            sourcemeter_delay: Duration::from_millis(100),
            powermeter_delay: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LivCurrentSweep {
    /// Amperes.
    pub range: ParameterRange,
    /// Voltage measurement range, volts.
    pub voltage_range: f64,
    /// Compliance, volts.
    pub voltage_limit: f64,
    pub wire_mode: WireMode,
    pub sourcemeter_delay: Duration,
    pub powermeter_delay: Duration,
}

impl Default for LivCurrentSweep {
    fn default() -> Self {
        Self {
            range: ParameterRange::new(0.0, 0.01, 0.001),
            voltage_range: 2.0,
            voltage_limit: 2.0,
            wire_mode: WireMode::TwoWire,
            sourcemeter_delay: Duration::from_millis(100),
            powermeter_delay: Duration::from_millis(100),
        }
    }
}

/// Source range wide enough for every level of `range`.
fn source_range(range: &ParameterRange) -> f64 {
    range.span() + range.step.abs()
}

/// Sweep voltage, reading current at each point.
pub fn measure_iv_curve<S>(
    sourcemeter: &S,
    sweep: &IvSweep,
    progress: &mut dyn Progress,
) -> Result<ResultTable<2>>
where
    S: SourceMeter + ?Sized,
{
    let span = info_span!("iv_sweep", start = sweep.range.start, stop = sweep.range.stop);
    let _entered = span.enter();

    ensure_connected(sourcemeter, "source meter")?;
    let voltages = sweep.range.grid()?;
    let total = voltages.len();

    let _turn_off = TurnOffGuard::new("source meter", || sourcemeter.turn_off());
    sourcemeter.initialize(sweep.wire_mode)?;

    let mut table = ResultTable::new(IV_HEADERS);
    for (index, voltage) in voltages.into_iter().enumerate() {
        let current = mean(&sourcemeter.source_voltage_and_read_current(&VoltageSource {
            level: voltage,
            range: source_range(&sweep.range),
            current_range: sweep.current_range,
            current_limit: sweep.current_limit,
            delay: sweep.delay,
        })?);
        info!("Voltage: {voltage:.3} V, Current: {current:.3e} A");
        table.push([voltage, current]);
        progress.advance(index + 1, total);
    }
    Ok(table)
}

/// Sweep voltage, reading current and then optical power at each point while
/// the laser holds `center_wavelength`.
pub fn measure_liv_curve<S, P, L>(
    sourcemeter: &S,
    powermeter: &P,
    laser: &L,
    sweep: &LivSweep,
    progress: &mut dyn Progress,
) -> Result<ResultTable<3>>
where
    S: SourceMeter + ?Sized,
    P: PowerMeter + ?Sized,
    L: LaserSource + ?Sized,
{
    let span = info_span!("liv_sweep", start = sweep.range.start, stop = sweep.range.stop);
    let _entered = span.enter();

    ensure_connected(sourcemeter, "source meter")?;
    ensure_connected(powermeter, "power meter")?;
    ensure_connected(laser, "laser")?;
    let voltages = sweep.range.grid()?;
    let total = voltages.len();

    let _turn_off = TurnOffGuard::new("source meter", || sourcemeter.turn_off());
    sourcemeter.initialize(sweep.wire_mode)?;
    laser.initialize()?;
    laser.set_wavelength(sweep.center_wavelength)?;
    powermeter.initialize()?;

    let mut table = ResultTable::new(LIV_HEADERS);
    for (index, voltage) in voltages.into_iter().enumerate() {
        let current = mean(&sourcemeter.source_voltage_and_read_current(&VoltageSource {
            level: voltage,
            range: source_range(&sweep.range),
            current_range: sweep.current_range,
            current_limit: sweep.current_limit,
            delay: sweep.sourcemeter_delay,
        })?);
        thread::sleep(sweep.powermeter_delay);
        let power = powermeter.measure_power()?;
        info!("Voltage: {voltage:.3} V, Current: {current:.3e} A, Optical Power: {power:.3} dBm");
        table.push([voltage, current, power]);
        progress.advance(index + 1, total);
    }
    Ok(table)
}

/// Sweep drive current, reading voltage and then optical power at each point.
/// The emission wavelength is fixed by the device, so no laser is involved.
pub fn measure_liv_curve_current<S, P>(
    sourcemeter: &S,
    powermeter: &P,
    sweep: &LivCurrentSweep,
    progress: &mut dyn Progress,
) -> Result<ResultTable<3>>
where
    S: SourceMeter + ?Sized,
    P: PowerMeter + ?Sized,
{
    let span = info_span!(
        "liv_current_sweep",
        start = sweep.range.start,
        stop = sweep.range.stop
    );
    let _entered = span.enter();

    ensure_connected(sourcemeter, "source meter")?;
    ensure_connected(powermeter, "power meter")?;
    let currents = sweep.range.grid()?;
    let total = currents.len();

    let _turn_off = TurnOffGuard::new("source meter", || sourcemeter.turn_off());
    sourcemeter.initialize(sweep.wire_mode)?;
    powermeter.initialize()?;

    let mut table = ResultTable::new(LIV_CURRENT_HEADERS);
    for (index, current) in currents.into_iter().enumerate() {
        let voltage = mean(&sourcemeter.source_current_and_read_voltage(&CurrentSource {
            level: current,
            range: source_range(&sweep.range),
            voltage_range: sweep.voltage_range,
            voltage_limit: sweep.voltage_limit,
            delay: sweep.sourcemeter_delay,
        })?);
        thread::sleep(sweep.powermeter_delay);
        let power = powermeter.measure_power()?;
        info!("Current: {current:.3e} A, Voltage: {voltage:.3} V, Optical Power: {power:.3} dBm");
        table.push([current, voltage, power]);
        progress.advance(index + 1, total);
    }
    Ok(table)
}

/// Initialize for `settings.wire_mode` and take one configured resistance
/// reading, turning the output off afterwards.
pub fn measure_resistance<S>(sourcemeter: &S, settings: &ResistanceSettings) -> Result<Vec<f64>>
where
    S: SourceMeter + ?Sized,
{
    let span = info_span!("resistance", range = settings.range, mode = %settings.mode);
    let _entered = span.enter();

    ensure_connected(sourcemeter, "source meter")?;
    let _turn_off = TurnOffGuard::new("source meter", || sourcemeter.turn_off());
    sourcemeter.initialize(settings.wire_mode)?;
    let samples = sourcemeter.read_resistance_configured(settings)?;
    info!("Resistance: {samples:?} ohm");
    Ok(samples)
}
