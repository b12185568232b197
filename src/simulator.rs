//! Simulated bench: a source-meter driving a laser diode whose light reaches
//! the power meter of a lightwave multimeter.
//!
//! Each instrument is a small state machine fed by the SCPI lines its driver
//! writes. The two share the diode drive current, so an LIV sweep sees optical
//! power rise with current above threshold.

use std::cell::Cell;
use std::rc::Rc;

use tracing::debug;

use crate::config::InstrumentsConfig;
use crate::transport::mock::MockBus;

const SOURCEMETER_IDN: &str = "KEITHLEY INSTRUMENTS INC.,MODEL 2400,SIM0001,C32 (simulated)";
const MULTIMETER_IDN: &str = "Agilent Technologies,8163B,SIM0002,V5.25 (simulated)";

/// Diode saturation current, amperes.
const SATURATION_CURRENT: f64 = 1e-12;
/// Ideality factor times thermal voltage, volts.
const DIODE_SLOPE: f64 = 0.05;
/// Parallel leakage, ohms.
const SHUNT_RESISTANCE: f64 = 1e6;
/// Forward voltage and series resistance seen when sourcing current.
const KNEE_VOLTAGE: f64 = 0.9;
const SERIES_RESISTANCE: f64 = 50.0;
/// Resistance reported by resistance readings, ohms.
const DUT_RESISTANCE: f64 = 1.2e3;

const LASING_THRESHOLD: f64 = 1e-3;
/// Optical slope efficiency above threshold, W/A.
const SLOPE_EFFICIENCY: f64 = 0.2;
/// Tunable laser line seen by the power meter.
const LASER_PEAK_MW: f64 = 0.5;
const LASER_CENTER_NM: f64 = 1550.0;
const LASER_WIDTH_NM: f64 = 0.4;
/// Detector floor, milliwatts.
const NOISE_FLOOR_MW: f64 = 1e-9;

/// Register a simulated source-meter and multimeter at the configured
/// addresses on a fresh bus.
pub fn simulated_bench(instruments: &InstrumentsConfig) -> MockBus {
    let bus = MockBus::new();
    let drive_current = Rc::new(Cell::new(0.0));

    let mut sourcemeter = SourceMeterModel::new(Rc::clone(&drive_current));
    bus.add_device(&instruments.sourcemeter.address, move |line| {
        sourcemeter.respond(line)
    });

    let multimeter = &instruments.multimeter;
    let mut multimeter = MultimeterModel::new(
        multimeter.laser_slot,
        multimeter.power_slot,
        multimeter.power_channel,
        drive_current,
    );
    bus.add_device(&instruments.multimeter.address, move |line| {
        multimeter.respond(line)
    });

    debug!("simulated bench ready");
    bus
}

/// `(header, argument)` of a SCPI line, header lower-cased.
fn split_command(line: &str) -> (String, &str) {
    match line.trim().split_once(' ') {
        Some((header, argument)) => (header.to_ascii_lowercase(), argument.trim()),
        None => (line.trim().to_ascii_lowercase(), ""),
    }
}

fn number(argument: &str) -> Option<f64> {
    argument.trim_end_matches(|c: char| c.is_ascii_alphabetic()).parse().ok()
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Element {
    Current,
    Voltage,
    Resistance,
}

struct SourceMeterModel {
    output_on: bool,
    sourcing_current: bool,
    voltage_level: f64,
    current_level: f64,
    current_limit: f64,
    voltage_limit: f64,
    element: Element,
    drive_current: Rc<Cell<f64>>,
}

impl SourceMeterModel {
    fn new(drive_current: Rc<Cell<f64>>) -> Self {
        Self {
            output_on: false,
            sourcing_current: false,
            voltage_level: 0.0,
            current_level: 0.0,
            current_limit: 0.105,
            voltage_limit: 21.0,
            element: Element::Voltage,
            drive_current,
        }
    }

    fn respond(&mut self, line: &str) -> String {
        let (header, argument) = split_command(line);
        match header.as_str() {
            "*idn?" => return SOURCEMETER_IDN.to_string(),
            "*opt?" => return String::new(),
            "syst:err?" => return "0,\"No error\"".to_string(),
            "*rst" => *self = Self::new(Rc::clone(&self.drive_current)),
            ":outp" => self.output_on = argument.eq_ignore_ascii_case("ON"),
            ":sour:func" => self.sourcing_current = argument.eq_ignore_ascii_case("CURR"),
            ":sour:volt" | ":sour:volt:lev" => {
                self.voltage_level = number(argument).unwrap_or(self.voltage_level)
            }
            ":sour:curr" | ":sour:curr:lev" => {
                self.current_level = number(argument).unwrap_or(self.current_level)
            }
            ":sens:curr:prot" => self.current_limit = number(argument).unwrap_or(self.current_limit),
            ":sens:volt:prot" => self.voltage_limit = number(argument).unwrap_or(self.voltage_limit),
            ":form:elem" => {
                self.element = match argument.to_ascii_uppercase().as_str() {
                    "CURR" => Element::Current,
                    "RES" => Element::Resistance,
                    _ => Element::Voltage,
                }
            }
            ":read?" => return format!("{:E}", self.read()),
            _ => {}
        }
        if !self.output_on {
            self.drive_current.set(0.0);
        }
        "0".to_string()
    }

    fn read(&self) -> f64 {
        let (voltage, current) = if !self.output_on {
            (0.0, 0.0)
        } else if self.sourcing_current {
            let voltage = (KNEE_VOLTAGE + SERIES_RESISTANCE * self.current_level)
                .clamp(-self.voltage_limit, self.voltage_limit);
            (voltage, self.current_level)
        } else {
            let v = self.voltage_level;
            let current = SATURATION_CURRENT * ((v / DIODE_SLOPE).exp() - 1.0) + v / SHUNT_RESISTANCE;
            (v, current.clamp(-self.current_limit, self.current_limit))
        };
        self.drive_current.set(current);
        match self.element {
            Element::Current => current,
            Element::Voltage => voltage,
            Element::Resistance => DUT_RESISTANCE,
        }
    }
}

struct MultimeterModel {
    laser_slot: u8,
    power_query: String,
    laser_on: bool,
    wavelength_nm: f64,
    drive_current: Rc<Cell<f64>>,
}

impl MultimeterModel {
    fn new(laser_slot: u8, power_slot: u8, power_channel: u8, drive_current: Rc<Cell<f64>>) -> Self {
        Self {
            laser_slot,
            power_query: format!("fetch{power_slot}:chan{power_channel}:pow?"),
            laser_on: false,
            wavelength_nm: LASER_CENTER_NM,
            drive_current,
        }
    }

    fn respond(&mut self, line: &str) -> String {
        let (header, argument) = split_command(line);
        let laser = format!("sour{}", self.laser_slot);
        match header.as_str() {
            "*idn?" => return MULTIMETER_IDN.to_string(),
            "*opt?" => return String::new(),
            h if h == format!("{laser}:pow:stat") => self.laser_on = argument == "1",
            h if h == format!("{laser}:wav") => {
                self.wavelength_nm = number(argument).unwrap_or(self.wavelength_nm)
            }
            h if h == self.power_query => return format!("{:E}", self.power_dbm()),
            _ => {}
        }
        "0".to_string()
    }

    fn power_dbm(&self) -> f64 {
        let mut milliwatts = NOISE_FLOOR_MW;
        if self.laser_on {
            let detuning = (self.wavelength_nm - LASER_CENTER_NM) / LASER_WIDTH_NM;
            milliwatts += LASER_PEAK_MW * (-0.5 * detuning * detuning).exp();
        }
        let above_threshold = (self.drive_current.get() - LASING_THRESHOLD).max(0.0);
        milliwatts += SLOPE_EFFICIENCY * above_threshold * 1e3;
        10.0 * milliwatts.log10()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruments::{
        Agilent8163, Instrument, Keithley2400, LaserSource, PowerMeter, SourceMeter,
    };
    use crate::instruments::{CurrentSource, ResistanceSettings, VoltageSource, WireMode};
    use crate::transport::ManagerHandle;
    use approx::assert_relative_eq;
    use std::time::Duration;

    fn bench() -> (MockBus, InstrumentsConfig) {
        let config = InstrumentsConfig::default();
        (simulated_bench(&config), config)
    }

    #[test]
    fn drivers_connect_to_the_simulated_bench() {
        let (bus, config) = bench();
        let sm = Keithley2400::builder(&config.sourcemeter.address)
            .manager(ManagerHandle::shared(Rc::new(bus.clone())))
            .connect()
            .unwrap();
        let mm = Agilent8163::builder(&config.multimeter.address)
            .manager(ManagerHandle::shared(Rc::new(bus)))
            .connect()
            .unwrap();

        assert!(sm.identity().contains("MODEL 2400"));
        assert!(mm.identity().contains("8163B"));
    }

    #[test]
    fn diode_conducts_forward_only() {
        let (bus, config) = bench();
        let sm = Keithley2400::builder(&config.sourcemeter.address)
            .manager(ManagerHandle::owned(bus))
            .connect()
            .unwrap();
        sm.initialize(WireMode::TwoWire).unwrap();
        let at = |level: f64| {
            sm.source_voltage_and_read_current(&VoltageSource {
                level,
                range: 2.0,
                current_range: 1e-3,
                current_limit: 0.01,
                delay: Duration::ZERO,
            })
            .unwrap()[0]
        };

        let reverse = at(-1.0);
        let forward = at(1.0);
        assert!(reverse < 0.0 && reverse.abs() < 1e-5);
        assert!(forward > 1e-4);
        assert!(forward <= 0.01);
    }

    #[test]
    fn current_source_reads_back_voltage_and_resistance() {
        let (bus, config) = bench();
        let sm = Keithley2400::builder(&config.sourcemeter.address)
            .manager(ManagerHandle::owned(bus))
            .connect()
            .unwrap();
        let voltage = sm
            .source_current_and_read_voltage(&CurrentSource {
                level: 0.002,
                range: 0.011,
                voltage_range: 2.0,
                voltage_limit: 2.0,
                delay: Duration::ZERO,
            })
            .unwrap();
        assert_relative_eq!(voltage[0], 1.0, epsilon = 1e-9);

        let resistance = sm
            .read_resistance_configured(&ResistanceSettings {
                delay: Duration::ZERO,
                ..ResistanceSettings::default()
            })
            .unwrap();
        assert_eq!(resistance, vec![DUT_RESISTANCE]);
    }

    #[test]
    fn laser_line_peaks_at_center() {
        let (bus, config) = bench();
        let mm = Agilent8163::builder(&config.multimeter.address)
            .manager(ManagerHandle::owned(bus))
            .connect()
            .unwrap();
        LaserSource::initialize(&mm).unwrap();

        mm.set_wavelength(1550.0).unwrap();
        let peak = mm.measure_power().unwrap();
        mm.set_wavelength(1551.0).unwrap();
        let wing = mm.measure_power().unwrap();
        LaserSource::turn_off(&mm).unwrap();
        let dark = mm.measure_power().unwrap();

        assert_relative_eq!(peak, 10.0 * (0.5f64 + 1e-9).log10(), epsilon = 1e-6);
        assert!(wing < peak);
        assert!(dark < -80.0);
    }
}
