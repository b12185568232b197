//! YAML bench configuration.
//!
//! Every key is optional. A missing section or field takes the value the
//! bench normally runs with, so an empty file is a valid configuration:
//!
//! ```yaml
//! instruments:
//!   sourcemeter:
//!     address: GPIB0::24::INSTR
//!   multimeter:
//!     address: GPIB0::20::INSTR
//!     laser_slot: 1
//!     power_slot: 2
//!     power_channel: 1
//! iv_sweep:
//!   start: -1.0
//!   stop: 1.0
//!   step: 0.01
//!   wire_mode: 4
//! output:
//!   data_dir: data/raw
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::instruments::{
    ResistanceMode, ResistanceSettings, SourceFunction, WireMode, agilent8163, keithley2400,
};
use crate::plot::PLOT_DIR;
use crate::storage::RAW_DATA_DIR;
use crate::sweep::{IvSweep, LaserSweep, LivCurrentSweep, LivSweep, ParameterRange};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub instruments: InstrumentsConfig,
    pub laser_sweep: LaserSweepConfig,
    pub iv_sweep: IvSweepConfig,
    pub liv_sweep: LivSweepConfig,
    pub liv_current_sweep: LivCurrentSweepConfig,
    pub resistance: ResistanceConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InstrumentsConfig {
    pub sourcemeter: SourceMeterConfig,
    pub multimeter: MultimeterConfig,
    /// Log every command and reply at info instead of debug.
    pub echo: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceMeterConfig {
    pub address: String,
}

impl Default for SourceMeterConfig {
    fn default() -> Self {
        Self {
            address: keithley2400::DEFAULT_ADDRESS.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MultimeterConfig {
    pub address: String,
    pub laser_slot: u8,
    pub power_slot: u8,
    pub power_channel: u8,
}

impl Default for MultimeterConfig {
    fn default() -> Self {
        Self {
            address: agilent8163::DEFAULT_ADDRESS.to_string(),
            laser_slot: 1,
            power_slot: 2,
            power_channel: 1,
        }
    }
}

/// Wavelengths in nanometres, delay in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LaserSweepConfig {
    pub start: f64,
    pub stop: f64,
    pub step: f64,
    pub delay: f64,
}

impl Default for LaserSweepConfig {
    fn default() -> Self {
        Self {
            start: 1549.0,
            stop: 1551.0,
            step: 0.01,
            delay: 0.1,
        }
    }
}

impl LaserSweepConfig {
    pub fn to_sweep(&self) -> Result<LaserSweep> {
        Ok(LaserSweep {
            range: ParameterRange::new(self.start, self.stop, self.step),
            delay: seconds("laser_sweep.delay", self.delay)?,
        })
    }
}

/// Voltages in volts, currents in amperes, delay in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IvSweepConfig {
    pub start: f64,
    pub stop: f64,
    pub step: f64,
    pub current_range: f64,
    pub current_limit: f64,
    /// 2 or 4.
    pub wire_mode: u8,
    pub delay: f64,
}

impl Default for IvSweepConfig {
    fn default() -> Self {
        Self {
            start: -1.0,
            stop: 1.0,
            step: 0.01,
            current_range: 1e-3,
            current_limit: 0.01,
            wire_mode: 2,
            delay: 0.1,
        }
    }
}

impl IvSweepConfig {
    pub fn to_sweep(&self) -> Result<IvSweep> {
        Ok(IvSweep {
            range: ParameterRange::new(self.start, self.stop, self.step),
            current_range: self.current_range,
            current_limit: self.current_limit,
            wire_mode: WireMode::try_from(self.wire_mode)?,
            delay: seconds("iv_sweep.delay", self.delay)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LivSweepConfig {
    pub start: f64,
    pub stop: f64,
    pub step: f64,
    pub current_range: f64,
    pub current_limit: f64,
    pub wire_mode: u8,
    /// Nanometres.
    pub center_wavelength: f64,
    pub sourcemeter_delay: f64,
    pub powermeter_delay: f64,
}

impl Default for LivSweepConfig {
    fn default() -> Self {
        Self {
            start: -1.0,
            stop: 1.0,
            step: 0.01,
            current_range: 1e-3,
            current_limit: 0.01,
            wire_mode: 2,
            center_wavelength: 1550.0,
            sourcemeter_delay: 0.1,
            powermeter_delay: 0.1,
        }
    }
}

impl LivSweepConfig {
    pub fn to_sweep(&self) -> Result<LivSweep> {
        Ok(LivSweep {
            range: ParameterRange::new(self.start, self.stop, self.step),
            current_range: self.current_range,
            current_limit: self.current_limit,
            wire_mode: WireMode::try_from(self.wire_mode)?,
            center_wavelength: self.center_wavelength,
            sourcemeter_delay: seconds("liv_sweep.sourcemeter_delay", self.sourcemeter_delay)?,
            powermeter_delay: seconds("liv_sweep.powermeter_delay", self.powermeter_delay)?,
        })
    }
}

/// Currents in amperes, voltages in volts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LivCurrentSweepConfig {
    pub start: f64,
    pub stop: f64,
    pub step: f64,
    pub voltage_range: f64,
    pub voltage_limit: f64,
    pub wire_mode: u8,
    pub sourcemeter_delay: f64,
    pub powermeter_delay: f64,
}

impl Default for LivCurrentSweepConfig {
    fn default() -> Self {
        Self {
            start: 0.0,
            stop: 0.01,
            step: 0.001,
            voltage_range: 2.0,
            voltage_limit: 2.0,
            wire_mode: 2,
            sourcemeter_delay: 0.1,
            powermeter_delay: 0.1,
        }
    }
}

impl LivCurrentSweepConfig {
    pub fn to_sweep(&self) -> Result<LivCurrentSweep> {
        Ok(LivCurrentSweep {
            range: ParameterRange::new(self.start, self.stop, self.step),
            voltage_range: self.voltage_range,
            voltage_limit: self.voltage_limit,
            wire_mode: WireMode::try_from(self.wire_mode)?,
            sourcemeter_delay: seconds(
                "liv_current_sweep.sourcemeter_delay",
                self.sourcemeter_delay,
            )?,
            powermeter_delay: seconds(
                "liv_current_sweep.powermeter_delay",
                self.powermeter_delay,
            )?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResistanceConfig {
    /// Ohms.
    pub range: f64,
    pub mode: ResistanceMode,
    pub offset_compensation: bool,
    pub voltage_protection: f64,
    pub current_protection: f64,
    pub source_function: SourceFunction,
    pub source_level: f64,
    pub wire_mode: u8,
    pub delay: f64,
}

impl Default for ResistanceConfig {
    fn default() -> Self {
        let settings = ResistanceSettings::default();
        Self {
            range: settings.range,
            mode: settings.mode,
            offset_compensation: settings.offset_compensation,
            voltage_protection: settings.voltage_protection,
            current_protection: settings.current_protection,
            source_function: settings.source_function,
            source_level: settings.source_level,
            wire_mode: settings.wire_mode.into(),
            delay: settings.delay.as_secs_f64(),
        }
    }
}

impl ResistanceConfig {
    pub fn to_settings(&self) -> Result<ResistanceSettings> {
        Ok(ResistanceSettings {
            range: self.range,
            mode: self.mode,
            offset_compensation: self.offset_compensation,
            voltage_protection: self.voltage_protection,
            current_protection: self.current_protection,
            source_function: self.source_function,
            source_level: self.source_level,
            wire_mode: WireMode::try_from(self.wire_mode)?,
            delay: seconds("resistance.delay", self.delay)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    pub data_dir: PathBuf,
    pub plot_dir: PathBuf,
    /// Render a chart next to every saved table.
    pub plot: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(RAW_DATA_DIR),
            plot_dir: PathBuf::from(PLOT_DIR),
            plot: true,
        }
    }
}

fn seconds(key: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| Error::invalid_configuration(format!("{key}: {value} is not a valid delay")))
}

/// Read and parse the configuration file at `path`.
pub fn load_config(path: &Path) -> Result<Config> {
    let text = fs::read_to_string(path)?;
    let config = if text.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(&text)?
    };
    debug!(path = %path.display(), "configuration loaded");
    Ok(config)
}

/// Read `path` as an untyped YAML document (nested mappings, sequences and
/// scalars).
pub fn load_document(path: &Path) -> Result<serde_yaml::Value> {
    let text = fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&text)?)
}
