//! Wavelength sweep of a tunable laser with power read-back.

use std::thread;
use std::time::Duration;

use tracing::info;

use crate::error::Result;
use crate::instruments::{LaserSource, PowerMeter};
use crate::sweep::{ParameterRange, Progress, ResultTable, TurnOffGuard, ensure_connected};

pub const LASER_SWEEP_HEADERS: [&str; 2] = ["Wavelength (nm)", "Power (dBm)"];

#[derive(Debug, Clone, PartialEq)]
pub struct LaserSweep {
    /// Nanometres.
    pub range: ParameterRange,
    /// Settle time between setting the wavelength and reading power.
    pub delay: Duration,
}

impl Default for LaserSweep {
    fn default() -> Self {
        Self {
            range: ParameterRange::new(1549.0, 1551.0, 0.01),
            delay: Duration::from_millis(100),
        }
    }
}

/// Step the laser over `sweep.range`, reading optical power at each point.
///
/// The laser is turned off when the sweep ends, whether it completed or not.
pub fn perform_laser_sweep<L>(
    laser: &L,
    sweep: &LaserSweep,
    progress: &mut dyn Progress,
) -> Result<ResultTable<2>>
where
    L: LaserSource + PowerMeter + ?Sized,
{
    let span = tracing::info_span!(
        "laser_sweep",
        start = sweep.range.start,
        stop = sweep.range.stop,
        step = sweep.range.step,
    );
    let _entered = span.enter();

    ensure_connected(laser, "laser")?;
    let wavelengths = sweep.range.grid()?;
    let total = wavelengths.len();

    let _turn_off = TurnOffGuard::new("laser", || LaserSource::turn_off(laser));
    LaserSource::initialize(laser)?;

    let mut table = ResultTable::new(LASER_SWEEP_HEADERS);
    for (index, wavelength) in wavelengths.into_iter().enumerate() {
        laser.set_wavelength(wavelength)?;
        thread::sleep(sweep.delay);
        let power = laser.measure_power()?;
        info!("Wavelength: {wavelength:.3} nm, Power: {power:.3} dBm");
        table.push([wavelength, power]);
        progress.advance(index + 1, total);
    }
    Ok(table)
}
