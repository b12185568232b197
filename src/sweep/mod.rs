//! Sweep-and-acquire control loops.
//!
//! Every sweep runs the same shape: check that its instruments are connected,
//! initialize them, walk the parameter grid (stimulus, settle, measure, record,
//! report progress) and finally turn the stimulus off no matter how the loop
//! ended. Steps are strictly sequential and block on instrument I/O.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::instruments::Instrument;

pub mod laser;
pub mod sourcemeter;

pub use laser::{LASER_SWEEP_HEADERS, LaserSweep, perform_laser_sweep};
pub use sourcemeter::{
    IV_HEADERS, IvSweep, LIV_CURRENT_HEADERS, LIV_HEADERS, LivCurrentSweep, LivSweep,
    measure_iv_curve, measure_liv_curve, measure_liv_curve_current, measure_resistance,
};

/// Relative slack when counting grid points, so a span that is a whole
/// number of steps up to rounding keeps its endpoint.
const GRID_EPSILON: f64 = 1e-9;

/// Upper bound on grid points in one sweep.
pub const MAX_GRID_POINTS: usize = 1_000_000;

/// `(start, stop, step)` describing an arithmetic sequence that includes both
/// endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterRange {
    pub start: f64,
    pub stop: f64,
    pub step: f64,
}

impl ParameterRange {
    pub fn new(start: f64, stop: f64, step: f64) -> Self {
        Self { start, stop, step }
    }

    /// The step must be non-zero and point from `start` towards `stop`.
    pub fn validate(&self) -> Result<()> {
        if !(self.start.is_finite() && self.stop.is_finite() && self.step.is_finite()) {
            return Err(Error::invalid_configuration(format!(
                "sweep range {self:?} is not finite"
            )));
        }
        if self.step == 0.0 {
            return Err(Error::invalid_configuration("sweep step must not be zero"));
        }
        let direction = self.stop - self.start;
        if direction != 0.0 && direction.signum() != self.step.signum() {
            return Err(Error::invalid_configuration(format!(
                "sweep step {} does not lead from {} to {}",
                self.step, self.start, self.stop
            )));
        }
        Ok(())
    }

    /// `|stop - start|`
    pub fn span(&self) -> f64 {
        (self.stop - self.start).abs()
    }

    /// Number of grid points: `floor(|stop - start| / |step|) + 1`, at most
    /// [`MAX_GRID_POINTS`].
    pub fn len(&self) -> Result<usize> {
        self.validate()?;
        let steps = (self.span() / self.step.abs() + GRID_EPSILON).floor();
        if !steps.is_finite() || steps >= MAX_GRID_POINTS as f64 {
            return Err(Error::invalid_configuration(format!(
                "sweep range {self:?} has more than {MAX_GRID_POINTS} points"
            )));
        }
        Ok(steps as usize + 1)
    }

    pub fn grid(&self) -> Result<Vec<f64>> {
        let len = self.len()?;
        Ok((0..len)
            .map(|i| self.start + i as f64 * self.step)
            .collect())
    }
}

/// Labelled measurement table with a fixed column count.
///
/// Rows stay in the order they were recorded, which is the grid order.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultTable<const N: usize> {
    headers: [String; N],
    rows: Vec<[f64; N]>,
}

impl<const N: usize> ResultTable<N> {
    pub fn new(headers: [&str; N]) -> Self {
        Self::with_headers(headers.map(String::from))
    }

    pub fn with_headers(headers: [String; N]) -> Self {
        Self {
            headers,
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, row: [f64; N]) {
        self.rows.push(row);
    }

    pub fn headers(&self) -> &[String; N] {
        &self.headers
    }

    pub fn rows(&self) -> &[[f64; N]] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Values of column `index`, or `None` past the last column.
    pub fn column(&self, index: usize) -> Option<Vec<f64>> {
        (index < N).then(|| self.rows.iter().map(|row| row[index]).collect())
    }
}

/// Observer told after every grid point how far the sweep has come.
pub trait Progress {
    fn advance(&mut self, completed: usize, total: usize);
}

impl<F: FnMut(usize, usize)> Progress for F {
    fn advance(&mut self, completed: usize, total: usize) {
        self(completed, total)
    }
}

/// Progress observer that ignores every update.
pub struct NoProgress;

impl Progress for NoProgress {
    fn advance(&mut self, _completed: usize, _total: usize) {}
}

/// Fail with [`Error::InstrumentNotConnected`] naming `role` unless connected.
pub fn ensure_connected<I: Instrument + ?Sized>(instrument: &I, role: &str) -> Result<()> {
    if instrument.is_connected() {
        Ok(())
    } else {
        Err(Error::InstrumentNotConnected {
            instrument: role.to_string(),
        })
    }
}

/// Turns the stimulus off when dropped, on every exit path of a sweep.
///
/// A failing turn-off is logged; it never replaces the error that ended the
/// sweep.
pub(crate) struct TurnOffGuard<F: FnMut() -> Result<()>> {
    role: &'static str,
    turn_off: F,
}

impl<F: FnMut() -> Result<()>> TurnOffGuard<F> {
    pub(crate) fn new(role: &'static str, turn_off: F) -> Self {
        Self { role, turn_off }
    }
}

impl<F: FnMut() -> Result<()>> Drop for TurnOffGuard<F> {
    fn drop(&mut self) {
        match (self.turn_off)() {
            Ok(()) => debug!(role = self.role, "stimulus turned off"),
            Err(err) => warn!(role = self.role, error = %err, "failed to turn off after sweep"),
        }
    }
}

/// Average of the samples returned for one reading.
pub(crate) fn mean(samples: &[f64]) -> f64 {
    samples.iter().sum::<f64>() / samples.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::cell::Cell;

    #[test]
    fn symmetric_voltage_grid() {
        let grid = ParameterRange::new(-1.0, 1.0, 0.5).grid().unwrap();
        assert_eq!(grid, vec![-1.0, -0.5, 0.0, 0.5, 1.0]);
    }

    #[test]
    fn fine_steps_keep_the_endpoint() {
        let range = ParameterRange::new(1549.0, 1551.0, 0.01);
        let grid = range.grid().unwrap();
        assert_eq!(grid.len(), 201);
        assert_relative_eq!(grid[0], 1549.0);
        assert_relative_eq!(*grid.last().unwrap(), 1551.0, epsilon = 1e-9);

        let grid = ParameterRange::new(0.0, 0.3, 0.1).grid().unwrap();
        assert_eq!(grid.len(), 4);
    }

    #[test]
    fn length_follows_floor_formula() {
        for (start, stop, step) in [
            (0.0, 1.0, 0.3),
            (0.0, 1.0, 0.25),
            (2.0, -2.0, -0.7),
            (5.0, 5.0, 1.0),
            (-3.0, 4.5, 1.5),
            (0.0, 0.01, 0.001),
        ] {
            let range = ParameterRange::new(start, stop, step);
            let expected = (range.span() / step.abs() + GRID_EPSILON).floor() as usize + 1;
            let grid = range.grid().unwrap();
            assert_eq!(grid.len(), expected, "{range:?}");
            assert_eq!(grid[0], start);
            let last = *grid.last().unwrap();
            assert!((stop - last).abs() < step.abs(), "{range:?} ends at {last}");
        }
    }

    #[test]
    fn descending_range_with_negative_step() {
        let grid = ParameterRange::new(1.0, 0.0, -0.25).grid().unwrap();
        assert_eq!(grid, vec![1.0, 0.75, 0.5, 0.25, 0.0]);
    }

    #[test]
    fn rejects_degenerate_ranges() {
        for range in [
            ParameterRange::new(0.0, 1.0, 0.0),
            ParameterRange::new(0.0, 1.0, -0.1),
            ParameterRange::new(1.0, 0.0, 0.1),
            ParameterRange::new(0.0, f64::NAN, 0.1),
            ParameterRange::new(0.0, f64::INFINITY, 0.1),
        ] {
            assert!(
                matches!(range.grid(), Err(Error::InvalidConfiguration(_))),
                "{range:?}"
            );
        }
    }

    #[test]
    fn rejects_grids_too_large_to_sweep() {
        for range in [
            ParameterRange::new(0.0, 1e300, 1e-300),
            ParameterRange::new(0.0, f64::MAX, f64::MIN_POSITIVE),
            ParameterRange::new(0.0, 1.0, 1e-15),
        ] {
            assert!(
                matches!(range.len(), Err(Error::InvalidConfiguration(_))),
                "{range:?}"
            );
        }

        let widest = ParameterRange::new(0.0, (MAX_GRID_POINTS - 1) as f64, 1.0);
        assert_eq!(widest.len().unwrap(), MAX_GRID_POINTS);
        let one_more = ParameterRange::new(0.0, MAX_GRID_POINTS as f64, 1.0);
        assert!(matches!(one_more.len(), Err(Error::InvalidConfiguration(_))));
    }

    #[test]
    fn table_keeps_insertion_order() {
        let mut table = ResultTable::new(["Voltage (V)", "Current (A)"]);
        table.push([0.0, 1.0]);
        table.push([-1.0, 2.0]);

        assert_eq!(table.headers(), &["Voltage (V)".to_string(), "Current (A)".to_string()]);
        assert_eq!(table.rows(), &[[0.0, 1.0], [-1.0, 2.0]]);
        assert_eq!(table.column(0).unwrap(), vec![0.0, -1.0]);
        assert!(table.column(2).is_none());
    }

    #[test]
    fn guard_runs_once_on_drop() {
        let calls = Cell::new(0);
        {
            let _guard = TurnOffGuard::new("laser", || {
                calls.set(calls.get() + 1);
                Err(Error::NotConnected)
            });
        }
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn closures_are_progress_observers() {
        let mut seen = Vec::new();
        {
            let observer: &mut dyn Progress =
                &mut |done: usize, total: usize| seen.push((done, total));
            observer.advance(1, 3);
            observer.advance(2, 3);
        }
        assert_eq!(seen, vec![(1, 3), (2, 3)]);
    }

    #[test]
    fn mean_of_samples() {
        assert_relative_eq!(mean(&[1.0, 2.0, 4.5]), 2.5);
    }
}
