//! Line chart of a sweep: first column against the second.

use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use plotters::prelude::*;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::sweep::ResultTable;

/// Default output directory, relative to the working directory.
pub const PLOT_DIR: &str = "plots";

const SIZE: (u32, u32) = (800, 500);

/// Render the stimulus (column 0) against the primary response (column 1)
/// to `<dir>/<figure_name>.svg`.
///
/// Tables without a single finite point are skipped and yield `Ok(None)`.
pub fn plot_measurements<const N: usize>(
    table: &ResultTable<N>,
    dir: &Path,
    figure_name: &str,
) -> Result<Option<PathBuf>> {
    let [x_label, y_label, ..] = table.headers().as_slice() else {
        return Err(Error::invalid_configuration(
            "a plot needs at least two columns",
        ));
    };
    let points: Vec<(f64, f64)> = table
        .rows()
        .iter()
        .map(|row| (row[0], row[1]))
        .filter(|(x, y)| x.is_finite() && y.is_finite())
        .collect();
    if points.is_empty() {
        warn!("No results to plot.");
        return Ok(None);
    }

    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{figure_name}.svg"));
    draw(&path, figure_name, x_label, y_label, &points)
        .map_err(|err| Error::Plot(err.to_string()))?;

    info!("Plot saved as {}", path.display());
    Ok(Some(path))
}

fn draw(
    path: &Path,
    title: &str,
    x_label: &str,
    y_label: &str,
    points: &[(f64, f64)],
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let x_range = padded(points.iter().map(|(x, _)| *x));
    let y_range = padded(points.iter().map(|(_, y)| *y));

    let root = SVGBackend::new(path, SIZE).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", 24))
        .margin(15)
        .x_label_area_size(45)
        .y_label_area_size(80)
        .build_cartesian_2d(x_range, y_range)?;

    chart
        .configure_mesh()
        .x_desc(x_label)
        .y_desc(y_label)
        .draw()?;

    chart.draw_series(LineSeries::new(points.iter().copied(), &BLUE))?;

    root.present()?;
    Ok(())
}

/// Data bounds widened by 5%, and never empty.
fn padded(values: impl Iterator<Item = f64>) -> Range<f64> {
    let (min, max) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    let span = max - min;
    let pad = if span > 0.0 {
        span * 0.05
    } else if min != 0.0 {
        min.abs() * 0.05
    } else {
        1.0
    };
    (min - pad)..(max + pad)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_an_svg_chart() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = ResultTable::new(["Voltage (V)", "Current (A)"]);
        for i in 0..5 {
            let v = -1.0 + 0.5 * i as f64;
            table.push([v, v * 1e-3]);
        }

        let path = plot_measurements(&table, dir.path(), "iv_curve")
            .unwrap()
            .unwrap();

        assert_eq!(path, dir.path().join("iv_curve.svg"));
        let svg = fs::read_to_string(path).unwrap();
        assert!(svg.contains("<svg"));
        assert!(svg.contains("iv_curve"));
    }

    #[test]
    fn single_point_still_has_a_range() {
        let range = padded([3.0].into_iter());
        assert!(range.start < 3.0 && range.end > 3.0);
        let range = padded([0.0].into_iter());
        assert_eq!(range, -1.0..1.0);
    }

    #[test]
    fn empty_tables_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let table = ResultTable::new(["Wavelength (nm)", "Power (dBm)"]);

        assert!(plot_measurements(&table, dir.path(), "empty").unwrap().is_none());
        assert!(!dir.path().join("empty.svg").exists());
    }

    #[test]
    fn one_column_tables_cannot_be_plotted() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = ResultTable::new(["Voltage (V)"]);
        table.push([1.0]);

        assert!(matches!(
            plot_measurements(&table, dir.path(), "bad"),
            Err(Error::InvalidConfiguration(_))
        ));
    }
}
