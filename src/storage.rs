//! Flat CSV export of result tables.
//!
//! One header line (the column labels joined by commas), then one line per
//! row with each value in Rust's shortest round-trip float rendering.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::sweep::ResultTable;

/// Default output directory, relative to the working directory.
pub const RAW_DATA_DIR: &str = "data/raw";

/// Write `table` to `<dir>/<name>.csv`, creating `dir` as needed.
///
/// An empty table is not written and yields `Ok(None)`.
pub fn save_raw_measurements<const N: usize>(
    table: &ResultTable<N>,
    dir: &Path,
    name: &str,
) -> Result<Option<PathBuf>> {
    if table.is_empty() {
        warn!("No results to save.");
        return Ok(None);
    }

    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{name}.csv"));
    let mut writer = csv::Writer::from_path(&path)?;
    writer.write_record(table.headers())?;
    for row in table.rows() {
        writer.write_record(row.iter().map(f64::to_string))?;
    }
    writer.flush()?;

    info!("Data saved as {}", path.display());
    Ok(Some(path))
}

/// Read a file written by [`save_raw_measurements`] back into a table.
pub fn load_raw_measurements<const N: usize>(path: &Path) -> Result<ResultTable<N>> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers: Vec<String> = reader.headers()?.iter().map(String::from).collect();
    let found = headers.len();
    let headers: [String; N] = headers.try_into().map_err(|_| {
        Error::invalid_configuration(format!(
            "{} has {found} columns, expected {N}",
            path.display()
        ))
    })?;

    let mut table = ResultTable::with_headers(headers);
    for record in reader.records() {
        let record = record?;
        let values = record
            .iter()
            .map(|field| field.trim().parse::<f64>().map_err(|_| Error::parse(field)))
            .collect::<Result<Vec<f64>>>()?;
        let row: [f64; N] = values
            .try_into()
            .map_err(|_| Error::parse(record.iter().collect::<Vec<_>>().join(",")))?;
        table.push(row);
    }
    Ok(table)
}
