//! Sweep-and-acquire control of a photonics test bench.
//!
//! Drivers for a Keithley 2400 source-meter and an Agilent 8163 lightwave
//! multimeter speak SCPI over a pluggable transport (VISA with the `visa`
//! feature, or the in-memory [`transport::mock`] bus). Sweeps are written
//! against the capability traits in [`instruments`] and return a
//! [`sweep::ResultTable`] that [`storage`] writes as CSV and [`plot`] renders.

pub mod config;
pub mod error;
pub mod instruments;
pub mod logging;
pub mod plot;
pub mod simulator;
pub mod storage;
pub mod sweep;
pub mod transport;

pub use error::{Error, Result};
