//! Instrument capability roles and the drivers that implement them.
//!
//! Sweeps are written against three roles, [`LaserSource`], [`PowerMeter`] and
//! [`SourceMeter`], never against a vendor type. One physical instrument may
//! fill several roles: the Agilent 8163 mainframe is both a laser and a power
//! meter, each addressed through its own slot/channel.
//!
//! Capability methods take `&self`. Drivers keep their session behind interior
//! mutability, so the same mainframe can be handed to a sweep once as the laser
//! and once as the power meter.

use std::cell::RefCell;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{Span, error, info, warn};

use crate::error::{Error, Result};
use crate::transport::{ManagerHandle, ScpiSession};

pub mod agilent8163;
pub mod keithley2400;

pub use agilent8163::Agilent8163;
pub use keithley2400::Keithley2400;

/// What every driver exposes regardless of its roles.
pub trait Instrument {
    fn is_connected(&self) -> bool;

    /// Reply to `*IDN?` captured at bring-up.
    fn identity(&self) -> &str;

    /// Bus address the driver was opened on.
    fn address(&self) -> &str;

    /// Best-effort shutdown: output off, session closed, owned manager closed.
    /// Failures are logged, never returned. Calling it again does nothing.
    fn close(&self);
}

/// Tunable laser source.
pub trait LaserSource: Instrument {
    fn initialize(&self) -> Result<()>;

    fn set_wavelength(&self, wavelength_nm: f64) -> Result<()>;

    /// Disable the optical output.
    fn turn_off(&self) -> Result<()>;
}

/// Optical power meter.
pub trait PowerMeter: Instrument {
    fn initialize(&self) -> Result<()>;

    fn measure_power(&self) -> Result<f64>;
}

/// Source-measure unit.
///
/// The source-and-measure operations leave the output enabled after reading;
/// [`SourceMeter::turn_off`] (or the sweep's cleanup) disables it.
pub trait SourceMeter: Instrument {
    fn initialize(&self, wire_mode: WireMode) -> Result<()>;

    /// Single-shot resistance reading with a small fixed excitation.
    fn read_resistance_auto(&self, range: f64) -> Result<Vec<f64>>;

    fn read_resistance_configured(&self, settings: &ResistanceSettings) -> Result<Vec<f64>>;

    fn source_voltage_and_read_current(&self, settings: &VoltageSource) -> Result<Vec<f64>>;

    fn source_current_and_read_voltage(&self, settings: &CurrentSource) -> Result<Vec<f64>>;

    /// Disable the source output.
    fn turn_off(&self) -> Result<()>;
}

/// 2-wire or 4-wire (remote sense) measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum WireMode {
    #[default]
    TwoWire,
    FourWire,
}

impl WireMode {
    /// Argument of `:SYST:RSEN`.
    pub fn remote_sense(self) -> &'static str {
        match self {
            WireMode::TwoWire => "OFF",
            WireMode::FourWire => "ON",
        }
    }
}

impl TryFrom<u8> for WireMode {
    type Error = Error;

    fn try_from(wires: u8) -> Result<Self> {
        match wires {
            2 => Ok(WireMode::TwoWire),
            4 => Ok(WireMode::FourWire),
            other => Err(Error::invalid_configuration(format!(
                "invalid wire mode {other}: use 2 for 2-wire or 4 for 4-wire"
            ))),
        }
    }
}

impl From<WireMode> for u8 {
    fn from(mode: WireMode) -> u8 {
        match mode {
            WireMode::TwoWire => 2,
            WireMode::FourWire => 4,
        }
    }
}

/// Resistance measurement mode (`:SENS:RES:MODE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResistanceMode {
    #[default]
    #[serde(rename = "AUTO")]
    Auto,
    #[serde(rename = "MAN", alias = "MANUAL")]
    Manual,
}

impl fmt::Display for ResistanceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResistanceMode::Auto => "AUTO",
            ResistanceMode::Manual => "MAN",
        })
    }
}

/// Sourced quantity (`:SOUR:FUNC`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SourceFunction {
    #[default]
    #[serde(rename = "VOLT")]
    Voltage,
    #[serde(rename = "CURR")]
    Current,
}

impl fmt::Display for SourceFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceFunction::Voltage => "VOLT",
            SourceFunction::Current => "CURR",
        })
    }
}

/// Settings for [`SourceMeter::read_resistance_configured`].
#[derive(Debug, Clone, PartialEq)]
pub struct ResistanceSettings {
    /// Ohms.
    pub range: f64,
    pub mode: ResistanceMode,
    pub offset_compensation: bool,
    /// Volts.
    pub voltage_protection: f64,
    /// Amperes.
    pub current_protection: f64,
    pub source_function: SourceFunction,
    /// Volts or amperes depending on `source_function`.
    pub source_level: f64,
    pub wire_mode: WireMode,
    /// Settle time between enabling the output and reading.
    pub delay: Duration,
}

impl Default for ResistanceSettings {
    fn default() -> Self {
        Self {
            range: 20e3,
            mode: ResistanceMode::Auto,
            offset_compensation: false,
            voltage_protection: 2.0,
            current_protection: 0.01,
            source_function: SourceFunction::Voltage,
            source_level: 0.05,
            wire_mode: WireMode::TwoWire,
            delay: Duration::from_millis(100),
        }
    }
}

/// Source a voltage, measure current.
#[derive(Debug, Clone, PartialEq)]
pub struct VoltageSource {
    /// Volts.
    pub level: f64,
    /// Source range, volts.
    pub range: f64,
    /// Current measurement range, amperes.
    pub current_range: f64,
    /// Compliance, amperes.
    pub current_limit: f64,
    pub delay: Duration,
}

/// Source a current, measure voltage.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentSource {
    /// Amperes.
    pub level: f64,
    /// Source range, amperes.
    pub range: f64,
    /// Voltage measurement range, volts.
    pub voltage_range: f64,
    /// Compliance, volts.
    pub voltage_limit: f64,
    pub delay: Duration,
}

/// Parse a possibly comma-separated numeric reply.
///
/// Empty fields are skipped; anything non-numeric, or a reply with no
/// numbers at all, is a [`Error::MeasurementParse`].
pub fn parse_samples(response: &str) -> Result<Vec<f64>> {
    let samples = response
        .trim()
        .split(',')
        .map(str::trim)
        .filter(|field| !field.is_empty())
        .map(|field| field.parse::<f64>().map_err(|_| Error::parse(response)))
        .collect::<Result<Vec<f64>>>()?;
    if samples.is_empty() {
        return Err(Error::parse(response));
    }
    Ok(samples)
}

/// Session, identity and manager ownership shared by every driver.
pub(crate) struct Link {
    session: ScpiSession,
    manager: RefCell<Option<ManagerHandle>>,
    identity: String,
    options: String,
    span: Span,
}

impl Link {
    /// Open `address` and identify the instrument. Any failure closes what was
    /// opened and is returned; no half-connected link escapes.
    pub(crate) fn connect(
        address: &str,
        manager: ManagerHandle,
        span: Span,
        echo: bool,
    ) -> Result<Self> {
        let entered = span.enter();
        let session = match ScpiSession::open(manager.manager(), address) {
            Ok(session) => session.with_echo(echo),
            Err(err) => {
                error!(address, error = %err, "error connecting to instrument");
                release_manager(&manager);
                return Err(err);
            }
        };

        let identified = session
            .query("*IDN?")
            .and_then(|identity| Ok((identity, session.query("*OPT?")?)));
        let (identity, options) = match identified {
            Ok(pair) => pair,
            Err(err) => {
                error!(address, error = %err, "error identifying instrument");
                if let Err(close_err) = session.close() {
                    warn!(error = %close_err, "failed to close resource");
                }
                release_manager(&manager);
                return Err(err);
            }
        };
        info!("Connected to {identity} at {address}");
        info!("Options: {options}");
        drop(entered);

        Ok(Self {
            session,
            manager: RefCell::new(Some(manager)),
            identity,
            options,
            span,
        })
    }

    pub(crate) fn write(&self, command: &str) -> Result<()> {
        self.session.write(command)
    }

    pub(crate) fn query(&self, command: &str) -> Result<String> {
        self.session.query(command)
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.session.is_open()
    }

    pub(crate) fn address(&self) -> &str {
        self.session.resource()
    }

    pub(crate) fn identity(&self) -> &str {
        &self.identity
    }

    pub(crate) fn options(&self) -> &str {
        &self.options
    }

    pub(crate) fn span(&self) -> &Span {
        &self.span
    }

    /// Run the close sequence; each step's failure is logged and the next
    /// step still runs.
    pub(crate) fn shutdown(&self, turn_off: impl FnOnce() -> Result<()>) {
        let _entered = self.span.enter();
        let was_connected = self.session.is_open();
        if was_connected {
            if let Err(err) = turn_off() {
                warn!(error = %err, "error turning off output during close");
            }
            if let Err(err) = self.session.close() {
                warn!(error = %err, "failed to close instrument resource");
            }
        }
        if let Some(manager) = self.manager.borrow_mut().take() {
            release_manager(&manager);
        }
        if was_connected {
            info!("Connection closed.");
        }
    }

    pub(crate) fn status(&self) -> &'static str {
        if self.is_connected() {
            "connected"
        } else {
            "disconnected"
        }
    }
}

/// Close `manager` if this driver created it; a shared manager is left alone.
fn release_manager(manager: &ManagerHandle) {
    if manager.is_owned() {
        if let Err(err) = manager.manager().close() {
            warn!(error = %err, "failed to close resource manager");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockBus;
    use std::io;
    use std::rc::Rc;
    use std::sync::{Arc, Mutex};

    struct LogSink(Arc<Mutex<Vec<u8>>>);

    impl io::Write for LogSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Run `f` under a plain-text subscriber and return what it logged.
    pub(crate) fn capture_logs<R>(f: impl FnOnce() -> R) -> (R, String) {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buffer);
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || LogSink(Arc::clone(&sink)))
            .with_ansi(false)
            .finish();
        let result = tracing::subscriber::with_default(subscriber, f);
        let logged = String::from_utf8_lossy(&buffer.lock().unwrap()).into_owned();
        (result, logged)
    }

    #[test]
    fn parses_single_and_comma_separated_samples() {
        assert_eq!(parse_samples("1.5E-3\n").unwrap(), vec![1.5e-3]);
        assert_eq!(
            parse_samples("+1.0E+00,+2.0E+00,").unwrap(),
            vec![1.0, 2.0]
        );
    }

    #[test]
    fn rejects_non_numeric_payloads() {
        assert!(matches!(
            parse_samples("ERROR"),
            Err(Error::MeasurementParse { .. })
        ));
        assert!(matches!(
            parse_samples("1.0,abc"),
            Err(Error::MeasurementParse { .. })
        ));
        assert!(matches!(
            parse_samples("  "),
            Err(Error::MeasurementParse { .. })
        ));
    }

    #[test]
    fn wire_mode_accepts_only_two_or_four() {
        assert_eq!(WireMode::try_from(2).unwrap(), WireMode::TwoWire);
        assert_eq!(WireMode::try_from(4).unwrap(), WireMode::FourWire);
        for wires in [0, 1, 3, 5] {
            assert!(matches!(
                WireMode::try_from(wires),
                Err(Error::InvalidConfiguration(_))
            ));
        }
        assert_eq!(WireMode::FourWire.remote_sense(), "ON");
    }

    #[test]
    fn failed_identification_releases_everything() {
        let bus = MockBus::new();
        bus.add_identified("GPIB0::7::INSTR", "ACME");
        bus.fail_after("GPIB0::7::INSTR", "*OPT?", 0);

        let result = Link::connect(
            "GPIB0::7::INSTR",
            ManagerHandle::owned(bus.clone()),
            Span::none(),
            false,
        );

        assert!(matches!(result, Err(Error::Transport(_))));
        assert!(bus.transport_closed("GPIB0::7::INSTR"));
        assert_eq!(bus.manager_closes(), 1);
    }

    #[test]
    fn shared_manager_survives_shutdown() {
        let bus = MockBus::new();
        bus.add_identified("GPIB0::7::INSTR", "ACME");
        let shared: Rc<dyn crate::transport::ResourceManager> = Rc::new(bus.clone());

        let link = Link::connect(
            "GPIB0::7::INSTR",
            ManagerHandle::shared(shared),
            Span::none(),
            false,
        )
        .unwrap();
        assert_eq!(link.identity(), "ACME");

        link.shutdown(|| Ok(()));
        link.shutdown(|| panic!("second shutdown must not turn off again"));

        assert!(!link.is_connected());
        assert_eq!(bus.manager_closes(), 0);
    }
}
