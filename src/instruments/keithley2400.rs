//! Keithley 2400 SourceMeter.
//!
//! Resistance measurement, voltage/current sourcing with compliance limits and
//! read-back, and safe output shutdown.

use std::fmt;
use std::thread;

use tracing::{Span, debug, info, info_span};

use crate::error::Result;
use crate::instruments::{
    CurrentSource, Instrument, Link, ResistanceMode, ResistanceSettings, SourceFunction,
    SourceMeter, VoltageSource, WireMode, parse_samples,
};
use crate::transport::ManagerHandle;

pub const DEFAULT_ADDRESS: &str = "GPIB0::24::INSTR";

/// Excitation used by the AUTO resistance reading, volts.
const AUTO_EXCITATION_VOLTS: f64 = 0.1;

pub struct Keithley2400 {
    link: Link,
}

/// Builder for [`Keithley2400`].
///
/// Without an explicit manager the driver creates (and later closes) the
/// system default one.
pub struct Keithley2400Builder {
    address: String,
    manager: Option<ManagerHandle>,
    span: Option<Span>,
    echo: bool,
}

impl Keithley2400Builder {
    pub fn manager(mut self, manager: ManagerHandle) -> Self {
        self.manager = Some(manager);
        self
    }

    /// Span every log event of this driver is recorded in.
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Log each command and reply at `info`.
    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn connect(self) -> Result<Keithley2400> {
        let manager = match self.manager {
            Some(manager) => manager,
            None => ManagerHandle::system_default()?,
        };
        let span = self
            .span
            .unwrap_or_else(|| info_span!("keithley2400", address = %self.address));
        let link = Link::connect(&self.address, manager, span, self.echo)?;
        Ok(Keithley2400 { link })
    }
}

impl Keithley2400 {
    pub fn builder(address: impl Into<String>) -> Keithley2400Builder {
        Keithley2400Builder {
            address: address.into(),
            manager: None,
            span: None,
            echo: false,
        }
    }

    /// Reply to `*OPT?` captured at bring-up.
    pub fn options(&self) -> &str {
        self.link.options()
    }

    /// Pop the oldest entry of the instrument's error queue.
    pub fn error_status(&self) -> Result<String> {
        let _entered = self.link.span().enter();
        let status = self.link.query("SYST:ERR?")?;
        debug!("SYST:ERR? -> {status}");
        Ok(status)
    }

    fn read(&self) -> Result<Vec<f64>> {
        parse_samples(&self.link.query(":READ?")?)
    }
}

impl Instrument for Keithley2400 {
    fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    fn identity(&self) -> &str {
        self.link.identity()
    }

    fn address(&self) -> &str {
        self.link.address()
    }

    fn close(&self) {
        self.link.shutdown(|| self.turn_off());
    }
}

impl SourceMeter for Keithley2400 {
    fn initialize(&self, wire_mode: WireMode) -> Result<()> {
        let _entered = self.link.span().enter();
        self.link.write("*CLS")?;
        self.link.write("*RST")?;
        self.link.write(":OUTP OFF")?;
        self.link
            .write(&format!(":SYST:RSEN {}", wire_mode.remote_sense()))?;
        info!("Source meter is initialized.");
        Ok(())
    }

    fn read_resistance_auto(&self, range: f64) -> Result<Vec<f64>> {
        let _entered = self.link.span().enter();
        self.link.write(":SOUR:FUNC VOLT")?;
        self.link
            .write(&format!(":SOUR:VOLT {AUTO_EXCITATION_VOLTS}"))?;
        self.link.write(":SENS:FUNC \"RES\"")?;
        self.link.write(":SENS:RES:MODE AUTO")?;
        self.link.write(&format!(":SENS:RES:RANG {range}"))?;
        self.link.write(":FORM:ELEM RES")?;
        self.link.write(":OUTP ON")?;
        let response = self.link.query(":READ?")?;
        self.link.write(":OUTP OFF")?;
        parse_samples(&response)
    }

    fn read_resistance_configured(&self, settings: &ResistanceSettings) -> Result<Vec<f64>> {
        if settings.mode == ResistanceMode::Auto {
            return self.read_resistance_auto(settings.range);
        }

        let _entered = self.link.span().enter();
        let link = &self.link;
        link.write(&format!(":SENS:RES:RANG {}", settings.range))?;
        link.write(&format!(":SENS:RES:MODE {}", settings.mode))?;
        link.write(&format!(
            ":SENS:RES:OCOM {}",
            if settings.offset_compensation { "ON" } else { "OFF" }
        ))?;
        link.write(&format!(":SENS:VOLT:PROT {}", settings.voltage_protection))?;
        link.write(&format!(":SENS:CURR:PROT {}", settings.current_protection))?;
        link.write(&format!(":SOUR:FUNC {}", settings.source_function))?;
        match settings.source_function {
            SourceFunction::Voltage => {
                link.write(&format!(":SOUR:VOLT {}", settings.source_level))?;
                link.write(&format!(
                    ":SYST:RSEN {}",
                    settings.wire_mode.remote_sense()
                ))?;
            }
            SourceFunction::Current => {
                // Function is reasserted right before the range write.
                link.write(":SOUR:FUNC CURR")?;
                link.write(&format!(":SOUR:CURR:RANGE {}", settings.source_level))?;
                link.write(&format!(":SOUR:CURR {}", settings.source_level))?;
            }
        }
        link.write(":FORM:ELEM RES")?;
        link.write(":OUTP ON")?;
        thread::sleep(settings.delay);
        let response = link.query(":READ?")?;
        link.write(":OUTP OFF")?;
        parse_samples(&response)
    }

    fn source_voltage_and_read_current(&self, settings: &VoltageSource) -> Result<Vec<f64>> {
        let _entered = self.link.span().enter();
        let link = &self.link;
        link.write(":SOUR:FUNC VOLT")?;
        link.write(":SOUR:VOLT:MODE FIXED")?;
        link.write(&format!(":SOUR:VOLT:RANG {}", settings.range))?;
        link.write(&format!(":SOUR:VOLT:LEV {}", settings.level))?;
        link.write(&format!(":SENS:CURR:PROT {}", settings.current_limit))?;
        link.write(":SENS:FUNC 'CURR'")?;
        link.write(&format!(":SENS:CURR:RANG {}", settings.current_range))?;
        link.write(":FORM:ELEM CURR")?;
        link.write(":OUTP ON")?;
        thread::sleep(settings.delay);
        self.read()
    }

    fn source_current_and_read_voltage(&self, settings: &CurrentSource) -> Result<Vec<f64>> {
        let _entered = self.link.span().enter();
        let link = &self.link;
        link.write(":SOUR:FUNC CURR")?;
        link.write(":SOUR:CURR:MODE FIXED")?;
        link.write(":SENS:FUNC 'VOLT'")?;
        link.write(&format!(":SOUR:CURR:RANG {}", settings.range))?;
        link.write(&format!(":SOUR:CURR:LEV {}", settings.level))?;
        link.write(&format!(":SENS:VOLT:PROT {}", settings.voltage_limit))?;
        link.write(&format!(":SENS:VOLT:RANG {}", settings.voltage_range))?;
        link.write(":FORM:ELEM VOLT")?;
        link.write(":OUTP ON")?;
        thread::sleep(settings.delay);
        self.read()
    }

    fn turn_off(&self) -> Result<()> {
        let _entered = self.link.span().enter();
        self.link.write(":OUTP OFF")?;
        info!("Source meter turned off.");
        Ok(())
    }
}

impl Drop for Keithley2400 {
    fn drop(&mut self) {
        if self.is_connected() {
            self.close();
        }
    }
}

impl fmt::Display for Keithley2400 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Keithley2400(id={}, address={}, status={})",
            self.identity(),
            self.address(),
            self.link.status()
        )
    }
}
