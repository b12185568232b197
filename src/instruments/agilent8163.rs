//! Agilent 8163 Lightwave Multimeter.
//!
//! The mainframe hosts a tunable laser module and a power meter module in
//! separate slots; the power meter is further addressed by channel. One driver
//! fills both the [`LaserSource`] and the [`PowerMeter`] role over one session.
//!
//! Wavelength is set in nanometres; power is returned as the module reports it.

use std::fmt;

use tracing::{Span, debug, info, info_span, warn};

use crate::error::{Error, Result};
use crate::instruments::{Instrument, LaserSource, Link, PowerMeter};
use crate::transport::ManagerHandle;

pub const DEFAULT_ADDRESS: &str = "GPIB0::20::INSTR";

pub struct Agilent8163 {
    link: Link,
    laser_slot: u8,
    power_slot: u8,
    power_channel: u8,
}

pub struct Agilent8163Builder {
    address: String,
    laser_slot: u8,
    power_slot: u8,
    power_channel: u8,
    manager: Option<ManagerHandle>,
    span: Option<Span>,
    echo: bool,
}

impl Agilent8163Builder {
    pub fn laser_slot(mut self, slot: u8) -> Self {
        self.laser_slot = slot;
        self
    }

    pub fn power_slot(mut self, slot: u8) -> Self {
        self.power_slot = slot;
        self
    }

    pub fn power_channel(mut self, channel: u8) -> Self {
        self.power_channel = channel;
        self
    }

    pub fn manager(mut self, manager: ManagerHandle) -> Self {
        self.manager = Some(manager);
        self
    }

    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn connect(self) -> Result<Agilent8163> {
        let manager = match self.manager {
            Some(manager) => manager,
            None => ManagerHandle::system_default()?,
        };
        let span = self.span.unwrap_or_else(|| {
            info_span!(
                "agilent8163",
                address = %self.address,
                laser_slot = self.laser_slot,
                power_slot = self.power_slot,
                power_channel = self.power_channel,
            )
        });
        let link = Link::connect(&self.address, manager, span, self.echo)?;
        Ok(Agilent8163 {
            link,
            laser_slot: self.laser_slot,
            power_slot: self.power_slot,
            power_channel: self.power_channel,
        })
    }
}

impl Agilent8163 {
    pub fn builder(address: impl Into<String>) -> Agilent8163Builder {
        Agilent8163Builder {
            address: address.into(),
            laser_slot: 1,
            power_slot: 2,
            power_channel: 1,
            manager: None,
            span: None,
            echo: false,
        }
    }

    pub fn options(&self) -> &str {
        self.link.options()
    }

    /// `(slot, channel)` of the power meter.
    pub fn power_channel(&self) -> (u8, u8) {
        (self.power_slot, self.power_channel)
    }
}

impl Instrument for Agilent8163 {
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
        self.link.shutdown(|| LaserSource::turn_off(self));
    }
}

impl LaserSource for Agilent8163 {
    fn initialize(&self) -> Result<()> {
        let _entered = self.link.span().enter();
        self.link.write("*CLS")?;
        self.link
            .write(&format!("sour{}:pow:stat 1", self.laser_slot))?;
        info!("Laser module initialized.");
        Ok(())
    }

    fn set_wavelength(&self, wavelength_nm: f64) -> Result<()> {
        let _entered = self.link.span().enter();
        self.link
            .write(&format!("sour{}:wav {wavelength_nm}NM", self.laser_slot))?;
        debug!("Wavelength set to {wavelength_nm} nm.");
        Ok(())
    }

    fn turn_off(&self) -> Result<()> {
        let _entered = self.link.span().enter();
        self.link
            .write(&format!("sour{}:pow:stat 0", self.laser_slot))?;
        info!("Laser turned off");
        Ok(())
    }
}

impl PowerMeter for Agilent8163 {
    fn initialize(&self) -> Result<()> {
        let _entered = self.link.span().enter();
        self.link.write("*CLS")?;
        info!("Power meter initialized.");
        Ok(())
    }

    fn measure_power(&self) -> Result<f64> {
        let _entered = self.link.span().enter();
        let response = self.link.query(&format!(
            "fetch{}:chan{}:pow?",
            self.power_slot, self.power_channel
        ))?;
        match response.parse::<f64>() {
            Ok(power) => {
                debug!("Measured power: {power}");
                Ok(power)
            }
            Err(_) => {
                warn!("Invalid power reading: {response}");
                Err(Error::parse(response))
            }
        }
    }
}

impl Drop for Agilent8163 {
    fn drop(&mut self) {
        if self.is_connected() {
            self.close();
        }
    }
}

impl fmt::Display for Agilent8163 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Agilent8163Multimeter(id={}, address={}, status={})",
            self.identity(),
            self.address(),
            self.link.status()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ResourceManager;
    use crate::transport::mock::MockBus;
    use std::rc::Rc;

    const ADDR: &str = "GPIB0::20::INSTR";

    fn bus_reporting(power: &'static str) -> MockBus {
        let bus = MockBus::new();
        bus.add_device(ADDR, move |command| match command {
            "*IDN?" => "HEWLETT-PACKARD,HP8163A,DE41200123,V4.00".to_string(),
            "*OPT?" => "81640A, ,81635A".to_string(),
            _ => power.to_string(),
        });
        bus
    }

    fn connected(bus: &MockBus) -> Agilent8163 {
        let shared: Rc<dyn ResourceManager> = Rc::new(bus.clone());
        let mainframe = Agilent8163::builder(ADDR)
            .laser_slot(1)
            .power_slot(2)
            .power_channel(2)
            .manager(ManagerHandle::shared(shared))
            .connect()
            .unwrap();
        bus.clear_commands(ADDR);
        mainframe
    }

    #[test]
    fn laser_commands_address_the_laser_slot() {
        let bus = bus_reporting("0");
        let mainframe = connected(&bus);

        LaserSource::initialize(&mainframe).unwrap();
        mainframe.set_wavelength(1550.25).unwrap();
        LaserSource::turn_off(&mainframe).unwrap();

        assert_eq!(
            bus.commands(ADDR),
            vec![
                "*CLS",
                "sour1:pow:stat 1",
                "sour1:wav 1550.25NM",
                "sour1:pow:stat 0",
            ]
        );
    }

    #[test]
    fn injected_span_replaces_the_default() {
        let bus = bus_reporting("-12.5");

        let (power, logged) = crate::instruments::tests::capture_logs(|| {
            let mainframe = Agilent8163::builder(ADDR)
                .manager(ManagerHandle::owned(bus.clone()))
                .span(info_span!("bench_mainframe"))
                .connect()
                .unwrap();
            mainframe.measure_power().unwrap()
        });

        assert_eq!(power, -12.5);
        assert!(logged.contains("bench_mainframe: "), "{logged}");
        assert!(!logged.contains("agilent8163{"), "{logged}");
    }

    #[test]
    fn power_is_fetched_from_slot_and_channel() {
        let bus = bus_reporting("+1.23456E-06");
        let mainframe = connected(&bus);

        let power = mainframe.measure_power().unwrap();

        approx::assert_relative_eq!(power, 1.23456e-6);
        assert_eq!(bus.commands(ADDR), vec!["fetch2:chan2:pow?"]);
        assert_eq!(mainframe.power_channel(), (2, 2));
        assert_eq!(mainframe.options(), "81640A, ,81635A");
    }

    #[test]
    fn invalid_power_reading_is_a_parse_error() {
        let bus = bus_reporting("-1.#INF");
        let mainframe = connected(&bus);

        assert!(matches!(
            mainframe.measure_power(),
            Err(Error::MeasurementParse { .. })
        ));
    }

    #[test]
    fn close_turns_the_laser_off_and_keeps_shared_manager() {
        let bus = bus_reporting("0");
        let mainframe = connected(&bus);

        mainframe.close();

        assert_eq!(bus.commands(ADDR), vec!["sour1:pow:stat 0"]);
        assert_eq!(bus.manager_closes(), 0);
        assert!(matches!(
            mainframe.measure_power(),
            Err(Error::NotConnected)
        ));
        assert!(mainframe.to_string().starts_with("Agilent8163Multimeter(id=HEWLETT-PACKARD"));
    }
}
