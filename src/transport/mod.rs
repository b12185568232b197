//! Text transport to SCPI instruments.
//!
//! A [`ResourceManager`] opens bus resources (GPIB/USB/LAN addresses) and hands
//! back a [`Transport`], the raw line-oriented connection. [`ScpiSession`] sits
//! on top of that and is what the drivers talk to: it owns the connection,
//! echoes traffic to the log and trims query replies.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

pub mod mock;
#[cfg(feature = "visa")]
pub mod visa;

/// A live, line-oriented connection to one instrument.
pub trait Transport {
    /// Send one command line; the terminator is the transport's business.
    fn write_line(&mut self, line: &str) -> Result<()>;

    /// Block until one response line is available and return it untrimmed.
    fn read_line(&mut self) -> Result<String>;

    /// Release the connection.
    fn close(&mut self) -> Result<()>;
}

/// Opens transports by resource address and enumerates visible resources.
pub trait ResourceManager {
    fn open(&self, resource: &str) -> Result<Box<dyn Transport>>;

    /// Addresses of all resources currently visible on the bus.
    fn list_resources(&self) -> Result<Vec<String>>;

    /// Release the manager. Transports it opened must not be used afterwards.
    fn close(&self) -> Result<()>;
}

/// How a driver holds its resource manager.
///
/// A driver only closes a manager it owns; a shared manager belongs to whoever
/// handed it out and may serve several drivers at once.
pub enum ManagerHandle {
    Owned(Box<dyn ResourceManager>),
    Shared(Rc<dyn ResourceManager>),
}

impl ManagerHandle {
    pub fn shared(manager: Rc<dyn ResourceManager>) -> Self {
        ManagerHandle::Shared(manager)
    }

    pub fn owned(manager: impl ResourceManager + 'static) -> Self {
        ManagerHandle::Owned(Box::new(manager))
    }

    /// The platform's default manager, created for (and owned by) one driver.
    pub fn system_default() -> Result<Self> {
        #[cfg(feature = "visa")]
        {
            Ok(ManagerHandle::owned(visa::VisaResourceManager::new()?))
        }
        #[cfg(not(feature = "visa"))]
        {
            Err(Error::invalid_configuration(
                "no resource manager available: built without the `visa` feature",
            ))
        }
    }

    pub fn manager(&self) -> &dyn ResourceManager {
        match self {
            ManagerHandle::Owned(manager) => manager.as_ref(),
            ManagerHandle::Shared(manager) => manager.as_ref(),
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, ManagerHandle::Owned(_))
    }
}

impl fmt::Debug for ManagerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerHandle::Owned(_) => f.write_str("ManagerHandle::Owned"),
            ManagerHandle::Shared(_) => f.write_str("ManagerHandle::Shared"),
        }
    }
}

/// Enumerate the resources `manager` can see, logging each one.
///
/// An enumeration failure is logged and reported as an empty bus.
pub fn available_resources(manager: &dyn ResourceManager) -> Vec<String> {
    match manager.list_resources() {
        Ok(resources) if resources.is_empty() => {
            warn!("No instrument resources found.");
            resources
        }
        Ok(resources) => {
            info!("Available resources:");
            for resource in &resources {
                info!("  - {resource}");
            }
            resources
        }
        Err(err) => {
            error!(error = %err, "failed to list resources");
            Vec::new()
        }
    }
}

/// SCPI protocol adapter over one open transport.
///
/// Methods take `&self`: the connection lives behind a `RefCell` so that a
/// single instrument can serve several capability roles in the same sweep.
pub struct ScpiSession {
    resource: String,
    transport: RefCell<Option<Box<dyn Transport>>>,
    echo: bool,
}

impl ScpiSession {
    /// Open `resource` through `manager`.
    pub fn open(manager: &dyn ResourceManager, resource: &str) -> Result<Self> {
        let transport = manager.open(resource)?;
        Ok(Self::from_transport(resource, transport))
    }

    pub fn from_transport(resource: &str, transport: Box<dyn Transport>) -> Self {
        Self {
            resource: resource.to_string(),
            transport: RefCell::new(Some(transport)),
            echo: false,
        }
    }

    /// Log traffic at `info` instead of `debug`.
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn is_open(&self) -> bool {
        self.transport.borrow().is_some()
    }

    /// Transmit `command` verbatim.
    pub fn write(&self, command: &str) -> Result<()> {
        let mut slot = self.transport.borrow_mut();
        let transport = slot.as_mut().ok_or(Error::NotConnected)?;
        self.trace(format_args!(">>> {command}"));
        transport.write_line(command)
    }

    /// Transmit `command` and return the trimmed reply line.
    pub fn query(&self, command: &str) -> Result<String> {
        let mut slot = self.transport.borrow_mut();
        let transport = slot.as_mut().ok_or(Error::NotConnected)?;
        self.trace(format_args!(">>> {command}"));
        transport.write_line(command)?;
        let response = transport.read_line()?.trim().to_string();
        self.trace(format_args!("<<< {response}"));
        Ok(response)
    }

    /// Close the connection. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        match self.transport.borrow_mut().take() {
            Some(mut transport) => transport.close(),
            None => Ok(()),
        }
    }

    fn trace(&self, message: fmt::Arguments<'_>) {
        if self.echo {
            info!(resource = %self.resource, "{message}");
        } else {
            debug!(resource = %self.resource, "{message}");
        }
    }
}

impl fmt::Debug for ScpiSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScpiSession")
            .field("resource", &self.resource)
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockBus;
    use super::*;

    #[test]
    fn query_trims_the_reply() {
        let bus = MockBus::new();
        bus.add_device("GPIB0::1::INSTR", |_cmd: &str| "  1.25E-3 \r\n".to_string());
        let session = ScpiSession::open(&bus, "GPIB0::1::INSTR").unwrap();

        assert_eq!(session.query(":READ?").unwrap(), "1.25E-3");
        assert_eq!(bus.commands("GPIB0::1::INSTR"), vec![":READ?"]);
    }

    #[test]
    fn closed_session_refuses_traffic() {
        let bus = MockBus::new();
        bus.add_identified("GPIB0::1::INSTR", "KEITHLEY");
        let session = ScpiSession::open(&bus, "GPIB0::1::INSTR").unwrap();

        session.close().unwrap();
        session.close().unwrap();

        assert!(!session.is_open());
        assert!(matches!(session.write("*CLS"), Err(Error::NotConnected)));
        assert!(matches!(session.query("*IDN?"), Err(Error::NotConnected)));
        assert!(bus.transport_closed("GPIB0::1::INSTR"));
    }

    #[test]
    fn transport_faults_surface_immediately() {
        let bus = MockBus::new();
        bus.add_identified("GPIB0::1::INSTR", "KEITHLEY");
        bus.fail_after("GPIB0::1::INSTR", ":OUTP ON", 0);
        let session = ScpiSession::open(&bus, "GPIB0::1::INSTR").unwrap();

        assert!(matches!(session.write(":OUTP ON"), Err(Error::Transport(_))));
        session.write(":OUTP OFF").unwrap();
    }

    struct BrokenBus;

    impl ResourceManager for BrokenBus {
        fn open(&self, resource: &str) -> Result<Box<dyn Transport>> {
            Err(Error::transport(format!("no bus for {resource}")))
        }

        fn list_resources(&self) -> Result<Vec<String>> {
            Err(Error::transport("bus driver missing"))
        }

        fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn resource_listing_failure_reads_as_empty_bus() {
        assert!(available_resources(&BrokenBus).is_empty());

        let bus = MockBus::new();
        bus.add_identified("GPIB0::24::INSTR", "KEITHLEY");
        bus.add_identified("GPIB0::20::INSTR", "Agilent");
        assert_eq!(
            available_resources(&bus),
            vec!["GPIB0::20::INSTR", "GPIB0::24::INSTR"]
        );
    }

    #[test]
    fn system_default_manager_is_owned() {
        match ManagerHandle::system_default() {
            Ok(handle) => assert!(handle.is_owned()),
            Err(err) => assert!(matches!(err, Error::InvalidConfiguration(_) | Error::Transport(_))),
        }
    }
}
