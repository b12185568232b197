//! In-memory instrument bus for tests and simulation.
//!
//! [`MockBus`] plays the role of a resource manager. Every device registered on
//! it sees each written line through a responder closure, whose return value
//! becomes the reply when the line is a query; everything written to a
//! device is recorded so tests can assert on exact command sequences. Faults
//! can be injected on open and on individual commands.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::transport::{ResourceManager, Transport};

type Responder = Box<dyn FnMut(&str) -> String>;

struct Fault {
    pattern: String,
    ok_count: usize,
    seen: usize,
}

#[derive(Default)]
struct Device {
    responder: Option<Responder>,
    commands: Vec<String>,
    pending: VecDeque<String>,
    faults: Vec<Fault>,
    fail_open: bool,
    fail_close: bool,
    open_count: usize,
    closed: bool,
}

impl Device {
    /// Record `command` and return an error if an injected fault matches it.
    fn accept(&mut self, resource: &str, command: &str) -> Result<()> {
        self.commands.push(command.to_string());
        for fault in &mut self.faults {
            if command.contains(&fault.pattern) {
                fault.seen += 1;
                if fault.seen > fault.ok_count {
                    return Err(Error::transport(format!(
                        "injected fault on {resource} for {command:?}"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct BusState {
    devices: HashMap<String, Device>,
    resources: Option<Vec<String>>,
    manager_closes: usize,
}

/// Cheaply clonable handle to a shared simulated bus.
#[derive(Clone, Default)]
pub struct MockBus {
    state: Rc<RefCell<BusState>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device; `responder` sees every written line and its return
    /// value answers the line if it is a query.
    pub fn add_device(&self, resource: &str, responder: impl FnMut(&str) -> String + 'static) {
        let mut state = self.state.borrow_mut();
        let device = state.devices.entry(resource.to_string()).or_default();
        device.responder = Some(Box::new(responder));
    }

    /// Register a device that identifies as `idn`, reports no options and
    /// answers every other query with `0`.
    pub fn add_identified(&self, resource: &str, idn: &str) {
        let idn = idn.to_string();
        self.add_device(resource, move |command| match command {
            "*IDN?" => idn.clone(),
            "*OPT?" => String::new(),
            _ => "0".to_string(),
        });
    }

    /// Make opening `resource` fail.
    pub fn fail_open(&self, resource: &str) {
        self.device_mut(resource, |device| device.fail_open = true);
    }

    /// Make closing the transport of `resource` fail.
    pub fn fail_close(&self, resource: &str) {
        self.device_mut(resource, |device| device.fail_close = true);
    }

    /// Let the first `ok_count` commands containing `pattern` through, then
    /// fail every later one.
    pub fn fail_after(&self, resource: &str, pattern: &str, ok_count: usize) {
        self.device_mut(resource, |device| {
            device.faults.push(Fault {
                pattern: pattern.to_string(),
                ok_count,
                seen: 0,
            })
        });
    }

    /// Override what [`ResourceManager::list_resources`] reports.
    pub fn set_resources(&self, resources: Vec<String>) {
        self.state.borrow_mut().resources = Some(resources);
    }

    /// Every line written to `resource`, queries included, in order.
    pub fn commands(&self, resource: &str) -> Vec<String> {
        self.state
            .borrow()
            .devices
            .get(resource)
            .map(|device| device.commands.clone())
            .unwrap_or_default()
    }

    /// How many written lines of `resource` are exactly `command`.
    pub fn count(&self, resource: &str, command: &str) -> usize {
        self.commands(resource)
            .iter()
            .filter(|line| line.as_str() == command)
            .count()
    }

    pub fn clear_commands(&self, resource: &str) {
        self.device_mut(resource, |device| device.commands.clear());
    }

    pub fn transport_closed(&self, resource: &str) -> bool {
        self.state
            .borrow()
            .devices
            .get(resource)
            .is_some_and(|device| device.closed)
    }

    pub fn open_count(&self, resource: &str) -> usize {
        self.state
            .borrow()
            .devices
            .get(resource)
            .map_or(0, |device| device.open_count)
    }

    /// Number of times the bus was closed as a resource manager.
    pub fn manager_closes(&self) -> usize {
        self.state.borrow().manager_closes
    }

    fn device_mut(&self, resource: &str, f: impl FnOnce(&mut Device)) {
        let mut state = self.state.borrow_mut();
        f(state.devices.entry(resource.to_string()).or_default());
    }
}

impl ResourceManager for MockBus {
    fn open(&self, resource: &str) -> Result<Box<dyn Transport>> {
        let mut state = self.state.borrow_mut();
        let device = state
            .devices
            .get_mut(resource)
            .ok_or_else(|| Error::transport(format!("no instrument at {resource}")))?;
        if device.fail_open {
            return Err(Error::transport(format!("failed to open {resource}")));
        }
        device.open_count += 1;
        device.closed = false;
        Ok(Box::new(MockTransport {
            resource: resource.to_string(),
            state: Rc::clone(&self.state),
        }))
    }

    fn list_resources(&self) -> Result<Vec<String>> {
        let state = self.state.borrow();
        if let Some(resources) = &state.resources {
            return Ok(resources.clone());
        }
        let mut resources: Vec<String> = state.devices.keys().cloned().collect();
        resources.sort();
        Ok(resources)
    }

    fn close(&self) -> Result<()> {
        self.state.borrow_mut().manager_closes += 1;
        Ok(())
    }
}

/// Transport bound to one device of a [`MockBus`].
pub struct MockTransport {
    resource: String,
    state: Rc<RefCell<BusState>>,
}

impl Transport for MockTransport {
    fn write_line(&mut self, line: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let device = state
            .devices
            .get_mut(&self.resource)
            .ok_or_else(|| Error::transport(format!("{} vanished", self.resource)))?;
        if device.closed {
            return Err(Error::transport(format!("{} is closed", self.resource)));
        }
        device.accept(&self.resource, line)?;
        let reply = device.responder.as_mut().map(|responder| responder(line));
        if line.contains('?') {
            device
                .pending
                .push_back(format!("{}\n", reply.unwrap_or_default()));
        }
        Ok(())
    }

    fn read_line(&mut self) -> Result<String> {
        let mut state = self.state.borrow_mut();
        state
            .devices
            .get_mut(&self.resource)
            .and_then(|device| device.pending.pop_front())
            .ok_or_else(|| Error::transport(format!("read timeout on {}", self.resource)))
    }

    fn close(&mut self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let Some(device) = state.devices.get_mut(&self.resource) else {
            return Ok(());
        };
        if device.fail_close {
            return Err(Error::transport(format!("failed to close {}", self.resource)));
        }
        device.closed = true;
        device.pending.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queries_are_answered_in_order() {
        let bus = MockBus::new();
        bus.add_identified("GPIB0::5::INSTR", "ACME,1234");
        let mut transport = bus.open("GPIB0::5::INSTR").unwrap();

        transport.write_line("*IDN?").unwrap();
        transport.write_line("*OPT?").unwrap();
        assert_eq!(transport.read_line().unwrap(), "ACME,1234\n");
        assert_eq!(transport.read_line().unwrap(), "\n");
        assert!(transport.read_line().is_err());
    }

    #[test]
    fn unknown_resources_do_not_open() {
        let bus = MockBus::new();
        assert!(matches!(bus.open("GPIB0::9::INSTR"), Err(Error::Transport(_))));
    }

    #[test]
    fn faults_trigger_after_the_allowed_count() {
        let bus = MockBus::new();
        bus.add_identified("GPIB0::5::INSTR", "ACME");
        bus.fail_after("GPIB0::5::INSTR", ":READ?", 2);
        let mut transport = bus.open("GPIB0::5::INSTR").unwrap();

        assert!(transport.write_line(":READ?").is_ok());
        assert!(transport.write_line(":READ?").is_ok());
        assert!(transport.write_line(":READ?").is_err());
        assert_eq!(bus.count("GPIB0::5::INSTR", ":READ?"), 3);
    }

    #[test]
    fn lists_registered_devices_unless_overridden() {
        let bus = MockBus::new();
        bus.add_identified("GPIB0::24::INSTR", "KEITHLEY");
        bus.add_identified("GPIB0::20::INSTR", "AGILENT");
        assert_eq!(
            bus.list_resources().unwrap(),
            vec!["GPIB0::20::INSTR", "GPIB0::24::INSTR"]
        );

        bus.set_resources(Vec::new());
        assert!(bus.list_resources().unwrap().is_empty());
    }
}
