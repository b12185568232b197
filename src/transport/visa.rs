//! VISA backend built on `visa-rs`.
//!
//! Resource strings look like `GPIB0::24::INSTR`, `USB0::0x1AB1::0x04CE::SERIAL::INSTR`
//! or `TCPIP0::192.168.1.100::INSTR`.

use std::cell::RefCell;
use std::ffi::CString;
use std::io::{BufRead, BufReader, Write};
use std::time::Duration;

use tracing::debug;
use visa_rs::VisaString;
use visa_rs::prelude::*;

use crate::error::{Error, Result};
use crate::transport::{ResourceManager, Transport};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

fn visa_err(err: visa_rs::Error) -> Error {
    Error::transport(format!("VISA: {err}"))
}

fn io_err(err: std::io::Error) -> Error {
    Error::transport(format!("VISA I/O: {err}"))
}

fn visa_string(text: &str) -> Result<VisaString> {
    CString::new(text)
        .map(VisaString::from)
        .map_err(|_| Error::invalid_configuration(format!("resource name {text:?} contains NUL")))
}

/// The default VISA resource manager.
pub struct VisaResourceManager {
    rm: RefCell<Option<DefaultRM>>,
}

impl VisaResourceManager {
    pub fn new() -> Result<Self> {
        let rm = DefaultRM::new().map_err(visa_err)?;
        Ok(Self {
            rm: RefCell::new(Some(rm)),
        })
    }
}

impl ResourceManager for VisaResourceManager {
    fn open(&self, resource: &str) -> Result<Box<dyn Transport>> {
        let rm = self.rm.borrow();
        let rm = rm.as_ref().ok_or(Error::NotConnected)?;
        let name = visa_string(resource)?;
        let instr = rm
            .open(&name, AccessMode::NO_LOCK, DEFAULT_TIMEOUT)
            .map_err(visa_err)?;
        debug!(resource, "opened VISA session");
        Ok(Box::new(VisaTransport { instr: Some(instr) }))
    }

    fn list_resources(&self) -> Result<Vec<String>> {
        let rm = self.rm.borrow();
        let rm = rm.as_ref().ok_or(Error::NotConnected)?;
        let mut list = rm.find_res_list(&visa_string("?*INSTR")?).map_err(visa_err)?;
        let mut resources = Vec::new();
        while let Some(name) = list.find_next().map_err(visa_err)? {
            resources.push(name.to_string());
        }
        Ok(resources)
    }

    fn close(&self) -> Result<()> {
        // Dropping the default RM closes it together with any session it still owns.
        self.rm.borrow_mut().take();
        Ok(())
    }
}

/// One open VISA instrument session.
pub struct VisaTransport {
    instr: Option<Instrument>,
}

impl Transport for VisaTransport {
    fn write_line(&mut self, line: &str) -> Result<()> {
        let instr = self.instr.as_mut().ok_or(Error::NotConnected)?;
        instr
            .write_all(format!("{line}\n").as_bytes())
            .map_err(io_err)
    }

    fn read_line(&mut self) -> Result<String> {
        let instr = self.instr.as_ref().ok_or(Error::NotConnected)?;
        let mut response = String::new();
        BufReader::new(instr)
            .read_line(&mut response)
            .map_err(io_err)?;
        Ok(response)
    }

    fn close(&mut self) -> Result<()> {
        self.instr.take();
        Ok(())
    }
}
