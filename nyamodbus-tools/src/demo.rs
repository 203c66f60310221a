use nyamodbus::{Error, FunctionCode, Handler, Listener, Result};
use tracing::{info, warn};

/// Contacts served by [`Contacts`], numbered from 1
const CONTACT_COUNT: u16 = 24;
/// Holding registers served by [`Holding`], numbered from 1
const HOLDING_COUNT: usize = 0x30;

/// Read-only slave: every fourth contact is closed.
#[derive(Debug, Default)]
pub struct Contacts;

impl Handler for Contacts {
    fn read_contact(&mut self, index: u16) -> Result<bool> {
        if index == 0 || index > CONTACT_COUNT {
            return Err(Error::NoDataAddress);
        }
        Ok(index % 4 == 0)
    }
}

/// Read/write slave backed by a small register file.
#[derive(Debug)]
pub struct Holding {
    registers: [u16; HOLDING_COUNT],
}

impl Default for Holding {
    fn default() -> Self {
        Self {
            registers: [0; HOLDING_COUNT],
        }
    }
}

impl Holding {
    fn slot(&mut self, index: u16) -> Result<&mut u16> {
        usize::from(index)
            .checked_sub(1)
            .and_then(|i| self.registers.get_mut(i))
            .ok_or(Error::NoDataAddress)
    }
}

impl Handler for Holding {
    fn device_info(&mut self, object: u8) -> Result<&str> {
        match object {
            0 => Ok("Nyamodbus"),
            1 => Ok("Holding example"),
            2 => Ok("v1.0.0"),
            _ => Err(Error::NoDataAddress),
        }
    }

    fn read_holding(&mut self, index: u16) -> Result<u16> {
        self.slot(index).map(|value| *value)
    }

    fn write_holding(&mut self, index: u16, value: u16) -> Result<()> {
        *self.slot(index)? = value;
        Ok(())
    }
}

/// Logs every decoded response and keeps a copy for later inspection.
#[derive(Debug, Default)]
pub struct Log {
    pub errors: Vec<(u8, Error)>,
    pub contacts: Vec<(u16, bool)>,
    pub coils: Vec<(u16, bool)>,
    pub holdings: Vec<(u16, u16)>,
    pub inputs: Vec<(u16, u16)>,
    pub writes: Vec<(FunctionCode, u16, u16)>,
    pub info: Vec<(u8, String)>,
}

impl Log {
    /// Registers and identification objects decoded so far
    pub fn decoded(&self) -> usize {
        self.contacts.len()
            + self.coils.len()
            + self.holdings.len()
            + self.inputs.len()
            + self.info.len()
    }
}

impl Listener for Log {
    fn on_error(&mut self, slave: u8, error: Error) {
        warn!("Slave {:#04x}: {}", slave, error);
        self.errors.push((slave, error));
    }

    fn on_coil(&mut self, _slave: u8, index: u16, value: bool) {
        info!("COIL {:03}: {}", index, u8::from(value));
        self.coils.push((index, value));
    }

    fn on_contact(&mut self, _slave: u8, index: u16, value: bool) {
        info!("CONTACT {:03}: {}", index, u8::from(value));
        self.contacts.push((index, value));
    }

    fn on_holding(&mut self, _slave: u8, index: u16, value: u16) {
        info!("HOLDING {:03}: {:04x}", index, value);
        self.holdings.push((index, value));
    }

    fn on_input(&mut self, _slave: u8, index: u16, value: u16) {
        info!("INPUT {:03}: {:04x}", index, value);
        self.inputs.push((index, value));
    }

    fn on_write(&mut self, _slave: u8, function: FunctionCode, index: u16, value: u16) {
        info!("{:?} {:03}: {:04x} confirmed", function, index, value);
        self.writes.push((function, index, value));
    }

    fn on_device_info(&mut self, _slave: u8, object: u8, info: &[u8]) {
        let info = String::from_utf8_lossy(info).into_owned();
        info!("DEVICE INFO {}: {}", object, info);
        self.info.push((object, info));
    }
}
