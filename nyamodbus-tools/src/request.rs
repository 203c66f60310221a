use clap::{ArgAction, Subcommand};
use nyamodbus::{Listener, Master, RequestError, Transport};

/// One master command, as typed on the command line
#[derive(Subcommand, Clone, Debug, PartialEq, Eq)]
pub enum Request {
    ReadCoils {
        index: u16,
        count: u16,
    },
    ReadContacts {
        index: u16,
        count: u16,
    },
    ReadHolding {
        index: u16,
        count: u16,
    },
    ReadInputs {
        index: u16,
        count: u16,
    },
    WriteCoil {
        index: u16,
        #[arg(action = ArgAction::Set)]
        value: bool,
    },
    WriteHolding {
        index: u16,
        value: u16,
    },
    WriteCoils {
        index: u16,
        #[arg(value_delimiter = ',', required = true)]
        values: Vec<bool>,
    },
    WriteHoldings {
        index: u16,
        #[arg(value_delimiter = ',', required = true)]
        values: Vec<u16>,
    },
    DeviceInfo,
}

impl Request {
    pub fn issue<T: Transport, L: Listener>(
        &self,
        master: &mut Master<T, L>,
        slave: u8,
    ) -> Result<(), RequestError<T::Error>> {
        match self {
            Request::ReadCoils { index, count } => master.read_coils(slave, *index, *count),
            Request::ReadContacts { index, count } => master.read_contacts(slave, *index, *count),
            Request::ReadHolding { index, count } => {
                master.read_holding_registers(slave, *index, *count)
            }
            Request::ReadInputs { index, count } => {
                master.read_input_registers(slave, *index, *count)
            }
            Request::WriteCoil { index, value } => master.write_coil(slave, *index, *value),
            Request::WriteHolding { index, value } => {
                master.write_holding_register(slave, *index, *value)
            }
            Request::WriteCoils { index, values } => master.write_coils(slave, *index, values),
            Request::WriteHoldings { index, values } => {
                master.write_holding_registers(slave, *index, values)
            }
            Request::DeviceInfo => master.read_device_info(slave),
        }
    }
}
