//! Modbus RTU protocol engine: a byte-at-a-time framer plus master and slave roles
//! running over any [`Transport`].

pub use config::Timeouts;
pub use device::{Device, Transport};
pub use error::{Error, Result};
pub use function::FunctionCode;
pub use master::{Listener, Master, RequestError};
pub use packet::{Packet, PacketFull};
pub use parser::{Direction, Event, Frame, Parser, Step};
pub use slave::{Handler, Slave};

pub mod buffer;
pub mod config;
pub mod crc;
pub mod device;
pub mod error;
pub mod function;
pub mod master;
pub mod packet;
pub mod parser;
pub mod pdu;
pub mod slave;

#[cfg(test)]
mod testing;
