use std::io::{self, Read, Write};
use std::time::Duration;

use clap::ValueEnum;
use nyamodbus::Transport;
use tokio_serial::SerialPort;
use tracing::debug;

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum Parity {
    None,
    Even,
    Odd,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        }
    }
}

/// Command line flags selecting the serial line
#[derive(clap::Args, Debug)]
pub struct Line {
    #[arg(long, value_name = "TTY", value_hint = clap::ValueHint::FilePath)]
    pub tty_path: String,

    #[arg(short, long, default_value_t = 9600)]
    pub serial_baudrate: u32,

    #[arg(long, value_enum, default_value_t = Parity::None)]
    pub parity: Parity,
}

/// Serial line settings shared by every subcommand
#[derive(Debug, Clone)]
pub struct LineConfig {
    pub path: String,
    pub baudrate: u32,
    pub parity: tokio_serial::Parity,
}

impl From<Line> for LineConfig {
    fn from(line: Line) -> Self {
        LineConfig {
            path: line.tty_path,
            baudrate: line.serial_baudrate,
            parity: line.parity.into(),
        }
    }
}

/// Polled serial port. `receive` only reads what the driver already buffered, so it
/// never blocks the driver loop.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn open(config: &LineConfig) -> io::Result<Self> {
        debug!(
            "Opening serial port {} (baudrate={}, parity={:?})",
            config.path, config.baudrate, config.parity
        );

        let port = tokio_serial::new(config.path.as_str(), config.baudrate)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .parity(config.parity)
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(Duration::from_millis(10))
            .open()?;
        Ok(Self { port })
    }
}

impl Transport for SerialTransport {
    type Error = io::Error;

    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data)?;
        self.port.flush()
    }

    fn receive(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        let available = usize::try_from(self.port.bytes_to_read()?).unwrap_or(usize::MAX);
        if available == 0 {
            return Ok(0);
        }

        let len = available.min(buffer.len());
        self.port.read(&mut buffer[..len])
    }

    fn is_tx_busy(&mut self) -> bool {
        self.port.bytes_to_write().map(|n| n > 0).unwrap_or(false)
    }
}
