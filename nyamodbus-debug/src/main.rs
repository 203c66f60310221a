use std::time::Duration;

use clap::{Parser, ValueEnum};
use color_eyre::eyre::{Context, Result};
use nyamodbus::config::PACKET_WAIT_TIMEOUT_US;
use nyamodbus::{Direction, Frame};
use nyamodbus_codec::RtuCodec;
use nyamodbus_tools::serial::{Line, LineConfig};
use tokio_serial::SerialPortBuilderExt;
use tokio_util::codec::Decoder;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

mod sniffer;

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Side {
    /// Decode frames sent by the master
    Request,
    /// Decode frames sent by the slaves
    Response,
}

impl From<Side> for Direction {
    fn from(side: Side) -> Self {
        match side {
            Side::Request => Direction::Request,
            Side::Response => Direction::Response,
        }
    }
}

#[derive(Parser, Debug)]
#[command()]
struct Args {
    #[arg(long, default_value = "info")]
    log_level: Level,

    #[command(flatten)]
    line: Line,

    #[arg(long, value_enum, default_value_t = Side::Request)]
    direction: Side,
}

fn open_serial(line: &LineConfig) -> Result<tokio_serial::SerialStream> {
    debug!(
        "Opening serial port {} (baudrate={}, parity={:?})",
        line.path, line.baudrate, line.parity
    );

    let serial = tokio_serial::new(line.path.as_str(), line.baudrate)
        .data_bits(tokio_serial::DataBits::Eight)
        .stop_bits(tokio_serial::StopBits::One)
        .parity(line.parity)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()?;
    Ok(serial)
}

fn log_frame(frame: &Frame) {
    info!(
        "Slave {:#04x} function {:#04x}: {:02x?}",
        frame.address(),
        frame.function(),
        frame.body()
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    tracing::subscriber::set_global_default(
        FmtSubscriber::builder()
            .with_max_level(args.log_level)
            .finish(),
    )?;

    let serial = open_serial(&args.line.into()).with_context(|| "Failed to open bus port")?;

    let frames = RtuCodec::new(args.direction.into()).framed(serial);
    let quiet = Duration::from_micros(PACKET_WAIT_TIMEOUT_US.into());
    sniffer::sniff(frames, quiet, log_frame).await;

    Ok(())
}
