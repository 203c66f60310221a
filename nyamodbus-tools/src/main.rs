use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{bail, Context, Result};
use nyamodbus::{Handler, Master, Slave};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use nyamodbus_tools::demo::{Contacts, Holding, Log};
use nyamodbus_tools::driver::Driver;
use nyamodbus_tools::emulator::{self, POLL_PERIOD};
use nyamodbus_tools::request::Request;
use nyamodbus_tools::serial::{Line, LineConfig, SerialTransport};

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Demo {
    /// 24 read-only contacts, every fourth one closed
    Contacts,
    /// 48 holding registers plus device identification
    Holding,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send one request over a serial port and print the response
    Master {
        #[command(flatten)]
        line: Line,

        #[arg(long, default_value_t = 0x11)]
        slave: u8,

        #[command(subcommand)]
        request: Request,
    },
    /// Serve a demo slave on a serial port
    Slave {
        #[command(flatten)]
        line: Line,

        #[arg(long, default_value_t = 0x11)]
        address: u8,

        #[arg(long, value_enum, default_value_t = Demo::Holding)]
        demo: Demo,
    },
    /// Play a scripted exchange between a master and a demo slave in-process
    Emulate {
        #[arg(long, default_value_t = 0x11)]
        address: u8,

        #[arg(long, value_enum, default_value_t = Demo::Contacts)]
        demo: Demo,
    },
}

#[derive(Parser, Debug)]
#[command()]
struct Args {
    #[arg(long, default_value = "info")]
    log_level: Level,

    #[command(subcommand)]
    command: Command,
}

fn spawn_sigint_watcher(token: CancellationToken) {
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
}

async fn run_master(line: LineConfig, slave: u8, request: Request) -> Result<()> {
    let transport = SerialTransport::open(&line).with_context(|| "Failed to open bus port")?;
    let mut master = Master::new(transport, Log::default());

    request
        .issue(&mut master, slave)
        .with_context(|| format!("Failed to send {:?}", request))?;
    Driver::new(POLL_PERIOD).complete(&mut master).await;

    if let Some((slave, error)) = master.listener().errors.first() {
        bail!("Slave {:#04x} failed the request: {}", slave, error);
    }
    Ok(())
}

async fn serve<H: Handler>(
    line: LineConfig,
    address: u8,
    handler: H,
    token: CancellationToken,
) -> Result<()> {
    let transport = SerialTransport::open(&line).with_context(|| "Failed to open bus port")?;
    let mut slave = Slave::new(transport, address, handler);

    info!("Serving slave {:#04x} on {}", address, line.path);
    Driver::new(POLL_PERIOD).run(&mut slave, token).await;
    Ok(())
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

    let token = CancellationToken::new();
    spawn_sigint_watcher(token.clone());

    match args.command {
        Command::Master {
            line,
            slave,
            request,
        } => run_master(line.into(), slave, request).await,
        Command::Slave {
            line,
            address,
            demo: Demo::Contacts,
        } => serve(line.into(), address, Contacts, token).await,
        Command::Slave {
            line,
            address,
            demo: Demo::Holding,
        } => serve(line.into(), address, Holding::default(), token).await,
        Command::Emulate { address, demo } => {
            let script = emulator::script();
            let log = match demo {
                Demo::Contacts => emulator::emulate(Contacts, address, &script, token).await,
                Demo::Holding => {
                    emulator::emulate(Holding::default(), address, &script, token).await
                }
            }
            .with_context(|| "Emulated master failed")?;

            info!(
                "Exchange finished: {} values decoded, {} writes confirmed, {} requests failed",
                log.decoded(),
                log.writes.len(),
                log.errors.len()
            );
            Ok(())
        }
    }
}
