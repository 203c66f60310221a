use std::time::Duration;

use nyamodbus::{Handler, Master, RequestError, Slave};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::demo::Log;
use crate::driver::Driver;
use crate::loopback::{Bus, LoopbackPort};
use crate::request::Request;

/// How often emulated nodes poll the bus
pub const POLL_PERIOD: Duration = Duration::from_millis(1);

/// The exchange the `emulate` subcommand plays against a demo slave.
pub fn script() -> Vec<Request> {
    vec![
        Request::ReadCoils { index: 1, count: 10 },
        Request::ReadContacts { index: 1, count: 10 },
        Request::ReadHolding { index: 1, count: 10 },
        Request::ReadInputs { index: 1, count: 10 },
        Request::WriteCoil { index: 1, value: true },
        Request::WriteHolding { index: 1, value: 0x1234 },
        Request::WriteCoils {
            index: 1,
            values: vec![true, false, true],
        },
        Request::WriteHoldings {
            index: 2,
            values: vec![0x000A, 0x0102],
        },
        Request::ReadHolding { index: 1, count: 3 },
        Request::DeviceInfo,
    ]
}

fn spawn_slave<H>(slave: Slave<LoopbackPort, H>, token: CancellationToken) -> JoinHandle<()>
where
    H: Handler + Send + 'static,
{
    tokio::spawn(async move {
        let mut slave = slave;
        Driver::new(POLL_PERIOD).run(&mut slave, token).await;
    })
}

/// Runs `requests` one after the other from a master against `handler` served on an
/// in-process bus, and returns everything the master decoded.
pub async fn emulate<H>(
    handler: H,
    address: u8,
    requests: &[Request],
    token: CancellationToken,
) -> Result<Log, RequestError<std::io::Error>>
where
    H: Handler + Send + 'static,
{
    let bus = Bus::new();
    let mut master = Master::new(bus.port(), Log::default());
    let slave_token = token.child_token();
    let slave = spawn_slave(Slave::new(bus.port(), address, handler), slave_token.clone());
    info!("Emulated slave {:#04x} is started", address);

    let mut driver = Driver::new(POLL_PERIOD);
    for request in requests {
        if token.is_cancelled() {
            break;
        }

        debug!("Issuing {:?}", request);
        request.issue(&mut master, address)?;
        driver.complete(&mut master).await;
    }

    slave_token.cancel();
    if let Err(err) = slave.await {
        debug!("Slave task ended abnormally: {}", err);
    }
    info!("Emulated slave {:#04x} is stopped", address);

    Ok(std::mem::take(master.listener_mut()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::{Contacts, Holding};
    use nyamodbus::{Error, FunctionCode};

    #[tokio::test]
    async fn test_contacts() -> Result<(), Box<dyn std::error::Error>> {
        let requests = [Request::ReadContacts { index: 1, count: 24 }];
        let log = emulate(Contacts, 0x11, &requests, CancellationToken::new()).await?;

        let closed: Vec<u16> = log
            .contacts
            .iter()
            .filter(|(_, value)| *value)
            .map(|(index, _)| *index)
            .collect();
        assert_eq!(log.contacts.len(), 24);
        assert_eq!(closed, vec![4, 8, 12, 16, 20, 24]);
        assert!(log.errors.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_contacts_out_of_range() -> Result<(), Box<dyn std::error::Error>> {
        let requests = [Request::ReadContacts { index: 20, count: 10 }];
        let log = emulate(Contacts, 0x11, &requests, CancellationToken::new()).await?;

        assert!(log.contacts.is_empty());
        assert_eq!(log.errors, vec![(0x11, Error::NoDataAddress)]);
        Ok(())
    }

    #[tokio::test]
    async fn test_holding_script() -> Result<(), Box<dyn std::error::Error>> {
        let log = emulate(Holding::default(), 0x11, &script(), CancellationToken::new()).await?;

        // coils, contacts, inputs and both coil writes are not served
        assert_eq!(log.errors.len(), 5);
        assert!(log.errors.iter().all(|e| *e == (0x11, Error::NoFunction)));

        assert_eq!(
            log.writes,
            vec![
                (FunctionCode::WriteHolding, 1, 0x1234),
                (FunctionCode::WriteHoldings, 2, 2),
            ]
        );
        assert_eq!(log.holdings.len(), 13);
        assert_eq!(
            log.holdings[10..],
            [(1, 0x1234), (2, 0x000A), (3, 0x0102)]
        );
        assert_eq!(
            log.info,
            vec![
                (0, "Nyamodbus".to_string()),
                (1, "Holding example".to_string()),
                (2, "v1.0.0".to_string()),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_absent_slave_times_out() -> Result<(), Box<dyn std::error::Error>> {
        let bus = Bus::new();
        let mut master = Master::new(bus.port(), Log::default());
        let mut driver = Driver::new(POLL_PERIOD);

        master.read_holding_registers(0x20, 1, 1)?;
        driver.complete(&mut master).await;

        assert_eq!(master.listener().errors, vec![(0x20, Error::Timeout)]);
        Ok(())
    }
}
