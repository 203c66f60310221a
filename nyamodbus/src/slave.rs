use tracing::{debug, trace, warn};

use crate::config::{Timeouts, BROADCAST_ADDRESS};
use crate::device::{Device, Transport};
use crate::error::{Error, Result};
use crate::function::{FunctionCode, EXCEPTION_BIT, MEI_READ_DEVICE_ID};
use crate::packet::Packet;
use crate::parser::{Direction, Event, Frame};
use crate::pdu;

/// Objects returned for a basic device identification request
const DEVICE_INFO_OBJECTS: u8 = 3;
/// Basic identification level
const CONFORMITY_BASIC: u8 = 0x01;

/// Address, function and byte count of a read response
const READ_RESPONSE_HEADER: usize = 3;

const COIL_ON: u16 = 0xFF00;
const COIL_OFF: u16 = 0x0000;

/// Register access supplied by the host application.
///
/// Every capability defaults to [`Error::NoFunction`], so a slave only answers the
/// functions its handler overrides.
pub trait Handler {
    /// Identification object `object`: 0 vendor name, 1 product code, 2 revision
    fn device_info(&mut self, _object: u8) -> Result<&str> {
        Err(Error::NoFunction)
    }

    fn read_contact(&mut self, _index: u16) -> Result<bool> {
        Err(Error::NoFunction)
    }

    fn read_coil(&mut self, _index: u16) -> Result<bool> {
        Err(Error::NoFunction)
    }

    fn write_coil(&mut self, _index: u16, _value: bool) -> Result<()> {
        Err(Error::NoFunction)
    }

    fn read_holding(&mut self, _index: u16) -> Result<u16> {
        Err(Error::NoFunction)
    }

    fn write_holding(&mut self, _index: u16, _value: u16) -> Result<()> {
        Err(Error::NoFunction)
    }

    fn read_input(&mut self, _index: u16) -> Result<u16> {
        Err(Error::NoFunction)
    }
}

fn parse<'a, O>(
    parser: impl FnOnce(&'a [u8]) -> nom::IResult<&'a [u8], O>,
    body: &'a [u8],
) -> Result<O> {
    parser(body)
        .map(|(_, output)| output)
        .map_err(|_| Error::InvalidRequestValue)
}

/// Responding side of the bus.
pub struct Slave<T, H> {
    device: Device<T>,
    address: u8,
    handler: H,
}

impl<T: Transport, H: Handler> Slave<T, H> {
    pub fn new(transport: T, address: u8, handler: H) -> Self {
        Self::with_timeouts(transport, address, handler, Timeouts::default())
    }

    pub fn with_timeouts(transport: T, address: u8, handler: H, timeouts: Timeouts) -> Self {
        Self {
            device: Device::with_timeouts(transport, Direction::Request, timeouts),
            address,
            handler,
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn set_address(&mut self, address: u8) {
        self.address = address;
    }

    pub fn reset(&mut self) {
        self.device.reset();
    }

    /// Processes available input, answering every complete request.
    pub fn poll(&mut self) {
        while let Some(event) = self.device.poll() {
            self.dispatch(event);
        }
    }

    /// Advances the quiet-period timer.
    pub fn tick(&mut self, elapsed_us: u32) {
        if let Some(event) = self.device.tick(elapsed_us) {
            self.dispatch(event);
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn device(&self) -> &Device<T> {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut Device<T> {
        &mut self.device
    }

    fn dispatch(&mut self, event: Event) {
        match event {
            Event::Frame(frame) => self.on_frame(&frame),
            Event::Corrupt => trace!("Dropping corrupt request"),
            Event::Timeout => trace!("Dropping incomplete request"),
        }
    }

    fn on_frame(&mut self, frame: &Frame) {
        let broadcast = frame.address() == BROADCAST_ADDRESS;
        if frame.address() != self.address && !broadcast {
            trace!("Request for slave {:#04x}, ignoring", frame.address());
            return;
        }

        match self.process(frame) {
            Ok(None) => {}
            Ok(Some(_)) if broadcast => trace!("Broadcast request, not answering"),
            Ok(Some(response)) => self.respond(&response),
            Err(error) if broadcast => {
                debug!("Broadcast function {:#04x} failed: {}", frame.function(), error)
            }
            Err(error) => {
                debug!("Function {:#04x} failed: {}", frame.function(), error);
                self.send_error(frame.function(), error);
            }
        }
    }

    /// Executes a request, returning the response to send, if any.
    fn process(&mut self, frame: &Frame) -> Result<Option<Packet>> {
        let Some(function) = FunctionCode::from_u8(frame.function()) else {
            return Err(Error::NoFunction);
        };
        let body = frame.body();

        let response = match function {
            FunctionCode::ReadCoils => self.read_digital(function, body, H::read_coil)?,
            FunctionCode::ReadContacts => self.read_digital(function, body, H::read_contact)?,
            FunctionCode::ReadHolding => self.read_analog(function, body, H::read_holding)?,
            FunctionCode::ReadInputs => self.read_analog(function, body, H::read_input)?,
            FunctionCode::WriteCoil => {
                let (index, value) = parse(pdu::register_range, body)?;
                let value = match value {
                    COIL_ON => true,
                    COIL_OFF => false,
                    _ => return Err(Error::InvalidRequestValue),
                };
                debug!("WRITE_COIL: {:04x} = {}", index, value);
                self.handler.write_coil(index, value)?;
                Packet::from_slice(frame.without_crc())?
            }
            FunctionCode::WriteHolding => {
                let (index, value) = parse(pdu::register_range, body)?;
                debug!("WRITE_HOLDING: {:04x} = {:04x}", index, value);
                self.handler.write_holding(index, value)?;
                Packet::from_slice(frame.without_crc())?
            }
            FunctionCode::WriteCoils => {
                let (index, count, data) = parse(pdu::write_block, body)?;
                debug!("WRITE_COIL_MULTI: {:04x} count {} ({} bytes)", index, count, data.len());
                if data.len() * 8 < usize::from(count) {
                    return Err(Error::InvalidRequestValue);
                }
                for i in 0..count {
                    let reg = index.wrapping_add(i);
                    let value = pdu::coil_bit(data, i);
                    trace!("REG {:04x} = {}", reg, value);
                    self.handler.write_coil(reg, value)?;
                }
                self.write_confirmation(function, index, count)?
            }
            FunctionCode::WriteHoldings => {
                let (index, count, data) = parse(pdu::write_block, body)?;
                debug!("WRITE_HOLDING_MULTI: {:04x} count {} ({} bytes)", index, count, data.len());
                if data.len() != usize::from(count) * 2 {
                    return Err(Error::InvalidRequestValue);
                }
                let registers = (0..count).map(|i| index.wrapping_add(i));
                for (reg, value) in registers.zip(data.chunks_exact(2)) {
                    let value = u16::from_be_bytes([value[0], value[1]]);
                    trace!("REG {:04x} = {:04x}", reg, value);
                    self.handler.write_holding(reg, value)?;
                }
                self.write_confirmation(function, index, count)?
            }
            FunctionCode::ReadDeviceIdentification => {
                let request = parse(pdu::device_id_request, body)?;
                if request.mei_type != MEI_READ_DEVICE_ID {
                    debug!("Unknown MEI type {:#04x} for function 43, ignoring", request.mei_type);
                    return Ok(None);
                }
                self.read_device_info(request.read_code)?
            }
        };

        Ok(Some(response))
    }

    fn read_digital(
        &mut self,
        function: FunctionCode,
        body: &[u8],
        read: fn(&mut H, u16) -> Result<bool>,
    ) -> Result<Packet> {
        let (index, count) = parse(pdu::register_range, body)?;
        debug!("{:?}: {:04x} count {}", function, index, count);

        let mut response = Packet::new();
        let bytes = usize::from(count).div_ceil(8);
        if count == 0 || READ_RESPONSE_HEADER + bytes > response.capacity() {
            return Err(Error::InvalidRequestValue);
        }

        response.push_u8(self.address)?;
        response.push_u8(function.code())?;
        response.push_u8(u8::try_from(bytes).map_err(|_| Error::InvalidRequestValue)?)?;

        let mut value = 0u8;
        for i in 0..count {
            let reg = index.wrapping_add(i);
            let on = read(&mut self.handler, reg)?;
            trace!("REG {:04x} = {}", reg, on);

            if on {
                value |= 1 << (i % 8);
            }
            if i % 8 == 7 {
                response.push_u8(value)?;
                value = 0;
            }
        }
        if count % 8 != 0 {
            response.push_u8(value)?;
        }

        Ok(response)
    }

    fn read_analog(
        &mut self,
        function: FunctionCode,
        body: &[u8],
        read: fn(&mut H, u16) -> Result<u16>,
    ) -> Result<Packet> {
        let (index, count) = parse(pdu::register_range, body)?;
        debug!("{:?}: {:04x} count {}", function, index, count);

        let mut response = Packet::new();
        let bytes = usize::from(count) * 2;
        if count == 0 || READ_RESPONSE_HEADER + bytes > response.capacity() {
            return Err(Error::InvalidRequestValue);
        }

        response.push_u8(self.address)?;
        response.push_u8(function.code())?;
        response.push_u8(u8::try_from(bytes).map_err(|_| Error::InvalidRequestValue)?)?;

        for i in 0..count {
            let reg = index.wrapping_add(i);
            let value = read(&mut self.handler, reg)?;
            trace!("REG {:04x} = {:04x}", reg, value);
            response.push_u16(value)?;
        }

        Ok(response)
    }

    fn write_confirmation(&self, function: FunctionCode, index: u16, count: u16) -> Result<Packet> {
        let mut response = Packet::new();
        response.push_u8(self.address)?;
        response.push_u8(function.code())?;
        response.push_u16(index)?;
        response.push_u16(count)?;
        Ok(response)
    }

    fn read_device_info(&mut self, read_code: u8) -> Result<Packet> {
        debug!("READ_DEVICE_IDENTIFICATION: code {:#04x}", read_code);

        let mut response = Packet::new();
        response.push_u8(self.address)?;
        response.push_u8(FunctionCode::ReadDeviceIdentification.code())?;
        response.push_u8(MEI_READ_DEVICE_ID)?;
        response.push_u8(read_code)?;
        response.push_u8(CONFORMITY_BASIC)?;
        // no more follows, next object 0
        response.push_u8(0)?;
        response.push_u8(0)?;
        response.push_u8(DEVICE_INFO_OBJECTS)?;

        for object in 0..DEVICE_INFO_OBJECTS {
            let info = self.handler.device_info(object)?.as_bytes();
            // every object still to come keeps room for its id and length
            let headers = 2 * usize::from(DEVICE_INFO_OBJECTS - object);
            let room = response.remaining().saturating_sub(headers).min(usize::from(u8::MAX));
            let info = &info[..info.len().min(room)];

            response.push_u8(object)?;
            response.push_u8(info.len() as u8)?;
            response.extend(info)?;
        }

        Ok(response)
    }

    fn send_error(&mut self, function: u8, error: Error) {
        // a local timeout has no wire code, report it as a slave failure
        let code = error.code().or(Error::Unrecoverable.code()).unwrap_or_default();
        match Packet::from_slice(&[self.address, function | EXCEPTION_BIT, code]) {
            Ok(response) => self.respond(&response),
            Err(err) => warn!("Failed to build exception response: {}", err),
        }
    }

    fn respond(&mut self, response: &Packet) {
        if let Err(err) = self.device.send_packet(response) {
            warn!("Failed to send response: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PACKET_WAIT_TIMEOUT_US;
    use crate::master::Master;
    use crate::testing::{with_crc, MockTransport};

    const ADDRESS: u8 = 0x11;

    #[derive(Debug, Default)]
    struct Registers {
        coils: Vec<(u16, bool)>,
        holdings: Vec<(u16, u16)>,
    }

    impl Handler for Registers {
        fn device_info(&mut self, object: u8) -> Result<&str> {
            match object {
                0 => Ok("Nyamodbus"),
                1 => Ok("Holding example"),
                2 => Ok("v1.0.0"),
                _ => Err(Error::NoDataAddress),
            }
        }

        fn read_contact(&mut self, index: u16) -> Result<bool> {
            Ok(index % 4 == 0)
        }

        fn write_coil(&mut self, index: u16, value: bool) -> Result<()> {
            self.coils.push((index, value));
            Ok(())
        }

        fn read_holding(&mut self, index: u16) -> Result<u16> {
            if index >= 0x100 {
                return Err(Error::NoDataAddress);
            }
            Ok(index)
        }

        fn write_holding(&mut self, index: u16, value: u16) -> Result<()> {
            self.holdings.push((index, value));
            Ok(())
        }
    }

    struct Empty;

    impl Handler for Empty {}

    fn slave() -> Slave<MockTransport, Registers> {
        Slave::new(MockTransport::default(), ADDRESS, Registers::default())
    }

    fn request<H: Handler>(slave: &mut Slave<MockTransport, H>, data: &[u8]) -> Vec<Vec<u8>> {
        slave.device_mut().transport_mut().queue(data);
        slave.poll();
        core::mem::take(&mut slave.device_mut().transport_mut().sent)
    }

    #[test]
    fn test_read_holding() {
        let mut slave = slave();
        let sent = request(&mut slave, b"\x11\x03\x00\x6B\x00\x03\x76\x87");

        assert_eq!(
            sent,
            vec![with_crc(b"\x11\x03\x06\x00\x6B\x00\x6C\x00\x6D")]
        );
    }

    #[test]
    fn test_chunking_does_not_change_the_response() {
        let expected = with_crc(b"\x11\x03\x06\x00\x6B\x00\x6C\x00\x6D");
        for chunk in 1..=8 {
            let mut slave = slave();
            slave.device_mut().transport_mut().chunk = Some(chunk);
            let sent = request(&mut slave, b"\x11\x03\x00\x6B\x00\x03\x76\x87");
            assert_eq!(sent, vec![expected.clone()], "chunk size {}", chunk);
        }
    }

    #[test]
    fn test_back_to_back_requests() {
        let mut slave = slave();
        let mut input = b"\x11\x03\x00\x6B\x00\x03\x76\x87".to_vec();
        input.extend(with_crc(b"\x11\x06\x00\x01\x00\x03"));
        let sent = request(&mut slave, &input);

        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1], with_crc(b"\x11\x06\x00\x01\x00\x03"));
        assert_eq!(slave.handler().holdings, vec![(1, 3)]);
    }

    #[test]
    fn test_read_contacts_bit_order() {
        let mut slave = slave();
        let sent = request(&mut slave, &with_crc(b"\x11\x02\x00\x01\x00\x0A"));

        assert_eq!(sent, vec![with_crc(b"\x11\x02\x02\x88\x00")]);
    }

    #[test]
    fn test_broadcast_is_not_answered() {
        let mut slave = slave();
        let sent = request(&mut slave, b"\xFF\x06\x00\x01\x00\x03\x8D\xD5");

        assert!(sent.is_empty());
        assert_eq!(slave.handler().holdings, vec![(1, 3)]);

        // failures stay silent too
        let sent = request(&mut slave, &with_crc(b"\xFF\x04\x00\x00\x00\x01"));
        assert!(sent.is_empty());
    }

    #[test]
    fn test_foreign_address_is_ignored() {
        let mut slave = slave();
        let sent = request(&mut slave, &with_crc(b"\x12\x06\x00\x01\x00\x03"));

        assert!(sent.is_empty());
        assert!(slave.handler().holdings.is_empty());

        slave.set_address(0x12);
        let sent = request(&mut slave, &with_crc(b"\x12\x06\x00\x01\x00\x03"));
        assert_eq!(sent.len(), 1);
    }

    #[test]
    fn test_write_holding_registers_from_master(
    ) -> core::result::Result<(), Box<dyn std::error::Error>> {
        let mut master = Master::new(MockTransport::default(), ());
        master.write_holding_registers(ADDRESS, 1, &[0x000A, 0x0102])?;
        let wire = master.device().transport().sent[0].clone();

        let mut slave = slave();
        let sent = request(&mut slave, &wire);

        assert_eq!(slave.handler().holdings, vec![(1, 0x000A), (2, 0x0102)]);
        assert_eq!(sent, vec![with_crc(b"\x11\x10\x00\x01\x00\x02")]);
        Ok(())
    }

    #[test]
    fn test_write_coils() {
        let mut slave = slave();
        let sent = request(
            &mut slave,
            b"\x11\x0F\x00\x13\x00\x0A\x02\xCD\x01\xBF\x0B",
        );

        let set: Vec<u16> = slave
            .handler()
            .coils
            .iter()
            .filter(|(_, value)| *value)
            .map(|(index, _)| *index)
            .collect();
        assert_eq!(slave.handler().coils.len(), 10);
        assert_eq!(set, vec![0x13, 0x1B]);
        assert_eq!(sent, vec![with_crc(b"\x11\x0F\x00\x13\x00\x0A")]);
    }

    #[test]
    fn test_write_coil() {
        let mut slave = slave();
        let sent = request(&mut slave, b"\x11\x05\x00\xAC\xFF\x00\x4E\x8B");
        assert_eq!(sent, vec![b"\x11\x05\x00\xAC\xFF\x00\x4E\x8B".to_vec()]);
        assert_eq!(slave.handler().coils, vec![(0xAC, true)]);

        let sent = request(&mut slave, &with_crc(b"\x11\x05\x00\xAC\x12\x34"));
        assert_eq!(sent, vec![with_crc(b"\x11\x85\x03")]);
        assert_eq!(slave.handler().coils.len(), 1);
    }

    #[test]
    fn test_missing_capability() {
        let mut slave = Slave::new(MockTransport::default(), ADDRESS, Empty);
        let sent = request(&mut slave, &with_crc(b"\x11\x04\x00\x00\x00\x01"));

        assert_eq!(sent, vec![with_crc(b"\x11\x84\x01")]);
    }

    #[test]
    fn test_handler_error_is_reported() {
        let mut slave = slave();
        let sent = request(&mut slave, &with_crc(b"\x11\x03\x00\xFF\x00\x02"));

        assert_eq!(sent, vec![with_crc(b"\x11\x83\x02")]);
    }

    #[test]
    fn test_invalid_counts() {
        let mut slave = slave();
        let sent = request(&mut slave, &with_crc(b"\x11\x03\x00\x00\x00\x00"));
        assert_eq!(sent, vec![with_crc(b"\x11\x83\x03")]);

        // 200 registers do not fit one response
        let sent = request(&mut slave, &with_crc(b"\x11\x03\x00\x00\x00\xC8"));
        assert_eq!(sent, vec![with_crc(b"\x11\x83\x03")]);

        // declared size disagrees with the count
        let sent = request(
            &mut slave,
            &with_crc(b"\x11\x10\x00\x01\x00\x02\x02\x00\x0A"),
        );
        assert_eq!(sent, vec![with_crc(b"\x11\x90\x03")]);
        assert!(slave.handler().holdings.is_empty());
    }

    #[test]
    fn test_unknown_function() {
        let mut slave = slave();
        let sent = request(&mut slave, &with_crc(b"\x11\x07\x00\x00"));
        assert!(sent.is_empty());

        slave.tick(PACKET_WAIT_TIMEOUT_US);
        assert_eq!(
            slave.device().transport().sent,
            vec![with_crc(b"\x11\x87\x01")]
        );
    }

    #[test]
    fn test_device_info() {
        let mut slave = slave();
        let sent = request(&mut slave, &with_crc(b"\x11\x2B\x0E\x01\x00"));

        let mut expected = b"\x11\x2B\x0E\x01\x01\x00\x00\x03".to_vec();
        expected.extend(b"\x00\x09Nyamodbus");
        expected.extend(b"\x01\x0FHolding example");
        expected.extend(b"\x02\x06v1.0.0");
        assert_eq!(sent, vec![with_crc(&expected)]);
    }

    struct LongVendor(String);

    impl Handler for LongVendor {
        fn device_info(&mut self, object: u8) -> Result<&str> {
            match object {
                0 => Ok(&self.0),
                1 => Ok("Holding example"),
                2 => Ok("v1.0.0"),
                _ => Err(Error::NoDataAddress),
            }
        }
    }

    #[test]
    fn test_device_info_long_vendor_is_truncated() {
        let handler = LongVendor("V".repeat(300));
        let mut slave = Slave::new(MockTransport::default(), ADDRESS, handler);
        let sent = request(&mut slave, &with_crc(b"\x11\x2B\x0E\x01\x00"));
        assert_eq!(sent.len(), 1);

        // 8 header bytes, then the vendor cut so the two trailing headers still fit
        let mut expected = b"\x11\x2B\x0E\x01\x01\x00\x00\x03".to_vec();
        expected.extend(b"\x00\xF0");
        expected.extend([b'V'; 240]);
        expected.extend(b"\x01\x00");
        expected.extend(b"\x02\x00");
        assert_eq!(sent[0], with_crc(&expected));
        assert_eq!(sent[0].len(), 256);
    }

    #[test]
    fn test_device_info_other_mei_type_is_ignored() {
        let mut slave = slave();
        let sent = request(&mut slave, &with_crc(b"\x11\x2B\x0D\x01\x00"));
        assert!(sent.is_empty());
    }

    #[test]
    fn test_corrupt_request_is_dropped() {
        let mut slave = slave();
        let sent = request(&mut slave, b"\x11\x03\x00\x6B\x00\x03\x76\x88");
        assert!(sent.is_empty());
        assert!(!slave.device().is_busy());
    }
}
