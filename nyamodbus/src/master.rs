use thiserror::Error;
use tracing::{debug, trace};

use crate::config::{Timeouts, BROADCAST_ADDRESS};
use crate::device::{Device, Transport};
use crate::error::Error as ModbusError;
use crate::function::{FunctionCode, EXCEPTION_BIT, MEI_READ_DEVICE_ID};
use crate::packet::{Packet, PacketFull};
use crate::parser::{Direction, Event, Frame};
use crate::pdu;

/// Basic identification objects (vendor, product code, revision)
const READ_DEVICE_ID_BASIC: u8 = 0x01;

const COIL_ON: u16 = 0xFF00;
const COIL_OFF: u16 = 0x0000;

#[derive(Debug, Error)]
pub enum RequestError<E: std::error::Error + 'static> {
    #[error("request does not fit the send buffer")]
    TooLarge,
    #[error("failed to send request")]
    Transport(#[source] E),
}

impl<E: std::error::Error + 'static> From<PacketFull> for RequestError<E> {
    fn from(_: PacketFull) -> Self {
        RequestError::TooLarge
    }
}

/// Receives decoded responses. Every method has an empty default, implement the ones
/// you care about.
pub trait Listener {
    /// Sees every valid frame before it is decoded. Return `true` to mark it handled.
    fn on_response(&mut self, _frame: &Frame) -> bool {
        false
    }

    /// Request failed: timeout or exception response
    fn on_error(&mut self, _slave: u8, _error: ModbusError) {}

    fn on_coil(&mut self, _slave: u8, _index: u16, _value: bool) {}

    fn on_contact(&mut self, _slave: u8, _index: u16, _value: bool) {}

    fn on_holding(&mut self, _slave: u8, _index: u16, _value: u16) {}

    fn on_input(&mut self, _slave: u8, _index: u16, _value: u16) {}

    /// Write confirmed. `value` is the written value for single writes and the
    /// register count for multi writes.
    fn on_write(&mut self, _slave: u8, _function: FunctionCode, _index: u16, _value: u16) {}

    fn on_device_info(&mut self, _slave: u8, _object: u8, _info: &[u8]) {}
}

impl Listener for () {}

/// Requesting side of the bus. One command can be outstanding at a time; issuing a new
/// one replaces it.
pub struct Master<T, L> {
    device: Device<T>,
    listener: L,
    command: Packet,
}

impl<T: Transport, L: Listener> Master<T, L> {
    pub fn new(transport: T, listener: L) -> Self {
        Self::with_timeouts(transport, listener, Timeouts::default())
    }

    pub fn with_timeouts(transport: T, listener: L, timeouts: Timeouts) -> Self {
        Self {
            device: Device::with_timeouts(transport, Direction::Response, timeouts),
            listener,
            command: Packet::new(),
        }
    }

    /// Drops the outstanding command and any partial response.
    pub fn reset(&mut self) {
        self.command.clear();
        self.device.reset();
    }

    /// A command is waiting for its response.
    pub fn is_busy(&self) -> bool {
        !self.command.is_empty() && self.device.is_busy()
    }

    /// Last transmitted command, without CRC
    pub fn last_command(&self) -> &[u8] {
        self.command.as_bytes()
    }

    pub fn read_coils(
        &mut self,
        slave: u8,
        index: u16,
        count: u16,
    ) -> Result<(), RequestError<T::Error>> {
        self.request(slave, FunctionCode::ReadCoils, index, count)
    }

    pub fn read_contacts(
        &mut self,
        slave: u8,
        index: u16,
        count: u16,
    ) -> Result<(), RequestError<T::Error>> {
        self.request(slave, FunctionCode::ReadContacts, index, count)
    }

    pub fn read_holding_registers(
        &mut self,
        slave: u8,
        index: u16,
        count: u16,
    ) -> Result<(), RequestError<T::Error>> {
        self.request(slave, FunctionCode::ReadHolding, index, count)
    }

    pub fn read_input_registers(
        &mut self,
        slave: u8,
        index: u16,
        count: u16,
    ) -> Result<(), RequestError<T::Error>> {
        self.request(slave, FunctionCode::ReadInputs, index, count)
    }

    pub fn write_coil(
        &mut self,
        slave: u8,
        index: u16,
        value: bool,
    ) -> Result<(), RequestError<T::Error>> {
        let value = if value { COIL_ON } else { COIL_OFF };
        self.request(slave, FunctionCode::WriteCoil, index, value)
    }

    pub fn write_holding_register(
        &mut self,
        slave: u8,
        index: u16,
        value: u16,
    ) -> Result<(), RequestError<T::Error>> {
        self.request(slave, FunctionCode::WriteHolding, index, value)
    }

    /// Coil `i` travels as bit `i % 16` of the big-endian word `i / 16`.
    pub fn write_coils(
        &mut self,
        slave: u8,
        index: u16,
        values: &[bool],
    ) -> Result<(), RequestError<T::Error>> {
        let count = u16::try_from(values.len()).map_err(|_| RequestError::TooLarge)?;
        let words = values.len().div_ceil(16);
        let size = u8::try_from(words * 2).map_err(|_| RequestError::TooLarge)?;

        let mut command = Self::header(slave, FunctionCode::WriteCoils, index, count)?;
        command.push_u8(size)?;
        for word in values.chunks(16) {
            let bits = word
                .iter()
                .enumerate()
                .filter(|(_, on)| **on)
                .fold(0u16, |bits, (bit, _)| bits | (1 << bit));
            command.push_u16(bits)?;
        }
        self.send_command(command)
    }

    /// Values travel big-endian, preceded by their byte count.
    pub fn write_holding_registers(
        &mut self,
        slave: u8,
        index: u16,
        values: &[u16],
    ) -> Result<(), RequestError<T::Error>> {
        let count = u16::try_from(values.len()).map_err(|_| RequestError::TooLarge)?;
        let size = u8::try_from(values.len() * 2).map_err(|_| RequestError::TooLarge)?;

        let mut command = Self::header(slave, FunctionCode::WriteHoldings, index, count)?;
        command.push_u8(size)?;
        for value in values {
            command.push_u16(*value)?;
        }
        self.send_command(command)
    }

    /// Reads the basic identification objects (vendor, product code, revision).
    pub fn read_device_info(&mut self, slave: u8) -> Result<(), RequestError<T::Error>> {
        let mut command = Packet::new();
        command.push_u8(slave)?;
        command.push_u8(FunctionCode::ReadDeviceIdentification.code())?;
        command.push_u8(MEI_READ_DEVICE_ID)?;
        command.push_u8(READ_DEVICE_ID_BASIC)?;
        command.push_u8(0)?;
        self.send_command(command)
    }

    /// Processes available input.
    pub fn poll(&mut self) {
        while let Some(event) = self.device.poll() {
            self.dispatch(event);
        }
    }

    /// Advances the response timer.
    pub fn tick(&mut self, elapsed_us: u32) {
        if let Some(event) = self.device.tick(elapsed_us) {
            self.dispatch(event);
        }
    }

    pub fn listener(&self) -> &L {
        &self.listener
    }

    pub fn listener_mut(&mut self) -> &mut L {
        &mut self.listener
    }

    pub fn device(&self) -> &Device<T> {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut Device<T> {
        &mut self.device
    }

    fn header(
        slave: u8,
        function: FunctionCode,
        index: u16,
        value: u16,
    ) -> Result<Packet, PacketFull> {
        let mut command = Packet::new();
        command.push_u8(slave)?;
        command.push_u8(function.code())?;
        command.push_u16(index)?;
        command.push_u16(value)?;
        Ok(command)
    }

    fn request(
        &mut self,
        slave: u8,
        function: FunctionCode,
        index: u16,
        value: u16,
    ) -> Result<(), RequestError<T::Error>> {
        let command = Self::header(slave, function, index, value)?;
        self.send_command(command)
    }

    fn send_command(&mut self, command: Packet) -> Result<(), RequestError<T::Error>> {
        let slave = command.as_bytes()[0];
        debug!("Sending command {:02x?}", command.as_bytes());

        self.device.reset();
        self.command = command;
        if let Err(err) = self.device.send_packet(&self.command) {
            self.command.clear();
            return Err(RequestError::Transport(err));
        }

        if slave != BROADCAST_ADDRESS {
            self.device.start_response_timeout();
        }
        Ok(())
    }

    fn dispatch(&mut self, event: Event) {
        match event {
            Event::Frame(frame) => self.on_frame(&frame),
            Event::Corrupt => {
                debug!("Dropping corrupt response");
                self.keep_waiting();
            }
            Event::Timeout => self.on_timeout(),
        }
    }

    /// A frame that did not answer the command must not stop the response timer.
    fn keep_waiting(&mut self) {
        if !self.command.is_empty() && self.command.as_bytes()[0] != BROADCAST_ADDRESS {
            self.device.start_timeout();
        }
    }

    fn on_timeout(&mut self) {
        let Some(&slave) = self.command.as_bytes().first() else {
            trace!("Quiet period elapsed with no command outstanding");
            return;
        };

        debug!("No response from slave {:#04x}", slave);
        self.command.clear();
        self.listener.on_error(slave, ModbusError::Timeout);
    }

    fn on_frame(&mut self, frame: &Frame) {
        trace!("Received {:?}", frame);

        if self.listener.on_response(frame) {
            self.command.clear();
            return;
        }

        let (slave, function) = match self.command.as_bytes() {
            [slave, function, ..] => (*slave, *function),
            _ => {
                debug!("Unsolicited frame from slave {:#04x}", frame.address());
                return;
            }
        };

        if slave != BROADCAST_ADDRESS && frame.address() != slave {
            debug!(
                "Response from slave {:#04x}, expected {:#04x}",
                frame.address(),
                slave
            );
            self.keep_waiting();
            return;
        }

        if frame.function() & !EXCEPTION_BIT != function {
            debug!(
                "Response to function {:#04x}, expected {:#04x}",
                frame.function(),
                function
            );
            self.keep_waiting();
            return;
        }

        let command = core::mem::take(&mut self.command);

        if frame.function() & EXCEPTION_BIT != 0 {
            let code = frame.body().first().copied().unwrap_or_default();
            debug!("Slave {:#04x} answered with exception {}", frame.address(), code);
            self.listener.on_error(frame.address(), ModbusError::from_code(code));
            return;
        }

        let Some(function) = FunctionCode::from_u8(function) else {
            debug!("No decoder for function {:#04x}", function);
            return;
        };
        let range = pdu::register_range(&command.as_bytes()[2..])
            .ok()
            .map(|(_, range)| range);

        match (function, range) {
            (FunctionCode::ReadDeviceIdentification, _) => self.decode_device_info(frame),
            (_, None) => {}
            (FunctionCode::ReadCoils, Some((index, count))) => {
                self.decode_digital(frame, index, count, L::on_coil)
            }
            (FunctionCode::ReadContacts, Some((index, count))) => {
                self.decode_digital(frame, index, count, L::on_contact)
            }
            (FunctionCode::ReadHolding, Some((index, count))) => {
                self.decode_analog(frame, index, count, L::on_holding)
            }
            (FunctionCode::ReadInputs, Some((index, count))) => {
                self.decode_analog(frame, index, count, L::on_input)
            }
            (
                FunctionCode::WriteCoil
                | FunctionCode::WriteHolding
                | FunctionCode::WriteCoils
                | FunctionCode::WriteHoldings,
                Some(_),
            ) => self.decode_write(frame, function),
        }
    }

    fn decode_digital(
        &mut self,
        frame: &Frame,
        index: u16,
        count: u16,
        report: fn(&mut L, u8, u16, bool),
    ) {
        let Ok((_, data)) = pdu::byte_block(frame.body()) else {
            return;
        };
        if data.len() != usize::from(count).div_ceil(8) {
            debug!("Expected {} coil bytes, got {}", usize::from(count).div_ceil(8), data.len());
            return;
        }

        for i in 0..count {
            let value = data[usize::from(i / 8)] & (1 << (i % 8)) != 0;
            report(&mut self.listener, frame.address(), index.wrapping_add(i), value);
        }
    }

    fn decode_analog(
        &mut self,
        frame: &Frame,
        index: u16,
        count: u16,
        report: fn(&mut L, u8, u16, u16),
    ) {
        let Ok((_, data)) = pdu::byte_block(frame.body()) else {
            return;
        };
        if data.len() != usize::from(count) * 2 {
            debug!("Expected {} register bytes, got {}", usize::from(count) * 2, data.len());
            return;
        }

        for (i, value) in (0..count).zip(data.chunks_exact(2)) {
            let value = u16::from_be_bytes([value[0], value[1]]);
            report(&mut self.listener, frame.address(), index.wrapping_add(i), value);
        }
    }

    fn decode_write(&mut self, frame: &Frame, function: FunctionCode) {
        if let Ok((_, (index, value))) = pdu::register_range(frame.body()) {
            self.listener.on_write(frame.address(), function, index, value);
        }
    }

    fn decode_device_info(&mut self, frame: &Frame) {
        let Ok((mut rest, header)) = pdu::device_id_header(frame.body()) else {
            return;
        };
        if header.mei_type != MEI_READ_DEVICE_ID {
            return;
        }

        for _ in 0..header.objects {
            let Ok((tail, (object, info))) = pdu::device_id_object(rest) else {
                debug!("Truncated device identification response");
                return;
            };
            self.listener.on_device_info(frame.address(), object, info);
            rest = tail;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PACKET_START_TIMEOUT_US, PACKET_WAIT_TIMEOUT_US};
    use crate::testing::{with_crc, MockTransport};

    #[derive(Debug, Default)]
    struct Recorder {
        errors: Vec<(u8, ModbusError)>,
        digital: Vec<(u8, u16, bool)>,
        analog: Vec<(u8, u16, u16)>,
        writes: Vec<(u8, FunctionCode, u16, u16)>,
        info: Vec<(u8, u8, Vec<u8>)>,
        intercept: bool,
        intercepted: usize,
    }

    impl Listener for Recorder {
        fn on_response(&mut self, _frame: &Frame) -> bool {
            if self.intercept {
                self.intercepted += 1;
            }
            self.intercept
        }

        fn on_error(&mut self, slave: u8, error: ModbusError) {
            self.errors.push((slave, error));
        }

        fn on_coil(&mut self, slave: u8, index: u16, value: bool) {
            self.digital.push((slave, index, value));
        }

        fn on_contact(&mut self, slave: u8, index: u16, value: bool) {
            self.digital.push((slave, index, value));
        }

        fn on_holding(&mut self, slave: u8, index: u16, value: u16) {
            self.analog.push((slave, index, value));
        }

        fn on_input(&mut self, slave: u8, index: u16, value: u16) {
            self.analog.push((slave, index, value));
        }

        fn on_write(&mut self, slave: u8, function: FunctionCode, index: u16, value: u16) {
            self.writes.push((slave, function, index, value));
        }

        fn on_device_info(&mut self, slave: u8, object: u8, info: &[u8]) {
            self.info.push((slave, object, info.to_vec()));
        }
    }

    fn master() -> Master<MockTransport, Recorder> {
        Master::new(MockTransport::default(), Recorder::default())
    }

    fn reply(master: &mut Master<MockTransport, Recorder>, data: &[u8]) {
        master.device_mut().transport_mut().queue(&with_crc(data));
        master.poll();
    }

    #[test]
    fn test_read_request_encoding() -> Result<(), Box<dyn std::error::Error>> {
        let mut master = master();
        master.read_holding_registers(0x11, 0x6B, 3)?;

        assert_eq!(
            master.device().transport().sent,
            vec![b"\x11\x03\x00\x6B\x00\x03\x76\x87".to_vec()]
        );
        assert_eq!(master.last_command(), b"\x11\x03\x00\x6B\x00\x03");
        assert!(master.is_busy());
        Ok(())
    }

    #[test]
    fn test_read_holding_response() -> Result<(), Box<dyn std::error::Error>> {
        let mut master = master();
        master.read_holding_registers(0x11, 0x6B, 3)?;
        reply(&mut master, b"\x11\x03\x06\x02\x2B\x00\x00\x00\x64");

        assert_eq!(
            master.listener().analog,
            vec![(0x11, 0x6B, 0x022B), (0x11, 0x6C, 0), (0x11, 0x6D, 0x64)]
        );
        assert!(!master.is_busy());
        assert!(master.last_command().is_empty());

        // no late timeout once answered
        master.tick(PACKET_START_TIMEOUT_US);
        assert!(master.listener().errors.is_empty());
        Ok(())
    }

    #[test]
    fn test_read_contacts_response() -> Result<(), Box<dyn std::error::Error>> {
        let mut master = master();
        master.read_contacts(0x11, 1, 10)?;
        reply(&mut master, b"\x11\x02\x02\x88\x00");

        let set: Vec<u16> = master
            .listener()
            .digital
            .iter()
            .filter(|(_, _, value)| *value)
            .map(|(_, index, _)| *index)
            .collect();
        assert_eq!(master.listener().digital.len(), 10);
        assert_eq!(set, vec![4, 8]);
        Ok(())
    }

    #[test]
    fn test_size_mismatch_is_not_decoded() -> Result<(), Box<dyn std::error::Error>> {
        let mut master = master();
        master.read_input_registers(0x11, 8, 2)?;
        reply(&mut master, b"\x11\x04\x02\x00\x01");

        assert!(master.listener().analog.is_empty());
        assert!(master.listener().errors.is_empty());
        Ok(())
    }

    #[test]
    fn test_foreign_response_is_ignored() -> Result<(), Box<dyn std::error::Error>> {
        let mut master = master();
        master.read_coils(0x20, 0, 8)?;
        reply(&mut master, b"\x21\x01\x01\xFF");
        reply(&mut master, b"\x20\x02\x01\xFF");

        assert!(master.listener().digital.is_empty());
        assert!(master.is_busy());

        reply(&mut master, b"\x20\x01\x01\x01");
        assert_eq!(master.listener().digital.len(), 8);
        assert_eq!(master.listener().digital[0], (0x20, 0, true));
        Ok(())
    }

    #[test]
    fn test_exception_response() -> Result<(), Box<dyn std::error::Error>> {
        let mut master = master();
        master.read_holding_registers(0x11, 0x100, 1)?;
        reply(&mut master, b"\x11\x83\x02");

        assert_eq!(master.listener().errors, vec![(0x11, ModbusError::NoDataAddress)]);
        assert!(master.listener().analog.is_empty());
        assert!(!master.is_busy());
        Ok(())
    }

    #[test]
    fn test_timeout() -> Result<(), Box<dyn std::error::Error>> {
        let mut master = master();
        master.read_coils(0x20, 1, 10)?;

        master.poll();
        master.tick(PACKET_START_TIMEOUT_US - 1);
        assert!(master.listener().errors.is_empty());
        assert!(master.is_busy());

        master.tick(1);
        assert_eq!(master.listener().errors, vec![(0x20, ModbusError::Timeout)]);
        assert!(!master.is_busy());
        assert!(!master.device().is_busy());
        assert_eq!(master.device().parser().buffer().added(), 0);

        // reusable right away
        master.read_coils(0x20, 1, 8)?;
        reply(&mut master, b"\x20\x01\x01\x00");
        assert_eq!(master.listener().digital.len(), 8);
        assert_eq!(master.listener().errors.len(), 1);
        Ok(())
    }

    #[test]
    fn test_corrupt_response_keeps_timer_running() -> Result<(), Box<dyn std::error::Error>> {
        let mut master = master();
        master.read_holding_registers(0x11, 0, 1)?;
        master
            .device_mut()
            .transport_mut()
            .queue(b"\x11\x03\x02\x00\x01\x00\x00");
        master.poll();

        assert!(master.is_busy());
        master.tick(PACKET_WAIT_TIMEOUT_US);
        assert_eq!(master.listener().errors, vec![(0x11, ModbusError::Timeout)]);
        Ok(())
    }

    #[test]
    fn test_broadcast_does_not_wait() -> Result<(), Box<dyn std::error::Error>> {
        let mut master = master();
        master.write_holding_register(BROADCAST_ADDRESS, 1, 3)?;

        assert_eq!(
            master.device().transport().sent,
            vec![b"\xFF\x06\x00\x01\x00\x03\x8D\xD5".to_vec()]
        );
        assert!(!master.is_busy());
        master.tick(PACKET_START_TIMEOUT_US);
        assert!(master.listener().errors.is_empty());
        Ok(())
    }

    #[test]
    fn test_write_holding_registers_encoding() -> Result<(), Box<dyn std::error::Error>> {
        let mut master = master();
        master.write_holding_registers(0x11, 1, &[0x000A, 0x0102])?;

        assert_eq!(
            master.device().transport().sent,
            vec![b"\x11\x10\x00\x01\x00\x02\x04\x00\x0A\x01\x02\xC6\xF0".to_vec()]
        );

        reply(&mut master, b"\x11\x10\x00\x01\x00\x02");
        assert_eq!(
            master.listener().writes,
            vec![(0x11, FunctionCode::WriteHoldings, 1, 2)]
        );
        Ok(())
    }

    #[test]
    fn test_write_coils_encoding() -> Result<(), Box<dyn std::error::Error>> {
        let mut master = master();
        let coils = [
            true, false, false, false, false, false, false, false, true, false,
        ];
        master.write_coils(0x11, 0x13, &coils)?;

        let sent = &master.device().transport().sent[0];
        assert_eq!(&sent[..9], b"\x11\x0F\x00\x13\x00\x0A\x02\x01\x01");
        for (i, coil) in coils.iter().enumerate() {
            assert_eq!(pdu::coil_bit(&sent[7..9], i as u16), *coil);
        }
        Ok(())
    }

    #[test]
    fn test_write_coil_encoding() -> Result<(), Box<dyn std::error::Error>> {
        let mut master = master();
        master.write_coil(0x11, 0xAC, true)?;
        assert_eq!(
            master.device().transport().sent,
            vec![b"\x11\x05\x00\xAC\xFF\x00\x4E\x8B".to_vec()]
        );
        Ok(())
    }

    #[test]
    fn test_oversized_write_is_rejected() {
        let mut master = master();
        let values = [0u16; 200];
        assert!(matches!(
            master.write_holding_registers(0x11, 0, &values),
            Err(RequestError::TooLarge)
        ));
        assert!(master.device().transport().sent.is_empty());
    }

    #[test]
    fn test_send_failure() {
        let mut master = master();
        master.device_mut().transport_mut().fail_send = true;

        assert!(matches!(
            master.read_coils(0x11, 0, 1),
            Err(RequestError::Transport(_))
        ));
        assert!(!master.is_busy());
        assert!(master.last_command().is_empty());
    }

    #[test]
    fn test_device_info_response() -> Result<(), Box<dyn std::error::Error>> {
        let mut master = master();
        master.read_device_info(0x11)?;
        assert_eq!(
            master.device().transport().sent,
            vec![b"\x11\x2B\x0E\x01\x00\xB1\xB4".to_vec()]
        );

        reply(
            &mut master,
            b"\x11\x2B\x0E\x01\x01\x00\x00\x03\x00\x03Nya\x01\x02v1\x02\x01x",
        );
        // the response has no lookahead, silence completes it
        master.tick(PACKET_WAIT_TIMEOUT_US);

        assert_eq!(
            master.listener().info,
            vec![
                (0x11, 0, b"Nya".to_vec()),
                (0x11, 1, b"v1".to_vec()),
                (0x11, 2, b"x".to_vec()),
            ]
        );
        assert!(master.listener().errors.is_empty());
        Ok(())
    }

    #[test]
    fn test_interceptor() -> Result<(), Box<dyn std::error::Error>> {
        let mut master = master();
        master.listener_mut().intercept = true;
        master.read_holding_registers(0x11, 0, 1)?;
        reply(&mut master, b"\x11\x03\x02\x00\x01");

        assert_eq!(master.listener().intercepted, 1);
        assert!(master.listener().analog.is_empty());
        assert!(!master.is_busy());
        Ok(())
    }
}
