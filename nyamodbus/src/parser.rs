use core::fmt;

use tracing::trace;

use crate::buffer::FrameBuffer;
use crate::config::{Timeouts, RX_BUFFER_SIZE};
use crate::crc::{check_crc, CRC_LEN};
use crate::function::{FunctionCode, EXCEPTION_BIT};

/// Frames completed by silence are only checked from this length on
const MIN_FRAME_LEN: usize = 5;

/// End of the register address field
const ADDRESS_FIELD_END: usize = 4;
/// End of the register count / value field
const COUNT_FIELD_END: usize = 6;
/// Address, function, MEI type, read code, object id
const DEVICE_ID_REQUEST_HEADER: usize = 5;
/// Address, function | 0x80, exception code
const EXCEPTION_HEADER: usize = 3;

/// Which side of the conversation the framer is listening to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Frames sent by a master, parsed by a slave
    Request,
    /// Frames sent by a slave, parsed by a master
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    WaitAddress,
    WaitCode,
    WaitCustom,
    WaitFieldAddress,
    WaitFieldCount,
    WaitSize,
    WaitData,
    WaitCrc,
    /// Shape unknown, the quiet period ends the frame
    WaitSilence,
}

/// Remaining layout of a frame, decided once the function code is known
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Fields { has_data: bool },
    Custom(usize),
    Sized,
    Open,
}

fn shape(direction: Direction, code: u8) -> Shape {
    match direction {
        Direction::Request => match FunctionCode::from_u8(code) {
            Some(FunctionCode::ReadDeviceIdentification) => Shape::Custom(DEVICE_ID_REQUEST_HEADER),
            Some(function) => Shape::Fields {
                has_data: function.has_request_data(),
            },
            None => Shape::Open,
        },
        Direction::Response => {
            if code & EXCEPTION_BIT != 0 {
                return Shape::Custom(EXCEPTION_HEADER);
            }
            match FunctionCode::from_u8(code) {
                Some(function) if function.has_response_data() => Shape::Sized,
                Some(FunctionCode::ReadDeviceIdentification) | None => Shape::Open,
                Some(_) => Shape::Fields { has_data: false },
            }
        }
    }
}

/// A complete RTU frame with a valid CRC, copied out of the receive buffer.
#[derive(Clone)]
pub struct Frame {
    data: [u8; RX_BUFFER_SIZE],
    len: usize,
}

impl Frame {
    /// Copies a raw frame, CRC included. Returns `None` when it cannot hold an address,
    /// a function code and a CRC, or does not fit the receive buffer.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 2 + CRC_LEN || bytes.len() > RX_BUFFER_SIZE {
            return None;
        }
        let mut data = [0; RX_BUFFER_SIZE];
        data[..bytes.len()].copy_from_slice(bytes);
        Some(Self {
            data,
            len: bytes.len(),
        })
    }

    pub fn address(&self) -> u8 {
        self.data[0]
    }

    pub fn function(&self) -> u8 {
        self.data[1]
    }

    /// Bytes between the function code and the CRC
    pub fn body(&self) -> &[u8] {
        &self.data[2..self.len - CRC_LEN]
    }

    /// Address, function code and body, without the CRC
    pub fn without_crc(&self) -> &[u8] {
        &self.data[..self.len - CRC_LEN]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("address", &self.address())
            .field("function", &self.function())
            .field("body", &self.body())
            .finish()
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for Frame {}

/// Outcome of a completed parse cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Frame with a matching CRC
    Frame(Frame),
    /// Enough bytes for a frame, but the CRC did not match or the buffer overran
    Corrupt,
    /// Quiet period elapsed with too few bytes for a frame
    Timeout,
}

/// Byte-at-a-time RTU framer.
///
/// Knows the shape of each supported function code well enough to complete a frame as
/// soon as its CRC arrives. Anything else is completed by [`Parser::tick`] once the line
/// has been quiet for the configured period.
#[derive(Debug, Clone)]
pub struct Parser {
    direction: Direction,
    timeouts: Timeouts,
    step: Step,
    has_data: bool,
    custom_header: Option<usize>,
    overrun: bool,
    busy: bool,
    elapsed_us: u32,
    limit_us: u32,
    buffer: FrameBuffer,
}

impl Parser {
    pub fn new(direction: Direction) -> Self {
        Self::with_timeouts(direction, Timeouts::default())
    }

    pub fn with_timeouts(direction: Direction, timeouts: Timeouts) -> Self {
        let mut parser = Self {
            direction,
            timeouts,
            step: Step::WaitAddress,
            has_data: false,
            custom_header: None,
            overrun: false,
            busy: false,
            elapsed_us: 0,
            limit_us: timeouts.packet_wait_us,
            buffer: FrameBuffer::new(),
        };
        parser.reset();
        parser
    }

    /// Drops any partial frame and stops the timer.
    pub fn reset(&mut self) {
        self.step = Step::WaitAddress;
        self.has_data = false;
        self.custom_header = None;
        self.overrun = false;
        self.busy = false;
        self.elapsed_us = 0;
        self.limit_us = self.timeouts.packet_wait_us;
        self.buffer.reset();
        self.buffer.expect(1);
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    pub fn step(&self) -> Step {
        self.step
    }

    pub fn buffer(&self) -> &FrameBuffer {
        &self.buffer
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn has_data(&self) -> bool {
        self.has_data
    }

    pub fn custom_header(&self) -> Option<usize> {
        self.custom_header
    }

    /// Arms the countdown. It fires once `limit_us` has elapsed without a reset.
    pub fn start_timeout(&mut self, limit_us: u32) {
        self.busy = true;
        self.elapsed_us = 0;
        self.limit_us = limit_us;
    }

    /// Restarts a running countdown.
    pub fn reset_timeout(&mut self) {
        if self.busy {
            self.elapsed_us = 0;
        }
    }

    /// Advances the countdown and completes the frame when it expires.
    pub fn tick(&mut self, elapsed_us: u32) -> Option<Event> {
        if !self.busy {
            return None;
        }

        self.elapsed_us = self.elapsed_us.saturating_add(elapsed_us);
        if self.elapsed_us < self.limit_us {
            return None;
        }

        trace!(
            "Quiet period elapsed after {}us with {} bytes",
            self.elapsed_us,
            self.buffer.added()
        );
        Some(self.expire())
    }

    /// Advances the state machine by one byte.
    pub fn feed(&mut self, byte: u8) -> Option<Event> {
        if self.step == Step::WaitAddress {
            self.buffer.reset();
            self.buffer.expect(1);
        }

        if !self.buffer.push(byte) {
            // only an open-ended frame can outgrow the buffer
            self.overrun = true;
            return None;
        }

        if !self.buffer.is_complete() {
            return None;
        }

        self.advance()
    }

    fn advance(&mut self) -> Option<Event> {
        let added = self.buffer.added();
        match self.step {
            Step::WaitAddress => self.enter(Step::WaitCode, added + 1),
            Step::WaitCode => {
                let code = self.buffer.last().unwrap_or_default();
                self.classify(code);
            }
            Step::WaitCustom | Step::WaitData => self.enter(Step::WaitCrc, added + CRC_LEN),
            Step::WaitFieldAddress => self.enter(Step::WaitFieldCount, COUNT_FIELD_END),
            Step::WaitFieldCount => {
                if self.has_data {
                    self.enter(Step::WaitSize, added + 1);
                } else {
                    self.enter(Step::WaitCrc, added + CRC_LEN);
                }
            }
            Step::WaitSize => {
                let size = usize::from(self.buffer.last().unwrap_or_default());
                if size == 0 {
                    self.enter(Step::WaitCrc, added + CRC_LEN);
                } else {
                    self.enter(Step::WaitData, added + size);
                }
            }
            Step::WaitCrc => return Some(self.complete()),
            Step::WaitSilence => {}
        }
        None
    }

    fn classify(&mut self, code: u8) {
        self.has_data = false;
        self.custom_header = None;

        match shape(self.direction, code) {
            Shape::Fields { has_data } => {
                self.has_data = has_data;
                self.enter(Step::WaitFieldAddress, ADDRESS_FIELD_END);
            }
            Shape::Custom(size) => {
                self.custom_header = Some(size);
                self.enter(Step::WaitCustom, size);
            }
            Shape::Sized => {
                self.has_data = true;
                self.enter(Step::WaitSize, self.buffer.added() + 1);
            }
            Shape::Open => {
                trace!("No lookahead for function {:#04x}, waiting for silence", code);
                self.enter(Step::WaitSilence, self.buffer.capacity());
            }
        }
    }

    fn enter(&mut self, step: Step, total: usize) {
        if self.buffer.expect(total) {
            self.step = step;
            return;
        }

        trace!("Frame of {} bytes does not fit the receive buffer", total);
        self.overrun = true;
        self.step = Step::WaitSilence;
        self.buffer.expect(self.buffer.capacity());
    }

    fn expire(&mut self) -> Event {
        if self.buffer.added() < MIN_FRAME_LEN {
            self.reset();
            return Event::Timeout;
        }
        self.complete()
    }

    fn complete(&mut self) -> Event {
        let bytes = self.buffer.as_slice();
        let event = if !self.overrun && check_crc(bytes) {
            Frame::from_bytes(bytes).map_or(Event::Corrupt, Event::Frame)
        } else {
            trace!("Dropping corrupt frame {:02x?}", bytes);
            Event::Corrupt
        };

        self.reset();
        event
    }
}
