use core::ops::Range;

use tracing::{trace, warn};

use crate::config::{Timeouts, RX_CHUNK_SIZE, TX_BUFFER_SIZE};
use crate::packet::Packet;
use crate::parser::{Direction, Event, Parser};

/// Byte-level link the protocol engine runs over.
pub trait Transport {
    type Error: std::error::Error + 'static;

    /// Transmits one complete frame.
    fn send(&mut self, data: &[u8]) -> Result<(), Self::Error>;

    /// Copies newly available input into `buffer` and returns how many bytes were
    /// written. `Ok(0)` means nothing is available right now. Must not block.
    fn receive(&mut self, buffer: &mut [u8]) -> Result<usize, Self::Error>;

    /// Whether a transmission is still in progress on the line.
    fn is_tx_busy(&mut self) -> bool {
        false
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    type Error = T::Error;

    fn send(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        (**self).send(data)
    }

    fn receive(&mut self, buffer: &mut [u8]) -> Result<usize, Self::Error> {
        (**self).receive(buffer)
    }

    fn is_tx_busy(&mut self) -> bool {
        (**self).is_tx_busy()
    }
}

/// One communication endpoint: a transport plus the framer listening to it.
///
/// Bytes of a received chunk that follow a completed frame stay pending and are fed on
/// the next [`Device::poll`].
pub struct Device<T> {
    transport: T,
    parser: Parser,
    scratch: [u8; RX_CHUNK_SIZE],
    pending: Range<usize>,
}

impl<T: Transport> Device<T> {
    pub fn new(transport: T, direction: Direction) -> Self {
        Self::with_timeouts(transport, direction, Timeouts::default())
    }

    pub fn with_timeouts(transport: T, direction: Direction, timeouts: Timeouts) -> Self {
        Self {
            transport,
            parser: Parser::with_timeouts(direction, timeouts),
            scratch: [0; RX_CHUNK_SIZE],
            pending: 0..0,
        }
    }

    /// Discards any partial frame, pending input and running timer.
    pub fn reset(&mut self) {
        trace!("Resetting device");
        self.parser.reset();
        self.pending = 0..0;
    }

    /// Feeds available input to the framer until a frame completes or the input runs out.
    pub fn poll(&mut self) -> Option<Event> {
        if self.transport.is_tx_busy() {
            self.parser.reset_timeout();
        }

        let packet_wait = self.parser.timeouts().packet_wait_us;
        loop {
            if self.pending.is_empty() {
                match self.transport.receive(&mut self.scratch) {
                    Ok(0) => return None,
                    Ok(read) => {
                        let read = read.min(self.scratch.len());
                        trace!("Received {} bytes: {:02x?}", read, &self.scratch[..read]);
                        self.pending = 0..read;
                    }
                    Err(err) => {
                        warn!("Receive failed: {}", err);
                        return None;
                    }
                }
            }

            while let Some(i) = self.pending.next() {
                // silence, not a terminator, ends a frame
                self.parser.start_timeout(packet_wait);
                if let Some(event) = self.parser.feed(self.scratch[i]) {
                    return Some(event);
                }
            }
        }
    }

    /// Advances the quiet-period timer by `elapsed_us`.
    pub fn tick(&mut self, elapsed_us: u32) -> Option<Event> {
        self.parser.tick(elapsed_us)
    }

    /// Arms the quiet-period timer.
    pub fn start_timeout(&mut self) {
        let limit = self.parser.timeouts().packet_wait_us;
        self.parser.start_timeout(limit);
    }

    /// Arms the timer with the window a slave has to start answering.
    pub fn start_response_timeout(&mut self) {
        let limit = self.parser.timeouts().response_start_us;
        self.parser.start_timeout(limit);
    }

    pub fn reset_timeout(&mut self) {
        self.parser.reset_timeout();
    }

    pub fn is_busy(&self) -> bool {
        self.parser.is_busy()
    }

    /// Sends `packet` with its CRC appended, in a single transport write.
    pub fn send_packet(&mut self, packet: &Packet) -> Result<(), T::Error> {
        let mut wire = [0; TX_BUFFER_SIZE];
        let mut len = 0;
        for (slot, byte) in wire.iter_mut().zip(packet.iter_bytes()) {
            *slot = byte;
            len += 1;
        }

        trace!("Sending {} bytes: {:02x?}", len, &wire[..len]);
        self.transport.send(&wire[..len])
    }

    pub fn parser(&self) -> &Parser {
        &self.parser
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }
}
