use bytes::{Buf, BufMut, BytesMut};
use nyamodbus::{Direction, Event, Frame, Packet, Parser};
use std::io::{Error, ErrorKind};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Runs the RTU framer over a byte stream.
///
/// Frames whose length follows from their function code are yielded as soon as their CRC
/// arrives. Frames that can only be terminated by line silence stay buffered until
/// [`RtuCodec::flush`] is called or the stream ends.
#[derive(Debug, Clone)]
pub struct RtuCodec {
    parser: Parser,
}

impl RtuCodec {
    pub fn new(direction: Direction) -> Self {
        Self {
            parser: Parser::new(direction),
        }
    }

    pub fn parser(&self) -> &Parser {
        &self.parser
    }

    /// Completes the frame in progress as if the quiet period had elapsed.
    pub fn flush(&mut self) -> Result<Option<Frame>, Error> {
        if self.parser.buffer().added() == 0 {
            return Ok(None);
        }

        let quiet = self.parser.timeouts().packet_wait_us;
        self.parser.start_timeout(quiet);
        match self.parser.tick(quiet) {
            Some(Event::Frame(frame)) => {
                trace!("Decoded frame {:?} on silence", frame);
                Ok(Some(frame))
            }
            Some(Event::Corrupt) => Err(corrupt()),
            Some(Event::Timeout) => {
                trace!("Dropped incomplete frame");
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

fn corrupt() -> Error {
    Error::new(ErrorKind::InvalidData, "frame CRC mismatch")
}

impl Decoder for RtuCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while src.has_remaining() {
            match self.parser.feed(src.get_u8()) {
                Some(Event::Frame(frame)) => {
                    trace!("Decoded frame {:?}", frame);
                    return Ok(Some(frame));
                }
                Some(Event::Corrupt) => return Err(corrupt()),
                Some(Event::Timeout) | None => {}
            }
        }

        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => self.flush(),
        }
    }
}

impl Encoder<Packet> for RtuCodec {
    type Error = Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        trace!("Encoding packet {:?}", item);

        dst.reserve(item.len() + 2);
        for byte in item.iter_bytes() {
            dst.put_u8(byte);
        }

        Ok(())
    }
}
