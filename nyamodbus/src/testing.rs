use std::collections::VecDeque;
use std::io;

use crate::crc::crc16;
use crate::device::Transport;

pub fn with_crc(data: &[u8]) -> Vec<u8> {
    let mut frame = data.to_vec();
    frame.extend_from_slice(&crc16(data).to_le_bytes());
    frame
}

/// In-memory transport: bytes queued in `incoming` are handed out by `receive`, every
/// `send` is recorded as one entry of `sent`.
#[derive(Debug, Default)]
pub struct MockTransport {
    pub incoming: VecDeque<u8>,
    pub sent: Vec<Vec<u8>>,
    pub chunk: Option<usize>,
    pub tx_busy: bool,
    pub fail_send: bool,
}

impl MockTransport {
    pub fn queue(&mut self, bytes: &[u8]) {
        self.incoming.extend(bytes);
    }
}

impl Transport for MockTransport {
    type Error = io::Error;

    fn send(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        if self.fail_send {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "send failed"));
        }
        self.sent.push(data.to_vec());
        Ok(())
    }

    fn receive(&mut self, buffer: &mut [u8]) -> Result<usize, Self::Error> {
        let limit = self.chunk.unwrap_or(buffer.len()).min(buffer.len());
        let mut read = 0;
        while read < limit {
            match self.incoming.pop_front() {
                Some(b) => {
                    buffer[read] = b;
                    read += 1;
                }
                None => break,
            }
        }
        Ok(read)
    }

    fn is_tx_busy(&mut self) -> bool {
        self.tx_busy
    }
}
