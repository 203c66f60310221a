use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use nyamodbus::Transport;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::warn;

/// Frames in flight before a slow port starts losing them
const BUS_DEPTH: usize = 64;

/// In-process shared line: every frame sent by one port reaches all the others.
#[derive(Debug, Clone)]
pub struct Bus {
    sender: broadcast::Sender<(usize, Bytes)>,
    ports: Arc<AtomicUsize>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_DEPTH);
        Self {
            sender,
            ports: Arc::default(),
        }
    }

    /// Attaches a new port. It only sees frames sent after this call.
    pub fn port(&self) -> LoopbackPort {
        LoopbackPort {
            id: self.ports.fetch_add(1, Ordering::Relaxed),
            sender: self.sender.clone(),
            receiver: self.sender.subscribe(),
            pending: BytesMut::new(),
        }
    }
}

pub struct LoopbackPort {
    id: usize,
    sender: broadcast::Sender<(usize, Bytes)>,
    receiver: broadcast::Receiver<(usize, Bytes)>,
    pending: BytesMut,
}

impl Transport for LoopbackPort {
    type Error = io::Error;

    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        // nobody listening is a silent line, not an error
        let _ = self.sender.send((self.id, Bytes::copy_from_slice(data)));
        Ok(())
    }

    fn receive(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.receiver.try_recv() {
                Ok((id, frame)) if id != self.id => self.pending.extend_from_slice(&frame),
                Ok(_) => {}
                Err(TryRecvError::Lagged(missed)) => {
                    warn!("Port {} lost {} frames", self.id, missed)
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }

        let len = self.pending.len().min(buffer.len());
        self.pending.copy_to_slice(&mut buffer[..len]);
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_does_not_hear_itself() -> io::Result<()> {
        let bus = Bus::new();
        let mut a = bus.port();
        let mut b = bus.port();
        let mut c = bus.port();

        a.send(b"\x01\x02\x03")?;

        let mut buffer = [0; 2];
        assert_eq!(a.receive(&mut buffer)?, 0);
        assert_eq!(b.receive(&mut buffer)?, 2);
        assert_eq!(&buffer, b"\x01\x02");
        assert_eq!(b.receive(&mut buffer)?, 1);
        assert_eq!(buffer[0], 0x03);
        assert_eq!(c.receive(&mut buffer)?, 2);
        Ok(())
    }
}
