use thiserror::Error;

use crate::config::TX_BUFFER_SIZE;
use crate::crc::{crc16, CRC_LEN};
use crate::error::Error as ModbusError;

/// Raised when a packet would not leave room for its CRC in the send buffer.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("packet does not fit the send buffer")]
pub struct PacketFull;

impl From<PacketFull> for ModbusError {
    fn from(_: PacketFull) -> Self {
        ModbusError::InvalidRequestValue
    }
}

/// Outgoing frame without its CRC. The CRC is appended while the bytes are iterated.
#[derive(Clone)]
pub struct Packet {
    data: [u8; TX_BUFFER_SIZE],
    len: usize,
}

impl Default for Packet {
    fn default() -> Self {
        Self {
            data: [0; TX_BUFFER_SIZE],
            len: 0,
        }
    }
}

impl core::fmt::Debug for Packet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("Packet").field(&self.as_bytes()).finish()
    }
}

impl Packet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, PacketFull> {
        let mut packet = Self::new();
        packet.extend(bytes)?;
        Ok(packet)
    }

    /// Room for address, function and payload
    pub const fn capacity(&self) -> usize {
        TX_BUFFER_SIZE - CRC_LEN
    }

    pub fn remaining(&self) -> usize {
        self.capacity() - self.len
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn push_u8(&mut self, byte: u8) -> Result<(), PacketFull> {
        self.extend(&[byte])
    }

    /// Big-endian, as every 16-bit field on the wire
    pub fn push_u16(&mut self, value: u16) -> Result<(), PacketFull> {
        self.extend(&value.to_be_bytes())
    }

    pub fn extend(&mut self, bytes: &[u8]) -> Result<(), PacketFull> {
        if bytes.len() > self.remaining() {
            return Err(PacketFull);
        }
        self.data[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }

    /// Wire bytes: the packet followed by its CRC, low byte first.
    pub fn iter_bytes(&self) -> PacketIterator<'_> {
        PacketIterator::new(self)
    }
}

pub struct PacketIterator<'a> {
    packet: &'a Packet,
    crc: [u8; CRC_LEN],
    index: usize,
}

impl<'a> PacketIterator<'a> {
    fn new(packet: &'a Packet) -> Self {
        Self {
            packet,
            crc: crc16(packet.as_bytes()).to_le_bytes(),
            index: 0,
        }
    }
}

impl Iterator for PacketIterator<'_> {
    type Item = u8;

    fn next(&mut self) -> Option<Self::Item> {
        let len = self.packet.len();
        let b = if self.index < len {
            self.packet.data[self.index]
        } else if self.index < len + CRC_LEN {
            self.crc[self.index - len]
        } else {
            return None;
        };
        self.index += 1;
        Some(b)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.packet.len() + CRC_LEN).saturating_sub(self.index);
        (left, Some(left))
    }
}

impl ExactSizeIterator for PacketIterator<'_> {}
