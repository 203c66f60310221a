/// Receive buffer size. Largest RTU ADU is 256 bytes.
pub const RX_BUFFER_SIZE: usize = 256;

/// Send buffer size, CRC included.
pub const TX_BUFFER_SIZE: usize = 256;

/// Bytes pulled from the transport in one receive call.
pub const RX_CHUNK_SIZE: usize = 64;

/// Usecs of line silence that end a frame.
pub const PACKET_WAIT_TIMEOUT_US: u32 = 4500;

/// Usecs a master waits for the first byte of a reply.
pub const PACKET_START_TIMEOUT_US: u32 = 30000;

/// Requests sent here are executed by every slave and never answered.
pub const BROADCAST_ADDRESS: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Inter-frame quiet period
    pub packet_wait_us: u32,
    /// Window for the first byte of a response
    pub response_start_us: u32,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            packet_wait_us: PACKET_WAIT_TIMEOUT_US,
            response_start_us: PACKET_START_TIMEOUT_US,
        }
    }
}
