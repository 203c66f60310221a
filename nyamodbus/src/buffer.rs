use crate::config::RX_BUFFER_SIZE;

/// Fixed-capacity receive store.
///
/// `added` counts the bytes stored for the current frame and `expected` is the length
/// the frame must reach before the parser moves on. `added <= expected <= capacity`
/// holds at all times.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    data: [u8; RX_BUFFER_SIZE],
    added: usize,
    expected: usize,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self {
            data: [0; RX_BUFFER_SIZE],
            added: 0,
            expected: 0,
        }
    }
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn added(&self) -> usize {
        self.added
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Drops the current frame.
    pub fn reset(&mut self) {
        self.added = 0;
        self.expected = 0;
    }

    /// Moves the expected cursor. Fails when `total` is behind the bytes already stored
    /// or does not fit the buffer.
    pub fn expect(&mut self, total: usize) -> bool {
        if total < self.added || total > self.capacity() {
            return false;
        }
        self.expected = total;
        true
    }

    /// Stores a byte unless the expected length has already been reached.
    pub fn push(&mut self, byte: u8) -> bool {
        if self.added >= self.expected {
            return false;
        }
        self.data[self.added] = byte;
        self.added += 1;
        true
    }

    pub fn is_complete(&self) -> bool {
        self.added == self.expected
    }

    pub fn last(&self) -> Option<u8> {
        self.as_slice().last().copied()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.added]
    }
}
