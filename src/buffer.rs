//! Fixed-capacity staging buffer between a socket's input and its peer's output.

/// Capacity of every relay buffer. One buffer per socket, allocated once for
/// the socket's lifetime; there is no allocator on the I/O path.
pub const BUFFER_SIZE: usize = 10 * 1024;

/// Contiguous byte region with head/tail cursors.
///
/// Bytes in `[head, tail)` are pending delivery; `[tail, BUFFER_SIZE)` is free.
/// The producer of a buffer is the *peer* socket (it reads from its descriptor
/// into this buffer); the consumer is the owning socket (it writes the pending
/// bytes to its own descriptor).
pub struct Buffer {
    data: Box<[u8; BUFFER_SIZE]>,
    head: usize,
    tail: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self {
            data: Box::new([0u8; BUFFER_SIZE]),
            head: 0,
            tail: 0,
        }
    }

    pub fn remaining_capacity(&self) -> usize {
        BUFFER_SIZE - self.tail
    }

    /// Whether another read can be staged. Gates reads from the peer; this is
    /// the natural backpressure signal.
    pub fn has_remaining_capacity(&self) -> bool {
        self.tail < BUFFER_SIZE
    }

    pub fn remaining_data(&self) -> usize {
        self.tail - self.head
    }

    /// All pending bytes delivered. Gates closing the downstream side.
    pub fn consumed(&self) -> bool {
        self.head >= self.tail
    }

    /// Free region after the pending bytes, for one read syscall.
    pub fn free_space(&mut self) -> &mut [u8] {
        &mut self.data[self.tail..]
    }

    /// Pending bytes awaiting one or more write syscalls.
    pub fn pending(&self) -> &[u8] {
        &self.data[self.head..self.tail]
    }

    pub fn produce(&mut self, size: usize) {
        debug_assert!(self.tail + size <= BUFFER_SIZE);
        self.tail += size;
    }

    pub fn consume(&mut self, size: usize) {
        debug_assert!(self.head + size <= self.tail);
        self.head += size;
    }

    /// Rewind both cursors. Only valid once fully drained, so that the free
    /// region can always take at least one full syscall's worth of bytes.
    pub fn reset(&mut self) {
        debug_assert!(self.consumed());
        self.head = 0;
        self.tail = 0;
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}
