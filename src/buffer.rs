//! The buffer pair backing every session's send path, plus the growable
//! receive buffer.
//!
//! Sends are double-buffered: callers append to the *main* buffer from any
//! thread under the session's send mutex, while the *flush* buffer is owned
//! exclusively by the session's writer and holds the region targeted by the
//! in-flight write. Ownership of the flush side encodes the single-writer
//! rule; the mutex only ever guards the main side.

/// Initial receive buffer capacity and the default stream chunk size.
pub(crate) const CHUNK: usize = 8192;

/// The caller-facing half of the double buffer. Guarded by the session's
/// send mutex.
#[derive(Debug, Default)]
pub(crate) struct SendBuffer {
    main: Vec<u8>,
}

impl SendBuffer {
    pub fn new() -> SendBuffer {
        SendBuffer { main: Vec::new() }
    }

    /// Append bytes to the main buffer, returning the number of bytes now
    /// pending in it.
    pub fn append(&mut self, buffer: &[u8]) -> usize {
        self.main.extend_from_slice(buffer);
        self.main.len()
    }

    pub fn is_empty(&self) -> bool {
        self.main.is_empty()
    }

    pub fn clear(&mut self) {
        self.main.clear();
    }

    /// Exchange the accumulated main buffer with the writer's drained flush
    /// buffer. Must only be called when the flush side is empty.
    pub fn swap_into(&mut self, flush: &mut FlushBuffer) {
        debug_assert!(flush.is_empty());
        std::mem::swap(&mut self.main, &mut flush.data);
        flush.offset = 0;
    }
}

/// The writer-owned half of the double buffer: the bytes of the current
/// in-flight write and the offset up to which they have been written.
#[derive(Debug, Default)]
pub(crate) struct FlushBuffer {
    data: Vec<u8>,
    offset: usize,
}

impl FlushBuffer {
    pub fn new() -> FlushBuffer {
        FlushBuffer::default()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The slice still awaiting transmission.
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.offset..]
    }

    /// Advance past `count` transmitted bytes; clears the buffer once the
    /// offset reaches its end. Returns `true` when fully drained.
    pub fn advance(&mut self, count: usize) -> bool {
        self.offset += count;
        debug_assert!(self.offset <= self.data.len());
        if self.offset == self.data.len() {
            self.clear();
            true
        } else {
            false
        }
    }

    /// Bytes left to transmit after the current offset.
    pub fn pending(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.offset = 0;
    }
}

/// Growable receive buffer: starts at [`CHUNK`] bytes and doubles whenever a
/// read fills the whole capacity. Never shrinks during a session.
#[derive(Debug)]
pub(crate) struct RecvBuffer {
    data: Vec<u8>,
}

impl RecvBuffer {
    pub fn new(capacity: usize) -> RecvBuffer {
        RecvBuffer {
            data: vec![0; capacity.max(1)],
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The whole capacity, handed to the next read.
    pub fn space(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn filled(&self, count: usize) -> &[u8] {
        &self.data[..count]
    }

    /// Double the capacity after a read that filled it.
    pub fn grow(&mut self) {
        let doubled = self.data.len() * 2;
        self.data.resize(doubled, 0);
    }
}
