//! Growable wire buffer with a read/write cursor.
//!
//! A `Message` holds bytes exactly as they travel on the wire. Socket code
//! fills it incrementally through [`Message::buffer_at_cursor`] and
//! [`Message::advance_cursor`]; the codec reads and writes it as a whole.

use bytes::{Bytes, BytesMut};

/// Wire bytes of one request or response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    buffer: BytesMut,
    cursor: usize,
    marshalled: bool,
    description: Option<String>,
}

impl Message {
    /// Creates an empty message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a zero-filled message of `size` bytes.
    pub fn with_size(size: usize) -> Self {
        let mut msg = Self::new();
        msg.allocate(size);
        msg
    }

    /// Wraps already-encoded wire bytes. The result counts as marshalled.
    pub fn from_wire(data: &[u8]) -> Self {
        Self {
            buffer: BytesMut::from(data),
            cursor: 0,
            marshalled: true,
            description: None,
        }
    }

    /// Discards the content and makes room for `size` zeroed bytes.
    pub fn allocate(&mut self, size: usize) {
        self.buffer.clear();
        self.buffer.resize(size, 0);
        self.cursor = 0;
    }

    /// Grows or shrinks to `size` bytes, keeping the existing prefix.
    ///
    /// The cursor is clamped to the new size.
    pub fn reallocate(&mut self, size: usize) {
        self.buffer.resize(size, 0);
        self.cursor = self.cursor.min(size);
    }

    /// Appends raw bytes at the end of the buffer.
    pub fn append(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Current cursor position.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Moves the cursor to an absolute position, clamped to the buffer size.
    pub fn set_cursor(&mut self, pos: usize) {
        self.cursor = pos.min(self.buffer.len());
    }

    /// Moves the cursor forward by `n` bytes, clamped to the buffer size.
    pub fn advance_cursor(&mut self, n: usize) {
        self.set_cursor(self.cursor.saturating_add(n));
    }

    /// Writable view of the bytes between the cursor and the end.
    pub fn buffer_at_cursor(&mut self) -> &mut [u8] {
        &mut self.buffer[self.cursor..]
    }

    /// Number of bytes between the cursor and the end.
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.cursor
    }

/// Whole buffer, regardless of the cursor.
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

/// Mutable view of the whole buffer.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

/// Buffer size in bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

/// True for a zero sized buffer.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// True when the content is in network byte order.
    pub fn is_marshalled(&self) -> bool {
        self.marshalled
    }

/// Records whether the content is in network byte order.
    pub fn set_marshalled(&mut self, marshalled: bool) {
        self.marshalled = marshalled;
    }

    /// Human readable description, used in log lines.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

/// Sets the log description.
    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = Some(description.into());
    }

    /// Consumes the message and returns its bytes.
    pub fn freeze(self) -> Bytes {
        self.buffer.freeze()
    }
}
