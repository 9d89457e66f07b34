//! Scratch buffer for response bodies.
//!
//! The [`ScratchBuffer`] accumulates body chunks as they arrive from the
//! socket so that the body can be read back, from any earlier position,
//! without touching the socket again.

use bytes::{Bytes, BytesMut};

/// A growable, append-only byte store with a separate read cursor.
///
/// Bytes are only ever appended at the write cursor; once written they are
/// never modified in place. The read cursor can be moved anywhere within the
/// written region with [`seek`](ScratchBuffer::seek).
#[derive(Debug, Default)]
pub struct ScratchBuffer {
    buf: BytesMut,
    position: usize,
}

impl ScratchBuffer {
    /// Create an empty scratch buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes at the write cursor, returning the new write cursor.
    pub fn append(&mut self, chunk: &[u8]) -> usize {
        self.buf.extend_from_slice(chunk);
        self.buf.len()
    }

    /// Offset at which the next appended byte will land.
    pub fn write_cursor(&self) -> usize {
        self.buf.len()
    }

    /// Current read position.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Move the read cursor, clamped to the written region.
    pub fn seek(&mut self, position: usize) -> usize {
        self.position = position.min(self.buf.len());
        self.position
    }

    /// Read at most `max` bytes from the read cursor, advancing it.
    pub fn read(&mut self, max: usize) -> Bytes {
        let end = self.position.saturating_add(max).min(self.buf.len());
        let chunk = Bytes::copy_from_slice(&self.buf[self.position..end]);
        self.position = end;
        chunk
    }

    /// Read everything from the read cursor to the write cursor.
    pub fn read_to_end(&mut self) -> Bytes {
        self.read(usize::MAX)
    }

    /// Copy of the bytes from `offset` to the write cursor.
    ///
    /// This does not move the read cursor.
    pub fn replay(&self, offset: usize) -> Bytes {
        let offset = offset.min(self.buf.len());
        Bytes::copy_from_slice(&self.buf[offset..])
    }

    /// The written region.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Number of bytes written.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Discard all content and reset both cursors.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.position = 0;
    }
}
