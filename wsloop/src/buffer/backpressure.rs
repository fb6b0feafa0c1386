//! Per-socket backpressure buffer with amortized front trimming.
//!
//! Bytes are appended at the back and consumed from the front as the
//! transport accepts them. Consuming does not shift the buffer immediately:
//! the consumed prefix is tracked in `pending_removal` and only physically
//! removed once it exceeds 1/32 of the buffer, so a slow consumer that drains
//! a few hundred bytes per writable event does not pay O(len) every time.

/// Append-mostly byte buffer.
///
/// Invariant: `pending_removal <= buffer.len()`; the logical contents are
/// `buffer[pending_removal..]`.
#[derive(Debug, Default)]
pub struct BackPressure {
    buffer: Vec<u8>,
    pending_removal: usize,
}

impl BackPressure {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes at the back.
    pub fn append(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Mark `length` bytes at the front as consumed.
    ///
    /// Clamped to the logical length, so it never discards bytes that were
    /// not appended.
    pub fn erase(&mut self, length: usize) {
        self.pending_removal += length.min(self.len());

        // Always erase a minimum of 1/32 of the current buffer
        if self.pending_removal > (self.buffer.len() >> 5) {
            self.buffer.drain(..self.pending_removal);
            self.pending_removal = 0;
        }
    }

    /// Logical length (bytes still waiting to be written).
    pub fn len(&self) -> usize {
        self.buffer.len() - self.pending_removal
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Physical length including the not yet trimmed prefix.
    pub fn total_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop everything and release the allocation.
    pub fn clear(&mut self) {
        self.pending_removal = 0;
        self.buffer.clear();
        self.buffer.shrink_to_fit();
    }

    /// Make room for at least `additional` more logical bytes.
    pub fn reserve(&mut self, additional: usize) {
        self.buffer.reserve(additional);
    }

    /// Resize the logical contents to `length` bytes, zero filling.
    pub fn resize(&mut self, length: usize) {
        self.buffer.resize(length + self.pending_removal, 0);
    }

    /// Grow by `additional` zeroed bytes and hand out the new tail.
    pub fn grow(&mut self, additional: usize) -> &mut [u8] {
        let start = self.buffer.len();
        self.buffer.resize(start + additional, 0);
        &mut self.buffer[start..]
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer[self.pending_removal..]
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }
}
