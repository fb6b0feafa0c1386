//! The per-loop cork arena.
//!
//! One fixed buffer per event-loop thread. A socket that "corks" claims it,
//! frames land in the arena back to back, and the whole run goes out in one
//! transport write when the socket uncorks. At most one socket owns the
//! arena at any instant; ownership changes are arbitrated by the event loop,
//! which flushes the previous owner before handing the arena over.

use crate::socket::SocketId;

/// Size of the cork arena. Messages at least this large bypass it.
pub const CORK_BUFFER_SIZE: usize = 16 * 1024;

/// Fixed coalescing buffer plus ownership.
#[derive(Debug)]
pub struct CorkArena {
    buffer: Box<[u8]>,
    offset: usize,
    owner: Option<SocketId>,
}

impl Default for CorkArena {
    fn default() -> Self {
        Self::new()
    }
}

impl CorkArena {
    pub fn new() -> Self {
        Self {
            buffer: vec![0u8; CORK_BUFFER_SIZE].into_boxed_slice(),
            offset: 0,
            owner: None,
        }
    }

    pub fn owner(&self) -> Option<SocketId> {
        self.owner
    }

    pub fn is_free(&self) -> bool {
        self.owner.is_none()
    }

    pub fn is_owned_by(&self, id: SocketId) -> bool {
        self.owner == Some(id)
    }

    /// Take ownership. The caller must have flushed any previous owner.
    pub(crate) fn claim(&mut self, id: SocketId) {
        debug_assert!(self.owner.is_none() || self.owner == Some(id));
        self.owner = Some(id);
    }

    /// Drop ownership without touching the contents.
    pub(crate) fn release(&mut self) {
        self.owner = None;
    }

    /// Bytes currently corked.
    pub fn len(&self) -> usize {
        self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.offset == 0
    }

    pub fn remaining(&self) -> usize {
        CORK_BUFFER_SIZE - self.offset
    }

    pub fn filled(&self) -> &[u8] {
        &self.buffer[..self.offset]
    }

    /// Carve `size` bytes off the free end. The caller checked `remaining`.
    pub(crate) fn carve(&mut self, size: usize) -> &mut [u8] {
        let start = self.offset;
        self.offset += size;
        &mut self.buffer[start..self.offset]
    }

    /// Copy `data` in if it fits entirely.
    pub(crate) fn append(&mut self, data: &[u8]) -> bool {
        if self.remaining() < data.len() {
            return false;
        }
        self.carve(data.len()).copy_from_slice(data);
        true
    }

    /// Hand out the corked bytes and reset the offset.
    ///
    /// Returns the number of bytes that were corked; read them through
    /// `contents` before the next `carve`/`append`.
    pub(crate) fn take(&mut self) -> usize {
        std::mem::replace(&mut self.offset, 0)
    }

    /// Whole arena as a slice, for reading back after `take`.
    pub(crate) fn contents(&self, len: usize) -> &[u8] {
        &self.buffer[..len]
    }
}
