//! Cork-aware socket with a backpressure buffer.
//!
//! Every write goes through the same ladder:
//! ```text
//!   write(data)
//!     │
//!     ├─ backpressure pending? ── flush it first; still stuck → buffer data, report
//!     ├─ corked by us?         ── append to the arena; no room → uncork(data)
//!     └─ direct transport write ── remainder → backpressure, report
//! ```

use std::io;

use log::debug;

use crate::buffer::{BackPressure, CorkArena};

/// Handle to a socket slot in an [`EventLoop`](crate::event_loop::EventLoop).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(usize);

impl SocketId {
    pub fn from_raw(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

/// The non-blocking byte sink under a socket.
///
/// `write` returns how much was accepted; `WouldBlock` counts as nothing
/// accepted. Any other error is logged and treated the same way, the owner
/// learns about dead connections from the event loop, not from writes.
pub trait Transport {
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Half-close the write side (TCP FIN).
    fn shutdown(&mut self) {}
}

/// What the caller must do after filling a buffer from
/// [`AsyncSocket::get_send_buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendBufferAttribute {
    /// The socket was already corked; the bytes go out with the cork.
    NeedsNothing,
    /// This call corked the socket; uncork it when done.
    NeedsUncork,
    /// The region lives in the backpressure buffer; issue an empty write.
    NeedsDrain,
}

/// Outcome of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteResult {
    /// Bytes taken responsibility for (sent, corked or buffered).
    pub written: usize,
    /// The socket now holds backpressure.
    pub backpressure: bool,
}

impl WriteResult {
    fn done(written: usize) -> Self {
        Self {
            written,
            backpressure: false,
        }
    }

    fn stuck(written: usize) -> Self {
        Self {
            written,
            backpressure: true,
        }
    }
}

fn send<T: Transport>(transport: &mut T, data: &[u8]) -> usize {
    if data.is_empty() {
        return 0;
    }
    match transport.write(data) {
        Ok(n) => n.min(data.len()),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
        Err(e) => {
            debug!("transport write failed: {}", e);
            0
        }
    }
}

/// A socket plus its per-connection extension data `E`.
#[derive(Debug)]
pub struct AsyncSocket<T, E> {
    id: SocketId,
    transport: T,
    buffer: BackPressure,
    shut_down: bool,
    pub ext: E,
}

impl<T: Transport, E> AsyncSocket<T, E> {
    pub fn new(id: SocketId, transport: T, ext: E) -> Self {
        Self {
            id,
            transport,
            buffer: BackPressure::new(),
            shut_down: false,
            ext,
        }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_parts(self) -> (T, E) {
        (self.transport, self.ext)
    }

    /// Bytes waiting in the backpressure buffer.
    pub fn buffered_amount(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_corked(&self, cork: &CorkArena) -> bool {
        cork.is_owned_by(self.id)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Send FIN once.
    pub fn shutdown(&mut self) {
        if !self.shut_down {
            self.shut_down = true;
            self.transport.shutdown();
        }
    }

    /// A region of `size` bytes to frame a message into.
    ///
    /// Comes from the cork arena when it is ours or free, has room, and no
    /// backpressure is queued ahead of it. Otherwise the region is appended
    /// to the backpressure buffer, behind whatever this socket had corked.
    pub fn get_send_buffer<'a>(
        &'a mut self,
        cork: &'a mut CorkArena,
        size: usize,
    ) -> (&'a mut [u8], SendBufferAttribute) {
        if self.buffer.is_empty() && cork.remaining() >= size {
            if cork.is_owned_by(self.id) {
                return (cork.carve(size), SendBufferAttribute::NeedsNothing);
            }
            if cork.is_free() {
                cork.claim(self.id);
                return (cork.carve(size), SendBufferAttribute::NeedsUncork);
            }
        }

        if cork.is_owned_by(self.id) {
            let corked = cork.take();
            self.buffer.append(cork.contents(corked));
        }
        (self.buffer.grow(size), SendBufferAttribute::NeedsDrain)
    }

    /// Write straight to the transport, skipping the cork arena.
    ///
    /// Only valid while the arena holds none of this socket's bytes.
    pub fn write_uncorked(&mut self, data: &[u8], next_length: usize) -> WriteResult {
        self.write_unowned(data, false, next_length)
    }

    /// Write `data`, corking, sending or buffering it.
    ///
    /// With `optionally` set, data that cannot leave right away is not
    /// buffered and `written` reports what actually went out.
    /// `next_length` reserves backpressure room for a known follow-up write.
    pub fn write(&mut self, cork: &mut CorkArena, data: &[u8], optionally: bool, next_length: usize) -> WriteResult {
        if let Some(early) = self.flush_backpressure(data, optionally) {
            return early;
        }
        if data.is_empty() {
            return WriteResult::default();
        }

        if cork.is_owned_by(self.id) {
            if cork.append(data) {
                return WriteResult::done(data.len());
            }
            return self.uncork_with(cork, data, optionally);
        }

        self.write_direct(data, optionally, next_length)
    }

    /// Release the cork, writing its contents followed by `extra`.
    ///
    /// Nothing happens if this socket is not the owner.
    pub fn uncork(&mut self, cork: &mut CorkArena, extra: &[u8]) -> WriteResult {
        self.uncork_with(cork, extra, false)
    }

    /// Release the cork and discard what it holds. Used on close paths.
    pub fn uncork_without_sending(&mut self, cork: &mut CorkArena) {
        if cork.is_owned_by(self.id) {
            cork.release();
            cork.take();
        }
    }

    fn uncork_with(&mut self, cork: &mut CorkArena, extra: &[u8], optionally: bool) -> WriteResult {
        if !cork.is_owned_by(self.id) {
            return WriteResult::default();
        }
        cork.release();

        let corked = cork.take();
        if corked > 0 {
            let flushed = self.write_unowned(cork.contents(corked), false, extra.len());
            if flushed.backpressure && optionally {
                return WriteResult::stuck(0);
            }
        }
        self.write_unowned(extra, optionally, 0)
    }

    /// `write` for a socket that does not hold the cork.
    fn write_unowned(&mut self, data: &[u8], optionally: bool, next_length: usize) -> WriteResult {
        if let Some(early) = self.flush_backpressure(data, optionally) {
            return early;
        }
        if data.is_empty() {
            return WriteResult::default();
        }
        self.write_direct(data, optionally, next_length)
    }

    /// Returns early with a result when backpressure could not be cleared.
    fn flush_backpressure(&mut self, data: &[u8], optionally: bool) -> Option<WriteResult> {
        if self.buffer.is_empty() {
            return None;
        }

        let pending = self.buffer.len();
        let written = send(&mut self.transport, self.buffer.as_slice());
        if written < pending {
            self.buffer.erase(written);
            if optionally {
                return Some(WriteResult::stuck(0));
            }
            self.buffer.append(data);
            return Some(WriteResult::stuck(data.len()));
        }

        self.buffer.clear();
        None
    }

    fn write_direct(&mut self, data: &[u8], optionally: bool, next_length: usize) -> WriteResult {
        let written = send(&mut self.transport, data);
        if written == data.len() {
            return WriteResult::done(written);
        }
        if optionally {
            return WriteResult::stuck(written);
        }

        if next_length > 0 {
            self.buffer.reserve(data.len() - written + next_length);
        }
        self.buffer.append(&data[written..]);
        WriteResult::stuck(data.len())
    }
}
