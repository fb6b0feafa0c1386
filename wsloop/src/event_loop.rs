//! Thread-confined per-loop state.
//!
//! ```text
//!   EventLoop<T, E>                      (!Send, lives on one thread)
//!   ├── LoopData
//!   │    ├── CorkArena          16 KiB, one owner at a time
//!   │    ├── ZlibContext        scratch for every codec on the loop
//!   │    ├── DeflationStream    shared, reset after each message
//!   │    └── InflationStream    shared, reset after each message
//!   └── sockets: slab of AsyncSocket<T, E>
//! ```
//!
//! The loop does not poll anything itself. Whoever owns the readiness
//! source calls into it and calls [`EventLoop::post_iteration`] once per
//! iteration.

use std::marker::PhantomData;

use log::{debug, trace};

use crate::buffer::CorkArena;
use crate::deflate::{DeflationStream, InflationStream, ZlibContext};
use crate::socket::{AsyncSocket, SendBufferAttribute, SocketId, Transport, WriteResult};

const SHARED_WINDOW_BITS: u8 = 15;

/// Resources shared by every socket on one loop.
#[derive(Debug)]
pub struct LoopData {
    pub cork: CorkArena,
    pub zlib: ZlibContext,
    pub shared_deflation: DeflationStream,
    pub shared_inflation: InflationStream,
    _not_send: PhantomData<*const ()>,
}

impl Default for LoopData {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopData {
    pub fn new() -> Self {
        Self {
            cork: CorkArena::new(),
            zlib: ZlibContext::new(),
            shared_deflation: DeflationStream::new(SHARED_WINDOW_BITS),
            shared_inflation: InflationStream::new(SHARED_WINDOW_BITS),
            _not_send: PhantomData,
        }
    }
}

/// Sockets of one loop plus the loop's shared resources.
#[derive(Debug)]
pub struct EventLoop<T, E> {
    data: LoopData,
    sockets: Vec<Option<AsyncSocket<T, E>>>,
    free_slots: Vec<usize>,
}

impl<T: Transport, E> Default for EventLoop<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Transport, E> EventLoop<T, E> {
    pub fn new() -> Self {
        Self {
            data: LoopData::new(),
            sockets: Vec::new(),
            free_slots: Vec::new(),
        }
    }

    /// Take ownership of an already connected transport.
    pub fn adopt(&mut self, transport: T, ext: E) -> SocketId {
        let slot = match self.free_slots.pop() {
            Some(slot) => slot,
            None => {
                self.sockets.push(None);
                self.sockets.len() - 1
            }
        };
        let id = SocketId::from_raw(slot);
        self.sockets[slot] = Some(AsyncSocket::new(id, transport, ext));
        debug!("adopted socket {}", slot);
        id
    }

    /// Remove a socket. Corked bytes it held are discarded.
    pub fn close(&mut self, id: SocketId) -> Option<(T, E)> {
        let mut socket = self.sockets.get_mut(id.index())?.take()?;
        socket.uncork_without_sending(&mut self.data.cork);
        self.free_slots.push(id.index());
        debug!("closed socket {}", id.index());
        Some(socket.into_parts())
    }

    pub fn contains(&self, id: SocketId) -> bool {
        self.socket(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sockets.len() - self.free_slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn socket(&self, id: SocketId) -> Option<&AsyncSocket<T, E>> {
        self.sockets.get(id.index()).and_then(Option::as_ref)
    }

    pub fn socket_mut(&mut self, id: SocketId) -> Option<&mut AsyncSocket<T, E>> {
        self.sockets.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// One socket together with the loop's shared resources.
    pub fn parts(&mut self, id: SocketId) -> Option<(&mut AsyncSocket<T, E>, &mut LoopData)> {
        let socket = self.sockets.get_mut(id.index()).and_then(Option::as_mut)?;
        Some((socket, &mut self.data))
    }

    pub fn data(&self) -> &LoopData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut LoopData {
        &mut self.data
    }

    pub fn ext(&self, id: SocketId) -> Option<&E> {
        self.socket(id).map(|s| &s.ext)
    }

    pub fn ext_mut(&mut self, id: SocketId) -> Option<&mut E> {
        self.socket_mut(id).map(|s| &mut s.ext)
    }

    pub fn transport(&self, id: SocketId) -> Option<&T> {
        self.socket(id).map(AsyncSocket::transport)
    }

    pub fn transport_mut(&mut self, id: SocketId) -> Option<&mut T> {
        self.socket_mut(id).map(AsyncSocket::transport_mut)
    }

    // ------------------------------------------------------------------
    // Cork discipline
    // ------------------------------------------------------------------

    pub fn corked_socket(&self) -> Option<SocketId> {
        self.data.cork.owner()
    }

    pub fn is_corked(&self, id: SocketId) -> bool {
        self.data.cork.is_owned_by(id)
    }

    /// Claim the cork arena for `id`, flushing whoever held it before.
    pub fn cork(&mut self, id: SocketId) {
        if !self.contains(id) {
            return;
        }
        match self.data.cork.owner() {
            Some(owner) if owner == id => {}
            Some(owner) => {
                trace!("socket {} evicts socket {} from the cork", id.index(), owner.index());
                self.uncork(owner);
                self.data.cork.claim(id);
            }
            None => self.data.cork.claim(id),
        }
    }

    pub fn uncork(&mut self, id: SocketId) -> WriteResult {
        match self.parts(id) {
            Some((socket, data)) => socket.uncork(&mut data.cork, &[]),
            None => WriteResult::default(),
        }
    }

    pub fn uncork_without_sending(&mut self, id: SocketId) {
        if let Some((socket, data)) = self.parts(id) {
            socket.uncork_without_sending(&mut data.cork);
        }
    }

    pub fn write(&mut self, id: SocketId, data: &[u8], optionally: bool, next_length: usize) -> WriteResult {
        match self.parts(id) {
            Some((socket, loop_data)) => socket.write(&mut loop_data.cork, data, optionally, next_length),
            None => WriteResult::default(),
        }
    }

    pub fn get_send_buffer(&mut self, id: SocketId, size: usize) -> Option<(&mut [u8], SendBufferAttribute)> {
        let (socket, data) = self.parts(id)?;
        Some(socket.get_send_buffer(&mut data.cork, size))
    }

    pub fn buffered_amount(&self, id: SocketId) -> usize {
        self.socket(id).map_or(0, AsyncSocket::buffered_amount)
    }

    pub fn shutdown(&mut self, id: SocketId) {
        if let Some(socket) = self.socket_mut(id) {
            socket.shutdown();
        }
    }

    /// End of a loop iteration: nothing may stay corked across iterations.
    pub fn post_iteration(&mut self) {
        if let Some(owner) = self.data.cork.owner() {
            self.uncork(owner);
        }
    }
}
