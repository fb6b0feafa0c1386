//! Connection orchestration.
//!
//! Ties the frame parser, the deflate codec, the topic tree and the cork
//! discipline together into server-side WebSocket connections.
//!
//! ```text
//!   transport ──on_data──► consume ──► FrameHandler ──► WebSocketBehavior
//!                                         │                  │
//!                           fragment buffer, inflate,        │ WebSocket handle
//!                           utf-8 gate, ping/close           ▼
//!                                                     send / end / publish
//!                                                            │
//!                        post_iteration ◄── drain ◄── TopicTree
//! ```
//!
//! - [`WebSocketContext`] — entry points called by whoever owns the sockets
//! - [`WebSocket`] — per-connection handle handed to behaviour callbacks
//! - [`ContextData`] — everything a callback may touch besides the behaviour

mod context;
mod frames;
mod handle;
mod send;

pub use context::{ContextData, WebSocketContext};
pub use handle::WebSocket;
pub use send::SendStatus;

use crate::deflate::{CompressionConfig, DeflationStream, InflationStream};
use crate::protocol::{OpCode, ServerState};
use crate::pubsub::SubscriberId;
use crate::socket::{SocketId, Transport};

/// Application callbacks.
///
/// Every method but `on_message` has an empty default. Callbacks run on the
/// loop thread and may use the handle freely, including ending or closing
/// the connection they were called for.
pub trait WebSocketBehavior<T: Transport> {
    fn on_open(&mut self, _ws: &mut WebSocket<'_, T>) {}

    /// A complete, inflated and (for text) UTF-8 validated message.
    fn on_message(&mut self, ws: &mut WebSocket<'_, T>, message: &[u8], opcode: OpCode);

    /// Called after the automatic pong went out.
    fn on_ping(&mut self, _ws: &mut WebSocket<'_, T>, _payload: &[u8]) {}

    fn on_pong(&mut self, _ws: &mut WebSocket<'_, T>, _payload: &[u8]) {}

    /// Backpressure shrank since the last writable event.
    fn on_drain(&mut self, _ws: &mut WebSocket<'_, T>) {}

    /// A connection joined or left `topic`, which went from `old_count` to
    /// `new_count` members. A closing connection leaves each of its topics
    /// before `on_close`.
    fn on_subscription(&mut self, _id: SocketId, _topic: &str, _new_count: usize, _old_count: usize) {}

    /// Exactly once per connection. `code` is 1006 for abrupt closes.
    fn on_close(&mut self, _id: SocketId, _code: u16, _reason: &[u8]) {}
}

/// A message queued in the topic tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMessage {
    pub data: Vec<u8>,
    pub opcode: OpCode,
    pub compress: bool,
}

/// Per-connection state stored next to the socket.
#[derive(Debug)]
pub struct WebSocketData {
    pub(crate) parser: ServerState,
    pub(crate) fragment_buffer: Vec<u8>,
    /// Bytes of a split control frame sitting at the tail of `fragment_buffer`.
    pub(crate) control_tip_length: usize,
    /// The message being received had RSV1 set.
    pub(crate) compressed_frame: bool,
    pub(crate) compression: CompressionConfig,
    pub(crate) deflation: Option<DeflationStream>,
    pub(crate) inflation: Option<InflationStream>,
    pub(crate) subscriber: Option<SubscriberId>,
    pub(crate) shutting_down: bool,
    pub(crate) has_timed_out: bool,
}

impl WebSocketData {
    pub(crate) fn new(compression: CompressionConfig) -> Self {
        Self {
            parser: ServerState::new(),
            fragment_buffer: Vec::new(),
            control_tip_length: 0,
            compressed_frame: false,
            deflation: compression.dedicated_deflation(),
            inflation: compression.dedicated_inflation(),
            compression,
            subscriber: None,
            shutting_down: false,
            has_timed_out: false,
        }
    }

    /// A close frame went out; only the FIN is left.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub fn compression(&self) -> CompressionConfig {
        self.compression
    }

    pub fn subscriber(&self) -> Option<SubscriberId> {
        self.subscriber
    }

    /// An automatic ping is outstanding.
    pub fn has_timed_out(&self) -> bool {
        self.has_timed_out
    }
}

/// A callback waiting to be reported to the behaviour, in order.
#[derive(Debug)]
pub(crate) enum ContextEvent {
    Subscription {
        id: SocketId,
        topic: String,
        new_count: usize,
        old_count: usize,
    },
    Close {
        id: SocketId,
        code: u16,
        reason: Vec<u8>,
    },
}
