//! Per-connection handle.

use super::context::ContextData;
use super::send::SendStatus;
use crate::protocol::OpCode;
use crate::socket::{SocketId, Transport};

/// One connection, as seen from a behaviour callback.
///
/// Borrows the whole context, so only one handle exists at a time. Every
/// method tolerates the connection having been closed already.
pub struct WebSocket<'a, T> {
    data: &'a mut ContextData<T>,
    id: SocketId,
}

impl<'a, T: Transport> WebSocket<'a, T> {
    pub(crate) fn new(data: &'a mut ContextData<T>, id: SocketId) -> Self {
        Self { data, id }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.data.event_loop.contains(self.id)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.data.is_shutting_down(self.id)
    }

    pub fn transport(&self) -> Option<&T> {
        self.data.event_loop.transport(self.id)
    }

    /// Context-wide state, for reaching other connections.
    pub fn context(&mut self) -> &mut ContextData<T> {
        &mut *self.data
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Send a whole message. `compress` is a hint; it is ignored when the
    /// connection did not negotiate compression or the message is empty.
    pub fn send(&mut self, message: &[u8], opcode: OpCode, compress: bool) -> SendStatus {
        self.data.send(self.id, message, opcode, compress)
    }

    /// First frame of a message sent in pieces. Never compressed.
    pub fn send_first_fragment(&mut self, message: &[u8], opcode: OpCode) -> SendStatus {
        self.data.send_frame(self.id, message, opcode, false, false)
    }

    pub fn send_fragment(&mut self, message: &[u8]) -> SendStatus {
        self.data
            .send_frame(self.id, message, OpCode::Continuation, false, false)
    }

    pub fn send_last_fragment(&mut self, message: &[u8]) -> SendStatus {
        self.data
            .send_frame(self.id, message, OpCode::Continuation, false, true)
    }

    pub fn ping(&mut self, payload: &[u8]) -> SendStatus {
        self.send(payload, OpCode::Ping, false)
    }

    pub fn buffered_amount(&self) -> usize {
        self.data.event_loop.buffered_amount(self.id)
    }

    // ------------------------------------------------------------------
    // Corking
    // ------------------------------------------------------------------

    pub fn is_corked(&self) -> bool {
        self.data.event_loop.is_corked(self.id)
    }

    /// Claim the cork arena. Whoever held it is flushed first.
    pub fn cork(&mut self) {
        self.data.event_loop.cork(self.id);
    }

    /// Flush and release the cork. `false` if the socket now has backpressure.
    pub fn uncork(&mut self) -> bool {
        !self.data.event_loop.uncork(self.id).backpressure
    }

    /// Run `f` corked, so its sends leave in one write.
    pub fn corked<F>(&mut self, f: F)
    where
        F: FnOnce(&mut Self),
    {
        if self.is_corked() {
            f(self);
            return;
        }
        self.cork();
        f(self);
        self.uncork();
    }

    // ------------------------------------------------------------------
    // Closing
    // ------------------------------------------------------------------

    /// Close handshake with `code` and `message` (truncated to 123 bytes).
    pub fn end(&mut self, code: u16, message: &[u8]) {
        self.data.end(self.id, code, message);
    }

    /// Drop the connection without a close frame.
    pub fn close(&mut self) {
        self.data.close(self.id);
    }

    // ------------------------------------------------------------------
    // Pub/sub
    // ------------------------------------------------------------------

    /// `true` if this call added the subscription. Reported through
    /// `on_subscription`.
    pub fn subscribe(&mut self, topic: &str) -> bool {
        let Some(ext) = self.data.event_loop.ext_mut(self.id) else {
            return false;
        };
        if ext.shutting_down {
            return false;
        }
        let subscriber = match ext.subscriber {
            Some(subscriber) => subscriber,
            None => {
                let subscriber = self.data.topics.create_subscriber(self.id);
                ext.subscriber = Some(subscriber);
                subscriber
            }
        };
        match self.data.topics.subscribe(subscriber, topic) {
            Some(count) => {
                self.data.subscription_changed(self.id, topic, count, count - 1);
                true
            }
            None => false,
        }
    }

    /// `true` if the subscription existed.
    pub fn unsubscribe(&mut self, topic: &str) -> bool {
        let Some(subscriber) = self.data.subscriber_of(self.id) else {
            return false;
        };
        let result = self.data.topics.unsubscribe(subscriber, topic);
        if result.removed {
            self.data
                .subscription_changed(self.id, topic, result.remaining, result.remaining + 1);
        }
        result.removed
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.data
            .subscriber_of(self.id)
            .is_some_and(|subscriber| self.data.topics.is_subscribed(subscriber, topic))
    }

    /// Topics this connection is subscribed to, in name order.
    pub fn topics(&self) -> Vec<String> {
        self.data
            .subscriber_of(self.id)
            .and_then(|subscriber| self.data.topics.subscriber(subscriber))
            .map(|subscriber| subscriber.topics().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Call `f` with each subscribed topic. `f` must not subscribe or
    /// unsubscribe this connection.
    pub fn iterate_topics<F>(&mut self, mut f: F)
    where
        F: FnMut(&str),
    {
        if let Some(subscriber) = self.data.subscriber_of(self.id) {
            self.data.topics.iterate_topics(subscriber, |_, topic| f(topic));
        }
    }

    /// Publish to `topic`. This connection is skipped even if subscribed,
    /// unless `publish_to_self` is set.
    pub fn publish(&mut self, topic: &str, message: &[u8], opcode: OpCode, compress: bool) -> bool {
        let sender = if self.data.config.publish_to_self {
            None
        } else {
            self.data.subscriber_of(self.id)
        };
        self.data.publish_from(sender, topic, message, opcode, compress)
    }
}
