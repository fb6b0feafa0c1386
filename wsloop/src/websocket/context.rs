//! Loop-side entry points and the state behaviour callbacks can reach.

use log::{debug, info, trace};

use super::frames::FrameHandler;
use super::send::{send_frame, Drainer, SendStatus};
use super::{ContextEvent, TopicMessage, WebSocket, WebSocketBehavior, WebSocketData};
use crate::buffer::CORK_BUFFER_SIZE;
use crate::config::WebSocketConfig;
use crate::defer::{DeferQueue, LoopHandle};
use crate::deflate::{CompressOptions, CompressionConfig};
use crate::error::CloseReason;
use crate::event_loop::EventLoop;
use crate::protocol::{self, format_close_payload, OpCode, CLOSE_CODE_ABNORMAL};
use crate::pubsub::{SubscriberId, TopicTree};
use crate::socket::{SocketId, Transport};

/// Longest close reason that fits a control frame next to the status code.
const MAX_CLOSE_REASON: usize = 123;

/// Unmasked ping with an empty payload.
const IDLE_PING: [u8; 2] = [0x89, 0x00];

/// Everything behind a [`WebSocket`] handle: sockets, topics and settings.
pub struct ContextData<T> {
    pub(crate) event_loop: EventLoop<T, WebSocketData>,
    pub(crate) topics: TopicTree<SocketId, TopicMessage>,
    pub(crate) config: WebSocketConfig,
    events: Vec<ContextEvent>,
    /// Output of the last inflation, owned so callbacks can borrow the loop.
    pub(crate) inflated: Vec<u8>,
}

impl<T: Transport> ContextData<T> {
    fn new(config: WebSocketConfig) -> Self {
        Self {
            event_loop: EventLoop::new(),
            topics: TopicTree::new(),
            config,
            events: Vec::new(),
            inflated: Vec::new(),
        }
    }

    pub fn config(&self) -> &WebSocketConfig {
        &self.config
    }

    pub fn event_loop(&self) -> &EventLoop<T, WebSocketData> {
        &self.event_loop
    }

    pub fn topics(&self) -> &TopicTree<SocketId, TopicMessage> {
        &self.topics
    }

    /// Handle for a live connection.
    pub fn websocket(&mut self, id: SocketId) -> Option<WebSocket<'_, T>> {
        if self.event_loop.contains(id) {
            Some(WebSocket::new(self, id))
        } else {
            None
        }
    }

    pub(crate) fn subscriber_of(&self, id: SocketId) -> Option<SubscriberId> {
        self.event_loop.ext(id).and_then(|ext| ext.subscriber)
    }

    pub(crate) fn is_shutting_down(&self, id: SocketId) -> bool {
        self.event_loop.ext(id).is_some_and(|ext| ext.shutting_down)
    }

    fn is_over_backpressure_limit(&self, id: SocketId) -> bool {
        self.config.max_backpressure > 0 && self.event_loop.buffered_amount(id) > self.config.max_backpressure
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    pub fn send(&mut self, id: SocketId, message: &[u8], opcode: OpCode, compress: bool) -> SendStatus {
        self.send_frame(id, message, opcode, compress, true)
    }

    /// Send one frame after flushing whatever the topic tree queued for `id`.
    ///
    /// Over the backpressure limit the frame is dropped, and the connection
    /// closed if `close_on_backpressure_limit` is set.
    pub(crate) fn send_frame(
        &mut self,
        id: SocketId,
        message: &[u8],
        opcode: OpCode,
        compress: bool,
        fin: bool,
    ) -> SendStatus {
        if !self.is_over_backpressure_limit(id) {
            if let Some(subscriber) = self.subscriber_of(id) {
                if self.topics.has_pending(subscriber) {
                    let mut drainer = Drainer::new(&mut self.event_loop, &self.config);
                    self.topics
                        .drain_subscriber(subscriber, &mut |&socket, queued, flags| {
                            drainer.deliver(socket, queued, flags)
                        });
                    let dropped = drainer.finish();
                    self.close_overflowed(dropped);
                }
            }
        }

        let status = send_frame(&mut self.event_loop, &self.config, id, message, opcode, compress, fin);
        if status == SendStatus::Dropped {
            self.close_overflowed(vec![id]);
        }
        status
    }

    /// Close connections that dropped a send, when configured to.
    fn close_overflowed(&mut self, ids: Vec<SocketId>) {
        if !self.config.close_on_backpressure_limit {
            return;
        }
        for id in ids {
            if self.is_over_backpressure_limit(id) {
                debug!("websocket {} closed at the backpressure limit", id.index());
                self.close_socket(id, &[]);
            }
        }
    }

    // ------------------------------------------------------------------
    // Closing
    // ------------------------------------------------------------------

    /// Graceful close: send a close frame, FIN once everything is out.
    ///
    /// The close is reported right away with `code` and the (truncated)
    /// `message`. Calling it again, or after an abrupt close, does nothing.
    pub fn end(&mut self, id: SocketId, code: u16, message: &[u8]) {
        match self.event_loop.ext_mut(id) {
            Some(ext) if !ext.shutting_down => ext.shutting_down = true,
            _ => return,
        }

        let reason = &message[..message.len().min(MAX_CLOSE_REASON)];
        let mut payload = [0u8; MAX_CLOSE_REASON + 2];
        let length = format_close_payload(&mut payload, code, reason);
        let status = self.send_frame(id, &payload[..length], OpCode::Close, false, true);

        if !self.event_loop.is_corked(id) && status == SendStatus::Success {
            self.event_loop.shutdown(id);
        }

        if let Some(subscriber) = self.event_loop.ext_mut(id).and_then(|ext| ext.subscriber.take()) {
            self.free_subscriber(id, subscriber);
        }
        debug!("websocket {} ending with code {}", id.index(), code);
        self.events.push(ContextEvent::Close {
            id,
            code,
            reason: reason.to_vec(),
        });
    }

    /// Abrupt close without a close frame. Reported as 1006 with an empty reason.
    pub fn close(&mut self, id: SocketId) {
        self.close_socket(id, &[]);
    }

    pub(crate) fn force_close(&mut self, id: SocketId, reason: CloseReason) {
        debug!("websocket {} force closed: {}", id.index(), reason);
        self.close_socket(id, reason.to_string().as_bytes());
    }

    fn close_socket(&mut self, id: SocketId, reason: &[u8]) {
        let Some((transport, ext)) = self.event_loop.close(id) else {
            return;
        };
        drop(transport);

        if let Some(subscriber) = ext.subscriber {
            self.free_subscriber(id, subscriber);
        }
        // end() already reported the close
        if ext.shutting_down {
            return;
        }
        self.events.push(ContextEvent::Close {
            id,
            code: CLOSE_CODE_ABNORMAL,
            reason: reason.to_vec(),
        });
    }

    /// Leave every topic, reporting each departure, then release.
    fn free_subscriber(&mut self, id: SocketId, subscriber: SubscriberId) {
        if let Some(entry) = self.topics.subscriber(subscriber) {
            for name in entry.topics() {
                let old_count = self.topics.topic(name).map_or(1, |topic| topic.len());
                self.events.push(ContextEvent::Subscription {
                    id,
                    topic: name.to_string(),
                    new_count: old_count.saturating_sub(1),
                    old_count,
                });
            }
        }
        self.topics.free_subscriber(subscriber);
    }

    pub(crate) fn subscription_changed(&mut self, id: SocketId, topic: &str, new_count: usize, old_count: usize) {
        self.events.push(ContextEvent::Subscription {
            id,
            topic: topic.to_string(),
            new_count,
            old_count,
        });
    }

    fn take_events(&mut self) -> Vec<ContextEvent> {
        std::mem::take(&mut self.events)
    }

    // ------------------------------------------------------------------
    // Pub/sub
    // ------------------------------------------------------------------

    /// Publish to every member of `topic`.
    pub fn publish(&mut self, topic: &str, message: &[u8], opcode: OpCode, compress: bool) -> bool {
        self.publish_from(None, topic, message, opcode, compress)
    }

    /// Publish to every member of `topic` except `sender`.
    ///
    /// Messages of a cork arena or more are written out immediately, after
    /// each recipient's queue; smaller ones are queued until the next drain.
    pub(crate) fn publish_from(
        &mut self,
        sender: Option<SubscriberId>,
        topic: &str,
        message: &[u8],
        opcode: OpCode,
        compress: bool,
    ) -> bool {
        if message.len() >= CORK_BUFFER_SIZE {
            let mut dropped = Vec::new();
            for subscriber in self.topics.recipients(sender, topic) {
                let mut drainer = Drainer::new(&mut self.event_loop, &self.config);
                self.topics
                    .drain_subscriber(subscriber, &mut |&socket, queued, flags| {
                        drainer.deliver(socket, queued, flags)
                    });
                dropped.extend(drainer.finish());
            }

            let event_loop = &mut self.event_loop;
            let config = &self.config;
            let addressed = self.topics.publish_big(sender, topic, &message, |&socket, big| {
                if send_frame(event_loop, config, socket, big, opcode, compress, true) == SendStatus::Dropped {
                    dropped.push(socket);
                }
            });
            self.close_overflowed(dropped);
            return addressed;
        }

        let queued = TopicMessage {
            data: message.to_vec(),
            opcode,
            compress,
        };
        let mut drainer = Drainer::new(&mut self.event_loop, &self.config);
        let addressed = self
            .topics
            .publish(sender, topic, queued, &mut |&socket, queued, flags| {
                drainer.deliver(socket, queued, flags)
            });
        let dropped = drainer.finish();
        self.close_overflowed(dropped);
        addressed
    }

    /// Write every queued pub/sub message into its socket.
    pub fn drain_topics(&mut self) {
        if self.topics.pending_messages() == 0 {
            return;
        }
        trace!("draining {} queued messages", self.topics.pending_messages());
        let mut drainer = Drainer::new(&mut self.event_loop, &self.config);
        self.topics
            .drain(&mut |&socket, message, flags| drainer.deliver(socket, message, flags));
        let dropped = drainer.finish();
        self.close_overflowed(dropped);
    }
}

/// Server-side WebSocket engine for one loop thread.
///
/// The owner of the sockets feeds it readiness events (`on_data`,
/// `on_writable`, `on_end`, `on_timeout`) and calls `post_iteration` once
/// per loop iteration. Other threads reach it only through [`LoopHandle`].
pub struct WebSocketContext<T, B> {
    data: ContextData<T>,
    behavior: B,
    defer: DeferQueue<WebSocketContext<T, B>>,
}

impl<T: Transport, B: WebSocketBehavior<T>> WebSocketContext<T, B> {
    pub fn new(config: WebSocketConfig, behavior: B) -> Self {
        Self::with_queue(config, behavior, DeferQueue::new())
    }

    /// `wakeup` runs on the posting thread after every deferred callback.
    pub fn with_wakeup<W>(config: WebSocketConfig, behavior: B, wakeup: W) -> Self
    where
        W: Fn() + Send + Sync + 'static,
    {
        Self::with_queue(config, behavior, DeferQueue::with_wakeup(wakeup))
    }

    fn with_queue(config: WebSocketConfig, behavior: B, defer: DeferQueue<Self>) -> Self {
        info!(
            "websocket context: max payload {} bytes, max backpressure {} bytes, compression {:#06x}",
            config.max_payload_length, config.max_backpressure, config.compression.0
        );
        Self {
            data: ContextData::new(config),
            behavior,
            defer,
        }
    }

    pub fn config(&self) -> &WebSocketConfig {
        &self.data.config
    }

    pub fn data(&self) -> &ContextData<T> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut ContextData<T> {
        &mut self.data
    }

    pub fn behavior(&self) -> &B {
        &self.behavior
    }

    pub fn behavior_mut(&mut self) -> &mut B {
        &mut self.behavior
    }

    /// `Send` handle for posting work to this context from other threads.
    pub fn handle(&self) -> LoopHandle<Self> {
        self.defer.handle()
    }

    /// Open connections.
    pub fn len(&self) -> usize {
        self.data.event_loop.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.event_loop.is_empty()
    }

    pub fn contains(&self, id: SocketId) -> bool {
        self.data.event_loop.contains(id)
    }

    pub fn transport(&self, id: SocketId) -> Option<&T> {
        self.data.event_loop.transport(id)
    }

    /// Handle for a live connection. Callbacks it causes, such as
    /// `on_subscription`, are delivered at the next entry point; use
    /// [`with_websocket`](Self::with_websocket) to have them delivered
    /// right after.
    pub fn websocket(&mut self, id: SocketId) -> Option<WebSocket<'_, T>> {
        self.data.websocket(id)
    }

    /// Run `f` with a handle for `id`, then deliver the callbacks it caused.
    pub fn with_websocket<R, F>(&mut self, id: SocketId, f: F) -> Option<R>
    where
        F: FnOnce(&mut WebSocket<'_, T>) -> R,
    {
        let result = self.data.websocket(id).map(|mut ws| f(&mut ws));
        self.dispatch_events();
        result
    }

    // ------------------------------------------------------------------
    // Socket events
    // ------------------------------------------------------------------

    /// Adopt an upgraded transport using the context's compression options.
    pub fn accept(&mut self, transport: T) -> SocketId {
        let options = self.data.config.compression;
        self.accept_with(transport, options)
    }

    /// Adopt an upgraded transport with the compression the handshake settled on.
    pub fn accept_with(&mut self, transport: T, options: CompressOptions) -> SocketId {
        let ext = WebSocketData::new(CompressionConfig::from(options));
        let id = self.data.event_loop.adopt(transport, ext);
        debug!("websocket {} open, compression {:#06x}", id.index(), options.0);

        self.behavior.on_open(&mut WebSocket::new(&mut self.data, id));
        self.dispatch_events();
        id
    }

    /// Bytes read from the peer. Unmasked in place.
    pub fn on_data(&mut self, id: SocketId, data: &mut [u8]) {
        let mut parser = match self.data.event_loop.ext_mut(id) {
            Some(ext) if !ext.shutting_down => {
                ext.has_timed_out = false;
                std::mem::take(&mut ext.parser)
            }
            _ => return,
        };

        self.data.event_loop.cork(id);
        let mut handler = FrameHandler::new(&mut self.data, &mut self.behavior, id);
        protocol::consume(data, &mut parser, &mut handler);

        if let Some(ext) = self.data.event_loop.ext_mut(id) {
            ext.parser = parser;
            let shutting_down = ext.shutting_down;
            self.data.event_loop.uncork(id);
            if shutting_down && self.data.event_loop.buffered_amount(id) == 0 {
                self.data.event_loop.shutdown(id);
            }
        }
        self.dispatch_events();
    }

    /// The transport can take more bytes.
    pub fn on_writable(&mut self, id: SocketId) {
        let Some(socket) = self.data.event_loop.socket(id) else {
            return;
        };
        if socket.is_shut_down() {
            return;
        }

        let before = socket.buffered_amount();
        self.data.event_loop.write(id, &[], false, 0);
        let after = self.data.event_loop.buffered_amount(id);
        let progressed = before == 0 || after < before;

        let Some(ext) = self.data.event_loop.ext_mut(id) else {
            return;
        };
        if progressed {
            ext.has_timed_out = false;
        }
        if ext.shutting_down {
            if after == 0 {
                self.data.event_loop.shutdown(id);
            }
        } else if progressed {
            self.behavior.on_drain(&mut WebSocket::new(&mut self.data, id));
        }
        self.dispatch_events();
    }

    /// The peer sent a TCP FIN.
    pub fn on_end(&mut self, id: SocketId) {
        self.data.event_loop.uncork_without_sending(id);
        debug!("websocket {} received FIN", id.index());
        self.data.close(id);
        self.dispatch_events();
    }

    /// The idle timer fired.
    ///
    /// The first time, an idle peer gets a ping if automatic pings are on.
    /// After that, or without pings, the connection is closed.
    pub fn on_timeout(&mut self, id: SocketId) {
        let send_pings = self.data.config.send_pings_automatically;
        let Some(socket) = self.data.event_loop.socket_mut(id) else {
            return;
        };
        let ext = &mut socket.ext;
        if send_pings && !ext.shutting_down && !ext.has_timed_out {
            ext.has_timed_out = true;
            socket.write_uncorked(&IDLE_PING, 0);
            trace!("websocket {} idle, pinged", id.index());
            return;
        }

        self.data.force_close(id, CloseReason::Timeout);
        self.dispatch_events();
    }

    /// Abrupt close, as after a transport error.
    pub fn close(&mut self, id: SocketId) {
        self.data.close(id);
        self.dispatch_events();
    }

    pub fn send(&mut self, id: SocketId, message: &[u8], opcode: OpCode, compress: bool) -> SendStatus {
        let status = self.data.send(id, message, opcode, compress);
        self.dispatch_events();
        status
    }

    pub fn end(&mut self, id: SocketId, code: u16, message: &[u8]) {
        self.data.end(id, code, message);
        self.dispatch_events();
    }

    /// Publish to every member of `topic`.
    pub fn publish(&mut self, topic: &str, message: &[u8], opcode: OpCode, compress: bool) -> bool {
        let addressed = self.data.publish(topic, message, opcode, compress);
        self.dispatch_events();
        addressed
    }

    /// End of a loop iteration: deliver queued pub/sub messages and release
    /// the cork.
    pub fn post_iteration(&mut self) {
        self.data.drain_topics();
        self.data.event_loop.post_iteration();
        self.dispatch_events();
    }

    /// Run callbacks posted through [`handle`](Self::handle).
    pub fn run_deferred(&mut self) -> usize {
        let mut batch = self.defer.take_batch();
        let count = batch.len();
        for callback in batch.drain(..) {
            callback(self);
        }
        self.defer.recycle(batch);
        self.dispatch_events();
        count
    }

    fn dispatch_events(&mut self) {
        loop {
            let events = self.data.take_events();
            if events.is_empty() {
                return;
            }
            for event in events {
                match event {
                    ContextEvent::Subscription {
                        id,
                        topic,
                        new_count,
                        old_count,
                    } => self.behavior.on_subscription(id, &topic, new_count, old_count),
                    ContextEvent::Close { id, code, reason } => self.behavior.on_close(id, code, &reason),
                }
            }
        }
    }
}
