//! Outgoing frames: compression, framing, and draining queued pub/sub
//! messages into sockets.

use log::trace;

use super::{TopicMessage, WebSocketData};
use crate::buffer::CORK_BUFFER_SIZE;
use crate::config::WebSocketConfig;
use crate::event_loop::{EventLoop, LoopData};
use crate::protocol::{format_header, format_message, message_frame_size, OpCode};
use crate::pubsub::IteratorFlags;
use crate::socket::{SendBufferAttribute, SocketId, Transport};

/// Outcome of a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Queued behind existing backpressure. Wait for `on_drain`.
    Backpressure,
    Success,
    /// Not sent: over `max_backpressure`, or the socket is gone.
    Dropped,
}

/// Frame and write one message to `id`.
///
/// Does not drain the connection's pending pub/sub messages; callers that
/// need ordering against those drain first.
pub(crate) fn send_frame<T: Transport>(
    event_loop: &mut EventLoop<T, WebSocketData>,
    config: &WebSocketConfig,
    id: SocketId,
    message: &[u8],
    opcode: OpCode,
    compress: bool,
    fin: bool,
) -> SendStatus {
    let Some((socket, loop_data)) = event_loop.parts(id) else {
        return SendStatus::Dropped;
    };
    if config.max_backpressure > 0 && socket.buffered_amount() > config.max_backpressure {
        trace!("socket {} over backpressure limit, dropping send", id.index());
        return SendStatus::Dropped;
    }

    let LoopData {
        cork,
        zlib,
        shared_deflation,
        ..
    } = loop_data;

    // Long plain sends skip the arena and go out as header + payload
    if message.len() >= CORK_BUFFER_SIZE
        && !compress
        && socket.ext.subscriber.is_none()
        && socket.buffered_amount() == 0
        && cork.is_empty()
    {
        let mut header = [0u8; 10];
        let header_length = format_header(&mut header, message.len(), opcode, false, fin);
        let head = socket.write_uncorked(&header[..header_length], message.len());
        let body = socket.write_uncorked(message, 0);
        if head.backpressure || body.backpressure {
            socket.uncork_without_sending(cork);
            return SendStatus::Backpressure;
        }
        return SendStatus::Success;
    }

    let mut compressed = false;
    let mut payload = message;
    if compress && !message.is_empty() && opcode.is_data() && socket.ext.compression.can_compress() {
        let deflated = match socket.ext.deflation.as_mut() {
            Some(stream) => stream.deflate(zlib, message, false),
            None => shared_deflation.deflate(zlib, message, true),
        };
        // A failed deflate goes out uncompressed
        if let Some(bytes) = deflated {
            payload = bytes;
            compressed = true;
        } else {
            trace!("socket {} deflate failed, sending uncompressed", id.index());
        }
    }

    let size = message_frame_size::<true>(payload.len());
    let (buffer, attribute) = socket.get_send_buffer(cork, size);
    format_message::<true>(buffer, payload, opcode, compressed, fin);

    let flushed = match attribute {
        SendBufferAttribute::NeedsNothing => return SendStatus::Success,
        SendBufferAttribute::NeedsDrain => socket.write(cork, &[], false, 0),
        SendBufferAttribute::NeedsUncork => socket.uncork(cork, &[]),
    };
    if flushed.backpressure {
        SendStatus::Backpressure
    } else {
        SendStatus::Success
    }
}

/// Topic-tree callback that writes queued messages into their sockets.
///
/// A subscriber's batch is corked on its first message when the arena is
/// free and uncorked after its last one. Sockets whose sends were dropped
/// are collected for the caller, which cannot close them mid-drain.
pub(crate) struct Drainer<'a, T> {
    event_loop: &'a mut EventLoop<T, WebSocketData>,
    config: &'a WebSocketConfig,
    corked: Option<SocketId>,
    dropped: Vec<SocketId>,
}

impl<'a, T: Transport> Drainer<'a, T> {
    pub fn new(event_loop: &'a mut EventLoop<T, WebSocketData>, config: &'a WebSocketConfig) -> Self {
        Self {
            event_loop,
            config,
            corked: None,
            dropped: Vec::new(),
        }
    }

    /// Sockets that dropped a message during this drain.
    pub fn finish(self) -> Vec<SocketId> {
        self.dropped
    }

    /// Returns `true` to stop this subscriber's drain.
    pub fn deliver(&mut self, id: SocketId, message: &TopicMessage, flags: IteratorFlags) -> bool {
        if flags.first && self.event_loop.corked_socket().is_none() {
            self.event_loop.cork(id);
            self.corked = Some(id);
        }

        let status = send_frame(
            self.event_loop,
            self.config,
            id,
            &message.data,
            message.opcode,
            message.compress,
            true,
        );
        let stop = status == SendStatus::Dropped;
        if stop && self.event_loop.contains(id) {
            self.dropped.push(id);
        }

        if (flags.last || stop) && self.corked == Some(id) {
            self.event_loop.uncork(id);
            self.corked = None;
        }
        stop
    }
}
