//! Incoming frames: reassembly, inflation and control handling.

use log::trace;

use super::context::ContextData;
use super::{WebSocket, WebSocketBehavior};
use crate::error::CloseReason;
use crate::event_loop::LoopData;
use crate::protocol::{is_valid_utf8, parse_close_payload, OpCode, ProtocolHandler};
use crate::socket::{SocketId, Transport};

/// Parser callbacks for one connection during one `on_data`.
pub(crate) struct FrameHandler<'a, T, B> {
    data: &'a mut ContextData<T>,
    behavior: &'a mut B,
    id: SocketId,
}

impl<'a, T: Transport, B: WebSocketBehavior<T>> FrameHandler<'a, T, B> {
    pub fn new(data: &'a mut ContextData<T>, behavior: &'a mut B, id: SocketId) -> Self {
        Self { data, behavior, id }
    }

    /// Closed, or a close frame already went out.
    fn is_broken(&self) -> bool {
        self.data
            .event_loop
            .ext(self.id)
            .map_or(true, |ext| ext.shutting_down)
    }

    fn handle_data(&mut self, data: &[u8], remaining_bytes: u32, opcode: OpCode, fin: bool) -> bool {
        let Some(ext) = self.data.event_loop.ext_mut(self.id) else {
            return true;
        };

        // Whole message in one frame and one read: no copy unless inflated
        if remaining_bytes == 0 && fin && ext.fragment_buffer.is_empty() {
            if std::mem::take(&mut ext.compressed_frame) {
                return self.deliver_compressed(data, opcode);
            }
            return self.deliver(data, opcode);
        }

        if ext.fragment_buffer.is_empty() {
            ext.fragment_buffer.reserve(data.len() + remaining_bytes as usize);
        }
        if ext.fragment_buffer.len() + data.len() > self.data.config.max_payload_length {
            self.data.force_close(self.id, CloseReason::PayloadTooLarge);
            return true;
        }
        ext.fragment_buffer.extend_from_slice(data);

        if remaining_bytes != 0 || !fin {
            return false;
        }

        let mut message = std::mem::take(&mut ext.fragment_buffer);
        let compressed = std::mem::take(&mut ext.compressed_frame);
        let broken = if compressed {
            self.deliver_compressed(&message, opcode)
        } else {
            self.deliver(&message, opcode)
        };

        // Keep the allocation for the next fragmented message
        message.clear();
        if let Some(ext) = self.data.event_loop.ext_mut(self.id) {
            if ext.fragment_buffer.is_empty() {
                ext.fragment_buffer = message;
            }
        }
        broken
    }

    fn deliver_compressed(&mut self, compressed: &[u8], opcode: OpCode) -> bool {
        let mut inflated = std::mem::take(&mut self.data.inflated);
        if !self.inflate(compressed, &mut inflated) {
            self.data.inflated = inflated;
            self.data.force_close(self.id, CloseReason::CompressionFailure);
            return true;
        }

        let broken = self.deliver(&inflated, opcode);
        self.data.inflated = inflated;
        broken
    }

    /// Inflate into `out` with the dedicated stream, or the shared one.
    fn inflate(&mut self, compressed: &[u8], out: &mut Vec<u8>) -> bool {
        let max_length = self.data.config.max_payload_length;
        let Some((socket, loop_data)) = self.data.event_loop.parts(self.id) else {
            return false;
        };
        let LoopData {
            zlib, shared_inflation, ..
        } = loop_data;

        let inflated = match socket.ext.inflation.as_mut() {
            Some(stream) => stream.inflate(zlib, compressed, max_length, false),
            None => shared_inflation.inflate(zlib, compressed, max_length, true),
        };
        match inflated {
            Some(bytes) => {
                out.clear();
                out.extend_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    fn deliver(&mut self, message: &[u8], opcode: OpCode) -> bool {
        if opcode == OpCode::Text && !is_valid_utf8(message) {
            self.data.force_close(self.id, CloseReason::InvalidUtf8);
            return true;
        }

        let mut ws = WebSocket::new(self.data, self.id);
        self.behavior.on_message(&mut ws, message, opcode);
        self.is_broken()
    }

    fn handle_control(&mut self, data: &[u8], remaining_bytes: u32, opcode: OpCode, fin: bool) -> bool {
        let Some(ext) = self.data.event_loop.ext_mut(self.id) else {
            return true;
        };

        if remaining_bytes == 0 && fin && ext.control_tip_length == 0 {
            return self.control(data, opcode);
        }

        // Split across reads: park at the tail of the fragment buffer
        ext.fragment_buffer.extend_from_slice(data);
        ext.control_tip_length += data.len();
        if remaining_bytes != 0 || !fin {
            return false;
        }

        let start = ext.fragment_buffer.len() - ext.control_tip_length;
        let payload = ext.fragment_buffer.split_off(start);
        ext.control_tip_length = 0;
        self.control(&payload, opcode)
    }

    fn control(&mut self, payload: &[u8], opcode: OpCode) -> bool {
        match opcode {
            OpCode::Close => {
                let frame = parse_close_payload(payload);
                trace!("websocket {} received close {}", self.id.index(), frame.code);
                self.data.end(self.id, frame.code, frame.message);
                true
            }
            OpCode::Ping => {
                let mut ws = WebSocket::new(self.data, self.id);
                ws.send(payload, OpCode::Pong, false);
                self.behavior.on_ping(&mut ws, payload);
                self.is_broken()
            }
            OpCode::Pong => {
                let mut ws = WebSocket::new(self.data, self.id);
                self.behavior.on_pong(&mut ws, payload);
                self.is_broken()
            }
            _ => false,
        }
    }
}

impl<T: Transport, B: WebSocketBehavior<T>> ProtocolHandler for FrameHandler<'_, T, B> {
    fn refuse_payload_length(&mut self, length: u64) -> bool {
        length > self.data.config.max_payload_length as u64
    }

    fn set_compressed(&mut self) -> bool {
        match self.data.event_loop.ext_mut(self.id) {
            Some(ext) if ext.compression.can_decompress() => {
                ext.compressed_frame = true;
                true
            }
            _ => false,
        }
    }

    fn force_close(&mut self, reason: CloseReason) {
        self.data.force_close(self.id, reason);
    }

    fn handle_fragment(&mut self, data: &[u8], remaining_bytes: u32, opcode: OpCode, fin: bool) -> bool {
        if opcode.is_control() {
            self.handle_control(data, remaining_bytes, opcode, fin)
        } else {
            self.handle_data(data, remaining_bytes, opcode, fin)
        }
    }
}
