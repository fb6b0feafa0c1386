//! Incremental frame parser.
//!
//! `consume` is fed whatever the transport produced and never copies payload
//! bytes: payloads are unmasked in place and handed to the
//! [`ProtocolHandler`] as sub-slices of the input. Only header bytes that
//! straddle two reads are copied, into a 14-byte spill area.
//!
//! ```text
//!   read #1                         read #2
//!   ┌────────┬──────────────┬────┐  ┌──────────┬────────┬─────────┐
//!   │ header │ payload (a)  │ h… │  │ …eader   │ payl…  │         │
//!   └────────┴──────────────┴────┘  └──────────┴────────┴─────────┘
//!                             │         ▲
//!                             └─ spill ─┘   remaining_bytes carries
//!                                           a partial payload across reads
//! ```

use log::trace;

use super::{unmask, OpCode, MAX_CONTROL_PAYLOAD, MAX_HEADER_LENGTH};
use crate::error::CloseReason;

/// Connection-side capabilities the parser calls into.
pub trait ProtocolHandler {
    /// `true` refuses a frame of this payload length.
    fn refuse_payload_length(&mut self, length: u64) -> bool;

    /// Called for a frame with RSV1 set. `true` if compression was negotiated
    /// and the message is now marked compressed.
    fn set_compressed(&mut self) -> bool;

    /// The connection must be torn down; parsing has stopped.
    fn force_close(&mut self, reason: CloseReason);

    /// One decoded (and unmasked) piece of a frame.
    ///
    /// `remaining_bytes` is what the current frame still owes. Return `true`
    /// to stop parsing, e.g. after closing the connection.
    fn handle_fragment(&mut self, data: &[u8], remaining_bytes: u32, opcode: OpCode, fin: bool) -> bool;
}

/// Fragmentation and spill bookkeeping shared by both roles.
#[derive(Debug, Clone)]
pub struct ParserState {
    pub(crate) wants_head: bool,
    pub(crate) spill_length: u8,
    pub(crate) spill: [u8; MAX_HEADER_LENGTH],
    /// -1 idle, 0 data message in progress, 1 control frame nested in it.
    pub(crate) op_stack: i8,
    pub(crate) op_code: [OpCode; 2],
    pub(crate) last_fin: bool,
}

impl Default for ParserState {
    fn default() -> Self {
        Self {
            wants_head: true,
            spill_length: 0,
            spill: [0; MAX_HEADER_LENGTH],
            op_stack: -1,
            op_code: [OpCode::Continuation; 2],
            last_fin: true,
        }
    }
}

impl ParserState {
    /// No message is in progress.
    pub fn is_idle(&self) -> bool {
        self.op_stack == -1
    }

    fn current_opcode(&self) -> OpCode {
        self.op_code[self.op_stack.max(0) as usize]
    }

    fn pop(&mut self) {
        if self.op_stack >= 0 {
            self.op_stack -= 1;
        }
    }
}

/// Per-connection parser state. `IS_SERVER` selects which side's frames are
/// being read: a server reads masked frames, a client unmasked ones.
#[derive(Debug, Clone, Default)]
pub struct WebSocketState<const IS_SERVER: bool> {
    pub state: ParserState,
    pub remaining_bytes: u32,
    /// Mask key phase-aligned to the next payload byte.
    pub mask: [u8; 4],
}

pub type ServerState = WebSocketState<true>;
pub type ClientState = WebSocketState<false>;

impl<const IS_SERVER: bool> WebSocketState<IS_SERVER> {
    pub fn new() -> Self {
        Self::default()
    }
}

#[inline]
fn header_length<const IS_SERVER: bool>(byte1: u8) -> usize {
    let extended = match byte1 & 0x7F {
        126 => 2,
        127 => 8,
        _ => 0,
    };
    2 + extended + if IS_SERVER { 4 } else { 0 }
}

#[inline]
fn spill<const IS_SERVER: bool>(state: &mut WebSocketState<IS_SERVER>, bytes: &[u8]) {
    let start = state.state.spill_length as usize;
    state.state.spill[start..start + bytes.len()].copy_from_slice(bytes);
    state.state.spill_length += bytes.len() as u8;
}

/// Parse as much of `src` as possible.
///
/// Delivers complete and partial frames to `handler`, parks an incomplete
/// header in the spill area and stops at the first violation after calling
/// `force_close`.
pub fn consume<const IS_SERVER: bool, H: ProtocolHandler>(
    src: &mut [u8],
    state: &mut WebSocketState<IS_SERVER>,
    handler: &mut H,
) {
    if src.is_empty() {
        return;
    }
    let mut pos = 0usize;

    // Finish a payload started in an earlier read
    if !state.state.wants_head {
        let remaining = state.remaining_bytes as usize;
        let opcode = state.state.current_opcode();
        let fin = state.state.last_fin;

        if remaining <= src.len() {
            let piece = &mut src[..remaining];
            if IS_SERVER {
                unmask(piece, state.mask);
            }
            state.remaining_bytes = 0;
            state.state.wants_head = true;
            if handler.handle_fragment(piece, 0, opcode, fin) {
                return;
            }
            if fin {
                state.state.pop();
            }
            pos = remaining;
        } else {
            if IS_SERVER {
                unmask(src, state.mask);
                state.mask.rotate_left(src.len() % 4);
            }
            state.remaining_bytes -= src.len() as u32;
            handler.handle_fragment(src, state.remaining_bytes, opcode, fin);
            return;
        }
    }

    loop {
        let spilled = state.state.spill_length as usize;
        let available = src.len() - pos;

        if spilled + available < 2 {
            spill(state, &src[pos..]);
            return;
        }

        // Assemble the header window out of spilled bytes and fresh input
        let mut head = [0u8; MAX_HEADER_LENGTH];
        head[..spilled].copy_from_slice(&state.state.spill[..spilled]);
        let take = (MAX_HEADER_LENGTH - spilled).min(available);
        head[spilled..spilled + take].copy_from_slice(&src[pos..pos + take]);

        let needed = header_length::<IS_SERVER>(head[1]);
        if spilled + take < needed {
            spill(state, &src[pos..pos + take]);
            return;
        }
        pos += needed - spilled;
        state.state.spill_length = 0;

        let fin = head[0] & 0x80 != 0;
        let rsv1 = head[0] & 0x40 != 0;
        let masked = head[1] & 0x80 != 0;
        let length7 = head[1] & 0x7F;

        if masked != IS_SERVER || head[0] & 0x30 != 0 {
            handler.force_close(CloseReason::ProtocolViolation);
            return;
        }

        let opcode = match OpCode::from_u8(head[0] & 0x0F) {
            Some(opcode) => opcode,
            None => {
                handler.force_close(CloseReason::ProtocolViolation);
                return;
            }
        };

        if opcode.is_control() && (!fin || length7 as usize > MAX_CONTROL_PAYLOAD) {
            handler.force_close(CloseReason::ProtocolViolation);
            return;
        }

        let (payload_length, mask_at) = match length7 {
            126 => (u16::from_be_bytes([head[2], head[3]]) as u64, 4),
            127 => {
                let mut wide = [0u8; 8];
                wide.copy_from_slice(&head[2..10]);
                (u64::from_be_bytes(wide), 10)
            }
            n => (n as u64, 2),
        };

        if payload_length > u32::MAX as u64 {
            handler.force_close(CloseReason::PayloadTooLarge);
            return;
        }

        // Fragmentation order
        match opcode {
            OpCode::Continuation => {
                if state.state.op_stack == -1 {
                    handler.force_close(CloseReason::ProtocolViolation);
                    return;
                }
            }
            _ => {
                let busy = if opcode.is_control() {
                    state.state.op_stack == 1
                } else {
                    state.state.op_stack != -1
                };
                if busy {
                    handler.force_close(CloseReason::ProtocolViolation);
                    return;
                }
                state.state.op_stack += 1;
                state.state.op_code[state.state.op_stack as usize] = opcode;
            }
        }

        if rsv1 && (!opcode.is_data() || !handler.set_compressed()) {
            handler.force_close(CloseReason::ProtocolViolation);
            return;
        }

        state.state.last_fin = fin;

        if handler.refuse_payload_length(payload_length) {
            handler.force_close(CloseReason::PayloadTooLarge);
            return;
        }

        if IS_SERVER {
            state.mask.copy_from_slice(&head[mask_at..mask_at + 4]);
        }

        let length = payload_length as usize;
        let message_opcode = state.state.current_opcode();
        let available = src.len() - pos;

        if length <= available {
            let payload = &mut src[pos..pos + length];
            if IS_SERVER {
                unmask(payload, state.mask);
            }
            if handler.handle_fragment(payload, 0, message_opcode, fin) {
                return;
            }
            if fin {
                state.state.pop();
            }
            pos += length;
        } else {
            let payload = &mut src[pos..];
            if IS_SERVER {
                unmask(payload, state.mask);
                state.mask.rotate_left(available % 4);
            }
            state.remaining_bytes = (length - available) as u32;
            state.state.wants_head = false;
            if available > 0 {
                trace!("partial frame, {} of {} bytes", available, length);
                handler.handle_fragment(payload, state.remaining_bytes, message_opcode, fin);
            }
            return;
        }
    }
}
