//! RFC 6455 framing.
//!
//! Wire format:
//! ```text
//! ┌─┬─┬─┬─┬───────┬─┬─────────────┬───────────────────┬──────────┬─────────┐
//! │F│R│R│R│opcode │M│ length (7)  │ ext length        │ mask key │ payload │
//! │I│S│S│S│ 4 bit │A│ 0..=125     │ 126 → u16 BE      │ 4 bytes  │         │
//! │N│1│2│3│       │S│ 126 | 127   │ 127 → u64 BE      │ (client) │         │
//! └─┴─┴─┴─┴───────┴─┴─────────────┴───────────────────┴──────────┴─────────┘
//! ```
//!
//! RSV1 marks a permessage-deflate compressed message. RSV2/RSV3 are never set.
//! Client frames are masked with a fresh random key; server frames never are.
//!
//! - [`parser`] — incremental `consume` state machine
//! - this module — opcodes, frame formatting, close payloads, unmasking

pub mod parser;

pub use parser::{consume, ClientState, ParserState, ProtocolHandler, ServerState, WebSocketState};

/// Largest header a frame can carry (2 + 8 length + 4 mask).
pub const MAX_HEADER_LENGTH: usize = 14;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Close codes that are never put on the wire.
pub const CLOSE_CODE_NONE: u16 = 0;
pub const CLOSE_CODE_NO_STATUS: u16 = 1005;
pub const CLOSE_CODE_ABNORMAL: u16 = 1006;

pub const INVALID_CLOSE_PAYLOAD: &str = "Received invalid close payload";

/// Frame opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum OpCode {
    #[default]
    Continuation = 0,
    Text = 1,
    Binary = 2,
    Close = 8,
    Ping = 9,
    Pong = 10,
}

impl OpCode {
    /// Decode the low nibble of the first header byte. Reserved opcodes
    /// (3..=7, 11..=15) yield `None`.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(OpCode::Continuation),
            1 => Some(OpCode::Text),
            2 => Some(OpCode::Binary),
            8 => Some(OpCode::Close),
            9 => Some(OpCode::Ping),
            10 => Some(OpCode::Pong),
            _ => None,
        }
    }

    pub fn is_control(self) -> bool {
        (self as u8) >= 8
    }

    /// Text or binary.
    pub fn is_data(self) -> bool {
        matches!(self, OpCode::Text | OpCode::Binary)
    }
}

#[inline]
fn length_field_size(payload_length: usize) -> usize {
    if payload_length < 126 {
        0
    } else if payload_length <= u16::MAX as usize {
        2
    } else {
        8
    }
}

/// Bytes needed to frame `payload_length` bytes.
pub fn message_frame_size<const IS_SERVER: bool>(payload_length: usize) -> usize {
    let mask = if IS_SERVER { 0 } else { 4 };
    2 + length_field_size(payload_length) + mask + payload_length
}

/// Write a frame header (without mask key) into `dst`; returns its length.
///
/// `dst` must hold at least `2 + 8` bytes.
pub fn format_header(dst: &mut [u8], payload_length: usize, opcode: OpCode, compressed: bool, fin: bool) -> usize {
    let mut byte0 = opcode as u8;
    if fin {
        byte0 |= 0x80;
    }
    // RSV1 belongs on the first frame of a message only
    if compressed && opcode != OpCode::Continuation {
        byte0 |= 0x40;
    }
    dst[0] = byte0;

    match length_field_size(payload_length) {
        0 => {
            dst[1] = payload_length as u8;
            2
        }
        2 => {
            dst[1] = 126;
            dst[2..4].copy_from_slice(&(payload_length as u16).to_be_bytes());
            4
        }
        _ => {
            dst[1] = 127;
            dst[2..10].copy_from_slice(&(payload_length as u64).to_be_bytes());
            10
        }
    }
}

/// Frame `payload` into `dst`; returns the bytes written.
///
/// `dst` must be at least [`message_frame_size`] long. Client frames get a
/// random mask key and the payload is written masked.
pub fn format_message<const IS_SERVER: bool>(
    dst: &mut [u8],
    payload: &[u8],
    opcode: OpCode,
    compressed: bool,
    fin: bool,
) -> usize {
    let mut header_length = format_header(dst, payload.len(), opcode, compressed, fin);

    if IS_SERVER {
        dst[header_length..header_length + payload.len()].copy_from_slice(payload);
    } else {
        dst[1] |= 0x80;
        let mask: [u8; 4] = rand::random();
        dst[header_length..header_length + 4].copy_from_slice(&mask);
        header_length += 4;

        let body = &mut dst[header_length..header_length + payload.len()];
        body.copy_from_slice(payload);
        unmask(body, mask);
    }

    header_length + payload.len()
}

/// XOR `payload` with `mask`, phase aligned to the first byte.
///
/// Masking and unmasking are the same operation.
pub fn unmask(payload: &mut [u8], mask: [u8; 4]) {
    let mut wide = [0u8; 16];
    for quad in wide.chunks_exact_mut(4) {
        quad.copy_from_slice(&mask);
    }
    let key = u128::from_ne_bytes(wide);

    let mut chunks = payload.chunks_exact_mut(16);
    for chunk in &mut chunks {
        let mut word = [0u8; 16];
        word.copy_from_slice(chunk);
        let unmasked = u128::from_ne_bytes(word) ^ key;
        chunk.copy_from_slice(&unmasked.to_ne_bytes());
    }

    // 16 is a multiple of 4 so the tail starts at phase 0
    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

pub fn is_valid_utf8(data: &[u8]) -> bool {
    std::str::from_utf8(data).is_ok()
}

/// A decoded close payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseFrame<'a> {
    pub code: u16,
    pub message: &'a [u8],
}

fn is_acceptable_close_code(code: u16) -> bool {
    match code {
        1000..=1003 | 1007..=1011 => true,
        4000..=4999 => true,
        _ => false,
    }
}

/// Decode a close frame payload.
///
/// Fewer than two bytes means no status (1005). An unusable status code or a
/// reason that is not UTF-8 is normalized to 1006 with a fixed reason.
pub fn parse_close_payload(payload: &[u8]) -> CloseFrame<'_> {
    if payload.len() < 2 {
        return CloseFrame {
            code: CLOSE_CODE_NO_STATUS,
            message: &[],
        };
    }

    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let message = &payload[2..];
    if !is_acceptable_close_code(code) || !is_valid_utf8(message) {
        return CloseFrame {
            code: CLOSE_CODE_ABNORMAL,
            message: INVALID_CLOSE_PAYLOAD.as_bytes(),
        };
    }

    CloseFrame { code, message }
}

/// Encode a close payload into `dst`; returns its length.
///
/// Codes 0, 1005 and 1006 produce an empty payload. `dst` must hold
/// `2 + message.len()` bytes.
pub fn format_close_payload(dst: &mut [u8], code: u16, message: &[u8]) -> usize {
    if matches!(code, CLOSE_CODE_NONE | CLOSE_CODE_NO_STATUS | CLOSE_CODE_ABNORMAL) {
        return 0;
    }
    dst[..2].copy_from_slice(&code.to_be_bytes());
    dst[2..2 + message.len()].copy_from_slice(message);
    2 + message.len()
}
