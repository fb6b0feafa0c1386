//! Close reasons reported when a connection is torn down by the engine.
//!
//! None of these are retried. The parser, codec and topic tree report them
//! through return values or `force_close`, never by unwinding, and the
//! connection layer turns them into an abrupt close with the string below
//! as the reason.

use thiserror::Error;

/// Why the engine force-closed a connection.
///
/// The `Display` text is the machine-readable reason handed to the close
/// handler and is part of the public behaviour, so changing it is a breaking
/// change for peers that match on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CloseReason {
    /// Bad opcode, reserved bits, masking or fragmentation order.
    #[error("Received invalid WebSocket frame")]
    ProtocolViolation,

    /// Refused by the payload-length policy.
    #[error("Received too big message")]
    PayloadTooLarge,

    /// Inflation failed or produced more than the allowed length.
    #[error("Received too big message, or other inflation error")]
    CompressionFailure,

    /// Text message (or close reason) that is not valid UTF-8.
    #[error("Received invalid UTF-8")]
    InvalidUtf8,

    #[error("WebSocket timed out from inactivity")]
    Timeout,
}
