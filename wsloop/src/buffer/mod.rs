//! Outgoing byte buffers shared by every socket on a loop.
//!
//! Architecture:
//! ```text
//! ┌───────────────┐  fits & free   ┌─────────────────────────────┐
//! │  send / write │ ─────────────► │ CorkArena (16KB, per loop)  │──┐
//! └───────┬───────┘                │ owner: at most one socket   │  │ uncork
//!         │ does not fit / busy    └─────────────────────────────┘  ▼
//!         ▼                                                    ┌─────────┐
//! ┌─────────────────────────────┐     drain on writable       │Transport│
//! │ BackPressure (per socket)   │ ──────────────────────────► │ write() │
//! │ append-mostly, lazy erase   │                             └─────────┘
//! └─────────────────────────────┘
//! ```
//!
//! The arena coalesces many small frames into one write per loop tick. Bytes
//! the transport refuses land in the socket's own `BackPressure` buffer and
//! are flushed before anything new is written.

pub mod backpressure;
pub mod cork;

pub use backpressure::BackPressure;
pub use cork::{CorkArena, CORK_BUFFER_SIZE};
