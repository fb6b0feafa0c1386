//! # wsloop — event-loop WebSocket engine
//!
//! Server-side RFC 6455 connections with permessage-deflate (RFC 7692),
//! topic pub/sub and corked, backpressure-aware writes. Everything runs on
//! the thread that owns the loop; only [`defer`] crosses threads.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐  on_data / on_writable / on_end / on_timeout
//! │ socket owner     │ ───────────────────────────────────────┐
//! │ (poller, tests)  │                                        ▼
//! └──────────────────┘                             ┌────────────────────┐
//!                                                  │ WebSocketContext   │
//!   LoopHandle::defer ──► DeferQueue ────────────► │  + behaviour       │
//!   (any thread)                                   └─────────┬──────────┘
//!                                                            │
//!        ┌───────────────┬───────────────────┬───────────────┴─────┐
//!        ▼               ▼                   ▼                     ▼
//! ┌─────────────┐ ┌─────────────┐    ┌──────────────┐     ┌──────────────┐
//! │ protocol    │ │ deflate     │    │ pubsub       │     │ event_loop   │
//! │ parse/frame │ │ in/deflate  │    │ TopicTree    │     │ cork arena,  │
//! └─────────────┘ └─────────────┘    └──────────────┘     │ sockets,     │
//!                                                         │ backpressure │
//!                                                         └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — frame parser and formatter, close payloads, UTF-8 gate
//! - [`deflate`] — compression options and per-message deflate streams
//! - [`pubsub`] — topic tree with batched, per-subscriber ordered delivery
//! - [`buffer`] — backpressure buffer and the per-loop cork arena
//! - [`socket`] / [`event_loop`] — transports, write paths and cork discipline
//! - [`websocket`] — connection orchestration and the application callbacks
//! - [`defer`] — cross-thread callbacks into the loop
//! - [`config`] — JSON-loadable settings
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Parse 1K small masked frames | <50µs |
//! | Publish 1K msgs × 100 subscribers + drain | <10ms |
//! | Deflate + inflate 4 KiB text message | <100µs |

pub mod buffer;
pub mod config;
pub mod defer;
pub mod deflate;
pub mod error;
pub mod event_loop;
pub mod protocol;
pub mod pubsub;
pub mod socket;
pub mod websocket;

// Re-exports for convenience
pub use buffer::{BackPressure, CorkArena, CORK_BUFFER_SIZE};
pub use config::{ConfigError, WebSocketConfig};
pub use defer::{DeferQueue, LoopHandle};
pub use deflate::{
    CompressOptions, CompressionConfig, CompressorMode, DecompressorMode, DeflationStream,
    InflationStream, ZlibContext,
};
pub use error::CloseReason;
pub use event_loop::{EventLoop, LoopData};
pub use protocol::{
    consume, format_message, message_frame_size, CloseFrame, OpCode, ProtocolHandler, ServerState,
    ClientState,
};
pub use pubsub::{IteratorFlags, SubscriberId, TopicTree};
pub use socket::{AsyncSocket, SocketId, Transport, WriteResult};
pub use websocket::{
    ContextData, SendStatus, TopicMessage, WebSocket, WebSocketBehavior, WebSocketContext,
    WebSocketData,
};
