//! Per-context WebSocket settings.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::deflate::CompressOptions;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("max_payload_length must be greater than zero")]
    ZeroPayloadLimit,

    #[error("malformed compression options {0:#06x}")]
    MalformedCompression(u16),
}

/// WebSocket behaviour shared by every connection of a context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Compression offered to connections.
    pub compression: CompressOptions,
    /// Largest message accepted, after reassembly and inflation.
    pub max_payload_length: usize,
    /// Sends are dropped while more than this is buffered. 0 disables the limit.
    pub max_backpressure: usize,
    /// Ping an idle peer once before timing it out.
    pub send_pings_automatically: bool,
    /// Close a connection instead of only dropping sends over `max_backpressure`.
    pub close_on_backpressure_limit: bool,
    /// `WebSocket::publish` also delivers to the publishing connection.
    pub publish_to_self: bool,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            compression: CompressOptions::DISABLED,
            max_payload_length: 16 * 1024,
            max_backpressure: 64 * 1024,
            send_pings_automatically: true,
            close_on_backpressure_limit: false,
            publish_to_self: false,
        }
    }
}

impl WebSocketConfig {
    /// Parse and validate. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_payload_length == 0 {
            return Err(ConfigError::ZeroPayloadLimit);
        }
        if !self.compression.is_well_formed() {
            return Err(ConfigError::MalformedCompression(self.compression.0));
        }
        Ok(())
    }
}
