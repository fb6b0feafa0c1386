//! permessage-deflate (RFC 7692).
//!
//! ```text
//!            CompressOptions (u16)
//!   ┌──────────────┬──────────────┬──────────────────────────┐
//!   │ bits 15..12  │ bits 11..8   │ bits 7..0                │
//!   │ unused       │ decompressor │ compressor               │
//!   │              │ 0 off        │ 0 off                    │
//!   │              │ 1 shared     │ 1 shared                 │
//!   │              │ 9..=15 bits  │ window << 4 | mem_level  │
//!   └──────────────┴──────────────┴──────────────────────────┘
//! ```
//!
//! Shared codecs live once per event loop and are reset after every message
//! (no context takeover). Dedicated codecs belong to one connection and keep
//! their sliding window between messages.
//!
//! - [`stream`] — `DeflationStream`, `InflationStream` and the scratch `ZlibContext`

pub mod stream;

pub use stream::{DeflationStream, InflationStream, ZlibContext, FAST_PATH_LIMIT, ZLIB_BUFFER_SIZE};

use std::ops::BitOr;

use log::warn;
use serde::{Deserialize, Serialize};

/// Compression selection for one connection, as negotiated at upgrade time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompressOptions(pub u16);

impl CompressOptions {
    pub const DISABLED: Self = Self(0);

    pub const SHARED_COMPRESSOR: Self = Self(1);
    pub const SHARED_DECOMPRESSOR: Self = Self(1 << 8);

    pub const DEDICATED_DECOMPRESSOR_32KB: Self = Self(15 << 8);
    pub const DEDICATED_DECOMPRESSOR_16KB: Self = Self(14 << 8);
    pub const DEDICATED_DECOMPRESSOR_8KB: Self = Self(13 << 8);
    pub const DEDICATED_DECOMPRESSOR_4KB: Self = Self(12 << 8);
    pub const DEDICATED_DECOMPRESSOR_2KB: Self = Self(11 << 8);
    pub const DEDICATED_DECOMPRESSOR_1KB: Self = Self(10 << 8);
    pub const DEDICATED_DECOMPRESSOR_512B: Self = Self(9 << 8);
    pub const DEDICATED_DECOMPRESSOR: Self = Self::DEDICATED_DECOMPRESSOR_32KB;

    // Sizes name the approximate zlib memory footprint
    pub const DEDICATED_COMPRESSOR_3KB: Self = Self(9 << 4 | 1);
    pub const DEDICATED_COMPRESSOR_4KB: Self = Self(9 << 4 | 2);
    pub const DEDICATED_COMPRESSOR_8KB: Self = Self(10 << 4 | 3);
    pub const DEDICATED_COMPRESSOR_16KB: Self = Self(11 << 4 | 4);
    pub const DEDICATED_COMPRESSOR_32KB: Self = Self(12 << 4 | 5);
    pub const DEDICATED_COMPRESSOR_64KB: Self = Self(13 << 4 | 6);
    pub const DEDICATED_COMPRESSOR_128KB: Self = Self(14 << 4 | 7);
    pub const DEDICATED_COMPRESSOR_256KB: Self = Self(15 << 4 | 8);
    pub const DEDICATED_COMPRESSOR: Self = Self::DEDICATED_COMPRESSOR_256KB;

    pub fn is_disabled(self) -> bool {
        self.0 == 0
    }

    /// Compressor half.
    pub fn compressor(self) -> CompressorMode {
        let low = (self.0 & 0xFF) as u8;
        match low {
            0 => CompressorMode::Disabled,
            1 => CompressorMode::Shared,
            _ => {
                let window_bits = low >> 4;
                let mem_level = low & 0x0F;
                if (9..=15).contains(&window_bits) && (1..=9).contains(&mem_level) {
                    CompressorMode::Dedicated {
                        window_bits,
                        mem_level,
                    }
                } else {
                    warn!("ignoring malformed compressor options {:#04x}", low);
                    CompressorMode::Disabled
                }
            }
        }
    }

    /// Decompressor half.
    pub fn decompressor(self) -> DecompressorMode {
        let bits = ((self.0 >> 8) & 0x0F) as u8;
        match bits {
            0 => DecompressorMode::Disabled,
            1 => DecompressorMode::Shared,
            9..=15 => DecompressorMode::Dedicated { window_bits: bits },
            _ => {
                warn!("ignoring malformed decompressor options {:#x}", bits);
                DecompressorMode::Disabled
            }
        }
    }

    /// Both halves decode to something well formed.
    pub fn is_well_formed(self) -> bool {
        if self.0 >> 12 != 0 {
            return false;
        }
        let low = (self.0 & 0xFF) as u8;
        let compressor_ok = match low {
            0 | 1 => true,
            _ => (9..=15).contains(&(low >> 4)) && (1..=9).contains(&(low & 0x0F)),
        };
        let high = ((self.0 >> 8) & 0x0F) as u8;
        compressor_ok && matches!(high, 0 | 1 | 9..=15)
    }
}

impl BitOr for CompressOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl From<u16> for CompressOptions {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressorMode {
    Disabled,
    Shared,
    /// `mem_level` is carried for completeness; the zlib backend runs at its
    /// default memory level.
    Dedicated { window_bits: u8, mem_level: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecompressorMode {
    Disabled,
    Shared,
    Dedicated { window_bits: u8 },
}

/// `CompressOptions` decoded once at connection setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionConfig {
    pub compressor: CompressorMode,
    pub decompressor: DecompressorMode,
}

impl From<CompressOptions> for CompressionConfig {
    fn from(options: CompressOptions) -> Self {
        Self {
            compressor: options.compressor(),
            decompressor: options.decompressor(),
        }
    }
}

impl CompressionConfig {
    pub fn can_compress(&self) -> bool {
        self.compressor != CompressorMode::Disabled
    }

    pub fn can_decompress(&self) -> bool {
        self.decompressor != DecompressorMode::Disabled
    }

    /// A per-connection compressor, if one was asked for.
    pub fn dedicated_deflation(&self) -> Option<DeflationStream> {
        match self.compressor {
            CompressorMode::Dedicated { window_bits, .. } => Some(DeflationStream::new(window_bits)),
            _ => None,
        }
    }

    /// A per-connection decompressor, if one was asked for.
    pub fn dedicated_inflation(&self) -> Option<InflationStream> {
        match self.decompressor {
            DecompressorMode::Dedicated { window_bits } => Some(InflationStream::new(window_bits)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_shared() {
        let options = CompressOptions::SHARED_COMPRESSOR | CompressOptions::SHARED_DECOMPRESSOR;
        let config = CompressionConfig::from(options);
        assert_eq!(config.compressor, CompressorMode::Shared);
        assert_eq!(config.decompressor, DecompressorMode::Shared);
        assert!(config.dedicated_deflation().is_none());
    }

    #[test]
    fn test_decode_dedicated() {
        let options = CompressOptions::DEDICATED_COMPRESSOR_4KB | CompressOptions::DEDICATED_DECOMPRESSOR_1KB;
        assert_eq!(
            options.compressor(),
            CompressorMode::Dedicated {
                window_bits: 9,
                mem_level: 2
            }
        );
        assert_eq!(options.decompressor(), DecompressorMode::Dedicated { window_bits: 10 });
        assert!(options.is_well_formed());
    }

    #[test]
    fn test_disabled() {
        let config = CompressionConfig::from(CompressOptions::DISABLED);
        assert!(!config.can_compress());
        assert!(!config.can_decompress());
        assert!(CompressOptions::DISABLED.is_disabled());
    }

    #[test]
    fn test_malformed_halves_disable() {
        // window 3 is below zlib's minimum
        let options = CompressOptions(3 << 4 | 1);
        assert_eq!(options.compressor(), CompressorMode::Disabled);
        assert!(!options.is_well_formed());

        let options = CompressOptions(5 << 8);
        assert_eq!(options.decompressor(), DecompressorMode::Disabled);
        assert!(!options.is_well_formed());
    }

    #[test]
    fn test_serde_is_plain_number() {
        let json = serde_json::to_string(&CompressOptions::DEDICATED_DECOMPRESSOR).unwrap();
        assert_eq!(json, "3840");
        let back: CompressOptions = serde_json::from_str("257").unwrap();
        assert_eq!(back, CompressOptions::SHARED_COMPRESSOR | CompressOptions::SHARED_DECOMPRESSOR);
    }
}
