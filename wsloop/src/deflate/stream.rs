//! Streaming raw-deflate codecs over shared scratch buffers.
//!
//! Output views borrow the [`ZlibContext`], so a result is only readable until
//! the next call that takes the context mutably.
//!
//! Performance targets: no allocation for messages whose output fits the
//! 16 KiB scratch buffer; one-shot path for inputs up to 4 KiB when the
//! window is reset after every message.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use log::{debug, trace};

/// Fixed scratch size for both directions.
pub const ZLIB_BUFFER_SIZE: usize = 16 * 1024;

/// Inputs up to this size may take the one-shot path.
pub const FAST_PATH_LIMIT: usize = 4 * 1024;

/// Empty stored block a sync flush ends with. Stripped on send, restored on
/// receive.
const SYNC_TAIL: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

const DEFAULT_WINDOW_BITS: u8 = 15;

/// Per-loop scratch memory for every codec on that loop.
pub struct ZlibContext {
    deflation_buffer: Box<[u8]>,
    inflation_buffer: Box<[u8]>,
    dynamic_deflation: Vec<u8>,
    dynamic_inflation: Vec<u8>,
    fast_deflate: Compress,
    fast_inflate: Decompress,
    fast_input: Vec<u8>,
}

impl Default for ZlibContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ZlibContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZlibContext")
            .field("dynamic_deflation", &self.dynamic_deflation.len())
            .field("dynamic_inflation", &self.dynamic_inflation.len())
            .finish()
    }
}

impl ZlibContext {
    pub fn new() -> Self {
        Self {
            deflation_buffer: vec![0u8; ZLIB_BUFFER_SIZE].into_boxed_slice(),
            inflation_buffer: vec![0u8; ZLIB_BUFFER_SIZE].into_boxed_slice(),
            dynamic_deflation: Vec::new(),
            dynamic_inflation: Vec::new(),
            fast_deflate: Compress::new_with_window_bits(Compression::default(), false, DEFAULT_WINDOW_BITS),
            fast_inflate: Decompress::new_with_window_bits(false, DEFAULT_WINDOW_BITS),
            fast_input: Vec::with_capacity(FAST_PATH_LIMIT + SYNC_TAIL.len()),
        }
    }

    /// One-shot compression into the scratch buffer. `None` if the output
    /// did not come out complete in a single call.
    fn fast_deflate(&mut self, raw: &[u8]) -> Option<usize> {
        self.fast_deflate.reset();
        let result = self
            .fast_deflate
            .compress(raw, &mut self.deflation_buffer, FlushCompress::Sync);
        let consumed = self.fast_deflate.total_in() as usize;
        let produced = self.fast_deflate.total_out() as usize;

        match result {
            Ok(_) if consumed == raw.len() && produced < self.deflation_buffer.len() && produced >= 4 => {
                Some(produced - SYNC_TAIL.len())
            }
            _ => None,
        }
    }

    /// One-shot decompression of `compressed` plus the sync tail.
    fn fast_inflate(&mut self, compressed: &[u8], max_length: usize) -> Option<usize> {
        self.fast_input.clear();
        self.fast_input.extend_from_slice(compressed);
        self.fast_input.extend_from_slice(&SYNC_TAIL);

        self.fast_inflate.reset(false);
        let result = self
            .fast_inflate
            .decompress(&self.fast_input, &mut self.inflation_buffer, FlushDecompress::Sync);
        let consumed = self.fast_inflate.total_in() as usize;
        let produced = self.fast_inflate.total_out() as usize;

        match result {
            Ok(Status::Ok) | Ok(Status::BufError)
                if consumed == self.fast_input.len()
                    && produced < self.inflation_buffer.len()
                    && produced <= max_length =>
            {
                Some(produced)
            }
            _ => None,
        }
    }
}

/// A compressor, either dedicated to one connection or shared by a loop.
pub struct DeflationStream {
    stream: Compress,
    window_bits: u8,
    /// Fresh or just reset: output would equal a one-shot compressor's.
    pristine: bool,
}

impl std::fmt::Debug for DeflationStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeflationStream")
            .field("window_bits", &self.window_bits)
            .field("pristine", &self.pristine)
            .finish()
    }
}

impl DeflationStream {
    /// `window_bits` must be in `9..=15`.
    pub fn new(window_bits: u8) -> Self {
        Self {
            stream: Compress::new_with_window_bits(Compression::default(), false, window_bits),
            window_bits,
            pristine: true,
        }
    }

    pub fn window_bits(&self) -> u8 {
        self.window_bits
    }

    /// Compress one message.
    ///
    /// The trailing `00 00 FF FF` is removed. With `reset` the window is
    /// discarded afterwards (no context takeover). `None` if zlib failed;
    /// the stream is reset and nothing partial is returned.
    pub fn deflate<'a>(&mut self, ctx: &'a mut ZlibContext, raw: &[u8], reset: bool) -> Option<&'a [u8]> {
        ctx.dynamic_deflation.clear();

        if reset && self.pristine && self.window_bits == DEFAULT_WINDOW_BITS && raw.len() <= FAST_PATH_LIMIT {
            if let Some(length) = ctx.fast_deflate(raw) {
                return Some(&ctx.deflation_buffer[..length]);
            }
        }

        let mut input = raw;
        let mut produced;
        loop {
            let before_in = self.stream.total_in();
            let before_out = self.stream.total_out();
            let result = self
                .stream
                .compress(input, &mut ctx.deflation_buffer, FlushCompress::Sync);
            let consumed = (self.stream.total_in() - before_in) as usize;
            produced = (self.stream.total_out() - before_out) as usize;
            input = &input[consumed..];

            if let Err(e) = result {
                debug!("deflate failed: {}", e);
                ctx.dynamic_deflation.clear();
                self.stream.reset();
                self.pristine = true;
                return None;
            }

            // A full buffer means the flush may not be done yet
            if produced == ctx.deflation_buffer.len() {
                ctx.dynamic_deflation.extend_from_slice(&ctx.deflation_buffer[..produced]);
                continue;
            }
            break;
        }

        if reset {
            self.stream.reset();
            self.pristine = true;
        } else {
            self.pristine = false;
        }

        if ctx.dynamic_deflation.is_empty() {
            let length = produced.saturating_sub(SYNC_TAIL.len());
            return Some(&ctx.deflation_buffer[..length]);
        }

        ctx.dynamic_deflation.extend_from_slice(&ctx.deflation_buffer[..produced]);
        let length = ctx.dynamic_deflation.len().saturating_sub(SYNC_TAIL.len());
        ctx.dynamic_deflation.truncate(length);
        trace!("deflate spilled {} bytes to the dynamic buffer", length);
        Some(&ctx.dynamic_deflation)
    }
}

/// A decompressor, either dedicated to one connection or shared by a loop.
pub struct InflationStream {
    stream: Decompress,
    window_bits: u8,
}

impl std::fmt::Debug for InflationStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InflationStream")
            .field("window_bits", &self.window_bits)
            .finish()
    }
}

impl InflationStream {
    /// `window_bits` must be in `9..=15`.
    pub fn new(window_bits: u8) -> Self {
        Self {
            stream: Decompress::new_with_window_bits(false, window_bits),
            window_bits,
        }
    }

    pub fn window_bits(&self) -> u8 {
        self.window_bits
    }

    /// Decompress one message.
    ///
    /// Returns `None` on corrupt input or when the output would exceed
    /// `max_length`. With `reset` the window is discarded afterwards.
    pub fn inflate<'a>(
        &mut self,
        ctx: &'a mut ZlibContext,
        compressed: &[u8],
        max_length: usize,
        reset: bool,
    ) -> Option<&'a [u8]> {
        ctx.dynamic_inflation.clear();

        if reset && compressed.len() <= FAST_PATH_LIMIT {
            if let Some(length) = ctx.fast_inflate(compressed, max_length) {
                return Some(&ctx.inflation_buffer[..length]);
            }
        }

        let outcome = self.inflate_streaming(ctx, compressed, max_length);

        if reset || outcome.is_none() {
            self.stream.reset(false);
        }

        let filled = outcome?;
        if ctx.dynamic_inflation.is_empty() {
            return Some(&ctx.inflation_buffer[..filled]);
        }
        ctx.dynamic_inflation.extend_from_slice(&ctx.inflation_buffer[..filled]);
        Some(&ctx.dynamic_inflation)
    }

    /// Runs the stream over `compressed` then the sync tail. Returns how much
    /// of the scratch buffer holds the final piece of output.
    fn inflate_streaming(&mut self, ctx: &mut ZlibContext, compressed: &[u8], max_length: usize) -> Option<usize> {
        let mut filled = 0usize;

        for segment in [compressed, &SYNC_TAIL[..]] {
            let mut input = segment;
            loop {
                let before_in = self.stream.total_in();
                let before_out = self.stream.total_out();
                let result = self.stream.decompress(
                    input,
                    &mut ctx.inflation_buffer[filled..],
                    FlushDecompress::Sync,
                );
                let consumed = (self.stream.total_in() - before_in) as usize;
                let produced = (self.stream.total_out() - before_out) as usize;
                input = &input[consumed..];
                filled += produced;

                let status = match result {
                    Ok(status) => status,
                    Err(e) => {
                        debug!("inflate failed: {}", e);
                        return None;
                    }
                };

                if ctx.dynamic_inflation.len() + filled > max_length {
                    return None;
                }

                if filled == ctx.inflation_buffer.len() {
                    ctx.dynamic_inflation.extend_from_slice(&ctx.inflation_buffer[..filled]);
                    filled = 0;
                    continue;
                }

                if status == Status::StreamEnd {
                    // Final block seen; nothing after it belongs to this message
                    return Some(filled);
                }

                if input.is_empty() {
                    break;
                }

                if consumed == 0 && produced == 0 {
                    debug!("inflate made no progress with {} bytes left", input.len());
                    return None;
                }
            }
        }

        Some(filled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        b"the quick brown fox jumps over the lazy dog. "
            .iter()
            .cycle()
            .take(len)
            .copied()
            .collect()
    }

    #[test]
    fn test_shared_round_trip_small() {
        let mut ctx = ZlibContext::new();
        let mut deflation = DeflationStream::new(15);
        let mut inflation = InflationStream::new(15);

        let payload = sample(1000);
        let compressed = deflation.deflate(&mut ctx, &payload, true).unwrap().to_vec();
        assert!(compressed.len() < payload.len());
        assert!(!compressed.ends_with(&SYNC_TAIL));

        let inflated = inflation.inflate(&mut ctx, &compressed, payload.len(), true).unwrap();
        assert_eq!(inflated, &payload[..]);
    }

    #[test]
    fn test_deflate_output_is_always_complete() {
        let mut ctx = ZlibContext::new();
        let mut deflation = DeflationStream::new(15);
        let noisy: Vec<u8> = (0..60_000u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();

        // A spilled message followed by small ones: each result is a whole
        // message on its own, never leftovers of the previous call
        for payload in [noisy.clone(), sample(10), Vec::new(), noisy] {
            let compressed = deflation
                .deflate(&mut ctx, &payload, true)
                .expect("valid input deflates")
                .to_vec();
            let inflated = InflationStream::new(15)
                .inflate(&mut ctx, &compressed, payload.len(), true)
                .map(<[u8]>::to_vec);
            assert_eq!(inflated, Some(payload));
        }
    }

    #[test]
    fn test_fast_path_matches_streaming() {
        let payload = sample(3000);

        let mut ctx = ZlibContext::new();
        let fast = DeflationStream::new(15).deflate(&mut ctx, &payload, true).unwrap().to_vec();

        // Window 15 without reset never takes the one-shot path
        let streaming = DeflationStream::new(15).deflate(&mut ctx, &payload, false).unwrap().to_vec();
        assert_eq!(fast, streaming);
    }

    #[test]
    fn test_large_output_spills_to_dynamic_buffer() {
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();
        let mut ctx = ZlibContext::new();

        let compressed = DeflationStream::new(15).deflate(&mut ctx, &payload, true).unwrap().to_vec();
        assert!(compressed.len() > ZLIB_BUFFER_SIZE);

        let inflated = InflationStream::new(15)
            .inflate(&mut ctx, &compressed, payload.len(), true)
            .unwrap()
            .to_vec();
        assert_eq!(inflated, payload);
    }

    #[test]
    fn test_max_length_enforced() {
        let payload = sample(50_000);
        let mut ctx = ZlibContext::new();
        let compressed = DeflationStream::new(15).deflate(&mut ctx, &payload, true).unwrap().to_vec();

        let mut inflation = InflationStream::new(15);
        assert!(inflation.inflate(&mut ctx, &compressed, 49_999, true).is_none());
        assert!(inflation.inflate(&mut ctx, &compressed, 50_000, true).is_some());
    }

    #[test]
    fn test_corrupt_input_rejected() {
        let mut ctx = ZlibContext::new();
        let mut inflation = InflationStream::new(15);
        assert!(inflation.inflate(&mut ctx, &[0xFF, 0xFF, 0xFF, 0xFF, 0xFF], 1024, true).is_none());
        assert!(inflation.inflate(&mut ctx, &[0xFF; 5000], 1024, false).is_none());
    }

    #[test]
    fn test_context_takeover_shrinks_repeats() {
        let mut ctx = ZlibContext::new();
        let mut deflation = DeflationStream::new(15);
        let mut inflation = InflationStream::new(15);
        let payload = sample(2000);

        let first = deflation.deflate(&mut ctx, &payload, false).unwrap().to_vec();
        let second = deflation.deflate(&mut ctx, &payload, false).unwrap().to_vec();
        assert!(second.len() < first.len());

        let a = inflation.inflate(&mut ctx, &first, 4096, false).unwrap().to_vec();
        let b = inflation.inflate(&mut ctx, &second, 4096, false).unwrap().to_vec();
        assert_eq!(a, payload);
        assert_eq!(b, payload);
    }

    #[test]
    fn test_empty_message() {
        let mut ctx = ZlibContext::new();
        let compressed = DeflationStream::new(15).deflate(&mut ctx, b"", true).unwrap().to_vec();
        let inflated = InflationStream::new(15).inflate(&mut ctx, &compressed, 0, true).unwrap();
        assert!(inflated.is_empty());
    }
}
