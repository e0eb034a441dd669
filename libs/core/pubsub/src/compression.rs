//! Payload compression.
//!
//! Payloads are zlib-deflated and flagged with `compressed=true`,
//! `compression_type=deflate` so any consumer can undo it.

use crate::config::MessageOptions;
use crate::error::{PubSubError, Result};
use flate2::write::ZlibEncoder;
use flate2::{Compression, Decompress, FlushDecompress, Status};
use std::io::Write;

/// Value of the `compression_type` attribute.
pub const COMPRESSION_TYPE: &str = "deflate";

/// Upper bound on inflated payload size (compression bomb guard).
pub const MAX_DECOMPRESSED_SIZE: usize = 64 * 1024 * 1024;

const GROW_BY: usize = 64 * 1024;

/// Decides whether an encoded payload gets compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionPolicy {
    pub enabled: bool,
    /// Compress only payloads strictly larger than this many bytes
    pub threshold: usize,
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        Self::from(&MessageOptions::default())
    }
}

impl From<&MessageOptions> for CompressionPolicy {
    fn from(options: &MessageOptions) -> Self {
        Self {
            enabled: options.compress_payload,
            threshold: options.compression_threshold,
        }
    }
}

impl CompressionPolicy {
    pub fn new(enabled: bool, threshold: usize) -> Self {
        Self { enabled, threshold }
    }

    /// An explicit per-publish choice wins; otherwise size decides.
    pub fn should_compress(&self, encoded: &[u8], explicit: Option<bool>) -> bool {
        match explicit {
            Some(choice) => choice,
            None => self.enabled && encoded.len() > self.threshold,
        }
    }
}

/// zlib-deflate `data`.
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| PubSubError::Compression(format!("deflate failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| PubSubError::Compression(format!("deflate failed: {}", e)))
}

/// Inflate a zlib stream, rejecting corrupt, truncated or oversized input.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut inflater = Decompress::new(true);
    let mut output = Vec::with_capacity(data.len().saturating_mul(4).clamp(GROW_BY, MAX_DECOMPRESSED_SIZE));

    loop {
        if output.len() == output.capacity() {
            output.reserve_exact(next_reserve(output.len()));
        }

        let consumed = inflater.total_in() as usize;
        let produced = inflater.total_out();
        let status = inflater
            .decompress_vec(&data[consumed..], &mut output, FlushDecompress::Finish)
            .map_err(|e| PubSubError::Decompression(format!("corrupt deflate stream: {}", e)))?;

        if output.len() > MAX_DECOMPRESSED_SIZE {
            return Err(PubSubError::Decompression(format!(
                "payload inflates beyond {} bytes",
                MAX_DECOMPRESSED_SIZE
            )));
        }

        match status {
            Status::StreamEnd => return Ok(output),
            Status::Ok | Status::BufError => {
                let progressed =
                    inflater.total_in() as usize > consumed || inflater.total_out() > produced;
                if !progressed && output.len() < output.capacity() {
                    return Err(PubSubError::Decompression(
                        "truncated deflate stream".to_string(),
                    ));
                }
            }
        }
    }
}

/// Growth step, capped so the buffer never exceeds the limit by more
/// than the one byte that proves the overflow.
fn next_reserve(len: usize) -> usize {
    GROW_BY.min((MAX_DECOMPRESSED_SIZE + 1).saturating_sub(len)).max(1)
}
