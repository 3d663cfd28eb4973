//! Payload compression codecs.
//!
//! Three codecs are supported: gzip and zlib deflate via `flate2`, and
//! brotli. Every codec's output starts with (or is validated as) its format
//! signature, so the receive path can detect the algorithm from the first
//! bytes alone and no extra framing is needed:
//!
//! - gzip: `1F 8B`
//! - zlib deflate: `78` followed by `01`, `9C` or `DA`
//! - brotli: no magic bytes; detected structurally by a bounded trial decode
//!
//! Compression levels are clamped to each codec's supported range, so any
//! configured level in `0..=9` is accepted everywhere.

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use thiserror::Error;

/// Supported compression algorithms.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// No compression.
    #[default]
    None,
    /// Gzip framing (RFC 1952).
    Gzip,
    /// Zlib deflate framing (RFC 1950).
    Deflate,
    /// Brotli (RFC 7932).
    Brotli,
}

/// Errors from compress/decompress operations.
#[derive(Error, Debug)]
pub enum CompressionError {
    /// The input is not valid data for the codec.
    #[error("Invalid compressed data: {0}")]
    InvalidData(String),

    /// An I/O error from the underlying encoder/decoder.
    #[error("Compression I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A byte-level compression codec.
pub trait CompressionCodec: Send + Sync {
    /// The algorithm this codec implements.
    fn algorithm(&self) -> CompressionAlgorithm;

    /// Compress `data`. Empty input yields empty output.
    ///
    /// # Errors
    ///
    /// Returns [`CompressionError::Io`] if the encoder fails.
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError>;

    /// Decompress `data`. Empty input yields empty output.
    ///
    /// # Errors
    ///
    /// Returns [`CompressionError::InvalidData`] if `data` is not a valid
    /// stream for this codec.
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError>;

    /// Whether `data` looks like output of this codec.
    fn is_compressed(&self, data: &[u8]) -> bool;
}

/// Gzip codec backed by `flate2`.
#[derive(Clone, Copy, Debug)]
pub struct GzipCodec {
    level: u32,
}

impl GzipCodec {
    /// Create a codec with the given level, clamped to `0..=9`.
    #[must_use]
    pub const fn new(level: u32) -> Self {
        Self {
            level: clamp_level(level, 9),
        }
    }
}

impl Default for GzipCodec {
    fn default() -> Self {
        Self::new(6)
    }
}

impl CompressionCodec for GzipCodec {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Gzip
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(self.level));
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let mut decoder = GzDecoder::new(data);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| CompressionError::InvalidData(e.to_string()))?;
        Ok(out)
    }

    fn is_compressed(&self, data: &[u8]) -> bool {
        data.len() >= 2 && data[0] == 0x1F && data[1] == 0x8B
    }
}

/// Zlib deflate codec backed by `flate2`.
#[derive(Clone, Copy, Debug)]
pub struct DeflateCodec {
    level: u32,
}

impl DeflateCodec {
    /// Create a codec with the given level, clamped to `0..=9`.
    #[must_use]
    pub const fn new(level: u32) -> Self {
        Self {
            level: clamp_level(level, 9),
        }
    }
}

impl Default for DeflateCodec {
    fn default() -> Self {
        Self::new(6)
    }
}

impl CompressionCodec for DeflateCodec {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Deflate
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(self.level));
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let mut decoder = ZlibDecoder::new(data);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| CompressionError::InvalidData(e.to_string()))?;
        Ok(out)
    }

    fn is_compressed(&self, data: &[u8]) -> bool {
        data.len() >= 2 && data[0] == 0x78 && matches!(data[1], 0x01 | 0x9C | 0xDA)
    }
}

/// Brotli codec.
#[derive(Clone, Copy, Debug)]
pub struct BrotliCodec {
    level: u32,
}

/// Brotli encoder window size (log2). 22 is the library default.
const BROTLI_LG_WINDOW: u32 = 22;

impl BrotliCodec {
    /// Create a codec with the given level, clamped to brotli's `0..=11`.
    #[must_use]
    pub const fn new(level: u32) -> Self {
        Self {
            level: clamp_level(level, 11),
        }
    }
}

impl Default for BrotliCodec {
    fn default() -> Self {
        Self::new(6)
    }
}

impl CompressionCodec for BrotliCodec {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Brotli
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        {
            let mut writer =
                brotli::CompressorWriter::new(&mut out, 4096, self.level, BROTLI_LG_WINDOW);
            writer.write_all(data)?;
            writer.flush()?;
        }
        Ok(out)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        let mut reader = brotli::Decompressor::new(data, 4096);
        reader
            .read_to_end(&mut out)
            .map_err(|e| CompressionError::InvalidData(e.to_string()))?;
        Ok(out)
    }

    fn is_compressed(&self, data: &[u8]) -> bool {
        // Brotli has no magic bytes. A header-only parse accepts too much,
        // so the structural check is a full trial decode: only a stream
        // that decodes cleanly to EOF counts.
        if data.is_empty() {
            return false;
        }
        let mut reader = brotli::Decompressor::new(data, 4096);
        let mut sink = [0u8; 4096];
        loop {
            match reader.read(&mut sink) {
                Ok(0) => return true,
                Ok(_) => {},
                Err(_) => return false,
            }
        }
    }
}

const fn clamp_level(level: u32, max: u32) -> u32 {
    if level > max { max } else { level }
}

/// Detect the compression algorithm of `data` from its leading bytes.
///
/// Gzip and zlib are matched on their magic bytes; brotli is the structural
/// fallback. Returns [`CompressionAlgorithm::None`] for data that matches
/// nothing.
#[must_use]
pub fn detect(data: &[u8]) -> CompressionAlgorithm {
    let gzip = GzipCodec::default();
    let deflate = DeflateCodec::default();
    let brotli_codec = BrotliCodec::default();
    if gzip.is_compressed(data) {
        CompressionAlgorithm::Gzip
    } else if deflate.is_compressed(data) {
        CompressionAlgorithm::Deflate
    } else if brotli_codec.is_compressed(data) {
        CompressionAlgorithm::Brotli
    } else {
        CompressionAlgorithm::None
    }
}

/// Build the codec for `algorithm` at `level`, or `None` for
/// [`CompressionAlgorithm::None`].
#[must_use]
pub fn codec_for(
    algorithm: CompressionAlgorithm,
    level: u32,
) -> Option<Box<dyn CompressionCodec>> {
    match algorithm {
        CompressionAlgorithm::None => None,
        CompressionAlgorithm::Gzip => Some(Box::new(GzipCodec::new(level))),
        CompressionAlgorithm::Deflate => Some(Box::new(DeflateCodec::new(level))),
        CompressionAlgorithm::Brotli => Some(Box::new(BrotliCodec::new(level))),
    }
}

/// Decompress `data` with whatever codec its leading bytes identify.
///
/// Data that matches no codec is returned unchanged, which makes this safe
/// to call on every received payload.
///
/// # Errors
///
/// Returns [`CompressionError::InvalidData`] if the detected stream is
/// corrupt past its header.
pub fn decompress_auto(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    match detect(data) {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        algorithm => {
            // codec_for only returns None for None, which the match above
            // already handled.
            match codec_for(algorithm, 0) {
                Some(codec) => codec.decompress(data),
                None => Ok(data.to_vec()),
            }
        },
    }
}
