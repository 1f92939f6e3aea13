//! Compression strategies, selected by the name exchanged in SET_COMPRESSION.

use crate::codec::MAX_FRAME_SIZE;
use crate::error::{WireError, WireResult};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// A named, stateless compression algorithm.
pub trait CompressionProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn compress(&self, data: &[u8]) -> WireResult<Vec<u8>>;
    fn decompress(&self, data: &[u8]) -> WireResult<Vec<u8>>;
}

/// Pass-through; every link starts here.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCompression;

impl CompressionProvider for NoCompression {
    fn name(&self) -> &'static str {
        "none"
    }

    fn compress(&self, data: &[u8]) -> WireResult<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> WireResult<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// Raw DEFLATE.
#[derive(Debug, Default, Clone, Copy)]
pub struct Deflate;

impl CompressionProvider for Deflate {
    fn name(&self) -> &'static str {
        "deflate"
    }

    fn compress(&self, data: &[u8]) -> WireResult<Vec<u8>> {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(data)
            .map_err(|e| WireError::Compression(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| WireError::Compression(e.to_string()))
    }

    fn decompress(&self, data: &[u8]) -> WireResult<Vec<u8>> {
        let mut out = Vec::new();
        DeflateDecoder::new(data)
            .take(MAX_FRAME_SIZE as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| WireError::Compression(e.to_string()))?;
        if out.len() > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge {
                size: out.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(out)
    }
}

/// Names accepted in SET_COMPRESSION.
pub const AVAILABLE: &[&str] = &["none", "deflate"];

/// Look up a compressor by name.
pub fn by_name(name: &str) -> Option<Box<dyn CompressionProvider>> {
    match name {
        "none" => Some(Box::new(NoCompression)),
        "deflate" => Some(Box::new(Deflate)),
        _ => None,
    }
}
