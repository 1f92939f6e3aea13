//! Frame codec.
//!
//! A packet travels as `@` + base64(encrypt(compress(flat-kv))) + `$`. The
//! reader discards bytes until `@`, accumulates until `$`, then runs the
//! pipeline backwards. Base64 never produces either delimiter.

use crate::compression::{CompressionProvider, NoCompression};
use crate::encryption::{EncryptionProvider, PlainText};
use crate::error::{WireError, WireResult};
use crate::packet::Packet;
use agora_types::FlatKv;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

pub const FRAME_START: u8 = b'@';
pub const FRAME_END: u8 = b'$';

/// Maximum encoded or decompressed frame size (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// The negotiated compression and encryption for one direction pair of a link.
pub struct Pipeline {
    compression: Box<dyn CompressionProvider>,
    encryption: Box<dyn EncryptionProvider>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self {
            compression: Box::new(NoCompression),
            encryption: Box::new(PlainText),
        }
    }
}

impl Pipeline {
    pub fn new(
        compression: Box<dyn CompressionProvider>,
        encryption: Box<dyn EncryptionProvider>,
    ) -> Self {
        Self {
            compression,
            encryption,
        }
    }

    pub fn set_compression(&mut self, compression: Box<dyn CompressionProvider>) {
        self.compression = compression;
    }

    pub fn set_encryption(&mut self, encryption: Box<dyn EncryptionProvider>) {
        self.encryption = encryption;
    }

    pub fn compression_name(&self) -> &'static str {
        self.compression.name()
    }

    pub fn encryption_name(&self) -> &'static str {
        self.encryption.name()
    }

    /// Encode a packet into a complete frame, delimiters included.
    pub fn encode(&self, packet: &Packet) -> WireResult<Vec<u8>> {
        let flat = packet.to_flat().encode();
        let compressed = self.compression.compress(flat.as_bytes())?;
        let sealed = self.encryption.encrypt(&compressed)?;
        let encoded = STANDARD.encode(sealed);
        if encoded.len() > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge {
                size: encoded.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        let mut frame = Vec::with_capacity(encoded.len() + 2);
        frame.push(FRAME_START);
        frame.extend_from_slice(encoded.as_bytes());
        frame.push(FRAME_END);
        Ok(frame)
    }

    /// Decode the bytes found between the delimiters.
    pub fn decode(&self, payload: &[u8]) -> WireResult<Packet> {
        let sealed = STANDARD
            .decode(payload)
            .map_err(|e| WireError::StreamCorrupted(format!("bad base64: {e}")))?;
        let compressed = self.encryption.decrypt(&sealed)?;
        let flat = self.compression.decompress(&compressed)?;
        let text = String::from_utf8(flat)
            .map_err(|_| WireError::StreamCorrupted("frame is not UTF-8".into()))?;
        Packet::from_flat(&FlatKv::decode(&text))
    }
}

/// Reads delimited frames from a byte stream.
pub struct FrameReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
        }
    }

    /// Read the next frame's payload (without delimiters).
    ///
    /// Returns [`WireError::ConnectionClosed`] on EOF, whether between frames
    /// or inside one.
    pub async fn read_frame(&mut self) -> WireResult<Vec<u8>> {
        let mut junk = Vec::new();
        loop {
            junk.clear();
            let n = (&mut self.inner)
                .take(MAX_FRAME_SIZE as u64)
                .read_until(FRAME_START, &mut junk)
                .await?;
            if n == 0 {
                return Err(WireError::ConnectionClosed);
            }
            if junk.last() == Some(&FRAME_START) {
                break;
            }
        }

        let mut frame = Vec::new();
        (&mut self.inner)
            .take(MAX_FRAME_SIZE as u64 + 1)
            .read_until(FRAME_END, &mut frame)
            .await?;
        match frame.last() {
            Some(&FRAME_END) => {
                frame.pop();
                Ok(frame)
            }
            _ if frame.len() > MAX_FRAME_SIZE => Err(WireError::FrameTooLarge {
                size: frame.len(),
                max: MAX_FRAME_SIZE,
            }),
            _ => Err(WireError::ConnectionClosed),
        }
    }

    /// Read and decode the next packet.
    pub async fn read_packet(&mut self, pipeline: &std::sync::Mutex<Pipeline>) -> WireResult<Packet> {
        let payload = self.read_frame().await?;
        let pipeline = pipeline.lock().unwrap_or_else(|e| e.into_inner());
        pipeline.decode(&payload)
    }
}

/// Write a pre-encoded frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> WireResult<()> {
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}
