//! Frame codec for outbound envelopes.
//!
//! Plain connections receive JSON text. Compressed connections share one
//! zlib stream for their whole lifetime; every envelope is terminated with a
//! full flush so the peer can inflate it as soon as it arrives.

use bytes::Bytes;
use flate2::{Compress, CompressError, Compression, FlushCompress};
use std::str::FromStr;
use thiserror::Error;

use crate::envelope::Envelope;

/// Size of the chunks a compressed frame is split into.
pub const CHUNK_SIZE: usize = 1024;

/// Trailer emitted by a zlib full flush.
pub const FULL_FLUSH_MARKER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Protocol errors that can occur during encoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// JSON serialization failed.
    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    /// The compressor rejected its input.
    #[error("Compression error: {0}")]
    Compress(#[from] CompressError),

    /// Unknown encoding requested at connect time.
    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),
}

/// Encoding mode negotiated when a connection opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Encoding {
    /// JSON text frames.
    #[default]
    Json,
    /// zlib-compressed JSON in binary frames.
    Zlib,
}

impl Encoding {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Json => "json",
            Encoding::Zlib => "zlib",
        }
    }
}

impl FromStr for Encoding {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" | "plain" => Ok(Encoding::Json),
            "zlib" | "compressed" => Ok(Encoding::Zlib),
            other => Err(ProtocolError::InvalidEncoding(other.to_string())),
        }
    }
}

/// An envelope ready for the transport.
///
/// A binary frame may span several chunks; transports must deliver all of
/// them as a single logical message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodedFrame {
    Text(String),
    Binary(Vec<Bytes>),
}

impl EncodedFrame {
    /// Total encoded size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            EncodedFrame::Text(text) => text.len(),
            EncodedFrame::Binary(chunks) => chunks.iter().map(Bytes::len).sum(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Join all chunks into one contiguous buffer.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        match self {
            EncodedFrame::Text(text) => Bytes::from(text),
            EncodedFrame::Binary(mut chunks) if chunks.len() == 1 => chunks.remove(0),
            EncodedFrame::Binary(chunks) => {
                let mut buf = Vec::with_capacity(chunks.iter().map(Bytes::len).sum());
                for chunk in &chunks {
                    buf.extend_from_slice(chunk);
                }
                Bytes::from(buf)
            }
        }
    }
}

/// Split a buffer into `chunk_size` pieces without copying.
#[must_use]
pub fn chunk(data: Bytes, chunk_size: usize) -> Vec<Bytes> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::with_capacity(data.len().div_ceil(chunk_size));
    let mut offset = 0;
    while offset < data.len() {
        let end = (offset + chunk_size).min(data.len());
        chunks.push(data.slice(offset..end));
        offset = end;
    }
    chunks
}

/// Per-connection encoder.
///
/// Holds the connection's compression context, which is never reset.
pub struct FrameCodec {
    encoding: Encoding,
    deflate: Option<Compress>,
}

impl FrameCodec {
    /// Create a codec for the given encoding.
    #[must_use]
    pub fn new(encoding: Encoding) -> Self {
        let deflate = match encoding {
            Encoding::Json => None,
            Encoding::Zlib => Some(Compress::new(Compression::default(), true)),
        };
        Self { encoding, deflate }
    }

    #[must_use]
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Encode an envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or compression fails.
    pub fn encode(&mut self, envelope: &Envelope) -> Result<EncodedFrame, ProtocolError> {
        match self.deflate.as_mut() {
            None => Ok(EncodedFrame::Text(serde_json::to_string(envelope)?)),
            Some(deflate) => {
                let json = serde_json::to_vec(envelope)?;
                let compressed = deflate_full_flush(deflate, &json)?;
                Ok(EncodedFrame::Binary(chunk(Bytes::from(compressed), CHUNK_SIZE)))
            }
        }
    }
}

impl std::fmt::Debug for FrameCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCodec")
            .field("encoding", &self.encoding)
            .finish_non_exhaustive()
    }
}

/// Feed `input` through the stream and end it with a full-flush boundary.
fn deflate_full_flush(deflate: &mut Compress, input: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let start = deflate.total_in();
    let mut out = Vec::with_capacity(input.len() / 2 + 64);

    loop {
        let consumed = (deflate.total_in() - start) as usize;
        deflate.compress_vec(&input[consumed..], &mut out, FlushCompress::Full)?;

        let consumed = (deflate.total_in() - start) as usize;
        // Spare output room after consuming everything means the flush completed.
        if consumed == input.len() && out.len() < out.capacity() {
            return Ok(out);
        }
        out.reserve(out.capacity().max(256));
    }
}
