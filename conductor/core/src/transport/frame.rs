//! Frame Codec
//!
//! Wire format for relay messages: length-prefixed JSON with a CRC32 checksum.
//!
//! ```text
//! +----------------+----------------+------------------------------------------+
//! | Length (4)     | Checksum (4)   | JSON Payload (variable)                  |
//! | big-endian u32 | CRC32          | RelayFrame                               |
//! +----------------+----------------+------------------------------------------+
//! ```
//!
//! Length covers the payload only. The size limit is checked before any
//! payload buffer is trusted.

use serde::{de::DeserializeOwned, Serialize};

use super::TransportError;

/// Maximum payload size (10 MB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Minimum buffer capacity for decoder
const MIN_BUFFER_CAPACITY: usize = 4096;

/// Frame header size: 4 bytes length + 4 bytes checksum
const HEADER_SIZE: usize = 8;

#[inline]
fn compute_checksum(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Encode a message as one frame
///
/// # Errors
///
/// `SerializationError` if JSON serialization fails or the payload exceeds
/// [`MAX_FRAME_SIZE`].
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, TransportError> {
    let json =
        serde_json::to_vec(msg).map_err(|e| TransportError::SerializationError(e.to_string()))?;

    if json.len() > MAX_FRAME_SIZE {
        return Err(TransportError::SerializationError(format!(
            "Frame too large: {} bytes (max: {MAX_FRAME_SIZE})",
            json.len()
        )));
    }

    let mut buf = Vec::with_capacity(HEADER_SIZE + json.len());
    buf.extend_from_slice(&(json.len() as u32).to_be_bytes());
    buf.extend_from_slice(&compute_checksum(&json).to_be_bytes());
    buf.extend_from_slice(&json);
    Ok(buf)
}

/// Incremental decoder
///
/// Buffers bytes as they arrive from a socket and yields complete messages.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    read_pos: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a decoder
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
        }
    }

    /// Append received bytes
    pub fn push(&mut self, data: &[u8]) {
        // Compact once more than half the buffer is consumed
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Bytes buffered but not yet decoded
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Try to decode the next frame
    ///
    /// `Ok(None)` means more bytes are needed. An oversized length, a checksum
    /// mismatch or malformed JSON is an error; the connection should be dropped.
    pub fn decode<T: DeserializeOwned>(&mut self) -> Result<Option<T>, TransportError> {
        let available = self.available();
        if available < HEADER_SIZE {
            return Ok(None);
        }

        let len = read_u32(&self.buffer[self.read_pos..self.read_pos + 4]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(TransportError::SerializationError(format!(
                "Frame size {len} exceeds maximum {MAX_FRAME_SIZE}"
            )));
        }
        if available < HEADER_SIZE + len {
            return Ok(None);
        }

        let expected = read_u32(&self.buffer[self.read_pos + 4..self.read_pos + HEADER_SIZE]);
        let payload_start = self.read_pos + HEADER_SIZE;
        let payload_end = payload_start + len;
        let payload = &self.buffer[payload_start..payload_end];

        let actual = compute_checksum(payload);
        if actual != expected {
            return Err(TransportError::ChecksumMismatch { expected, actual });
        }

        let msg = serde_json::from_slice(payload)
            .map_err(|e| TransportError::SerializationError(e.to_string()))?;
        self.read_pos = payload_end;
        Ok(Some(msg))
    }
}
