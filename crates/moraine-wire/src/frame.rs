//! Length-prefixed message framing.
//!
//! Each frame is:
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────────────────────────┐
//! │   Length     │   Checksum   │            Payload               │
//! │   (4 bytes)  │   (4 bytes)  │         (variable)               │
//! └──────────────┴──────────────┴──────────────────────────────────┘
//! ```
//!
//! - **Length**: big-endian `u32` of the payload size (header excluded)
//! - **Checksum**: CRC32 of the payload
//! - **Payload**: bincode-serialized [`Message`]
//!
//! The decoder parses incrementally so it can be fed whatever a non-blocking
//! read produced, one fragment at a time.

use crate::error::WireError;
use crate::message::Message;

/// Size of the frame header (length + checksum).
pub const FRAME_HEADER_SIZE: usize = 8;

/// Default maximum payload size. Large enough for a full log transfer
/// segment, small enough to bound a malicious length field.
pub const MAX_FRAME_SIZE: u32 = 4 * 1024 * 1024;

/// A parsed frame header.
#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    length: u32,
    checksum: u32,
}

impl FrameHeader {
    fn parse(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() >= FRAME_HEADER_SIZE);
        Self {
            length: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            checksum: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}

// ============================================================================
// Encoder
// ============================================================================

/// Encodes messages into framed byte vectors.
#[derive(Debug, Clone)]
pub struct FrameEncoder {
    max_size: u32,
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameEncoder {
    /// Creates an encoder with the default size limit.
    pub fn new() -> Self {
        Self {
            max_size: MAX_FRAME_SIZE,
        }
    }

    /// Creates an encoder with a custom size limit.
    pub fn with_max_size(max_size: u32) -> Self {
        debug_assert!(max_size > 0, "max_size must be positive");
        Self { max_size }
    }

    /// Encodes one message into a framed byte vector.
    pub fn encode(&self, message: &Message) -> Result<Vec<u8>, WireError> {
        let payload =
            bincode::serialize(message).map_err(|e| WireError::Encode(e.to_string()))?;

        if payload.len() > self.max_size as usize {
            return Err(WireError::FrameTooLarge {
                size: payload.len() as u32,
                max: self.max_size,
            });
        }

        let checksum = crc32fast::hash(&payload);

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&checksum.to_be_bytes());
        frame.extend_from_slice(&payload);

        Ok(frame)
    }
}

// ============================================================================
// Decoder
// ============================================================================

/// Incrementally decodes framed bytes back into messages.
///
/// Feed data with [`push`](FrameDecoder::push), then drain complete messages
/// with [`next`](FrameDecoder::next) until it returns `Ok(None)`.
#[derive(Debug)]
pub struct FrameDecoder {
    max_size: u32,
    buffer: Vec<u8>,
    /// Header of the frame currently being assembled, if already parsed.
    pending: Option<FrameHeader>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Creates a decoder with the default size limit.
    pub fn new() -> Self {
        Self {
            max_size: MAX_FRAME_SIZE,
            buffer: Vec::with_capacity(4096),
            pending: None,
        }
    }

    /// Creates a decoder with a custom size limit.
    pub fn with_max_size(max_size: u32) -> Self {
        debug_assert!(max_size > 0, "max_size must be positive");
        Self {
            max_size,
            buffer: Vec::with_capacity(4096),
            pending: None,
        }
    }

    /// Appends raw bytes from the stream.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns the number of buffered, not-yet-consumed bytes.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Attempts to decode the next complete message.
    ///
    /// Returns `Ok(None)` when more data is needed. After a fatal error the
    /// stream is desynchronized and the decoder must be discarded along with
    /// its connection.
    pub fn next(&mut self) -> Result<Option<Message>, WireError> {
        if self.pending.is_none() {
            if self.buffer.len() < FRAME_HEADER_SIZE {
                return Ok(None);
            }

            let header = FrameHeader::parse(&self.buffer);

            if header.length > self.max_size {
                return Err(WireError::FrameTooLarge {
                    size: header.length,
                    max: self.max_size,
                });
            }
            if header.length == 0 {
                return Err(WireError::EmptyFrame);
            }

            self.pending = Some(header);
        }

        let header = self.pending.expect("pending header set above");
        let total = FRAME_HEADER_SIZE + header.length as usize;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let payload = &self.buffer[FRAME_HEADER_SIZE..total];

        let actual = crc32fast::hash(payload);
        if actual != header.checksum {
            return Err(WireError::ChecksumMismatch {
                expected: header.checksum,
                actual,
            });
        }

        let message: Message =
            bincode::deserialize(payload).map_err(|e| WireError::Decode(e.to_string()))?;

        self.buffer.drain(..total);
        self.pending = None;

        Ok(Some(message))
    }

    /// Discards all buffered data and any half-parsed frame.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.pending = None;
    }
}
