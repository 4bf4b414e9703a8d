//! Wire-level error taxonomy.

use std::io;

/// Errors that can occur while encoding, decoding, or framing messages.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Frame exceeds the configured maximum size.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    /// Zero-length frame; a valid message never encodes to nothing.
    #[error("empty frame")]
    EmptyFrame,

    /// Payload checksum does not match the frame header.
    #[error("checksum mismatch: header {expected:#010x}, payload {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Message failed to serialize.
    #[error("encode failed: {0}")]
    Encode(String),

    /// Frame contents failed to deserialize into a message.
    #[error("decode failed: {0}")]
    Decode(String),
}

impl WireError {
    /// Returns true if the connection carrying this stream can no longer be
    /// trusted and should be closed.
    ///
    /// A corrupt or oversized frame desynchronizes the stream; there is no
    /// way to find the next frame boundary, so the channel must be dropped.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WireError::FrameTooLarge { .. }
                | WireError::ChecksumMismatch { .. }
                | WireError::Decode(_)
                | WireError::EmptyFrame
        )
    }
}
