//! Error types for the Kelpie message codec.

use thiserror::Error;

/// Errors produced while decoding or encoding a message.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Input ended before the structure it promised.
    #[error("message too short: expected at least {expected} bytes, got {actual}")]
    Truncated {
        /// Minimum size the structure requires
        expected: usize,
        /// Size actually available
        actual: usize,
    },

    /// Version bits are not the supported protocol version.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Token length nibble exceeds the 8-byte maximum.
    #[error("token length {0} exceeds 8 bytes")]
    TokenTooLong(usize),

    /// Option delta or length nibble holds the reserved value 15.
    #[error("reserved option nibble")]
    ReservedOptionNibble,

    /// Accumulated option number does not fit a 16-bit option space.
    #[error("option number overflow")]
    OptionNumberOverflow,

    /// An option value is too large to encode.
    #[error("option value of {0} bytes cannot be encoded")]
    OptionTooLong(usize),

    /// The payload marker was present but no payload followed it.
    #[error("payload marker with empty payload")]
    EmptyPayload,
}

/// Errors produced by the stream-transport length-prefix framing.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Buffer ends before the frame it promises.
    #[error("short buffer: need {expected} bytes, have {actual}")]
    ShortBuffer {
        /// Bytes the frame requires
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// The length prefix itself is malformed.
    #[error("invalid frame length prefix")]
    InvalidLength,
}
