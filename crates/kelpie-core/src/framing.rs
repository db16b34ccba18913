//! Length-prefix framing for stream transports.
//!
//! Each message travels as a variable-length integer giving the message
//! size, then the message bytes. The integer reuses the option-nibble
//! extension scheme: values 0–12 fit the first byte; 13 spills one extra
//! byte holding `L − 13`; 14 spills two bytes holding `L − 269`
//! big-endian; 15 spills four bytes holding `L − 65805` big-endian.

use crate::error::FrameError;

const EXT_ONE: u8 = 13;
const EXT_TWO: u8 = 14;
const EXT_FOUR: u8 = 15;

const EXT_ONE_BASE: u64 = 13;
const EXT_TWO_BASE: u64 = 269;
const EXT_FOUR_BASE: u64 = 65805;

/// Encode a frame length prefix.
#[must_use]
pub fn encode_len(len: usize) -> Vec<u8> {
    let len = len as u64;
    if len < EXT_ONE_BASE {
        vec![len as u8]
    } else if len < EXT_TWO_BASE {
        vec![EXT_ONE, (len - EXT_ONE_BASE) as u8]
    } else if len < EXT_FOUR_BASE {
        let v = ((len - EXT_TWO_BASE) as u16).to_be_bytes();
        vec![EXT_TWO, v[0], v[1]]
    } else {
        let v = ((len - EXT_FOUR_BASE) as u32).to_be_bytes();
        vec![EXT_FOUR, v[0], v[1], v[2], v[3]]
    }
}

/// Number of prefix bytes a frame starting with `first` occupies.
#[must_use]
pub fn prefix_size(first: u8) -> usize {
    match first {
        EXT_ONE => 2,
        EXT_TWO => 3,
        EXT_FOUR => 5,
        _ => 1,
    }
}

/// Decode a frame length prefix, returning `(length, prefix bytes)`.
///
/// # Errors
///
/// Returns `FrameError::ShortBuffer` when the buffer ends inside the
/// prefix.
pub fn decode_len(buf: &[u8]) -> Result<(usize, usize), FrameError> {
    let first = *buf.first().ok_or(FrameError::ShortBuffer {
        expected: 1,
        actual: 0,
    })?;
    let needed = prefix_size(first);
    if buf.len() < needed {
        return Err(FrameError::ShortBuffer {
            expected: needed,
            actual: buf.len(),
        });
    }
    let len = match first {
        EXT_ONE => u64::from(buf[1]) + EXT_ONE_BASE,
        EXT_TWO => u64::from(u16::from_be_bytes([buf[1], buf[2]])) + EXT_TWO_BASE,
        EXT_FOUR => {
            u64::from(u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]])) + EXT_FOUR_BASE
        }
        n => u64::from(n),
    };
    Ok((len as usize, needed))
}

/// Wrap message bytes in a frame.
#[must_use]
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = encode_len(payload.len());
    buf.extend_from_slice(payload);
    buf
}

/// Split one frame off the front of a buffer, returning the message bytes
/// and the total frame size consumed.
///
/// # Errors
///
/// Returns `FrameError::ShortBuffer` when the buffer holds less than one
/// whole frame.
pub fn decode_frame(buf: &[u8]) -> Result<(&[u8], usize), FrameError> {
    let (len, header) = decode_len(buf)?;
    let total = header + len;
    if buf.len() < total {
        return Err(FrameError::ShortBuffer {
            expected: total,
            actual: buf.len(),
        });
    }
    Ok((&buf[header..total], total))
}
