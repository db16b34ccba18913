//! Binary serialization and deserialization.
//!
//! Emission is byte-exact RFC 7252 §3 framing: options are written in
//! ascending option-number order with delta encoding, extended nibbles 13
//! and 14 spill into one or two extra bytes, and nibble 15 is reserved.

use crate::error::CodecError;
use crate::message::{Code, Message, MessageOption, MessageType};
use crate::{COAP_VERSION, HEADER_SIZE};

const PAYLOAD_MARKER: u8 = 0xFF;

/// Nibble value plus its extension bytes.
enum Ext {
    None(u8),
    One(u8),
    Two(u16),
}

fn split_ext(v: u32) -> Result<Ext, CodecError> {
    match v {
        0..=12 => Ok(Ext::None(v as u8)),
        13..=268 => Ok(Ext::One((v - 13) as u8)),
        269..=65804 => Ok(Ext::Two((v - 269) as u16)),
        _ => Err(CodecError::OptionTooLong(v as usize)),
    }
}

impl Ext {
    fn nibble(&self) -> u8 {
        match self {
            Ext::None(n) => *n,
            Ext::One(_) => 13,
            Ext::Two(_) => 14,
        }
    }

    fn write(&self, buf: &mut Vec<u8>) {
        match self {
            Ext::None(_) => {}
            Ext::One(b) => buf.push(*b),
            Ext::Two(v) => buf.extend_from_slice(&v.to_be_bytes()),
        }
    }
}

/// Serialize a message to wire bytes.
///
/// # Errors
///
/// Returns `CodecError::TokenTooLong` for tokens over 8 bytes and
/// `CodecError::OptionTooLong` for option values beyond the encodable
/// range.
pub fn serialize(msg: &Message) -> Result<Vec<u8>, CodecError> {
    if msg.token.len() > 8 {
        return Err(CodecError::TokenTooLong(msg.token.len()));
    }

    let mut buf = Vec::with_capacity(HEADER_SIZE + msg.token.len() + msg.payload.len() + 32);
    buf.push((COAP_VERSION << 6) | ((msg.mtype as u8) << 4) | (msg.token.len() as u8));
    buf.push(msg.code.0);
    buf.extend_from_slice(&msg.message_id.to_be_bytes());
    buf.extend_from_slice(&msg.token);

    // Stable sort keeps repeated options (URI-Path segments) in order.
    let mut options: Vec<&MessageOption> = msg.options.iter().collect();
    options.sort_by_key(|o| o.number);

    let mut previous = 0u32;
    for option in options {
        let delta = split_ext(u32::from(option.number) - previous)?;
        let length = split_ext(option.value.len() as u32)?;
        previous = u32::from(option.number);

        buf.push((delta.nibble() << 4) | length.nibble());
        delta.write(&mut buf);
        length.write(&mut buf);
        buf.extend_from_slice(&option.value);
    }

    if !msg.payload.is_empty() {
        buf.push(PAYLOAD_MARKER);
        buf.extend_from_slice(&msg.payload);
    }

    Ok(buf)
}

fn read_ext(nibble: u8, data: &[u8], pos: &mut usize) -> Result<u32, CodecError> {
    match nibble {
        0..=12 => Ok(u32::from(nibble)),
        13 => {
            let b = *data.get(*pos).ok_or(CodecError::Truncated {
                expected: *pos + 1,
                actual: data.len(),
            })?;
            *pos += 1;
            Ok(u32::from(b) + 13)
        }
        14 => {
            if data.len() < *pos + 2 {
                return Err(CodecError::Truncated {
                    expected: *pos + 2,
                    actual: data.len(),
                });
            }
            let v = u16::from_be_bytes([data[*pos], data[*pos + 1]]);
            *pos += 2;
            Ok(u32::from(v) + 269)
        }
        _ => Err(CodecError::ReservedOptionNibble),
    }
}

/// Deserialize a message from wire bytes.
///
/// # Errors
///
/// Returns `CodecError` on truncated input, version ≠ 1, token length
/// over 8 bytes, or undecodable option structure.
pub fn deserialize(data: &[u8]) -> Result<Message, CodecError> {
    if data.len() < HEADER_SIZE {
        return Err(CodecError::Truncated {
            expected: HEADER_SIZE,
            actual: data.len(),
        });
    }

    let version = data[0] >> 6;
    if version != COAP_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let mtype = MessageType::from_bits(data[0] >> 4);
    let token_len = usize::from(data[0] & 0x0F);
    if token_len > 8 {
        return Err(CodecError::TokenTooLong(token_len));
    }

    let code = Code(data[1]);
    let message_id = u16::from_be_bytes([data[2], data[3]]);

    if data.len() < HEADER_SIZE + token_len {
        return Err(CodecError::Truncated {
            expected: HEADER_SIZE + token_len,
            actual: data.len(),
        });
    }
    let token = data[HEADER_SIZE..HEADER_SIZE + token_len].to_vec();

    let mut msg = Message::with_id(mtype, code, message_id);
    msg.token = token;

    let mut pos = HEADER_SIZE + token_len;
    let mut option_number = 0u32;
    while pos < data.len() {
        let byte = data[pos];
        pos += 1;
        if byte == PAYLOAD_MARKER {
            if pos == data.len() {
                return Err(CodecError::EmptyPayload);
            }
            msg.payload = data[pos..].to_vec();
            break;
        }

        let delta = read_ext(byte >> 4, data, &mut pos)?;
        let length = read_ext(byte & 0x0F, data, &mut pos)? as usize;

        option_number += delta;
        if option_number > u32::from(u16::MAX) {
            return Err(CodecError::OptionNumberOverflow);
        }

        if data.len() < pos + length {
            return Err(CodecError::Truncated {
                expected: pos + length,
                actual: data.len(),
            });
        }
        msg.options.push(MessageOption {
            number: option_number as u16,
            value: data[pos..pos + length].to_vec(),
        });
        pos += length;
    }

    Ok(msg)
}
