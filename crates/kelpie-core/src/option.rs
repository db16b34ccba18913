//! Option numbers and option-value codecs.
//!
//! Standard numbers follow RFC 7252; the 399x/400x block is the custom
//! range used for the handshake and ARQ extensions. The numeric values are
//! fixed for wire compatibility and must not be reassigned.

/// Option numbers understood by the endpoint.
pub mod number {
    /// Observe (carried through unchanged, no subscription logic).
    pub const OBSERVE: u16 = 6;
    /// URI-Path, repeated once per path segment.
    pub const URI_PATH: u16 = 11;
    /// Content-Format.
    pub const CONTENT_FORMAT: u16 = 12;
    /// URI-Query, repeated, `k=v` form.
    pub const URI_QUERY: u16 = 15;
    /// Block2: block descriptor for response payloads.
    pub const BLOCK2: u16 = 23;
    /// Block1: block descriptor for request payloads.
    pub const BLOCK1: u16 = 27;
    /// Proxy-URI: ultimate destination of a relayed request.
    pub const PROXY_URI: u16 = 35;
    /// Proxy-Scheme.
    pub const PROXY_SCHEME: u16 = 39;
    /// URI scheme marker (0 = coap, 1 = coaps) so the responder knows
    /// whether the payload is encrypted.
    pub const URI_SCHEME: u16 = 2209;
    /// Handshake message kind, see [`super::HandshakeType`].
    pub const HANDSHAKE_TYPE: u16 = 3995;
    /// Selective-repeat retransmit hint carried in block acknowledgements.
    pub const WINDOW_OFFSET: u16 = 3996;
    /// Disambiguates multiple secured sessions traversing one proxy.
    pub const PROXY_SECURITY_ID: u16 = 3997;
    /// Advertised selective-repeat window size.
    pub const SELECTIVE_REPEAT_WINDOW_SIZE: u16 = 3999;
    /// Server tells the client to restart the handshake.
    pub const SESSION_NOT_FOUND: u16 = 4001;
    /// Server tells the client its session is stale.
    pub const SESSION_EXPIRED: u16 = 4003;
}

/// Handshake message kinds carried in the Handshake-Type option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandshakeType {
    /// Initiator sends its ephemeral public key.
    ClientHello = 1,
    /// Responder replies with its ephemeral public key.
    PeerHello = 2,
    /// Optional signature confirmation round.
    ClientSignature = 3,
}

impl HandshakeType {
    /// Decode from an option uint value.
    #[must_use]
    pub fn from_uint(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::ClientHello),
            2 => Some(Self::PeerHello),
            3 => Some(Self::ClientSignature),
            _ => None,
        }
    }
}

/// Encode an unsigned option value as a minimal-length big-endian byte
/// string. Zero encodes as the empty string.
#[must_use]
pub fn encode_uint(v: u32) -> Vec<u8> {
    let bytes = v.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

/// Decode a big-endian unsigned option value. Values longer than four
/// bytes saturate on their low four bytes.
#[must_use]
pub fn decode_uint(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .rev()
        .take(4)
        .rev()
        .fold(0u32, |acc, b| (acc << 8) | u32::from(*b))
}
