//! The message model: header fields, token, options, payload, and the
//! runtime routing metadata that never touches the wire.

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::block::BlockOption;
use crate::option::{decode_uint, encode_uint, number, HandshakeType};
use crate::ACK_TIMEOUT;

/// The four message types from the two type bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Confirmable; retransmitted until acknowledged.
    Confirmable = 0,
    /// Non-confirmable; fire and forget.
    NonConfirmable = 1,
    /// Acknowledgement.
    Acknowledgement = 2,
    /// Reset.
    Reset = 3,
}

impl MessageType {
    /// Decode from the two type bits.
    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Self::Confirmable,
            1 => Self::NonConfirmable,
            2 => Self::Acknowledgement,
            _ => Self::Reset,
        }
    }
}

/// Message code: a 3-bit class and 5-bit detail packed into one byte.
///
/// Unknown codes survive a decode/encode round trip untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Code(pub u8);

impl Code {
    /// 0.00 Empty
    pub const EMPTY: Code = Code(0x00);
    /// 0.01 GET
    pub const GET: Code = Code(0x01);
    /// 0.02 POST
    pub const POST: Code = Code(0x02);
    /// 0.03 PUT
    pub const PUT: Code = Code(0x03);
    /// 0.04 DELETE
    pub const DELETE: Code = Code(0x04);
    /// 2.01 Created
    pub const CREATED: Code = Code(0x41);
    /// 2.04 Changed
    pub const CHANGED: Code = Code(0x44);
    /// 2.05 Content
    pub const CONTENT: Code = Code(0x45);
    /// 2.31 Continue
    pub const CONTINUE: Code = Code(0x5F);
    /// 4.00 Bad Request
    pub const BAD_REQUEST: Code = Code(0x80);
    /// 4.01 Unauthorized
    pub const UNAUTHORIZED: Code = Code(0x81);
    /// 4.02 Bad Option
    pub const BAD_OPTION: Code = Code(0x82);
    /// 4.04 Not Found
    pub const NOT_FOUND: Code = Code(0x84);
    /// 5.00 Internal Server Error
    pub const INTERNAL_SERVER_ERROR: Code = Code(0xA0);
    /// 5.05 Proxying Not Supported
    pub const PROXYING_NOT_SUPPORTED: Code = Code(0xA5);

    /// The 3-bit class.
    #[must_use]
    pub fn class(&self) -> u8 {
        self.0 >> 5
    }

    /// The 5-bit detail.
    #[must_use]
    pub fn detail(&self) -> u8 {
        self.0 & 0x1F
    }

    /// Whether this code is a request method.
    #[must_use]
    pub fn is_request(&self) -> bool {
        self.class() == 0 && self.detail() != 0
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

/// URI scheme of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scheme {
    /// Plaintext.
    #[default]
    Coap,
    /// End-to-end encrypted.
    Coaps,
}

/// A single option record: number plus raw value bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageOption {
    /// Option number.
    pub number: u16,
    /// Raw option value.
    pub value: Vec<u8>,
}

/// A protocol message.
///
/// Wire fields plus runtime metadata (`sender`, `recipient`, timers, the
/// peer's public key after decryption) that routing and retransmission
/// need but that are never serialized.
#[derive(Debug, Clone)]
pub struct Message {
    /// Protocol version; always 1 on the wire.
    pub version: u8,
    /// Message type.
    pub mtype: MessageType,
    /// Message code.
    pub code: Code,
    /// 16-bit message identifier; pairs acknowledgements with confirmables.
    pub message_id: u16,
    /// Exchange correlation token, 0–8 bytes.
    pub token: Vec<u8>,
    /// Options in insertion order; serialization sorts by number.
    pub options: Vec<MessageOption>,
    /// Payload bytes.
    pub payload: Vec<u8>,

    /// Address the message arrived from.
    pub sender: Option<SocketAddr>,
    /// Address the message is destined for.
    pub recipient: Option<SocketAddr>,
    /// Proxy the exchange traverses, if any.
    pub proxy_addr: Option<String>,
    /// Wait budget for the next acknowledgement read.
    pub timeout: Duration,
    /// Send attempts so far.
    pub attempts: u32,
    /// When the message was last written to a socket.
    pub last_sent: Option<Instant>,
    /// Peer public key pin; set after a successful decrypt, checked by the
    /// handshake when pre-populated by the application.
    pub peer_public_key: Option<[u8; 32]>,
}

impl Message {
    /// Create a message with a random message id and empty token.
    #[must_use]
    pub fn new(mtype: MessageType, code: Code) -> Self {
        Self::with_id(mtype, code, rand::random())
    }

    /// Create a message with an explicit message id.
    #[must_use]
    pub fn with_id(mtype: MessageType, code: Code, message_id: u16) -> Self {
        Self {
            version: crate::COAP_VERSION,
            mtype,
            code,
            message_id,
            token: Vec::new(),
            options: Vec::new(),
            payload: Vec::new(),
            sender: None,
            recipient: None,
            proxy_addr: None,
            timeout: ACK_TIMEOUT,
            attempts: 0,
            last_sent: None,
            peer_public_key: None,
        }
    }

    /// Assign a fresh random token of `len` bytes (capped at 8).
    pub fn generate_token(&mut self, len: usize) {
        self.token = (0..len.min(8)).map(|_| rand::random()).collect();
    }

    /// Token as lowercase hex, used as a correlation key.
    #[must_use]
    pub fn token_hex(&self) -> String {
        let mut s = String::with_capacity(self.token.len() * 2);
        for b in &self.token {
            s.push_str(&format!("{b:02x}"));
        }
        s
    }

    /// Append an option.
    pub fn add_option(&mut self, option_number: u16, value: Vec<u8>) {
        self.options.push(MessageOption {
            number: option_number,
            value,
        });
    }

    /// Append an unsigned-integer option.
    pub fn add_option_uint(&mut self, option_number: u16, v: u32) {
        self.add_option(option_number, encode_uint(v));
    }

    /// First option with the given number.
    #[must_use]
    pub fn option(&self, option_number: u16) -> Option<&MessageOption> {
        self.options.iter().find(|o| o.number == option_number)
    }

    /// First option with the given number, decoded as a uint.
    #[must_use]
    pub fn option_uint(&self, option_number: u16) -> Option<u32> {
        self.option(option_number).map(|o| decode_uint(&o.value))
    }

    /// All options with the given number, in insertion order.
    pub fn options_for(&self, option_number: u16) -> impl Iterator<Item = &MessageOption> {
        self.options
            .iter()
            .filter(move |o| o.number == option_number)
    }

    /// Remove every option with the given number.
    pub fn remove_options(&mut self, option_number: u16) {
        self.options.retain(|o| o.number != option_number);
    }

    /// Replace the URI path, one URI-Path option per segment.
    pub fn set_uri_path(&mut self, path: &str) {
        self.remove_options(number::URI_PATH);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.add_option(number::URI_PATH, segment.as_bytes().to_vec());
        }
    }

    /// Reassembled URI path with a leading slash.
    #[must_use]
    pub fn uri_path(&self) -> String {
        let mut path = String::new();
        for o in self.options_for(number::URI_PATH) {
            path.push('/');
            path.push_str(&String::from_utf8_lossy(&o.value));
        }
        if path.is_empty() {
            path.push('/');
        }
        path
    }

    /// Append a `k=v` URI-Query option.
    pub fn add_uri_query(&mut self, key: &str, value: &str) {
        self.add_option(number::URI_QUERY, format!("{key}={value}").into_bytes());
    }

    /// Decoded URI queries in insertion order.
    #[must_use]
    pub fn uri_queries(&self) -> Vec<(String, String)> {
        self.options_for(number::URI_QUERY)
            .filter_map(|o| {
                let s = String::from_utf8_lossy(&o.value);
                let (k, v) = s.split_once('=')?;
                Some((k.to_string(), v.to_string()))
            })
            .collect()
    }

    /// The exchange scheme, read from the URI-Scheme option.
    #[must_use]
    pub fn scheme(&self) -> Scheme {
        match self.option_uint(number::URI_SCHEME) {
            Some(1) => Scheme::Coaps,
            _ => Scheme::Coap,
        }
    }

    /// Set the exchange scheme on the wire.
    pub fn set_scheme(&mut self, scheme: Scheme) {
        self.remove_options(number::URI_SCHEME);
        if scheme == Scheme::Coaps {
            self.add_option_uint(number::URI_SCHEME, 1);
        }
    }

    /// Decoded Block1 option, if present.
    #[must_use]
    pub fn block1(&self) -> Option<BlockOption> {
        self.option(number::BLOCK1)
            .map(|o| BlockOption::decode(&o.value))
    }

    /// Decoded Block2 option, if present.
    #[must_use]
    pub fn block2(&self) -> Option<BlockOption> {
        self.option(number::BLOCK2)
            .map(|o| BlockOption::decode(&o.value))
    }

    /// Replace the Block1 option.
    pub fn set_block1(&mut self, block: BlockOption) {
        self.remove_options(number::BLOCK1);
        self.add_option(number::BLOCK1, block.encode());
    }

    /// Replace the Block2 option.
    pub fn set_block2(&mut self, block: BlockOption) {
        self.remove_options(number::BLOCK2);
        self.add_option(number::BLOCK2, block.encode());
    }

    /// Proxy-URI option value, if present.
    #[must_use]
    pub fn proxy_uri(&self) -> Option<String> {
        self.option(number::PROXY_URI)
            .map(|o| String::from_utf8_lossy(&o.value).to_string())
    }

    /// Decoded Handshake-Type option, if present.
    #[must_use]
    pub fn handshake_type(&self) -> Option<HandshakeType> {
        self.option_uint(number::HANDSHAKE_TYPE)
            .and_then(HandshakeType::from_uint)
    }

    /// Copy every option with the given number from another message.
    pub fn clone_options_from(&mut self, other: &Message, option_number: u16) {
        for o in other.options_for(option_number) {
            self.options.push(o.clone());
        }
    }

    /// The request method, when the code is a request.
    #[must_use]
    pub fn method(&self) -> Option<Code> {
        self.code.is_request().then_some(self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_path_roundtrip() {
        let mut msg = Message::new(MessageType::Confirmable, Code::GET);
        msg.set_uri_path("/info/device");
        assert_eq!(msg.uri_path(), "/info/device");
        assert_eq!(msg.options_for(number::URI_PATH).count(), 2);
    }

    #[test]
    fn test_uri_path_empty() {
        let msg = Message::new(MessageType::Confirmable, Code::GET);
        assert_eq!(msg.uri_path(), "/");
    }

    #[test]
    fn test_uri_queries() {
        let mut msg = Message::new(MessageType::Confirmable, Code::GET);
        msg.add_uri_query("a", "1");
        msg.add_uri_query("b", "two");
        assert_eq!(
            msg.uri_queries(),
            vec![("a".into(), "1".into()), ("b".into(), "two".into())]
        );
    }

    #[test]
    fn test_scheme_option() {
        let mut msg = Message::new(MessageType::Confirmable, Code::GET);
        assert_eq!(msg.scheme(), Scheme::Coap);
        msg.set_scheme(Scheme::Coaps);
        assert_eq!(msg.scheme(), Scheme::Coaps);
        msg.set_scheme(Scheme::Coap);
        assert_eq!(msg.scheme(), Scheme::Coap);
        assert!(msg.option(number::URI_SCHEME).is_none());
    }

    #[test]
    fn test_block_options() {
        let mut msg = Message::new(MessageType::Confirmable, Code::POST);
        msg.set_block1(BlockOption::new(5, true, 1024));
        let block = msg.block1().unwrap();
        assert_eq!(block.num, 5);
        assert!(block.more);
        assert_eq!(block.size(), 1024);
        assert!(msg.block2().is_none());
    }

    #[test]
    fn test_token_hex() {
        let mut msg = Message::new(MessageType::Confirmable, Code::GET);
        msg.token = vec![0xDE, 0xAD, 0x01];
        assert_eq!(msg.token_hex(), "dead01");
    }

    #[test]
    fn test_generate_token_capped() {
        let mut msg = Message::new(MessageType::Confirmable, Code::GET);
        msg.generate_token(32);
        assert_eq!(msg.token.len(), 8);
    }

    #[test]
    fn test_code_display() {
        assert_eq!(Code::CONTENT.to_string(), "2.05");
        assert_eq!(Code::CONTINUE.to_string(), "2.31");
        assert_eq!(Code::NOT_FOUND.to_string(), "4.04");
        assert_eq!(Code::INTERNAL_SERVER_ERROR.to_string(), "5.00");
    }

    #[test]
    fn test_code_is_request() {
        assert!(Code::GET.is_request());
        assert!(Code::DELETE.is_request());
        assert!(!Code::EMPTY.is_request());
        assert!(!Code::CONTENT.is_request());
    }
}
