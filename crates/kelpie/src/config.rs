//! Endpoint configuration.

use std::time::Duration;

use crate::{
    DEFAULT_MAX_PARALLEL, DEFAULT_WINDOW_SIZE, MAX_SEND_ATTEMPTS, MAX_WINDOW_SIZE,
    MIN_WINDOW_SIZE, PROXY_NOTE_TTL, SESSION_TTL, SUM_TIME_ATTEMPTS,
};
use kelpie_core::{ACK_TIMEOUT, MTU};

/// Tunables shared by endpoints and clients.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Blocks kept in flight by a block-wise sender.
    pub window_size: usize,
    /// Total send attempts per confirmable message or block.
    pub max_send_attempts: u32,
    /// How long to wait for an acknowledgement before retransmitting.
    pub ack_timeout: Duration,
    /// Idle lifetime of secured sessions.
    pub session_ttl: Duration,
    /// Idle lifetime of per-exchange reassembly state.
    pub state_ttl: Duration,
    /// Lifetime of proxy forwarding notes.
    pub proxy_ttl: Duration,
    /// Cap on concurrently dispatched inbound messages.
    pub max_parallel: usize,
    /// Largest datagram accepted from the wire.
    pub mtu: usize,
    /// Long-term key; when set, handshakes use a static scalar derived
    /// from it instead of a fresh ephemeral key.
    pub private_key: Option<Vec<u8>>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            max_send_attempts: MAX_SEND_ATTEMPTS,
            ack_timeout: ACK_TIMEOUT,
            session_ttl: SESSION_TTL,
            state_ttl: SUM_TIME_ATTEMPTS,
            proxy_ttl: PROXY_NOTE_TTL,
            max_parallel: DEFAULT_MAX_PARALLEL,
            mtu: MTU,
            private_key: None,
        }
    }
}

impl EndpointConfig {
    /// Set the long-term private key.
    #[must_use]
    pub fn with_private_key(mut self, key: Vec<u8>) -> Self {
        self.private_key = Some(key);
        self
    }

    /// Set the in-flight window, clamped to the supported range.
    #[must_use]
    pub fn with_window_size(mut self, window: usize) -> Self {
        self.window_size = window.clamp(MIN_WINDOW_SIZE, MAX_WINDOW_SIZE);
        self
    }

    /// Set the acknowledgement wait.
    #[must_use]
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Set the dispatch concurrency cap.
    #[must_use]
    pub fn with_max_parallel(mut self, permits: usize) -> Self {
        self.max_parallel = permits.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EndpointConfig::default();
        assert_eq!(config.window_size, DEFAULT_WINDOW_SIZE);
        assert_eq!(config.max_send_attempts, MAX_SEND_ATTEMPTS);
        assert!(config.private_key.is_none());
    }

    #[test]
    fn test_window_clamped() {
        assert_eq!(
            EndpointConfig::default().with_window_size(1).window_size,
            MIN_WINDOW_SIZE
        );
        assert_eq!(
            EndpointConfig::default().with_window_size(10_000).window_size,
            MAX_WINDOW_SIZE
        );
    }
}
