//! Token-keyed rendezvous for server-initiated requests.
//!
//! When the endpoint itself issues a request from its listening socket,
//! the response arrives through the normal receive loop. The loop finds
//! the waiter registered under `token_hex || remote_address` and routes
//! the message there instead of running a resource handler.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::time::Duration;

use kelpie_core::Message;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// One-shot delivery slots keyed by token and remote address.
pub struct BackwardChannel {
    slots: DashMap<String, oneshot::Sender<Message>>,
}

impl BackwardChannel {
    /// Create an empty channel map.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    /// The rendezvous key for a message that just arrived.
    #[must_use]
    pub fn key_for(msg: &Message) -> Option<String> {
        msg.sender.map(|addr| Self::key(&msg.token_hex(), addr))
    }

    /// The rendezvous key for an outgoing request.
    #[must_use]
    pub fn key(token_hex: &str, remote: SocketAddr) -> String {
        format!("{token_hex}{remote}")
    }

    /// Whether a waiter is registered for this message.
    #[must_use]
    pub fn has(&self, msg: &Message) -> bool {
        Self::key_for(msg).is_some_and(|k| self.slots.contains_key(&k))
    }

    /// Non-blocking deposit; without a registered waiter the message is
    /// dropped.
    pub fn write(&self, msg: Message) {
        let Some(key) = Self::key_for(&msg) else {
            return;
        };
        if let Some((_, tx)) = self.slots.remove(&key) {
            let _ = tx.send(msg);
        }
    }

    /// Register a slot now, before the request leaves the socket, so
    /// the response cannot slip past an unregistered waiter.
    pub fn subscribe(&self, key: &str) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        self.slots.insert(key.to_string(), tx);
        rx
    }

    /// Drop a slot without consuming it.
    pub fn unsubscribe(&self, key: &str) {
        self.slots.remove(key);
    }

    /// Wait for a subscribed slot's write. The slot is removed on both
    /// outcomes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Timeout` when nothing arrives in time.
    pub async fn wait(
        &self,
        key: &str,
        rx: oneshot::Receiver<Message>,
        timeout: Duration,
    ) -> Result<Message> {
        let outcome = tokio::time::timeout(timeout, rx).await;
        self.slots.remove(key);
        match outcome {
            Ok(Ok(msg)) => Ok(msg),
            // Sender dropped or timer elapsed
            _ => Err(Error::Timeout),
        }
    }

    /// Register a slot and wait for its write.
    ///
    /// # Errors
    ///
    /// Returns `Error::Timeout` when nothing arrives in time.
    pub async fn read(&self, key: &str, timeout: Duration) -> Result<Message> {
        let rx = self.subscribe(key);
        self.wait(key, rx, timeout).await
    }
}

impl Default for BackwardChannel {
    fn default() -> Self {
        Self::new()
    }
}
