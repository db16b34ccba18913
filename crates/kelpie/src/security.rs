//! The security layer: outbound encryption, inbound decryption, and the
//! hello exchange that establishes a secured session.
//!
//! Outbound, a `coap` message passes untouched; a `coaps` message has
//! its payload encrypted in place with the session's send half, the
//! Content-Format marking it opaque. Inbound, hello messages are served
//! here and never reach a handler; `coaps` traffic is decrypted or
//! answered with `Unauthorized` carrying the reason the peer must
//! restart its handshake.

use tracing::{debug, warn};

use kelpie_core::option::number;
use kelpie_core::{
    Code, HandshakeType, Message, MessageType, Scheme, MEDIA_TYPE_OCTET_STREAM,
};
use kelpie_crypto::SecuredSession;

use crate::error::{Error, Result};
use crate::exchange::PeerLink;

/// Session-key proxy component for an outbound message.
fn outbound_proxy_component(link: &PeerLink, msg: &Message, local: &str) -> String {
    if let Some(proxy) = &msg.proxy_addr {
        let id = match msg.option_uint(number::PROXY_SECURITY_ID) {
            Some(id) => id,
            None => link.stores.proxy_ids.get_or_assign(proxy, local),
        };
        return format!("{proxy}{id}");
    }
    match (msg.option_uint(number::PROXY_SECURITY_ID), msg.recipient) {
        (Some(id), Some(addr)) => format!("{addr}{id}"),
        _ => String::new(),
    }
}

/// Session-key proxy component for an inbound message. A known proxy
/// address (the client side of a proxied exchange) takes precedence;
/// otherwise the message's own proxy-security marker is used.
fn inbound_proxy_component(link: &PeerLink, msg: &Message, proxy_addr: Option<&str>, local: &str) -> String {
    if let Some(proxy) = proxy_addr {
        return match link.stores.proxy_ids.get(proxy, local) {
            Some(id) => format!("{proxy}{id}"),
            None => proxy.to_string(),
        };
    }
    match (msg.option_uint(number::PROXY_SECURITY_ID), msg.sender) {
        (Some(id), Some(sender)) => format!("{sender}{id}"),
        _ => String::new(),
    }
}

/// Encrypt an outbound message in place when its scheme asks for it.
pub(crate) fn output(link: &PeerLink, msg: &mut Message, addr: std::net::SocketAddr) -> Result<()> {
    if msg.scheme() != Scheme::Coaps {
        return Ok(());
    }
    let local = link.conn.local_addr()?.to_string();
    let proxy = outbound_proxy_component(link, msg, &local);
    let receiver = addr.to_string();

    let mut session = link
        .stores
        .sessions
        .get(&local, &receiver, &proxy)
        .ok_or(Error::SessionNotFound)?;
    let Some(aead) = session.aead() else {
        return Err(Error::HandshakeFailed("session has no keys".into()));
    };

    if !msg.payload.is_empty() {
        msg.payload = aead.seal(msg.message_id, &msg.token, &msg.payload)?;
        msg.remove_options(number::CONTENT_FORMAT);
        msg.add_option_uint(number::CONTENT_FORMAT, MEDIA_TYPE_OCTET_STREAM);
    }

    session.touch();
    link.stores.sessions.set(&local, &receiver, &proxy, session);
    Ok(())
}

/// Run the inbound security layer.
///
/// Returns `Ok(true)` when the message should continue to normal
/// processing, `Ok(false)` when it was consumed here (hello service),
/// and an error when the exchange must stop.
pub(crate) async fn input(
    link: &PeerLink,
    msg: &mut Message,
    proxy_addr: Option<&str>,
) -> Result<bool> {
    let local = link.conn.local_addr()?.to_string();
    let proxy = inbound_proxy_component(link, msg, proxy_addr, &local);

    match msg.handshake_type() {
        Some(HandshakeType::ClientHello) => {
            if let Err(e) = serve_client_hello(link, msg, &local, &proxy).await {
                warn!(error = %e, "hello service failed");
            }
            return Ok(false);
        }
        Some(HandshakeType::ClientSignature) => {
            // Signature confirmation round: nothing to verify beyond the
            // comparison both sides already ran; keep the session warm.
            touch_session(link, msg, &local, &proxy);
            return Ok(false);
        }
        _ => {}
    }

    let sender = msg.sender.ok_or(Error::SocketClosed)?.to_string();

    if msg.scheme() == Scheme::Coaps {
        let session = link.stores.sessions.get(&local, &sender, &proxy);
        let Some(mut session) = session.filter(|s| s.aead().is_some()) else {
            reply_unauthorized(link, msg, number::SESSION_NOT_FOUND).await;
            return Err(Error::SessionNotFound);
        };

        if !msg.payload.is_empty() {
            let aead = session.aead().expect("session filtered as established");
            match aead.open(msg.message_id, &msg.token, &msg.payload) {
                Ok(plaintext) => msg.payload = plaintext,
                Err(_) => {
                    reply_unauthorized(link, msg, number::SESSION_EXPIRED).await;
                    return Err(Error::SessionExpired);
                }
            }
        }

        msg.peer_public_key = session.peer_public_key;
        session.touch();
        link.stores.sessions.set(&local, &sender, &proxy, session);
    }

    // Peer-reported session failures reset our half
    if msg.code == Code::UNAUTHORIZED {
        if msg.option(number::SESSION_NOT_FOUND).is_some() {
            link.stores.sessions.delete(&local, &sender, &proxy);
            return Err(Error::SessionNotFound);
        }
        if msg.option(number::SESSION_EXPIRED).is_some() {
            link.stores.sessions.delete(&local, &sender, &proxy);
            return Err(Error::SessionExpired);
        }
    }

    Ok(true)
}

/// Make sure an established session exists for a `coaps` request,
/// performing the hello exchange when necessary.
pub(crate) async fn ensure_session(link: &PeerLink, msg: &mut Message) -> Result<()> {
    let addr = link.remote()?;
    let local = link.conn.local_addr()?.to_string();

    // Through a proxy, sessions are keyed by the proxy plus a random
    // per-(proxy, local) ID that rides along as an option.
    let proxy = if let Some(proxy_addr) = msg.proxy_addr.clone() {
        let id = link.stores.proxy_ids.get_or_assign(&proxy_addr, &local);
        if msg.option_uint(number::PROXY_SECURITY_ID) != Some(id) {
            msg.remove_options(number::PROXY_SECURITY_ID);
            msg.add_option_uint(number::PROXY_SECURITY_ID, id);
        }
        format!("{proxy_addr}{id}")
    } else {
        String::new()
    };
    let receiver = addr.to_string();

    let mut session = link
        .stores
        .sessions
        .get(&local, &receiver, &proxy)
        .unwrap_or_else(|| SecuredSession::new(link.stores.config.private_key.as_deref()));
    if session.established() {
        session.touch();
        link.stores.sessions.set(&local, &receiver, &proxy, session);
        return Ok(());
    }

    debug!(peer = %addr, "starting handshake");
    let mut hello = client_hello(msg, &session);
    let response = link
        .send_con(&mut hello)
        .await
        .map_err(|e| Error::HandshakeFailed(format!("hello exchange: {e}")))?;

    let peer_key: [u8; 32] = match response.handshake_type() {
        Some(HandshakeType::PeerHello) => response
            .payload
            .as_slice()
            .try_into()
            .map_err(|_| Error::HandshakeFailed("peer hello key length".into()))?,
        _ => return Err(Error::HandshakeFailed("no peer hello".into())),
    };

    // Application pin: a pre-populated peer key must match
    if let Some(expected) = msg.peer_public_key {
        if expected != peer_key {
            return Err(Error::KeysDoNotMatch);
        }
    }
    msg.peer_public_key = Some(peer_key);
    session.peer_public_key = Some(peer_key);

    let signature = session.signature()?;
    session
        .verify(&signature)
        .map_err(|e| Error::HandshakeFailed(e.to_string()))?;
    link.stores.sessions.set(&local, &receiver, &proxy, session);
    debug!(peer = %addr, "handshake complete");
    Ok(())
}

/// Respond to a peer's hello: remember its key, send ours back, install
/// the mirrored key order.
async fn serve_client_hello(
    link: &PeerLink,
    msg: &Message,
    local: &str,
    proxy: &str,
) -> Result<()> {
    let peer_key: [u8; 32] = msg
        .payload
        .as_slice()
        .try_into()
        .map_err(|_| Error::HandshakeFailed("client hello key length".into()))?;
    let sender = msg.sender.ok_or(Error::SocketClosed)?;

    let mut session = link
        .stores
        .sessions
        .get(local, &sender.to_string(), proxy)
        .unwrap_or_else(|| SecuredSession::new(link.stores.config.private_key.as_deref()));
    session.peer_public_key = Some(peer_key);

    let mut reply = Message::with_id(MessageType::Acknowledgement, Code::CONTENT, msg.message_id);
    reply.token = msg.token.clone();
    reply.add_option_uint(number::HANDSHAKE_TYPE, HandshakeType::PeerHello as u32);
    reply.payload = session.public_key().to_vec();
    link.send_plain_to(&reply, sender).await?;

    let signature = session.signature()?;
    session
        .peer_verify(&signature)
        .map_err(|e| Error::HandshakeFailed(e.to_string()))?;
    link.stores
        .sessions
        .set(local, &sender.to_string(), proxy, session);
    debug!(peer = %sender, "handshake served");
    Ok(())
}

fn touch_session(link: &PeerLink, msg: &Message, local: &str, proxy: &str) {
    let Some(sender) = msg.sender else { return };
    if let Some(mut session) = link.stores.sessions.get(local, &sender.to_string(), proxy) {
        session.touch();
        link.stores
            .sessions
            .set(local, &sender.to_string(), proxy, session);
    }
}

/// Tell the peer its secured traffic cannot be processed and why.
async fn reply_unauthorized(link: &PeerLink, msg: &Message, reason_option: u16) {
    let Some(sender) = msg.sender else { return };
    let mut reply =
        Message::with_id(MessageType::Acknowledgement, Code::UNAUTHORIZED, msg.message_id);
    reply.token = msg.token.clone();
    reply.add_option_uint(reason_option, 1);
    if let Err(e) = link.send_plain_to(&reply, sender).await {
        warn!(error = %e, "unauthorized reply failed");
    }
}

/// Build the hello that opens a handshake. It travels as plain `coap`
/// with a fresh token; proxy routing options ride along so it reaches
/// the same terminating peer as the request it secures.
fn client_hello(orig: &Message, session: &SecuredSession) -> Message {
    let mut hello = Message::new(MessageType::Confirmable, Code::POST);
    hello.add_option_uint(number::HANDSHAKE_TYPE, HandshakeType::ClientHello as u32);
    hello.payload = session.public_key().to_vec();
    hello.generate_token(6);
    hello.clone_options_from(orig, number::PROXY_URI);
    hello.clone_options_from(orig, number::PROXY_SECURITY_ID);
    hello.proxy_addr = orig.proxy_addr.clone();
    hello.recipient = orig.recipient;
    hello
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_hello_shape() {
        let mut orig = Message::new(MessageType::Confirmable, Code::GET);
        orig.set_scheme(Scheme::Coaps);
        orig.add_option(number::PROXY_URI, b"coap://device/info".to_vec());
        let session = SecuredSession::new(None);

        let hello = client_hello(&orig, &session);
        assert_eq!(hello.mtype, MessageType::Confirmable);
        assert_eq!(hello.code, Code::POST);
        assert_eq!(hello.handshake_type(), Some(HandshakeType::ClientHello));
        assert_eq!(hello.payload, session.public_key().to_vec());
        assert_eq!(hello.token.len(), 6);
        // The hello itself is plaintext
        assert_eq!(hello.scheme(), Scheme::Coap);
        // Proxy routing rides along
        assert!(hello.proxy_uri().is_some());
    }
}
