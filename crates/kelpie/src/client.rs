//! The URI client: one dialed socket per request, reassembled response
//! back.

use std::net::SocketAddr;
use std::sync::Arc;

use kelpie_core::{Code, Message, MessageType, Scheme};
use kelpie_transport::{Link, TcpLink, UdpLink};

use crate::config::EndpointConfig;
use crate::error::{Error, Result};
use crate::exchange::{is_ping_ack, PeerLink};
use crate::store::Stores;

/// A finished request: reassembled body plus response code.
#[derive(Debug, Clone)]
pub struct Response {
    /// Reassembled response payload.
    pub body: Vec<u8>,
    /// Response code.
    pub code: Code,
    /// The peer's public key when the exchange was secured.
    pub peer_public_key: Option<[u8; 32]>,
}

/// A synchronous request client. Sessions persist across requests, so a
/// `coaps` handshake is paid once per peer.
pub struct Client {
    stores: Arc<Stores>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    /// A client with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(EndpointConfig::default())
    }

    /// A client with explicit configuration (long-term key, timeouts).
    #[must_use]
    pub fn with_config(config: EndpointConfig) -> Self {
        Self {
            stores: Stores::new(config),
        }
    }

    /// GET the URI.
    ///
    /// # Errors
    ///
    /// Returns any exchange failure; on error there is no response.
    pub async fn get(&self, uri: &str) -> Result<Response> {
        let (msg, target) = build_request(Code::GET, uri, Vec::new()).await?;
        self.run(msg, target).await
    }

    /// POST the payload to the URI. Payloads beyond the block threshold
    /// are uploaded block-wise.
    ///
    /// # Errors
    ///
    /// Returns any exchange failure; on error there is no response.
    pub async fn post(&self, payload: &[u8], uri: &str) -> Result<Response> {
        let (msg, target) = build_request(Code::POST, uri, payload.to_vec()).await?;
        self.run(msg, target).await
    }

    /// DELETE the URI.
    ///
    /// # Errors
    ///
    /// Returns any exchange failure; on error there is no response.
    pub async fn delete(&self, uri: &str) -> Result<Response> {
        let (msg, target) = build_request(Code::DELETE, uri, Vec::new()).await?;
        self.run(msg, target).await
    }

    /// Ping a peer; `true` when it answered with the reset that
    /// acknowledges pings.
    ///
    /// # Errors
    ///
    /// Returns any exchange failure.
    pub async fn ping(&self, addr: &str) -> Result<bool> {
        let target = Target {
            addr: resolve(addr).await?,
            tcp: false,
        };
        let mut msg = Message::new(MessageType::Confirmable, Code::EMPTY);
        msg.generate_token(4);
        msg.recipient = Some(target.addr);

        let link = self.dial(&target).await?;
        let resp = link.send(&mut msg).await?.ok_or(Error::Timeout)?;
        Ok(is_ping_ack(&resp))
    }

    async fn dial(&self, target: &Target) -> Result<Arc<PeerLink>> {
        self.stores.start_sweepers();
        let conn: Arc<dyn Link> = if target.tcp {
            Arc::new(TcpLink::dial(target.addr).await?)
        } else {
            Arc::new(UdpLink::dial(target.addr).await?)
        };
        Ok(PeerLink::new(conn, self.stores.clone()))
    }

    async fn run(&self, mut msg: Message, target: Target) -> Result<Response> {
        let link = self.dial(&target).await?;
        let resp = link.send(&mut msg).await?.ok_or(Error::Timeout)?;
        Ok(Response {
            body: resp.payload,
            code: resp.code,
            peer_public_key: resp.peer_public_key,
        })
    }
}

struct Target {
    addr: SocketAddr,
    tcp: bool,
}

async fn resolve(addr: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "no address")))
}

/// Parse a request URI into a confirmable message plus dial target.
async fn build_request(code: Code, uri: &str, payload: Vec<u8>) -> Result<(Message, Target)> {
    let parsed = url::Url::parse(uri).map_err(|_| Error::UnsupportedScheme)?;
    let (scheme, tcp) = match parsed.scheme() {
        "coap" => (Scheme::Coap, false),
        "coaps" => (Scheme::Coaps, false),
        "coap+tcp" => (Scheme::Coap, true),
        "coaps+tcp" => (Scheme::Coaps, true),
        _ => return Err(Error::UnsupportedScheme),
    };
    let host = parsed.host_str().ok_or(Error::UnsupportedScheme)?;
    let port = parsed.port().unwrap_or(5683);
    let addr = resolve(&format!("{host}:{port}")).await?;

    let mut msg = Message::new(MessageType::Confirmable, code);
    msg.generate_token(6);
    msg.set_uri_path(parsed.path());
    for (k, v) in parsed.query_pairs() {
        msg.add_uri_query(&k, &v);
    }
    msg.set_scheme(scheme);
    msg.payload = payload;
    msg.recipient = Some(addr);

    Ok((msg, Target { addr, tcp }))
}
