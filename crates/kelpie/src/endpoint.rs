//! The endpoint: resource registration, receive loops, proxying, and
//! requests issued from the listening socket itself.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use kelpie_core::option::number;
use kelpie_core::{deserialize, serialize, Code, Message};
use kelpie_transport::{Link, LinkError, TcpLink, UdpLink};

use crate::backward::BackwardChannel;
use crate::cache::ShardedCache;
use crate::config::EndpointConfig;
use crate::error::{Error, Result};
use crate::exchange::{ack_to, PeerLink};
use crate::resource::{ResourceResult, ResourceTable};
use crate::state::process_local_state;
use crate::store::Stores;
use crate::BACKWARD_READ_TIMEOUT;

/// Where a relayed request came from and which link carries the way
/// back.
#[derive(Clone)]
struct ProxyNote {
    addr: SocketAddr,
    link: Arc<dyn Link>,
}

/// A CoAP endpoint: simultaneously server, client, and relay.
pub struct Endpoint {
    stores: Arc<Stores>,
    resources: Arc<ResourceTable>,
    proxy_notes: Arc<ShardedCache<ProxyNote>>,
    tcp_conns: Arc<ShardedCache<Arc<TcpLink>>>,
    semaphore: Arc<Semaphore>,
    proxy_enabled: AtomicBool,
    link: RwLock<Option<Arc<PeerLink>>>,
    listener: RwLock<Option<UdpLink>>,
    listen_addr: RwLock<Option<String>>,
    tcp_addr: RwLock<Option<SocketAddr>>,
}

impl Endpoint {
    /// Create an endpoint with the given configuration.
    #[must_use]
    pub fn new(config: EndpointConfig) -> Self {
        let proxy_ttl = config.proxy_ttl;
        let max_parallel = config.max_parallel;
        Self {
            stores: Stores::new(config),
            resources: Arc::new(ResourceTable::new()),
            proxy_notes: Arc::new(ShardedCache::new(proxy_ttl)),
            tcp_conns: Arc::new(ShardedCache::new(proxy_ttl)),
            semaphore: Arc::new(Semaphore::new(max_parallel)),
            proxy_enabled: AtomicBool::new(false),
            link: RwLock::new(None),
            listener: RwLock::new(None),
            listen_addr: RwLock::new(None),
            tcp_addr: RwLock::new(None),
        }
    }

    fn register(
        &self,
        method: Code,
        path: &str,
        handler: impl Fn(&Message) -> ResourceResult + Send + Sync + 'static,
    ) {
        self.resources.register(method, path, Arc::new(handler));
    }

    /// Register a GET resource. `"*"` is a catch-all path.
    pub fn get(&self, path: &str, handler: impl Fn(&Message) -> ResourceResult + Send + Sync + 'static) {
        self.register(Code::GET, path, handler);
    }

    /// Register a POST resource.
    pub fn post(&self, path: &str, handler: impl Fn(&Message) -> ResourceResult + Send + Sync + 'static) {
        self.register(Code::POST, path, handler);
    }

    /// Register a PUT resource.
    pub fn put(&self, path: &str, handler: impl Fn(&Message) -> ResourceResult + Send + Sync + 'static) {
        self.register(Code::PUT, path, handler);
    }

    /// Register a DELETE resource.
    pub fn delete(&self, path: &str, handler: impl Fn(&Message) -> ResourceResult + Send + Sync + 'static) {
        self.register(Code::DELETE, path, handler);
    }

    /// Allow or refuse relaying requests that carry a Proxy-URI.
    pub fn enable_proxy(&self, enabled: bool) {
        self.proxy_enabled.store(enabled, Ordering::Relaxed);
    }

    /// The bound UDP address, once listening.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let guard = self.link.read().expect("link lock poisoned");
        guard.as_ref().and_then(|l| l.conn.local_addr().ok())
    }

    /// The bound TCP address, once listening.
    #[must_use]
    pub fn tcp_local_addr(&self) -> Option<SocketAddr> {
        *self.tcp_addr.read().expect("tcp addr lock poisoned")
    }

    /// Bind a UDP socket and run the receive loop until the socket
    /// closes.
    ///
    /// # Errors
    ///
    /// Returns bind and address-resolution failures; a closed socket
    /// ends the loop with `Ok(())`.
    pub async fn listen(self: &Arc<Self>, addr: &str) -> Result<()> {
        let bind_addr = resolve(addr).await?;
        let udp = UdpLink::bind(bind_addr).await?;
        *self.listen_addr.write().expect("addr lock poisoned") = Some(addr.to_string());
        *self.listener.write().expect("listener lock poisoned") = Some(udp.clone());

        self.stores.start_sweepers();
        let link = PeerLink::new(Arc::new(udp.clone()), self.stores.clone());
        *self.link.write().expect("link lock poisoned") = Some(link.clone());

        let config = &self.stores.config;
        info!(
            addr = %udp.local_addr()?,
            window = config.window_size,
            attempts = config.max_send_attempts,
            ack_timeout_ms = config.ack_timeout.as_millis() as u64,
            session_ttl_s = config.session_ttl.as_secs(),
            "endpoint listening"
        );

        self.udp_loop(udp, link).await
    }

    async fn udp_loop(self: &Arc<Self>, udp: UdpLink, link: Arc<PeerLink>) -> Result<()> {
        let mtu = self.stores.config.mtu;
        loop {
            let mut buf = vec![0u8; mtu + 1];
            // Bounded reads so a closed flag is noticed while idle
            let read = tokio::time::timeout(Duration::from_millis(500), udp.recv_from(&mut buf)).await;
            let (n, sender) = match read {
                Err(_) => continue,
                Ok(Err(LinkError::Closed)) => {
                    info!("listener closed");
                    return Ok(());
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "listener read failed");
                    continue;
                }
                Ok(Ok(v)) => v,
            };
            if n == 0 || n > mtu {
                debug!(bytes = n, "dropping out-of-bounds datagram");
                continue;
            }
            buf.truncate(n);

            let Ok(mut msg) = deserialize(&buf) else {
                debug!(peer = %sender, "dropping malformed datagram");
                continue;
            };
            msg.sender = Some(sender);

            // Return leg of a relayed exchange: forward the raw bytes
            let note_key = format!("{}{sender}", msg.token_hex());
            if let Some(note) = self.proxy_notes.get(&note_key) {
                self.proxy_notes.set(&note_key, note.clone());
                if let Err(e) = note.link.send_to(&buf, note.addr).await {
                    debug!(error = %e, "proxy return leg failed");
                }
                continue;
            }

            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore closed");

            if msg.proxy_uri().is_some() {
                let this = self.clone();
                let ingress: Arc<dyn Link> = link.conn.clone();
                tokio::spawn(async move {
                    this.forward_proxy(msg, ingress).await;
                    drop(permit);
                });
                continue;
            }

            let link = link.clone();
            let resources = self.resources.clone();
            tokio::spawn(async move {
                process_local_state(link, resources, msg).await;
                drop(permit);
            });
        }
    }

    /// Accept TCP connections and serve framed messages on each until
    /// the peer hangs up.
    ///
    /// # Errors
    ///
    /// Returns bind and address-resolution failures.
    pub async fn listen_tcp(self: &Arc<Self>, addr: &str) -> Result<()> {
        let bind_addr = resolve(addr).await?;
        let tcp = TcpListener::bind(bind_addr).await?;
        *self.tcp_addr.write().expect("tcp addr lock poisoned") = Some(tcp.local_addr()?);
        self.stores.start_sweepers();
        info!(addr = %tcp.local_addr()?, "endpoint listening (tcp)");

        loop {
            let (stream, peer) = match tcp.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            debug!(%peer, "tcp connection accepted");
            let this = self.clone();
            tokio::spawn(async move { this.serve_tcp_conn(stream).await });
        }
    }

    /// Serve framed messages on a connection this endpoint dialed
    /// itself. A device behind NAT opens a long-lived connection to a
    /// relay and answers requests arriving over it.
    pub async fn serve_tcp(self: &Arc<Self>, stream: tokio::net::TcpStream) {
        self.stores.start_sweepers();
        self.clone().serve_tcp_conn(stream).await;
    }

    async fn serve_tcp_conn(self: Arc<Self>, stream: tokio::net::TcpStream) {
        let conn = match TcpLink::from_stream(stream) {
            Ok(conn) => Arc::new(conn),
            Err(e) => {
                warn!(error = %e, "tcp setup failed");
                return;
            }
        };
        let Some(remote) = conn.peer_addr() else { return };
        let conn_key = format!("tcp:{remote}");
        self.tcp_conns.set(&conn_key, conn.clone());

        let link = PeerLink::new(conn.clone() as Arc<dyn Link>, self.stores.clone());

        loop {
            let mut buf = vec![0u8; 65_536];
            let n = match conn.recv(&mut buf).await {
                Ok(n) => n,
                Err(LinkError::Closed) => break,
                Err(e) => {
                    debug!(error = %e, peer = %remote, "tcp read failed");
                    break;
                }
            };
            buf.truncate(n);
            // A live frame keeps the connection adoptable for proxying
            self.tcp_conns.set(&conn_key, conn.clone());

            let Ok(mut msg) = deserialize(&buf) else {
                debug!(peer = %remote, "dropping malformed frame");
                continue;
            };
            msg.sender = Some(remote);

            if msg.proxy_uri().is_none() {
                let note_key = format!("{}{remote}", msg.token_hex());
                if let Some(note) = self.proxy_notes.get(&note_key) {
                    self.proxy_notes.set(&note_key, note.clone());
                    if let Err(e) = note.link.send_to(&buf, note.addr).await {
                        debug!(error = %e, "proxy return leg failed");
                    }
                    continue;
                }

                let permit = self
                    .semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("semaphore closed");
                let link = link.clone();
                let resources = self.resources.clone();
                tokio::spawn(async move {
                    process_local_state(link, resources, msg).await;
                    drop(permit);
                });
                continue;
            }

            let this = self.clone();
            let ingress: Arc<dyn Link> = conn.clone();
            tokio::spawn(async move { this.forward_proxy(msg, ingress).await });
        }

        self.tcp_conns.delete(&conn_key);
        debug!(peer = %remote, "tcp connection closed");
    }

    /// Forward leg of a relayed request: strip the proxy options,
    /// remember the way back, and send upstream.
    async fn forward_proxy(self: &Arc<Self>, mut msg: Message, ingress: Arc<dyn Link>) {
        let Some(sender) = msg.sender else { return };
        let Some(proxy_uri) = msg.proxy_uri() else { return };

        if !self.proxy_enabled.load(Ordering::Relaxed) {
            self.reject_proxy(&msg, sender, &ingress, Code::PROXYING_NOT_SUPPORTED)
                .await;
            return;
        }

        let upstream = match proxy_target(&proxy_uri).await {
            Ok(addr) => addr,
            Err(e) => {
                debug!(error = %e, uri = %proxy_uri, "bad proxy uri");
                self.reject_proxy(&msg, sender, &ingress, Code::BAD_OPTION).await;
                return;
            }
        };

        msg.remove_options(number::PROXY_SCHEME);
        msg.remove_options(number::PROXY_URI);
        let Ok(data) = serialize(&msg) else { return };

        let sent = match self.tcp_conns.get(&format!("tcp:{upstream}")) {
            // A device that dialed in keeps its own connection as the way up
            Some(tcp) => tcp.send(&data).await.map(|_| ()),
            None => {
                let link = self.link.read().expect("link lock poisoned").clone();
                match link {
                    Some(link) => link.conn.send_to(&data, upstream).await.map(|_| ()),
                    None => Err(LinkError::Closed),
                }
            }
        };
        if let Err(e) = sent {
            warn!(error = %e, %upstream, "proxy forward failed");
            return;
        }

        let note_key = format!("{}{upstream}", msg.token_hex());
        self.proxy_notes.set(
            &note_key,
            ProxyNote {
                addr: sender,
                link: ingress,
            },
        );
        debug!(%upstream, downstream = %sender, "relayed request");
    }

    async fn reject_proxy(
        &self,
        msg: &Message,
        sender: SocketAddr,
        ingress: &Arc<dyn Link>,
        code: Code,
    ) {
        let reply = ack_to(None, msg, code);
        if let Ok(data) = serialize(&reply) {
            let _ = ingress.send_to(&data, sender).await;
        }
    }

    /// Issue a request from the endpoint's own listening socket and wait
    /// for the response through the backward channel.
    ///
    /// # Errors
    ///
    /// Returns `Error::SocketClosed` before `listen`, or
    /// `Error::Timeout` when no response arrives.
    pub async fn send(&self, msg: &mut Message, addr: SocketAddr) -> Result<Message> {
        let link = self
            .link
            .read()
            .expect("link lock poisoned")
            .clone()
            .ok_or(Error::SocketClosed)?;

        if msg.token.is_empty() {
            msg.generate_token(6);
        }
        msg.recipient = Some(addr);
        let data = serialize(msg)?;

        // Subscribe before writing so the response cannot win the race
        let key = BackwardChannel::key(&msg.token_hex(), addr);
        let rx = self.stores.backward.subscribe(&key);
        if let Err(e) = link.conn.send_to(&data, addr).await {
            self.stores.backward.unsubscribe(&key);
            return Err(e.into());
        }
        self.stores.backward.wait(&key, rx, BACKWARD_READ_TIMEOUT).await
    }

    /// Close the current UDP socket, rebind the saved address, and
    /// restart the receive loop in the background.
    ///
    /// # Errors
    ///
    /// Returns `Error::SocketClosed` when the endpoint never listened.
    pub async fn refresh(self: &Arc<Self>) -> Result<()> {
        let addr = self
            .listen_addr
            .read()
            .expect("addr lock poisoned")
            .clone()
            .ok_or(Error::SocketClosed)?;

        if let Some(old) = self.listener.write().expect("listener lock poisoned").take() {
            old.close();
        }
        *self.link.write().expect("link lock poisoned") = None;

        // The old loop notices the close on its next bounded read
        tokio::time::sleep(Duration::from_millis(600)).await;

        let this = self.clone();
        let spawn_addr = addr.clone();
        tokio::spawn(async move {
            if let Err(e) = this.listen(&spawn_addr).await {
                warn!(error = %e, "relisten failed");
            }
        });
        info!(%addr, "endpoint refreshing");
        Ok(())
    }
}

async fn resolve(addr: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "no address")))
}

/// Resolve the host of a Proxy-URI to the upstream socket address.
async fn proxy_target(uri: &str) -> Result<SocketAddr> {
    let parsed = url::Url::parse(uri).map_err(|_| Error::UnsupportedScheme)?;
    let host = parsed.host_str().ok_or(Error::UnsupportedScheme)?;
    let port = parsed.port().unwrap_or(5683);
    resolve(&format!("{host}:{port}")).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_proxy_target_parsing() {
        let addr = proxy_target("coap://127.0.0.1:7700/info").await.unwrap();
        assert_eq!(addr, "127.0.0.1:7700".parse().unwrap());

        // Default port fills in
        let addr = proxy_target("coap+tcp://127.0.0.1/info").await.unwrap();
        assert_eq!(addr.port(), 5683);

        assert!(proxy_target("not a uri").await.is_err());
    }

    #[tokio::test]
    async fn test_send_before_listen_fails() {
        let endpoint = Endpoint::new(EndpointConfig::default());
        let mut msg = Message::new(kelpie_core::MessageType::Confirmable, Code::GET);
        let result = endpoint.send(&mut msg, "127.0.0.1:1".parse().unwrap()).await;
        assert!(matches!(result, Err(Error::SocketClosed)));
    }

    #[tokio::test]
    async fn test_session_recovery_after_server_loses_state() {
        use crate::exchange::PeerLink;
        use crate::resource::ResourceResult;
        use crate::store::Stores;
        use kelpie_core::{MessageType, Scheme};

        let endpoint = Arc::new(Endpoint::new(EndpointConfig::default()));
        endpoint.get("/info", |_req| ResourceResult::content(b"ok".to_vec()));
        let task = {
            let endpoint = endpoint.clone();
            tokio::spawn(async move { endpoint.listen("127.0.0.1:0").await })
        };
        let mut server_addr = None;
        for _ in 0..100 {
            if let Some(addr) = endpoint.local_addr() {
                server_addr = Some(addr);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let server_addr = server_addr.expect("endpoint never bound");

        // One long-lived client socket, so the session outlives requests
        let conn = Arc::new(UdpLink::dial(server_addr).await.unwrap());
        let client_local = conn.local_addr().unwrap().to_string();
        let link = PeerLink::new(conn, Stores::new(EndpointConfig::default()));

        let new_request = || {
            let mut msg = Message::new(MessageType::Confirmable, Code::GET);
            msg.generate_token(6);
            msg.set_uri_path("/info");
            msg.set_scheme(Scheme::Coaps);
            msg.recipient = Some(server_addr);
            msg
        };

        let mut first = new_request();
        let resp = link.send(&mut first).await.unwrap().unwrap();
        assert_eq!(resp.code, Code::CONTENT);
        assert_eq!(resp.payload, b"ok");

        // The server forgets the session; the next request must be told,
        // re-handshake, and resend, all inside one call
        endpoint
            .stores
            .sessions
            .delete(&server_addr.to_string(), &client_local, "");

        let mut second = new_request();
        let resp = link.send(&mut second).await.unwrap().unwrap();
        assert_eq!(resp.code, Code::CONTENT);
        assert_eq!(resp.payload, b"ok");

        task.abort();
    }

    #[tokio::test]
    async fn test_listen_exposes_local_addr() {
        let endpoint = Arc::new(Endpoint::new(EndpointConfig::default()));
        let task = {
            let endpoint = endpoint.clone();
            tokio::spawn(async move { endpoint.listen("127.0.0.1:0").await })
        };
        for _ in 0..50 {
            if endpoint.local_addr().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(endpoint.local_addr().is_some());
        task.abort();
    }
}
