//! Async UDP links.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;

use crate::link::{Link, LinkError, LinkResult};

/// A UDP socket, either listening (unconnected) or dialed (connected to
/// one peer).
#[derive(Clone)]
pub struct UdpLink {
    socket: Arc<UdpSocket>,
    peer: Option<SocketAddr>,
    closed: Arc<AtomicBool>,
}

impl UdpLink {
    /// Bind a listening socket with an enlarged receive buffer.
    ///
    /// # Errors
    ///
    /// Returns `LinkError::BindFailed` when the address cannot be bound.
    pub async fn bind(addr: SocketAddr) -> LinkResult<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| LinkError::BindFailed(e.to_string()))?;
        let link = Self {
            socket: Arc::new(socket),
            peer: None,
            closed: Arc::new(AtomicBool::new(false)),
        };
        link.set_recv_buffer(2 * 1024 * 1024);
        Ok(link)
    }

    /// Dial a peer: bind an unspecified local port and connect.
    ///
    /// # Errors
    ///
    /// Returns `LinkError::ConnectFailed` when the peer is unreachable
    /// at the socket level.
    pub async fn dial(addr: SocketAddr) -> LinkResult<Self> {
        let local: SocketAddr = if addr.is_ipv4() {
            "0.0.0.0:0".parse().expect("constant address")
        } else {
            "[::]:0".parse().expect("constant address")
        };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| LinkError::BindFailed(e.to_string()))?;
        socket
            .connect(addr)
            .await
            .map_err(|e| LinkError::ConnectFailed(e.to_string()))?;
        Ok(Self {
            socket: Arc::new(socket),
            peer: Some(addr),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Mark the link closed; subsequent operations fail with `Closed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    fn check_open(&self) -> LinkResult<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(LinkError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Link for UdpLink {
    async fn send(&self, buf: &[u8]) -> LinkResult<usize> {
        self.check_open()?;
        if self.peer.is_none() {
            return Err(LinkError::NoPeer);
        }
        Ok(self.socket.send(buf).await?)
    }

    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> LinkResult<usize> {
        self.check_open()?;
        // A connected socket can only write to its peer
        match self.peer {
            Some(peer) if peer == addr => Ok(self.socket.send(buf).await?),
            Some(_) | None => Ok(self.socket.send_to(buf, addr).await?),
        }
    }

    async fn recv(&self, buf: &mut [u8]) -> LinkResult<usize> {
        self.check_open()?;
        if self.peer.is_none() {
            return Err(LinkError::NoPeer);
        }
        Ok(self.socket.recv(buf).await?)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> LinkResult<(usize, SocketAddr)> {
        self.check_open()?;
        Ok(self.socket.recv_from(buf).await?)
    }

    fn local_addr(&self) -> LinkResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn set_recv_buffer(&self, bytes: usize) {
        let sock = socket2::SockRef::from(self.socket.as_ref());
        let mut size = bytes;
        while size >= 4096 {
            if sock.set_recv_buffer_size(size).is_ok() {
                return;
            }
            size /= 2;
        }
        tracing::debug!("could not grow udp receive buffer");
    }
}
