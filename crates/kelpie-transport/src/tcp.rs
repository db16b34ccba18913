//! Framed TCP links.
//!
//! Each message crosses the stream as one length-prefixed frame. Writes
//! take a per-connection lock so a whole frame is always contiguous on
//! the wire; reads likewise, so concurrent receivers never interleave
//! partial frames.

use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use kelpie_core::framing;

use crate::link::{Link, LinkError, LinkResult};

/// One TCP connection carrying framed messages.
pub struct TcpLink {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    local: SocketAddr,
    peer: SocketAddr,
}

impl TcpLink {
    /// Dial a remote peer.
    ///
    /// # Errors
    ///
    /// Returns `LinkError::ConnectFailed` when the connection cannot be
    /// established.
    pub async fn dial(addr: SocketAddr) -> LinkResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| LinkError::ConnectFailed(e.to_string()))?;
        Self::from_stream(stream)
    }

    /// Wrap an accepted connection.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the socket addresses cannot be read.
    pub fn from_stream(stream: TcpStream) -> LinkResult<Self> {
        let local = stream.local_addr()?;
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            local,
            peer,
        })
    }

    async fn read_frame(&self, buf: &mut [u8]) -> LinkResult<usize> {
        let mut reader = self.reader.lock().await;

        let mut first = [0u8; 1];
        read_exact(&mut reader, &mut first).await?;
        let prefix_len = framing::prefix_size(first[0]);

        let mut prefix = [0u8; 5];
        prefix[0] = first[0];
        read_exact(&mut reader, &mut prefix[1..prefix_len]).await?;

        let (len, _) =
            framing::decode_len(&prefix[..prefix_len]).map_err(|_| LinkError::InvalidFrame)?;
        if len > buf.len() {
            return Err(LinkError::ShortBuffer {
                expected: len,
                actual: buf.len(),
            });
        }
        read_exact(&mut reader, &mut buf[..len]).await?;
        Ok(len)
    }

    async fn write_frame(&self, data: &[u8]) -> LinkResult<usize> {
        let frame = framing::encode_frame(data);
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        Ok(data.len())
    }
}

async fn read_exact(reader: &mut OwnedReadHalf, buf: &mut [u8]) -> LinkResult<()> {
    reader.read_exact(buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            LinkError::Closed
        } else {
            LinkError::Io(e)
        }
    })?;
    Ok(())
}

#[async_trait]
impl Link for TcpLink {
    async fn send(&self, buf: &[u8]) -> LinkResult<usize> {
        self.write_frame(buf).await
    }

    // Point-to-point: the address is implied by the connection
    async fn send_to(&self, buf: &[u8], _addr: SocketAddr) -> LinkResult<usize> {
        self.write_frame(buf).await
    }

    async fn recv(&self, buf: &mut [u8]) -> LinkResult<usize> {
        self.read_frame(buf).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> LinkResult<(usize, SocketAddr)> {
        let n = self.read_frame(buf).await?;
        Ok((n, self.peer))
    }

    fn local_addr(&self) -> LinkResult<SocketAddr> {
        Ok(self.local)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    async fn connected_pair() -> (TcpLink, TcpLink) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (client, server) = tokio::join!(TcpLink::dial(addr), async {
            let (stream, _) = listener.accept().await.unwrap();
            TcpLink::from_stream(stream)
        });
        (client.unwrap(), server.unwrap())
    }

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (client, server) = connected_pair().await;

        client.send(b"framed message").await.unwrap();
        let mut buf = [0u8; 64];
        let n = timeout(Duration::from_secs(1), server.recv(&mut buf))
            .await
            .expect("recv timed out")
            .unwrap();
        assert_eq!(&buf[..n], b"framed message");
    }

    #[tokio::test]
    async fn test_multiple_frames_stay_separate() {
        let (client, server) = connected_pair().await;

        client.send(b"one").await.unwrap();
        client.send(b"two").await.unwrap();

        let mut buf = [0u8; 64];
        let n = server.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"one");
        let n = server.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"two");
    }

    #[tokio::test]
    async fn test_large_frame() {
        let (client, server) = connected_pair().await;

        // Spans the two-byte length extension
        let payload = vec![0x5A; 40_000];
        let sent = payload.clone();
        tokio::spawn(async move { client.send(&sent).await.unwrap() });

        let mut buf = vec![0u8; 65_536];
        let n = timeout(Duration::from_secs(1), server.recv(&mut buf))
            .await
            .expect("recv timed out")
            .unwrap();
        assert_eq!(&buf[..n], &payload[..]);
    }

    #[tokio::test]
    async fn test_short_receive_buffer() {
        let (client, server) = connected_pair().await;
        client.send(&[0u8; 100]).await.unwrap();

        let mut buf = [0u8; 10];
        assert!(matches!(
            server.recv(&mut buf).await,
            Err(LinkError::ShortBuffer {
                expected: 100,
                actual: 10
            })
        ));
    }

    #[tokio::test]
    async fn test_peer_close_maps_to_closed() {
        let (client, server) = connected_pair().await;
        drop(client);

        let mut buf = [0u8; 8];
        assert!(matches!(server.recv(&mut buf).await, Err(LinkError::Closed)));
    }
}
