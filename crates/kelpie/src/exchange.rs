//! Per-peer reliable exchange: confirmable retransmission and the
//! block-wise ARQ transfers.
//!
//! A [`PeerLink`] binds one socket to the retransmission machinery.
//! Confirmable sends retry up to the attempt ceiling with the same
//! message id, token, and AEAD nonce. Payloads over the block threshold
//! travel as a sliding window of confirmable blocks; acknowledgements
//! advance the window, and a selective-repeat hint lets the sender
//! retransmit only the blocks its peer is missing.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use kelpie_core::option::number;
use kelpie_core::{
    deserialize, serialize, BlockOption, Code, Message, MessageType, MAX_PAYLOAD_SIZE,
};
use kelpie_transport::Link;

use crate::error::{Error, Result};
use crate::security;
use crate::store::Stores;
use crate::{BLOCK_RESEND_INTERVAL, MAX_WINDOW_SIZE};

/// One in-flight block of a block-wise transfer.
pub(crate) struct Packet {
    pub msg: Message,
    pub acked: bool,
    pub attempts: u32,
    pub last_sent: Option<Instant>,
}

/// One socket bound to the reliable-exchange machinery.
pub(crate) struct PeerLink {
    pub conn: Arc<dyn Link>,
    pub stores: Arc<Stores>,
    /// ACK streams for in-flight server-pushed block transfers, keyed
    /// `remote_address || token_hex`.
    pub block2_streams: DashMap<String, mpsc::Sender<Message>>,
}

/// A reset carrying the empty code acknowledges a ping.
pub(crate) fn is_ping_ack(msg: &Message) -> bool {
    msg.mtype == MessageType::Reset && msg.code == Code::EMPTY
}

/// Build the acknowledgement for an inbound message. `orig` is the
/// request that opened the exchange, when there is one; the scheme and
/// proxy marker are carried over so the reply takes the same path back.
pub(crate) fn ack_to(orig: Option<&Message>, inbound: &Message, code: Code) -> Message {
    let mut ack = Message::with_id(MessageType::Acknowledgement, code, inbound.message_id);
    ack.token = inbound.token.clone();
    ack.recipient = inbound.sender;
    let source = orig.unwrap_or(inbound);
    ack.clone_options_from(source, number::URI_SCHEME);
    ack.clone_options_from(source, number::PROXY_SECURITY_ID);
    if let Some(proxy) = &source.proxy_addr {
        ack.proxy_addr = Some(proxy.clone());
    }
    ack
}

/// Like [`ack_to`], with a selective-repeat hint: the distance from the
/// acknowledged block back to the oldest block still missing inside the
/// advertised window, so the peer can retransmit exactly that slice.
pub(crate) fn ack_with_window_offset(
    orig: Option<&Message>,
    inbound: &Message,
    code: Code,
    window: u32,
    block_num: u32,
    received: &HashMap<u32, Vec<u8>>,
) -> Message {
    let mut ack = ack_to(orig, inbound, code);
    let window_start = block_num.saturating_sub(window);
    let mut offset = 0u32;
    for n in window_start..block_num {
        if !received.contains_key(&n) {
            offset = block_num - n;
            break;
        }
    }
    ack.add_option_uint(number::SELECTIVE_REPEAT_WINDOW_SIZE, window);
    ack.add_option_uint(number::WINDOW_OFFSET, offset);
    ack
}

/// Split an oversized message into confirmable block messages carrying
/// the given block option, each advertising the sender's window so the
/// receiver can answer with selective-repeat hints.
pub(crate) fn build_blocks(msg: &Message, block_option: u16, window: usize) -> Vec<Packet> {
    let chunks: Vec<&[u8]> = msg.payload.chunks(MAX_PAYLOAD_SIZE).collect();
    let total = chunks.len();
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let mut block_msg = msg.clone();
            block_msg.mtype = MessageType::Confirmable;
            block_msg.message_id = rand::random();
            block_msg.payload = chunk.to_vec();
            block_msg.last_sent = None;
            block_msg.attempts = 0;
            block_msg.remove_options(number::BLOCK1);
            block_msg.remove_options(number::BLOCK2);
            block_msg.remove_options(number::SELECTIVE_REPEAT_WINDOW_SIZE);
            let descriptor = BlockOption::new(i as u32, i + 1 < total, MAX_PAYLOAD_SIZE);
            block_msg.add_option(block_option, descriptor.encode());
            block_msg.add_option_uint(number::SELECTIVE_REPEAT_WINDOW_SIZE, window as u32);
            Packet {
                msg: block_msg,
                acked: false,
                attempts: 0,
                last_sent: None,
            }
        })
        .collect()
}

impl PeerLink {
    pub(crate) fn new(conn: Arc<dyn Link>, stores: Arc<Stores>) -> Arc<Self> {
        Arc::new(Self {
            conn,
            stores,
            block2_streams: DashMap::new(),
        })
    }

    pub(crate) fn remote(&self) -> Result<SocketAddr> {
        self.conn.peer_addr().ok_or(Error::SocketClosed)
    }

    /// Run the security output layer on a copy and serialize it. The
    /// original keeps its plaintext so retransmits re-encrypt with the
    /// same nonce and produce identical bytes.
    fn prepare(&self, msg: &Message, addr: SocketAddr) -> Result<Vec<u8>> {
        let mut out = msg.clone();
        security::output(self, &mut out, addr)?;
        Ok(serialize(&out)?)
    }

    pub(crate) async fn send_plain(&self, msg: &Message) -> Result<()> {
        let data = self.prepare(msg, self.remote()?)?;
        self.conn.send(&data).await?;
        Ok(())
    }

    pub(crate) async fn send_plain_to(&self, msg: &Message, addr: SocketAddr) -> Result<()> {
        let data = self.prepare(msg, addr)?;
        self.conn.send_to(&data, addr).await?;
        Ok(())
    }

    /// Send a request and run the exchange to completion. Confirmables
    /// return their response; non-confirmables and resets return `None`.
    pub(crate) async fn send(&self, msg: &mut Message) -> Result<Option<Message>> {
        match msg.mtype {
            MessageType::Confirmable => {
                if msg.scheme() == kelpie_core::Scheme::Coaps {
                    security::ensure_session(self, msg).await?;
                }
                match self.send_con(msg).await {
                    Err(Error::SessionNotFound) | Err(Error::SessionExpired) => {
                        // The peer lost the session: one re-handshake,
                        // one resend, then the error surfaces.
                        if msg.scheme() == kelpie_core::Scheme::Coaps {
                            security::ensure_session(self, msg).await?;
                        }
                        self.send_con(msg).await.map(Some)
                    }
                    other => other.map(Some),
                }
            }
            MessageType::NonConfirmable | MessageType::Reset => {
                self.send_plain(msg).await?;
                Ok(None)
            }
            MessageType::Acknowledgement => Err(Error::UnsupportedMessageType),
        }
    }

    /// The confirmable send loop.
    pub(crate) async fn send_con(&self, msg: &mut Message) -> Result<Message> {
        if msg.payload.len() > MAX_PAYLOAD_SIZE {
            return self.send_arq_block1(msg).await;
        }

        let data = self.prepare(msg, self.remote()?)?;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if attempts > 1 {
                debug!(message_id = msg.message_id, attempts, "retransmit");
            }
            self.conn.send(&data).await?;

            let resp = match self.receive(msg).await {
                Err(Error::MaxAttempts) => {
                    if attempts >= self.stores.config.max_send_attempts {
                        return Err(Error::MaxAttempts);
                    }
                    continue;
                }
                Err(e) => return Err(e),
                Ok(resp) => resp,
            };

            if is_ping_ack(&resp) {
                return Ok(resp);
            }
            // A bare empty ACK defers the response: the payload follows
            // as confirmables carrying Block2.
            if resp.mtype == MessageType::Acknowledgement && resp.code == Code::EMPTY {
                return self.receive_arq_block2(msg, None).await;
            }
            if resp.block2().is_some() {
                return self.receive_arq_block2(msg, Some(resp)).await;
            }
            return Ok(resp);
        }
    }

    /// Send an acknowledgement-class message to an address. Oversized
    /// acknowledgements become a server-pushed Block2 transfer fed by
    /// the requester's ACK stream.
    pub(crate) async fn send_to_addr(&self, msg: &Message, addr: SocketAddr) -> Result<()> {
        if msg.mtype == MessageType::Acknowledgement && msg.payload.len() > MAX_PAYLOAD_SIZE {
            let (tx, mut rx) = mpsc::channel(MAX_WINDOW_SIZE * 4);
            let id = format!("{addr}{}", msg.token_hex());
            self.block2_streams.insert(id.clone(), tx);
            let outcome = self.send_block2_response(&mut rx, msg, addr).await;
            self.block2_streams.remove(&id);
            return outcome;
        }
        self.send_plain_to(msg, addr).await
    }

    /// Read one message for this exchange: bounded by the message's wait
    /// budget, filtered to its token, run through the security input
    /// layer.
    pub(crate) async fn receive(&self, orig: &mut Message) -> Result<Message> {
        loop {
            let mut buf = vec![0u8; self.stores.config.mtu + 1];
            let wait = orig.timeout;
            let n = match tokio::time::timeout(wait, self.conn.recv(&mut buf)).await {
                Err(_) => {
                    orig.timeout = self.stores.config.ack_timeout;
                    return Err(Error::MaxAttempts);
                }
                Ok(read) => read?,
            };
            orig.timeout = self.stores.config.ack_timeout;
            if n > self.stores.config.mtu {
                continue;
            }

            let mut msg = deserialize(&buf[..n])?;
            msg.sender = self.conn.peer_addr();
            match security::input(self, &mut msg, orig.proxy_addr.as_deref()).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => return Err(e),
            }
            if msg.token != orig.token {
                continue;
            }
            return Ok(msg);
        }
    }

    /// Resend every due, unacked packet in `[start, stop)`.
    async fn send_range(
        &self,
        packets: &mut [Packet],
        start: usize,
        stop: usize,
        addr: SocketAddr,
        resend_after: Duration,
    ) -> Result<()> {
        let stop = stop.min(packets.len());
        for packet in packets.iter_mut().take(stop).skip(start.min(stop)) {
            if packet.acked {
                continue;
            }
            let due = packet
                .last_sent
                .is_none_or(|sent| sent.elapsed() >= resend_after);
            if !due {
                continue;
            }
            if packet.attempts >= self.stores.config.max_send_attempts {
                return Err(Error::MaxAttempts);
            }
            if packet.attempts > 0 {
                debug!(block = ?packet.msg.block1().or(packet.msg.block2()), "retransmit block");
            }
            packet.attempts += 1;
            packet.last_sent = Some(Instant::now());
            let data = self.prepare(&packet.msg, addr)?;
            self.conn.send_to(&data, addr).await?;
        }
        Ok(())
    }

    /// The request-upload window: resend `[0, shift + window)` and fail
    /// the transfer when the tail has stalled past the wait budget.
    async fn send_window(
        &self,
        packets: &mut [Packet],
        window: usize,
        shift: usize,
        addr: SocketAddr,
    ) -> Result<()> {
        let stop = (shift + window).min(packets.len());
        self.send_range(packets, 0, stop, addr, self.stores.config.ack_timeout)
            .await?;
        if stop == packets.len() {
            if let Some(last) = packets.last() {
                let stalled = !last.acked
                    && last
                        .last_sent
                        .is_some_and(|sent| sent.elapsed() >= self.stores.config.ack_timeout);
                if stalled && last.attempts >= self.stores.config.max_send_attempts {
                    return Err(Error::MaxAttempts);
                }
            }
        }
        Ok(())
    }

    /// Selective repeat: resend only the hinted slice behind the
    /// acknowledged block.
    async fn send_window_hinted(
        &self,
        packets: &mut [Packet],
        window: usize,
        shift: usize,
        block_num: usize,
        offset: usize,
        addr: SocketAddr,
        resend_after: Duration,
    ) -> Result<()> {
        let start = block_num.saturating_sub(offset);
        let stop = (shift + window).min(block_num);
        self.send_range(packets, start, stop, addr, resend_after)
            .await
    }

    /// Block1 upload: slide a window of confirmable request blocks until
    /// the peer answers with a terminal (non-Continue) response.
    async fn send_arq_block1(&self, msg: &mut Message) -> Result<Message> {
        let addr = self.remote()?;
        let num_blocks = msg.payload.len().div_ceil(MAX_PAYLOAD_SIZE);
        let window = num_blocks.min(self.stores.config.window_size);
        let mut packets = build_blocks(msg, number::BLOCK1, window);
        let mut shift = 0usize;

        self.send_window(&mut packets, window, shift, addr).await?;

        loop {
            let resp = match self.receive(msg).await {
                Err(Error::MaxAttempts) => {
                    self.send_window(&mut packets, window, shift, addr).await?;
                    continue;
                }
                Err(e) => return Err(e),
                Ok(resp) => resp,
            };
            if resp.mtype != MessageType::Acknowledgement {
                continue;
            }

            if resp.code == Code::EMPTY && resp.block1().is_none() {
                return self.receive_arq_block2(msg, None).await;
            }
            if resp.block2().is_some() {
                return self.receive_arq_block2(msg, Some(resp)).await;
            }

            let Some(block) = resp.block1() else { continue };
            if resp.code != Code::CONTINUE {
                return Ok(resp);
            }
            let n = block.num as usize;
            if n >= packets.len() {
                continue;
            }

            if let (Some(w), Some(offset)) = (
                resp.option_uint(number::SELECTIVE_REPEAT_WINDOW_SIZE),
                resp.option_uint(number::WINDOW_OFFSET),
            ) {
                if offset > 0 {
                    self.send_window_hinted(
                        &mut packets,
                        w as usize,
                        shift,
                        n,
                        offset as usize,
                        addr,
                        self.stores.config.ack_timeout,
                    )
                    .await?;
                }
            }

            packets[n].acked = true;
            if n == shift {
                shift += 1;
                while shift < packets.len() && packets[shift].acked {
                    shift += 1;
                }
                self.send_window(&mut packets, window, shift, addr).await?;
            }
        }
    }

    /// Block2 download: collect confirmables carrying Block2 until the
    /// buffer is complete, acknowledging as they land.
    pub(crate) async fn receive_arq_block2(
        &self,
        orig: &mut Message,
        first: Option<Message>,
    ) -> Result<Message> {
        let mut received: HashMap<u32, Vec<u8>> = HashMap::new();
        let mut total: Option<usize> = None;
        self.conn
            .set_recv_buffer(self.stores.config.mtu * self.stores.config.window_size);

        if let Some(msg) = first {
            if let Some(done) = self.ingest_block2(orig, msg, &mut received, &mut total).await? {
                return Ok(done);
            }
        }

        let mut attempts = 0u32;
        loop {
            let msg = match self.receive(orig).await {
                Err(Error::MaxAttempts) => {
                    if attempts >= self.stores.config.max_send_attempts {
                        return Err(Error::MaxAttempts);
                    }
                    attempts += 1;
                    continue;
                }
                Err(e) => return Err(e),
                Ok(msg) => msg,
            };
            if let Some(done) = self.ingest_block2(orig, msg, &mut received, &mut total).await? {
                return Ok(done);
            }
        }
    }

    /// Store one download block and acknowledge it. Returns the
    /// reassembled response once every block is present.
    async fn ingest_block2(
        &self,
        orig: &Message,
        mut msg: Message,
        received: &mut HashMap<u32, Vec<u8>>,
        total: &mut Option<usize>,
    ) -> Result<Option<Message>> {
        let Some(block) = msg.block2() else {
            return Ok(None);
        };
        if msg.mtype != MessageType::Confirmable {
            return Ok(None);
        }

        if !block.more {
            *total = Some(block.num as usize + 1);
        }
        received.insert(block.num, std::mem::take(&mut msg.payload));

        if *total == Some(received.len()) {
            let mut assembled = Vec::new();
            for i in 0..received.len() as u32 {
                if let Some(chunk) = received.get(&i) {
                    assembled.extend_from_slice(chunk);
                }
            }
            msg.payload = assembled;
            let ack = ack_to(Some(orig), &msg, Code::EMPTY);
            self.send_plain(&ack).await?;
            return Ok(Some(msg));
        }

        let ack = match msg.option_uint(number::SELECTIVE_REPEAT_WINDOW_SIZE) {
            Some(w) => ack_with_window_offset(
                Some(orig),
                &msg,
                Code::CONTINUE,
                w,
                block.num,
                received,
            ),
            None => ack_to(Some(orig), &msg, Code::CONTINUE),
        };
        self.send_plain(&ack).await?;
        Ok(None)
    }

    /// Block2 upload (server side): announce the window with an empty
    /// ACK, then slide confirmable response blocks driven by the
    /// requester's ACK stream.
    async fn send_block2_response(
        &self,
        acks: &mut mpsc::Receiver<Message>,
        msg: &Message,
        addr: SocketAddr,
    ) -> Result<()> {
        let num_blocks = msg.payload.len().div_ceil(MAX_PAYLOAD_SIZE);
        let window = num_blocks.min(self.stores.config.window_size);

        let mut announce = ack_to(None, msg, Code::EMPTY);
        announce.add_option_uint(number::SELECTIVE_REPEAT_WINDOW_SIZE, window as u32);
        self.send_plain_to(&announce, addr).await?;

        let mut packets = build_blocks(msg, number::BLOCK2, window);
        let mut shift = 0usize;
        let mut relative = 0usize;

        self.send_range(
            &mut packets,
            shift,
            relative + window,
            addr,
            BLOCK_RESEND_INTERVAL,
        )
        .await?;

        loop {
            let resp = match tokio::time::timeout(BLOCK_RESEND_INTERVAL, acks.recv()).await {
                Ok(None) => return Err(Error::SocketClosed),
                Err(_) => {
                    self.send_range(
                        &mut packets,
                        shift,
                        relative + window,
                        addr,
                        BLOCK_RESEND_INTERVAL,
                    )
                    .await?;
                    continue;
                }
                Ok(Some(resp)) => resp,
            };

            if resp.token != msg.token || resp.mtype != MessageType::Acknowledgement {
                continue;
            }
            let Some(block) = resp.block2() else { continue };
            // The downloader's final empty ACK closes the transfer
            if resp.code != Code::CONTINUE {
                return Ok(());
            }
            let n = block.num as usize;
            if n >= packets.len() {
                continue;
            }

            if let (Some(w), Some(offset)) = (
                resp.option_uint(number::SELECTIVE_REPEAT_WINDOW_SIZE),
                resp.option_uint(number::WINDOW_OFFSET),
            ) {
                if offset > 0 {
                    self.send_window_hinted(
                        &mut packets,
                        w as usize,
                        shift,
                        n,
                        offset as usize,
                        addr,
                        BLOCK_RESEND_INTERVAL,
                    )
                    .await?;
                }
            }

            if !packets[n].acked {
                packets[n].acked = true;
                relative += 1;
            }
            if n == shift {
                shift += 1;
                while shift < packets.len() && packets[shift].acked {
                    shift += 1;
                }
            }
            if shift == packets.len() {
                return Ok(());
            }
            self.send_range(
                &mut packets,
                shift,
                relative + window,
                addr,
                BLOCK_RESEND_INTERVAL,
            )
            .await?;
        }
    }
}
