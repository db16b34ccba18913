//! Per-(peer, token) local state: block reassembly and handler dispatch.
//!
//! Every inbound message resolves to one state object keyed by sender
//! address plus token. Processing is serialized by the state's mutex;
//! the handler fires at most once per state, even when a retransmitted
//! final block races with completion.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use kelpie_core::option::number;
use kelpie_core::{BlockOption, Code, Message, MessageType, MAX_PAYLOAD_SIZE};

use crate::error::Result;
use crate::exchange::{ack_to, ack_with_window_offset, PeerLink};
use crate::resource::ResourceTable;
use crate::security;

/// What a worker needs to process one inbound message.
#[derive(Clone)]
pub(crate) struct DispatchCtx {
    pub link: Arc<PeerLink>,
    pub resources: Arc<ResourceTable>,
    pub state_key: String,
}

#[derive(Default)]
struct StateInner {
    received: HashMap<u32, Vec<u8>>,
    total: Option<usize>,
}

/// Reassembly state for one (sender, token) exchange.
#[derive(Default)]
pub(crate) struct LocalState {
    inner: Mutex<StateInner>,
    handler_fired: AtomicBool,
}

/// Route one inbound message through its local state.
pub(crate) async fn process_local_state(
    link: Arc<PeerLink>,
    resources: Arc<ResourceTable>,
    msg: Message,
) {
    let Some(sender) = msg.sender else { return };
    let key = format!("{sender}{}", msg.token_hex());
    let state = link
        .stores
        .local_states
        .load_or_store(&key, || Arc::new(LocalState::default()));
    let ctx = DispatchCtx {
        link,
        resources,
        state_key: key,
    };
    state.process(&ctx, msg).await;
}

impl LocalState {
    /// Process one message under the state's lock.
    pub(crate) async fn process(self: &Arc<Self>, ctx: &DispatchCtx, mut msg: Message) {
        let mut inner = self.inner.lock().await;

        match security::input(&ctx.link, &mut msg, None).await {
            Ok(true) => {}
            // Consumed by the handshake service, or dropped
            Ok(false) => return,
            Err(e) => {
                debug!(error = %e, "security input rejected message");
                return;
            }
        }

        // An empty confirmable is a ping; answer with a reset
        if msg.mtype == MessageType::Confirmable && msg.code == Code::EMPTY {
            if let Some(sender) = msg.sender {
                let mut rst = Message::with_id(MessageType::Reset, Code::EMPTY, msg.message_id);
                rst.token = msg.token.clone();
                if let Err(e) = ctx.link.send_plain_to(&rst, sender).await {
                    debug!(error = %e, "ping reset failed");
                }
            }
            return;
        }

        if msg.block1().is_some() {
            if msg.mtype == MessageType::Confirmable {
                match receive_block1(ctx, &mut inner, msg).await {
                    Ok(Some(complete)) => {
                        drop(inner);
                        self.fire(ctx, complete);
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "block acknowledgement failed"),
                }
            }
            return;
        }

        if msg.block2().is_some() {
            // Acknowledgements for an in-flight response push go to its
            // sender loop
            if msg.mtype == MessageType::Acknowledgement {
                if let Some(sender) = msg.sender {
                    let id = format!("{sender}{}", msg.token_hex());
                    if let Some(stream) = ctx.link.block2_streams.get(&id) {
                        let _ = stream.try_send(msg);
                    }
                }
            }
            return;
        }

        drop(inner);
        self.fire(ctx, msg);
    }

    /// Fire the handler path exactly once for this state.
    fn fire(self: &Arc<Self>, ctx: &DispatchCtx, msg: Message) {
        if self.handler_fired.swap(true, Ordering::SeqCst) {
            return;
        }

        // A registered waiter takes the message instead of a handler
        if ctx.link.stores.backward.has(&msg) {
            ctx.link.stores.backward.write(msg);
            return;
        }

        ctx.link.stores.local_states.delete(&ctx.state_key);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            dispatch(&ctx, msg).await;
        });
    }
}

/// Accumulate one upload block, acknowledging until the buffer is
/// complete. Returns the reassembled request once it is.
async fn receive_block1(
    ctx: &DispatchCtx,
    inner: &mut StateInner,
    mut msg: Message,
) -> Result<Option<Message>> {
    let Some(block) = msg.block1() else {
        return Ok(None);
    };
    let Some(sender) = msg.sender else {
        return Ok(None);
    };

    if !block.more {
        inner.total = Some(block.num as usize + 1);
    }
    inner.received.insert(block.num, std::mem::take(&mut msg.payload));

    if inner.total == Some(inner.received.len()) {
        let total = inner.received.len();
        let mut assembled = Vec::new();
        for i in 0..total as u32 {
            if let Some(chunk) = inner.received.get(&i) {
                assembled.extend_from_slice(chunk);
            }
        }
        msg.payload = assembled;
        msg.set_block1(BlockOption::new(total as u32 - 1, false, MAX_PAYLOAD_SIZE));
        return Ok(Some(msg));
    }

    let ack = match msg.option_uint(number::SELECTIVE_REPEAT_WINDOW_SIZE) {
        Some(w) => ack_with_window_offset(None, &msg, Code::CONTINUE, w, block.num, &inner.received),
        None => ack_to(None, &msg, Code::CONTINUE),
    };
    ctx.link.send_plain_to(&ack, sender).await?;
    Ok(None)
}

/// Look up the resource, run its handler, and send the response back.
async fn dispatch(ctx: &DispatchCtx, msg: Message) {
    let Some(sender) = msg.sender else { return };

    let mut response = match ctx.resources.lookup(&msg.uri_path(), msg.code) {
        None => ack_to(None, &msg, Code::NOT_FOUND),
        Some(handler) => match catch_unwind(AssertUnwindSafe(|| handler(&msg))) {
            Ok(result) => {
                let mut ack = ack_to(None, &msg, result.code);
                ack.payload = result.payload;
                ack
            }
            Err(_) => {
                warn!(path = %msg.uri_path(), "handler panicked");
                ack_to(None, &msg, Code::INTERNAL_SERVER_ERROR)
            }
        },
    };

    // Block-wise uploads expect their final descriptor echoed back
    if let Some(block) = msg.block1() {
        response.set_block1(block);
    }

    if let Err(e) = ctx.link.send_to_addr(&response, sender).await {
        warn!(error = %e, peer = %sender, "response send failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointConfig;
    use crate::resource::ResourceResult;
    use crate::store::Stores;
    use kelpie_transport::{Link, UdpLink};
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct Harness {
        ctx: DispatchCtx,
        state: Arc<LocalState>,
        calls: Arc<AtomicUsize>,
        seen: Arc<StdMutex<Vec<u8>>>,
        sender: SocketAddr,
    }

    async fn harness(path: &str, method: Code) -> Harness {
        let link = PeerLink::new(
            Arc::new(UdpLink::bind("127.0.0.1:0".parse().unwrap()).await.unwrap()),
            Stores::new(EndpointConfig::default()),
        );
        let resources = Arc::new(ResourceTable::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(StdMutex::new(Vec::new()));
        {
            let calls = calls.clone();
            let seen = seen.clone();
            resources.register(
                method,
                path,
                Arc::new(move |msg: &Message| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    *seen.lock().unwrap() = msg.payload.clone();
                    ResourceResult::changed(b"done".to_vec())
                }),
            );
        }
        // A throwaway socket so outbound acks have somewhere to go
        let sink = UdpLink::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let sender = sink.local_addr().unwrap();
        std::mem::forget(sink);
        Harness {
            ctx: DispatchCtx {
                link,
                resources,
                state_key: format!("{sender}aa"),
            },
            state: Arc::new(LocalState::default()),
            calls,
            seen,
            sender,
        }
    }

    fn block_message(sender: SocketAddr, path: &str, num: u32, more: bool, chunk: &[u8]) -> Message {
        let mut msg = Message::new(MessageType::Confirmable, Code::POST);
        msg.token = vec![0xAA];
        msg.sender = Some(sender);
        msg.set_uri_path(path);
        msg.set_block1(BlockOption::new(num, more, MAX_PAYLOAD_SIZE));
        msg.payload = chunk.to_vec();
        msg
    }

    async fn wait_for_calls(calls: &AtomicUsize, expected: usize) {
        for _ in 0..100 {
            if calls.load(Ordering::SeqCst) == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("handler ran {} times, expected {expected}", calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_reassembly_in_arrival_permutation() {
        let h = harness("/upload", Code::POST).await;
        let chunks: Vec<Vec<u8>> = (0..4u8).map(|i| vec![i; MAX_PAYLOAD_SIZE]).collect();

        // Deliberately scrambled arrival order, last block not final
        for num in [2u32, 0, 3, 1] {
            let msg = block_message(h.sender, "/upload", num, num != 3, &chunks[num as usize]);
            h.state.process(&h.ctx, msg).await;
        }

        wait_for_calls(&h.calls, 1).await;
        let seen = h.seen.lock().unwrap().clone();
        let expected: Vec<u8> = chunks.concat();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_handler_fires_once_for_duplicate_final_block() {
        let h = harness("/upload", Code::POST).await;

        let first = block_message(h.sender, "/upload", 0, true, &[1; 16]);
        let last = block_message(h.sender, "/upload", 1, false, &[2; 16]);
        h.state.process(&h.ctx, first).await;
        h.state.process(&h.ctx, last.clone()).await;
        // Retransmit of the final block races with completion
        h.state.process(&h.ctx, last).await;

        wait_for_calls(&h.calls, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_plain_message_fires_immediately() {
        let h = harness("/info", Code::GET).await;
        let mut msg = Message::new(MessageType::Confirmable, Code::GET);
        msg.token = vec![0xAA];
        msg.sender = Some(h.sender);
        msg.set_uri_path("/info");

        h.state.process(&h.ctx, msg.clone()).await;
        wait_for_calls(&h.calls, 1).await;

        // A duplicate of the same exchange does not re-fire
        h.state.process(&h.ctx, msg).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_backward_waiter_preempts_handler() {
        let h = harness("/info", Code::GET).await;

        let key = crate::backward::BackwardChannel::key("aa", h.sender);
        let stores = h.ctx.link.stores.clone();
        let reader =
            tokio::spawn(
                async move { stores.backward.read(&key, Duration::from_secs(1)).await },
            );
        tokio::task::yield_now().await;

        let mut msg = Message::new(MessageType::Acknowledgement, Code::CONTENT);
        msg.token = vec![0xAA];
        msg.sender = Some(h.sender);
        msg.payload = b"routed".to_vec();
        h.state.process(&h.ctx, msg).await;

        let routed = reader.await.unwrap().unwrap();
        assert_eq!(routed.payload, b"routed");
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_registry_entry_deleted_on_fire() {
        let h = harness("/info", Code::GET).await;
        h.ctx
            .link
            .stores
            .local_states
            .set(&h.ctx.state_key, h.state.clone());

        let mut msg = Message::new(MessageType::Confirmable, Code::GET);
        msg.token = vec![0xAA];
        msg.sender = Some(h.sender);
        msg.set_uri_path("/info");
        h.state.process(&h.ctx, msg).await;

        wait_for_calls(&h.calls, 1).await;
        assert!(h.ctx.link.stores.local_states.get(&h.ctx.state_key).is_none());
    }
}
