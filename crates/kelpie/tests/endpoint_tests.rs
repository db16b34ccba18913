// End-to-end exchanges over loopback sockets: plain and encrypted
// requests, block-wise transfers in both directions, pings, proxying
// across transports, and the endpoint's own backward-channel sends.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kelpie::option::number;
use kelpie::{
    Client, Code, Endpoint, EndpointConfig, Message, MessageType, ResourceResult,
};

const UPLOAD_SIZE: usize = 102_400;
const BLOB_SIZE: usize = 50_000;

fn blob() -> Vec<u8> {
    (0..BLOB_SIZE).map(|i| (i % 251) as u8).collect()
}

/// Spawn a UDP listener for the endpoint and wait for its bound address.
async fn serve_udp(endpoint: &Arc<Endpoint>) -> SocketAddr {
    let task_endpoint = endpoint.clone();
    tokio::spawn(async move { task_endpoint.listen("127.0.0.1:0").await });
    for _ in 0..200 {
        if let Some(addr) = endpoint.local_addr() {
            return addr;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("endpoint never bound");
}

/// Spawn a TCP listener for the endpoint and wait for its bound address.
async fn serve_tcp(endpoint: &Arc<Endpoint>) -> SocketAddr {
    let task_endpoint = endpoint.clone();
    tokio::spawn(async move { task_endpoint.listen_tcp("127.0.0.1:0").await });
    for _ in 0..200 {
        if let Some(addr) = endpoint.tcp_local_addr() {
            return addr;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("endpoint never bound (tcp)");
}

/// An endpoint with the demonstration resources registered.
fn demo_endpoint() -> (Arc<Endpoint>, Arc<AtomicUsize>) {
    let endpoint = Arc::new(Endpoint::new(EndpointConfig::default()));
    let upload_calls = Arc::new(AtomicUsize::new(0));

    endpoint.get("/info", |_req| ResourceResult::content(b"ok".to_vec()));

    let calls = upload_calls.clone();
    endpoint.post("/testblock1", move |req| {
        calls.fetch_add(1, Ordering::SeqCst);
        if req.payload == vec![b'a'; UPLOAD_SIZE] {
            ResourceResult::changed(b"Hello from Kelpie!:)".to_vec())
        } else {
            ResourceResult::bad_request(b"unexpected upload".to_vec())
        }
    });

    endpoint.get("/bigblob", |_req| ResourceResult::content(blob()));

    endpoint.get("/panic", |_req| panic!("handler exploded"));

    (endpoint, upload_calls)
}

// ============================================================================
// Plain UDP exchanges
// ============================================================================

#[tokio::test]
async fn test_small_get() {
    let (endpoint, _) = demo_endpoint();
    let addr = serve_udp(&endpoint).await;

    let client = Client::new();
    let response = client.get(&format!("coap://{addr}/info")).await.unwrap();
    assert_eq!(response.code, Code::CONTENT);
    assert_eq!(response.body, b"ok");
}

#[tokio::test]
async fn test_unknown_resource_is_not_found() {
    let (endpoint, _) = demo_endpoint();
    let addr = serve_udp(&endpoint).await;

    let client = Client::new();
    let response = client.get(&format!("coap://{addr}/missing")).await.unwrap();
    assert_eq!(response.code, Code::NOT_FOUND);
}

#[tokio::test]
async fn test_handler_panic_becomes_server_error() {
    let (endpoint, _) = demo_endpoint();
    let addr = serve_udp(&endpoint).await;

    let client = Client::new();
    let response = client.get(&format!("coap://{addr}/panic")).await.unwrap();
    assert_eq!(response.code, Code::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_catch_all_resource() {
    let endpoint = Arc::new(Endpoint::new(EndpointConfig::default()));
    endpoint.get("*", |req| ResourceResult::content(req.uri_path().into_bytes()));
    let addr = serve_udp(&endpoint).await;

    let client = Client::new();
    let response = client
        .get(&format!("coap://{addr}/any/path/at/all"))
        .await
        .unwrap();
    assert_eq!(response.body, b"/any/path/at/all");
}

#[tokio::test]
async fn test_ping() {
    let (endpoint, _) = demo_endpoint();
    let addr = serve_udp(&endpoint).await;

    let client = Client::new();
    assert!(client.ping(&addr.to_string()).await.unwrap());
}

// ============================================================================
// Block-wise transfers
// ============================================================================

#[tokio::test]
async fn test_large_post_block1() {
    let (endpoint, upload_calls) = demo_endpoint();
    let addr = serve_udp(&endpoint).await;

    let payload = vec![b'a'; UPLOAD_SIZE];
    let client = Client::new();
    let response = client
        .post(&payload, &format!("coap://{addr}/testblock1"))
        .await
        .unwrap();

    assert_eq!(response.code, Code::CHANGED);
    assert_eq!(response.body, b"Hello from Kelpie!:)");
    // The handler saw the reassembled upload exactly once
    assert_eq!(upload_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_large_get_block2() {
    let (endpoint, _) = demo_endpoint();
    let addr = serve_udp(&endpoint).await;

    let client = Client::new();
    let response = client.get(&format!("coap://{addr}/bigblob")).await.unwrap();
    assert_eq!(response.code, Code::CONTENT);
    assert_eq!(response.body, blob());
}

#[tokio::test]
async fn test_large_roundtrip_block1_then_block2() {
    // A big request answered with a big response exercises both
    // directions on one token
    let endpoint = Arc::new(Endpoint::new(EndpointConfig::default()));
    endpoint.post("/echo", |req| ResourceResult::content(req.payload.clone()));
    let addr = serve_udp(&endpoint).await;

    let payload: Vec<u8> = (0..20_000).map(|i| (i % 253) as u8).collect();
    let client = Client::new();
    let response = client
        .post(&payload, &format!("coap://{addr}/echo"))
        .await
        .unwrap();
    assert_eq!(response.code, Code::CONTENT);
    assert_eq!(response.body, payload);
}

// ============================================================================
// Encrypted exchanges
// ============================================================================

#[tokio::test]
async fn test_secure_get_after_handshake() {
    let (endpoint, _) = demo_endpoint();
    let addr = serve_udp(&endpoint).await;

    let client = Client::new();
    let response = client.get(&format!("coaps://{addr}/info")).await.unwrap();
    assert_eq!(response.code, Code::CONTENT);
    assert_eq!(response.body, b"ok");
    // The exchange surfaced the peer's handshake identity
    assert!(response.peer_public_key.is_some());
}

#[tokio::test]
async fn test_secure_block1_upload() {
    let (endpoint, upload_calls) = demo_endpoint();
    let addr = serve_udp(&endpoint).await;

    let payload = vec![b'a'; UPLOAD_SIZE];
    let client = Client::new();
    let response = client
        .post(&payload, &format!("coaps://{addr}/testblock1"))
        .await
        .unwrap();
    assert_eq!(response.code, Code::CHANGED);
    assert_eq!(response.body, b"Hello from Kelpie!:)");
    assert_eq!(upload_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_secure_server_with_long_term_key() {
    let config = EndpointConfig::default().with_private_key(b"device secret".to_vec());
    let endpoint = Arc::new(Endpoint::new(config));
    endpoint.get("/info", |_req| ResourceResult::content(b"pinned".to_vec()));
    let addr = serve_udp(&endpoint).await;

    let client = Client::new();
    let first = client.get(&format!("coaps://{addr}/info")).await.unwrap();
    let second = client.get(&format!("coaps://{addr}/info")).await.unwrap();
    assert_eq!(first.body, b"pinned");
    // A static scalar presents the same identity to every handshake
    assert_eq!(first.peer_public_key, second.peer_public_key);
}

// ============================================================================
// TCP transport
// ============================================================================

#[tokio::test]
async fn test_tcp_get() {
    let (endpoint, _) = demo_endpoint();
    let addr = serve_tcp(&endpoint).await;

    let client = Client::new();
    let response = client.get(&format!("coap+tcp://{addr}/info")).await.unwrap();
    assert_eq!(response.code, Code::CONTENT);
    assert_eq!(response.body, b"ok");
}

#[tokio::test]
async fn test_tcp_block1_upload() {
    let (endpoint, upload_calls) = demo_endpoint();
    let addr = serve_tcp(&endpoint).await;

    let payload = vec![b'a'; UPLOAD_SIZE];
    let client = Client::new();
    let response = client
        .post(&payload, &format!("coap+tcp://{addr}/testblock1"))
        .await
        .unwrap();
    assert_eq!(response.code, Code::CHANGED);
    assert_eq!(upload_calls.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Backward channel
// ============================================================================

#[tokio::test]
async fn test_endpoint_send_uses_backward_channel() {
    let (server, _) = demo_endpoint();
    let server_addr = serve_udp(&server).await;

    let requester = Arc::new(Endpoint::new(EndpointConfig::default()));
    serve_udp(&requester).await;

    let mut msg = Message::new(MessageType::Confirmable, Code::GET);
    msg.set_uri_path("/info");
    let response = requester.send(&mut msg, server_addr).await.unwrap();
    assert_eq!(response.code, Code::CONTENT);
    assert_eq!(response.payload, b"ok");
}

// ============================================================================
// Proxying
// ============================================================================

#[tokio::test]
async fn test_proxy_roundtrip_udp() {
    let (device, _) = demo_endpoint();
    let device_addr = serve_udp(&device).await;

    let proxy = Arc::new(Endpoint::new(EndpointConfig::default()));
    proxy.enable_proxy(true);
    let proxy_addr = serve_udp(&proxy).await;

    let external = Arc::new(Endpoint::new(EndpointConfig::default()));
    serve_udp(&external).await;

    let mut msg = Message::new(MessageType::Confirmable, Code::GET);
    msg.set_uri_path("/info");
    msg.add_option(
        number::PROXY_URI,
        format!("coap://{device_addr}/info").into_bytes(),
    );
    let response = external.send(&mut msg, proxy_addr).await.unwrap();
    assert_eq!(response.code, Code::CONTENT);
    assert_eq!(response.payload, b"ok");
}

#[tokio::test]
async fn test_proxy_roundtrip_tcp_device() {
    // The device dials a long-lived TCP connection out to the relay and
    // serves requests arriving over it
    let proxy = Arc::new(Endpoint::new(EndpointConfig::default()));
    proxy.enable_proxy(true);
    let proxy_udp = serve_udp(&proxy).await;
    let proxy_tcp = serve_tcp(&proxy).await;

    let (device, _) = demo_endpoint();
    let stream = tokio::net::TcpStream::connect(proxy_tcp).await.unwrap();
    let device_addr = stream.local_addr().unwrap();
    {
        let device = device.clone();
        tokio::spawn(async move { device.serve_tcp(stream).await });
    }
    // Let the relay accept and register the device's connection
    tokio::time::sleep(Duration::from_millis(100)).await;

    let external = Arc::new(Endpoint::new(EndpointConfig::default()));
    serve_udp(&external).await;

    let mut msg = Message::new(MessageType::Confirmable, Code::GET);
    msg.set_uri_path("/info");
    msg.add_option(
        number::PROXY_URI,
        format!("coap+tcp://{device_addr}/info").into_bytes(),
    );
    let response = external.send(&mut msg, proxy_udp).await.unwrap();
    assert_eq!(response.code, Code::CONTENT);
    assert_eq!(response.payload, b"ok");
}

#[tokio::test]
async fn test_proxy_disabled_is_rejected() {
    let proxy = Arc::new(Endpoint::new(EndpointConfig::default()));
    let proxy_addr = serve_udp(&proxy).await;

    let external = Arc::new(Endpoint::new(EndpointConfig::default()));
    serve_udp(&external).await;

    let mut msg = Message::new(MessageType::Confirmable, Code::GET);
    msg.set_uri_path("/info");
    msg.add_option(number::PROXY_URI, b"coap://127.0.0.1:1/info".to_vec());
    let response = external.send(&mut msg, proxy_addr).await.unwrap();
    assert_eq!(response.code, Code::PROXYING_NOT_SUPPORTED);
}
