//! Kelpie example server and client.
//!
//! Server mode registers a few demonstration resources (including
//! block-wise upload and download targets) and serves until interrupted.
//! Client mode exercises them against a running server.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use std::sync::Arc;
use tracing::info;

use kelpie::{Client, Endpoint, EndpointConfig, ResourceResult};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Server,
    Client,
}

/// Kelpie — encrypted CoAP endpoint with block-wise transfer
#[derive(Parser)]
#[command(name = "kelpie", version, about, long_about = None)]
struct Cli {
    /// Run as a server or as a client
    #[arg(long, value_enum, default_value = "server")]
    mode: Mode,

    /// Address to listen on (server) or connect to (client)
    #[arg(long, default_value = "127.0.0.1")]
    addr: String,

    /// Port to listen on or connect to
    #[arg(long, default_value_t = 5683)]
    port: u16,

    /// Use TCP framing instead of UDP datagrams
    #[arg(long)]
    tcp: bool,

    /// Use the encrypted scheme for client requests
    #[arg(long)]
    secure: bool,
}

const BLOB_SIZE: usize = 50_000;
const UPLOAD_SIZE: usize = 102_400;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.mode {
        Mode::Server => run_server(&cli).await,
        Mode::Client => run_client(&cli).await,
    }
}

async fn run_server(cli: &Cli) -> anyhow::Result<()> {
    let endpoint = Arc::new(Endpoint::new(EndpointConfig::default()));
    endpoint.enable_proxy(true);

    endpoint.get("/info", |_req| ResourceResult::content(b"ok".to_vec()));

    endpoint.post("/testblock1", |req| {
        if req.payload == vec![b'a'; UPLOAD_SIZE] {
            ResourceResult::changed(b"Hello from Kelpie!:)".to_vec())
        } else {
            ResourceResult::bad_request(b"unexpected upload".to_vec())
        }
    });

    endpoint.get("/bigblob", |_req| {
        let blob: Vec<u8> = (0..BLOB_SIZE).map(|i| (i % 251) as u8).collect();
        ResourceResult::content(blob)
    });

    endpoint.get("/mirror", |req| {
        ResourceResult::content(req.uri_path().into_bytes())
    });

    let addr = format!("{}:{}", cli.addr, cli.port);
    if cli.tcp {
        endpoint.listen_tcp(&addr).await.context("tcp listen")?;
    } else {
        endpoint.listen(&addr).await.context("udp listen")?;
    }
    Ok(())
}

async fn run_client(cli: &Cli) -> anyhow::Result<()> {
    let scheme = match (cli.secure, cli.tcp) {
        (false, false) => "coap",
        (true, false) => "coaps",
        (false, true) => "coap+tcp",
        (true, true) => "coaps+tcp",
    };
    let base = format!("{scheme}://{}:{}", cli.addr, cli.port);
    let client = Client::new();

    let response = client.get(&format!("{base}/info")).await.context("GET /info")?;
    info!(code = %response.code, body = %String::from_utf8_lossy(&response.body), "GET /info");

    let upload = vec![b'a'; UPLOAD_SIZE];
    let response = client
        .post(&upload, &format!("{base}/testblock1"))
        .await
        .context("POST /testblock1")?;
    info!(code = %response.code, body = %String::from_utf8_lossy(&response.body), "POST /testblock1");

    let response = client.get(&format!("{base}/bigblob")).await.context("GET /bigblob")?;
    anyhow::ensure!(
        response.body.len() == BLOB_SIZE,
        "short blob: {} bytes",
        response.body.len()
    );
    info!(code = %response.code, bytes = response.body.len(), "GET /bigblob");

    Ok(())
}
