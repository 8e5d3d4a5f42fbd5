//! Natter integration test harness.
//!
//! Everything runs in-process: each test spawns a real acceptor (and,
//! for the peer tests, real listeners) on an ephemeral loopback port
//! and drives it over actual TCP sockets with framed reads and
//! writes. No external processes and no fixed ports, so tests can run
//! in parallel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use natter_core::{wire, NatterConfig};
use natter_engine::server::Acceptor;
use natter_engine::ServerCtx;

mod liveness;
mod peering;
mod roster;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Bound on every framed read in tests.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Config with heartbeats parked far away, so only what a test asks
/// for ever fires.
pub fn quiet_config() -> NatterConfig {
    let mut config = NatterConfig::default();
    config.heartbeat.interval_secs = 3600;
    config.heartbeat.timeout_secs = 3600;
    config
}

/// A chat server running in-process on an ephemeral port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub ctx: ServerCtx,
    pub shutdown: broadcast::Sender<()>,
    acceptor: JoinHandle<()>,
}

pub async fn spawn_server(config: NatterConfig) -> TestServer {
    let (shutdown, _) = broadcast::channel(1);
    let ctx = ServerCtx::new(Arc::new(config), shutdown.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let acceptor = Acceptor::new(listener, ctx.clone());
    let addr = acceptor.local_addr().unwrap();
    let acceptor = tokio::spawn(acceptor.run());
    TestServer {
        addr,
        ctx,
        shutdown,
        acceptor,
    }
}

impl TestServer {
    /// Signal shutdown and wait for the acceptor to drain.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = timeout(Duration::from_secs(5), self.acceptor).await;
    }
}

/// A framed chat client for driving the server.
pub struct TestClient {
    pub reader: BufReader<OwnedReadHalf>,
    pub writer: OwnedWriteHalf,
    max_frame: usize,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Result<TestClient> {
        let stream = TcpStream::connect(addr).await.context("connect failed")?;
        let (read_half, writer) = stream.into_split();
        Ok(TestClient {
            reader: BufReader::new(read_half),
            writer,
            max_frame: wire::MAX_FRAME_BYTES,
        })
    }

    /// Connect, complete the setup handshake, and consume the welcome.
    pub async fn join(addr: SocketAddr, name: &str, aux_port: u16) -> Result<TestClient> {
        let mut client = TestClient::connect(addr).await?;
        client.send(&format!("SETUP:{name}:{aux_port}")).await?;
        let welcome = client.recv().await?;
        anyhow::ensure!(
            welcome.contains("welcome"),
            "expected welcome, got {welcome:?}"
        );
        Ok(client)
    }

    pub async fn send(&mut self, payload: &str) -> Result<()> {
        wire::write_frame(&mut self.writer, payload)
            .await
            .context("write failed")
    }

    /// Next frame, bounded; errs on timeout or a closed stream.
    pub async fn recv(&mut self) -> Result<String> {
        self.recv_opt()
            .await?
            .context("stream closed while a frame was expected")
    }

    /// Next frame or `None` at end of stream, bounded.
    pub async fn recv_opt(&mut self) -> Result<Option<String>> {
        let frame = timeout(RECV_TIMEOUT, wire::read_frame(&mut self.reader, self.max_frame))
            .await
            .context("no frame within the receive window")??;
        Ok(frame)
    }

    /// Read frames until one contains `needle`, within the usual bound.
    pub async fn recv_until_contains(&mut self, needle: &str) -> Result<String> {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            anyhow::ensure!(
                tokio::time::Instant::now() < deadline,
                "no frame containing {needle:?} arrived"
            );
            let frame = self.recv().await?;
            if frame.contains(needle) {
                return Ok(frame);
            }
        }
    }

    /// Assert nothing arrives within a short quiet window.
    pub async fn expect_silence(&mut self) {
        let res = timeout(
            Duration::from_millis(150),
            wire::read_frame(&mut self.reader, self.max_frame),
        )
        .await;
        assert!(res.is_err(), "expected silence, got {res:?}");
    }
}

// ── Smoke tests ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn server_welcomes_a_client() {
    let server = spawn_server(quiet_config()).await;

    let mut alice = TestClient::connect(server.addr).await.unwrap();
    alice.send("SETUP:alice:9100").await.unwrap();
    let welcome = alice.recv().await.unwrap();
    assert_eq!(welcome, "INFO: welcome, alice! Type /help for commands.");

    assert_eq!(server.ctx.roster.len().await, 1);
    server.stop().await;
}

#[tokio::test]
async fn shutdown_notifies_clients_and_closes() {
    let server = spawn_server(quiet_config()).await;
    let mut alice = TestClient::join(server.addr, "alice", 9100).await.unwrap();
    let mut bob = TestClient::join(server.addr, "bob", 9200).await.unwrap();
    alice.recv_until_contains("bob joined").await.unwrap();

    server.stop().await;

    let notice = alice.recv_until_contains("shutting down").await.unwrap();
    assert_eq!(notice, "INFO: server shutting down");
    bob.recv_until_contains("shutting down").await.unwrap();

    // Both streams end once the drain finishes.
    assert_eq!(alice.recv_opt().await.unwrap(), None);
    assert_eq!(bob.recv_opt().await.unwrap(), None);
}
