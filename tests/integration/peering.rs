//! Peer-to-peer scenarios: two nodes in one process, linked over real
//! sockets, observed through their console event streams.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use natter_core::NatterConfig;
use natter_engine::peer::{self, DialError, PeerCtx, PeerEvent, PeerLink};
use natter_engine::Disconnect;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::*;

/// One peer node: listener running, console events captured.
struct TestPeer {
    ctx: PeerCtx,
    events: mpsc::UnboundedReceiver<PeerEvent>,
    addr: SocketAddr,
    shutdown: broadcast::Sender<()>,
    listener_task: JoinHandle<()>,
}

async fn spawn_peer(name: &str, config: NatterConfig) -> TestPeer {
    let (shutdown, _) = broadcast::channel(1);
    let (events_tx, events) = mpsc::unbounded_channel();
    let ctx = PeerCtx::new(
        Arc::new(config),
        name.to_string(),
        events_tx,
        shutdown.clone(),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let listener_task = tokio::spawn(peer::listen(listener, ctx.clone()));
    TestPeer {
        ctx,
        events,
        addr,
        shutdown,
        listener_task,
    }
}

impl TestPeer {
    async fn next_event(&mut self) -> PeerEvent {
        timeout(RECV_TIMEOUT, self.events.recv())
            .await
            .expect("no event within the receive window")
            .expect("event channel closed")
    }

    /// Skip events until a message containing `needle` arrives.
    async fn message_containing(&mut self, needle: &str) -> String {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            assert!(
                tokio::time::Instant::now() < deadline,
                "no message containing {needle:?}"
            );
            if let PeerEvent::Message { text, .. } = self.next_event().await {
                if text.contains(needle) {
                    return text;
                }
            }
        }
    }

    /// Skip events until a link closes.
    async fn left_event(&mut self) -> SocketAddr {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            assert!(tokio::time::Instant::now() < deadline, "no Left event");
            if let PeerEvent::Left { addr } = self.next_event().await {
                return addr;
            }
        }
    }

    async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = timeout(Duration::from_secs(5), self.listener_task).await;
    }
}

#[tokio::test]
async fn dialing_links_both_nodes_and_text_is_echoed() {
    let mut host = spawn_peer("hostnode", quiet_config()).await;
    let mut dialer = spawn_peer("dialnode", quiet_config()).await;

    let link = PeerLink::dial("127.0.0.1", host.addr.port(), dialer.ctx.clone())
        .await
        .unwrap();
    let link_addr = link.addr();
    let link_task = tokio::spawn(link.run());

    // The host learns the dialer's name from the introduction; the
    // dialer only ever knows the endpoint it typed.
    match host.next_event().await {
        PeerEvent::Joined { name, .. } => assert_eq!(name, "dialnode"),
        other => panic!("expected a join, got {other:?}"),
    }
    match dialer.next_event().await {
        PeerEvent::Joined { addr, name } => {
            assert_eq!(addr, link_addr);
            assert_eq!(name, format!("127.0.0.1:{}", host.addr.port()));
        }
        other => panic!("expected a join, got {other:?}"),
    }
    dialer.message_containing("welcome, dialnode").await;

    // Console text goes out through the dispatcher; the accept side
    // surfaces it and answers with an echo.
    let delivered = dialer.ctx.dispatcher.broadcast("hi from dialer", None).await;
    assert_eq!(delivered, 1);
    assert_eq!(
        host.message_containing("hi from dialer").await,
        "hi from dialer"
    );
    assert_eq!(
        dialer.message_containing("Echo:").await,
        "Echo: hi from dialer"
    );

    // Stopping the host notifies the link, which then sees the close.
    host.stop().await;
    dialer.message_containing("peer shutting down").await;
    let reason = timeout(Duration::from_secs(5), link_task)
        .await
        .unwrap()
        .unwrap();
    assert!(
        matches!(reason, Disconnect::EndOfStream),
        "got {reason:?}"
    );
    assert_eq!(dialer.left_event().await, link_addr);
    dialer.stop().await;
}

#[tokio::test]
async fn dialing_the_same_endpoint_twice_is_refused() {
    let host = spawn_peer("hostnode", quiet_config()).await;
    let dialer = spawn_peer("dialnode", quiet_config()).await;

    let link = PeerLink::dial("127.0.0.1", host.addr.port(), dialer.ctx.clone())
        .await
        .unwrap();
    let link_addr = link.addr();
    tokio::spawn(link.run());

    match PeerLink::dial("127.0.0.1", host.addr.port(), dialer.ctx.clone()).await {
        Err(DialError::AlreadyConnected { addr }) => assert_eq!(addr, link_addr),
        other => panic!(
            "expected AlreadyConnected, got {:?}",
            other.map(|l| l.addr())
        ),
    }
    assert_eq!(dialer.ctx.roster.len().await, 1);

    dialer.stop().await;
    host.stop().await;
}

#[tokio::test]
async fn inbound_links_beyond_capacity_are_turned_away() {
    let mut config = quiet_config();
    config.limits.max_peers = 1;
    let mut host = spawn_peer("hostnode", config).await;
    let first = spawn_peer("first", quiet_config()).await;
    let mut second = spawn_peer("second", quiet_config()).await;

    let link = PeerLink::dial("127.0.0.1", host.addr.port(), first.ctx.clone())
        .await
        .unwrap();
    tokio::spawn(link.run());
    match host.next_event().await {
        PeerEvent::Joined { name, .. } => assert_eq!(name, "first"),
        other => panic!("expected a join, got {other:?}"),
    }

    // The second dial succeeds locally; the refusal arrives over the
    // wire once the host declines to register the link.
    let link = PeerLink::dial("127.0.0.1", host.addr.port(), second.ctx.clone())
        .await
        .unwrap();
    let rejected_addr = link.addr();
    tokio::spawn(link.run());

    second.message_containing("peer limit reached").await;
    assert_eq!(second.left_event().await, rejected_addr);
    assert_eq!(host.ctx.roster.len().await, 1);

    first.stop().await;
    second.stop().await;
    host.stop().await;
}

#[tokio::test]
async fn hang_up_tears_down_both_ends() {
    let mut host = spawn_peer("hostnode", quiet_config()).await;
    let mut dialer = spawn_peer("dialnode", quiet_config()).await;

    let link = PeerLink::dial("127.0.0.1", host.addr.port(), dialer.ctx.clone())
        .await
        .unwrap();
    let link_addr = link.addr();
    tokio::spawn(link.run());
    host.next_event().await;
    dialer.next_event().await;

    assert!(peer::hang_up(&dialer.ctx, link_addr).await);
    assert_eq!(dialer.ctx.roster.len().await, 0);
    assert_eq!(dialer.left_event().await, link_addr);

    // The courtesy /quit walks the host through a normal close.
    host.left_event().await;
    assert_eq!(host.ctx.roster.len().await, 0);

    // Nothing left to hang up.
    assert!(!peer::hang_up(&dialer.ctx, link_addr).await);

    dialer.stop().await;
    host.stop().await;
}

/// The inbound side speaks the full link protocol, so a bare framed
/// client can drive it without a second node.
#[tokio::test]
async fn a_raw_client_can_drive_an_inbound_link() {
    let host = spawn_peer("hostnode", quiet_config()).await;

    let mut probe = TestClient::connect(host.addr).await.unwrap();
    probe.send("USERNAME:probe").await.unwrap();
    assert_eq!(
        probe.recv().await.unwrap(),
        "INFO: welcome, probe! connected to hostnode"
    );

    probe.send("/ping").await.unwrap();
    assert_eq!(probe.recv().await.unwrap(), "PONG");

    probe.send("/list").await.unwrap();
    let links = probe.recv().await.unwrap();
    assert!(links.starts_with("INFO: links: probe ("), "got {links:?}");

    probe.send("anyone home").await.unwrap();
    assert_eq!(probe.recv().await.unwrap(), "Echo: anyone home");

    probe.send("/quit").await.unwrap();
    assert_eq!(probe.recv().await.unwrap(), "INFO: disconnecting");
    assert_eq!(probe.recv_opt().await.unwrap(), None);

    host.stop().await;
}

#[tokio::test]
async fn link_flood_is_throttled_but_commands_still_echo() {
    let host = spawn_peer("hostnode", quiet_config()).await;
    let limit = host.ctx.config.rate.max_messages as usize;

    let mut noisy = TestClient::connect(host.addr).await.unwrap();
    noisy.send("USERNAME:noisy").await.unwrap();
    noisy.recv_until_contains("welcome").await.unwrap();

    // Saturate the window, then prove it is saturated.
    for i in 0..limit {
        noisy.send(&format!("flood {i}")).await.unwrap();
        assert_eq!(noisy.recv().await.unwrap(), format!("Echo: flood {i}"));
    }
    noisy.send("one more").await.unwrap();
    assert_eq!(
        noisy.recv().await.unwrap(),
        "ERROR: rate limit exceeded, message dropped"
    );

    // Control frames pass the saturated window, recognized or not.
    noisy.send("/bogus").await.unwrap();
    assert_eq!(noisy.recv().await.unwrap(), "Echo: /bogus");
    noisy.send("/ping").await.unwrap();
    assert_eq!(noisy.recv().await.unwrap(), "PONG");

    host.stop().await;
}

#[tokio::test]
async fn an_unnamed_link_gets_a_port_derived_name() {
    let mut host = spawn_peer("hostnode", quiet_config()).await;

    // A first frame with no recognized introduction still links; the
    // fallback name is derived from the remote port.
    let mut shy = TestClient::connect(host.addr).await.unwrap();
    shy.send("hello out there").await.unwrap();

    let (addr, name) = match host.next_event().await {
        PeerEvent::Joined { addr, name } => (addr, name),
        other => panic!("expected a join, got {other:?}"),
    };
    assert_eq!(name, format!("Peer_{}", addr.port()));
    assert_eq!(
        shy.recv().await.unwrap(),
        format!("INFO: welcome, {name}! connected to hostnode")
    );

    host.stop().await;
}
