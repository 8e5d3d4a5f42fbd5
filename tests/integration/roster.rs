//! Registry-facing scenarios: capacity, ordering, rendezvous lookups,
//! and name hygiene.

use crate::*;

#[tokio::test]
async fn capacity_overflow_is_turned_away() {
    let mut config = quiet_config();
    config.limits.max_clients = 2;
    let server = spawn_server(config).await;

    let mut alice = TestClient::join(server.addr, "alice", 9100).await.unwrap();
    let _bob = TestClient::join(server.addr, "bob", 9200).await.unwrap();
    alice.recv_until_contains("bob joined").await.unwrap();

    let mut late = TestClient::connect(server.addr).await.unwrap();
    late.send("SETUP:late:9300").await.unwrap();
    assert_eq!(late.recv().await.unwrap(), "ERROR: server is full");
    assert_eq!(late.recv_opt().await.unwrap(), None);

    // The refusal never registered, so nobody heard a join.
    assert_eq!(server.ctx.roster.len().await, 2);
    alice.expect_silence().await;
    server.stop().await;
}

#[tokio::test]
async fn list_and_rendezvous_lookups_follow_registration_order() {
    let server = spawn_server(quiet_config()).await;
    let mut alice = TestClient::join(server.addr, "alice", 9100).await.unwrap();
    let _bob = TestClient::join(server.addr, "bob", 9200).await.unwrap();
    alice.recv_until_contains("bob joined").await.unwrap();

    alice.send("/list").await.unwrap();
    assert_eq!(
        alice.recv().await.unwrap(),
        "INFO: connected users: alice, bob"
    );

    alice.send("/getpeer bob").await.unwrap();
    assert_eq!(alice.recv().await.unwrap(), "PEER_INFO:bob:127.0.0.1:9200");

    alice.send("/getpeer ghost").await.unwrap();
    assert_eq!(alice.recv().await.unwrap(), "ERROR: no such user: ghost");

    alice.send("/peers").await.unwrap();
    assert_eq!(
        alice.recv().await.unwrap(),
        "INFO: peers: alice:127.0.0.1:9100, bob:127.0.0.1:9200"
    );
    server.stop().await;
}

#[tokio::test]
async fn duplicate_names_resolve_to_the_first_registrant() {
    let server = spawn_server(quiet_config()).await;
    let mut first = TestClient::join(server.addr, "dup", 9111).await.unwrap();
    let mut second = TestClient::join(server.addr, "dup", 9222).await.unwrap();
    let mut probe = TestClient::join(server.addr, "probe", 9300).await.unwrap();

    // Lookups land on the earliest holder of the name.
    probe.send("/getpeer dup").await.unwrap();
    let info = probe.recv_until_contains("PEER_INFO:").await.unwrap();
    assert_eq!(info, "PEER_INFO:dup:127.0.0.1:9111");

    probe.send("/pm dup which one").await.unwrap();
    assert_eq!(first.recv_until_contains("[PM").await.unwrap(), "[PM from probe] which one");
    probe.recv_until_contains("pm sent to dup").await.unwrap();
    second.recv_until_contains("probe joined").await.unwrap();
    second.expect_silence().await;

    // Once the first holder leaves, the name falls to the survivor.
    first.send("/quit").await.unwrap();
    probe.recv_until_contains("dup left the chat").await.unwrap();

    probe.send("/getpeer dup").await.unwrap();
    assert_eq!(
        probe.recv_until_contains("PEER_INFO:").await.unwrap(),
        "PEER_INFO:dup:127.0.0.1:9222"
    );
    server.stop().await;
}

#[tokio::test]
async fn names_are_trimmed_and_truncated() {
    let server = spawn_server(quiet_config()).await;

    let mut long = TestClient::connect(server.addr).await.unwrap();
    long.send("SETUP:abcdefghijklmnopqrstuvwxyz:9100")
        .await
        .unwrap();
    assert_eq!(
        long.recv().await.unwrap(),
        "INFO: welcome, abcdefghijklmnopqrst! Type /help for commands."
    );

    let mut spacey = TestClient::connect(server.addr).await.unwrap();
    spacey.send("SETUP:  spacey  :9200").await.unwrap();
    assert_eq!(
        spacey.recv().await.unwrap(),
        "INFO: welcome, spacey! Type /help for commands."
    );

    spacey.send("/list").await.unwrap();
    assert_eq!(
        spacey.recv().await.unwrap(),
        "INFO: connected users: abcdefghijklmnopqrst, spacey"
    );
    server.stop().await;
}
