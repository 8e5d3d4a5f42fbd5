//! Heartbeat scenarios: probes go out, answers keep a member alive,
//! silence gets the member dropped without ceremony.

use natter_engine::monitor;

use crate::*;

/// One member answers every probe, the other goes quiet. The quiet one
/// is probed, then evicted with no departure notice; the responsive one
/// rides it out.
#[tokio::test]
async fn silent_member_is_dropped_and_responsive_member_survives() {
    let mut config = quiet_config();
    config.heartbeat.interval_secs = 1;
    config.heartbeat.timeout_secs = 1;
    let server = spawn_server(config).await;
    let monitor_task = tokio::spawn(monitor::heartbeat_loop(
        server.ctx.dispatcher.clone(),
        server.ctx.config.heartbeat.interval(),
        server.ctx.config.heartbeat.timeout(),
        server.shutdown.subscribe(),
    ));

    let mut keepalive = TestClient::join(server.addr, "keepalive", 9100).await.unwrap();
    let mut mute = TestClient::join(server.addr, "mute", 9200).await.unwrap();
    keepalive.recv_until_contains("mute joined").await.unwrap();

    // Answer probes from a side task. Anything other than a probe on
    // this stream would mean the eviction was announced.
    let responder = tokio::spawn(async move {
        while let Ok(Some(frame)) = keepalive.recv_opt().await {
            assert_eq!(frame, "PING", "unexpected frame {frame:?}");
            keepalive.send("PONG").await.unwrap();
        }
    });

    // The mute side sees only probes, then the close.
    loop {
        match mute.recv_opt().await.unwrap() {
            Some(frame) => assert_eq!(frame, "PING", "unexpected frame {frame:?}"),
            None => break,
        }
    }

    assert_eq!(server.ctx.roster.names().await, vec!["keepalive".to_string()]);

    responder.abort();
    if let Err(e) = responder.await {
        assert!(e.is_cancelled(), "responder failed: {e}");
    }
    server.stop().await;
    let _ = monitor_task.await;
}

/// Removing a member from the registry wakes its session worker at
/// once, with no traffic on the socket and no heartbeat running.
#[tokio::test]
async fn eviction_closes_the_connection_promptly_and_quietly() {
    let server = spawn_server(quiet_config()).await;
    let mut target = TestClient::join(server.addr, "target", 9100).await.unwrap();
    let mut witness = TestClient::join(server.addr, "witness", 9200).await.unwrap();
    target.recv_until_contains("witness joined").await.unwrap();

    let id = server
        .ctx
        .roster
        .find_by_name("target")
        .await
        .expect("target is registered");
    assert_eq!(
        server.ctx.roster.unregister(&id).await,
        Some("target".to_string())
    );

    // The worker is woken by the registry, not by a failed read.
    assert_eq!(target.recv_opt().await.unwrap(), None);

    // An eviction is not a departure: nobody gets a notice.
    witness.expect_silence().await;
    assert_eq!(server.ctx.roster.len().await, 1);
    server.stop().await;
}
