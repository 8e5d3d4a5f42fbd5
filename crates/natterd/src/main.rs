//! natterd — the broadcast chat server.
//!
//! Wiring only: the roster, dispatcher, heartbeat monitor, and accept
//! loop all come from natter-engine. This binary decides ports and
//! lifetimes and translates Ctrl-C into the shutdown broadcast.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use natter_core::NatterConfig;
use natter_engine::monitor;
use natter_engine::server::Acceptor;
use natter_engine::ServerCtx;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Err(error) = NatterConfig::write_default_if_missing() {
        tracing::warn!(%error, "failed to write default config");
    }
    let config = Arc::new(NatterConfig::load().unwrap_or_else(|error| {
        tracing::warn!(%error, "failed to load config, using defaults");
        NatterConfig::default()
    }));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
            }
            let _ = shutdown.send(());
        });
    }

    let ctx = ServerCtx::new(config.clone(), shutdown_tx.clone());

    let bind = format!("{}:{}", config.network.bind_host, config.network.chat_port);
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    let acceptor = Acceptor::new(listener, ctx.clone());
    tracing::info!(
        addr = %acceptor.local_addr()?,
        max_clients = config.limits.max_clients,
        heartbeat_secs = config.heartbeat.interval_secs,
        "natterd listening"
    );

    let monitor_task = tokio::spawn(monitor::heartbeat_loop(
        ctx.dispatcher.clone(),
        config.heartbeat.interval(),
        config.heartbeat.timeout(),
        shutdown_tx.subscribe(),
    ));
    let acceptor_task = tokio::spawn(acceptor.run());

    // Both tasks end on the shutdown broadcast; the acceptor is the
    // one that drains live sessions, so it goes first.
    if let Err(error) = acceptor_task.await {
        tracing::error!(%error, "acceptor task failed");
    }
    if let Err(error) = monitor_task.await {
        tracing::error!(%error, "heartbeat monitor task failed");
    }
    tracing::info!("natterd stopped");
    Ok(())
}
