//! Accept loop — supervised connection workers for the chat server.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinSet};

use crate::session::{self, Disconnect, ServerCtx};

/// How long live sessions get to observe shutdown before being aborted.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Acceptor {
    listener: TcpListener,
    ctx: ServerCtx,
    shutdown: broadcast::Receiver<()>,
}

impl Acceptor {
    pub fn new(listener: TcpListener, ctx: ServerCtx) -> Self {
        let shutdown = ctx.shutdown.subscribe();
        Self {
            listener,
            ctx,
            shutdown,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until shutdown, then drain. Every worker belongs to the
    /// `JoinSet`: completions are reaped and logged here with their
    /// disconnect reason, and whatever is still running once the drain
    /// window closes is aborted rather than leaked.
    pub async fn run(mut self) {
        let mut workers: JoinSet<(SocketAddr, Disconnect)> = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        tracing::debug!(%addr, "connection accepted");
                        let ctx = self.ctx.clone();
                        workers.spawn(async move {
                            let reason = session::run_session(stream, addr, ctx).await;
                            (addr, reason)
                        });
                    }
                    Err(error) => {
                        // Transient accept failures (EMFILE and friends);
                        // the listener itself is still good.
                        tracing::warn!(%error, "accept failed");
                    }
                },
                Some(finished) = workers.join_next(), if !workers.is_empty() => {
                    reap(finished);
                }
                _ = self.shutdown.recv() => break,
            }
        }

        tracing::info!(active = workers.len(), "acceptor stopping, draining sessions");
        let drain = async {
            while let Some(finished) = workers.join_next().await {
                reap(finished);
            }
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            tracing::warn!(
                remaining = workers.len(),
                "drain window elapsed, aborting remaining sessions"
            );
            workers.abort_all();
        }
    }
}

fn reap(finished: Result<(SocketAddr, Disconnect), JoinError>) {
    match finished {
        Ok((addr, reason)) => match &reason {
            Disconnect::Protocol(_) | Disconnect::Transport(_) => {
                tracing::warn!(%addr, %reason, "session ended");
            }
            _ => tracing::info!(%addr, %reason, "session ended"),
        },
        Err(error) => tracing::error!(%error, "session task failed"),
    }
}
