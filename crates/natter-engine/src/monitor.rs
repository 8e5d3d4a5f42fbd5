//! Heartbeat monitor — periodic liveness scans over the roster.

use std::time::Duration;

use tokio::sync::broadcast;

use crate::dispatch::Dispatcher;
use crate::roster::RosterKey;

/// Scan the roster every `interval` until shutdown: members idle for
/// more than twice `timeout` are evicted, everyone else gets a `PING`.
///
/// The doubled bound gives a connection that missed one probe a full
/// extra cycle to answer before it is dropped. Probe deliveries do not
/// count as liveness (only inbound traffic refreshes a member), and
/// monitor evictions are silent: no departure notice goes out for a
/// connection that just stopped answering.
pub async fn heartbeat_loop<K: RosterKey>(
    dispatcher: Dispatcher<K>,
    interval: Duration,
    timeout: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let evict_after = timeout * 2;
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = dispatcher.ping_sweep(evict_after).await;
                if !stats.evicted.is_empty() {
                    tracing::info!(
                        count = stats.evicted.len(),
                        names = ?stats.evicted,
                        "evicted unresponsive connections"
                    );
                }
                if stats.pinged > 0 {
                    tracing::debug!(pinged = stats.pinged, "heartbeat probes sent");
                }
            }
            _ = shutdown.recv() => {
                tracing::debug!("heartbeat monitor stopping");
                return;
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
