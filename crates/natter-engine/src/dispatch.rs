//! Dispatcher — every outbound frame goes through here.
//!
//! Unicast, broadcast, and the heartbeat sweep each run inside a
//! single roster lock hold: snapshot, writes, and the eviction of any
//! member whose write failed are one atomic unit, so no delivery ever
//! races a registration or targets a writer being torn down.
//!
//! The flip side is head-of-line blocking: one receiver with a full
//! TCP send buffer stalls the whole sweep, and with it every other
//! roster operation, until its write completes or errors. That is the
//! accepted trade for a registry this simple; the eviction of dead
//! receivers keeps the stall bounded in practice.

use std::time::Instant;

use natter_core::{protocol, wire};

use crate::roster::{Roster, RosterKey};

/// Outcome of a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Target missing, or its write failed (in which case it has
    /// already been evicted).
    Failed,
}

/// What one heartbeat sweep did.
#[derive(Debug, Default)]
pub struct SweepStats {
    /// Probes written successfully.
    pub pinged: usize,
    /// Names evicted this sweep, silent or probe-failed.
    pub evicted: Vec<String>,
}

/// Delivery front-end over a [`Roster`]. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher<K> {
    roster: Roster<K>,
}

impl<K: RosterKey> Dispatcher<K> {
    pub fn new(roster: Roster<K>) -> Self {
        Self { roster }
    }

    pub fn roster(&self) -> &Roster<K> {
        &self.roster
    }

    /// Write one frame to one member. A write failure evicts the
    /// target before returning, so the next broadcast no longer sees
    /// it; the caller only learns `Failed`.
    pub async fn unicast(&self, key: &K, payload: &str) -> Delivery {
        let mut guard = self.roster.guard().await;
        let Some(member) = guard.members.get_mut(key) else {
            return Delivery::Failed;
        };
        match wire::write_frame(&mut member.writer, payload).await {
            Ok(()) => Delivery::Delivered,
            Err(error) => {
                tracing::debug!(target = %key, %error, "unicast failed, evicting receiver");
                guard.evict(key);
                Delivery::Failed
            }
        }
    }

    /// Write one frame to every member except `exclude`. Failed
    /// receivers are evicted within the same lock hold, after the
    /// delivery loop so one bad socket cannot starve the rest.
    /// Returns the number of successful deliveries.
    pub async fn broadcast(&self, payload: &str, exclude: Option<&K>) -> usize {
        let mut guard = self.roster.guard().await;
        let mut delivered = 0;
        let mut failed: Vec<K> = Vec::new();

        for (key, member) in guard.members.iter_mut() {
            if exclude == Some(key) {
                continue;
            }
            match wire::write_frame(&mut member.writer, payload).await {
                Ok(()) => delivered += 1,
                Err(error) => {
                    tracing::debug!(target = %key, %error, "broadcast delivery failed");
                    failed.push(key.clone());
                }
            }
        }
        for key in &failed {
            if let Some(name) = guard.evict(key) {
                tracing::info!(target = %key, name, "evicted after failed delivery");
            }
        }
        delivered
    }

    /// One heartbeat pass: members idle longer than `evict_after` are
    /// removed without a probe (a dead socket earns no more traffic),
    /// everyone else gets a `PING`. Probe write failures evict too.
    pub async fn ping_sweep(&self, evict_after: std::time::Duration) -> SweepStats {
        let mut guard = self.roster.guard().await;
        let now = Instant::now();
        let mut stale: Vec<K> = Vec::new();
        let mut probe_failed: Vec<K> = Vec::new();
        let mut pinged = 0;

        for (key, member) in guard.members.iter_mut() {
            if now.duration_since(member.last_heartbeat) > evict_after {
                stale.push(key.clone());
                continue;
            }
            match wire::write_frame(&mut member.writer, protocol::PING).await {
                Ok(()) => pinged += 1,
                Err(error) => {
                    tracing::debug!(target = %key, %error, "heartbeat probe failed");
                    probe_failed.push(key.clone());
                }
            }
        }

        let mut evicted = Vec::new();
        for key in stale.iter().chain(probe_failed.iter()) {
            if let Some(name) = guard.evict(key) {
                evicted.push(name);
            }
        }
        SweepStats { pinged, evicted }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
