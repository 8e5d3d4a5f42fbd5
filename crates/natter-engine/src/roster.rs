//! Connection roster — the single synchronization domain.
//!
//! Every piece of shared connection state lives in one mutex-guarded
//! map: identity, the write half of the socket, liveness bookkeeping,
//! and the rate window. One lock means compound operations (register
//! if below capacity, sweep and evict) are atomic by construction, and
//! there is no second lock to order against. The cost is that whoever
//! holds the roster holds it for everyone; writes done under it (see
//! `dispatch`) serialize delivery.
//!
//! The roster is generic over its key: the chat server keys members by
//! [`ConnId`], the peer application by remote `SocketAddr`.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, MutexGuard, Notify};

use crate::limiter::{RateDecision, RateWindow};

/// Bound required of roster keys. Blanket-implemented; both `ConnId`
/// and `SocketAddr` qualify.
pub trait RosterKey: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static {}

impl<T> RosterKey for T where T: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static {}

// ── Keys and members ──────────────────────────────────────────────────────────

/// Server-side connection identifier, allocated sequentially by the
/// accept loop. Names may collide; this never does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn{}", self.0)
    }
}

/// One registered connection.
///
/// Owns the write half of the socket: dropping a `Member` sends FIN,
/// so removal from the roster and transport teardown are the same
/// event. The read half stays with the connection's worker task.
#[derive(Debug)]
pub struct Member {
    /// Display name, already truncated. Not unique.
    pub name: String,
    /// Advertised rendezvous port for direct peer connections.
    pub aux_port: u16,
    /// Last moment any frame arrived from this connection.
    pub last_heartbeat: Instant,
    /// Chat-rate counting state.
    pub window: RateWindow,
    /// Outbound half of the socket. All writes go through the roster
    /// lock, never directly.
    pub writer: OwnedWriteHalf,
    /// Signalled (with a stored permit) when the member is removed by
    /// someone other than its own worker, so the worker stops reading.
    pub closed: Arc<Notify>,
    /// Registration order, for first-registrant-wins name lookup.
    pub(crate) seq: u64,
}

impl Member {
    pub fn new(name: String, aux_port: u16, writer: OwnedWriteHalf) -> Self {
        let now = Instant::now();
        Self {
            name,
            aux_port,
            last_heartbeat: now,
            window: RateWindow::new(now),
            writer,
            closed: Arc::new(Notify::new()),
            seq: 0,
        }
    }
}

/// Point-in-time view of one member, for `/list`-style output.
#[derive(Debug, Clone)]
pub struct RosterEntry<K> {
    pub key: K,
    pub name: String,
    pub aux_port: u16,
    pub idle: Duration,
}

/// Registration refusal. Carries the member back so the caller can
/// still write a final error frame before the socket closes.
#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("registry is full ({capacity} connections)")]
    Full { capacity: usize, member: Member },

    #[error("endpoint already registered")]
    Occupied { member: Member },
}

// ── The roster ────────────────────────────────────────────────────────────────

pub(crate) struct RosterInner<K> {
    pub(crate) members: HashMap<K, Member>,
    next_seq: u64,
}

impl<K: RosterKey> RosterInner<K> {
    /// Remove a member, wake its worker, and drop its writer. Returns
    /// the display name, or `None` if the key was already gone.
    pub(crate) fn evict(&mut self, key: &K) -> Option<String> {
        let member = self.members.remove(key)?;
        member.closed.notify_one();
        Some(member.name)
    }
}

/// Shared handle to the roster. Cheap to clone; all clones see the
/// same map and the same lock.
#[derive(Clone)]
pub struct Roster<K> {
    inner: Arc<Mutex<RosterInner<K>>>,
    capacity: usize,
}

impl<K: RosterKey> Roster<K> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RosterInner {
                members: HashMap::new(),
                next_seq: 0,
            })),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lock the map for a compound operation. Crate-internal: the
    /// dispatcher's delivery sweeps need member writers directly.
    pub(crate) async fn guard(&self) -> MutexGuard<'_, RosterInner<K>> {
        self.inner.lock().await
    }

    /// Admit a connection if there is room and the key is free. Both
    /// checks and the insert happen under one lock hold, so capacity
    /// can never be exceeded by racing admissions.
    pub async fn register(&self, key: K, mut member: Member) -> Result<(), RegisterError> {
        let mut guard = self.inner.lock().await;
        let RosterInner { members, next_seq } = &mut *guard;
        if members.len() >= self.capacity {
            return Err(RegisterError::Full {
                capacity: self.capacity,
                member,
            });
        }
        match members.entry(key) {
            Entry::Occupied(_) => Err(RegisterError::Occupied { member }),
            Entry::Vacant(slot) => {
                member.seq = *next_seq;
                *next_seq += 1;
                slot.insert(member);
                Ok(())
            }
        }
    }

    /// Remove a connection. Idempotent: removing an absent key is a
    /// quiet no-op, so a worker's own cleanup and a concurrent eviction
    /// cannot double-fault. Returns the member's name when it was
    /// actually present.
    pub async fn unregister(&self, key: &K) -> Option<String> {
        self.inner.lock().await.evict(key)
    }

    pub async fn contains(&self, key: &K) -> bool {
        self.inner.lock().await.members.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.members.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.members.is_empty()
    }

    /// Display names in registration order.
    pub async fn names(&self) -> Vec<String> {
        let guard = self.inner.lock().await;
        let mut named: Vec<(u64, String)> = guard
            .members
            .values()
            .map(|m| (m.seq, m.name.clone()))
            .collect();
        named.sort_by_key(|(seq, _)| *seq);
        named.into_iter().map(|(_, name)| name).collect()
    }

    /// Snapshot of every member, in registration order.
    pub async fn entries(&self) -> Vec<RosterEntry<K>> {
        let guard = self.inner.lock().await;
        let now = Instant::now();
        let mut rows: Vec<(u64, RosterEntry<K>)> = guard
            .members
            .iter()
            .map(|(key, m)| {
                (
                    m.seq,
                    RosterEntry {
                        key: key.clone(),
                        name: m.name.clone(),
                        aux_port: m.aux_port,
                        idle: now.duration_since(m.last_heartbeat),
                    },
                )
            })
            .collect();
        rows.sort_by_key(|(seq, _)| *seq);
        rows.into_iter().map(|(_, entry)| entry).collect()
    }

    /// Resolve a display name to a key. Names are not unique; the
    /// earliest surviving registrant wins, matching how the `/pm` and
    /// `/getpeer` lookups have always behaved.
    pub async fn find_by_name(&self, name: &str) -> Option<K> {
        let guard = self.inner.lock().await;
        guard
            .members
            .iter()
            .filter(|(_, m)| m.name == name)
            .min_by_key(|(_, m)| m.seq)
            .map(|(key, _)| key.clone())
    }

    /// Advertised rendezvous port of the earliest registrant under
    /// `name`, in one lock hold.
    pub async fn aux_port_of(&self, name: &str) -> Option<u16> {
        let guard = self.inner.lock().await;
        guard
            .members
            .values()
            .filter(|m| m.name == name)
            .min_by_key(|m| m.seq)
            .map(|m| m.aux_port)
    }

    /// Mark the connection live now. Returns false when the key is
    /// already gone (evicted under the worker's feet).
    pub async fn touch(&self, key: &K) -> bool {
        let mut guard = self.inner.lock().await;
        match guard.members.get_mut(key) {
            Some(m) => {
                m.last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Count one chat message against the member's rate window and
    /// return the decision, atomically with the lookup. `None` means
    /// the member is gone.
    pub async fn check_rate(
        &self,
        key: &K,
        now: Instant,
        limit: u32,
        window: Duration,
    ) -> Option<RateDecision> {
        let mut guard = self.inner.lock().await;
        guard
            .members
            .get_mut(key)
            .map(|m| m.window.check(now, limit, window))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
