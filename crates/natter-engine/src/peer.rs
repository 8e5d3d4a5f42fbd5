//! Peer links — connection handling for the symmetric node.
//!
//! Same roster, dispatcher, and monitor as the chat server, keyed by
//! remote address instead of connection id. A node accepts links on
//! its listen port and dials links outward; the two differ only at
//! the edges (who introduces itself, who echoes) and run the same
//! read loop afterwards. There is no central relay: text arriving on
//! a link goes to this node's console, not to the other links.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::BufReader;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinSet;

use natter_core::protocol::{self, LinkCommand, Setup};
use natter_core::wire;
use natter_core::NatterConfig;

use crate::dispatch::{Delivery, Dispatcher};
use crate::limiter::RateDecision;
use crate::roster::{Member, RegisterError, Roster};
use crate::session::{classify, Disconnect, ReadOutcome};

/// How long live links get to observe shutdown before being aborted.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

// ── Events and context ────────────────────────────────────────────────────────

/// What links surface to the node's console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Joined { addr: SocketAddr, name: String },
    Left { addr: SocketAddr },
    Message { addr: SocketAddr, text: String },
}

/// Shared handles for one peer node, cloned into every link worker.
#[derive(Clone)]
pub struct PeerCtx {
    pub roster: Roster<SocketAddr>,
    pub dispatcher: Dispatcher<SocketAddr>,
    pub config: Arc<NatterConfig>,
    pub username: Arc<str>,
    pub events: mpsc::UnboundedSender<PeerEvent>,
    pub shutdown: broadcast::Sender<()>,
}

impl PeerCtx {
    pub fn new(
        config: Arc<NatterConfig>,
        username: String,
        events: mpsc::UnboundedSender<PeerEvent>,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        let roster = Roster::new(config.limits.max_peers);
        let dispatcher = Dispatcher::new(roster.clone());
        Self {
            roster,
            dispatcher,
            config,
            username: username.into(),
            events,
            shutdown,
        }
    }
}

/// Why an outbound dial produced no link.
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("already connected to {addr}")]
    AlreadyConnected { addr: SocketAddr },

    #[error("no address found for {endpoint}")]
    Resolve { endpoint: String },

    #[error("connect to {addr} timed out")]
    Timeout { addr: SocketAddr },

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("peer limit reached ({capacity} links)")]
    PeerLimit { capacity: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkOrigin {
    /// We accepted it: we own the echo and the rate limit.
    Inbound,
    /// We dialed it: inbound text is display-only.
    Outbound,
}

/// Resolve `host:port` to its first address, the same way `dial` does.
pub async fn resolve(host: &str, port: u16) -> Option<SocketAddr> {
    lookup_host((host, port)).await.ok().and_then(|mut a| a.next())
}

// ── Links ─────────────────────────────────────────────────────────────────────

/// An established link, ready to run its read loop.
pub struct PeerLink {
    ctx: PeerCtx,
    addr: SocketAddr,
    reader: BufReader<OwnedReadHalf>,
    origin: LinkOrigin,
    name: String,
    closed: Arc<Notify>,
}

impl PeerLink {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Dial out, introduce ourselves, and register the link.
    pub async fn dial(host: &str, port: u16, ctx: PeerCtx) -> Result<PeerLink, DialError> {
        let addr = resolve(host, port).await.ok_or_else(|| DialError::Resolve {
            endpoint: format!("{host}:{port}"),
        })?;

        // Refuse to dial a link we already hold (the usual repeated
        // /connect) before doing any network work.
        if ctx.roster.contains(&addr).await {
            return Err(DialError::AlreadyConnected { addr });
        }

        let connect = TcpStream::connect(addr);
        let stream = match tokio::time::timeout(ctx.config.timeouts.connect(), connect).await {
            Err(_) => return Err(DialError::Timeout { addr }),
            Ok(Err(source)) => return Err(DialError::Connect { addr, source }),
            Ok(Ok(stream)) => stream,
        };
        let (read_half, mut write_half) = stream.into_split();
        wire::write_frame(
            &mut write_half,
            &format!("{}{}", protocol::USERNAME_PREFIX, ctx.username),
        )
        .await
        .map_err(|source| DialError::Connect { addr, source })?;

        // No name protocol flows back on a dialed link; the endpoint
        // is the best name we will ever have for it.
        let name = format!("{host}:{port}");
        let member = Member::new(name.clone(), port, write_half);
        let closed = member.closed.clone();
        match ctx.roster.register(addr, member).await {
            Ok(()) => {}
            Err(RegisterError::Full { capacity, .. }) => {
                return Err(DialError::PeerLimit { capacity })
            }
            Err(RegisterError::Occupied { .. }) => {
                return Err(DialError::AlreadyConnected { addr })
            }
        }
        tracing::info!(%addr, "peer link established (outbound)");
        let _ = ctx.events.send(PeerEvent::Joined {
            addr,
            name: name.clone(),
        });
        Ok(PeerLink {
            ctx,
            addr,
            reader: BufReader::new(read_half),
            origin: LinkOrigin::Outbound,
            name,
            closed,
        })
    }

    /// Read until the link ends, then clean up. Spawn this.
    pub async fn run(mut self) -> Disconnect {
        let reason = run_loop(
            &self.ctx,
            self.addr,
            &mut self.reader,
            self.origin,
            self.closed.clone(),
        )
        .await;
        finish(&self.ctx, self.addr, &self.name, reason).await
    }
}

/// Accept-side handshake and read loop for one inbound link.
pub async fn accept_link(stream: TcpStream, addr: SocketAddr, ctx: PeerCtx) -> Disconnect {
    let max_frame = ctx.config.limits.max_frame_bytes;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    // The dialer introduces itself first; give it a bounded wait.
    let first = match tokio::time::timeout(
        ctx.config.timeouts.setup(),
        wire::read_frame(&mut reader, max_frame),
    )
    .await
    {
        Ok(res) => res,
        Err(_) => {
            tracing::debug!(%addr, "peer sent no introduction, closing");
            return Disconnect::EndOfStream;
        }
    };
    let setup = match classify(first) {
        ReadOutcome::Frame(frame) => Setup::parse(&frame),
        ReadOutcome::Eof => return Disconnect::EndOfStream,
        ReadOutcome::Protocol(e) => {
            let _ = wire::write_frame(&mut write_half, &format!("{}{e}", protocol::ERROR_PREFIX))
                .await;
            return Disconnect::Protocol(e);
        }
        ReadOutcome::Transport(e) => return Disconnect::Transport(e),
    };
    let name = setup
        .name
        .unwrap_or_else(|| format!("Peer_{}", addr.port()));
    let aux_port = setup.aux_port.unwrap_or(protocol::DEFAULT_AUX_PORT);

    let member = Member::new(name.clone(), aux_port, write_half);
    let closed = member.closed.clone();
    match ctx.roster.register(addr, member).await {
        Ok(()) => {}
        Err(RegisterError::Full { capacity, member }) => {
            let mut writer = member.writer;
            let _ = wire::write_frame(&mut writer, "ERROR: peer limit reached").await;
            tracing::info!(%addr, capacity, "peer turned away, no free links");
            return Disconnect::CapacityRejected;
        }
        Err(RegisterError::Occupied { .. }) => {
            tracing::error!(%addr, "address already linked, refusing");
            return Disconnect::CapacityRejected;
        }
    }
    tracing::info!(%addr, name = %name, "peer link established (inbound)");
    let _ = ctx.events.send(PeerEvent::Joined {
        addr,
        name: name.clone(),
    });
    let _ = ctx
        .dispatcher
        .unicast(
            &addr,
            &format!("INFO: welcome, {name}! connected to {}", ctx.username),
        )
        .await;

    let reason = run_loop(&ctx, addr, &mut reader, LinkOrigin::Inbound, closed).await;
    finish(&ctx, addr, &name, reason).await
}

/// Accept inbound links until shutdown. Mirrors the chat server's
/// acceptor: workers live in a supervised set and are drained, then
/// aborted, on the way out.
pub async fn listen(listener: TcpListener, ctx: PeerCtx) {
    let mut shutdown = ctx.shutdown.subscribe();
    let mut workers: JoinSet<Disconnect> = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    tracing::debug!(%addr, "inbound peer connection");
                    workers.spawn(accept_link(stream, addr, ctx.clone()));
                }
                Err(error) => tracing::warn!(%error, "peer accept failed"),
            },
            Some(finished) = workers.join_next(), if !workers.is_empty() => {
                // Links log their own close reason; only panics matter here.
                if let Err(error) = finished {
                    tracing::error!(%error, "link task failed");
                }
            }
            _ = shutdown.recv() => break,
        }
    }

    tracing::info!(active = workers.len(), "peer listener stopping, draining links");
    let drain = async {
        while let Some(finished) = workers.join_next().await {
            if let Err(error) = finished {
                tracing::error!(%error, "link task failed");
            }
        }
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!(
            remaining = workers.len(),
            "drain window elapsed, aborting remaining links"
        );
        workers.abort_all();
    }
}

/// Console-initiated teardown of one link: a courtesy `/quit` to the
/// remote, then removal, which also wakes the link's worker. Returns
/// false when no such link exists.
pub async fn hang_up(ctx: &PeerCtx, addr: SocketAddr) -> bool {
    if !ctx.roster.contains(&addr).await {
        return false;
    }
    let _ = ctx.dispatcher.unicast(&addr, "/quit").await;
    ctx.roster.unregister(&addr).await.is_some()
}

// ── Link loop ─────────────────────────────────────────────────────────────────

async fn run_loop(
    ctx: &PeerCtx,
    addr: SocketAddr,
    reader: &mut BufReader<OwnedReadHalf>,
    origin: LinkOrigin,
    closed: Arc<Notify>,
) -> Disconnect {
    let mut shutdown = ctx.shutdown.subscribe();
    let max_frame = ctx.config.limits.max_frame_bytes;
    loop {
        tokio::select! {
            res = wire::read_frame(reader, max_frame) => match classify(res) {
                ReadOutcome::Frame(frame) => {
                    if let Some(reason) = handle_link_frame(ctx, addr, origin, &frame).await {
                        return reason;
                    }
                }
                ReadOutcome::Eof => return Disconnect::EndOfStream,
                ReadOutcome::Protocol(e) => {
                    let _ = ctx
                        .dispatcher
                        .unicast(&addr, &format!("{}{e}", protocol::ERROR_PREFIX))
                        .await;
                    return Disconnect::Protocol(e);
                }
                ReadOutcome::Transport(e) => return Disconnect::Transport(e),
            },
            _ = closed.notified() => return Disconnect::Evicted,
            _ = shutdown.recv() => {
                let _ = ctx.dispatcher.unicast(&addr, "INFO: peer shutting down").await;
                return Disconnect::Shutdown;
            }
        }
    }
}

async fn handle_link_frame(
    ctx: &PeerCtx,
    addr: SocketAddr,
    origin: LinkOrigin,
    frame: &str,
) -> Option<Disconnect> {
    if frame.is_empty() {
        return Some(Disconnect::EndOfStream);
    }
    if !ctx.roster.touch(&addr).await {
        return Some(Disconnect::Evicted);
    }
    if frame == protocol::PONG {
        return None;
    }
    if frame == protocol::PING {
        return link_reply(ctx, addr, protocol::PONG).await;
    }
    match LinkCommand::parse(frame) {
        Some(LinkCommand::Quit) => {
            let _ = ctx.dispatcher.unicast(&addr, "INFO: disconnecting").await;
            Some(Disconnect::Quit)
        }
        Some(LinkCommand::Ping) => link_reply(ctx, addr, protocol::PONG).await,
        Some(LinkCommand::List) => {
            let entries = ctx.roster.entries().await;
            let listed: Vec<String> = entries
                .iter()
                .map(|e| format!("{} ({})", e.name, e.key))
                .collect();
            let text = if listed.is_empty() {
                "INFO: no links".to_string()
            } else {
                format!("INFO: links: {}", listed.join(", "))
            };
            link_reply(ctx, addr, &text).await
        }
        // An unrecognized command is still a control frame: exempt
        // from the rate window, echoed back by the accept side.
        Some(LinkCommand::Unknown) => match origin {
            LinkOrigin::Inbound => link_reply(ctx, addr, &format!("Echo: {frame}")).await,
            LinkOrigin::Outbound => {
                let _ = ctx.events.send(PeerEvent::Message {
                    addr,
                    text: frame.to_string(),
                });
                None
            }
        },
        None => handle_text(ctx, addr, origin, frame).await,
    }
}

async fn handle_text(
    ctx: &PeerCtx,
    addr: SocketAddr,
    origin: LinkOrigin,
    text: &str,
) -> Option<Disconnect> {
    if origin == LinkOrigin::Inbound {
        // The accept side owns the rate limit, like the chat server
        // does for its clients.
        let decision = ctx
            .roster
            .check_rate(
                &addr,
                Instant::now(),
                ctx.config.rate.max_messages,
                ctx.config.rate.window(),
            )
            .await;
        match decision {
            None => return Some(Disconnect::Evicted),
            Some(RateDecision::Reject) => {
                tracing::debug!(%addr, "rate limit hit, dropping peer text");
                return link_reply(ctx, addr, "ERROR: rate limit exceeded, message dropped").await;
            }
            Some(RateDecision::Admit) => {}
        }
    }
    let _ = ctx.events.send(PeerEvent::Message {
        addr,
        text: text.to_string(),
    });
    if origin == LinkOrigin::Inbound {
        return link_reply(ctx, addr, &format!("Echo: {text}")).await;
    }
    None
}

/// Write back to the link's own remote; a failure means the
/// dispatcher evicted it already.
async fn link_reply(ctx: &PeerCtx, addr: SocketAddr, text: &str) -> Option<Disconnect> {
    match ctx.dispatcher.unicast(&addr, text).await {
        Delivery::Delivered => None,
        Delivery::Failed => Some(Disconnect::Transport(std::io::ErrorKind::BrokenPipe.into())),
    }
}

async fn finish(ctx: &PeerCtx, addr: SocketAddr, name: &str, reason: Disconnect) -> Disconnect {
    // An evicted link was already removed by whoever evicted it.
    if !matches!(reason, Disconnect::Evicted) {
        ctx.roster.unregister(&addr).await;
    }
    let _ = ctx.events.send(PeerEvent::Left { addr });
    tracing::info!(%addr, name, reason = %reason, "peer link closed");
    reason
}

// ── Tests ─────────────────────────────────────────────────────────────────────
