//! Chat-server sessions — one worker task per accepted connection.
//!
//! A session owns the read half of its socket; the write half lives in
//! the roster from registration onward, so every outbound frame
//! (replies to this client included) goes through the dispatcher. The
//! worker's job is the inbound direction: handshake, then a loop over
//! frames, the eviction wakeup, and shutdown.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Local;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use natter_core::protocol::{self, ServerCommand, Setup};
use natter_core::wire::{self, FrameError};
use natter_core::NatterConfig;

use crate::dispatch::{Delivery, Dispatcher};
use crate::limiter::RateDecision;
use crate::roster::{ConnId, Member, RegisterError, Roster};

/// Name used when the setup frame never supplied one.
const FALLBACK_NAME: &str = "Guest";

/// Host advertised in rendezvous replies. Fixed to loopback, as the
/// rendezvous exchange has always assumed peers beside their clients.
const RENDEZVOUS_HOST: &str = "127.0.0.1";

const HELP_TEXT: &str = "INFO: commands:\n  \
    /quit - leave the chat\n  \
    /list - who is connected\n  \
    /pm <name> <text> - private message\n  \
    /getpeer <name> - rendezvous endpoint for a user\n  \
    /peers - every advertised endpoint\n  \
    /help - this text";

// ── Worker results ────────────────────────────────────────────────────────────

/// Why a connection worker finished. Reaped and logged by the accept
/// loop's supervision.
#[derive(Debug)]
pub enum Disconnect {
    /// The client asked to leave.
    Quit,
    /// The remote closed, cleanly or mid-frame.
    EndOfStream,
    /// The remote violated the framing; the stream is unrecoverable.
    Protocol(FrameError),
    /// The transport failed underneath us.
    Transport(std::io::Error),
    /// Someone else removed us from the roster.
    Evicted,
    /// Never admitted: the roster was full.
    CapacityRejected,
    /// The process is going down.
    Shutdown,
}

impl fmt::Display for Disconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disconnect::Quit => write!(f, "client quit"),
            Disconnect::EndOfStream => write!(f, "end of stream"),
            Disconnect::Protocol(e) => write!(f, "protocol violation: {e}"),
            Disconnect::Transport(e) => write!(f, "transport error: {e}"),
            Disconnect::Evicted => write!(f, "evicted"),
            Disconnect::CapacityRejected => write!(f, "turned away at capacity"),
            Disconnect::Shutdown => write!(f, "server shutdown"),
        }
    }
}

/// A completed read, sorted into the cases the loops care about.
pub(crate) enum ReadOutcome {
    Frame(String),
    Eof,
    Protocol(FrameError),
    Transport(std::io::Error),
}

pub(crate) fn classify(res: Result<Option<String>, FrameError>) -> ReadOutcome {
    match res {
        Ok(Some(frame)) => ReadOutcome::Frame(frame),
        Ok(None) => ReadOutcome::Eof,
        Err(FrameError::Io(e)) => ReadOutcome::Transport(e),
        Err(e) => ReadOutcome::Protocol(e),
    }
}

// ── Shared server context ─────────────────────────────────────────────────────

/// Everything a session worker needs, cloned into each task. The
/// roster and dispatcher are handles onto shared state; nothing here
/// is global.
#[derive(Clone)]
pub struct ServerCtx {
    pub roster: Roster<ConnId>,
    pub dispatcher: Dispatcher<ConnId>,
    pub config: Arc<NatterConfig>,
    pub shutdown: broadcast::Sender<()>,
    next_id: Arc<AtomicU64>,
}

impl ServerCtx {
    pub fn new(config: Arc<NatterConfig>, shutdown: broadcast::Sender<()>) -> Self {
        let roster = Roster::new(config.limits.max_clients);
        let dispatcher = Dispatcher::new(roster.clone());
        Self {
            roster,
            dispatcher,
            config,
            shutdown,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn allocate_id(&self) -> ConnId {
        ConnId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

// ── Session lifecycle ─────────────────────────────────────────────────────────

/// Run one connection from accept to teardown. Always returns the
/// reason rather than erroring; the supervision loop logs it.
pub async fn run_session(stream: TcpStream, addr: SocketAddr, ctx: ServerCtx) -> Disconnect {
    let id = ctx.allocate_id();
    let max_frame = ctx.config.limits.max_frame_bytes;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    // ── Setup handshake ───────────────────────────────────────────────────────
    // The first frame gets a bounded wait. Whatever arrives is consumed
    // as setup; recognized or not, it is never replayed as chat.
    let first = match tokio::time::timeout(
        ctx.config.timeouts.setup(),
        wire::read_frame(&mut reader, max_frame),
    )
    .await
    {
        Ok(res) => res,
        Err(_) => {
            tracing::debug!(%addr, "no setup frame within the handshake window");
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
    let name = setup.name.unwrap_or_else(|| FALLBACK_NAME.to_string());
    let aux_port = setup.aux_port.unwrap_or(protocol::DEFAULT_AUX_PORT);

    // ── Registration ──────────────────────────────────────────────────────────
    let member = Member::new(name.clone(), aux_port, write_half);
    let closed = member.closed.clone();
    if let Err(err) = ctx.roster.register(id, member).await {
        return turn_away(err, addr).await;
    }
    tracing::info!(conn = %id, %addr, name = %name, "client joined");

    if reply(&ctx, id, &format!("INFO: welcome, {name}! Type /help for commands."))
        .await
        .is_some()
    {
        // The welcome write failed; the dispatcher already removed us.
        return Disconnect::Transport(std::io::ErrorKind::BrokenPipe.into());
    }
    ctx.dispatcher
        .broadcast(&format!("INFO: {name} joined the chat"), Some(&id))
        .await;

    // ── Active loop ───────────────────────────────────────────────────────────
    let mut shutdown = ctx.shutdown.subscribe();
    let reason = loop {
        tokio::select! {
            res = wire::read_frame(&mut reader, max_frame) => match classify(res) {
                ReadOutcome::Frame(frame) => {
                    if let Some(reason) = handle_frame(&ctx, id, &name, &frame).await {
                        break reason;
                    }
                }
                ReadOutcome::Eof => break Disconnect::EndOfStream,
                ReadOutcome::Protocol(e) => {
                    let _ = ctx
                        .dispatcher
                        .unicast(&id, &format!("{}{e}", protocol::ERROR_PREFIX))
                        .await;
                    break Disconnect::Protocol(e);
                }
                ReadOutcome::Transport(e) => break Disconnect::Transport(e),
            },
            _ = closed.notified() => break Disconnect::Evicted,
            _ = shutdown.recv() => {
                let _ = ctx.dispatcher.unicast(&id, "INFO: server shutting down").await;
                break Disconnect::Shutdown;
            }
        }
    };

    // ── Teardown ──────────────────────────────────────────────────────────────
    // The departure notice goes out before removal, and only when this
    // worker still owns its slot: an evicted member is already gone,
    // and shutdown skips the notice for every session at once.
    match &reason {
        Disconnect::Evicted => {}
        Disconnect::Shutdown => {
            ctx.roster.unregister(&id).await;
        }
        _ => {
            ctx.dispatcher
                .broadcast(&format!("INFO: {name} left the chat"), Some(&id))
                .await;
            ctx.roster.unregister(&id).await;
        }
    }
    reason
}

/// Final error frame and refusal for a connection that never made it
/// into the roster.
async fn turn_away(err: RegisterError, addr: SocketAddr) -> Disconnect {
    match err {
        RegisterError::Full { capacity, member } => {
            let mut writer = member.writer;
            let _ = wire::write_frame(&mut writer, "ERROR: server is full").await;
            tracing::info!(%addr, capacity, "connection turned away, no free slots");
        }
        RegisterError::Occupied { .. } => {
            tracing::error!(%addr, "connection id collision, turning away");
        }
    }
    Disconnect::CapacityRejected
}

// ── Frame handling ────────────────────────────────────────────────────────────

/// Process one inbound frame. `Some(reason)` ends the session.
async fn handle_frame(ctx: &ServerCtx, id: ConnId, name: &str, frame: &str) -> Option<Disconnect> {
    if frame.is_empty() {
        // An empty payload is the historical end-of-life marker.
        return Some(Disconnect::EndOfStream);
    }
    // Any inbound frame counts as liveness, PONG included.
    if !ctx.roster.touch(&id).await {
        return Some(Disconnect::Evicted);
    }
    if frame == protocol::PONG {
        return None;
    }
    match ServerCommand::parse(frame) {
        Some(cmd) => handle_command(ctx, id, name, cmd).await,
        None => handle_chat(ctx, id, name, frame).await,
    }
}

/// Plain chat text: rate-gate it, stamp it, fan it out.
async fn handle_chat(ctx: &ServerCtx, id: ConnId, name: &str, text: &str) -> Option<Disconnect> {
    let decision = ctx
        .roster
        .check_rate(
            &id,
            Instant::now(),
            ctx.config.rate.max_messages,
            ctx.config.rate.window(),
        )
        .await;
    match decision {
        None => Some(Disconnect::Evicted),
        Some(RateDecision::Reject) => {
            tracing::debug!(conn = %id, "rate limit hit, chat frame dropped");
            reply(ctx, id, "ERROR: rate limit exceeded, message dropped").await
        }
        Some(RateDecision::Admit) => {
            let stamped = format!("[{}] {name}: {text}", Local::now().format("%H:%M"));
            let delivered = ctx.dispatcher.broadcast(&stamped, Some(&id)).await;
            tracing::debug!(conn = %id, delivered, "chat frame relayed");
            None
        }
    }
}

/// Commands are exempt from rate limiting and answered directly.
async fn handle_command(
    ctx: &ServerCtx,
    id: ConnId,
    name: &str,
    cmd: ServerCommand,
) -> Option<Disconnect> {
    match cmd {
        ServerCommand::Quit => {
            let _ = ctx.dispatcher.unicast(&id, "INFO: disconnecting").await;
            Some(Disconnect::Quit)
        }
        ServerCommand::List => {
            let names = ctx.roster.names().await.join(", ");
            reply(ctx, id, &format!("INFO: connected users: {names}")).await
        }
        ServerCommand::Help => reply(ctx, id, HELP_TEXT).await,
        ServerCommand::Peers => {
            let entries = ctx.roster.entries().await;
            let listed: Vec<String> = entries
                .iter()
                .map(|e| format!("{}:{}:{}", e.name, RENDEZVOUS_HOST, e.aux_port))
                .collect();
            reply(ctx, id, &format!("INFO: peers: {}", listed.join(", "))).await
        }
        ServerCommand::GetPeer { name: target } => match ctx.roster.aux_port_of(&target).await {
            Some(port) => {
                let info = format!(
                    "{}{target}:{RENDEZVOUS_HOST}:{port}",
                    protocol::PEER_INFO_PREFIX
                );
                reply(ctx, id, &info).await
            }
            None => reply(ctx, id, &format!("ERROR: no such user: {target}")).await,
        },
        ServerCommand::Pm { to, text } => {
            let Some(target) = ctx.roster.find_by_name(&to).await else {
                return reply(ctx, id, &format!("ERROR: no such user: {to}")).await;
            };
            match ctx
                .dispatcher
                .unicast(&target, &format!("[PM from {name}] {text}"))
                .await
            {
                Delivery::Delivered => reply(ctx, id, &format!("INFO: pm sent to {to}")).await,
                Delivery::Failed => {
                    reply(ctx, id, &format!("ERROR: could not deliver to {to}")).await
                }
            }
        }
        ServerCommand::Malformed(usage) => {
            reply(ctx, id, &format!("{}{usage}", protocol::ERROR_PREFIX)).await
        }
        ServerCommand::Unknown => reply(ctx, id, "ERROR: unknown command, try /help").await,
    }
}

/// Send a frame back to this session's own client. A failed write
/// means the dispatcher has already evicted us, so surface it as a
/// transport loss.
async fn reply(ctx: &ServerCtx, id: ConnId, text: &str) -> Option<Disconnect> {
    match ctx.dispatcher.unicast(&id, text).await {
        Delivery::Delivered => None,
        Delivery::Failed => Some(Disconnect::Transport(std::io::ErrorKind::BrokenPipe.into())),
    }
}
