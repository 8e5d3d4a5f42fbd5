//! natter-peer — symmetric messaging node with a console.
//!
//! One process is listener, dialer, and terminal at once: inbound
//! links arrive on the listen port, outbound links open on /connect,
//! and everything any link surfaces lands on stdout through the event
//! channel. There is no relay between links.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

use natter_core::protocol::{self, ConsoleCommand};
use natter_core::NatterConfig;
use natter_engine::monitor;
use natter_engine::peer::{self, PeerCtx, PeerEvent, PeerLink};
use natter_engine::{Delivery, Disconnect};

const CONSOLE_HELP: &str = "commands:\n  \
    /connect <host> <port> - open a link\n  \
    /list - show links\n  \
    /send <host> <port> <text> - message one link\n  \
    /broadcast <text> - message every link (bare text does too)\n  \
    /disconnect <host> <port> - close a link\n  \
    /quit - exit";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Arc::new(NatterConfig::load().unwrap_or_else(|error| {
        tracing::warn!(%error, "failed to load config, using defaults");
        NatterConfig::default()
    }));

    // natter-peer [name] [port]
    let mut args = std::env::args().skip(1);
    let name_arg = args.next();
    let port = args
        .next()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(config.network.peer_port);
    let username =
        protocol::truncate_name(&name_arg.unwrap_or_else(|| format!("Peer_{port}")));

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

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let ctx = PeerCtx::new(config.clone(), username.clone(), events_tx, shutdown_tx.clone());

    let bind = format!("{}:{port}", config.network.bind_host);
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    println!("{username} listening on {}", listener.local_addr()?);
    println!("type /help for commands");

    let listen_task = tokio::spawn(peer::listen(listener, ctx.clone()));
    let monitor_task = tokio::spawn(monitor::heartbeat_loop(
        ctx.dispatcher.clone(),
        config.heartbeat.interval(),
        config.heartbeat.timeout(),
        shutdown_tx.subscribe(),
    ));
    let display_task = tokio::spawn(display_events(events_rx));

    console(ctx, shutdown_tx).await?;

    let _ = listen_task.await;
    let _ = monitor_task.await;
    // The event sender lives in ctx clones until everything above has
    // stopped; the printer has nothing more to say.
    display_task.abort();
    tracing::info!("natter-peer stopped");
    Ok(())
}

/// Surface link events on the terminal.
async fn display_events(mut events: mpsc::UnboundedReceiver<PeerEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            PeerEvent::Joined { addr, name } => println!("* {name} linked ({addr})"),
            PeerEvent::Left { addr } => println!("* link {addr} closed"),
            PeerEvent::Message { addr, text } => println!("[{addr}] {text}"),
        }
    }
}

/// The stdin loop. Returns once the node is shutting down, with every
/// dialed link drained.
async fn console(ctx: PeerCtx, shutdown_tx: broadcast::Sender<()>) -> Result<()> {
    let mut shutdown = shutdown_tx.subscribe();
    let mut links: JoinSet<Disconnect> = JoinSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            Some(finished) = links.join_next(), if !links.is_empty() => {
                // Links log their own close reason; only panics matter here.
                if let Err(error) = finished {
                    tracing::error!(%error, "link task failed");
                }
            }
            line = lines.next_line() => {
                let Some(line) = line.context("stdin read failed")? else {
                    let _ = shutdown_tx.send(());
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match ConsoleCommand::parse(&line) {
                    None => {
                        let sent = ctx.dispatcher.broadcast(line.trim(), None).await;
                        println!("sent to {sent} peers");
                    }
                    Some(cmd) => {
                        if run_command(&ctx, &mut links, &shutdown_tx, cmd).await {
                            break;
                        }
                    }
                }
            }
        }
    }

    // Dialed links exit via the shutdown broadcast; give them the same
    // drain window the listener side gets.
    let drain = async {
        while links.join_next().await.is_some() {}
    };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        links.abort_all();
    }
    Ok(())
}

/// Execute one console command. True means exit.
async fn run_command(
    ctx: &PeerCtx,
    links: &mut JoinSet<Disconnect>,
    shutdown_tx: &broadcast::Sender<()>,
    cmd: ConsoleCommand,
) -> bool {
    match cmd {
        ConsoleCommand::Quit => {
            let _ = shutdown_tx.send(());
            return true;
        }
        ConsoleCommand::Help => println!("{CONSOLE_HELP}"),
        ConsoleCommand::List => {
            let entries = ctx.roster.entries().await;
            if entries.is_empty() {
                println!("no links");
            } else {
                for e in entries {
                    println!("  {} ({}), idle {}s", e.name, e.key, e.idle.as_secs());
                }
            }
        }
        ConsoleCommand::Connect { host, port } => {
            match PeerLink::dial(&host, port, ctx.clone()).await {
                Ok(link) => {
                    println!("connected to {}", link.addr());
                    links.spawn(link.run());
                }
                Err(error) => println!("connect failed: {error}"),
            }
        }
        ConsoleCommand::Send { host, port, text } => match peer::resolve(&host, port).await {
            Some(addr) => match ctx.dispatcher.unicast(&addr, &text).await {
                Delivery::Delivered => println!("sent"),
                Delivery::Failed => println!("no link to {addr}"),
            },
            None => println!("cannot resolve {host}:{port}"),
        },
        ConsoleCommand::Broadcast { text } => {
            let sent = ctx.dispatcher.broadcast(&text, None).await;
            println!("sent to {sent} peers");
        }
        ConsoleCommand::Disconnect { host, port } => match peer::resolve(&host, port).await {
            Some(addr) => {
                if peer::hang_up(ctx, addr).await {
                    println!("disconnected {addr}");
                } else {
                    println!("no link to {addr}");
                }
            }
            None => println!("cannot resolve {host}:{port}"),
        },
        ConsoleCommand::Malformed(usage) => println!("{usage}"),
        ConsoleCommand::Unknown => println!("unknown command, try /help"),
    }
    false
}
