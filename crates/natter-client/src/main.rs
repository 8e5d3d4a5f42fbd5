//! natter-client — interactive terminal client for the chat server.
//!
//! Two tasks share the connection: a reader that prints every server
//! frame and answers PING probes on its own, and the stdin loop that
//! frames typed lines outward. The write half sits behind a mutex
//! because both tasks write to it.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

use natter_core::{protocol, wire, NatterConfig};

type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = NatterConfig::load().unwrap_or_else(|error| {
        tracing::warn!(%error, "failed to load config, using defaults");
        NatterConfig::default()
    });

    let (name, aux_port, host) =
        parse_args(std::env::args().skip(1), config.network.peer_port);
    let addr = format!("{host}:{}", config.network.chat_port);

    let stream = TcpStream::connect(&addr)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;
    println!("connected to {addr} as {name}");

    let (read_half, mut write_half) = stream.into_split();
    wire::write_frame(
        &mut write_half,
        &format!("{}{name}:{aux_port}", protocol::SETUP_PREFIX),
    )
    .await
    .context("failed to send setup frame")?;
    let writer: SharedWriter = Arc::new(Mutex::new(write_half));

    let max_frame = config.limits.max_frame_bytes;
    let mut reader_task = tokio::spawn(read_loop(read_half, writer.clone(), max_frame));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = &mut reader_task => {
                println!("disconnected");
                return Ok(());
            }
            line = lines.next_line() => match line.context("stdin read failed")? {
                Some(line) => {
                    let text = line.trim();
                    if text.is_empty() {
                        continue;
                    }
                    let outbound = if matches!(text, "quit" | "exit" | "/exit") {
                        "/quit"
                    } else {
                        text
                    };
                    let mut w = writer.lock().await;
                    if wire::write_frame(&mut *w, outbound).await.is_err() {
                        println!("disconnected");
                        return Ok(());
                    }
                    // After /quit the server says goodbye and hangs up;
                    // the reader branch above sees that and exits.
                }
                None => {
                    // stdin closed: say goodbye, then wait for the
                    // server to hang up on us.
                    {
                        let mut w = writer.lock().await;
                        let _ = wire::write_frame(&mut *w, "/quit").await;
                    }
                    let _ = reader_task.await;
                    println!("disconnected");
                    return Ok(());
                }
            }
        }
    }
}

/// Argv shape: `natter-client [name] [aux_port] [host]`. The middle
/// argument is the rendezvous port advertised in the setup frame, the
/// one `/getpeer` hands out. Missing or unparseable values fall back,
/// so a bare invocation still connects as Guest.
fn parse_args(
    mut args: impl Iterator<Item = String>,
    default_aux: u16,
) -> (String, u16, String) {
    let name = protocol::truncate_name(&args.next().unwrap_or_else(|| "Guest".to_string()));
    let aux_port = args
        .next()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(default_aux);
    let host = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    (name, aux_port, host)
}

/// Print every inbound frame; answer probes without surfacing them.
async fn read_loop(read_half: OwnedReadHalf, writer: SharedWriter, max_frame: usize) {
    let mut reader = BufReader::new(read_half);
    loop {
        match wire::read_frame(&mut reader, max_frame).await {
            Ok(Some(frame)) => {
                if frame == protocol::PING {
                    let mut w = writer.lock().await;
                    if wire::write_frame(&mut *w, protocol::PONG).await.is_err() {
                        return;
                    }
                    continue;
                }
                println!("{frame}");
            }
            Ok(None) => return,
            Err(error) => {
                tracing::warn!(%error, "server stream failed");
                return;
            }
        }
    }
}
