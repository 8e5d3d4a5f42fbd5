//! Protocol grammar — setup handshake, reply prefixes, and command parsing.
//!
//! Everything here is pure string work over decoded frame payloads. The
//! grammar is deliberately loose in the same places the wire peers are
//! loose: command dispatch keys on the first whitespace-separated token,
//! a setup frame without a recognized prefix is simply "no setup", and
//! display names are silently truncated rather than rejected.

// ── Frame prefixes ────────────────────────────────────────────────────────────

/// Setup frame carrying a display name and an advertised rendezvous port.
pub const SETUP_PREFIX: &str = "SETUP:";

/// Setup frame carrying only a display name.
pub const USERNAME_PREFIX: &str = "USERNAME:";

/// Liveness probe, sent by the heartbeat monitor.
pub const PING: &str = "PING";

/// Liveness reply. Also accepted inbound as a bare keep-alive.
pub const PONG: &str = "PONG";

/// Prefix of error replies destined for a human.
pub const ERROR_PREFIX: &str = "ERROR: ";

/// Prefix of informational replies destined for a human.
pub const INFO_PREFIX: &str = "INFO: ";

/// Prefix of `/getpeer` rendezvous replies: `PEER_INFO:<name>:<host>:<port>`.
pub const PEER_INFO_PREFIX: &str = "PEER_INFO:";

/// First character of every control frame.
pub const COMMAND_MARKER: char = '/';

/// Display names longer than this are truncated, not rejected.
pub const NAME_MAX_CHARS: usize = 20;

/// Rendezvous port assumed when a connection never advertises one.
pub const DEFAULT_AUX_PORT: u16 = 8081;

/// True when the payload is a control frame rather than chat text.
pub fn is_command(frame: &str) -> bool {
    frame.starts_with(COMMAND_MARKER)
}

/// Truncate a display name to [`NAME_MAX_CHARS`], on character
/// boundaries so multibyte names cannot split mid-scalar.
pub fn truncate_name(name: &str) -> String {
    name.trim().chars().take(NAME_MAX_CHARS).collect()
}

// ── Setup handshake ───────────────────────────────────────────────────────────

/// Parsed form of the first inbound frame on a fresh connection.
///
/// `None` fields mean "not supplied", and the caller applies its own
/// defaults. An unrecognized first frame parses to all-`None`; per the
/// handshake contract it is consumed and discarded, never replayed as
/// the first chat message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Setup {
    pub name: Option<String>,
    pub aux_port: Option<u16>,
}

impl Setup {
    pub fn parse(frame: &str) -> Setup {
        if let Some(rest) = frame.strip_prefix(SETUP_PREFIX) {
            let (name_part, port_part) = match rest.split_once(':') {
                Some((n, p)) => (n, Some(p)),
                None => (rest, None),
            };
            let name = some_if_nonempty(truncate_name(name_part));
            let aux_port = port_part.and_then(|p| p.trim().parse::<u16>().ok());
            return Setup { name, aux_port };
        }
        if let Some(rest) = frame.strip_prefix(USERNAME_PREFIX) {
            // Everything after the first colon is the name, colons included.
            return Setup {
                name: some_if_nonempty(truncate_name(rest)),
                aux_port: None,
            };
        }
        Setup::default()
    }
}

fn some_if_nonempty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

// ── Server commands ───────────────────────────────────────────────────────────

/// A control frame received by the chat server.
///
/// Dispatch keys on the first whitespace-separated token; trailing junk
/// after an argument-less command is ignored. `Malformed` carries the
/// usage line to send back as a recoverable error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerCommand {
    Quit,
    List,
    Help,
    Pm { to: String, text: String },
    GetPeer { name: String },
    Peers,
    Malformed(&'static str),
    Unknown,
}

impl ServerCommand {
    /// Parse a control frame. Returns `None` for plain chat text.
    pub fn parse(frame: &str) -> Option<ServerCommand> {
        if !is_command(frame) {
            return None;
        }
        let mut parts = frame.split_whitespace();
        let cmd = parts.next().unwrap_or(frame);
        Some(match cmd {
            "/quit" => ServerCommand::Quit,
            "/list" => ServerCommand::List,
            "/help" => ServerCommand::Help,
            "/peers" => ServerCommand::Peers,
            "/pm" => {
                // Past the command token: first word is the target,
                // the rest is the message body, interior spacing kept.
                let rest = frame[cmd.len()..].trim_start();
                match rest.split_once(char::is_whitespace) {
                    Some((to, text)) if !text.trim().is_empty() => ServerCommand::Pm {
                        to: to.to_string(),
                        text: text.trim().to_string(),
                    },
                    _ => ServerCommand::Malformed("usage: /pm <name> <text>"),
                }
            }
            "/getpeer" => match parts.next() {
                Some(name) => ServerCommand::GetPeer {
                    name: name.to_string(),
                },
                None => ServerCommand::Malformed("usage: /getpeer <name>"),
            },
            _ => ServerCommand::Unknown,
        })
    }
}

// ── Peer link commands ────────────────────────────────────────────────────────

/// A control frame received on an established peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkCommand {
    Quit,
    Ping,
    List,
    Unknown,
}

impl LinkCommand {
    /// Parse a control frame arriving on a peer link. Returns `None`
    /// for plain text.
    pub fn parse(frame: &str) -> Option<LinkCommand> {
        if !is_command(frame) {
            return None;
        }
        let cmd = frame.split_whitespace().next().unwrap_or(frame);
        Some(match cmd {
            "/quit" => LinkCommand::Quit,
            "/ping" => LinkCommand::Ping,
            "/list" => LinkCommand::List,
            _ => LinkCommand::Unknown,
        })
    }
}

// ── Peer console commands ─────────────────────────────────────────────────────

/// A line typed at the peer application's own console.
///
/// Bare text (no marker) parses to `None` and defaults to
/// broadcast-to-all-peers at the call site. `quit`/`exit` without the
/// marker are accepted as aliases, as the source console always has.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Connect { host: String, port: u16 },
    List,
    Send { host: String, port: u16, text: String },
    Broadcast { text: String },
    Disconnect { host: String, port: u16 },
    Help,
    Quit,
    Malformed(&'static str),
    Unknown,
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Option<ConsoleCommand> {
        let line = line.trim();
        if matches!(line, "quit" | "exit" | "/exit") {
            return Some(ConsoleCommand::Quit);
        }
        if !is_command(line) {
            return None;
        }
        let mut parts = parts_of(line);
        let cmd = parts.next().unwrap_or(line);
        Some(match cmd {
            "/quit" => ConsoleCommand::Quit,
            "/list" => ConsoleCommand::List,
            "/help" => ConsoleCommand::Help,
            "/connect" => match endpoint_args(&mut parts) {
                Some((host, port)) => ConsoleCommand::Connect { host, port },
                None => ConsoleCommand::Malformed("usage: /connect <host> <port>"),
            },
            "/disconnect" => match endpoint_args(&mut parts) {
                Some((host, port)) => ConsoleCommand::Disconnect { host, port },
                None => ConsoleCommand::Malformed("usage: /disconnect <host> <port>"),
            },
            "/send" => match endpoint_args(&mut parts) {
                Some((host, port)) => {
                    let text: String = parts.collect::<Vec<_>>().join(" ");
                    if text.is_empty() {
                        ConsoleCommand::Malformed("usage: /send <host> <port> <text>")
                    } else {
                        ConsoleCommand::Send { host, port, text }
                    }
                }
                None => ConsoleCommand::Malformed("usage: /send <host> <port> <text>"),
            },
            "/broadcast" => {
                let text: String = parts.collect::<Vec<_>>().join(" ");
                if text.is_empty() {
                    ConsoleCommand::Malformed("usage: /broadcast <text>")
                } else {
                    ConsoleCommand::Broadcast { text }
                }
            }
            _ => ConsoleCommand::Unknown,
        })
    }
}

fn parts_of(line: &str) -> impl Iterator<Item = &str> {
    line.split_whitespace()
}

fn endpoint_args<'a>(parts: &mut impl Iterator<Item = &'a str>) -> Option<(String, u16)> {
    let host = parts.next()?.to_string();
    let port = parts.next()?.parse::<u16>().ok()?;
    Some((host, port))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
