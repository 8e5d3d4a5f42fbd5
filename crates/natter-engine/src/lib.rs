//! natter-engine — connection registry, delivery, and session loops.
//!
//! The engine is everything between the wire format and a binary: the
//! shared connection roster, the dispatcher that owns every outbound
//! write, the heartbeat monitor, and the per-connection loops for the
//! chat server and the peer application. Both daemons are thin shells
//! around this crate, which also lets the integration tests drive a
//! whole server in-process on an ephemeral port.

pub mod dispatch;
pub mod limiter;
pub mod monitor;
pub mod peer;
pub mod roster;
pub mod server;
pub mod session;

pub use dispatch::{Delivery, Dispatcher, SweepStats};
pub use roster::{ConnId, Member, RegisterError, Roster, RosterEntry};
pub use session::{Disconnect, ServerCtx};
