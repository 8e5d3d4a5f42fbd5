//! natter-core — wire framing, protocol grammar, and configuration.
//! All other Natter crates depend on this one.

pub mod config;
pub mod protocol;
pub mod wire;

pub use config::NatterConfig;
pub use wire::{read_frame, write_frame, FrameError};
