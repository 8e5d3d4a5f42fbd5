//! Per-connection message rate limiting.
//!
//! A fixed window that slides on demand: the first check after the
//! window expires resets it, counting from the moment of that check
//! rather than on a global tick. Control frames never reach this code;
//! only plain chat text is counted.

use std::time::{Duration, Instant};

/// Outcome of admitting one message against the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Admit,
    Reject,
}

/// Counting state for one connection.
///
/// The clock is passed in by the caller, so decisions are a pure
/// function of `(state, now)` and tests never have to sleep.
#[derive(Debug, Clone)]
pub struct RateWindow {
    window_start: Instant,
    count: u32,
}

impl RateWindow {
    pub fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            count: 0,
        }
    }

    /// Count one message. Either admits it and increments, or rejects
    /// it and leaves the window untouched; a rejected message is not
    /// billed against the next window.
    pub fn check(&mut self, now: Instant, limit: u32, window: Duration) -> RateDecision {
        if now.duration_since(self.window_start) >= window {
            self.window_start = now;
            self.count = 1;
            return RateDecision::Admit;
        }
        if self.count < limit {
            self.count += 1;
            RateDecision::Admit
        } else {
            RateDecision::Reject
        }
    }

    /// Messages admitted in the current window.
    pub fn count(&self) -> u32 {
        self.count
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
