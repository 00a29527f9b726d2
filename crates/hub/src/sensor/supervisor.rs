//! Turns a stream of read outcomes into a stable connectivity status.
//!
//! One success promotes, `demote_after` consecutive failures demote. Every
//! channel kind shares this strategy.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transition {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct ConnectionSupervisor {
    connected: bool,
    consecutive_failures: u32,
    demote_after: u32,
}

impl ConnectionSupervisor {
    /// `demote_after` is clamped to at least one failure.
    pub fn new(demote_after: u32) -> Self {
        Self {
            connected: false,
            consecutive_failures: 0,
            demote_after: demote_after.max(1),
        }
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// A hardware read succeeded.
    pub fn record_success(&mut self) -> Option<Transition> {
        self.consecutive_failures = 0;
        if self.connected {
            None
        } else {
            self.connected = true;
            Some(Transition::Connected)
        }
    }

    /// A read failed (error, missing value, or timeout).
    pub fn record_failure(&mut self) -> Option<Transition> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.connected && self.consecutive_failures >= self.demote_after {
            self.connected = false;
            Some(Transition::Disconnected)
        } else {
            None
        }
    }

    /// Simulated reads never promote; they only clear the failure streak.
    pub fn record_simulated(&mut self) {
        self.consecutive_failures = 0;
    }
}
