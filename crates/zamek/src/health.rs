//! IO board link health: lifecycle state and the missed-ping counter.

use std::fmt;

/// Consecutive unanswered pings tolerated before `timeout` is published.
pub const PING_TIMEOUT_THRESHOLD: u32 = 5;

/// Lifecycle of the IO board link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LinkState {
    /// Opening the serial device.
    #[default]
    Connecting,
    /// Waiting for the reply to the first ping.
    HealthCheck,
    /// Relaying between board and bus.
    Running,
    /// Unrecoverable error; the process is expected to exit.
    Faulted,
}

impl LinkState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Faulted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::HealthCheck => "health_check",
            Self::Running => "running",
            Self::Faulted => "faulted",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pings sent without a reply since the last `*P` from the board.
#[derive(Debug, Clone)]
pub struct HealthState {
    missed_pings: u32,
    threshold: u32,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new(PING_TIMEOUT_THRESHOLD)
    }
}

impl HealthState {
    pub fn new(threshold: u32) -> Self {
        Self {
            missed_pings: 0,
            threshold,
        }
    }

    pub fn missed_pings(&self) -> u32 {
        self.missed_pings
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn ping_replied(&mut self) {
        self.missed_pings = 0;
    }

    /// Count one unanswered read window. Returns true on every call while
    /// the counter is past the threshold, not just the first.
    pub fn read_timed_out(&mut self) -> bool {
        self.missed_pings = self.missed_pings.saturating_add(1);
        self.is_timed_out()
    }

    pub fn is_timed_out(&self) -> bool {
        self.missed_pings > self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_state_default_is_connecting() {
        assert_eq!(LinkState::default(), LinkState::Connecting);
        assert!(LinkState::Faulted.is_terminal());
        assert!(!LinkState::Running.is_terminal());
    }

    #[test]
    fn timeout_fires_after_threshold_and_keeps_firing() {
        let mut health = HealthState::default();
        let fired: Vec<bool> = (0..8).map(|_| health.read_timed_out()).collect();

        assert_eq!(
            fired,
            [false, false, false, false, false, true, true, true]
        );
        assert_eq!(health.missed_pings(), 8);
    }

    #[test]
    fn ping_reply_resets_counter() {
        let mut health = HealthState::new(2);
        health.read_timed_out();
        health.read_timed_out();
        assert!(health.read_timed_out());

        health.ping_replied();
        assert_eq!(health.missed_pings(), 0);
        assert!(!health.is_timed_out());
        assert!(!health.read_timed_out());
    }
}
