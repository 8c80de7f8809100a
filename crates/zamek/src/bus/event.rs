//! Bus payloads.
//!
//! Zone and system events are JSON objects tagged by `event`. Action
//! messages are the bare strings `accept` / `reject`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::topic::{ReaderEvent, Topic};
use crate::bridge::protocol::{CardCode, Frame, KeyCode, Zone};

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is not valid UTF-8")]
    Utf8,

    #[error("unknown action {0:?}")]
    UnknownAction(String),

    #[error("payload does not match topic {0}")]
    TopicMismatch(String),
}

/// Event published on `reader/{zone}/{event}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum ZoneEvent {
    KeyPress { zone: Zone, keycode: KeyCode },
    CardRead { zone: Zone, cardcode: CardCode },
    Tamper { zone: Zone },
}

impl ZoneEvent {
    pub fn zone(&self) -> Zone {
        match self {
            Self::KeyPress { zone, .. } | Self::CardRead { zone, .. } | Self::Tamper { zone } => {
                *zone
            }
        }
    }

    pub fn reader_event(&self) -> ReaderEvent {
        match self {
            Self::KeyPress { .. } => ReaderEvent::KeyPress,
            Self::CardRead { .. } => ReaderEvent::CardRead,
            Self::Tamper { .. } => ReaderEvent::Tamper,
        }
    }

    pub fn topic(&self) -> Topic {
        Topic::reader(self.zone(), self.reader_event())
    }
}

/// Event published on `system`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum SystemEvent {
    /// The IO board was reset by its watchdog.
    Watchdog,
    /// The IO board stopped answering pings.
    Timeout,
    /// Last will of the driver's bus connection.
    Shutdown,
}

/// Authorization decision sent to `reader/{zone}/action`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Accept,
    Reject,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Reject => "reject",
        }
    }

    /// Command line the IO board expects for this decision.
    pub fn frame(&self, zone: Zone) -> Frame {
        match self {
            Self::Accept => Frame::Accept { zone },
            Self::Reject => Frame::Reject { zone },
        }
    }
}

impl FromStr for Action {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accept" => Ok(Self::Accept),
            "reject" => Ok(Self::Reject),
            other => Err(PayloadError::UnknownAction(other.to_string())),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
