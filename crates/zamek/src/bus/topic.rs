//! Topic schema: `reader/{zone}/{event}` for zone events, `system` for the rest.

use std::fmt;
use std::str::FromStr;

use crate::bridge::protocol::Zone;

pub const SYSTEM_TOPIC: &str = "system";
pub const READER_PREFIX: &str = "reader";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("unrecognised topic {0:?}")]
    Unrecognised(String),

    #[error("invalid zone in topic {0:?}")]
    InvalidZone(String),

    #[error("unknown reader event {0:?}")]
    UnknownEvent(String),
}

/// Last level of a `reader/{zone}/...` topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReaderEvent {
    KeyPress,
    CardRead,
    Tamper,
    Action,
}

impl ReaderEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KeyPress => "keypress",
            Self::CardRead => "cardread",
            Self::Tamper => "tamper",
            Self::Action => "action",
        }
    }

    /// Subscription pattern covering this event on every zone.
    pub fn pattern(&self) -> String {
        format!("{READER_PREFIX}/+/{}", self.as_str())
    }
}

impl FromStr for ReaderEvent {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keypress" => Ok(Self::KeyPress),
            "cardread" => Ok(Self::CardRead),
            "tamper" => Ok(Self::Tamper),
            "action" => Ok(Self::Action),
            other => Err(TopicError::UnknownEvent(other.to_string())),
        }
    }
}

impl fmt::Display for ReaderEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Reader { zone: Zone, event: ReaderEvent },
    System,
}

impl Topic {
    pub fn reader(zone: Zone, event: ReaderEvent) -> Self {
        Self::Reader { zone, event }
    }

    pub fn parse(topic: &str) -> Result<Self, TopicError> {
        if topic == SYSTEM_TOPIC {
            return Ok(Self::System);
        }

        let levels: Vec<&str> = topic.split('/').collect();
        match levels.as_slice() {
            [READER_PREFIX, zone, event] => {
                let zone = zone
                    .parse()
                    .map_err(|_| TopicError::InvalidZone(topic.to_string()))?;
                Ok(Self::Reader {
                    zone,
                    event: event.parse()?,
                })
            }
            _ => Err(TopicError::Unrecognised(topic.to_string())),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reader { zone, event } => write!(f, "{READER_PREFIX}/{zone}/{event}"),
            Self::System => f.write_str(SYSTEM_TOPIC),
        }
    }
}

/// MQTT-style filter match: `+` spans one level, `#` the rest.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut levels = topic.split('/');
    for filter in pattern.split('/') {
        match filter {
            "#" => return true,
            "+" => {
                if levels.next().is_none() {
                    return false;
                }
            }
            exact => {
                if levels.next() != Some(exact) {
                    return false;
                }
            }
        }
    }
    levels.next().is_none()
}
