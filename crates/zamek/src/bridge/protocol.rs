//! Line protocol spoken with the IO board.
//!
//! Every line starts with `*`, followed by a one-character marker and
//! `#`-separated fields:
//!
//! - **Board to driver**: `*K#zone#keycode`, `*C#zone#cardcode`, `*T#zone`, `*P`, `*W`
//! - **Driver to board**: `*P#`, `*A#zone`, `*R#zone`
//!
//! The ping marker is shared by both directions; the request carries a
//! trailing separator, the reply does not.

use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const LINE_START: char = '*';
pub const FIELD_SEPARATOR: char = '#';

pub type KeyCode = u32;

/// EM4100 card numbers are 40 bits wide.
pub type CardCode = u64;

/// One physical reader/actuator pair on the IO board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Zone(NonZeroU32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("zone must be a positive integer")]
pub struct InvalidZone;

impl Zone {
    pub fn new(id: u32) -> Option<Self> {
        NonZeroU32::new(id).map(Self)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl TryFrom<u32> for Zone {
    type Error = InvalidZone;

    fn try_from(id: u32) -> Result<Self, Self::Error> {
        Self::new(id).ok_or(InvalidZone)
    }
}

impl From<Zone> for u32 {
    fn from(zone: Zone) -> Self {
        zone.get()
    }
}

impl FromStr for Zone {
    type Err = InvalidZone;

    /// Only the canonical decimal form is accepted: no sign, no leading zeros.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with('0') || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(InvalidZone);
        }
        s.parse::<u32>().ok().and_then(Self::new).ok_or(InvalidZone)
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One decoded line of the serial protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    KeyPress { zone: Zone, keycode: KeyCode },
    CardRead { zone: Zone, cardcode: CardCode },
    Tamper { zone: Zone },
    PingReply,
    /// The board was reset by its watchdog.
    Watchdog,

    PingRequest,
    Accept { zone: Zone },
    Reject { zone: Zone },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("empty line")]
    Empty,

    #[error("line does not start with '*': {0:?}")]
    MissingStart(String),

    #[error("line has no marker")]
    MissingMarker,

    #[error("unknown marker {0:?}")]
    UnknownMarker(char),

    #[error("marker {marker:?} must be followed by '#'")]
    MissingSeparator { marker: char },

    #[error("marker {marker:?} does not take {found} field(s)")]
    FieldCount { marker: char, found: usize },

    #[error("invalid {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },

    #[error("line longer than {0} bytes")]
    LineTooLong(usize),

    #[error("line is not valid UTF-8")]
    InvalidUtf8,
}

impl Frame {
    pub fn marker(&self) -> char {
        match self {
            Self::KeyPress { .. } => 'K',
            Self::CardRead { .. } => 'C',
            Self::Tamper { .. } => 'T',
            Self::PingReply | Self::PingRequest => 'P',
            Self::Watchdog => 'W',
            Self::Accept { .. } => 'A',
            Self::Reject { .. } => 'R',
        }
    }

    /// Kinds the driver sends to the board.
    pub fn is_outbound(&self) -> bool {
        matches!(
            self,
            Self::PingRequest | Self::Accept { .. } | Self::Reject { .. }
        )
    }

    pub fn decode(line: &str) -> Result<Self, DecodeError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(DecodeError::Empty);
        }

        let body = line
            .strip_prefix(LINE_START)
            .ok_or_else(|| DecodeError::MissingStart(line.to_string()))?;

        let mut chars = body.chars();
        let marker = chars.next().ok_or(DecodeError::MissingMarker)?;
        let rest = chars.as_str();

        let fields: Vec<&str> = if rest.is_empty() {
            Vec::new()
        } else {
            rest.strip_prefix(FIELD_SEPARATOR)
                .ok_or(DecodeError::MissingSeparator { marker })?
                .split(FIELD_SEPARATOR)
                .collect()
        };

        let frame = match (marker, fields.as_slice()) {
            ('K', [zone, keycode]) => Self::KeyPress {
                zone: parse_zone(zone)?,
                keycode: parse_field("keycode", keycode)?,
            },
            ('C', [zone, cardcode]) => Self::CardRead {
                zone: parse_zone(zone)?,
                cardcode: parse_field("cardcode", cardcode)?,
            },
            ('T', [zone]) => Self::Tamper {
                zone: parse_zone(zone)?,
            },
            ('P', []) => Self::PingReply,
            ('P', [""]) => Self::PingRequest,
            ('W', []) => Self::Watchdog,
            ('A', [zone]) => Self::Accept {
                zone: parse_zone(zone)?,
            },
            ('R', [zone]) => Self::Reject {
                zone: parse_zone(zone)?,
            },
            ('K' | 'C' | 'T' | 'P' | 'W' | 'A' | 'R', fields) => {
                return Err(DecodeError::FieldCount {
                    marker,
                    found: fields.len(),
                });
            }
            (other, _) => return Err(DecodeError::UnknownMarker(other)),
        };

        Ok(frame)
    }

    /// Line for this frame, without the trailing newline.
    pub fn encode(&self) -> String {
        let marker = self.marker();
        match self {
            Self::KeyPress { zone, keycode } => format!("{LINE_START}{marker}#{zone}#{keycode}"),
            Self::CardRead { zone, cardcode } => format!("{LINE_START}{marker}#{zone}#{cardcode}"),
            Self::Tamper { zone } | Self::Accept { zone } | Self::Reject { zone } => {
                format!("{LINE_START}{marker}#{zone}")
            }
            Self::PingReply | Self::Watchdog => format!("{LINE_START}{marker}"),
            Self::PingRequest => format!("{LINE_START}{marker}{FIELD_SEPARATOR}"),
        }
    }
}

fn parse_zone(value: &str) -> Result<Zone, DecodeError> {
    value.parse().map_err(|_| DecodeError::InvalidField {
        field: "zone",
        value: value.to_string(),
    })
}

fn parse_field<T: FromStr>(field: &'static str, value: &str) -> Result<T, DecodeError> {
    value.parse().map_err(|_| DecodeError::InvalidField {
        field,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone(id: u32) -> Zone {
        Zone::new(id).unwrap()
    }

    #[test]
    fn decodes_board_frames() {
        assert_eq!(
            Frame::decode("*K#3#7").unwrap(),
            Frame::KeyPress {
                zone: zone(3),
                keycode: 7
            }
        );
        assert_eq!(
            Frame::decode("*C#2#1234").unwrap(),
            Frame::CardRead {
                zone: zone(2),
                cardcode: 1234
            }
        );
        assert_eq!(
            Frame::decode("*T#1").unwrap(),
            Frame::Tamper { zone: zone(1) }
        );
        assert_eq!(Frame::decode("*P").unwrap(), Frame::PingReply);
        assert_eq!(Frame::decode("*W").unwrap(), Frame::Watchdog);
    }

    #[test]
    fn card_codes_wider_than_32_bits() {
        assert_eq!(
            Frame::decode("*C#1#1099511627775").unwrap(),
            Frame::CardRead {
                zone: zone(1),
                cardcode: 1_099_511_627_775
            }
        );
    }

    #[test]
    fn ignores_line_ending_and_whitespace() {
        assert_eq!(Frame::decode("  *P\r\n").unwrap(), Frame::PingReply);
        assert_eq!(
            Frame::decode("*T#4\r").unwrap(),
            Frame::Tamper { zone: zone(4) }
        );
    }

    #[test]
    fn outbound_frames_roundtrip() {
        for frame in [
            Frame::PingRequest,
            Frame::Accept { zone: zone(1) },
            Frame::Reject { zone: zone(2) },
            Frame::Accept { zone: zone(u32::MAX) },
        ] {
            assert!(frame.is_outbound());
            assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
        }
    }

    #[test]
    fn encodes_wire_lines() {
        assert_eq!(Frame::PingRequest.encode(), "*P#");
        assert_eq!(Frame::Accept { zone: zone(2) }.encode(), "*A#2");
        assert_eq!(Frame::Reject { zone: zone(5) }.encode(), "*R#5");
        assert_eq!(
            Frame::CardRead {
                zone: zone(2),
                cardcode: 1234
            }
            .encode(),
            "*C#2#1234"
        );
    }

    #[test]
    fn ping_request_and_reply_are_distinct() {
        assert_eq!(Frame::decode("*P#").unwrap(), Frame::PingRequest);
        assert_eq!(Frame::decode("*P").unwrap(), Frame::PingReply);
        assert!(!Frame::PingReply.is_outbound());
    }

    #[test]
    fn rejects_unknown_marker() {
        assert_eq!(
            Frame::decode("*Q#garbage"),
            Err(DecodeError::UnknownMarker('Q'))
        );
    }

    #[test]
    fn rejects_missing_start() {
        assert!(matches!(
            Frame::decode("C#2#1234"),
            Err(DecodeError::MissingStart(_))
        ));
        assert_eq!(Frame::decode("*"), Err(DecodeError::MissingMarker));
        assert_eq!(Frame::decode("\r\n"), Err(DecodeError::Empty));
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert_eq!(
            Frame::decode("*C#2"),
            Err(DecodeError::FieldCount {
                marker: 'C',
                found: 1
            })
        );
        assert_eq!(
            Frame::decode("*W#1"),
            Err(DecodeError::FieldCount {
                marker: 'W',
                found: 1
            })
        );
        assert_eq!(
            Frame::decode("*KX"),
            Err(DecodeError::MissingSeparator { marker: 'K' })
        );
    }

    #[test]
    fn rejects_bad_numbers() {
        assert_eq!(
            Frame::decode("*T#0"),
            Err(DecodeError::InvalidField {
                field: "zone",
                value: "0".to_string()
            })
        );
        assert_eq!(
            Frame::decode("*K#1#abc"),
            Err(DecodeError::InvalidField {
                field: "keycode",
                value: "abc".to_string()
            })
        );
        assert!(Frame::decode("*C#-1#5").is_err());
    }

    #[test]
    fn zone_text_must_be_canonical() {
        assert_eq!("5".parse::<Zone>(), Ok(zone(5)));
        assert_eq!("4294967295".parse::<Zone>(), Ok(zone(u32::MAX)));
        for text in ["+5", "05", "0", "", " 5", "5 ", "-5", "4294967296"] {
            assert_eq!(text.parse::<Zone>(), Err(InvalidZone), "{text:?}");
        }
        assert_eq!(
            Frame::decode("*T#05"),
            Err(DecodeError::InvalidField {
                field: "zone",
                value: "05".to_string()
            })
        );
    }

    #[test]
    fn zone_serializes_as_number() {
        assert_eq!(serde_json::to_string(&zone(7)).unwrap(), "7");
        assert_eq!(serde_json::from_str::<Zone>("7").unwrap(), zone(7));
        assert!(serde_json::from_str::<Zone>("0").is_err());
    }
}
