//! Publish/subscribe bus between the IO board link and policy runtimes.
//!
//! A connection is a [`Bus`] handle for publishing and subscribing plus an
//! [`Inbox`] receiving every message that matched one of its subscriptions.
//! The inbox is drained by a task other than the publisher, so delivery is
//! always asynchronous.
//!
//! - **topic**: Topic schema and wildcard matching
//! - **event**: Payload types
//! - **local**: In-process broker
//! - **mqtt**: MQTT broker client

pub mod event;
pub mod local;
pub mod mqtt;
pub mod topic;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

pub use event::{Action, PayloadError, SystemEvent, ZoneEvent};
pub use local::{LocalBroker, LocalBus};
pub use mqtt::MqttBus;
pub use topic::{ReaderEvent, SYSTEM_TOPIC, Topic, TopicError, topic_matches};

use crate::bridge::protocol::Zone;

/// Messages delivered to one bus connection, in arrival order.
pub type Inbox = mpsc::UnboundedReceiver<BusMessage>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    pub fn zone_event(event: &ZoneEvent) -> Result<Self, PayloadError> {
        Ok(Self::new(
            event.topic().to_string(),
            serde_json::to_vec(event)?,
        ))
    }

    pub fn system(event: SystemEvent) -> Result<Self, PayloadError> {
        Ok(Self::new(SYSTEM_TOPIC, serde_json::to_vec(&event)?))
    }

    /// Last will announced by the driver's connection.
    pub fn shutdown() -> Result<Self, PayloadError> {
        Self::system(SystemEvent::Shutdown)
    }

    pub fn action(zone: Zone, action: Action) -> Self {
        Self::new(
            Topic::reader(zone, ReaderEvent::Action).to_string(),
            action.as_str(),
        )
    }

    pub fn payload_str(&self) -> Result<&str, PayloadError> {
        std::str::from_utf8(&self.payload).map_err(|_| PayloadError::Utf8)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus connection closed")]
    Closed,

    #[error("MQTT client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error(transparent)]
    Payload(#[from] PayloadError),
}

/// One connection to the message bus.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, message: BusMessage) -> Result<(), BusError>;

    /// Add a topic filter; matching messages arrive on this connection's inbox.
    async fn subscribe(&self, pattern: &str) -> Result<(), BusError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_message_is_plain_string() {
        let message = BusMessage::action(Zone::new(2).unwrap(), Action::Accept);
        assert_eq!(message.topic, "reader/2/action");
        assert_eq!(message.payload, Bytes::from_static(b"accept"));
    }

    #[test]
    fn zone_event_message_uses_event_topic() {
        let message = BusMessage::zone_event(&ZoneEvent::Tamper {
            zone: Zone::new(4).unwrap(),
        })
        .unwrap();
        assert_eq!(message.topic, "reader/4/tamper");
        assert_eq!(message.payload_str().unwrap(), r#"{"event":"tamper","zone":4}"#);
    }

    #[test]
    fn system_messages() {
        let message = BusMessage::system(SystemEvent::Timeout).unwrap();
        assert_eq!(message.topic, "system");
        assert_eq!(message.payload_str().unwrap(), r#"{"event":"timeout"}"#);

        let will = BusMessage::shutdown().unwrap();
        assert_eq!(will.payload_str().unwrap(), r#"{"event":"shutdown"}"#);
    }

    #[test]
    fn non_utf8_payload() {
        let message = BusMessage::new("reader/1/action", vec![0xff, 0xfe]);
        assert!(matches!(message.payload_str(), Err(PayloadError::Utf8)));
    }
}
