//! In-process broker.
//!
//! Same delivery rules as the MQTT broker: wildcard subscriptions,
//! per-connection ordering, and a last will routed to the remaining
//! connections when a handle is dropped.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::topic::topic_matches;
use super::{Bus, BusError, BusMessage, Inbox};

struct Connection {
    patterns: Vec<String>,
    inbox: mpsc::UnboundedSender<BusMessage>,
    last_will: Option<BusMessage>,
}

#[derive(Default)]
struct BrokerState {
    next_id: u64,
    connections: BTreeMap<u64, Connection>,
}

#[derive(Clone, Default)]
pub struct LocalBroker {
    state: Arc<StdMutex<BrokerState>>,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self) -> (LocalBus, Inbox) {
        self.connect_with_will(None)
    }

    pub fn connect_with_will(&self, last_will: Option<BusMessage>) -> (LocalBus, Inbox) {
        let (tx, inbox) = mpsc::unbounded_channel();
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.connections.insert(
            id,
            Connection {
                patterns: Vec::new(),
                inbox: tx,
                last_will,
            },
        );
        tracing::trace!(connection = id, "Local bus connection opened");

        (
            LocalBus {
                broker: self.clone(),
                id,
            },
            inbox,
        )
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn route(&self, message: &BusMessage) {
        let state = self.lock();
        for connection in state.connections.values() {
            if connection
                .patterns
                .iter()
                .any(|pattern| topic_matches(pattern, &message.topic))
            {
                // A dropped inbox only means nobody is reading that connection.
                let _ = connection.inbox.send(message.clone());
            }
        }
    }
}

/// Connection handle on a [`LocalBroker`].
pub struct LocalBus {
    broker: LocalBroker,
    id: u64,
}

#[async_trait]
impl Bus for LocalBus {
    async fn publish(&self, message: BusMessage) -> Result<(), BusError> {
        tracing::trace!(topic = %message.topic, "Local publish");
        self.broker.route(&message);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<(), BusError> {
        let mut state = self.broker.lock();
        let connection = state.connections.get_mut(&self.id).ok_or(BusError::Closed)?;
        if !connection.patterns.iter().any(|p| p == pattern) {
            connection.patterns.push(pattern.to_string());
        }
        Ok(())
    }
}

impl Drop for LocalBus {
    fn drop(&mut self) {
        let last_will = self
            .broker
            .lock()
            .connections
            .remove(&self.id)
            .and_then(|connection| connection.last_will);

        if let Some(will) = last_will {
            tracing::debug!(connection = self.id, topic = %will.topic, "Delivering last will");
            self.broker.route(&will);
        }
    }
}
