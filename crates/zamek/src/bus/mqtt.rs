//! MQTT broker connection.
//!
//! The rumqttc event loop runs on its own task and forwards every incoming
//! publish to the connection's inbox. Subscriptions are recorded so they can
//! be replayed whenever the broker hands out a fresh session.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnAck, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{Bus, BusError, BusMessage, Inbox};
use crate::config::MqttConfig;

/// Pause before polling the event loop again after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Outstanding requests between the client handle and the event loop.
const REQUEST_CAPACITY: usize = 64;

const QOS: QoS = QoS::AtLeastOnce;

type Patterns = Arc<StdMutex<Vec<String>>>;

pub struct MqttBus {
    client: AsyncClient,
    patterns: Patterns,
    event_loop: JoinHandle<()>,
}

impl MqttBus {
    /// Connect to the broker. The connection itself is established by the
    /// event loop task; publishes made before that are queued.
    pub fn connect(config: &MqttConfig, last_will: Option<BusMessage>) -> (Self, Inbox) {
        let options = mqtt_options(config, last_will);
        tracing::info!(
            host = %config.host,
            port = config.port,
            client_id = %options.client_id(),
            "Connecting to MQTT broker"
        );

        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (tx, inbox) = mpsc::unbounded_channel();
        let patterns: Patterns = Arc::new(StdMutex::new(Vec::new()));

        let event_loop = tokio::spawn(run_event_loop(
            event_loop,
            client.clone(),
            Arc::clone(&patterns),
            tx,
        ));

        (
            Self {
                client,
                patterns,
                event_loop,
            },
            inbox,
        )
    }
}

#[async_trait]
impl Bus for MqttBus {
    async fn publish(&self, message: BusMessage) -> Result<(), BusError> {
        tracing::trace!(topic = %message.topic, bytes = message.payload.len(), "MQTT publish");
        self.client
            .publish(message.topic, QOS, false, message.payload.to_vec())
            .await?;
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<(), BusError> {
        record_pattern(&self.patterns, pattern);
        tracing::debug!(%pattern, "MQTT subscribe");
        self.client.subscribe(pattern, QOS).await?;
        Ok(())
    }
}

impl Drop for MqttBus {
    /// Drops the connection without a DISCONNECT, so the broker publishes
    /// the last will.
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}

async fn run_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    patterns: Patterns,
    inbox: mpsc::UnboundedSender<BusMessage>,
) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                on_conn_ack(&ack, &client, &patterns);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                tracing::trace!(topic = %publish.topic, "MQTT message received");
                if inbox
                    .send(BusMessage::new(publish.topic, publish.payload))
                    .is_err()
                {
                    tracing::trace!("Inbox dropped, discarding message");
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "MQTT connection error, reconnecting");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

/// Broker options for one connection. The last will is sent at QoS 1 and
/// is not retained.
fn mqtt_options(config: &MqttConfig, last_will: Option<BusMessage>) -> MqttOptions {
    let mut options = MqttOptions::new(config.client_id(), config.host.clone(), config.port);
    options.set_keep_alive(config.keep_alive());
    if let Some(will) = last_will {
        options.set_last_will(LastWill::new(will.topic, will.payload.to_vec(), QOS, false));
    }
    options
}

/// Remember a subscription for replay. Returns false if it was already known.
fn record_pattern(patterns: &Patterns, pattern: &str) -> bool {
    let mut patterns = patterns.lock().unwrap_or_else(PoisonError::into_inner);
    if patterns.iter().any(|p| p == pattern) {
        return false;
    }
    patterns.push(pattern.to_string());
    true
}

/// Subscriptions to replay after a ConnAck. A broker that kept the session
/// still has them.
fn patterns_to_restore(ack: &ConnAck, patterns: &Patterns) -> Vec<String> {
    if ack.session_present {
        return Vec::new();
    }
    patterns
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Returns how many subscriptions were queued for replay.
fn on_conn_ack(ack: &ConnAck, client: &AsyncClient, patterns: &Patterns) -> usize {
    tracing::info!(session_present = ack.session_present, "Connected to MQTT broker");
    resubscribe(client, patterns_to_restore(ack, patterns))
}

fn resubscribe(client: &AsyncClient, patterns: Vec<String>) -> usize {
    let mut restored = 0;
    for pattern in patterns {
        match client.try_subscribe(pattern.clone(), QOS) {
            Ok(()) => restored += 1,
            Err(e) => tracing::warn!(%pattern, error = %e, "Failed to restore subscription"),
        }
    }
    restored
}
