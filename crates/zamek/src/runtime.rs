//! Runs one [`Policy`] against the bus.
//!
//! Subscriptions are derived once from the policy's capabilities. Inbound
//! messages are decoded into a delivery and handed to the matching handler,
//! one at a time, on the task draining the inbox.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;

use crate::bridge::protocol::{CardCode, KeyCode, Zone};
use crate::bus::{
    Action, Bus, BusError, BusMessage, Inbox, PayloadError, ReaderEvent, SystemEvent, Topic,
    TopicError, ZoneEvent,
};
use crate::policy::{Capability, CapabilitySet, Decider, Policy, PolicyError};

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error(transparent)]
    Topic(#[from] TopicError),

    #[error(transparent)]
    Payload(#[from] PayloadError),
}

/// A decoded inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    KeyPress { zone: Zone, keycode: KeyCode },
    CardRead { zone: Zone, cardcode: CardCode },
    Tamper { zone: Zone },
    PingTimeout,
    Watchdog,
    Action { zone: Zone, action: Action },
    /// Last will of the driver. No policy handler receives it.
    Shutdown,
}

impl Delivery {
    pub fn route(message: &BusMessage) -> Result<Self, RouteError> {
        match Topic::parse(&message.topic)? {
            Topic::System => {
                let event: SystemEvent =
                    serde_json::from_slice(&message.payload).map_err(PayloadError::from)?;
                Ok(match event {
                    SystemEvent::Watchdog => Self::Watchdog,
                    SystemEvent::Timeout => Self::PingTimeout,
                    SystemEvent::Shutdown => Self::Shutdown,
                })
            }
            Topic::Reader {
                zone,
                event: ReaderEvent::Action,
            } => {
                let action = message.payload_str()?.parse::<Action>()?;
                Ok(Self::Action { zone, action })
            }
            Topic::Reader { zone, event } => {
                let payload: ZoneEvent =
                    serde_json::from_slice(&message.payload).map_err(PayloadError::from)?;
                if payload.zone() != zone || payload.reader_event() != event {
                    return Err(PayloadError::TopicMismatch(message.topic.clone()).into());
                }
                Ok(match payload {
                    ZoneEvent::KeyPress { zone, keycode } => Self::KeyPress { zone, keycode },
                    ZoneEvent::CardRead { zone, cardcode } => Self::CardRead { zone, cardcode },
                    ZoneEvent::Tamper { zone } => Self::Tamper { zone },
                })
            }
        }
    }

    pub fn capability(&self) -> Option<Capability> {
        match self {
            Self::KeyPress { .. } => Some(Capability::KeyPress),
            Self::CardRead { .. } => Some(Capability::CardRead),
            Self::Tamper { .. } => Some(Capability::Tamper),
            Self::PingTimeout => Some(Capability::PingTimeout),
            Self::Watchdog => Some(Capability::Watchdog),
            Self::Action { .. } => Some(Capability::Action),
            Self::Shutdown => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Topic or payload could not be decoded.
    Undecodable,
    /// No declared capability covers the message.
    Ignored,
    Handled,
    Failed,
    Panicked,
}

/// Card-read transaction as seen by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Presented,
    Evaluating,
    Decided,
}

#[derive(Debug)]
struct CardAttempt {
    zone: Zone,
    cardcode: CardCode,
    state: AttemptState,
}

impl CardAttempt {
    fn new(zone: Zone, cardcode: CardCode) -> Self {
        Self {
            zone,
            cardcode,
            state: AttemptState::Presented,
        }
    }

    fn evaluating(&mut self) {
        self.state = AttemptState::Evaluating;
    }

    /// Record the handler's decisions. Undecided attempts stay `Evaluating`;
    /// the runtime never rejects on the policy's behalf.
    fn settle(&mut self, policy: &str, decisions: usize) -> AttemptState {
        let (zone, cardcode) = (self.zone, self.cardcode);
        match decisions {
            0 => {
                tracing::warn!(policy, %zone, cardcode, "Card read left undecided, lock unchanged");
            }
            1 => self.state = AttemptState::Decided,
            n => {
                self.state = AttemptState::Decided;
                tracing::warn!(policy, %zone, cardcode, decisions = n, "Card read decided more than once");
            }
        }
        self.state
    }
}

pub struct PluginRuntime<P> {
    policy: Arc<P>,
    bus: Arc<dyn Bus>,
    capabilities: CapabilitySet,
    subscriptions: Vec<String>,
    decider: Decider,
}

impl<P: Policy> PluginRuntime<P> {
    pub fn new(policy: P, bus: Arc<dyn Bus>) -> Self {
        let capabilities = policy.capabilities();
        let mut subscriptions: Vec<String> = Vec::new();
        for capability in capabilities.iter() {
            let pattern = capability.topic_pattern();
            if !subscriptions.contains(&pattern) {
                subscriptions.push(pattern);
            }
        }

        Self {
            policy: Arc::new(policy),
            decider: Decider::new(Arc::clone(&bus)),
            bus,
            capabilities,
            subscriptions,
        }
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    /// Topic patterns this runtime subscribes to, in capability order.
    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    pub fn decider(&self) -> &Decider {
        &self.decider
    }

    pub async fn start(&self) -> Result<(), BusError> {
        if self.capabilities.is_empty() {
            tracing::warn!(policy = self.policy.name(), "Policy declares no capabilities");
        }
        for pattern in &self.subscriptions {
            self.bus.subscribe(pattern).await?;
        }
        tracing::info!(
            policy = self.policy.name(),
            capabilities = ?self.capabilities,
            subscriptions = ?self.subscriptions,
            "Policy runtime started"
        );
        Ok(())
    }

    /// Subscribe, then dispatch until the inbox closes.
    pub async fn run(self, mut inbox: Inbox) -> Result<(), BusError> {
        self.start().await?;
        while let Some(message) = inbox.recv().await {
            self.dispatch(&message).await;
        }
        tracing::error!(policy = self.policy.name(), "Bus inbox closed");
        Err(BusError::Closed)
    }

    pub async fn dispatch(&self, message: &BusMessage) -> DispatchOutcome {
        let policy = self.policy.name();
        let delivery = match Delivery::route(message) {
            Ok(delivery) => delivery,
            Err(e) => {
                tracing::warn!(policy, topic = %message.topic, error = %e, "Dropping undecodable message");
                return DispatchOutcome::Undecodable;
            }
        };

        let Some(capability) = delivery.capability() else {
            tracing::warn!(policy, "IO board link announced shutdown");
            return DispatchOutcome::Ignored;
        };
        if !self.capabilities.contains(capability) {
            tracing::trace!(policy, %capability, "No handler declared, skipping");
            return DispatchOutcome::Ignored;
        }

        let mut attempt = match delivery {
            Delivery::CardRead { zone, cardcode } => Some(CardAttempt::new(zone, cardcode)),
            _ => None,
        };
        if let Some(attempt) = attempt.as_mut() {
            attempt.evaluating();
        }

        let decider = self.decider.for_attempt();
        let result = AssertUnwindSafe(self.invoke(delivery, &decider))
            .catch_unwind()
            .await;

        let outcome = match result {
            Ok(Ok(())) => DispatchOutcome::Handled,
            Ok(Err(e)) => {
                tracing::warn!(policy, %capability, error = %e, "Policy handler failed");
                DispatchOutcome::Failed
            }
            Err(panic) => {
                tracing::error!(
                    policy,
                    %capability,
                    panic = panic_message(panic.as_ref()),
                    "Policy handler panicked"
                );
                DispatchOutcome::Panicked
            }
        };

        if let Some(attempt) = attempt.as_mut() {
            attempt.settle(policy, decider.decisions());
        }
        outcome
    }

    async fn invoke(&self, delivery: Delivery, decider: &Decider) -> Result<(), PolicyError> {
        let policy = self.policy.as_ref();
        match delivery {
            Delivery::KeyPress { zone, keycode } => policy.on_key_press(zone, keycode, decider).await,
            Delivery::CardRead { zone, cardcode } => {
                policy.on_card_read(zone, cardcode, decider).await
            }
            Delivery::Tamper { zone } => policy.on_tamper(zone).await,
            Delivery::PingTimeout => policy.on_ping_timeout().await,
            Delivery::Watchdog => policy.on_watchdog().await,
            Delivery::Action { zone, action } => policy.on_action(zone, action).await,
            Delivery::Shutdown => Ok(()),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBroker;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    fn zone(id: u32) -> Zone {
        Zone::new(id).unwrap()
    }

    #[derive(Clone, Copy)]
    enum OnCard {
        Accept,
        Reject,
        Twice,
        Nothing,
        Fail,
        Panic,
    }

    struct Recorder {
        capabilities: CapabilitySet,
        on_card: OnCard,
        seen: Arc<StdMutex<Vec<String>>>,
    }

    impl Recorder {
        fn new(capabilities: impl Into<CapabilitySet>, on_card: OnCard) -> Self {
            Self {
                capabilities: capabilities.into(),
                on_card,
                seen: Arc::default(),
            }
        }

        fn record(&self, entry: String) {
            self.seen.lock().unwrap().push(entry);
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Policy for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn capabilities(&self) -> CapabilitySet {
            self.capabilities
        }

        async fn on_card_read(
            &self,
            zone: Zone,
            cardcode: CardCode,
            decider: &Decider,
        ) -> Result<(), PolicyError> {
            self.record(format!("cardread {zone} {cardcode}"));
            match self.on_card {
                OnCard::Accept => decider.accept(zone).await?,
                OnCard::Reject => decider.reject(zone).await?,
                OnCard::Twice => {
                    decider.accept(zone).await?;
                    decider.reject(zone).await?;
                }
                OnCard::Nothing => {}
                OnCard::Fail => return Err(PolicyError::lookup("directory unreachable")),
                OnCard::Panic => panic!("policy bug"),
            }
            Ok(())
        }

        async fn on_tamper(&self, zone: Zone) -> Result<(), PolicyError> {
            self.record(format!("tamper {zone}"));
            Ok(())
        }

        async fn on_watchdog(&self) -> Result<(), PolicyError> {
            self.record("watchdog".into());
            Ok(())
        }

        async fn on_action(&self, zone: Zone, action: Action) -> Result<(), PolicyError> {
            self.record(format!("action {zone} {action}"));
            Ok(())
        }
    }

    fn card_read(zone_id: u32, cardcode: CardCode) -> BusMessage {
        BusMessage::zone_event(&ZoneEvent::CardRead {
            zone: zone(zone_id),
            cardcode,
        })
        .unwrap()
    }

    struct Setup {
        runtime: PluginRuntime<Recorder>,
        actions: Inbox,
        _watcher: crate::bus::LocalBus,
    }

    async fn setup(policy: Recorder) -> Setup {
        let broker = LocalBroker::new();
        let (watcher, actions) = broker.connect();
        watcher.subscribe("reader/+/action").await.unwrap();
        let (bus, _inbox) = broker.connect();
        Setup {
            runtime: PluginRuntime::new(policy, Arc::new(bus)),
            actions,
            _watcher: watcher,
        }
    }

    #[test]
    fn subscriptions_follow_capabilities() {
        let broker = LocalBroker::new();
        let (bus, _) = broker.connect();
        let runtime = PluginRuntime::new(
            Recorder::new(
                [
                    Capability::CardRead,
                    Capability::PingTimeout,
                    Capability::Watchdog,
                ],
                OnCard::Nothing,
            ),
            Arc::new(bus),
        );
        assert_eq!(runtime.subscriptions(), ["reader/+/cardread", "system"]);
    }

    #[tokio::test]
    async fn undeclared_capability_is_never_subscribed_or_delivered() {
        let broker = LocalBroker::new();
        let (publisher, _) = broker.connect();
        let (bus, mut inbox) = broker.connect();
        let runtime = PluginRuntime::new(
            Recorder::new([Capability::CardRead], OnCard::Nothing),
            Arc::new(bus),
        );
        runtime.start().await.unwrap();

        let tamper = BusMessage::zone_event(&ZoneEvent::Tamper { zone: zone(1) }).unwrap();
        publisher.publish(tamper.clone()).await.unwrap();
        assert!(inbox.try_recv().is_err());

        assert_eq!(runtime.dispatch(&tamper).await, DispatchOutcome::Ignored);
        assert!(runtime.policy().seen().is_empty());
    }

    #[tokio::test]
    async fn system_topic_is_filtered_per_event() {
        let s = setup(Recorder::new([Capability::Watchdog], OnCard::Nothing)).await;

        let timeout = BusMessage::system(SystemEvent::Timeout).unwrap();
        let watchdog = BusMessage::system(SystemEvent::Watchdog).unwrap();
        assert_eq!(s.runtime.dispatch(&timeout).await, DispatchOutcome::Ignored);
        assert_eq!(s.runtime.dispatch(&watchdog).await, DispatchOutcome::Handled);
        assert_eq!(
            s.runtime.dispatch(&BusMessage::shutdown().unwrap()).await,
            DispatchOutcome::Ignored
        );
        assert_eq!(s.runtime.policy().seen(), ["watchdog"]);
    }

    #[tokio::test]
    async fn card_read_decision_is_published() {
        let mut s = setup(Recorder::new([Capability::CardRead], OnCard::Reject)).await;

        let outcome = s.runtime.dispatch(&card_read(3, 99)).await;
        assert_eq!(outcome, DispatchOutcome::Handled);
        assert_eq!(s.runtime.policy().seen(), ["cardread 3 99"]);

        let action = s.actions.recv().await.unwrap();
        assert_eq!(action.topic, "reader/3/action");
        assert_eq!(action.payload_str().unwrap(), "reject");
    }

    #[tokio::test]
    async fn undecided_and_double_decisions_are_not_corrected() {
        let mut s = setup(Recorder::new([Capability::CardRead], OnCard::Nothing)).await;
        assert_eq!(
            s.runtime.dispatch(&card_read(1, 5)).await,
            DispatchOutcome::Handled
        );
        assert!(s.actions.try_recv().is_err());

        let mut s = setup(Recorder::new([Capability::CardRead], OnCard::Twice)).await;
        s.runtime.dispatch(&card_read(1, 5)).await;
        assert_eq!(s.actions.recv().await.unwrap().payload_str().unwrap(), "accept");
        assert_eq!(s.actions.recv().await.unwrap().payload_str().unwrap(), "reject");
    }

    #[tokio::test]
    async fn handler_errors_and_panics_are_isolated() {
        let mut s = setup(Recorder::new([Capability::CardRead], OnCard::Fail)).await;
        assert_eq!(
            s.runtime.dispatch(&card_read(1, 5)).await,
            DispatchOutcome::Failed
        );
        assert!(s.actions.try_recv().is_err());

        let s = setup(Recorder::new(
            [Capability::CardRead, Capability::Tamper],
            OnCard::Panic,
        ))
        .await;
        assert_eq!(
            s.runtime.dispatch(&card_read(1, 5)).await,
            DispatchOutcome::Panicked
        );

        let tamper = BusMessage::zone_event(&ZoneEvent::Tamper { zone: zone(2) }).unwrap();
        assert_eq!(s.runtime.dispatch(&tamper).await, DispatchOutcome::Handled);
        assert_eq!(s.runtime.policy().seen(), ["cardread 1 5", "tamper 2"]);
    }

    #[tokio::test]
    async fn action_messages_reach_on_action() {
        let s = setup(Recorder::new([Capability::Action], OnCard::Nothing)).await;
        let message = BusMessage::action(zone(4), Action::Accept);
        assert_eq!(s.runtime.dispatch(&message).await, DispatchOutcome::Handled);

        let bogus = BusMessage::new("reader/4/action", "maybe");
        assert_eq!(s.runtime.dispatch(&bogus).await, DispatchOutcome::Undecodable);
        assert_eq!(s.runtime.policy().seen(), ["action 4 accept"]);
    }

    #[tokio::test]
    async fn mismatched_topic_and_payload_are_dropped() {
        let s = setup(Recorder::new([Capability::CardRead], OnCard::Accept)).await;
        let payload = card_read(2, 1234).payload;
        let message = BusMessage::new("reader/3/cardread", payload);
        assert_eq!(
            s.runtime.dispatch(&message).await,
            DispatchOutcome::Undecodable
        );
        assert!(s.runtime.policy().seen().is_empty());
    }

    #[test]
    fn attempt_states() {
        let mut attempt = CardAttempt::new(zone(1), 1);
        assert_eq!(attempt.state, AttemptState::Presented);
        attempt.evaluating();
        assert_eq!(attempt.settle("test", 0), AttemptState::Evaluating);
        assert_eq!(attempt.settle("test", 1), AttemptState::Decided);
    }
}
