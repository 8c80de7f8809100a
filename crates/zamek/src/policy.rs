//! Authorization policy interface.
//!
//! A policy declares which events it handles through [`Policy::capabilities`]
//! and overrides the matching `on_*` methods. The runtime subscribes to
//! exactly the topics those capabilities need and never calls a handler
//! that was not declared.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::bridge::protocol::{CardCode, KeyCode, Zone};
use crate::bus::{Action, Bus, BusError, BusMessage, ReaderEvent, SYSTEM_TOPIC};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    KeyPress,
    CardRead,
    Tamper,
    PingTimeout,
    Watchdog,
    Action,
}

impl Capability {
    pub const ALL: [Capability; 6] = [
        Self::KeyPress,
        Self::CardRead,
        Self::Tamper,
        Self::PingTimeout,
        Self::Watchdog,
        Self::Action,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KeyPress => "keypress",
            Self::CardRead => "cardread",
            Self::Tamper => "tamper",
            Self::PingTimeout => "pingtimeout",
            Self::Watchdog => "watchdog",
            Self::Action => "action",
        }
    }

    /// Subscription needed to receive this capability's events. Ping
    /// timeouts and watchdog resets share the `system` topic.
    pub fn topic_pattern(&self) -> String {
        match self {
            Self::KeyPress => ReaderEvent::KeyPress.pattern(),
            Self::CardRead => ReaderEvent::CardRead.pattern(),
            Self::Tamper => ReaderEvent::Tamper.pattern(),
            Self::Action => ReaderEvent::Action.pattern(),
            Self::PingTimeout | Self::Watchdog => SYSTEM_TOPIC.to_string(),
        }
    }

    fn bit(&self) -> u8 {
        1 << (*self as u8)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilitySet(u8);

impl CapabilitySet {
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub fn with(self, capability: Capability) -> Self {
        Self(self.0 | capability.bit())
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL
            .into_iter()
            .filter(|capability| self.contains(*capability))
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), Self::with)
    }
}

impl<const N: usize> From<[Capability; N]> for CapabilitySet {
    fn from(capabilities: [Capability; N]) -> Self {
        capabilities.into_iter().collect()
    }
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Publishes access decisions on behalf of a policy.
#[derive(Clone)]
pub struct Decider {
    bus: Arc<dyn Bus>,
    decisions: Arc<AtomicUsize>,
}

impl Decider {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self {
            bus,
            decisions: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn accept(&self, zone: Zone) -> Result<(), BusError> {
        self.decide(zone, Action::Accept).await
    }

    pub async fn reject(&self, zone: Zone) -> Result<(), BusError> {
        self.decide(zone, Action::Reject).await
    }

    async fn decide(&self, zone: Zone, action: Action) -> Result<(), BusError> {
        tracing::debug!(%zone, %action, "Publishing decision");
        self.bus.publish(BusMessage::action(zone, action)).await?;
        // Only a delivered decision settles the attempt.
        self.decisions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Fresh decision counter sharing this decider's bus connection.
    pub(crate) fn for_attempt(&self) -> Self {
        Self {
            bus: Arc::clone(&self.bus),
            decisions: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn decisions(&self) -> usize {
        self.decisions.load(Ordering::SeqCst)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("lookup failed: {0}")]
    Lookup(String),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl PolicyError {
    pub fn lookup(message: impl Into<String>) -> Self {
        Self::Lookup(message.into())
    }
}

/// An authorization policy run by [`crate::runtime::PluginRuntime`].
///
/// Handlers run one at a time. A card-read handler must call exactly one of
/// [`Decider::accept`] or [`Decider::reject`]; leaving the attempt undecided
/// leaves the lock unchanged.
#[async_trait]
pub trait Policy: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn capabilities(&self) -> CapabilitySet;

    async fn on_key_press(
        &self,
        _zone: Zone,
        _keycode: KeyCode,
        _decider: &Decider,
    ) -> Result<(), PolicyError> {
        Ok(())
    }

    async fn on_card_read(
        &self,
        _zone: Zone,
        _cardcode: CardCode,
        _decider: &Decider,
    ) -> Result<(), PolicyError> {
        Ok(())
    }

    async fn on_tamper(&self, _zone: Zone) -> Result<(), PolicyError> {
        Ok(())
    }

    async fn on_ping_timeout(&self) -> Result<(), PolicyError> {
        Ok(())
    }

    async fn on_watchdog(&self) -> Result<(), PolicyError> {
        Ok(())
    }

    /// A decision seen on the bus, from this or any other policy.
    async fn on_action(&self, _zone: Zone, _action: Action) -> Result<(), PolicyError> {
        Ok(())
    }
}
