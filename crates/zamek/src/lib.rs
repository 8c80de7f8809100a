//! zamek: serial IO board link and policy runtime for RFID door access.

mod health;

pub mod bridge;
pub mod bus;
pub mod config;
pub mod link;
pub mod logging;
pub mod policy;
pub mod runtime;


pub const ZAMEK_VERSION: &str = env!("CARGO_PKG_VERSION");

pub use bridge::codec::FrameCodec;
pub use bridge::protocol::{CardCode, DecodeError, Frame, KeyCode, Zone};
pub use bus::{
    Action, Bus, BusError, BusMessage, Inbox, LocalBroker, LocalBus, MqttBus, SystemEvent,
    ZoneEvent,
};
pub use config::{Config, ConfigError};
pub use health::{HealthState, LinkState, PING_TIMEOUT_THRESHOLD};
pub use link::{ActionWriter, IoBoardLink, LinkError, LinkTimings};
pub use policy::{Capability, CapabilitySet, Decider, Policy, PolicyError};
pub use runtime::{DispatchOutcome, PluginRuntime};
