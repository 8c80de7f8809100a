//! Serial link to the IO board.
//!
//! The link owns the read half of the serial line and relays board events
//! to the bus. Writes (pings and access decisions) share one mutex-guarded
//! framed writer, so the running loop and the action loop never interleave
//! partial lines.
//!
//! ```text
//! Connecting ──open──▶ HealthCheck ──*P──▶ Running
//!      │                    │                 │
//!      └────────────────────┴── error ────────┴──▶ Faulted
//! ```

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, watch};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::FrameCodec;
use crate::bridge::protocol::{DecodeError, Frame};
use crate::bus::{
    Action, Bus, BusError, BusMessage, Inbox, ReaderEvent, SystemEvent, Topic, ZoneEvent,
};
use crate::config::SerialConfig;
use crate::health::{HealthState, LinkState, PING_TIMEOUT_THRESHOLD};

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("failed to open serial port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: tokio_serial::Error,
    },

    #[error("health check failed: {0}")]
    HealthCheck(String),

    #[error("serial I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serial line closed")]
    Closed,

    #[error("failed to subscribe to actions: {0}")]
    Subscribe(#[source] BusError),

    #[error("bus connection closed")]
    BusClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTimings {
    /// Read window in the running loop; an empty window sends a ping.
    pub read_timeout: Duration,
    pub health_check_timeout: Duration,
    pub ping_timeout_threshold: u32,
}

impl Default for LinkTimings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(5),
            health_check_timeout: Duration::from_secs(1),
            ping_timeout_threshold: PING_TIMEOUT_THRESHOLD,
        }
    }
}

/// Open the configured serial device (8N1, no flow control).
fn open_serial(config: &SerialConfig) -> Result<SerialStream, LinkError> {
    tracing::info!(port = %config.port, speed = config.speed, "Opening serial port");
    tokio_serial::new(config.port.as_str(), config.speed)
        .open_native_async()
        .map_err(|source| LinkError::Open {
            port: config.port.clone(),
            source,
        })
}

type FrameWriter<S> = Arc<Mutex<FramedWrite<WriteHalf<S>, FrameCodec>>>;

pub struct IoBoardLink<S> {
    reader: FramedRead<ReadHalf<S>, FrameCodec>,
    writer: FrameWriter<S>,
    bus: Arc<dyn Bus>,
    health: HealthState,
    timings: LinkTimings,
    state: watch::Sender<LinkState>,
}

impl IoBoardLink<SerialStream> {
    /// Open the serial port and wrap it in a link. A port that cannot be
    /// opened moves `state` straight to `Faulted`.
    pub fn open(
        config: &SerialConfig,
        bus: Arc<dyn Bus>,
        timings: LinkTimings,
        state: watch::Sender<LinkState>,
    ) -> Result<Self, LinkError> {
        match open_serial(config) {
            Ok(stream) => Ok(Self::with_state(stream, bus, timings, state)),
            Err(e) => {
                let previous = state.send_replace(LinkState::Faulted);
                tracing::debug!(from = %previous, to = %LinkState::Faulted, "Link state changed");
                Err(e)
            }
        }
    }
}

impl<S> IoBoardLink<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S, bus: Arc<dyn Bus>, timings: LinkTimings) -> Self {
        let (state, _) = watch::channel(LinkState::Connecting);
        Self::with_state(stream, bus, timings, state)
    }

    /// Build a link that reports into a state channel the caller already watches.
    pub fn with_state(
        stream: S,
        bus: Arc<dyn Bus>,
        timings: LinkTimings,
        state: watch::Sender<LinkState>,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: FramedRead::new(read_half, FrameCodec::new()),
            writer: Arc::new(Mutex::new(FramedWrite::new(write_half, FrameCodec::new()))),
            bus,
            health: HealthState::new(timings.ping_timeout_threshold),
            timings,
            state,
        }
    }

    pub fn state_watch(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn health(&self) -> &HealthState {
        &self.health
    }

    /// Writer for decisions arriving on the bus.
    pub fn action_writer(&self) -> ActionWriter<S> {
        ActionWriter {
            writer: Arc::clone(&self.writer),
        }
    }

    fn set_state(&self, state: LinkState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "Link state changed");
        }
    }

    async fn send(&self, frame: Frame) -> Result<(), LinkError> {
        let mut writer = self.writer.lock().await;
        writer.send(frame).await?;
        Ok(())
    }

    /// Send one ping and require `*P` as the very next line.
    pub async fn health_check(&mut self) -> Result<(), LinkError> {
        self.set_state(LinkState::HealthCheck);

        let result = match self.send(Frame::PingRequest).await {
            Ok(()) => self.await_ping_reply().await,
            Err(e) => Err(e),
        };

        match &result {
            Ok(()) => {
                tracing::info!("IO board answered health check");
                self.set_state(LinkState::Running);
            }
            Err(e) => {
                tracing::debug!(error = %e, "Health check failed");
                self.set_state(LinkState::Faulted);
            }
        }
        result
    }

    async fn await_ping_reply(&mut self) -> Result<(), LinkError> {
        let next = tokio::time::timeout(self.timings.health_check_timeout, self.reader.next());
        match next.await {
            Err(_) => Err(LinkError::HealthCheck(format!(
                "no reply within {:?}",
                self.timings.health_check_timeout
            ))),
            Ok(None) => Err(LinkError::Closed),
            Ok(Some(Err(e))) => Err(e.into()),
            Ok(Some(Ok(Ok(Frame::PingReply)))) => Ok(()),
            Ok(Some(Ok(Ok(frame)))) => Err(LinkError::HealthCheck(format!(
                "expected ping reply, got {}",
                frame.encode()
            ))),
            Ok(Some(Ok(Err(e)))) => Err(LinkError::HealthCheck(format!("unreadable reply: {e}"))),
        }
    }

    /// One read window of the running loop.
    pub async fn step(&mut self) -> Result<(), LinkError> {
        let next = tokio::time::timeout(self.timings.read_timeout, self.reader.next());
        match next.await {
            Err(_) => self.on_read_timeout().await,
            Ok(None) => Err(LinkError::Closed),
            Ok(Some(Err(e))) => Err(e.into()),
            Ok(Some(Ok(Err(DecodeError::Empty)))) => {
                tracing::debug!("Skipping empty line");
                Ok(())
            }
            Ok(Some(Ok(Err(e)))) => {
                tracing::warn!(error = %e, "Discarding malformed line from IO board");
                Ok(())
            }
            Ok(Some(Ok(Ok(frame)))) => {
                self.on_frame(frame).await;
                Ok(())
            }
        }
    }

    async fn on_read_timeout(&mut self) -> Result<(), LinkError> {
        self.send(Frame::PingRequest).await?;
        if self.health.read_timed_out() {
            tracing::warn!(
                missed_pings = self.health.missed_pings(),
                "IO board is not answering pings"
            );
            self.publish_system(SystemEvent::Timeout).await;
        } else {
            tracing::trace!(missed_pings = self.health.missed_pings(), "Read window empty, pinged");
        }
        Ok(())
    }

    async fn on_frame(&mut self, frame: Frame) {
        match frame {
            Frame::PingReply => {
                tracing::trace!("Ping reply");
                self.health.ping_replied();
            }
            Frame::Watchdog => {
                tracing::warn!("IO board was reset by its watchdog");
                self.publish_system(SystemEvent::Watchdog).await;
            }
            Frame::KeyPress { zone, keycode } => {
                tracing::info!(%zone, keycode, "Key press");
                self.publish_zone(ZoneEvent::KeyPress { zone, keycode })
                    .await;
            }
            Frame::CardRead { zone, cardcode } => {
                tracing::info!(%zone, cardcode, "Card read");
                self.publish_zone(ZoneEvent::CardRead { zone, cardcode })
                    .await;
            }
            Frame::Tamper { zone } => {
                tracing::warn!(%zone, "Tamper alarm");
                self.publish_zone(ZoneEvent::Tamper { zone }).await;
            }
            Frame::PingRequest | Frame::Accept { .. } | Frame::Reject { .. } => {
                tracing::warn!(line = %frame.encode(), "Unknown event kind from IO board");
            }
        }
    }

    async fn publish_zone(&self, event: ZoneEvent) {
        match BusMessage::zone_event(&event) {
            Ok(message) => self.publish(message).await,
            Err(e) => tracing::error!(error = %e, "Failed to encode zone event"),
        }
    }

    async fn publish_system(&self, event: SystemEvent) {
        match BusMessage::system(event) {
            Ok(message) => self.publish(message).await,
            Err(e) => tracing::error!(error = %e, "Failed to encode system event"),
        }
    }

    async fn publish(&self, message: BusMessage) {
        let topic = message.topic.clone();
        if let Err(e) = self.bus.publish(message).await {
            tracing::warn!(%topic, error = %e, "Failed to publish to bus");
        }
    }

    /// Run read windows until a fatal error.
    pub async fn run(&mut self) -> Result<(), LinkError> {
        self.set_state(LinkState::Running);
        loop {
            if let Err(e) = self.step().await {
                self.set_state(LinkState::Faulted);
                return Err(e);
            }
        }
    }

    /// Subscribe to decisions, then run the read loop and the action loop
    /// together until either fails.
    pub async fn serve(mut self, inbox: Inbox) -> Result<(), LinkError> {
        let pattern = ReaderEvent::Action.pattern();
        self.bus
            .subscribe(&pattern)
            .await
            .map_err(LinkError::Subscribe)?;
        tracing::info!(%pattern, "Listening for access decisions");

        let actions = self.action_writer();
        tokio::try_join!(self.run(), actions.run(inbox))?;
        Ok(())
    }
}

/// Writes `accept`/`reject` decisions from the bus to the IO board.
pub struct ActionWriter<S> {
    writer: FrameWriter<S>,
}

impl<S> Clone for ActionWriter<S> {
    fn clone(&self) -> Self {
        Self {
            writer: Arc::clone(&self.writer),
        }
    }
}

impl<S> ActionWriter<S>
where
    S: AsyncWrite + Send + 'static,
{
    /// Invalid messages are logged and dropped; only serial errors fail.
    pub async fn handle(&self, message: &BusMessage) -> Result<(), LinkError> {
        let zone = match Topic::parse(&message.topic) {
            Ok(Topic::Reader {
                zone,
                event: ReaderEvent::Action,
            }) => zone,
            Ok(_) => {
                tracing::debug!(topic = %message.topic, "Ignoring non-action message");
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(topic = %message.topic, error = %e, "Ignoring action with bad topic");
                return Ok(());
            }
        };

        let action = match message
            .payload_str()
            .and_then(|payload| payload.parse::<Action>())
        {
            Ok(action) => action,
            Err(e) => {
                tracing::warn!(%zone, error = %e, "Ignoring invalid action");
                return Ok(());
            }
        };

        tracing::info!(%zone, %action, "Sending decision to IO board");
        let mut writer = self.writer.lock().await;
        writer.send(action.frame(zone)).await?;
        Ok(())
    }

    pub async fn run(self, mut inbox: Inbox) -> Result<(), LinkError> {
        while let Some(message) = inbox.recv().await {
            self.handle(&message).await?;
        }
        tracing::error!("Bus inbox closed");
        Err(LinkError::BusClosed)
    }
}
