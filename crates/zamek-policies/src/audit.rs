use async_trait::async_trait;

use zamek::logging::AUDIT_TARGET;
use zamek::{Action, CardCode, Capability, CapabilitySet, Decider, Policy, PolicyError, Zone};

/// Writes one audit line per card scan and per decision seen on the bus.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingPolicy;

pub fn scan_line(zone: Zone, cardcode: CardCode) -> String {
    format!("{zone}: scan: {cardcode}")
}

pub fn action_line(zone: Zone, action: Action) -> String {
    format!("{zone}: {action}")
}

#[async_trait]
impl Policy for LoggingPolicy {
    fn name(&self) -> &str {
        "logging"
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::from([Capability::CardRead, Capability::Action])
    }

    async fn on_card_read(
        &self,
        zone: Zone,
        cardcode: CardCode,
        _decider: &Decider,
    ) -> Result<(), PolicyError> {
        tracing::info!(target: AUDIT_TARGET, "{}", scan_line(zone, cardcode));
        Ok(())
    }

    async fn on_action(&self, zone: Zone, action: Action) -> Result<(), PolicyError> {
        tracing::info!(target: AUDIT_TARGET, "{}", action_line(zone, action));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use zamek::{Bus, LocalBroker, PluginRuntime};

    #[test]
    fn audit_lines() {
        let zone = Zone::new(2).unwrap();
        assert_eq!(scan_line(zone, 1234), "2: scan: 1234");
        assert_eq!(action_line(zone, Action::Reject), "2: reject");
    }

    #[test]
    fn subscribes_to_scans_and_actions() {
        let broker = LocalBroker::new();
        let (bus, _) = broker.connect();
        let runtime = PluginRuntime::new(LoggingPolicy, Arc::new(bus));
        assert_eq!(
            runtime.subscriptions(),
            ["reader/+/cardread", "reader/+/action"]
        );
    }

    #[tokio::test]
    async fn never_decides() {
        let broker = LocalBroker::new();
        let (watcher, mut actions) = broker.connect();
        watcher.subscribe("reader/+/action").await.unwrap();
        let (bus, _) = broker.connect();
        let decider = Decider::new(Arc::new(bus));

        LoggingPolicy
            .on_card_read(Zone::new(1).unwrap(), 42, &decider)
            .await
            .unwrap();

        assert!(actions.try_recv().is_err());
    }
}
