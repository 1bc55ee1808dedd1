//! Push notifications for monitor changes.
//!
//! The latest snapshot travels on a `watch` channel; this broadcast stream
//! tells consumers *what* happened, for logging or UI transitions.

use tokio::sync::broadcast;

use super::coordinator::UsageMonitor;
use crate::estimator::Severity;
use crate::probe::{CleanupOutcome, OrphanSweepReport, ProbeOutcome};

/// Events emitted by the monitor.
///
/// Receivers that fall behind lose the oldest events (lagged).
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    /// The published snapshot carries new quota or token data
    SnapshotUpdated,

    /// The passive listener came up or went away
    ListenerAvailability {
        available: bool,
        /// Why it went away
        reason: Option<String>,
    },

    /// An active probe finished (or was rejected)
    ProbeFinished {
        outcome: ProbeOutcome,
        success: bool,
        manual: bool,
    },

    /// The cap-pressure severity tier changed
    CapPressureChanged {
        severity: Severity,
        minutes_to_cap: Option<f64>,
    },

    /// Orphan sweep or session-log cleanup completed
    CleanupFinished {
        sweep: Option<OrphanSweepReport>,
        sessions: Option<CleanupOutcome>,
    },
}

impl UsageMonitor {
    /// Subscribe to monitor events
    pub fn events(&self) -> broadcast::Receiver<MonitorEvent> {
        self.event_sender().subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::monitor::UsageMonitorBuilder;

    #[tokio::test]
    async fn test_events_reach_every_receiver() {
        let monitor = UsageMonitorBuilder::new(Settings::default()).build();
        let mut rx1 = monitor.events();
        let mut rx2 = monitor.events();

        monitor
            .event_sender()
            .send(MonitorEvent::SnapshotUpdated)
            .unwrap();

        assert_eq!(rx1.recv().await.unwrap(), MonitorEvent::SnapshotUpdated);
        assert_eq!(rx2.recv().await.unwrap(), MonitorEvent::SnapshotUpdated);
    }

    #[test]
    fn test_emit_without_subscribers() {
        let monitor = UsageMonitorBuilder::new(Settings::default()).build();
        // Must not panic with nobody listening.
        monitor.emit(MonitorEvent::SnapshotUpdated);
    }
}
