use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;

use crate::config::CapPressureSettings;
use crate::estimator::CapPressureEstimator;
use crate::usage::{AgentKind, FreshnessTtl, SourceModel, Staleness, UsageSnapshot};

/// Shared state type alias
pub type SharedState = Arc<RwLock<MonitorState>>;

/// Sender for usage snapshot updates
pub type SnapshotSender = watch::Sender<UsageSnapshot>;
/// Receiver for usage snapshot updates
pub type SnapshotReceiver = watch::Receiver<UsageSnapshot>;

/// Create a watch channel for usage snapshots
pub fn snapshot_channel() -> (SnapshotSender, SnapshotReceiver) {
    watch::channel(UsageSnapshot::default())
}

/// Everything the monitor mutates. Guarded by one lock; observers only
/// ever receive copies of `snapshot`.
#[derive(Debug)]
pub struct MonitorState {
    /// Poll loop keeps going while true
    pub running: bool,
    /// Some observer currently displays usage
    pub visible: bool,
    /// Agent whose quota is tracked
    pub agent: AgentKind,
    /// Current best-known usage
    pub snapshot: UsageSnapshot,
    /// Cap-pressure forecaster fed from scans and probes
    pub estimator: CapPressureEstimator,
    /// Grace windows after manual probes
    pub freshness: FreshnessTtl,
    /// Last successful probe or listener report, for poll-sourced staleness
    pub last_poll_success: Option<DateTime<Utc>>,
    /// Last automatic probe launch
    pub last_auto_probe: Option<DateTime<Utc>>,
    /// Rejection timestamps already fed to the estimator
    pub seen_rejections: Vec<DateTime<Utc>>,
}

impl MonitorState {
    /// Create a new monitor state
    pub fn new(agent: AgentKind, cap_pressure: CapPressureSettings) -> Self {
        Self {
            running: false,
            visible: true,
            agent,
            snapshot: UsageSnapshot::default(),
            estimator: CapPressureEstimator::new(cap_pressure),
            freshness: FreshnessTtl::new(),
            last_poll_success: None,
            last_auto_probe: None,
            seen_rejections: Vec::new(),
        }
    }

    /// Create a shared state
    pub fn shared(agent: AgentKind, cap_pressure: CapPressureSettings) -> SharedState {
        Arc::new(RwLock::new(Self::new(agent, cap_pressure)))
    }

    /// Staleness of the log-derived data, honoring the freshness grace
    pub fn staleness(&self, now: DateTime<Utc>) -> Staleness {
        let ts = self
            .freshness
            .effective_timestamp(self.agent, self.snapshot.event_timestamp, now);
        Staleness::evaluate(SourceModel::EventSourced, ts, now)
    }

    /// Staleness judged by the last successful active report
    pub fn poll_staleness(&self, now: DateTime<Utc>) -> Staleness {
        let ts = self
            .freshness
            .effective_timestamp(self.agent, self.last_poll_success, now);
        Staleness::evaluate(SourceModel::PollSourced, ts, now)
    }

    /// Staleness under the tracked agent's source model
    pub fn current_staleness(&self, now: DateTime<Utc>) -> Staleness {
        match self.agent.source_model() {
            SourceModel::EventSourced => self.staleness(now),
            SourceModel::PollSourced => self.poll_staleness(now),
        }
    }

    /// Remember rejection timestamps and return the ones not seen before
    pub fn take_new_rejections(&mut self, rejections: &[DateTime<Utc>]) -> Vec<DateTime<Utc>> {
        let fresh: Vec<DateTime<Utc>> = rejections
            .iter()
            .copied()
            .filter(|ts| !self.seen_rejections.contains(ts))
            .collect();
        self.seen_rejections.extend(fresh.iter().copied());
        // Only the estimator's trailing window matters.
        if self.seen_rejections.len() > 64 {
            self.seen_rejections.sort();
            let excess = self.seen_rejections.len() - 64;
            self.seen_rejections.drain(..excess);
        }
        fresh
    }
}
