//! Staleness and freshness policy.
//!
//! Pure functions. Event-sourced data ages strictly by its log event
//! timestamp; poll-sourced data ages by its last successful poll. The
//! freshness TTL only substitutes the timestamp fed into those checks.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use super::types::{AgentKind, QuotaWindow};

/// Grace period granted after a successful manual probe, in seconds
pub const FRESHNESS_TTL_SECS: i64 = 60 * 60;

/// How a source obtains its usage data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceModel {
    /// Derived from passive log events
    EventSourced,
    /// Derived from active polling only
    PollSourced,
}

impl SourceModel {
    /// Maximum age before data for `window` is stale
    pub fn threshold(&self, window: QuotaWindow) -> Duration {
        match (self, window) {
            (SourceModel::EventSourced, QuotaWindow::FiveHour) => Duration::minutes(30),
            (SourceModel::EventSourced, QuotaWindow::Weekly) => Duration::hours(4),
            (SourceModel::PollSourced, QuotaWindow::FiveHour) => Duration::minutes(90),
            (SourceModel::PollSourced, QuotaWindow::Weekly) => Duration::hours(6),
        }
    }
}

/// True when `timestamp` is older than the window's threshold (or absent)
pub fn is_stale(
    model: SourceModel,
    window: QuotaWindow,
    timestamp: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    match timestamp {
        Some(ts) => now - ts > model.threshold(window),
        None => true,
    }
}

/// Per-window staleness for a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct Staleness {
    /// Short window stale
    pub five_hour: bool,
    /// Weekly window stale
    pub weekly: bool,
}

impl Staleness {
    /// Evaluate both windows
    pub fn evaluate(model: SourceModel, timestamp: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        Self {
            five_hour: is_stale(model, QuotaWindow::FiveHour, timestamp, now),
            weekly: is_stale(model, QuotaWindow::Weekly, timestamp, now),
        }
    }

    /// True when either window is stale
    pub fn any(&self) -> bool {
        self.five_hour || self.weekly
    }
}

/// Source-scoped freshness grants after manual probes
#[derive(Debug, Clone, Default)]
pub struct FreshnessTtl {
    granted: HashMap<AgentKind, DateTime<Utc>>,
    ttl: Option<Duration>,
}

impl FreshnessTtl {
    /// Tracker using the default one-hour TTL
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker with a custom TTL
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            granted: HashMap::new(),
            ttl: Some(ttl),
        }
    }

    fn ttl(&self) -> Duration {
        self.ttl
            .unwrap_or_else(|| Duration::seconds(FRESHNESS_TTL_SECS))
    }

    /// Record a successful manual probe for `agent`
    pub fn grant(&mut self, agent: AgentKind, at: DateTime<Utc>) {
        self.granted.insert(agent, at);
    }

    /// Whether `agent` is inside its grace window
    pub fn is_active(&self, agent: AgentKind, now: DateTime<Utc>) -> bool {
        self.granted
            .get(&agent)
            .is_some_and(|at| *at <= now && now - *at < self.ttl())
    }

    /// Drop expired grants
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let ttl = self.ttl();
        self.granted.retain(|_, at| now - *at < ttl);
    }

    /// Timestamp to feed into staleness checks: `now` during a grace window,
    /// the underlying timestamp otherwise.
    pub fn effective_timestamp(
        &self,
        agent: AgentKind,
        underlying: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if self.is_active(agent, now) {
            Some(now)
        } else {
            underlying
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_event_sourced_thresholds() {
        let model = SourceModel::EventSourced;
        let ts = Some(now() - Duration::minutes(31));
        assert!(is_stale(model, QuotaWindow::FiveHour, ts, now()));
        assert!(!is_stale(model, QuotaWindow::Weekly, ts, now()));
        assert!(!is_stale(
            model,
            QuotaWindow::FiveHour,
            Some(now() - Duration::minutes(30)),
            now()
        ));
        assert!(is_stale(
            model,
            QuotaWindow::Weekly,
            Some(now() - Duration::hours(5)),
            now()
        ));
    }

    #[test]
    fn test_poll_sourced_thresholds() {
        let model = SourceModel::PollSourced;
        let ts = Some(now() - Duration::minutes(60));
        assert!(!is_stale(model, QuotaWindow::FiveHour, ts, now()));
        assert!(is_stale(
            model,
            QuotaWindow::FiveHour,
            Some(now() - Duration::minutes(91)),
            now()
        ));
        assert!(is_stale(
            model,
            QuotaWindow::Weekly,
            Some(now() - Duration::hours(7)),
            now()
        ));
    }

    #[test]
    fn test_missing_timestamp_is_stale() {
        let staleness = Staleness::evaluate(SourceModel::EventSourced, None, now());
        assert!(staleness.five_hour && staleness.weekly);
    }

    #[test]
    fn test_recent_refresh_does_not_smooth_event_age() {
        // A refresh 10 seconds ago carries no event: only the event time counts.
        let event = Some(now() - Duration::minutes(45));
        let ttl = FreshnessTtl::new();
        let effective = ttl.effective_timestamp(AgentKind::Codex, event, now());
        assert!(is_stale(
            SourceModel::EventSourced,
            QuotaWindow::FiveHour,
            effective,
            now()
        ));
    }

    #[test]
    fn test_freshness_ttl_is_source_scoped_and_expires() {
        let mut ttl = FreshnessTtl::new();
        let event = Some(now() - Duration::hours(2));
        ttl.grant(AgentKind::Codex, now() - Duration::minutes(10));

        assert_eq!(
            ttl.effective_timestamp(AgentKind::Codex, event, now()),
            Some(now())
        );
        assert_eq!(ttl.effective_timestamp(AgentKind::Claude, event, now()), event);

        let later = now() + Duration::minutes(55);
        assert_eq!(ttl.effective_timestamp(AgentKind::Codex, event, later), event);

        ttl.prune(later);
        assert!(!ttl.is_active(AgentKind::Codex, now()));
    }

    #[test]
    fn test_custom_ttl() {
        let mut ttl = FreshnessTtl::with_ttl(Duration::minutes(5));
        ttl.grant(AgentKind::Claude, now());
        assert!(ttl.is_active(AgentKind::Claude, now() + Duration::minutes(4)));
        assert!(!ttl.is_active(AgentKind::Claude, now() + Duration::minutes(5)));
    }
}
