//! Poll cadence: how long the loop sleeps between cycles.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::MonitorSettings;
use crate::usage::{QuotaWindow, UsageSnapshot};

/// Used percentage at which polling becomes urgent
pub const URGENT_USED_PERCENT: u8 = 80;
/// Reset proximity at which polling becomes urgent, in minutes
pub const URGENT_RESET_MINUTES: i64 = 15;

/// Quota nearly used up, or a window resets imminently
pub fn is_urgent(snapshot: &UsageSnapshot, now: DateTime<Utc>) -> bool {
    if !snapshot.has_reading() {
        return false;
    }
    QuotaWindow::ALL.into_iter().any(|window| {
        let used = 100u8.saturating_sub(snapshot.remaining(window));
        let resets_soon = snapshot.reset_at(window).is_some_and(|at| {
            at > now && at - now <= chrono::Duration::minutes(URGENT_RESET_MINUTES)
        });
        used >= URGENT_USED_PERCENT || resets_soon
    })
}

/// Sleep before the next cycle.
///
/// Hidden and calm: the hidden interval. Otherwise battery power wins over
/// the configured interval.
pub fn poll_interval(
    settings: &MonitorSettings,
    visible: bool,
    on_battery: bool,
    urgent: bool,
) -> Duration {
    if !visible && !urgent {
        return Duration::from_secs(settings.hidden_poll_interval_secs);
    }
    if on_battery {
        return Duration::from_secs(settings.battery_poll_interval_secs);
    }
    settings.poll_interval()
}
