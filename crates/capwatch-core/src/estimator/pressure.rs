//! Minutes-to-cap forecasting from token rate and quota history.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use super::types::{CapEta, CapPressureState, EtaMethod, Severity, WindowSnapshot};
use crate::config::CapPressureSettings;
use crate::usage::{QuotaWindow, RateLimitSummary};

/// Lower clamp for any forecast (minutes)
pub const MIN_ETA_MINUTES: f64 = 0.5;
/// Upper clamp for any forecast (minutes)
pub const MAX_ETA_MINUTES: f64 = 120.0;
/// Elapsed floor between two usage samples (one second)
const MIN_ELAPSED_MINUTES: f64 = 1.0 / 60.0;
/// Reset shift beyond which a window is considered rolled over
const RESET_SHIFT_TOLERANCE_SECS: i64 = 60;
/// Bound on remembered rejection timestamps
const MAX_ERRORS: usize = 64;

fn minutes_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 60_000.0
}

/// Token-rate moving average plus per-window quota history
#[derive(Debug, Clone)]
pub struct CapPressureEstimator {
    settings: CapPressureSettings,
    rate_ema: Option<f64>,
    last_sample_at: Option<DateTime<Utc>>,
    history: HashMap<QuotaWindow, VecDeque<WindowSnapshot>>,
    errors: VecDeque<DateTime<Utc>>,
}

impl CapPressureEstimator {
    pub fn new(settings: CapPressureSettings) -> Self {
        Self {
            settings,
            rate_ema: None,
            last_sample_at: None,
            history: HashMap::new(),
            errors: VecDeque::new(),
        }
    }

    /// Swap thresholds without losing history
    pub fn update_settings(&mut self, settings: CapPressureSettings) {
        self.settings = settings;
        let cap = self.settings.history_len;
        for ring in self.history.values_mut() {
            while ring.len() > cap {
                ring.pop_front();
            }
        }
    }

    /// Smoothed billable tokens per minute
    pub fn token_rate(&self) -> Option<f64> {
        self.rate_ema
    }

    /// Snapshots held for a window, oldest first
    pub fn history(&self, window: QuotaWindow) -> Vec<WindowSnapshot> {
        self.history
            .get(&window)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Feed one billable-token sample.
    ///
    /// The first sample only anchors the clock. Samples at or before the
    /// previous one are ignored.
    pub fn record_usage(&mut self, billable_tokens: u64, at: DateTime<Utc>) {
        let Some(previous) = self.last_sample_at else {
            self.last_sample_at = Some(at);
            return;
        };
        if at <= previous {
            return;
        }
        let elapsed = minutes_between(previous, at).max(MIN_ELAPSED_MINUTES);
        let instant = billable_tokens as f64 / elapsed;
        let alpha = self.settings.ema_alpha;
        self.rate_ema = Some(match self.rate_ema {
            Some(ema) => alpha * instant + (1.0 - alpha) * ema,
            None => instant,
        });
        self.last_sample_at = Some(at);
        debug!("Token rate EMA: {:.1}/min", self.rate_ema.unwrap_or_default());
    }

    /// Append a quota observation to its window's ring
    pub fn record_window(&mut self, window: QuotaWindow, snapshot: WindowSnapshot) {
        let cap = self.settings.history_len.max(1);
        let ring = self.history.entry(window).or_default();

        if let Some(last) = ring.back() {
            if snapshot.captured_at <= last.captured_at {
                return;
            }
            let rolled_over = match (last.reset_at, snapshot.reset_at) {
                (Some(a), Some(b)) => (b - a).num_seconds().abs() > RESET_SHIFT_TOLERANCE_SECS,
                _ => false,
            };
            if rolled_over {
                debug!("{} window rolled over, clearing history", window.label());
                ring.clear();
            }
        }

        ring.push_back(snapshot);
        while ring.len() > cap {
            ring.pop_front();
        }
    }

    /// Record both windows of a scan summary
    pub fn record_summary(&mut self, summary: &RateLimitSummary) {
        let Some(at) = summary.event_timestamp else {
            return;
        };
        for window in QuotaWindow::ALL {
            if let Some(snapshot) = WindowSnapshot::from_info(summary.window(window), at) {
                self.record_window(window, snapshot);
            }
        }
    }

    /// Record one rate-limit rejection; duplicates are ignored
    pub fn record_rate_limit_error(&mut self, at: DateTime<Utc>) {
        if self.errors.contains(&at) {
            return;
        }
        let idx = self.errors.partition_point(|t| *t < at);
        self.errors.insert(idx, at);
        while self.errors.len() > MAX_ERRORS {
            self.errors.pop_front();
        }
    }

    /// Rejections inside the trailing error window
    pub fn recent_errors(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::minutes(i64::from(self.settings.error_window_minutes));
        self.errors
            .iter()
            .filter(|t| **t >= cutoff && **t <= now)
            .count()
    }

    fn capacity_estimate(&self, latest: &WindowSnapshot) -> Option<f64> {
        let rate = self.rate_ema.filter(|r| *r > 0.0)?;
        let remaining = latest.remaining_tokens.or_else(|| {
            latest
                .capacity_tokens
                .map(|cap| cap * latest.remaining_percent() / 100.0)
        })?;
        Some(remaining.max(0.0) / rate)
    }

    fn percent_slope_estimate(ring: &VecDeque<WindowSnapshot>, now: DateTime<Utc>) -> Option<f64> {
        let latest = ring.back()?;
        let remaining = latest.remaining_percent();

        let slope = if ring.len() >= 2 {
            let mut consumed = 0.0;
            let mut minutes = 0.0;
            for (a, b) in ring.iter().zip(ring.iter().skip(1)) {
                let elapsed = minutes_between(a.captured_at, b.captured_at);
                if elapsed <= 0.0 {
                    continue;
                }
                consumed += (b.used_percent - a.used_percent).max(0.0);
                minutes += elapsed;
            }
            (minutes > 0.0).then(|| consumed / minutes)?
        } else {
            let reset_at = latest.reset_at?;
            let length = f64::from(latest.window_minutes?);
            let window_start = reset_at - Duration::seconds((length * 60.0) as i64);
            let elapsed = minutes_between(window_start, now.min(reset_at));
            if elapsed <= 0.0 {
                return None;
            }
            latest.used_percent / elapsed
        };

        (slope > 0.0).then(|| remaining / slope)
    }

    fn window_eta(&self, window: QuotaWindow, now: DateTime<Utc>) -> Option<CapEta> {
        let ring = self.history.get(&window)?;
        let latest = ring.back()?;

        let candidates = [
            self.capacity_estimate(latest).map(|m| (m, EtaMethod::Capacity)),
            Self::percent_slope_estimate(ring, now).map(|m| (m, EtaMethod::PercentSlope)),
        ];
        let (minutes, method) = candidates
            .into_iter()
            .flatten()
            .filter(|(m, _)| m.is_finite())
            .min_by(|a, b| a.0.total_cmp(&b.0))?;

        Some(CapEta {
            window,
            minutes_to_cap: minutes.clamp(MIN_ETA_MINUTES, MAX_ETA_MINUTES),
            minutes_to_reset: latest
                .reset_at
                .map(|r| minutes_between(now, r).max(0.0)),
            method,
        })
    }

    fn severity(&self, minutes: f64) -> Severity {
        if minutes <= self.settings.critical_minutes {
            Severity::Critical
        } else if minutes <= self.settings.warn_minutes {
            Severity::Warn
        } else {
            Severity::None
        }
    }

    /// Compute the current forecast
    pub fn estimate(&self, now: DateTime<Utc>) -> CapPressureState {
        let recent_errors = self.recent_errors(now);

        let mut eta = QuotaWindow::ALL
            .into_iter()
            .filter_map(|w| self.window_eta(w, now))
            .min_by(|a, b| a.minutes_to_cap.total_cmp(&b.minutes_to_cap));

        if eta.is_none() && recent_errors >= self.settings.error_count {
            eta = Some(CapEta {
                window: QuotaWindow::FiveHour,
                minutes_to_cap: self
                    .settings
                    .fallback_minutes
                    .clamp(MIN_ETA_MINUTES, MAX_ETA_MINUTES),
                minutes_to_reset: None,
                method: EtaMethod::ErrorFallback,
            });
        }

        CapPressureState {
            severity: eta
                .as_ref()
                .map(|e| self.severity(e.minutes_to_cap))
                .unwrap_or_default(),
            eta,
            token_rate_per_minute: self.rate_ema,
            recent_errors,
            computed_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn snap(minute: i64, used: f64) -> WindowSnapshot {
        WindowSnapshot {
            captured_at: t0() + Duration::minutes(minute),
            used_percent: used,
            reset_at: Some(t0() + Duration::hours(3)),
            window_minutes: Some(300),
            remaining_tokens: None,
            capacity_tokens: None,
        }
    }

    fn estimator() -> CapPressureEstimator {
        CapPressureEstimator::new(CapPressureSettings::default())
    }

    #[test]
    fn test_error_fallback_without_history() {
        let mut est = estimator();
        est.record_rate_limit_error(t0() - Duration::minutes(3));
        est.record_rate_limit_error(t0() - Duration::minutes(1));

        let state = est.estimate(t0());
        let eta = state.eta.unwrap();
        assert_eq!(eta.method, EtaMethod::ErrorFallback);
        assert_eq!(eta.minutes_to_cap, 10.0);
        assert_eq!(state.severity, Severity::Warn);
        assert_eq!(state.recent_errors, 2);
    }

    #[test]
    fn test_old_or_duplicate_errors_do_not_trigger_fallback() {
        let mut est = estimator();
        est.record_rate_limit_error(t0() - Duration::minutes(1));
        est.record_rate_limit_error(t0() - Duration::minutes(1));
        est.record_rate_limit_error(t0() - Duration::minutes(30));
        let state = est.estimate(t0());
        assert!(state.eta.is_none());
        assert_eq!(state.severity, Severity::None);
    }

    #[test]
    fn test_percent_slope_from_pairs() {
        let mut est = estimator();
        est.record_window(QuotaWindow::FiveHour, snap(0, 50.0));
        est.record_window(QuotaWindow::FiveHour, snap(10, 60.0));
        est.record_window(QuotaWindow::FiveHour, snap(20, 70.0));

        // 1 point per minute, 30 points left.
        let eta = est.estimate(t0() + Duration::minutes(20)).eta.unwrap();
        assert_eq!(eta.method, EtaMethod::PercentSlope);
        assert!((eta.minutes_to_cap - 30.0).abs() < 1e-9);
        assert!((eta.minutes_to_reset.unwrap() - 160.0).abs() < 1e-9);
    }

    #[test]
    fn test_single_snapshot_uses_window_length() {
        let mut est = estimator();
        // Window opened 2h before t0 (reset in 3h of a 5h window); 60% used.
        let mut only = snap(0, 60.0);
        only.captured_at = t0();
        est.record_window(QuotaWindow::FiveHour, only);

        // 0.5 points per minute, 40 left => 80 minutes.
        let eta = est.estimate(t0()).eta.unwrap();
        assert!((eta.minutes_to_cap - 80.0).abs() < 1e-9);
        assert_eq!(eta.method, EtaMethod::PercentSlope);
    }

    #[test]
    fn test_capacity_wins_when_more_urgent() {
        let mut est = estimator();
        est.record_usage(0, t0());
        est.record_usage(1_000, t0() + Duration::minutes(1));
        assert_eq!(est.token_rate(), Some(1_000.0));

        let mut latest = snap(1, 60.0);
        latest.remaining_tokens = Some(4_000.0);
        est.record_window(QuotaWindow::FiveHour, latest);

        let state = est.estimate(t0() + Duration::minutes(1));
        let eta = state.eta.unwrap();
        assert_eq!(eta.method, EtaMethod::Capacity);
        assert!((eta.minutes_to_cap - 4.0).abs() < 1e-9);
        assert_eq!(state.severity, Severity::Critical);
    }

    #[test]
    fn test_capacity_from_capacity_and_percent() {
        let mut est = estimator();
        est.record_usage(0, t0());
        est.record_usage(100, t0() + Duration::minutes(1));
        let mut latest = snap(1, 90.0);
        latest.reset_at = None;
        latest.capacity_tokens = Some(10_000.0);
        est.record_window(QuotaWindow::Weekly, latest);

        let eta = est.estimate(t0() + Duration::minutes(1)).eta.unwrap();
        assert_eq!(eta.window, QuotaWindow::Weekly);
        assert!((eta.minutes_to_cap - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_ema_smoothing_and_elapsed_floor() {
        let mut est = estimator();
        est.record_usage(500, t0());
        assert_eq!(est.token_rate(), None);

        est.record_usage(100, t0() + Duration::minutes(1));
        assert_eq!(est.token_rate(), Some(100.0));
        est.record_usage(600, t0() + Duration::minutes(2));
        assert!((est.token_rate().unwrap() - 200.0).abs() < 1e-9);

        // Sub-second gap is floored to one second.
        est.record_usage(1, t0() + Duration::minutes(2) + Duration::milliseconds(10));
        assert!((est.token_rate().unwrap() - (0.2 * 60.0 + 0.8 * 200.0)).abs() < 1e-6);
    }

    #[test]
    fn test_ring_is_bounded_and_monotonic() {
        let mut est = estimator();
        for i in 0..10 {
            est.record_window(QuotaWindow::FiveHour, snap(i, 10.0 + i as f64));
        }
        est.record_window(QuotaWindow::FiveHour, snap(3, 99.0));

        let ring = est.history(QuotaWindow::FiveHour);
        assert_eq!(ring.len(), 6);
        assert!(ring.windows(2).all(|w| w[0].captured_at < w[1].captured_at));
        assert_eq!(ring.last().unwrap().used_percent, 19.0);
    }

    #[test]
    fn test_reset_shift_starts_new_ring() {
        let mut est = estimator();
        est.record_window(QuotaWindow::FiveHour, snap(0, 90.0));
        est.record_window(QuotaWindow::FiveHour, snap(5, 95.0));
        let mut next = snap(10, 2.0);
        next.reset_at = Some(t0() + Duration::hours(5));
        est.record_window(QuotaWindow::FiveHour, next);
        assert_eq!(est.history(QuotaWindow::FiveHour).len(), 1);
    }

    #[test]
    fn test_clamped_to_bounds() {
        let mut est = estimator();
        est.record_window(QuotaWindow::Weekly, {
            let mut s = snap(0, 1.0);
            s.window_minutes = Some(10080);
            s.reset_at = Some(t0() + Duration::days(6));
            s
        });
        let eta = est.estimate(t0()).eta.unwrap();
        assert_eq!(eta.minutes_to_cap, MAX_ETA_MINUTES);
        assert_eq!(est.estimate(t0()).severity, Severity::None);
    }
}
