//! Usage data types shared by the scanner, listener, probe and coordinator.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::policy::SourceModel;
use super::timestamp::describe_reset;
use crate::estimator::CapPressureState;

/// Agent CLI whose quota is tracked
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// OpenAI Codex CLI
    #[default]
    Codex,
    /// Anthropic Claude Code
    Claude,
}

impl AgentKind {
    /// Codex writes rate limits into its session logs; Claude only reports
    /// them when asked.
    pub fn source_model(&self) -> SourceModel {
        match self {
            AgentKind::Codex => SourceModel::EventSourced,
            AgentKind::Claude => SourceModel::PollSourced,
        }
    }
}

/// A recurring rate-limit period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaWindow {
    /// Short rolling window
    FiveHour,
    /// Long weekly window
    Weekly,
}

impl QuotaWindow {
    /// Both windows, short first
    pub const ALL: [QuotaWindow; 2] = [QuotaWindow::FiveHour, QuotaWindow::Weekly];

    /// Short display label
    pub fn label(&self) -> &'static str {
        match self {
            QuotaWindow::FiveHour => "5h",
            QuotaWindow::Weekly => "week",
        }
    }

    /// Classify a declared window length
    pub fn from_minutes(minutes: u32) -> Self {
        if minutes < 24 * 60 {
            QuotaWindow::FiveHour
        } else {
            QuotaWindow::Weekly
        }
    }
}

/// Clamp a percentage to `[0, 100]` and round to an integer
pub fn clamp_percent(value: f64) -> u8 {
    if !value.is_finite() {
        return 0;
    }
    value.clamp(0.0, 100.0).round() as u8
}

/// Token counts reported for the most recent turn
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens
    pub input_tokens: Option<u64>,
    /// Prompt tokens served from cache
    pub cached_input_tokens: Option<u64>,
    /// Completion tokens
    pub output_tokens: Option<u64>,
    /// Reasoning tokens (subset of output)
    pub reasoning_output_tokens: Option<u64>,
    /// Total as reported by the CLI
    pub total_tokens: Option<u64>,
}

impl TokenUsage {
    /// True when no count is present
    pub fn is_empty(&self) -> bool {
        self.input_tokens.is_none()
            && self.cached_input_tokens.is_none()
            && self.output_tokens.is_none()
            && self.reasoning_output_tokens.is_none()
            && self.total_tokens.is_none()
    }

    /// Tokens that count against the quota: uncached input plus output
    pub fn billable(&self) -> u64 {
        let input = self.input_tokens.unwrap_or(0);
        let cached = self.cached_input_tokens.unwrap_or(0);
        let output = self.output_tokens.unwrap_or(0);
        let billable = input.saturating_sub(cached).saturating_add(output);
        if billable == 0 {
            self.total_tokens.unwrap_or(0)
        } else {
            billable
        }
    }
}

/// Token usage with the time it was recorded
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenSample {
    /// Counts
    pub usage: TokenUsage,
    /// Event time, if the log carried one
    pub at: Option<DateTime<Utc>>,
}

/// One decoded quota window from a log event
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RateLimitWindowInfo {
    /// Remaining percentage, already clamped to `[0, 100]`
    pub remaining_percent: Option<f64>,
    /// Absolute reset time
    pub reset_at: Option<DateTime<Utc>>,
    /// Declared window length
    pub window_minutes: Option<u32>,
    /// Remaining token budget, when the event declares one
    pub remaining_tokens: Option<f64>,
    /// Token capacity of the window, when the event declares one
    pub capacity_tokens: Option<f64>,
}

impl RateLimitWindowInfo {
    /// True when the window carries a usable percentage
    pub fn has_percent(&self) -> bool {
        self.remaining_percent.is_some()
    }
}

/// Scanner result for one scan call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitSummary {
    /// Short window
    pub five_hour: RateLimitWindowInfo,
    /// Weekly window
    pub weekly: RateLimitWindowInfo,
    /// Time of the event the summary came from
    pub event_timestamp: Option<DateTime<Utc>>,
    /// Event older than the scanner's triage threshold (or absent)
    pub stale: bool,
    /// Log file the event was read from
    pub source: Option<PathBuf>,
}

impl RateLimitSummary {
    /// Summary returned when nothing recognizable was found
    pub fn empty() -> Self {
        Self {
            five_hour: RateLimitWindowInfo::default(),
            weekly: RateLimitWindowInfo::default(),
            event_timestamp: None,
            stale: true,
            source: None,
        }
    }

    /// Window accessor
    pub fn window(&self, window: QuotaWindow) -> &RateLimitWindowInfo {
        match window {
            QuotaWindow::FiveHour => &self.five_hour,
            QuotaWindow::Weekly => &self.weekly,
        }
    }

    /// True when no event was decoded
    pub fn is_empty(&self) -> bool {
        self.event_timestamp.is_none() && !self.five_hour.has_percent() && !self.weekly.has_percent()
    }
}

/// Everything one scan extracted from the logs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanReport {
    /// Rate-limit summary
    pub summary: RateLimitSummary,
    /// Newest last-turn token usage met along the walk
    pub last_turn: Option<TokenSample>,
    /// Rate-limit rejection events met along the walk, newest first
    pub rejections: Vec<DateTime<Utc>>,
}

impl ScanReport {
    /// Report for a scan that found nothing
    pub fn empty() -> Self {
        Self {
            summary: RateLimitSummary::empty(),
            last_turn: None,
            rejections: Vec::new(),
        }
    }
}

/// A window reading from terminal output (probe or listener)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowReading {
    /// Remaining percentage
    pub remaining_percent: Option<u8>,
    /// Reset description as printed by the CLI
    pub reset_text: Option<String>,
}

/// Both windows from terminal output
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaReading {
    /// Short window
    pub five_hour: WindowReading,
    /// Weekly window
    pub weekly: WindowReading,
}

impl QuotaReading {
    /// True when neither window carries anything
    pub fn is_empty(&self) -> bool {
        self.five_hour == WindowReading::default() && self.weekly == WindowReading::default()
    }
}

/// Current best-known usage state, published to observers as an owned copy
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageSnapshot {
    /// Remaining percentage of the short window
    pub five_hour_remaining_percent: u8,
    /// Remaining percentage of the weekly window
    pub week_remaining_percent: u8,
    /// Human-readable reset of the short window
    pub five_hour_reset_text: String,
    /// Human-readable reset of the weekly window
    pub week_reset_text: String,
    /// Absolute reset of the short window (log-derived only)
    pub five_hour_reset_at: Option<DateTime<Utc>>,
    /// Absolute reset of the weekly window (log-derived only)
    pub week_reset_at: Option<DateTime<Utc>>,
    /// Time of the log event the percentages came from
    pub event_timestamp: Option<DateTime<Utc>>,
    /// Last-turn token counts
    pub last_turn: TokenUsage,
    /// Time of the event the token counts came from
    pub last_turn_at: Option<DateTime<Utc>>,
    /// Account summary reported by the listener
    pub account: Option<String>,
    /// Model summary reported by the listener
    pub model: Option<String>,
    /// Whether the passive listener is running
    pub listener_available: bool,
    /// Whether an active probe is in flight
    pub probing: bool,
    /// Last completed refresh cycle
    pub last_refresh: Option<DateTime<Utc>>,
    /// Last successful probe
    pub last_probe_at: Option<DateTime<Utc>>,
    /// Last quota line from the listener
    pub last_listener_at: Option<DateTime<Utc>>,
    /// Latest cap-pressure forecast
    pub cap_pressure: Option<CapPressureState>,
}

impl UsageSnapshot {
    /// Remaining percentage for a window
    pub fn remaining(&self, window: QuotaWindow) -> u8 {
        match window {
            QuotaWindow::FiveHour => self.five_hour_remaining_percent,
            QuotaWindow::Weekly => self.week_remaining_percent,
        }
    }

    /// Absolute reset for a window
    pub fn reset_at(&self, window: QuotaWindow) -> Option<DateTime<Utc>> {
        match window {
            QuotaWindow::FiveHour => self.five_hour_reset_at,
            QuotaWindow::Weekly => self.week_reset_at,
        }
    }

    /// Reset description for a window
    pub fn reset_text(&self, window: QuotaWindow) -> &str {
        match window {
            QuotaWindow::FiveHour => &self.five_hour_reset_text,
            QuotaWindow::Weekly => &self.week_reset_text,
        }
    }

    fn window_fields(&mut self, window: QuotaWindow) -> (&mut u8, &mut String) {
        match window {
            QuotaWindow::FiveHour => (
                &mut self.five_hour_remaining_percent,
                &mut self.five_hour_reset_text,
            ),
            QuotaWindow::Weekly => (&mut self.week_remaining_percent, &mut self.week_reset_text),
        }
    }

    /// True once any source has produced quota data
    pub fn has_quota_data(&self) -> bool {
        self.event_timestamp.is_some()
            || !self.five_hour_reset_text.is_empty()
            || !self.week_reset_text.is_empty()
            || self.five_hour_remaining_percent > 0
            || self.week_remaining_percent > 0
    }

    /// True once any reading arrived, even one that left both windows at zero
    pub fn has_reading(&self) -> bool {
        self.has_quota_data() || self.last_probe_at.is_some() || self.last_listener_at.is_some()
    }

    /// Merge a scan summary.
    ///
    /// Data is accepted only when it is strictly newer than the held event,
    /// or when nothing with a timestamp is held yet. Returns whether
    /// anything changed.
    pub fn apply_summary(&mut self, summary: &RateLimitSummary, now: DateTime<Utc>) -> bool {
        let Some(event_ts) = summary.event_timestamp else {
            return false;
        };
        if let Some(held) = self.event_timestamp {
            if event_ts <= held {
                return false;
            }
        }

        for window in QuotaWindow::ALL {
            let info = summary.window(window);
            if let Some(remaining) = info.remaining_percent {
                // The text always mirrors the reset instant it describes.
                let reset_text = info
                    .reset_at
                    .map(|at| describe_reset(at, now))
                    .unwrap_or_default();
                let (percent, text) = self.window_fields(window);
                *percent = clamp_percent(remaining);
                *text = reset_text;
                match window {
                    QuotaWindow::FiveHour => self.five_hour_reset_at = info.reset_at,
                    QuotaWindow::Weekly => self.week_reset_at = info.reset_at,
                }
            }
        }
        self.event_timestamp = Some(event_ts);
        true
    }

    /// Merge a probe reading field by field.
    ///
    /// A field is only overwritten by a non-empty, non-zero value so that a
    /// partial probe never blanks known-good data.
    pub fn apply_probe_reading(&mut self, reading: &QuotaReading) -> bool {
        let mut changed = false;
        for (window, value) in [
            (QuotaWindow::FiveHour, &reading.five_hour),
            (QuotaWindow::Weekly, &reading.weekly),
        ] {
            let (percent, text) = self.window_fields(window);
            if let Some(remaining) = value.remaining_percent.filter(|p| *p > 0) {
                let remaining = remaining.min(100);
                if *percent != remaining {
                    *percent = remaining;
                    changed = true;
                }
            }
            if let Some(reset) = value.reset_text.as_deref().map(str::trim) {
                if !reset.is_empty() && text != reset {
                    *text = reset.to_string();
                    changed = true;
                }
            }
        }
        changed
    }

    /// Apply a single window reading from the listener
    pub fn apply_listener_window(&mut self, window: QuotaWindow, value: &WindowReading) -> bool {
        let (percent, text) = self.window_fields(window);
        let mut changed = false;
        if let Some(remaining) = value.remaining_percent {
            let remaining = remaining.min(100);
            if *percent != remaining {
                *percent = remaining;
                changed = true;
            }
        }
        if let Some(reset) = value.reset_text.as_deref().map(str::trim) {
            if !reset.is_empty() && text != reset {
                *text = reset.to_string();
                changed = true;
            }
        }
        changed
    }

    /// Replace last-turn token counts when the sample is newer
    pub fn apply_token_sample(&mut self, sample: &TokenSample) -> bool {
        if sample.usage.is_empty() {
            return false;
        }
        if let (Some(held), Some(at)) = (self.last_turn_at, sample.at) {
            if at <= held {
                return false;
            }
        }
        if self.last_turn == sample.usage && self.last_turn_at == sample.at {
            return false;
        }
        self.last_turn = sample.usage.clone();
        self.last_turn_at = sample.at.or(self.last_turn_at);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, minute, 0).unwrap()
    }

    fn summary(five: f64, week: f64, ts: Option<DateTime<Utc>>) -> RateLimitSummary {
        RateLimitSummary {
            five_hour: RateLimitWindowInfo {
                remaining_percent: Some(five),
                ..Default::default()
            },
            weekly: RateLimitWindowInfo {
                remaining_percent: Some(week),
                ..Default::default()
            },
            event_timestamp: ts,
            stale: false,
            source: None,
        }
    }

    #[test]
    fn test_clamp_percent() {
        assert_eq!(clamp_percent(-5.0), 0);
        assert_eq!(clamp_percent(42.4), 42);
        assert_eq!(clamp_percent(100.0 - 85.0), 15);
        assert_eq!(clamp_percent(250.0), 100);
        assert_eq!(clamp_percent(f64::NAN), 0);
    }

    #[test]
    fn test_billable_tokens() {
        let usage = TokenUsage {
            input_tokens: Some(1200),
            cached_input_tokens: Some(1000),
            output_tokens: Some(300),
            reasoning_output_tokens: Some(100),
            total_tokens: Some(1500),
        };
        assert_eq!(usage.billable(), 500);

        let total_only = TokenUsage {
            total_tokens: Some(900),
            ..Default::default()
        };
        assert_eq!(total_only.billable(), 900);
    }

    #[test]
    fn test_older_summary_never_regresses() {
        let mut snapshot = UsageSnapshot::default();
        assert!(snapshot.apply_summary(&summary(60.0, 80.0, Some(at(10))), at(30)));

        assert!(!snapshot.apply_summary(&summary(90.0, 95.0, Some(at(5))), at(30)));
        assert!(!snapshot.apply_summary(&summary(90.0, 95.0, Some(at(10))), at(30)));
        assert_eq!(snapshot.five_hour_remaining_percent, 60);
        assert_eq!(snapshot.week_remaining_percent, 80);

        assert!(snapshot.apply_summary(&summary(55.0, 79.0, Some(at(11))), at(30)));
        assert_eq!(snapshot.five_hour_remaining_percent, 55);
        assert_eq!(snapshot.event_timestamp, Some(at(11)));
    }

    #[test]
    fn test_untimed_snapshot_accepts_any_timed_summary() {
        let mut snapshot = UsageSnapshot {
            five_hour_remaining_percent: 90,
            ..Default::default()
        };
        assert!(snapshot.apply_summary(&summary(10.0, 20.0, Some(at(0))), at(30)));
        assert_eq!(snapshot.five_hour_remaining_percent, 10);
        assert_eq!(snapshot.week_remaining_percent, 20);
    }

    #[test]
    fn test_empty_summary_is_ignored() {
        let mut snapshot = UsageSnapshot::default();
        assert!(!snapshot.apply_summary(&RateLimitSummary::empty(), at(0)));
        assert_eq!(snapshot, UsageSnapshot::default());
    }

    #[test]
    fn test_summary_sets_reset_text() {
        let mut snapshot = UsageSnapshot::default();
        let mut data = summary(50.0, 50.0, Some(at(0)));
        data.five_hour.reset_at = Some(at(0) + Duration::minutes(90));
        snapshot.apply_summary(&data, at(0));
        assert!(!snapshot.five_hour_reset_text.is_empty());
        assert_eq!(snapshot.five_hour_reset_at, data.five_hour.reset_at);
        assert!(snapshot.week_reset_text.is_empty());
    }

    #[test]
    fn test_summary_without_reset_clears_old_text() {
        let mut snapshot = UsageSnapshot::default();
        let mut data = summary(50.0, 50.0, Some(at(0)));
        data.five_hour.reset_at = Some(at(0) + Duration::minutes(90));
        assert!(snapshot.apply_summary(&data, at(0)));
        assert!(!snapshot.five_hour_reset_text.is_empty());

        assert!(snapshot.apply_summary(&summary(40.0, 45.0, Some(at(5))), at(5)));
        assert_eq!(snapshot.five_hour_remaining_percent, 40);
        assert_eq!(snapshot.five_hour_reset_at, None);
        assert!(snapshot.five_hour_reset_text.is_empty());
    }

    #[test]
    fn test_probe_reading_never_blanks() {
        let mut snapshot = UsageSnapshot {
            five_hour_remaining_percent: 70,
            week_remaining_percent: 40,
            five_hour_reset_text: "14:05".to_string(),
            week_reset_text: "09:00 on 20 Oct".to_string(),
            ..Default::default()
        };
        let reading = QuotaReading {
            five_hour: WindowReading {
                remaining_percent: Some(0),
                reset_text: Some("  ".to_string()),
            },
            weekly: WindowReading {
                remaining_percent: Some(38),
                reset_text: None,
            },
        };

        assert!(snapshot.apply_probe_reading(&reading));
        assert_eq!(snapshot.five_hour_remaining_percent, 70);
        assert_eq!(snapshot.five_hour_reset_text, "14:05");
        assert_eq!(snapshot.week_remaining_percent, 38);
        assert_eq!(snapshot.week_reset_text, "09:00 on 20 Oct");
    }

    #[test]
    fn test_listener_window_accepts_zero() {
        let mut snapshot = UsageSnapshot {
            five_hour_remaining_percent: 12,
            ..Default::default()
        };
        let reading = WindowReading {
            remaining_percent: Some(0),
            reset_text: Some("17:42".to_string()),
        };
        assert!(snapshot.apply_listener_window(QuotaWindow::FiveHour, &reading));
        assert_eq!(snapshot.five_hour_remaining_percent, 0);
        assert_eq!(snapshot.five_hour_reset_text, "17:42");
        assert!(!snapshot.apply_listener_window(QuotaWindow::FiveHour, &reading));
    }

    #[test]
    fn test_token_sample_ordering() {
        let mut snapshot = UsageSnapshot::default();
        let newer = TokenSample {
            usage: TokenUsage {
                input_tokens: Some(10),
                ..Default::default()
            },
            at: Some(at(5)),
        };
        let older = TokenSample {
            usage: TokenUsage {
                input_tokens: Some(99),
                ..Default::default()
            },
            at: Some(at(1)),
        };
        assert!(snapshot.apply_token_sample(&newer));
        assert!(!snapshot.apply_token_sample(&older));
        assert_eq!(snapshot.last_turn.input_tokens, Some(10));
    }

    #[test]
    fn test_window_classification() {
        assert_eq!(QuotaWindow::from_minutes(300), QuotaWindow::FiveHour);
        assert_eq!(QuotaWindow::from_minutes(10080), QuotaWindow::Weekly);
    }
}
