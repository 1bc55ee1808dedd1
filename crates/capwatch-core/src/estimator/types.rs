use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::usage::{QuotaWindow, RateLimitWindowInfo};

/// One observation of a quota window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowSnapshot {
    /// When the observation was made
    pub captured_at: DateTime<Utc>,
    /// Used percentage, 0-100
    pub used_percent: f64,
    /// Window reset time
    pub reset_at: Option<DateTime<Utc>>,
    /// Declared window length
    pub window_minutes: Option<u32>,
    /// Remaining token budget
    pub remaining_tokens: Option<f64>,
    /// Token capacity of the window
    pub capacity_tokens: Option<f64>,
}

impl WindowSnapshot {
    /// Build from a scanned window; `None` when it carries no percentage
    pub fn from_info(info: &RateLimitWindowInfo, captured_at: DateTime<Utc>) -> Option<Self> {
        let remaining = info.remaining_percent?;
        Some(Self {
            captured_at,
            used_percent: (100.0 - remaining).clamp(0.0, 100.0),
            reset_at: info.reset_at,
            window_minutes: info.window_minutes,
            remaining_tokens: info.remaining_tokens,
            capacity_tokens: info.capacity_tokens,
        })
    }

    /// Remaining percentage
    pub fn remaining_percent(&self) -> f64 {
        (100.0 - self.used_percent).clamp(0.0, 100.0)
    }
}

/// How a minutes-to-cap figure was derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EtaMethod {
    /// Remaining tokens over the token rate
    Capacity,
    /// Remaining percent over the percent consumption slope
    PercentSlope,
    /// Fixed estimate after repeated rate-limit rejections
    ErrorFallback,
}

/// Severity tier of a forecast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    None,
    Warn,
    Critical,
}

/// Forecast for one window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapEta {
    /// Window the forecast applies to
    pub window: QuotaWindow,
    /// Minutes until the quota is exhausted, clamped to `[0.5, 120]`
    pub minutes_to_cap: f64,
    /// Minutes until the window resets
    pub minutes_to_reset: Option<f64>,
    /// Reasoning used
    pub method: EtaMethod,
}

/// Estimator output published with the snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapPressureState {
    /// Most urgent forecast, if any signal exists
    pub eta: Option<CapEta>,
    /// Severity derived from `eta`
    pub severity: Severity,
    /// Smoothed billable tokens per minute
    pub token_rate_per_minute: Option<f64>,
    /// Rate-limit rejections inside the trailing window
    pub recent_errors: usize,
    /// When the estimate was computed
    pub computed_at: DateTime<Utc>,
}
