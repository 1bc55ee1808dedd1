//! Ordered schema decoders for session-log events.
//!
//! Each historical event shape gets its own small decoder that only knows
//! where the interesting object lives. Field normalization (percent keys,
//! reset keys, clamping) is shared so every shape obeys the same rules.
//! New shapes are added by appending a decoder, never by editing old ones.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use super::timestamp::decode_timestamp;
use super::types::{QuotaWindow, RateLimitWindowInfo, TokenUsage};

/// Locates a `rate_limits` object inside one event shape
pub trait RateLimitDecoder: Send + Sync {
    /// Name used in debug logs
    fn name(&self) -> &'static str;
    /// Return the rate-limit object when the event has this shape
    fn locate<'a>(&self, event: &'a Value) -> Option<&'a Value>;
}

/// Locates last-turn token counts inside one event shape
pub trait TokenUsageDecoder: Send + Sync {
    /// Name used in debug logs
    fn name(&self) -> &'static str;
    /// Return the token-count object when the event has this shape
    fn locate<'a>(&self, event: &'a Value) -> Option<&'a Value>;
}

/// Current shape: `payload.rate_limits.{primary,secondary}`
pub struct PayloadRateLimits;

impl RateLimitDecoder for PayloadRateLimits {
    fn name(&self) -> &'static str {
        "payload.rate_limits"
    }

    fn locate<'a>(&self, event: &'a Value) -> Option<&'a Value> {
        event
            .get("payload")?
            .get("rate_limits")
            .filter(|v| v.is_object())
    }
}

/// Legacy shape: `payload.info.rate_limits` under a `token_count` event
pub struct LegacyTokenCountRateLimits;

impl RateLimitDecoder for LegacyTokenCountRateLimits {
    fn name(&self) -> &'static str {
        "token_count.info.rate_limits"
    }

    fn locate<'a>(&self, event: &'a Value) -> Option<&'a Value> {
        let payload = event.get("payload")?;
        if payload.get("type").and_then(Value::as_str) != Some("token_count") {
            return None;
        }
        payload
            .get("info")?
            .get("rate_limits")
            .filter(|v| v.is_object())
    }
}

/// Bare shape: `rate_limits` at the top level
pub struct TopLevelRateLimits;

impl RateLimitDecoder for TopLevelRateLimits {
    fn name(&self) -> &'static str {
        "rate_limits"
    }

    fn locate<'a>(&self, event: &'a Value) -> Option<&'a Value> {
        event.get("rate_limits").filter(|v| v.is_object())
    }
}

/// `turn.completed` event carrying `usage`
pub struct TurnCompletedUsage;

impl TokenUsageDecoder for TurnCompletedUsage {
    fn name(&self) -> &'static str {
        "turn.completed"
    }

    fn locate<'a>(&self, event: &'a Value) -> Option<&'a Value> {
        let is_turn = |v: &Value| v.get("type").and_then(Value::as_str) == Some("turn.completed");
        if is_turn(event) {
            return event.get("usage").filter(|v| v.is_object());
        }
        let payload = event.get("payload")?;
        if is_turn(payload) {
            return payload.get("usage").filter(|v| v.is_object());
        }
        None
    }
}

/// Legacy `token_count` event carrying `info.last_token_usage`
pub struct LegacyLastTokenUsage;

impl TokenUsageDecoder for LegacyLastTokenUsage {
    fn name(&self) -> &'static str {
        "token_count.info.last_token_usage"
    }

    fn locate<'a>(&self, event: &'a Value) -> Option<&'a Value> {
        let payload = event.get("payload")?;
        if payload.get("type").and_then(Value::as_str) != Some("token_count") {
            return None;
        }
        payload
            .get("info")?
            .get("last_token_usage")
            .filter(|v| v.is_object())
    }
}

/// Rate-limit decoders, tried in order
pub static RATE_LIMIT_DECODERS: &[&dyn RateLimitDecoder] = &[
    &PayloadRateLimits,
    &LegacyTokenCountRateLimits,
    &TopLevelRateLimits,
];

/// Token-usage decoders, tried in order
pub static TOKEN_USAGE_DECODERS: &[&dyn TokenUsageDecoder] =
    &[&TurnCompletedUsage, &LegacyLastTokenUsage];

const DIRECT_PERCENT_KEYS: &[&str] = &[
    "remaining_percent",
    "pct_left",
    "pct_remaining",
    "percent_left",
    "percent_remaining",
];
const USED_PERCENT_KEYS: &[&str] = &["used_percent", "percent_used", "pct_used"];
const RELATIVE_RESET_KEYS: &[&str] = &[
    "resets_in_seconds",
    "reset_in_seconds",
    "reset_after_seconds",
    "resets_in",
];
const ABSOLUTE_RESET_KEYS: &[&str] = &[
    "resets_at",
    "reset_at",
    "reset_time",
    "resetsAt",
    "reset_timestamp",
];
const CAPTURED_AT_KEYS: &[&str] = &["captured_at", "capturedAt"];
const CREATED_AT_KEYS: &[&str] = &["created_at", "createdAt"];

/// One decoded rate-limit event
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedRateLimits {
    /// Short window
    pub five_hour: Option<RateLimitWindowInfo>,
    /// Weekly window
    pub weekly: Option<RateLimitWindowInfo>,
    /// Time the limits were captured (or the event was written)
    pub timestamp: Option<DateTime<Utc>>,
    /// Decoder that matched
    pub decoder: &'static str,
}

impl DecodedRateLimits {
    /// True when at least one window carries a percentage
    pub fn has_percent(&self) -> bool {
        self.five_hour.as_ref().is_some_and(|w| w.has_percent())
            || self.weekly.as_ref().is_some_and(|w| w.has_percent())
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    let parsed: Option<f64> = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').parse().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

fn first_f64(obj: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| obj.get(*k).and_then(as_f64))
}

fn first_timestamp(obj: &Value, keys: &[&str]) -> Option<DateTime<Utc>> {
    keys.iter().find_map(|k| obj.get(*k).and_then(decode_timestamp))
}

/// Remaining percentage from any known key, clamped to `[0, 100]`
pub fn remaining_percent(window: &Value) -> Option<f64> {
    if let Some(direct) = first_f64(window, DIRECT_PERCENT_KEYS) {
        return Some(direct.clamp(0.0, 100.0));
    }
    first_f64(window, USED_PERCENT_KEYS).map(|used| (100.0 - used).clamp(0.0, 100.0))
}

/// Absolute reset time: a relative delta from `anchor`, or an absolute epoch/string
pub fn reset_at(window: &Value, anchor: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    if let (Some(delta), Some(anchor)) = (first_f64(window, RELATIVE_RESET_KEYS), anchor) {
        let relative = (delta.is_finite() && delta >= 0.0)
            .then(|| Duration::try_milliseconds((delta * 1_000.0) as i64))
            .flatten()
            .and_then(|offset| anchor.checked_add_signed(offset));
        if relative.is_some() {
            return relative;
        }
    }
    first_timestamp(window, ABSOLUTE_RESET_KEYS)
}

/// Event time with `captured_at` preferred over `created_at` over `timestamp`,
/// looking at the top level before the payload.
pub fn event_timestamp(event: &Value) -> Option<DateTime<Utc>> {
    let payload = event.get("payload");
    for keys in [CAPTURED_AT_KEYS, CREATED_AT_KEYS, &["timestamp"][..]] {
        if let Some(ts) = first_timestamp(event, keys) {
            return Some(ts);
        }
        if let Some(ts) = payload.and_then(|p| first_timestamp(p, keys)) {
            return Some(ts);
        }
    }
    None
}

fn decode_window(window: &Value, anchor: Option<DateTime<Utc>>) -> Option<RateLimitWindowInfo> {
    if !window.is_object() {
        return None;
    }
    let info = RateLimitWindowInfo {
        remaining_percent: remaining_percent(window),
        reset_at: reset_at(window, anchor),
        window_minutes: first_f64(window, &["window_minutes", "windowMinutes"])
            .filter(|m| *m > 0.0)
            .map(|m| m.round() as u32),
        remaining_tokens: first_f64(window, &["remaining_tokens", "tokens_remaining"])
            .filter(|t| *t >= 0.0),
        capacity_tokens: first_f64(window, &["capacity_tokens", "limit_tokens", "token_limit"])
            .filter(|t| *t > 0.0),
    };
    if info == RateLimitWindowInfo::default() {
        None
    } else {
        Some(info)
    }
}

/// Decode a located `rate_limits` object.
///
/// `event` supplies the timestamps; a `captured_at` inside the rate-limit
/// object itself wins over everything else.
pub fn decode_rate_limits(limits: &Value, event: &Value) -> DecodedRateLimits {
    let timestamp = first_timestamp(limits, CAPTURED_AT_KEYS).or_else(|| event_timestamp(event));

    let mut decoded = DecodedRateLimits {
        timestamp,
        ..Default::default()
    };

    let slots = [
        ("primary", QuotaWindow::FiveHour),
        ("five_hour", QuotaWindow::FiveHour),
        ("secondary", QuotaWindow::Weekly),
        ("weekly", QuotaWindow::Weekly),
    ];
    for (key, default_window) in slots {
        let Some(info) = limits.get(key).and_then(|w| decode_window(w, timestamp)) else {
            continue;
        };
        let window = info
            .window_minutes
            .map(QuotaWindow::from_minutes)
            .unwrap_or(default_window);
        let slot = match window {
            QuotaWindow::FiveHour => &mut decoded.five_hour,
            QuotaWindow::Weekly => &mut decoded.weekly,
        };
        if slot.is_none() {
            *slot = Some(info);
        }
    }
    decoded
}

/// Try every rate-limit decoder in order
pub fn decode_rate_limit_event(event: &Value) -> Option<DecodedRateLimits> {
    RATE_LIMIT_DECODERS.iter().find_map(|decoder| {
        let limits = decoder.locate(event)?;
        let mut decoded = decode_rate_limits(limits, event);
        if !decoded.has_percent() {
            return None;
        }
        decoded.decoder = decoder.name();
        Some(decoded)
    })
}

fn as_u64(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|v| *v >= 0.0).map(|v| v as u64))
}

/// Try every token-usage decoder in order
pub fn decode_token_usage(event: &Value) -> Option<TokenUsage> {
    TOKEN_USAGE_DECODERS.iter().find_map(|decoder| {
        let usage = decoder.locate(event)?;
        let field = |k: &str| usage.get(k).and_then(as_u64);
        let decoded = TokenUsage {
            input_tokens: field("input_tokens"),
            cached_input_tokens: field("cached_input_tokens"),
            output_tokens: field("output_tokens"),
            reasoning_output_tokens: field("reasoning_output_tokens"),
            total_tokens: field("total_tokens"),
        };
        (!decoded.is_empty()).then_some(decoded)
    })
}

fn mentions_rate_limit(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    lower.contains("429")
        || lower.contains("rate limit")
        || lower.contains("rate_limit")
        || lower.contains("usage limit")
        || lower.contains("too many requests")
}

fn error_text(obj: &Value) -> Option<String> {
    let mut parts = Vec::new();
    for key in ["message", "error", "codex_error_info", "code"] {
        match obj.get(key) {
            Some(Value::String(s)) => parts.push(s.clone()),
            Some(nested @ Value::Object(_)) => parts.push(nested.to_string()),
            _ => {}
        }
    }
    if let Some(status) = obj.get("status").and_then(as_u64) {
        parts.push(status.to_string());
    }
    (!parts.is_empty()).then(|| parts.join(" "))
}

/// True for an error event caused by a rate-limit rejection
pub fn is_rate_limit_rejection(event: &Value) -> bool {
    let candidates = [Some(event), event.get("payload")];
    candidates.into_iter().flatten().any(|obj| {
        let is_error = obj
            .get("type")
            .and_then(Value::as_str)
            .is_some_and(|t| t.contains("error"));
        is_error && error_text(obj).is_some_and(|text| mentions_rate_limit(&text))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn reference() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_legacy_token_count_shape() {
        let event = json!({
            "created_at": "2026-03-01T12:00:00Z",
            "payload": {
                "type": "token_count",
                "info": {
                    "rate_limits": {
                        "primary": {"used_percent": 85},
                        "secondary": {"remaining_percent": 40}
                    }
                }
            }
        });
        let decoded = decode_rate_limit_event(&event).unwrap();
        assert_eq!(decoded.decoder, "token_count.info.rate_limits");
        assert_eq!(decoded.five_hour.unwrap().remaining_percent, Some(15.0));
        assert_eq!(decoded.weekly.unwrap().remaining_percent, Some(40.0));
        assert_eq!(decoded.timestamp, Some(reference()));
    }

    #[test]
    fn test_current_shape_with_unknown_fields() {
        let event = json!({
            "timestamp": "2026-03-01T12:00:00Z",
            "type": "event_msg",
            "future_field": [1, 2, 3],
            "payload": {
                "type": "token_count",
                "rate_limits": {
                    "primary": {"used_percent": 12.5, "window_minutes": 300, "resets_in_seconds": 600, "extra": true},
                    "secondary": {"used_percent": 30, "window_minutes": 10080, "resets_at": 1772539200}
                }
            }
        });
        let decoded = decode_rate_limit_event(&event).unwrap();
        assert_eq!(decoded.decoder, "payload.rate_limits");
        let five = decoded.five_hour.unwrap();
        assert_eq!(five.remaining_percent, Some(87.5));
        assert_eq!(five.window_minutes, Some(300));
        assert_eq!(five.reset_at, Some(reference() + Duration::minutes(10)));
        let week = decoded.weekly.unwrap();
        assert_eq!(week.remaining_percent, Some(70.0));
        assert_eq!(
            week.reset_at,
            Some(Utc.with_ymd_and_hms(2026, 3, 3, 12, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_percent_key_spellings_and_clamping() {
        assert_eq!(remaining_percent(&json!({"pct_left": 33})), Some(33.0));
        assert_eq!(remaining_percent(&json!({"pct_remaining": "21%"})), Some(21.0));
        assert_eq!(remaining_percent(&json!({"used_percent": 130})), Some(0.0));
        assert_eq!(remaining_percent(&json!({"used_percent": -20})), Some(100.0));
        assert_eq!(remaining_percent(&json!({"remaining_percent": 150})), Some(100.0));
        assert_eq!(remaining_percent(&json!({"other": 1})), None);
    }

    #[test]
    fn test_relative_reset_prefers_captured_at() {
        let event = json!({
            "created_at": "2026-03-01T11:00:00Z",
            "payload": {
                "rate_limits": {
                    "captured_at": "2026-03-01T12:00:00Z",
                    "primary": {"used_percent": 10, "resets_in_seconds": 60}
                }
            }
        });
        let decoded = decode_rate_limit_event(&event).unwrap();
        assert_eq!(decoded.timestamp, Some(reference()));
        assert_eq!(
            decoded.five_hour.unwrap().reset_at,
            Some(reference() + Duration::seconds(60))
        );
    }

    #[test]
    fn test_out_of_range_relative_reset_is_ignored() {
        let event = json!({
            "created_at": "2026-03-01T12:00:00Z",
            "payload": {
                "rate_limits": {
                    "primary": {"used_percent": 10, "resets_in_seconds": 1e13}
                }
            }
        });
        let decoded = decode_rate_limit_event(&event).unwrap();
        let five_hour = decoded.five_hour.unwrap();
        assert_eq!(five_hour.remaining_percent, Some(90.0));
        assert_eq!(five_hour.reset_at, None);

        // An absolute key still applies when the relative one overflows.
        let window = json!({"resets_in_seconds": 1e300, "resetsAt": "2026-03-01T12:00:00Z"});
        assert_eq!(reset_at(&window, Some(reference())), Some(reference()));
    }

    #[test]
    fn test_absolute_reset_units() {
        let secs = reference().timestamp();
        for raw in [json!(secs), json!(secs * 1_000), json!(secs * 1_000_000)] {
            assert_eq!(reset_at(&json!({"reset_time": raw}), None), Some(reference()));
        }
        assert_eq!(
            reset_at(&json!({"resetsAt": "2026-03-01T12:00:00Z"}), None),
            Some(reference())
        );
    }

    #[test]
    fn test_window_minutes_overrides_slot() {
        let event = json!({
            "created_at": "2026-03-01T12:00:00Z",
            "rate_limits": {
                "primary": {"used_percent": 50, "window_minutes": 10080}
            }
        });
        let decoded = decode_rate_limit_event(&event).unwrap();
        assert!(decoded.five_hour.is_none());
        assert_eq!(decoded.weekly.unwrap().remaining_percent, Some(50.0));
    }

    #[test]
    fn test_unrecognized_shapes_are_skipped() {
        assert!(decode_rate_limit_event(&json!({"payload": {"type": "message"}})).is_none());
        assert!(decode_rate_limit_event(&json!({"rate_limits": {"primary": {}}})).is_none());
        assert!(decode_rate_limit_event(&json!([1, 2])).is_none());
    }

    #[test]
    fn test_token_usage_shapes() {
        let turn = json!({
            "type": "turn.completed",
            "usage": {"input_tokens": 100, "cached_input_tokens": 40, "output_tokens": 20}
        });
        let usage = decode_token_usage(&turn).unwrap();
        assert_eq!(usage.input_tokens, Some(100));
        assert_eq!(usage.billable(), 80);

        let legacy = json!({
            "payload": {
                "type": "token_count",
                "info": {"last_token_usage": {"input_tokens": 5, "output_tokens": 7, "total_tokens": 12}}
            }
        });
        let usage = decode_token_usage(&legacy).unwrap();
        assert_eq!(usage.total_tokens, Some(12));
        assert!(decode_token_usage(&json!({"type": "turn.completed"})).is_none());
    }

    #[test]
    fn test_rate_limit_rejection() {
        assert!(is_rate_limit_rejection(&json!({
            "payload": {"type": "error", "message": "429 Too Many Requests"}
        })));
        assert!(is_rate_limit_rejection(&json!({
            "type": "stream_error",
            "message": "You've hit your usage limit."
        })));
        assert!(!is_rate_limit_rejection(&json!({
            "payload": {"type": "error", "message": "connection reset"}
        })));
        assert!(!is_rate_limit_rejection(&json!({
            "payload": {"type": "agent_message", "message": "rate limit docs"}
        })));
    }
}
