//! Flexible timestamp decoding for session-log events.
//!
//! Logs carry ISO-8601 strings, naive date-times, and numeric epochs in
//! seconds, milliseconds or microseconds. Magnitude decides the unit.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

/// Above this an epoch value is taken as microseconds
const MICROS_THRESHOLD: f64 = 1e14;
/// Above this an epoch value is taken as milliseconds
const MILLIS_THRESHOLD: f64 = 1e11;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
];

/// Convert a numeric epoch to a UTC instant, detecting the unit by magnitude
pub fn from_epoch(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() || value <= 0.0 {
        return None;
    }
    let micros = if value > MICROS_THRESHOLD {
        value
    } else if value > MILLIS_THRESHOLD {
        value * 1_000.0
    } else {
        value * 1_000_000.0
    };
    if micros > i64::MAX as f64 {
        return None;
    }
    DateTime::from_timestamp_micros(micros as i64)
}

/// Parse a timestamp string: RFC 3339, naive date-time (taken as UTC), or a numeric epoch
pub fn parse_timestamp_str(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    // "Z"-less offsets like +0000
    if let Ok(parsed) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    raw.parse::<f64>().ok().and_then(from_epoch)
}

/// Decode any JSON value that may hold a timestamp
pub fn decode_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_f64().and_then(from_epoch),
        Value::String(s) => parse_timestamp_str(s),
        _ => None,
    }
}

/// Describe a reset instant in local time: `HH:MM` when it falls on the
/// same local day as `now`, else `HH:MM on D Mon`.
pub fn describe_reset(reset_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    describe_reset_in(reset_at, now, &Local)
}

/// [`describe_reset`] in an explicit time zone
pub fn describe_reset_in<Tz: TimeZone>(reset_at: DateTime<Utc>, now: DateTime<Utc>, tz: &Tz) -> String
where
    Tz::Offset: std::fmt::Display,
{
    let local_reset = reset_at.with_timezone(tz);
    let local_now = now.with_timezone(tz);
    if local_reset.date_naive() == local_now.date_naive() {
        local_reset.format("%H:%M").to_string()
    } else {
        local_reset.format("%H:%M on %-d %b").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn reference() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_epoch_units_by_magnitude() {
        let secs = reference().timestamp();
        assert_eq!(from_epoch(secs as f64), Some(reference()));
        assert_eq!(from_epoch((secs * 1_000) as f64), Some(reference()));
        assert_eq!(from_epoch((secs * 1_000_000) as f64), Some(reference()));
    }

    #[test]
    fn test_epoch_rejects_garbage() {
        assert_eq!(from_epoch(0.0), None);
        assert_eq!(from_epoch(-12.0), None);
        assert_eq!(from_epoch(f64::INFINITY), None);
    }

    #[test]
    fn test_fractional_seconds() {
        let ts = from_epoch(reference().timestamp() as f64 + 0.5).unwrap();
        assert_eq!(ts, reference() + Duration::milliseconds(500));
    }

    #[test]
    fn test_parse_string_forms() {
        let expected = reference();
        assert_eq!(parse_timestamp_str("2026-03-01T12:00:00Z"), Some(expected));
        assert_eq!(parse_timestamp_str("2026-03-01T13:00:00+01:00"), Some(expected));
        assert_eq!(parse_timestamp_str("2026-03-01T12:00:00.000"), Some(expected));
        assert_eq!(parse_timestamp_str("2026-03-01 12:00:00"), Some(expected));
        assert_eq!(
            parse_timestamp_str(&expected.timestamp_millis().to_string()),
            Some(expected)
        );
        assert_eq!(parse_timestamp_str("yesterday"), None);
        assert_eq!(parse_timestamp_str(""), None);
    }

    #[test]
    fn test_decode_json_values() {
        let secs = reference().timestamp();
        assert_eq!(decode_timestamp(&json!(secs)), Some(reference()));
        assert_eq!(
            decode_timestamp(&json!("2026-03-01T12:00:00Z")),
            Some(reference())
        );
        assert_eq!(decode_timestamp(&json!(null)), None);
        assert_eq!(decode_timestamp(&json!({"at": 1})), None);
    }

    #[test]
    fn test_describe_reset_same_day_and_later() {
        let now = reference();
        assert_eq!(
            describe_reset_in(now + Duration::minutes(95), now, &Utc),
            "13:35"
        );
        assert_eq!(
            describe_reset_in(now + Duration::days(3), now, &Utc),
            "12:00 on 4 Mar"
        );
    }
}
