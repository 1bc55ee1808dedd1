//! JSON envelope printed by the probe script on stdout.
//!
//! ```json
//! {"ok":true,"five_hour":{"pct_left":72,"resets":"14:05"},
//!  "weekly":{"pct_left":40,"resets":"09:00 on 20 Oct"},"raw":"..."}
//! ```

use serde::Deserialize;
use serde_json::Value;

use crate::listener::parse_status_text;
use crate::usage::{clamp_percent, QuotaReading, WindowReading};

#[derive(Debug, Default, Deserialize)]
struct EnvelopeWindow {
    #[serde(default, alias = "pct_left", alias = "percent_left", alias = "remaining_percent")]
    remaining: Option<Value>,
    #[serde(default, alias = "resets", alias = "reset_text")]
    reset: Option<String>,
}

impl EnvelopeWindow {
    fn into_reading(self) -> WindowReading {
        let remaining = match self.remaining {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().trim_end_matches('%').parse().ok(),
            _ => None,
        };
        WindowReading {
            remaining_percent: remaining.map(clamp_percent),
            reset_text: self
                .reset
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProbeEnvelope {
    #[serde(default)]
    ok: bool,
    #[serde(default, alias = "fiveHour", alias = "5h")]
    five_hour: Option<EnvelopeWindow>,
    #[serde(default, alias = "week")]
    weekly: Option<EnvelopeWindow>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    raw: Option<String>,
}

/// Parse script stdout into a reading, or a reason it is unusable.
///
/// Login shells may print noise before the envelope, so the last line that
/// looks like a JSON object is used.
pub fn parse_envelope(stdout: &str) -> Result<QuotaReading, String> {
    let line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| l.starts_with('{') && l.ends_with('}'))
        .ok_or_else(|| "no JSON envelope on stdout".to_string())?;
    let envelope: ProbeEnvelope =
        serde_json::from_str(line).map_err(|e| format!("invalid envelope: {}", e))?;

    if !envelope.ok {
        return Err(envelope
            .error
            .unwrap_or_else(|| "probe reported failure".to_string()));
    }

    let mut reading = QuotaReading {
        five_hour: envelope
            .five_hour
            .map(EnvelopeWindow::into_reading)
            .unwrap_or_default(),
        weekly: envelope
            .weekly
            .map(EnvelopeWindow::into_reading)
            .unwrap_or_default(),
    };
    if reading.is_empty() {
        if let Some(raw) = envelope.raw.as_deref() {
            reading = parse_status_text(raw);
        }
    }
    if reading.is_empty() {
        return Err("envelope carried no quota data".to_string());
    }
    Ok(reading)
}
