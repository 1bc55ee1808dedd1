//! Parse status lines printed by the agent CLI (`/status` output).
//!
//! Expected lines (box-drawing and colors vary by version):
//! ```text
//!   5h limit:     [████████░░░░] 72% left (resets 14:05)
//!   Weekly limit: [███░░░░░░░░░] 23% used (resets 09:00 on 20 Oct)
//!   Account:      user@example.com (Plus)
//!   Model:        gpt-5-codex (reasoning medium)
//! ```

use once_cell::sync::Lazy;
use regex::Regex;

use crate::usage::{QuotaReading, QuotaWindow, WindowReading};

static OSC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)").unwrap());
static CSI_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").unwrap());

static LIMIT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(5h|5-hour|five[- ]hour|weekly|week)\s+limit\b[^0-9]*?(\d{1,3}(?:\.\d+)?)\s*%\s*(left|remaining|used)(?:[^(]*\(\s*resets?\s+([^)]+)\))?",
    )
    .unwrap()
});
static ACCOUNT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\W*account\s*:\s*(.+)$").unwrap());
static MODEL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\W*model\s*:\s*(.+)$").unwrap());

/// Remove OSC and CSI escape sequences
pub fn strip_ansi(input: &str) -> String {
    let without_osc = OSC_RE.replace_all(input, "");
    CSI_RE.replace_all(&without_osc, "").to_string()
}

/// One recognized status line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusLine {
    /// A quota window line
    Limit {
        window: QuotaWindow,
        reading: WindowReading,
    },
    /// Account summary
    Account(String),
    /// Model summary
    Model(String),
}

/// Recognize one raw output line (escape sequences are stripped first)
pub fn parse_status_line(raw: &str) -> Option<StatusLine> {
    let line = strip_ansi(raw);
    let line = line.trim().trim_matches('│').trim();
    if line.is_empty() {
        return None;
    }

    if let Some(caps) = LIMIT_RE.captures(line) {
        let label = caps[1].to_ascii_lowercase();
        let window = if label.starts_with("week") {
            QuotaWindow::Weekly
        } else {
            QuotaWindow::FiveHour
        };
        let value: f64 = caps[2].parse().ok()?;
        let remaining = if caps[3].eq_ignore_ascii_case("used") {
            100.0 - value
        } else {
            value
        };
        let reading = WindowReading {
            remaining_percent: Some(crate::usage::clamp_percent(remaining)),
            reset_text: caps.get(4).map(|m| m.as_str().trim().to_string()),
        };
        return Some(StatusLine::Limit { window, reading });
    }
    if let Some(caps) = ACCOUNT_RE.captures(line) {
        return Some(StatusLine::Account(caps[1].trim().to_string()));
    }
    if let Some(caps) = MODEL_RE.captures(line) {
        return Some(StatusLine::Model(caps[1].trim().to_string()));
    }
    None
}

/// Parse a whole captured screen into a quota reading
pub fn parse_status_text(text: &str) -> QuotaReading {
    let mut reading = QuotaReading::default();
    for line in text.lines() {
        if let Some(StatusLine::Limit { window, reading: r }) = parse_status_line(line) {
            match window {
                QuotaWindow::FiveHour => reading.five_hour = r,
                QuotaWindow::Weekly => reading.weekly = r,
            }
        }
    }
    reading
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_strip_ansi() {
        let input = "\x1b[1;32m5h limit:\x1b[0m 72% left\x1b]0;title\x07";
        assert_eq!(strip_ansi(input), "5h limit: 72% left");
    }

    #[test]
    fn test_parse_limit_lines() {
        let line = "│  5h limit:     [████████░░░░] 72% left (resets 14:05)  │";
        assert_eq!(
            parse_status_line(line),
            Some(StatusLine::Limit {
                window: QuotaWindow::FiveHour,
                reading: WindowReading {
                    remaining_percent: Some(72),
                    reset_text: Some("14:05".to_string()),
                },
            })
        );

        let weekly = "\x1b[2m  Weekly limit: [███░░░░░░░░░] 23% used (resets 09:00 on 20 Oct)\x1b[0m";
        assert_eq!(
            parse_status_line(weekly),
            Some(StatusLine::Limit {
                window: QuotaWindow::Weekly,
                reading: WindowReading {
                    remaining_percent: Some(77),
                    reset_text: Some("09:00 on 20 Oct".to_string()),
                },
            })
        );
    }

    #[test]
    fn test_limit_without_reset() {
        let Some(StatusLine::Limit { reading, .. }) = parse_status_line("5h limit: 0% left") else {
            panic!("expected limit line");
        };
        assert_eq!(reading.remaining_percent, Some(0));
        assert_eq!(reading.reset_text, None);
    }

    #[test]
    fn test_account_and_model() {
        assert_eq!(
            parse_status_line("│  Account:  user@example.com (Plus)  │"),
            Some(StatusLine::Account("user@example.com (Plus)".to_string()))
        );
        assert_eq!(
            parse_status_line("  Model:    gpt-5-codex (reasoning medium)"),
            Some(StatusLine::Model("gpt-5-codex (reasoning medium)".to_string()))
        );
    }

    #[test]
    fn test_unrelated_lines_ignored() {
        assert_eq!(parse_status_line(""), None);
        assert_eq!(parse_status_line("› /status"), None);
        assert_eq!(parse_status_line("Working (3s • esc to interrupt)"), None);
    }

    #[test]
    fn test_parse_status_text() {
        let text = "header\n5h limit: [██] 40% left (resets 18:00)\nWeekly limit: [█] 90% left (resets 10:00 on 3 Nov)\n";
        let reading = parse_status_text(text);
        assert_eq!(reading.five_hour.remaining_percent, Some(40));
        assert_eq!(reading.weekly.reset_text.as_deref(), Some("10:00 on 3 Nov"));
    }
}
