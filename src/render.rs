//! Plain-text usage lines printed by `capwatch watch`.

use capwatch_core::estimator::{CapPressureState, Severity};
use capwatch_core::usage::{QuotaWindow, Staleness, UsageSnapshot};

/// Cells in one meter bar
const BAR_WIDTH: usize = 10;

/// Render one window as `5h ██░░░░░░░░  15% 14:05`
pub fn meter(window: QuotaWindow, percent: u8, reset: &str) -> String {
    let percent = percent.min(100);
    let filled = BAR_WIDTH * percent as usize / 100;
    let mut line = format!(
        "{:<4} {}{} {:>3}%",
        window.label(),
        "█".repeat(filled),
        "░".repeat(BAR_WIDTH - filled),
        percent
    );
    if !reset.is_empty() {
        line.push(' ');
        line.push_str(reset);
    }
    line
}

fn pressure_suffix(pressure: &CapPressureState) -> Option<String> {
    let eta = pressure.eta.as_ref()?;
    let tier = match pressure.severity {
        Severity::None => return None,
        Severity::Warn => "warn",
        Severity::Critical => "CRITICAL",
    };
    Some(format!("cap {} in {:.0}m", tier, eta.minutes_to_cap))
}

/// One status line for the whole snapshot
pub fn status_line(snapshot: &UsageSnapshot, staleness: Staleness) -> String {
    if !snapshot.has_reading() {
        return if snapshot.probing {
            "usage: probing...".to_string()
        } else {
            "usage: no data".to_string()
        };
    }

    let mut parts: Vec<String> = QuotaWindow::ALL
        .into_iter()
        .map(|window| {
            let stale = match window {
                QuotaWindow::FiveHour => staleness.five_hour,
                QuotaWindow::Weekly => staleness.weekly,
            };
            let mut part = meter(
                window,
                snapshot.remaining(window),
                snapshot.reset_text(window),
            );
            if stale {
                part.push_str(" (stale)");
            }
            part
        })
        .collect();

    if let Some(suffix) = snapshot.cap_pressure.as_ref().and_then(pressure_suffix) {
        parts.push(suffix);
    }
    if snapshot.probing {
        parts.push("probing".to_string());
    }
    parts.join(" | ")
}
