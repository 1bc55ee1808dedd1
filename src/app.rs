//! Command runner for the `capwatch` binary.

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info};

use capwatch_core::config::{Command, Settings};
use capwatch_core::monitor::{UsageMonitor, UsageMonitorBuilder};
use capwatch_core::probe::{CleanupOutcome, OrphanSweepReport};
use capwatch_core::usage::LogScanner;

use crate::render;

/// Combined result of `capwatch cleanup`
#[derive(Debug, Serialize)]
pub struct CleanupSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orphans: Option<OrphanSweepReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sessions: Option<CleanupOutcome>,
}

/// Main application
pub struct App {
    settings: Settings,
}

impl App {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    fn monitor(&self) -> UsageMonitor {
        UsageMonitorBuilder::new(self.settings.clone()).build()
    }

    /// Run one command to completion
    pub async fn run(self, command: Command) -> Result<()> {
        match command {
            Command::Watch { hidden } => self.watch(hidden).await,
            Command::Scan => self.scan().await,
            Command::Probe => self.probe().await,
            Command::Cleanup {
                orphans_only,
                sessions_only,
            } => self.cleanup(!sessions_only, !orphans_only).await,
            Command::Estimate => self.estimate().await,
        }
    }

    async fn watch(&self, hidden: bool) -> Result<()> {
        let monitor = self.monitor();
        monitor.set_visible(!hidden);
        monitor.start();

        let mut rx = monitor.subscribe();
        let mut last_line = String::new();
        loop {
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = rx.borrow_and_update().clone();
                    let line = render::status_line(&snapshot, monitor.staleness());
                    if line != last_line {
                        println!("{}", line);
                        last_line = line;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    debug!("Interrupted");
                    break;
                }
            }
        }

        monitor.stop().await;
        Ok(())
    }

    async fn scan(&self) -> Result<()> {
        let scanner = LogScanner::from_settings(&self.settings.scanner);
        let report = tokio::task::spawn_blocking(move || scanner.scan())
            .await
            .context("Log scan task failed")?;
        print_json(&report)
    }

    async fn probe(&self) -> Result<()> {
        let monitor = self.monitor();
        let diag = monitor.force_probe_now().await;
        info!(
            "Probe finished: {:?} in {} ms",
            diag.outcome, diag.elapsed_ms
        );
        print_json(&diag)
    }

    async fn cleanup(&self, orphans: bool, sessions: bool) -> Result<()> {
        let monitor = self.monitor();
        let orphans = if orphans {
            Some(monitor.sweep_orphans().await)
        } else {
            None
        };
        let sessions = if sessions {
            Some(monitor.cleanup_probe_sessions().await?)
        } else {
            None
        };
        print_json(&CleanupSummary { orphans, sessions })
    }

    async fn estimate(&self) -> Result<()> {
        let monitor = self.monitor();
        let snapshot = monitor.refresh_now().await;
        print_json(&snapshot.cap_pressure)
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", json);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_summary_omits_skipped_parts() {
        let summary = CleanupSummary {
            orphans: None,
            sessions: Some(CleanupOutcome::Deleted { count: 2 }),
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"sessions": {"status": "deleted", "count": 2}})
        );
    }

    #[tokio::test]
    async fn test_cleanup_sessions_only_on_empty_root() {
        let root = tempfile::TempDir::new().unwrap();
        let mut settings = Settings::default();
        settings.scanner.roots = vec![root.path().to_path_buf()];
        let app = App::new(settings);
        app.cleanup(false, true).await.unwrap();
    }
}
