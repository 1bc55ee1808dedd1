use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::usage::AgentKind;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Rate-limit quota monitor for AI coding-agent CLIs")]
pub struct Config {
    /// Enable debug mode
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Polling interval in seconds
    #[arg(short = 'i', long, global = true)]
    pub poll_interval: Option<u64>,

    /// Allow automatic probes when log data is stale
    #[arg(long, global = true, action = clap::ArgAction::Set)]
    pub auto_probe: Option<bool>,

    /// Additional session log root (repeatable)
    #[arg(long = "root", global = true)]
    pub roots: Vec<PathBuf>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Subcommands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the monitor and print a line per snapshot change (default)
    Watch {
        /// Treat usage as not displayed (hourly polling unless urgent)
        #[arg(long)]
        hidden: bool,
    },
    /// Scan session logs once and print the rate-limit summary
    Scan,
    /// Run one active status probe and print its diagnostics
    Probe,
    /// Sweep orphaned probe processes and probe-only session logs
    Cleanup {
        /// Only terminate orphaned probe processes
        #[arg(long, conflicts_with = "sessions_only")]
        orphans_only: bool,
        /// Only delete probe-only session logs
        #[arg(long)]
        sessions_only: bool,
    },
    /// Scan once and print the cap-pressure estimate
    Estimate,
}

impl Config {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Resolve the subcommand, defaulting to `watch`
    pub fn command(&self) -> Command {
        self.command
            .clone()
            .unwrap_or(Command::Watch { hidden: false })
    }
}

/// Application settings (from config file)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Poll loop and probe gating
    #[serde(default)]
    pub monitor: MonitorSettings,

    /// Session log scanning
    #[serde(default)]
    pub scanner: ScannerSettings,

    /// Persistent passive listener
    #[serde(default)]
    pub listener: ListenerSettings,

    /// Active status probe
    #[serde(default)]
    pub probe: ProbeSettings,

    /// Probe artifact cleanup
    #[serde(default)]
    pub cleanup: CleanupSettings,

    /// Cap-pressure estimator
    #[serde(default)]
    pub cap_pressure: CapPressureSettings,
}

/// Poll loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    /// Agent whose quota is tracked
    #[serde(default)]
    pub agent: AgentKind,

    /// Polling interval while usage is displayed (seconds)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Polling interval while nothing displays usage (seconds)
    #[serde(default = "default_hidden_poll_interval")]
    pub hidden_poll_interval_secs: u64,

    /// Fixed polling interval on battery power (seconds)
    #[serde(default = "default_battery_poll_interval")]
    pub battery_poll_interval_secs: u64,

    /// Allow probes without a user request when log data is stale
    #[serde(default)]
    pub auto_probe: bool,

    /// Minimum spacing between automatic probes (seconds)
    #[serde(default = "default_auto_probe_cooldown")]
    pub auto_probe_cooldown_secs: u64,

    /// Wake the poll loop when session logs change
    #[serde(default = "default_watch_logs")]
    pub watch_logs: bool,
}

fn default_poll_interval() -> u64 {
    120
}

fn default_hidden_poll_interval() -> u64 {
    3600
}

fn default_battery_poll_interval() -> u64 {
    300
}

fn default_auto_probe_cooldown() -> u64 {
    600
}

fn default_watch_logs() -> bool {
    true
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            agent: AgentKind::default(),
            poll_interval_secs: default_poll_interval(),
            hidden_poll_interval_secs: default_hidden_poll_interval(),
            battery_poll_interval_secs: default_battery_poll_interval(),
            auto_probe: false,
            auto_probe_cooldown_secs: default_auto_probe_cooldown(),
            watch_logs: default_watch_logs(),
        }
    }
}

impl MonitorSettings {
    /// Configured interval while usage is visible
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Minimum spacing between automatic probes
    pub fn auto_probe_cooldown(&self) -> Duration {
        Duration::from_secs(self.auto_probe_cooldown_secs)
    }
}

/// Session log scanner settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerSettings {
    /// Log roots (empty = derive from environment)
    #[serde(default)]
    pub roots: Vec<PathBuf>,

    /// Only files modified within this many days are considered
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,

    /// Maximum number of files examined per scan
    #[serde(default = "default_max_files")]
    pub max_files: usize,

    /// Bytes read from the end of each file
    #[serde(default = "default_tail_bytes")]
    pub tail_bytes: u64,

    /// Age after which a scan result is flagged stale (seconds)
    #[serde(default = "default_scan_stale_after")]
    pub stale_after_secs: u64,
}

fn default_max_age_days() -> u32 {
    10
}

fn default_max_files() -> usize {
    80
}

fn default_tail_bytes() -> u64 {
    512 * 1024
}

fn default_scan_stale_after() -> u64 {
    30 * 60
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            max_age_days: default_max_age_days(),
            max_files: default_max_files(),
            tail_bytes: default_tail_bytes(),
            stale_after_secs: default_scan_stale_after(),
        }
    }
}

impl ScannerSettings {
    /// Roots to scan: configured roots, or the environment-derived default
    pub fn effective_roots(&self) -> Vec<PathBuf> {
        if !self.roots.is_empty() {
            return self.roots.clone();
        }
        default_session_roots()
    }
}

/// Default session log roots
///
/// `CAPWATCH_SESSIONS_ROOT` wins, then `$CODEX_HOME/sessions`, then
/// `~/.codex/sessions`.
pub fn default_session_roots() -> Vec<PathBuf> {
    if let Ok(root) = std::env::var("CAPWATCH_SESSIONS_ROOT") {
        if !root.trim().is_empty() {
            return vec![PathBuf::from(root)];
        }
    }
    if let Ok(home) = std::env::var("CODEX_HOME") {
        if !home.trim().is_empty() {
            return vec![PathBuf::from(home).join("sessions")];
        }
    }
    dirs::home_dir()
        .map(|home| vec![home.join(".codex").join("sessions")])
        .unwrap_or_default()
}

/// Passive listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerSettings {
    /// Run the persistent listener process
    #[serde(default)]
    pub enabled: bool,

    /// CLI binary name or path
    #[serde(default = "default_cli")]
    pub command: String,

    /// Extra arguments for the CLI
    #[serde(default)]
    pub args: Vec<String>,

    /// Command written to stdin right after launch
    #[serde(default = "default_warmup_command")]
    pub warmup_command: Option<String>,
}

fn default_cli() -> String {
    "codex".to_string()
}

fn default_warmup_command() -> Option<String> {
    Some("/status".to_string())
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            command: default_cli(),
            args: Vec::new(),
            warmup_command: default_warmup_command(),
        }
    }
}

/// Active probe settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSettings {
    /// Probe timeout in seconds
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,

    /// CLI binary name or path
    #[serde(default = "default_cli")]
    pub cli: String,

    /// Terminal multiplexer binary name or path
    #[serde(default = "default_tmux")]
    pub tmux: String,

    /// Prefix of the isolated tmux socket label
    #[serde(default = "default_label_prefix")]
    pub label_prefix: String,

    /// Working directory reserved for probe sessions
    #[serde(default)]
    pub workdir: Option<PathBuf>,

    /// Status command typed into the CLI
    #[serde(default = "default_status_command")]
    pub status_command: String,
}

fn default_probe_timeout() -> u64 {
    14
}

fn default_tmux() -> String {
    "tmux".to_string()
}

fn default_label_prefix() -> String {
    "capwatch-probe".to_string()
}

fn default_status_command() -> String {
    "/status".to_string()
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_probe_timeout(),
            cli: default_cli(),
            tmux: default_tmux(),
            label_prefix: default_label_prefix(),
            workdir: None,
            status_command: default_status_command(),
        }
    }
}

impl ProbeSettings {
    /// Probe timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Outer ceiling for a whole probe: `max(20, timeout + 8)` seconds
    pub fn hard_ceiling(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.saturating_add(8).max(20))
    }

    /// Directory reserved for probe traffic
    pub fn effective_workdir(&self) -> PathBuf {
        if let Some(dir) = &self.workdir {
            return dir.clone();
        }
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(std::env::temp_dir)
            .join("capwatch")
            .join("probe-workdir")
    }
}

/// Cleanup mode for probe artifacts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupMode {
    /// Only clean up when asked
    #[default]
    None,
    /// Delete probe-only session logs after probes
    Auto,
}

/// Cleanup settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupSettings {
    /// When probe session logs are deleted
    #[serde(default)]
    pub mode: CleanupMode,
}

/// Cap-pressure estimator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapPressureSettings {
    /// Warn when minutes-to-cap drops to this value
    #[serde(default = "default_warn_minutes")]
    pub warn_minutes: f64,

    /// Critical when minutes-to-cap drops to this value
    #[serde(default = "default_critical_minutes")]
    pub critical_minutes: f64,

    /// Trailing window for rate-limit rejection errors (minutes)
    #[serde(default = "default_error_window")]
    pub error_window_minutes: u32,

    /// Errors within the window needed for the fallback estimate
    #[serde(default = "default_error_count")]
    pub error_count: usize,

    /// Minutes reported by the error fallback
    #[serde(default = "default_fallback_minutes")]
    pub fallback_minutes: f64,

    /// Smoothing factor of the token-rate moving average
    #[serde(default = "default_ema_alpha")]
    pub ema_alpha: f64,

    /// Snapshots kept per quota window
    #[serde(default = "default_history_len")]
    pub history_len: usize,
}

fn default_warn_minutes() -> f64 {
    10.0
}

fn default_critical_minutes() -> f64 {
    5.0
}

fn default_error_window() -> u32 {
    10
}

fn default_error_count() -> usize {
    2
}

fn default_fallback_minutes() -> f64 {
    10.0
}

fn default_ema_alpha() -> f64 {
    0.2
}

fn default_history_len() -> usize {
    6
}

impl Default for CapPressureSettings {
    fn default() -> Self {
        Self {
            warn_minutes: default_warn_minutes(),
            critical_minutes: default_critical_minutes(),
            error_window_minutes: default_error_window(),
            error_count: default_error_count(),
            fallback_minutes: default_fallback_minutes(),
            ema_alpha: default_ema_alpha(),
            history_len: default_history_len(),
        }
    }
}

impl Settings {
    /// Load settings from config file or use defaults
    pub fn load(path: Option<&PathBuf>) -> Result<Self> {
        // Try custom path first
        if let Some(p) = path {
            if p.exists() {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("Failed to read config file: {:?}", p))?;
                return toml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file: {:?}", p));
            }
        }

        let default_paths = [
            dirs::config_dir().map(|p| p.join("capwatch/config.toml")),
            dirs::home_dir().map(|p| p.join(".config/capwatch/config.toml")),
            dirs::home_dir().map(|p| p.join(".capwatch.toml")),
        ];

        for path in default_paths.iter().flatten() {
            if path.exists() {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file: {:?}", path))?;
                return toml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file: {:?}", path));
            }
        }

        Ok(Self::default())
    }

    /// Merge CLI config into settings (CLI takes precedence)
    pub fn merge_cli(&mut self, cli: &Config) {
        if let Some(poll_interval) = cli.poll_interval {
            self.monitor.poll_interval_secs = poll_interval;
        }
        if let Some(auto_probe) = cli.auto_probe {
            self.monitor.auto_probe = auto_probe;
        }
        if !cli.roots.is_empty() {
            self.scanner.roots = cli.roots.clone();
        }
    }

    /// Validate and normalize settings values
    pub fn validate(&mut self) {
        const MIN_POLL_INTERVAL: u64 = 5;
        const MIN_PROBE_TIMEOUT: u64 = 2;

        if self.monitor.poll_interval_secs < MIN_POLL_INTERVAL {
            self.monitor.poll_interval_secs = MIN_POLL_INTERVAL;
        }
        if self.monitor.battery_poll_interval_secs < MIN_POLL_INTERVAL {
            self.monitor.battery_poll_interval_secs = MIN_POLL_INTERVAL;
        }
        if self.monitor.hidden_poll_interval_secs < self.monitor.poll_interval_secs {
            self.monitor.hidden_poll_interval_secs = self.monitor.poll_interval_secs;
        }
        if self.probe.timeout_secs < MIN_PROBE_TIMEOUT {
            self.probe.timeout_secs = MIN_PROBE_TIMEOUT;
        }
        if self.scanner.max_files == 0 {
            self.scanner.max_files = 1;
        }
        if self.scanner.tail_bytes == 0 {
            self.scanner.tail_bytes = default_tail_bytes();
        }

        let cap = &mut self.cap_pressure;
        if !(cap.ema_alpha > 0.0 && cap.ema_alpha <= 1.0) {
            cap.ema_alpha = default_ema_alpha();
        }
        if cap.critical_minutes < 0.0 {
            cap.critical_minutes = 0.0;
        }
        if cap.warn_minutes < cap.critical_minutes {
            cap.warn_minutes = cap.critical_minutes;
        }
        if cap.history_len < 2 {
            cap.history_len = 2;
        }
        if cap.error_count == 0 {
            cap.error_count = 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.monitor.poll_interval_secs, 120);
        assert_eq!(settings.monitor.hidden_poll_interval_secs, 3600);
        assert!(!settings.monitor.auto_probe);
        assert_eq!(settings.scanner.max_age_days, 10);
        assert_eq!(settings.scanner.max_files, 80);
        assert_eq!(settings.scanner.tail_bytes, 512 * 1024);
        assert_eq!(settings.probe.timeout_secs, 14);
        assert_eq!(settings.cleanup.mode, CleanupMode::None);
        assert_eq!(settings.cap_pressure.warn_minutes, 10.0);
        assert_eq!(settings.cap_pressure.critical_minutes, 5.0);
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            [monitor]
            poll_interval_secs = 60
            auto_probe = true

            [probe]
            timeout_secs = 20

            [cleanup]
            mode = "auto"

            [cap_pressure]
            warn_minutes = 15
        "#;

        let settings: Settings = toml::from_str(toml).expect("Should parse TOML");
        assert_eq!(settings.monitor.poll_interval_secs, 60);
        assert!(settings.monitor.auto_probe);
        assert_eq!(settings.probe.timeout_secs, 20);
        assert_eq!(settings.cleanup.mode, CleanupMode::Auto);
        assert_eq!(settings.cap_pressure.warn_minutes, 15.0);
        assert_eq!(settings.cap_pressure.critical_minutes, 5.0);
        assert_eq!(settings.scanner.max_files, 80);
    }

    #[test]
    fn test_hard_ceiling() {
        let mut probe = ProbeSettings::default();
        assert_eq!(probe.hard_ceiling(), Duration::from_secs(22));
        probe.timeout_secs = 5;
        assert_eq!(probe.hard_ceiling(), Duration::from_secs(20));
        probe.timeout_secs = 30;
        assert_eq!(probe.hard_ceiling(), Duration::from_secs(38));
    }

    #[test]
    fn test_validate_normalizes_thresholds() {
        let mut settings = Settings::default();
        settings.monitor.poll_interval_secs = 0;
        settings.cap_pressure.warn_minutes = 2.0;
        settings.cap_pressure.critical_minutes = 5.0;
        settings.cap_pressure.ema_alpha = 3.0;
        settings.validate();

        assert_eq!(settings.monitor.poll_interval_secs, 5);
        assert_eq!(settings.cap_pressure.warn_minutes, 5.0);
        assert_eq!(settings.cap_pressure.ema_alpha, 0.2);
    }

    #[test]
    fn test_merge_cli_overrides() {
        let cli = Config::parse_from([
            "capwatch",
            "--poll-interval",
            "30",
            "--auto-probe",
            "true",
            "--root",
            "/tmp/logs",
            "scan",
        ]);
        let mut settings = Settings::default();
        settings.merge_cli(&cli);

        assert_eq!(settings.monitor.poll_interval_secs, 30);
        assert!(settings.monitor.auto_probe);
        assert_eq!(settings.scanner.roots, vec![PathBuf::from("/tmp/logs")]);
        assert_eq!(cli.command(), Command::Scan);
    }

    #[test]
    fn test_default_roots_env_override() {
        temp_env::with_vars(
            [
                ("CAPWATCH_SESSIONS_ROOT", Some("/data/sessions")),
                ("CODEX_HOME", Some("/opt/codex")),
            ],
            || {
                assert_eq!(
                    default_session_roots(),
                    vec![PathBuf::from("/data/sessions")]
                );
            },
        );
        temp_env::with_vars(
            [
                ("CAPWATCH_SESSIONS_ROOT", None),
                ("CODEX_HOME", Some("/opt/codex")),
            ],
            || {
                assert_eq!(
                    default_session_roots(),
                    vec![PathBuf::from("/opt/codex/sessions")]
                );
            },
        );
    }
}
