//! Builder for constructing a [`UsageMonitor`] instance.
//!
//! ```ignore
//! let monitor = UsageMonitorBuilder::new(settings)
//!     .with_resolver(resolver)
//!     .with_power(power)
//!     .build();
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, Notify};

use super::coordinator::{Inner, UsageMonitor};
use crate::binaries::{BinaryResolver, LoginShellResolver};
use crate::config::Settings;
use crate::power::{PowerSource, SysfsPowerSource};
use crate::probe::ProbeOrchestrator;
use crate::state::{snapshot_channel, MonitorState, SharedState};
use crate::usage::LogScanner;

/// Channel capacity for monitor events
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Builder for constructing a [`UsageMonitor`] facade
pub struct UsageMonitorBuilder {
    settings: Arc<Settings>,
    state: Option<SharedState>,
    resolver: Option<Arc<dyn BinaryResolver>>,
    power: Option<Arc<dyn PowerSource>>,
    runtime_dir: Option<PathBuf>,
    probe_script: Option<PathBuf>,
}

impl UsageMonitorBuilder {
    /// Create a new builder with the given settings
    pub fn new(settings: Settings) -> Self {
        Self::from_shared_settings(Arc::new(settings))
    }

    /// Create a new builder from already-shared settings
    pub fn from_shared_settings(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            state: None,
            resolver: None,
            power: None,
            runtime_dir: None,
            probe_script: None,
        }
    }

    /// Use an existing shared state instead of creating a new one
    pub fn with_state(mut self, state: SharedState) -> Self {
        self.state = Some(state);
        self
    }

    /// Resolve `codex`/`tmux` through something other than the login shell
    pub fn with_resolver(mut self, resolver: Arc<dyn BinaryResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Override power-source detection
    pub fn with_power(mut self, power: Arc<dyn PowerSource>) -> Self {
        self.power = Some(power);
        self
    }

    /// Directory the probe script is materialized into
    pub fn with_runtime_dir(mut self, dir: PathBuf) -> Self {
        self.runtime_dir = Some(dir);
        self
    }

    /// Run this script instead of the embedded one
    pub fn with_probe_script(mut self, script: PathBuf) -> Self {
        self.probe_script = Some(script);
        self
    }

    /// Build the `UsageMonitor`
    ///
    /// Without explicit collaborators this uses the login-shell resolver and
    /// sysfs power detection.
    pub fn build(self) -> UsageMonitor {
        let settings = self.settings;
        let state = self.state.unwrap_or_else(|| {
            MonitorState::shared(settings.monitor.agent, settings.cap_pressure.clone())
        });
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(LoginShellResolver::new()));
        let power = self
            .power
            .unwrap_or_else(|| Arc::new(SysfsPowerSource::new()));

        let mut probe = ProbeOrchestrator::new(settings.probe.clone(), Arc::clone(&resolver));
        if let Some(dir) = self.runtime_dir {
            probe = probe.with_runtime_dir(dir);
        }
        if let Some(script) = self.probe_script {
            probe = probe.with_script(script);
        }

        let (snapshot_tx, _) = snapshot_channel();
        snapshot_tx.send_replace(state.read().snapshot.clone());
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        UsageMonitor::from_inner(Inner {
            scanner: RwLock::new(LogScanner::from_settings(&settings.scanner)),
            settings: RwLock::new(settings),
            state,
            snapshot_tx,
            event_tx,
            probe,
            resolver,
            power,
            wake: Arc::new(Notify::new()),
            cycle: tokio::sync::Mutex::new(()),
            listener: Mutex::new(None),
            watcher: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::AgentKind;

    #[test]
    fn test_builder_defaults() {
        let monitor = UsageMonitorBuilder::new(Settings::default()).build();

        assert_eq!(monitor.settings().monitor.poll_interval_secs, 120);
        assert!(!monitor.is_running());
        assert!(!monitor.snapshot().has_quota_data());
    }

    #[test]
    fn test_builder_with_state() {
        let state = MonitorState::shared(AgentKind::Codex, Default::default());
        state.write().snapshot.five_hour_remaining_percent = 12;
        let state_clone = state.clone();

        let monitor = UsageMonitorBuilder::new(Settings::default())
            .with_state(state)
            .build();

        assert!(Arc::ptr_eq(monitor.state(), &state_clone));
        // Subscribers start from the supplied state.
        assert_eq!(monitor.subscribe().borrow().five_hour_remaining_percent, 12);
    }

    #[test]
    fn test_builder_from_shared_settings() {
        let settings = Arc::new(Settings::default());
        let settings_clone = settings.clone();

        let monitor = UsageMonitorBuilder::from_shared_settings(settings).build();
        assert!(Arc::ptr_eq(&monitor.settings(), &settings_clone));
    }
}
