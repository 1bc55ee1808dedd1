//! UsageMonitor: the facade over scanner, listener, probe and estimator.
//!
//! Every mutation of the snapshot goes through
//! [`MonitorState`](crate::state::MonitorState) behind one lock held only
//! for the duration of a merge. Observers receive owned copies through a
//! `watch` channel and never see half-applied updates.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::cadence::{is_urgent, poll_interval};
use super::events::MonitorEvent;
use super::poller::Poller;
use crate::binaries::BinaryResolver;
use crate::config::{CleanupMode, ListenerSettings, Settings};
use crate::estimator::Severity;
use crate::listener::{ListenerEvent, ListenerSupervisor, StatusLine};
use crate::power::PowerSource;
use crate::probe::{
    CleanupError, CleanupOutcome, OrphanSweepReport, OrphanSweeper, ProbeDiagnostics,
    ProbeOrchestrator, SessionLogCleaner,
};
use crate::state::{SharedState, SnapshotReceiver, SnapshotSender};
use crate::usage::{LogScanner, LogWatcher, ScanReport, Staleness, UsageSnapshot};

/// Time allowed for background tasks to wind down on stop
const STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Failures surfaced to callers of the monitor API
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Deletion of probe artifacts failed part-way
    #[error(transparent)]
    Cleanup(#[from] CleanupError),

    /// A background task panicked or was cancelled
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub(crate) struct Inner {
    pub(crate) settings: RwLock<Arc<Settings>>,
    pub(crate) state: SharedState,
    pub(crate) snapshot_tx: SnapshotSender,
    pub(crate) event_tx: broadcast::Sender<MonitorEvent>,
    pub(crate) scanner: RwLock<LogScanner>,
    pub(crate) probe: ProbeOrchestrator,
    pub(crate) resolver: Arc<dyn BinaryResolver>,
    pub(crate) power: Arc<dyn PowerSource>,
    pub(crate) wake: Arc<Notify>,
    /// Serializes refresh cycles
    pub(crate) cycle: tokio::sync::Mutex<()>,
    pub(crate) listener: Mutex<Option<Arc<ListenerSupervisor>>>,
    pub(crate) watcher: Mutex<Option<LogWatcher>>,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Usage monitor facade. Cheap to clone; clones share everything.
///
/// Constructed via [`UsageMonitorBuilder`](super::builder::UsageMonitorBuilder).
#[derive(Clone)]
pub struct UsageMonitor {
    inner: Arc<Inner>,
}

fn listener_settings_differ(a: &ListenerSettings, b: &ListenerSettings) -> bool {
    a.enabled != b.enabled
        || a.command != b.command
        || a.args != b.args
        || a.warmup_command != b.warmup_command
}

impl UsageMonitor {
    pub(crate) fn from_inner(inner: Inner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<MonitorEvent> {
        self.inner.event_tx.clone()
    }

    /// Send an event; ignored when nobody listens
    pub(crate) fn emit(&self, event: MonitorEvent) {
        let _ = self.inner.event_tx.send(event);
    }

    pub(crate) fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.inner.wake)
    }

    /// Current settings
    pub fn settings(&self) -> Arc<Settings> {
        Arc::clone(&self.inner.settings.read())
    }

    /// Shared state, for embedding consumers that render it directly
    pub fn state(&self) -> &SharedState {
        &self.inner.state
    }

    /// Poll loop is active
    pub fn is_running(&self) -> bool {
        self.inner.state.read().running
    }

    /// Copy of the current snapshot
    pub fn snapshot(&self) -> UsageSnapshot {
        self.inner.state.read().snapshot.clone()
    }

    /// Receiver that always holds the latest published snapshot
    pub fn subscribe(&self) -> SnapshotReceiver {
        self.inner.snapshot_tx.subscribe()
    }

    /// Staleness of the held data under the agent's source model
    pub fn staleness(&self) -> Staleness {
        self.inner.state.read().current_staleness(Utc::now())
    }

    // =========================================================
    // Lifecycle
    // =========================================================

    /// Start the poll loop, the listener (when enabled) and the log
    /// watcher, and sweep orphans left by earlier runs. Returns false when
    /// already running. Must be called inside a Tokio runtime.
    pub fn start(&self) -> bool {
        {
            let mut state = self.inner.state.write();
            if state.running {
                return false;
            }
            state.running = true;
        }
        let settings = self.settings();
        info!("Usage monitor started (agent {:?})", settings.monitor.agent);

        let mut tasks = Vec::new();
        let sweeper = self.clone();
        tasks.push(tokio::spawn(async move {
            sweeper.sweep_orphans().await;
        }));
        if settings.listener.enabled {
            tasks.push(self.start_listener(&settings.listener));
        }
        if settings.monitor.watch_logs {
            self.start_watcher();
        }
        tasks.push(Poller::new(self.clone()).start());

        self.inner.tasks.lock().extend(tasks);
        true
    }

    /// Stop everything started by [`start`](Self::start). An in-flight
    /// probe is cancelled through its status flag.
    pub async fn stop(&self) {
        {
            let mut state = self.inner.state.write();
            if !state.running {
                return;
            }
            state.running = false;
        }
        self.inner.wake.notify_one();
        self.inner.probe.cancel();

        let listener = self.inner.listener.lock().take();
        if let Some(listener) = listener {
            listener.stop().await;
        }
        self.inner.watcher.lock().take();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.tasks.lock());
        for mut task in tasks {
            if tokio::time::timeout(STOP_TIMEOUT, &mut task).await.is_err() {
                debug!("Background task did not finish in time, aborting");
                task.abort();
            }
        }
        info!("Usage monitor stopped");
    }

    /// Hint whether any observer currently displays usage
    pub fn set_visible(&self, visible: bool) {
        let was_visible = {
            let mut state = self.inner.state.write();
            std::mem::replace(&mut state.visible, visible)
        };
        if visible && !was_visible {
            debug!("Usage became visible, waking poll loop");
            self.inner.wake.notify_one();
        }
    }

    /// Swap settings. Scanner, probe and estimator pick them up at once;
    /// the listener and log watcher restart when their inputs changed.
    pub async fn reload_settings(&self, mut settings: Settings) {
        settings.validate();
        let settings = Arc::new(settings);
        let previous = std::mem::replace(&mut *self.inner.settings.write(), Arc::clone(&settings));

        *self.inner.scanner.write() = LogScanner::from_settings(&settings.scanner);
        self.inner.probe.update_settings(settings.probe.clone());
        {
            let mut state = self.inner.state.write();
            state.agent = settings.monitor.agent;
            state
                .estimator
                .update_settings(settings.cap_pressure.clone());
        }

        if self.is_running() {
            if listener_settings_differ(&previous.listener, &settings.listener) {
                let old = self.inner.listener.lock().take();
                if let Some(old) = old {
                    old.stop().await;
                }
                if settings.listener.enabled {
                    let task = self.start_listener(&settings.listener);
                    self.inner.tasks.lock().push(task);
                }
            }
            self.inner.watcher.lock().take();
            if settings.monitor.watch_logs {
                self.start_watcher();
            }
        }
        info!("Settings reloaded");
        self.inner.wake.notify_one();
    }

    fn start_listener(&self, settings: &ListenerSettings) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(ListenerSupervisor::new(
            settings.clone(),
            Arc::clone(&self.inner.resolver),
            tx,
        ));
        supervisor.start();
        *self.inner.listener.lock() = Some(supervisor);

        let monitor = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                monitor.apply_listener_event(event);
            }
        })
    }

    fn start_watcher(&self) {
        let roots = self.inner.scanner.read().options().roots.clone();
        let state = self.inner.state.clone();
        let should_wake = move || {
            let state = state.read();
            state.visible || is_urgent(&state.snapshot, Utc::now())
        };
        match LogWatcher::spawn(&roots, self.wake_handle(), should_wake) {
            Ok(watcher) => {
                debug!("Watching {} log root(s)", watcher.roots().len());
                *self.inner.watcher.lock() = Some(watcher);
            }
            Err(e) => warn!("Log watcher unavailable: {:#}", e),
        }
    }

    // =========================================================
    // Refresh cycle
    // =========================================================

    /// Interval the poll loop sleeps before the next cycle
    pub fn current_interval(&self) -> Duration {
        let settings = self.settings();
        let (visible, urgent) = {
            let state = self.inner.state.read();
            (state.visible, is_urgent(&state.snapshot, Utc::now()))
        };
        poll_interval(
            &settings.monitor,
            visible,
            self.inner.power.on_battery(),
            urgent,
        )
    }

    /// Rescan the logs and probe if the data is stale and automatic probes
    /// are allowed. Returns the resulting snapshot.
    pub async fn refresh_now(&self) -> UsageSnapshot {
        self.refresh_cycle(false).await;
        self.snapshot()
    }

    /// One cycle. From the poll loop, the running flag is checked again
    /// before any probe is launched.
    pub(crate) async fn refresh_cycle(&self, from_loop: bool) {
        let _cycle = self.inner.cycle.lock().await;

        let scanner = self.inner.scanner.read().clone();
        let report = match tokio::task::spawn_blocking(move || scanner.scan()).await {
            Ok(report) => report,
            Err(e) => {
                warn!("Log scan task failed: {}", e);
                ScanReport::empty()
            }
        };

        let now = Utc::now();
        let changed = self.merge_scan(&report, now);
        self.update_pressure(now);
        self.publish(changed);

        if from_loop && !self.is_running() {
            return;
        }
        if self.claim_auto_probe(now) {
            debug!("Data stale, launching automatic probe");
            self.run_probe(false).await;
        }
    }

    fn merge_scan(&self, report: &ScanReport, now: DateTime<Utc>) -> bool {
        let mut state = self.inner.state.write();
        let state = &mut *state;

        let mut changed = state.snapshot.apply_summary(&report.summary, now);
        if changed {
            state.estimator.record_summary(&report.summary);
            debug!(
                "Merged rate limits from {:?}",
                report.summary.source.as_deref()
            );
        }
        if let Some(sample) = &report.last_turn {
            if state.snapshot.apply_token_sample(sample) {
                state
                    .estimator
                    .record_usage(sample.usage.billable(), sample.at.unwrap_or(now));
                changed = true;
            }
        }
        for at in state.take_new_rejections(&report.rejections) {
            state.estimator.record_rate_limit_error(at);
        }
        state.snapshot.last_refresh = Some(now);
        changed
    }

    /// Decide on an automatic probe and record its launch time
    fn claim_auto_probe(&self, now: DateTime<Utc>) -> bool {
        let settings = self.settings();
        if !settings.monitor.auto_probe || self.inner.probe.is_running() {
            return false;
        }
        let cooldown = chrono::Duration::from_std(settings.monitor.auto_probe_cooldown())
            .unwrap_or_else(|_| chrono::Duration::zero());

        let mut state = self.inner.state.write();
        if !state.current_staleness(now).any() {
            return false;
        }
        if !(state.visible || is_urgent(&state.snapshot, now)) {
            return false;
        }
        if state
            .last_auto_probe
            .is_some_and(|at| now - at < cooldown)
        {
            return false;
        }
        state.last_auto_probe = Some(now);
        true
    }

    fn update_pressure(&self, now: DateTime<Utc>) {
        let (severity, minutes, changed) = {
            let mut state = self.inner.state.write();
            let estimate = state.estimator.estimate(now);
            let previous = state
                .snapshot
                .cap_pressure
                .as_ref()
                .map(|p| p.severity)
                .unwrap_or_default();
            let severity = estimate.severity;
            let minutes = estimate.eta.as_ref().map(|e| e.minutes_to_cap);
            state.snapshot.cap_pressure = Some(estimate);
            (severity, minutes, severity != previous)
        };
        if changed {
            match severity {
                Severity::None => info!("Cap pressure cleared"),
                _ => warn!(
                    "Cap pressure {:?}: {:.1} minutes to cap",
                    severity,
                    minutes.unwrap_or_default()
                ),
            }
            self.emit(MonitorEvent::CapPressureChanged {
                severity,
                minutes_to_cap: minutes,
            });
        }
    }

    fn publish(&self, changed: bool) {
        let snapshot = self.snapshot();
        self.inner.snapshot_tx.send_replace(snapshot);
        if changed {
            self.emit(MonitorEvent::SnapshotUpdated);
        }
    }

    fn apply_listener_event(&self, event: ListenerEvent) {
        let now = Utc::now();
        let changed = {
            let mut state = self.inner.state.write();
            match &event {
                ListenerEvent::Available => {
                    let changed = !state.snapshot.listener_available;
                    state.snapshot.listener_available = true;
                    changed
                }
                ListenerEvent::Unavailable { .. } => {
                    let changed = state.snapshot.listener_available;
                    state.snapshot.listener_available = false;
                    changed
                }
                ListenerEvent::Status(StatusLine::Limit { window, reading }) => {
                    state.last_poll_success = Some(now);
                    state.snapshot.last_listener_at = Some(now);
                    state.snapshot.apply_listener_window(*window, reading)
                }
                ListenerEvent::Status(StatusLine::Account(account)) => {
                    let changed = state.snapshot.account.as_deref() != Some(account.as_str());
                    state.snapshot.account = Some(account.clone());
                    changed
                }
                ListenerEvent::Status(StatusLine::Model(model)) => {
                    let changed = state.snapshot.model.as_deref() != Some(model.as_str());
                    state.snapshot.model = Some(model.clone());
                    changed
                }
            }
        };

        match event {
            ListenerEvent::Available => self.emit(MonitorEvent::ListenerAvailability {
                available: true,
                reason: None,
            }),
            ListenerEvent::Unavailable { reason } => {
                self.emit(MonitorEvent::ListenerAvailability {
                    available: false,
                    reason: Some(reason),
                })
            }
            ListenerEvent::Status(_) => {}
        }
        self.publish(changed);
    }

    // =========================================================
    // Probes and estimator input
    // =========================================================

    /// Probe now, bypassing staleness and opt-in gating
    pub async fn force_probe_now(&self) -> ProbeDiagnostics {
        self.run_probe(true).await
    }

    /// Cancel the in-flight probe, if any
    pub fn cancel_probe(&self) -> bool {
        self.inner.probe.cancel()
    }

    async fn run_probe(&self, manual: bool) -> ProbeDiagnostics {
        if self.inner.probe.is_running() {
            return self.inner.probe.run(manual).await;
        }

        self.inner.state.write().snapshot.probing = true;
        self.publish(false);

        let diag = self.inner.probe.run(manual).await;
        if diag.outcome.is_skip() {
            // Lost the race; the winning run owns the probing flag.
            return diag;
        }

        let now = Utc::now();
        let changed = {
            let mut state = self.inner.state.write();
            state.snapshot.probing = false;
            match &diag.reading {
                Some(reading) => {
                    let agent = state.agent;
                    state.snapshot.last_probe_at = Some(now);
                    state.last_poll_success = Some(now);
                    if manual {
                        state.freshness.grant(agent, now);
                    }
                    state.freshness.prune(now);
                    state.snapshot.apply_probe_reading(reading)
                }
                None => false,
            }
        };
        self.publish(changed);
        self.emit(MonitorEvent::ProbeFinished {
            outcome: diag.outcome,
            success: diag.success,
            manual,
        });

        if diag.outcome.may_leave_orphans() {
            let monitor = self.clone();
            tokio::spawn(async move {
                monitor.sweep_orphans().await;
            });
        }
        if diag.label.is_some() {
            let monitor = self.clone();
            tokio::spawn(async move {
                if let Err(e) = monitor.cleanup_now_if_auto().await {
                    warn!("Automatic probe cleanup failed: {}", e);
                }
            });
        }
        diag
    }

    /// Record a rate-limit rejection observed outside the logs
    pub fn note_rate_limit_error(&self, at: DateTime<Utc>) {
        self.inner
            .state
            .write()
            .estimator
            .record_rate_limit_error(at);
        self.update_pressure(Utc::now());
        self.publish(false);
    }

    // =========================================================
    // Cleanup
    // =========================================================

    /// Terminate abandoned probe processes and isolated servers
    pub async fn sweep_orphans(&self) -> OrphanSweepReport {
        let settings = self.settings();
        let resolver = Arc::clone(&self.inner.resolver);
        let tmux_name = settings.probe.tmux.clone();
        let tmux = tokio::task::spawn_blocking(move || resolver.resolve(&tmux_name))
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| PathBuf::from(&settings.probe.tmux));

        let sweeper = OrphanSweeper::new(&settings.probe, tmux);
        let report = sweeper.sweep(&self.inner.probe.active_labels()).await;
        for error in &report.errors {
            warn!("Orphan sweep: {}", error);
        }
        self.emit(MonitorEvent::CleanupFinished {
            sweep: Some(report.clone()),
            sessions: None,
        });
        report
    }

    /// Delete probe-originated session logs
    pub async fn cleanup_probe_sessions(&self) -> Result<CleanupOutcome, MonitorError> {
        let settings = self.settings();
        let cleaner = SessionLogCleaner::new(&settings.scanner, &settings.probe);
        let outcome = tokio::task::spawn_blocking(move || cleaner.cleanup()).await??;
        self.emit(MonitorEvent::CleanupFinished {
            sweep: None,
            sessions: Some(outcome.clone()),
        });
        Ok(outcome)
    }

    /// Session-log cleanup when `[cleanup].mode = "auto"`, else `Disabled`
    pub async fn cleanup_now_if_auto(&self) -> Result<CleanupOutcome, MonitorError> {
        if self.settings().cleanup.mode != CleanupMode::Auto {
            return Ok(CleanupOutcome::Disabled);
        }
        self.cleanup_probe_sessions().await
    }
}
