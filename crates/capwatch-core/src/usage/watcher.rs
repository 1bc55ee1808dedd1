//! Filesystem watcher on the log roots that wakes the poll loop early.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Minimum spacing between two wake-ups
pub const WAKE_THROTTLE: Duration = Duration::from_secs(5);

fn is_log_change(event: &Event) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event.paths.iter().any(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("jsonl") | Some("ndjson")
            )
        })
}

/// Decides whether a change should wake the loop, with throttling
pub struct WakeGate<F> {
    should_wake: F,
    last_wake: Mutex<Option<Instant>>,
    throttle: Duration,
}

impl<F: Fn() -> bool> WakeGate<F> {
    /// Create a gate; `should_wake` is consulted on every change
    pub fn new(should_wake: F, throttle: Duration) -> Self {
        Self {
            should_wake,
            last_wake: Mutex::new(None),
            throttle,
        }
    }

    /// True when a wake is allowed now; records the wake
    pub fn admit(&self, now: Instant) -> bool {
        if !(self.should_wake)() {
            return false;
        }
        let mut last = self.last_wake.lock();
        if last.is_some_and(|prev| now.duration_since(prev) < self.throttle) {
            return false;
        }
        *last = Some(now);
        true
    }
}

/// Keeps the underlying watcher alive; dropping it stops watching
pub struct LogWatcher {
    _watcher: RecommendedWatcher,
    roots: Vec<PathBuf>,
}

impl LogWatcher {
    /// Watch `roots` recursively and notify `wake` on log changes that
    /// pass `should_wake`. Missing roots are skipped.
    pub fn spawn<F>(roots: &[PathBuf], wake: Arc<Notify>, should_wake: F) -> Result<Self>
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        let gate = WakeGate::new(should_wake, WAKE_THROTTLE);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if is_log_change(&event) && gate.admit(Instant::now()) {
                    debug!("Log change detected, waking poll loop");
                    wake.notify_one();
                }
            }
            Err(e) => warn!("Log watcher error: {}", e),
        })
        .context("Failed to create log watcher")?;

        let mut watched = Vec::new();
        for root in roots {
            if !root.is_dir() {
                continue;
            }
            watcher
                .watch(root, RecursiveMode::Recursive)
                .with_context(|| format!("Failed to watch {}", root.display()))?;
            watched.push(root.clone());
        }

        Ok(Self {
            _watcher: watcher,
            roots: watched,
        })
    }

    /// Roots actually being watched
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// True when `path` lies under a watched root
    pub fn covers(&self, path: &Path) -> bool {
        self.roots.iter().any(|r| path.starts_with(r))
    }
}
