//! Supervisor for the long-running passive listener process.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::sys::signal::Signal;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::parser::{parse_status_line, StatusLine};
use crate::binaries::BinaryResolver;
use crate::config::ListenerSettings;
use crate::tmux::process::signal_group;

/// Grace delay after each stop signal
const STOP_GRACE: Duration = Duration::from_millis(500);

/// Listener lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// Messages from the supervisor to the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    /// The child process was launched
    Available,
    /// The child is gone or could not be started
    Unavailable { reason: String },
    /// A recognized status line
    Status(StatusLine),
}

/// Sender half used by the supervisor
pub type ListenerEventSender = mpsc::UnboundedSender<ListenerEvent>;

enum RunOutcome {
    /// Stop was requested
    Stopped,
    /// The child ended on its own
    Exited(String),
}

struct Run {
    stop: Arc<Notify>,
    handle: JoinHandle<()>,
}

/// Owns one listener child and restarts it with exponential backoff
pub struct ListenerSupervisor {
    settings: ListenerSettings,
    resolver: Arc<dyn BinaryResolver>,
    events: ListenerEventSender,
    state: Arc<Mutex<ListenerState>>,
    enabled: Arc<AtomicBool>,
    run: Mutex<Option<Run>>,
}

impl ListenerSupervisor {
    pub fn new(
        settings: ListenerSettings,
        resolver: Arc<dyn BinaryResolver>,
        events: ListenerEventSender,
    ) -> Self {
        Self {
            settings,
            resolver,
            events,
            state: Arc::new(Mutex::new(ListenerState::Idle)),
            enabled: Arc::new(AtomicBool::new(false)),
            run: Mutex::new(None),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ListenerState {
        *self.state.lock()
    }

    /// Start supervising. Idempotent while starting or running; returns
    /// whether a new supervision task was spawned.
    pub fn start(&self) -> bool {
        {
            let mut state = self.state.lock();
            if matches!(*state, ListenerState::Starting | ListenerState::Running) {
                return false;
            }
            *state = ListenerState::Starting;
        }
        self.enabled.store(true, Ordering::SeqCst);

        let stop = Arc::new(Notify::new());
        let ctx = SuperviseCtx {
            settings: self.settings.clone(),
            resolver: self.resolver.clone(),
            events: self.events.clone(),
            state: self.state.clone(),
            enabled: self.enabled.clone(),
            stop: stop.clone(),
        };
        let handle = tokio::spawn(ctx.supervise());
        *self.run.lock() = Some(Run { stop, handle });
        info!("Listener supervisor started");
        true
    }

    /// Stop the child (interrupt, then terminate, then kill) and the
    /// supervision task. No restart follows.
    pub async fn stop(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        let Some(run) = self.run.lock().take() else {
            return;
        };
        {
            let mut state = self.state.lock();
            if *state != ListenerState::Idle {
                *state = ListenerState::Stopping;
            }
        }
        run.stop.notify_one();
        if let Err(e) = run.handle.await {
            warn!("Listener task ended abnormally: {}", e);
        }
        *self.state.lock() = ListenerState::Idle;
        info!("Listener supervisor stopped");
    }
}

struct SuperviseCtx {
    settings: ListenerSettings,
    resolver: Arc<dyn BinaryResolver>,
    events: ListenerEventSender,
    state: Arc<Mutex<ListenerState>>,
    enabled: Arc<AtomicBool>,
    stop: Arc<Notify>,
}

impl SuperviseCtx {
    fn set_state(&self, next: ListenerState) {
        *self.state.lock() = next;
    }

    fn emit(&self, event: ListenerEvent) {
        // Receiver gone means the monitor is shutting down.
        let _ = self.events.send(event);
    }

    async fn supervise(self) {
        let mut backoff = Backoff::new();

        while self.enabled.load(Ordering::SeqCst) {
            self.set_state(ListenerState::Starting);
            let outcome = match self.launch().await {
                Ok(child) => {
                    self.emit(ListenerEvent::Available);
                    self.set_state(ListenerState::Running);
                    self.watch_child(child, &mut backoff).await
                }
                Err(e) => RunOutcome::Exited(format!("{:#}", e)),
            };

            match outcome {
                RunOutcome::Stopped => {
                    self.emit(ListenerEvent::Unavailable {
                        reason: "stopped".to_string(),
                    });
                    break;
                }
                RunOutcome::Exited(reason) => {
                    warn!("Listener unavailable: {}", reason);
                    self.emit(ListenerEvent::Unavailable { reason });
                }
            }

            if !self.enabled.load(Ordering::SeqCst) {
                break;
            }
            let delay = backoff.next_delay();
            debug!("Restarting listener in {:?}", delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.stop.notified() => break,
            }
        }

        self.set_state(ListenerState::Idle);
    }

    async fn resolve_command(&self) -> Result<PathBuf> {
        let resolver = self.resolver.clone();
        let name = self.settings.command.clone();
        tokio::task::spawn_blocking(move || resolver.resolve(&name))
            .await
            .context("Binary resolution task failed")?
            .with_context(|| format!("{} not found on the login-shell PATH", self.settings.command))
    }

    async fn launch(&self) -> Result<Child> {
        let binary = self.resolve_command().await?;
        let shell = std::env::var_os("SHELL")
            .map(PathBuf::from)
            .filter(|p| p.is_absolute())
            .unwrap_or_else(|| PathBuf::from("/bin/sh"));

        let mut child = Command::new(&shell)
            .arg("-l")
            .arg("-c")
            .arg(r#"exec "$0" "$@""#)
            .arg(&binary)
            .args(&self.settings.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", binary.display()))?;

        info!(
            "Listener launched: {} (pid {:?})",
            binary.display(),
            child.id()
        );

        if let (Some(stdin), Some(warmup)) = (child.stdin.as_mut(), &self.settings.warmup_command) {
            let line = format!("{}\n", warmup);
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                debug!("Failed to write warm-up command: {}", e);
            }
            let _ = stdin.flush().await;
        }
        Ok(child)
    }

    fn handle_line(&self, line: &str, seen_output: &mut bool, backoff: &mut Backoff) {
        if !*seen_output {
            *seen_output = true;
            backoff.reset();
        }
        if let Some(status) = parse_status_line(line) {
            debug!("Listener status line: {:?}", status);
            self.emit(ListenerEvent::Status(status));
        }
    }

    async fn watch_child(&self, mut child: Child, backoff: &mut Backoff) -> RunOutcome {
        let mut stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
        let mut stderr = child.stderr.take().map(|s| BufReader::new(s).lines());
        let mut seen_output = false;

        loop {
            tokio::select! {
                line = next_line(&mut stdout) => match line {
                    Some(line) => self.handle_line(&line, &mut seen_output, backoff),
                    None => stdout = None,
                },
                line = next_line(&mut stderr) => match line {
                    Some(line) => self.handle_line(&line, &mut seen_output, backoff),
                    None => stderr = None,
                },
                status = child.wait() => {
                    return RunOutcome::Exited(match status {
                        Ok(status) => format!("listener exited: {}", status),
                        Err(e) => format!("listener wait failed: {}", e),
                    });
                }
                _ = self.stop.notified() => {
                    self.set_state(ListenerState::Stopping);
                    stop_child(&mut child).await;
                    return RunOutcome::Stopped;
                }
            }
        }
    }
}

/// Next line from an optional reader; pends forever once the stream closed
async fn next_line<R>(reader: &mut Option<tokio::io::Lines<R>>) -> Option<String>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    match reader {
        Some(lines) => match lines.next_line().await {
            Ok(Some(line)) => Some(line),
            Ok(None) | Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

/// Interrupt, then terminate, each with a grace delay; kill as last resort
async fn stop_child(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    for sig in [Signal::SIGINT, Signal::SIGTERM] {
        if let Err(e) = signal_group(pid, sig) {
            debug!("{:#}", e);
        }
        if tokio::time::timeout(STOP_GRACE, child.wait()).await.is_ok() {
            debug!("Listener stopped after {:?}", sig);
            return;
        }
    }
    warn!("Listener did not exit after SIGTERM, killing");
    let _ = child.kill().await;
}
