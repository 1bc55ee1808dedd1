//! Single-flight runner for the active status probe.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rand::RngExt;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::envelope::parse_envelope;
use super::script::{materialize, runtime_dir, OWNER_ENV, OWNER_VALUE};
use super::types::{ProbeDiagnostics, ProbeOutcome};
use crate::binaries::BinaryResolver;
use crate::config::ProbeSettings;
use crate::tmux::process::terminate_escalating;
use crate::tmux::{validate_label, TmuxClient};

/// How often the cancel flag is checked while the script runs
const CANCEL_POLL: Duration = Duration::from_millis(100);
/// Grace between termination signals
const KILL_GRACE: Duration = Duration::from_millis(500);
/// Time allowed for output pipes to drain after the script ends
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Random socket label: `<prefix>-<8 hex digits>`
pub fn generate_label(prefix: &str) -> String {
    let mut rng = rand::rng();
    format!("{}-{:08x}", prefix, rng.random_range(0..u32::MAX))
}

/// Clears the in-flight flag when the run ends, however it ends
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Removes a label from the active set when the run ends
struct LabelGuard<'a> {
    labels: &'a Mutex<HashSet<String>>,
    label: String,
}

impl Drop for LabelGuard<'_> {
    fn drop(&mut self) {
        self.labels.lock().remove(&self.label);
    }
}

/// How the wait for the script ended
enum Waited {
    Exited(std::process::ExitStatus),
    Aborted(ProbeOutcome),
}

async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let Some(mut pipe) = pipe else {
        return String::new();
    };
    let mut buf = Vec::new();
    let _ = pipe.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

/// Runs at most one probe at a time
pub struct ProbeOrchestrator {
    settings: RwLock<ProbeSettings>,
    resolver: Arc<dyn BinaryResolver>,
    running: AtomicBool,
    cancel: AtomicBool,
    active_labels: Mutex<HashSet<String>>,
    runtime_dir: PathBuf,
    script_override: Option<PathBuf>,
}

impl ProbeOrchestrator {
    pub fn new(settings: ProbeSettings, resolver: Arc<dyn BinaryResolver>) -> Self {
        Self {
            settings: RwLock::new(settings),
            resolver,
            running: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
            active_labels: Mutex::new(HashSet::new()),
            runtime_dir: runtime_dir(),
            script_override: None,
        }
    }

    /// Directory the probe script is written to
    pub fn with_runtime_dir(mut self, dir: PathBuf) -> Self {
        self.runtime_dir = dir;
        self
    }

    /// Run `script` instead of the bundled one
    pub fn with_script(mut self, script: PathBuf) -> Self {
        self.script_override = Some(script);
        self
    }

    pub fn settings(&self) -> ProbeSettings {
        self.settings.read().clone()
    }

    /// Takes effect from the next probe
    pub fn update_settings(&self, settings: ProbeSettings) {
        *self.settings.write() = settings;
    }

    pub fn resolver(&self) -> Arc<dyn BinaryResolver> {
        Arc::clone(&self.resolver)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask the in-flight probe to stop. No effect when idle.
    pub fn cancel(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        self.cancel.store(true, Ordering::SeqCst);
        true
    }

    /// Socket labels of probes currently in flight
    pub fn active_labels(&self) -> HashSet<String> {
        self.active_labels.lock().clone()
    }

    /// Run one probe. A second concurrent call returns `AlreadyRunning`
    /// without launching anything.
    pub async fn run(&self, manual: bool) -> ProbeDiagnostics {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Probe requested while another is in flight");
            return ProbeDiagnostics::not_launched(
                ProbeOutcome::AlreadyRunning,
                manual,
                "a probe is already running",
            );
        }
        let _flight = FlightGuard(&self.running);
        self.cancel.store(false, Ordering::SeqCst);

        let started = Instant::now();
        let mut diag = self.run_inner(manual).await;
        diag.elapsed_ms = started.elapsed().as_millis() as u64;

        match diag.outcome {
            ProbeOutcome::Completed => info!("Probe completed in {} ms", diag.elapsed_ms),
            outcome => warn!(
                "Probe ended {:?} after {} ms: {}",
                outcome,
                diag.elapsed_ms,
                diag.error.as_deref().unwrap_or("")
            ),
        }
        diag
    }

    async fn run_inner(&self, manual: bool) -> ProbeDiagnostics {
        let settings = self.settings();

        let resolver = Arc::clone(&self.resolver);
        let (cli_name, tmux_name) = (settings.cli.clone(), settings.tmux.clone());
        let resolved = tokio::task::spawn_blocking(move || {
            (resolver.resolve(&cli_name), resolver.resolve(&tmux_name))
        })
        .await;
        let (cli, tmux) = match resolved {
            Ok((Some(cli), Some(tmux))) => (cli, tmux),
            Ok((cli, tmux)) => {
                let mut diag = ProbeDiagnostics::not_launched(
                    ProbeOutcome::BinaryMissing,
                    manual,
                    match (&cli, &tmux) {
                        (None, _) => format!("{} not found", settings.cli),
                        _ => format!("{} not found", settings.tmux),
                    },
                );
                diag.cli_path = cli;
                diag.tmux_path = tmux;
                return diag;
            }
            Err(e) => {
                return ProbeDiagnostics::not_launched(
                    ProbeOutcome::BinaryMissing,
                    manual,
                    format!("binary lookup failed: {}", e),
                )
            }
        };

        let label = generate_label(&settings.label_prefix);
        if let Err(e) = validate_label(&label) {
            return ProbeDiagnostics::not_launched(ProbeOutcome::SpawnFailure, manual, e.to_string());
        }

        let script = match &self.script_override {
            Some(path) => Ok(path.clone()),
            None => materialize(&self.runtime_dir),
        };

        let mut diag = ProbeDiagnostics::not_launched(ProbeOutcome::SpawnFailure, manual, "");
        diag.cli_path = Some(cli.clone());
        diag.tmux_path = Some(tmux.clone());
        diag.label = Some(label.clone());
        diag.error = None;

        let script = match script {
            Ok(path) => path,
            Err(e) => {
                diag.error = Some(format!("{:#}", e));
                return diag;
            }
        };
        diag.script_path = Some(script.clone());

        let workdir = settings.effective_workdir();
        if let Err(e) = std::fs::create_dir_all(&workdir) {
            diag.error = Some(format!("cannot create {}: {}", workdir.display(), e));
            return diag;
        }

        self.active_labels.lock().insert(label.clone());
        let _label_guard = LabelGuard {
            labels: &self.active_labels,
            label: label.clone(),
        };

        let mut child = match Command::new("bash")
            .arg(&script)
            .current_dir(&workdir)
            .env("CAPWATCH_CLI", &cli)
            .env("CAPWATCH_TMUX", &tmux)
            .env("CAPWATCH_PROBE_LABEL", &label)
            .env("CAPWATCH_PROBE_WORKDIR", &workdir)
            .env("CAPWATCH_PROBE_TIMEOUT", settings.timeout_secs.to_string())
            .env("CAPWATCH_STATUS_COMMAND", &settings.status_command)
            .env(OWNER_ENV, OWNER_VALUE)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                diag.error = Some(format!("failed to spawn probe script: {}", e));
                return diag;
            }
        };
        let pid = child.id();
        debug!("Probe script started (pid {:?}, label {})", pid, label);

        let stdout_task = tokio::spawn(drain(child.stdout.take()));
        let stderr_task = tokio::spawn(drain(child.stderr.take()));

        let deadline = tokio::time::sleep(settings.hard_ceiling());
        tokio::pin!(deadline);
        let mut tick = tokio::time::interval(CANCEL_POLL);
        let waited = loop {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => break Waited::Exited(status),
                    Err(e) => {
                        warn!("Waiting on probe script failed: {}", e);
                        break Waited::Aborted(ProbeOutcome::ExitFailure);
                    }
                },
                _ = &mut deadline => break Waited::Aborted(ProbeOutcome::TimedOut),
                _ = tick.tick() => {
                    if self.cancel.load(Ordering::SeqCst) {
                        break Waited::Aborted(ProbeOutcome::Cancelled);
                    }
                }
            }
        };

        if let Waited::Aborted(outcome) = &waited {
            if let Some(pid) = pid {
                terminate_escalating(pid, true, KILL_GRACE, 1).await;
            }
            let _ = child.start_kill();
            let _ = child.wait().await;
            let tmux_bin = tmux.clone();
            let server_label = label.clone();
            let killed = tokio::task::spawn_blocking(move || {
                TmuxClient::isolated(tmux_bin, &server_label).and_then(|c| c.kill_server())
            })
            .await;
            if let Ok(Err(e)) = killed {
                debug!("kill-server after {:?}: {:#}", outcome, e);
            }
        }

        diag.stdout = tokio::time::timeout(DRAIN_TIMEOUT, stdout_task)
            .await
            .ok()
            .and_then(|r| r.ok())
            .unwrap_or_default();
        diag.stderr = tokio::time::timeout(DRAIN_TIMEOUT, stderr_task)
            .await
            .ok()
            .and_then(|r| r.ok())
            .unwrap_or_default();

        match waited {
            Waited::Aborted(outcome) => {
                diag.outcome = outcome;
                diag.error = Some(match outcome {
                    ProbeOutcome::TimedOut => format!(
                        "probe exceeded {} s and was terminated",
                        settings.hard_ceiling().as_secs()
                    ),
                    ProbeOutcome::Cancelled => "probe cancelled".to_string(),
                    _ => "probe script could not be awaited".to_string(),
                });
            }
            Waited::Exited(status) => {
                diag.exit_code = status.code();
                let parsed = parse_envelope(&diag.stdout);
                if status.success() {
                    match parsed {
                        Ok(reading) => {
                            diag.success = true;
                            diag.outcome = ProbeOutcome::Completed;
                            diag.reading = Some(reading);
                        }
                        Err(reason) => {
                            diag.outcome = ProbeOutcome::ParseFailure;
                            diag.error = Some(reason);
                        }
                    }
                } else {
                    diag.outcome = ProbeOutcome::ExitFailure;
                    diag.error = Some(match parsed {
                        Err(reason) if diag.stdout.trim_start().starts_with('{') => reason,
                        _ => format!("probe script exited with {}", status),
                    });
                }
            }
        }
        diag
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binaries::StaticResolver;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn resolver() -> Arc<dyn BinaryResolver> {
        Arc::new(
            StaticResolver::new()
                .with("codex", "/bin/true")
                .with("tmux", "/bin/true"),
        )
    }

    fn fake_script(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("probe.sh");
        std::fs::write(&path, format!("#!/usr/bin/env bash\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700)).unwrap();
        path
    }

    fn orchestrator(dir: &TempDir, body: &str) -> ProbeOrchestrator {
        let settings = ProbeSettings {
            workdir: Some(dir.path().join("work")),
            ..Default::default()
        };
        ProbeOrchestrator::new(settings, resolver())
            .with_runtime_dir(dir.path().join("rt"))
            .with_script(fake_script(dir, body))
    }

    #[test]
    fn test_generate_label() {
        let label = generate_label("capwatch-probe");
        assert!(label.starts_with("capwatch-probe-"));
        assert_eq!(label.len(), "capwatch-probe-".len() + 8);
        assert!(validate_label(&label).is_ok());
    }

    #[tokio::test]
    async fn test_completed_probe() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(
            &dir,
            r#"[ "$CAPWATCH_PROBE_OWNER" = capwatch ] || exit 9
echo '{"ok":true,"five_hour":{"pct_left":50,"resets":"14:05"},"weekly":{"pct_left":80}}'"#,
        );
        let diag = orch.run(true).await;
        assert_eq!(diag.outcome, ProbeOutcome::Completed);
        assert!(diag.success);
        assert!(diag.manual);
        assert_eq!(diag.exit_code, Some(0));
        let reading = diag.reading.unwrap();
        assert_eq!(reading.five_hour.remaining_percent, Some(50));
        assert_eq!(reading.weekly.remaining_percent, Some(80));
        assert!(diag.label.unwrap().starts_with("capwatch-probe-"));
        assert!(!orch.is_running());
        assert!(orch.active_labels().is_empty());
    }

    #[tokio::test]
    async fn test_exit_failure_carries_envelope_error() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(
            &dir,
            r#"echo '{"ok":false,"error":"cli did not become ready"}'; exit 2"#,
        );
        let diag = orch.run(false).await;
        assert_eq!(diag.outcome, ProbeOutcome::ExitFailure);
        assert_eq!(diag.exit_code, Some(2));
        assert_eq!(diag.error.as_deref(), Some("cli did not become ready"));
        assert!(diag.reading.is_none());
    }

    #[tokio::test]
    async fn test_parse_failure() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir, "echo hello");
        let diag = orch.run(false).await;
        assert_eq!(diag.outcome, ProbeOutcome::ParseFailure);
        assert!(!diag.success);
        assert_eq!(diag.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_binary_missing() {
        let dir = TempDir::new().unwrap();
        let orch = ProbeOrchestrator::new(ProbeSettings::default(), Arc::new(StaticResolver::new()))
            .with_runtime_dir(dir.path().to_path_buf());
        let diag = orch.run(true).await;
        assert_eq!(diag.outcome, ProbeOutcome::BinaryMissing);
        assert_eq!(diag.error.as_deref(), Some("codex not found"));
        assert!(!orch.is_running());
    }

    #[tokio::test]
    async fn test_single_flight() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir, "echo '{}'");
        orch.running.store(true, Ordering::SeqCst);
        let diag = orch.run(true).await;
        assert_eq!(diag.outcome, ProbeOutcome::AlreadyRunning);
        assert!(diag.outcome.is_skip());
        // The rejected call must not clear the flag of the real run.
        assert!(orch.is_running());
    }

    #[tokio::test]
    async fn test_cancel_terminates_script() {
        let dir = TempDir::new().unwrap();
        let orch = Arc::new(orchestrator(&dir, "sleep 30"));
        assert!(!orch.cancel());

        let runner = Arc::clone(&orch);
        let handle = tokio::spawn(async move { runner.run(true).await });
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(orch.is_running());
        assert_eq!(orch.active_labels().len(), 1);
        assert!(orch.cancel());

        let diag = handle.await.unwrap();
        assert_eq!(diag.outcome, ProbeOutcome::Cancelled);
        assert!(diag.outcome.may_leave_orphans());
        assert!(diag.elapsed_ms < 10_000);
        assert!(!orch.is_running());
        assert!(orch.active_labels().is_empty());
    }
}
