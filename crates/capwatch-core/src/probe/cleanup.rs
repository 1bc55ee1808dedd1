//! Orphan sweep for abandoned probe processes and isolated tmux servers.
//!
//! A process is only terminated when at least two independent signals agree
//! that it belongs to a probe. Command-line matching merely nominates
//! candidates; it never counts as a signal.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::script::{OWNER_ENV, OWNER_VALUE, SCRIPT_NAME};
use super::types::{OrphanCandidate, OrphanEvidence, OrphanSweepReport};
use crate::config::ProbeSettings;
use crate::tmux::process::{is_alive, path_within, process_group, terminate_escalating};
use crate::tmux::{
    label_from_cmdline, label_from_tmux_env, list_socket_labels, socket_dir, ProcessInspector,
    TmuxClient,
};

const GRACE: Duration = Duration::from_millis(500);
const TERM_RETRIES: u32 = 2;

/// What a sweep intends to do, computed without side effects
#[derive(Debug, Default)]
pub struct SweepPlan {
    /// Processes mentioning the CLI
    pub examined: usize,
    /// Candidates with two or more signals
    pub actionable: Vec<OrphanCandidate>,
    /// Candidates lacking corroboration
    pub skipped: Vec<OrphanCandidate>,
    /// Isolated servers matching both name prefix and purpose tag
    pub servers: Vec<String>,
}

/// Finds and removes probe leftovers
#[derive(Clone)]
pub struct OrphanSweeper {
    inspector: Arc<ProcessInspector>,
    tmux: PathBuf,
    cli_name: String,
    probe_dir: PathBuf,
    label_prefix: String,
    socket_dir: PathBuf,
    self_pid: u32,
}

impl OrphanSweeper {
    pub fn new(settings: &ProbeSettings, tmux: PathBuf) -> Self {
        let cli_name = Path::new(&settings.cli)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&settings.cli)
            .to_string();
        Self {
            inspector: Arc::new(ProcessInspector::new()),
            tmux,
            cli_name,
            probe_dir: settings.effective_workdir(),
            label_prefix: settings.label_prefix.clone(),
            socket_dir: socket_dir(),
            self_pid: std::process::id(),
        }
    }

    /// Use another procfs tree
    pub fn with_inspector(mut self, inspector: ProcessInspector) -> Self {
        self.inspector = Arc::new(inspector);
        self
    }

    /// Use another tmux socket directory
    pub fn with_socket_dir(mut self, dir: PathBuf) -> Self {
        self.socket_dir = dir;
        self
    }

    fn purpose_tag(&self, label: &str) -> bool {
        match TmuxClient::isolated(&self.tmux, label).and_then(|c| c.has_probe_purpose()) {
            Ok(tagged) => tagged,
            Err(e) => {
                debug!("Purpose tag lookup on {} failed: {:#}", label, e);
                false
            }
        }
    }

    /// Collect the independent signals for one process
    pub fn evidence(&self, pid: u32) -> (OrphanEvidence, Option<String>) {
        let env_marker = self.inspector.env_var(pid, OWNER_ENV).as_deref() == Some(OWNER_VALUE);
        let cwd_in_probe_dir = self
            .inspector
            .cwd(pid)
            .is_some_and(|cwd| path_within(&cwd, &self.probe_dir));
        // Panes carry $TMUX; the server itself only has its -L/-S argument.
        let label = self
            .inspector
            .env_var(pid, "TMUX")
            .and_then(|v| label_from_tmux_env(&v))
            .or_else(|| {
                self.inspector
                    .cmdline(pid)
                    .and_then(|c| label_from_cmdline(&c))
            });
        let tmux_purpose_tag = label.as_deref().is_some_and(|l| self.purpose_tag(l));

        (
            OrphanEvidence {
                env_marker,
                cwd_in_probe_dir,
                tmux_purpose_tag,
            },
            label,
        )
    }

    fn mentions_cli(&self, cmdline: &str) -> bool {
        !self.cli_name.is_empty() && cmdline.contains(&self.cli_name)
    }

    /// Decide what to remove. Blocking: reads `/proc` and queries tmux.
    pub fn plan(&self, active_labels: &HashSet<String>) -> SweepPlan {
        let mut plan = SweepPlan::default();

        for pid in self.inspector.pids() {
            if pid == self.self_pid {
                continue;
            }
            let Some(cmdline) = self.inspector.cmdline(pid) else {
                continue;
            };
            if !self.mentions_cli(&cmdline) || cmdline.contains(SCRIPT_NAME) {
                continue;
            }
            plan.examined += 1;

            let (evidence, label) = self.evidence(pid);
            if label.as_ref().is_some_and(|l| active_labels.contains(l)) {
                continue;
            }
            let candidate = OrphanCandidate {
                pid,
                cmdline,
                evidence,
                label,
            };
            if evidence.is_actionable() {
                plan.actionable.push(candidate);
            } else if evidence.count() > 0 {
                plan.skipped.push(candidate);
            }
        }

        for label in list_socket_labels(&self.socket_dir, &self.label_prefix) {
            if active_labels.contains(&label) {
                continue;
            }
            if self.purpose_tag(&label) {
                plan.servers.push(label);
            }
        }
        self.inspector.cleanup();
        plan
    }

    /// Run a full sweep: plan off the async runtime, then terminate.
    pub async fn sweep(&self, active_labels: &HashSet<String>) -> OrphanSweepReport {
        let planner = self.clone();
        let active = active_labels.clone();
        let plan = match tokio::task::spawn_blocking(move || planner.plan(&active)).await {
            Ok(plan) => plan,
            Err(e) => {
                return OrphanSweepReport {
                    errors: vec![format!("sweep planning failed: {}", e)],
                    ..Default::default()
                }
            }
        };
        self.execute(plan).await
    }

    async fn execute(&self, plan: SweepPlan) -> OrphanSweepReport {
        let mut report = OrphanSweepReport {
            examined: plan.examined,
            skipped: plan.skipped,
            ..Default::default()
        };

        let mut labels: Vec<String> = plan.servers;
        for candidate in &plan.actionable {
            if let Some(label) = &candidate.label {
                if !labels.contains(label) {
                    labels.push(label.clone());
                }
            }
        }
        for label in labels {
            match self.kill_isolated_server(&label).await {
                Ok(()) => report.servers_killed.push(label),
                Err(e) => report.errors.push(format!("{}: {:#}", label, e)),
            }
        }

        for candidate in &plan.actionable {
            if !is_alive(candidate.pid) {
                if candidate.label.is_some() {
                    report.terminated.push(candidate.pid);
                }
                continue;
            }
            info!(
                "Terminating orphaned probe process {} ({:?})",
                candidate.pid, candidate.evidence
            );
            match terminate_escalating(candidate.pid, false, GRACE, TERM_RETRIES).await {
                crate::tmux::Termination::Failed => {
                    report
                        .errors
                        .push(format!("pid {} survived SIGKILL", candidate.pid));
                }
                _ => report.terminated.push(candidate.pid),
            }
        }

        if report.acted() {
            info!(
                "Orphan sweep: {} process(es), {} server(s)",
                report.terminated.len(),
                report.servers_killed.len()
            );
        }
        report
    }

    /// Terminate every pane's process group, then the sessions and server
    async fn kill_isolated_server(&self, label: &str) -> anyhow::Result<()> {
        let client = TmuxClient::isolated(&self.tmux, label)?;
        let lister = client.clone();
        let panes = tokio::task::spawn_blocking(move || lister.list_panes()).await??;

        for pane in &panes {
            if let Some(pgid) = process_group(pane.pid) {
                terminate_escalating(pgid, true, GRACE, TERM_RETRIES).await;
            }
        }

        tokio::task::spawn_blocking(move || {
            for pane in &panes {
                if let Err(e) = client.kill_session(&pane.session) {
                    debug!("kill-session {}: {:#}", pane.session, e);
                }
            }
            if let Err(e) = client.kill_server() {
                warn!("kill-server {}: {:#}", client.label(), e);
            }
        })
        .await?;
        Ok(())
    }
}
