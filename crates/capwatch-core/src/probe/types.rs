use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::usage::QuotaReading;

/// How a probe attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeOutcome {
    /// Script exited cleanly and its envelope parsed with `ok`
    Completed,
    /// Another probe was in flight; nothing was launched
    AlreadyRunning,
    /// CLI or tmux could not be resolved
    BinaryMissing,
    /// Deadline exceeded; the script was terminated
    TimedOut,
    /// Cancelled through the status flag
    Cancelled,
    /// Script exited non-zero
    ExitFailure,
    /// Script exited cleanly but stdout was not a usable envelope
    ParseFailure,
    /// The script could not be written or spawned
    SpawnFailure,
}

impl ProbeOutcome {
    /// Policy rejection rather than a failure
    pub fn is_skip(&self) -> bool {
        matches!(self, ProbeOutcome::AlreadyRunning)
    }

    /// Whether leftovers may exist and an orphan sweep is worthwhile
    pub fn may_leave_orphans(&self) -> bool {
        matches!(
            self,
            ProbeOutcome::TimedOut
                | ProbeOutcome::Cancelled
                | ProbeOutcome::ExitFailure
                | ProbeOutcome::ParseFailure
        )
    }
}

/// Result of one probe attempt, returned to the caller that asked for it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeDiagnostics {
    /// Probe produced a usable reading
    pub success: bool,
    /// Classified outcome
    pub outcome: ProbeOutcome,
    /// Script exit code, when it exited normally
    pub exit_code: Option<i32>,
    /// Script materialized on disk
    pub script_path: Option<PathBuf>,
    /// Resolved CLI binary
    pub cli_path: Option<PathBuf>,
    /// Resolved tmux binary
    pub tmux_path: Option<PathBuf>,
    /// Isolated socket label used
    pub label: Option<String>,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
    /// Wall-clock duration
    pub elapsed_ms: u64,
    /// Parsed reading on success
    pub reading: Option<QuotaReading>,
    /// Why the attempt failed or was skipped
    pub error: Option<String>,
    /// Requested by the user rather than the poll loop
    pub manual: bool,
}

impl ProbeDiagnostics {
    /// Diagnostics for an attempt that never launched
    pub fn not_launched(outcome: ProbeOutcome, manual: bool, detail: impl Into<String>) -> Self {
        Self {
            success: false,
            outcome,
            exit_code: None,
            script_path: None,
            cli_path: None,
            tmux_path: None,
            label: None,
            stdout: String::new(),
            stderr: String::new(),
            elapsed_ms: 0,
            reading: None,
            error: Some(detail.into()),
            manual,
        }
    }
}

/// Signals that a running process is an abandoned probe
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OrphanEvidence {
    /// Environment names this application as the owner
    pub env_marker: bool,
    /// Working directory is the dedicated probe directory
    pub cwd_in_probe_dir: bool,
    /// Runs inside a tmux session whose purpose tag marks it as a probe
    pub tmux_purpose_tag: bool,
}

impl OrphanEvidence {
    /// Number of independent signals present
    pub fn count(&self) -> usize {
        [self.env_marker, self.cwd_in_probe_dir, self.tmux_purpose_tag]
            .iter()
            .filter(|s| **s)
            .count()
    }

    /// Two or more corroborating signals
    pub fn is_actionable(&self) -> bool {
        self.count() >= 2
    }
}

/// One process considered by the orphan sweep
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanCandidate {
    pub pid: u32,
    pub cmdline: String,
    pub evidence: OrphanEvidence,
    /// Isolated socket label, when the process runs under one
    pub label: Option<String>,
}

/// Result of one orphan sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrphanSweepReport {
    /// Processes mentioning the CLI that were examined
    pub examined: usize,
    /// Processes terminated
    pub terminated: Vec<u32>,
    /// Candidates left alone for lack of corroboration
    pub skipped: Vec<OrphanCandidate>,
    /// Isolated tmux servers killed
    pub servers_killed: Vec<String>,
    /// Non-fatal problems met along the way
    pub errors: Vec<String>,
}

impl OrphanSweepReport {
    /// True when the sweep changed anything
    pub fn acted(&self) -> bool {
        !self.terminated.is_empty() || !self.servers_killed.is_empty()
    }
}

/// Result of a probe session-log cleanup
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CleanupOutcome {
    /// Probe-originated logs were deleted
    Deleted { count: usize },
    /// Nothing probe-shaped was found
    NotFound,
    /// Candidates existed but lacked a second safety signal
    UnsafeSkipped { candidates: usize },
    /// Cleanup is not enabled
    Disabled,
}

/// I/O failure during deletion; the call stops at the first failure
#[derive(Debug, Error)]
#[error("cleanup failed after deleting {deleted} file(s) at {path}: {source}")]
pub struct CleanupError {
    /// Files already deleted before the failure
    pub deleted: usize,
    /// File whose deletion failed
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_signal_is_not_actionable() {
        let evidence = OrphanEvidence {
            env_marker: true,
            ..Default::default()
        };
        assert_eq!(evidence.count(), 1);
        assert!(!evidence.is_actionable());

        let evidence = OrphanEvidence {
            env_marker: true,
            tmux_purpose_tag: true,
            ..Default::default()
        };
        assert!(evidence.is_actionable());
    }

    #[test]
    fn test_outcome_classification() {
        assert!(ProbeOutcome::AlreadyRunning.is_skip());
        assert!(!ProbeOutcome::AlreadyRunning.may_leave_orphans());
        assert!(ProbeOutcome::TimedOut.may_leave_orphans());
        assert!(!ProbeOutcome::Completed.may_leave_orphans());
    }

    #[test]
    fn test_cleanup_error_message() {
        let err = CleanupError {
            deleted: 3,
            path: PathBuf::from("/tmp/x.jsonl"),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        let message = err.to_string();
        assert!(message.contains("after deleting 3"));
        assert!(message.contains("/tmp/x.jsonl"));
    }

    #[test]
    fn test_cleanup_outcome_serializes_tagged() {
        let json = serde_json::to_value(CleanupOutcome::Deleted { count: 2 }).unwrap();
        assert_eq!(json, serde_json::json!({"status": "deleted", "count": 2}));
    }
}
