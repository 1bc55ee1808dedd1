//! Deletion of session logs written by probe runs.
//!
//! Every probe leaves a short session log behind in the CLI's log root. A
//! log is only deleted when two signals agree: it was recorded in the probe
//! working directory, and its only user input is the status command.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde_json::Value;
use tracing::{debug, info};
use walkdir::WalkDir;

use super::types::{CleanupError, CleanupOutcome};
use crate::config::{ProbeSettings, ScannerSettings};
use crate::tmux::process::path_within;

/// Probe logs are tiny; anything larger holds a real conversation
const MAX_ARTIFACT_BYTES: u64 = 1024 * 1024;

/// Injected context the CLI adds before the first real prompt
const PREAMBLE_MARKERS: &[&str] = &["<environment_context>", "<user_instructions>"];

/// What one log file says about its origin
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactSignals {
    /// Recorded working directory is the probe directory
    pub cwd_in_probe_dir: bool,
    /// At least one user message, all equal to the status command
    pub status_only_prompts: bool,
}

impl ArtifactSignals {
    fn count(&self) -> usize {
        usize::from(self.cwd_in_probe_dir) + usize::from(self.status_only_prompts)
    }
}

/// Text of a user message event, for both log dialects
fn user_message(event: &Value) -> Option<String> {
    let payload = event.get("payload");
    match event.get("type").and_then(Value::as_str)? {
        "response_item" => {
            let payload = payload?;
            if payload.get("type").and_then(Value::as_str) != Some("message")
                || payload.get("role").and_then(Value::as_str) != Some("user")
            {
                return None;
            }
            Some(content_text(payload.get("content")?))
        }
        "event_msg" => {
            let payload = payload?;
            if payload.get("type").and_then(Value::as_str) != Some("user_message") {
                return None;
            }
            payload
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
        }
        "user" => Some(content_text(event.get("message")?.get("content")?)),
        _ => None,
    }
}

fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn session_cwd(event: &Value) -> Option<&str> {
    if event.get("type").and_then(Value::as_str) == Some("session_meta") {
        return event
            .get("payload")
            .and_then(|p| p.get("cwd"))
            .and_then(Value::as_str);
    }
    event.get("cwd").and_then(Value::as_str)
}

fn is_preamble(text: &str) -> bool {
    PREAMBLE_MARKERS.iter().any(|m| text.starts_with(m))
}

/// Evaluate both signals over a whole log
pub fn inspect_log(content: &str, probe_dir: &Path, status_command: &str) -> ArtifactSignals {
    let mut cwd: Option<String> = None;
    let mut prompts = 0usize;
    let mut all_status = true;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(event) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if cwd.is_none() {
            cwd = session_cwd(&event).map(str::to_string);
        }
        if let Some(text) = user_message(&event) {
            let text = text.trim();
            if text.is_empty() || is_preamble(text) {
                continue;
            }
            prompts += 1;
            if text != status_command.trim() {
                all_status = false;
            }
        }
    }

    ArtifactSignals {
        cwd_in_probe_dir: cwd.is_some_and(|c| path_within(Path::new(&c), probe_dir)),
        status_only_prompts: prompts > 0 && all_status,
    }
}

/// Finds and deletes probe-originated session logs
#[derive(Debug, Clone)]
pub struct SessionLogCleaner {
    roots: Vec<PathBuf>,
    probe_dir: PathBuf,
    status_command: String,
    max_age: Duration,
}

/// Files sorted by the two-signal rule
#[derive(Debug, Default)]
pub struct ArtifactScan {
    /// Both signals present
    pub deletable: Vec<PathBuf>,
    /// Exactly one signal present
    pub unsafe_candidates: Vec<PathBuf>,
}

impl SessionLogCleaner {
    pub fn new(scanner: &ScannerSettings, probe: &ProbeSettings) -> Self {
        Self {
            roots: scanner.effective_roots(),
            probe_dir: probe.effective_workdir(),
            status_command: probe.status_command.clone(),
            max_age: Duration::from_secs(u64::from(scanner.max_age_days) * 24 * 60 * 60),
        }
    }

    /// Classify every recent log under the roots
    pub fn scan(&self) -> ArtifactScan {
        let mut scan = ArtifactScan::default();
        let now = SystemTime::now();

        for root in &self.roots {
            for entry in WalkDir::new(root)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
            {
                let path = entry.path();
                if !entry.file_type().is_file()
                    || path.extension().and_then(|e| e.to_str()) != Some("jsonl")
                {
                    continue;
                }
                let Ok(meta) = entry.metadata() else {
                    continue;
                };
                if meta.len() > MAX_ARTIFACT_BYTES {
                    continue;
                }
                let recent = meta
                    .modified()
                    .ok()
                    .and_then(|m| now.duration_since(m).ok())
                    .is_none_or(|age| age <= self.max_age);
                if !recent {
                    continue;
                }
                let Ok(content) = std::fs::read_to_string(path) else {
                    debug!("Skipping unreadable log {}", path.display());
                    continue;
                };

                let signals = inspect_log(&content, &self.probe_dir, &self.status_command);
                match signals.count() {
                    2 => scan.deletable.push(path.to_path_buf()),
                    1 => scan.unsafe_candidates.push(path.to_path_buf()),
                    _ => {}
                }
            }
        }
        scan
    }

    /// Delete every log carrying both signals. Stops at the first I/O error.
    pub fn cleanup(&self) -> Result<CleanupOutcome, CleanupError> {
        let scan = self.scan();
        if scan.deletable.is_empty() {
            if scan.unsafe_candidates.is_empty() {
                return Ok(CleanupOutcome::NotFound);
            }
            debug!(
                "Leaving {} log(s) with a single probe signal",
                scan.unsafe_candidates.len()
            );
            return Ok(CleanupOutcome::UnsafeSkipped {
                candidates: scan.unsafe_candidates.len(),
            });
        }

        let deleted = delete_all(scan.deletable)?;
        info!("Deleted {} probe session log(s)", deleted);
        Ok(CleanupOutcome::Deleted { count: deleted })
    }
}

/// Remove paths in order; the error reports how many went before the failure.
fn delete_all(paths: Vec<PathBuf>) -> Result<usize, CleanupError> {
    let mut deleted = 0;
    for path in paths {
        if let Err(source) = std::fs::remove_file(&path) {
            return Err(CleanupError {
                deleted,
                path,
                source,
            });
        }
        debug!("Deleted probe session log {}", path.display());
        deleted += 1;
    }
    Ok(deleted)
}
