use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use super::pane::PaneInfo;

/// Session option carrying the declared purpose of a probe session
pub const PURPOSE_OPTION: &str = "@capwatch_purpose";
/// Value of [`PURPOSE_OPTION`] on probe sessions
pub const PURPOSE_STATUS_PROBE: &str = "status-probe";

/// Socket labels and session names: no separators, no shell metacharacters
static LABEL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("Invalid LABEL_PATTERN regex"));

/// Validate a socket label or session name to prevent argument injection
pub fn validate_label(label: &str) -> Result<()> {
    if !LABEL_PATTERN.is_match(label) {
        anyhow::bail!("Invalid tmux label: {}", label);
    }
    Ok(())
}

/// Directory tmux keeps its sockets in for the current user
pub fn socket_dir() -> PathBuf {
    let base = std::env::var_os("TMUX_TMPDIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    let uid = unsafe { libc::getuid() };
    base.join(format!("tmux-{}", uid))
}

/// Socket labels in `dir` whose name starts with `prefix`
pub fn list_socket_labels(dir: &Path, prefix: &str) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut labels: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| name.starts_with(prefix) && validate_label(name).is_ok())
        .collect();
    labels.sort();
    labels
}

/// Socket label from a `$TMUX` value (`/tmp/tmux-1000/label,1234,0`)
pub fn label_from_tmux_env(value: &str) -> Option<String> {
    let socket = value.split(',').next()?;
    let name = Path::new(socket).file_name()?.to_str()?;
    validate_label(name).ok()?;
    Some(name.to_string())
}

/// Socket label from a tmux command line (`-L <label>`, `-S <path>`)
pub fn label_from_cmdline(cmdline: &str) -> Option<String> {
    let mut args = cmdline.split_whitespace();
    while let Some(arg) = args.next() {
        let socket = match arg {
            "-L" | "-S" => args.next()?,
            _ => match arg.strip_prefix("-L").or_else(|| arg.strip_prefix("-S")) {
                Some(inline) if !inline.is_empty() => inline,
                _ => continue,
            },
        };
        let name = Path::new(socket).file_name()?.to_str()?;
        return validate_label(name).ok().map(|_| name.to_string());
    }
    None
}

/// Client for one isolated tmux server (`tmux -L <label>`)
#[derive(Debug, Clone)]
pub struct TmuxClient {
    binary: PathBuf,
    label: String,
}

impl TmuxClient {
    /// Create a client for the server behind socket `label`
    pub fn isolated(binary: impl Into<PathBuf>, label: &str) -> Result<Self> {
        validate_label(label)?;
        Ok(Self {
            binary: binary.into(),
            label: label.to_string(),
        })
    }

    /// Socket label
    pub fn label(&self) -> &str {
        &self.label
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new(&self.binary)
            .arg("-L")
            .arg(&self.label)
            .args(args)
            .output()
            .with_context(|| format!("Failed to execute tmux {}", args.first().unwrap_or(&"")))
    }

    fn run_checked(&self, args: &[&str]) -> Result<String> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "tmux {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Lists session names
    pub fn list_sessions(&self) -> Result<Vec<String>> {
        let stdout = self.run_checked(&["list-sessions", "-F", "#{session_name}"])?;
        Ok(stdout.lines().map(|s| s.to_string()).collect())
    }

    /// Lists all panes of the server
    pub fn list_panes(&self) -> Result<Vec<PaneInfo>> {
        let stdout = self.run_checked(&[
            "list-panes",
            "-a",
            "-F",
            "#{session_name}\t#{pane_pid}\t#{pane_current_path}",
        ])?;
        Ok(stdout.lines().filter_map(PaneInfo::parse).collect())
    }

    /// Value of a session option, `None` when unset
    pub fn show_option(&self, session: &str, option: &str) -> Result<Option<String>> {
        validate_label(session)?;
        let stdout = self.run_checked(&["show-options", "-qv", "-t", session, option])?;
        let value = stdout.trim();
        Ok((!value.is_empty()).then(|| value.to_string()))
    }

    /// True when any session on this server declares the probe purpose
    pub fn has_probe_purpose(&self) -> Result<bool> {
        for session in self.list_sessions()? {
            if validate_label(&session).is_err() {
                continue;
            }
            if self.show_option(&session, PURPOSE_OPTION)?.as_deref() == Some(PURPOSE_STATUS_PROBE)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Kill one session
    pub fn kill_session(&self, session: &str) -> Result<()> {
        validate_label(session)?;
        self.run_checked(&["kill-session", "-t", session])?;
        Ok(())
    }

    /// Kill the whole isolated server
    pub fn kill_server(&self) -> Result<()> {
        self.run_checked(&["kill-server"])?;
        Ok(())
    }
}
