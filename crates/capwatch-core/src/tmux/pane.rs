use std::path::PathBuf;

/// Information about a tmux pane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneInfo {
    /// Session name
    pub session: String,
    /// Process ID of the pane's shell
    pub pid: u32,
    /// Current working directory
    pub cwd: PathBuf,
}

impl PaneInfo {
    /// Parse a pane info line from tmux list-panes output
    /// Format: session\tpid\tcwd
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.splitn(3, '\t');
        let session = parts.next()?.trim();
        let pid = parts.next()?.trim().parse().ok()?;
        let cwd = parts.next().unwrap_or("").trim();
        if session.is_empty() {
            return None;
        }
        Some(Self {
            session: session.to_string(),
            pid,
            cwd: PathBuf::from(cwd),
        })
    }
}
