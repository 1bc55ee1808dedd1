use anyhow::{Context, Result};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

/// Cached process information
#[derive(Debug, Clone)]
struct CachedCmdline {
    cmdline: String,
    last_update: Instant,
}

/// Reads process details from a procfs tree, caching command lines
pub struct ProcessInspector {
    root: PathBuf,
    cache: RwLock<HashMap<u32, CachedCmdline>>,
    ttl: Duration,
}

impl ProcessInspector {
    /// Inspector over the real `/proc` with a 5 second cache
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Inspector over an alternative procfs-shaped tree
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: RwLock::new(HashMap::new()),
            ttl: Duration::from_secs(5),
        }
    }

    fn pid_dir(&self, pid: u32) -> PathBuf {
        self.root.join(pid.to_string())
    }

    /// All numeric process directories
    pub fn pids(&self) -> Vec<u32> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut pids: Vec<u32> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse().ok()))
            .collect();
        pids.sort_unstable();
        pids
    }

    /// Command line with NULs replaced by spaces, using the cache if fresh
    pub fn cmdline(&self, pid: u32) -> Option<String> {
        {
            let cache = self.cache.read();
            if let Some(info) = cache.get(&pid) {
                if info.last_update.elapsed() < self.ttl {
                    return Some(info.cmdline.clone());
                }
            }
        }

        let raw = std::fs::read(self.pid_dir(pid).join("cmdline")).ok()?;
        let cmdline = String::from_utf8_lossy(&raw)
            .replace('\0', " ")
            .trim()
            .to_string();
        if cmdline.is_empty() {
            return None;
        }

        self.cache.write().insert(
            pid,
            CachedCmdline {
                cmdline: cmdline.clone(),
                last_update: Instant::now(),
            },
        );
        Some(cmdline)
    }

    /// Read one environment variable of a process.
    ///
    /// Returns None on any error (permission denied, process gone, etc.)
    pub fn env_var(&self, pid: u32, name: &str) -> Option<String> {
        let content = std::fs::read(self.pid_dir(pid).join("environ")).ok()?;
        let prefix = format!("{}=", name);
        content
            .split(|&b| b == 0)
            .filter_map(|entry| std::str::from_utf8(entry).ok())
            .find_map(|entry| entry.strip_prefix(&prefix).map(|v| v.to_string()))
    }

    /// Working directory of a process
    pub fn cwd(&self, pid: u32) -> Option<PathBuf> {
        std::fs::read_link(self.pid_dir(pid).join("cwd")).ok()
    }

    /// Drop expired cache entries
    pub fn cleanup(&self) {
        self.cache
            .write()
            .retain(|_, info| info.last_update.elapsed() < self.ttl);
    }
}

impl Default for ProcessInspector {
    fn default() -> Self {
        Self::new()
    }
}

/// True when `child` equals `dir` or lies beneath it
pub fn path_within(child: &Path, dir: &Path) -> bool {
    let canon = |p: &Path| std::fs::canonicalize(p).unwrap_or_else(|_| p.to_path_buf());
    canon(child).starts_with(canon(dir))
}

/// Process group of a live process
pub fn process_group(pid: u32) -> Option<u32> {
    nix::unistd::getpgid(Some(Pid::from_raw(pid as i32)))
        .ok()
        .map(|pgid| pgid.as_raw() as u32)
}

/// True while the process exists (zombies included)
pub fn is_alive(pid: u32) -> bool {
    signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Send a signal to one process
pub fn send_signal(pid: u32, sig: Signal) -> Result<()> {
    signal::kill(Pid::from_raw(pid as i32), sig)
        .with_context(|| format!("Failed to send {:?} to {}", sig, pid))
}

/// Send a signal to a whole process group
pub fn signal_group(pgid: u32, sig: Signal) -> Result<()> {
    signal::killpg(Pid::from_raw(pgid as i32), sig)
        .with_context(|| format!("Failed to send {:?} to group {}", sig, pgid))
}

/// How a termination attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Already gone before any signal
    AlreadyExited,
    /// Exited after SIGTERM
    Terminated,
    /// Needed SIGKILL
    Killed,
    /// Still alive after SIGKILL
    Failed,
}

/// Terminate a process (or its group), escalating to SIGKILL only after
/// `retries` SIGTERM rounds each followed by `grace`.
pub async fn terminate_escalating(
    pid: u32,
    group: bool,
    grace: Duration,
    retries: u32,
) -> Termination {
    let target_alive = || is_alive(pid);
    let send = |sig: Signal| {
        let result = if group {
            signal_group(pid, sig)
        } else {
            send_signal(pid, sig)
        };
        if let Err(e) = result {
            debug!("{:#}", e);
        }
    };

    if !target_alive() {
        return Termination::AlreadyExited;
    }
    for _ in 0..retries.max(1) {
        send(Signal::SIGTERM);
        tokio::time::sleep(grace).await;
        if !target_alive() {
            return Termination::Terminated;
        }
    }
    send(Signal::SIGKILL);
    tokio::time::sleep(grace).await;
    if target_alive() {
        Termination::Failed
    } else {
        Termination::Killed
    }
}
