//! Binary resolution, consumed as a capability.
//!
//! GUI-launched processes often inherit a minimal `PATH`, so the default
//! resolver asks the user's login shell where a command lives.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Upper bound on one login-shell lookup
pub const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolves a command name to an executable path. Implementations may block.
pub trait BinaryResolver: Send + Sync {
    /// Absolute path of `name`, if it can be found
    fn resolve(&self, name: &str) -> Option<PathBuf>;
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Resolves through `$SHELL -lc 'command -v -- "$1"'`, caching hits
pub struct LoginShellResolver {
    shell: PathBuf,
    timeout: Duration,
    cache: Mutex<HashMap<String, PathBuf>>,
}

impl LoginShellResolver {
    pub fn new() -> Self {
        let shell = std::env::var_os("SHELL")
            .map(PathBuf::from)
            .filter(|p| p.is_absolute())
            .unwrap_or_else(|| PathBuf::from("/bin/sh"));
        Self::with_shell(shell)
    }

    /// Use a specific shell
    pub fn with_shell(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
            timeout: RESOLVE_TIMEOUT,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn lookup(&self, name: &str) -> Option<PathBuf> {
        let mut child = Command::new(&self.shell)
            .args(["-lc", r#"command -v -- "$1""#, "capwatch-resolve", name])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| warn!("Failed to run {}: {}", self.shell.display(), e))
            .ok()?;

        let deadline = Instant::now() + self.timeout;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(25));
                }
                Ok(None) => {
                    warn!("Login shell lookup of {} timed out", name);
                    let _ = child.kill();
                    let _ = child.wait();
                    return None;
                }
                Err(e) => {
                    warn!("Login shell lookup of {} failed: {}", name, e);
                    return None;
                }
            }
        }

        let mut stdout = String::new();
        child.stdout.take()?.read_to_string(&mut stdout).ok()?;
        stdout
            .lines()
            .map(str::trim)
            .filter(|l| l.starts_with('/'))
            .map(PathBuf::from)
            .find(|p| is_executable(p))
    }
}

impl Default for LoginShellResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl BinaryResolver for LoginShellResolver {
    fn resolve(&self, name: &str) -> Option<PathBuf> {
        if name.contains('/') {
            let path = PathBuf::from(name);
            return is_executable(&path).then_some(path);
        }
        if let Some(hit) = self.cache.lock().get(name) {
            if is_executable(hit) {
                return Some(hit.clone());
            }
        }
        let resolved = self.lookup(name)?;
        debug!("Resolved {} -> {}", name, resolved.display());
        self.cache.lock().insert(name.to_string(), resolved.clone());
        Some(resolved)
    }
}

/// Fixed name-to-path table
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    paths: HashMap<String, PathBuf>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `name` to `path`
    pub fn with(mut self, name: &str, path: impl Into<PathBuf>) -> Self {
        self.paths.insert(name.to_string(), path.into());
        self
    }
}

impl BinaryResolver for StaticResolver {
    fn resolve(&self, name: &str) -> Option<PathBuf> {
        self.paths.get(name).cloned()
    }
}
