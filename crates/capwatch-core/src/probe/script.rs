use anyhow::{Context, Result};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Probe script body
pub const PROBE_SCRIPT: &str = include_str!("status_probe.sh");

/// File name of the materialized script; also used to recognize it in `/proc`
pub const SCRIPT_NAME: &str = "capwatch-status-probe.sh";

/// Value of `CAPWATCH_PROBE_OWNER` in every probe process environment
pub const OWNER_ENV: &str = "CAPWATCH_PROBE_OWNER";
pub const OWNER_VALUE: &str = "capwatch";

/// Runtime directory for capwatch, preferring XDG_RUNTIME_DIR
pub fn runtime_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(xdg).join("capwatch")
    } else {
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/capwatch-{}", uid))
    }
}

/// Write the script into `dir` (mode 0700), rewriting it only when it changed
pub fn materialize(dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
        .with_context(|| format!("Failed to restrict {}", dir.display()))?;

    let path = dir.join(SCRIPT_NAME);
    let current = std::fs::read_to_string(&path).ok();
    if current.as_deref() != Some(PROBE_SCRIPT) {
        std::fs::write(&path, PROBE_SCRIPT)
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))
        .with_context(|| format!("Failed to chmod {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_materialize_writes_executable_script() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("rt");
        let path = materialize(&dir).unwrap();
        assert!(path.ends_with(SCRIPT_NAME));
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), PROBE_SCRIPT);

        // Idempotent
        assert_eq!(materialize(&dir).unwrap(), path);
    }

    #[test]
    fn test_runtime_dir_honors_xdg() {
        temp_env::with_var("XDG_RUNTIME_DIR", Some("/run/user/1000"), || {
            assert_eq!(runtime_dir(), PathBuf::from("/run/user/1000/capwatch"));
        });
    }

    #[test]
    fn test_script_declares_purpose_and_owner() {
        assert!(PROBE_SCRIPT.contains("@capwatch_purpose status-probe"));
        assert!(PROBE_SCRIPT.contains(OWNER_ENV));
        assert!(PROBE_SCRIPT.contains("kill-server"));
    }
}
