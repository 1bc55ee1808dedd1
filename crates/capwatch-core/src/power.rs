//! Power-source detection used to slow polling on battery.

use std::path::PathBuf;

/// Reports whether the machine currently runs on battery
pub trait PowerSource: Send + Sync {
    fn on_battery(&self) -> bool;
}

/// Reads `/sys/class/power_supply`.
///
/// On battery when at least one battery exists and no mains adapter
/// reports `online`. Machines without power-supply entries count as mains.
pub struct SysfsPowerSource {
    root: PathBuf,
}

impl SysfsPowerSource {
    pub fn new() -> Self {
        Self::with_root("/sys/class/power_supply")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for SysfsPowerSource {
    fn default() -> Self {
        Self::new()
    }
}

impl PowerSource for SysfsPowerSource {
    fn on_battery(&self) -> bool {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return false;
        };
        let read = |dir: &PathBuf, file: &str| {
            std::fs::read_to_string(dir.join(file))
                .map(|s| s.trim().to_string())
                .unwrap_or_default()
        };

        let mut has_battery = false;
        for entry in entries.filter_map(|e| e.ok()) {
            let dir = entry.path();
            match read(&dir, "type").as_str() {
                "Mains" | "USB" if read(&dir, "online") == "1" => return false,
                "Battery" => has_battery = true,
                _ => {}
            }
        }
        has_battery
    }
}

/// Fixed answer, for tests and platforms without detection
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedPower(pub bool);

impl PowerSource for FixedPower {
    fn on_battery(&self) -> bool {
        self.0
    }
}
