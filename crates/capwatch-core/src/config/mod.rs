mod settings;

pub use settings::{
    default_session_roots, CapPressureSettings, CleanupMode, CleanupSettings, Command, Config,
    ListenerSettings, MonitorSettings, ProbeSettings, ScannerSettings, Settings,
};
