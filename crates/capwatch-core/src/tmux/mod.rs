mod client;
mod pane;
pub mod process;

pub use client::{
    label_from_cmdline, label_from_tmux_env, list_socket_labels, socket_dir, validate_label,
    TmuxClient, PURPOSE_OPTION, PURPOSE_STATUS_PROBE,
};
pub use pane::PaneInfo;
pub use process::{ProcessInspector, Termination};
