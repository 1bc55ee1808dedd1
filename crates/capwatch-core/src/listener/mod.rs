//! Passive listener: one long-running CLI child whose output is watched
//! for quota and account lines.

mod backoff;
pub mod parser;
mod supervisor;

pub use backoff::Backoff;
pub use parser::{parse_status_line, parse_status_text, strip_ansi, StatusLine};
pub use supervisor::{ListenerEvent, ListenerEventSender, ListenerState, ListenerSupervisor};
