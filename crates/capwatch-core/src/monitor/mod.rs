//! Coordinator: runs the poll loop and exposes the snapshot API.

mod builder;
pub mod cadence;
mod coordinator;
mod events;
mod poller;

pub use builder::UsageMonitorBuilder;
pub use cadence::{is_urgent, poll_interval};
pub use coordinator::{MonitorError, UsageMonitor};
pub use events::MonitorEvent;
pub use poller::Poller;
