mod store;

pub use store::{snapshot_channel, MonitorState, SharedState, SnapshotReceiver, SnapshotSender};
