//! Usage data: model, log scanning, and staleness policy.
//!
//! The scanner reads quota events passively from local session logs;
//! the policy layer decides when that data is too old to trust.

pub mod decoders;
pub mod policy;
pub mod scanner;
pub mod timestamp;
pub mod types;
pub mod watcher;

pub use policy::{is_stale, FreshnessTtl, SourceModel, Staleness};
pub use scanner::{LogScanner, ScanOptions};
pub use timestamp::{decode_timestamp, describe_reset, from_epoch};
pub use types::{
    clamp_percent, AgentKind, QuotaReading, QuotaWindow, RateLimitSummary, RateLimitWindowInfo,
    ScanReport, TokenSample, TokenUsage, UsageSnapshot, WindowReading,
};
pub use watcher::LogWatcher;
