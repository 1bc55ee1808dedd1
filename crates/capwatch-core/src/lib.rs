//! capwatch-core: rate-limit quota monitoring for AI coding-agent CLIs.
//!
//! Usage arrives from three places: session logs on disk ([`usage`]), a
//! supervised long-running CLI child ([`listener`]), and one-shot status
//! probes inside isolated tmux servers ([`probe`]). The [`monitor`] module
//! merges them into one snapshot and forecasts cap pressure ([`estimator`]).

pub mod binaries;
pub mod config;
pub mod estimator;
pub mod listener;
pub mod monitor;
pub mod power;
pub mod probe;
pub mod state;
pub mod tmux;
pub mod usage;
