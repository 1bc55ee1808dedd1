//! Active status probe: a one-shot status query run inside an isolated
//! tmux server, plus cleanup of whatever probes leave behind.

mod artifacts;
mod cleanup;
mod envelope;
mod orchestrator;
pub mod script;
mod types;

pub use artifacts::{inspect_log, ArtifactScan, ArtifactSignals, SessionLogCleaner};
pub use cleanup::{OrphanSweeper, SweepPlan};
pub use envelope::parse_envelope;
pub use orchestrator::{generate_label, ProbeOrchestrator};
pub use types::{
    CleanupError, CleanupOutcome, OrphanCandidate, OrphanEvidence, OrphanSweepReport,
    ProbeDiagnostics, ProbeOutcome,
};
