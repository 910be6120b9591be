//! Discovery orchestration.
//!
//! Drives the scan, merge and generate cycle over the configured probes and
//! reports status and events for the CLI or an embedding service.

pub mod orchestrator;
pub mod state;

pub use orchestrator::{backoff_cycles, load_status, read_status_file, Orchestrator, STATUS_DOCUMENT};
pub use state::{CycleReport, OrchestratorState, ProbeSummary, StatusReport};
