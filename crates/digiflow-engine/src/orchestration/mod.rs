//! Three-phase orchestration of a [`Job`](crate::job::Job).

pub mod orchestrator;
pub mod state;

pub use orchestrator::{Orchestrator, RunSummary};
pub use state::{Phase, PhaseFailure, PhaseOutcome, PhaseRecord, RunState};
