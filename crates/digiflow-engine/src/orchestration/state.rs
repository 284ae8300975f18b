//! Run state machine and per-phase records.
//!
//! A run moves `Initial → Main → Completion → Reporting → Done`. `Failed` is
//! reachable from the three execution phases and `Cancelled` from any
//! non-terminal state; both are absorbing.

use std::fmt;

use crate::pool::{Completion, WorkerError};
use crate::task::TaskResult;

/// One of the three execution phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Initial,
    Main,
    Completion,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initial => "initial",
            Self::Main => "main",
            Self::Completion => "completion",
        };
        f.write_str(s)
    }
}

/// State of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    Initial,
    Main,
    Completion,
    Reporting,
    Done,
    Failed,
    Cancelled,
}

impl RunState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }

    pub const fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Initial, Self::Main)
            | (Self::Main, Self::Completion)
            | (Self::Completion, Self::Reporting)
            | (Self::Reporting, Self::Done)
            | (Self::Initial | Self::Main | Self::Completion, Self::Failed) => true,
            (state, Self::Cancelled) => !state.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initial => "initial",
            Self::Main => "main",
            Self::Completion => "completion",
            Self::Reporting => "reporting",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Terminal outcome of one phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    Succeeded,
    Failed { reason: String },
    Cancelled,
}

/// Everything one phase produced, tagged with how it ended.
///
/// Records of failed or cancelled phases keep whatever partial results
/// arrived before the phase ended.
#[derive(Debug, Clone)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub outcome: PhaseOutcome,
    /// Number of jobs submitted for this phase.
    pub submitted: usize,
    /// Results in completion order.
    pub results: Vec<TaskResult>,
    pub errors: Vec<WorkerError>,
}

impl PhaseRecord {
    pub(crate) const fn new(phase: Phase, submitted: usize) -> Self {
        Self {
            phase,
            outcome: PhaseOutcome::Succeeded,
            submitted,
            results: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub(crate) fn absorb(&mut self, completion: Completion) {
        if let Some(result) = completion.result {
            self.results.push(result);
        }
        if let Some(error) = completion.error {
            self.errors.push(error);
        }
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == PhaseOutcome::Succeeded
    }
}

/// Human-readable description of why a run stopped early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseFailure {
    pub phase: Phase,
    pub reason: String,
    /// Per-task error lines, for an expandable detail view.
    pub detail: Option<String>,
}

impl PhaseFailure {
    pub fn summary(&self) -> String {
        format!("The {} phase failed: {}", self.phase, self.reason)
    }
}
