//! Subtask status and the shared cell that carries it across the pool boundary.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Lifecycle of a single subtask. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not yet started.
    #[default]
    Idle,
    /// `work()` is running.
    Working,
    /// `work()` returned `true`.
    Success,
    /// `work()` returned `false` or an error.
    Failed,
}

impl TaskStatus {
    /// Whether this status is past `Working`.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Whether moving from `self` to `next` is a forward transition.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Working | Self::Success | Self::Failed)
                | (Self::Working, Self::Success | Self::Failed)
        )
    }

    /// Derive the status of a group from its members.
    ///
    /// FAILED if any member failed; else WORKING if any is working; else
    /// SUCCESS if all succeeded (including the empty group); else IDLE.
    pub fn aggregate<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = Self>,
    {
        let mut any_working = false;
        let mut all_success = true;
        for status in statuses {
            match status {
                Self::Failed => return Self::Failed,
                Self::Working => {
                    any_working = true;
                    all_success = false;
                }
                Self::Idle => all_success = false,
                Self::Success => {}
            }
        }
        if any_working {
            Self::Working
        } else if all_success {
            Self::Success
        } else {
            Self::Idle
        }
    }

    const fn to_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Working => 1,
            Self::Success => 2,
            Self::Failed => 3,
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Working,
            2 => Self::Success,
            3 => Self::Failed,
            _ => Self::Idle,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Working => "working",
            Self::Success => "success",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Shared, atomically updated status of one subtask.
///
/// The subtask owns one clone and its composite keeps another, so the
/// composite can observe the child while it runs inside a worker.
#[derive(Debug, Clone, Default)]
pub struct StatusCell(Arc<AtomicU8>);

impl StatusCell {
    /// Create a cell in the `Idle` state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cell already holding `status`.
    pub fn with_status(status: TaskStatus) -> Self {
        Self(Arc::new(AtomicU8::new(status.to_u8())))
    }

    /// Current status.
    pub fn get(&self) -> TaskStatus {
        TaskStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `next` if that is a forward transition.
    ///
    /// Returns `false` (and leaves the cell untouched) otherwise.
    pub fn advance(&self, next: TaskStatus) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if !TaskStatus::from_u8(current).can_transition_to(next) {
                return false;
            }
            match self.0.compare_exchange_weak(
                current,
                next.to_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }
}
