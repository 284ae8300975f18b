//! The pluggable three-phase job description consumed by the orchestrator.
//!
//! A [`Job`] supplies task metadata at three points in time (initial, main,
//! completion) and turns the accumulated results into a report. Concrete
//! jobs (checksums, package conversion, metadata lookups) live outside this
//! crate.

use async_trait::async_trait;
use serde_json::Value;

use crate::task::{TaskBuilder, TaskResult};

pub use crate::task::Settings;

/// User options rejected before any task is built.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ValidationError {
    pub message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Failure of a job hook while it describes tasks.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("{0}")]
    Message(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl JobError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

/// Outcome of the interactive step between the initial and main phases.
#[derive(Debug, Clone, PartialEq)]
pub enum Interaction {
    /// Proceed, optionally with extra data for metadata discovery.
    Continue(Option<Value>),
    /// The user backed out; the run ends as cancelled, not failed.
    Cancelled,
    /// The step could not complete.
    Failed(String),
}

/// A three-phase job description.
#[async_trait]
pub trait Job: Send + Sync {
    /// Display name, used in progress titles and logs.
    fn name(&self) -> &str;

    fn validate_options(&self, _options: &Settings) -> Result<(), ValidationError> {
        Ok(())
    }

    /// Register pre-step work on `builder`. Default: none.
    fn initial_task(
        &self,
        _builder: &mut TaskBuilder,
        _options: &Settings,
    ) -> Result<(), JobError> {
        Ok(())
    }

    /// Ask the user for anything the main phase needs. Default: continue
    /// with no extra data.
    async fn get_additional_info(
        &self,
        _options: &Settings,
        _pre_results: &[TaskResult],
    ) -> Interaction {
        Interaction::Continue(None)
    }

    /// One argument map per main-phase unit.
    fn discover_task_metadata(
        &self,
        pre_results: &[TaskResult],
        additional: Option<&Value>,
        options: &Settings,
    ) -> Result<Vec<Settings>, JobError>;

    /// Populate `builder` with the subtasks for one unit.
    fn create_new_task(
        &self,
        builder: &mut TaskBuilder,
        job_args: &Settings,
    ) -> Result<(), JobError>;

    /// Register post-step work given everything produced so far. Default: none.
    fn completion_task(
        &self,
        _builder: &mut TaskBuilder,
        _results: &[TaskResult],
        _options: &Settings,
    ) -> Result<(), JobError> {
        Ok(())
    }

    /// Render a report over all results, if the job has one.
    fn generate_report(&self, _results: &[TaskResult], _options: &Settings) -> Option<String> {
        None
    }
}
