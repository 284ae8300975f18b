//! Bridges a [`Subtask`] into the shape the pool manager runs.

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::task::{Settings, StatusCell, Subtask, TaskError, TaskResult, TaskStatus};

/// Typed wrapper that lets a subtask cross the worker boundary.
///
/// The wrapped subtask keeps the log sink it was built with; a subtask
/// destined for the pool should be built with the manager's
/// [`ChannelLog`](crate::log::ChannelLog) so its records reach the host.
#[derive(Debug)]
pub struct WorkerAdapter {
    task: Subtask,
}

impl WorkerAdapter {
    pub const fn new(task: Subtask) -> Self {
        Self { task }
    }

    pub const fn id(&self) -> Uuid {
        self.task.id()
    }

    pub fn name(&self) -> &str {
        self.task.name()
    }

    pub fn status(&self) -> TaskStatus {
        self.task.status()
    }

    pub(crate) fn status_cell(&self) -> StatusCell {
        self.task.status_cell()
    }

    /// Settings to submit with this job: the subtask's declared settings,
    /// or else its serialisable state.
    pub fn settings(&self) -> Settings {
        if let Some(declared) = self.task.declared_settings() {
            return declared;
        }
        match serde_json::to_value(self.task.state()) {
            Ok(Value::Object(map)) => map,
            _ => Settings::new(),
        }
    }

    /// Execute the subtask with `args` and hand back the result it stored.
    pub fn process(
        &mut self,
        args: &Settings,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<TaskResult>, TaskError> {
        self.task.execute(args, cancel)?;
        Ok(self.task.take_result())
    }

    pub fn into_inner(self) -> Subtask {
        self.task
    }
}
