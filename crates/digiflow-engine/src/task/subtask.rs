//! The smallest schedulable unit of work.
//!
//! A [`Subtask`] wraps a user-supplied [`Executable`] body together with its
//! log sink, working directory, status cell and (eventual) result. The body
//! never sees those directly; it talks to a [`WorkContext`] instead.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::Settings;
use super::result::TaskResult;
use super::status::{StatusCell, TaskStatus};
use crate::log::{LogLevel, LogRecord, LogSink};

/// Failure raised out of [`Executable::work`].
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("{0}")]
    Message(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Task cancelled")]
    Cancelled,
}

impl TaskError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

/// Capability implemented by every unit of work the engine can run.
///
/// `work` is the only required behaviour: `Ok(true)` marks the subtask
/// SUCCESS, `Ok(false)` marks it FAILED, and `Err` marks it FAILED and
/// propagates to whoever is executing it.
pub trait Executable: Send + 'static {
    /// Stable identity of this unit-of-work type; becomes [`TaskResult::source`].
    fn kind(&self) -> &str;

    /// Human-readable name, used in logs and handles.
    fn name(&self) -> String {
        self.kind().to_string()
    }

    /// Settings this unit declares for submission. When `None`, the
    /// subtask's serialisable state is submitted instead.
    fn settings(&self) -> Option<Settings> {
        None
    }

    fn work(&mut self, ctx: &mut WorkContext<'_>) -> Result<bool, TaskError>;
}

/// What a running [`Executable`] can see of its surroundings.
pub struct WorkContext<'a> {
    name: &'a str,
    log: &'a dyn LogSink,
    working_dir: &'a Path,
    settings: &'a Settings,
    cancel: Option<&'a CancellationToken>,
    result: Option<Value>,
}

impl<'a> WorkContext<'a> {
    fn new(
        name: &'a str,
        log: &'a dyn LogSink,
        working_dir: &'a Path,
        settings: &'a Settings,
        cancel: Option<&'a CancellationToken>,
    ) -> Self {
        Self {
            name,
            log,
            working_dir,
            settings,
            cancel,
            result: None,
        }
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.log.append(LogRecord::new(level, self.name, message));
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    /// Attach output data. A `null` value yields no result.
    pub fn set_result(&mut self, data: Value) {
        self.result = Some(data);
    }

    pub const fn working_dir(&self) -> &Path {
        self.working_dir
    }

    /// Settings the job was submitted with (empty when run inline).
    pub const fn settings(&self) -> &Settings {
        self.settings
    }

    /// Whether the pool has asked running jobs to stop. Long-running bodies
    /// should check this between units of work.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_some_and(CancellationToken::is_cancelled)
    }
}

/// Serialisable state of a subtask, without its log sink or body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskState {
    pub id: Uuid,
    pub name: String,
    pub kind: String,
    pub status: TaskStatus,
    pub working_dir: PathBuf,
}

/// A scheduled unit of work with its own log sink and result slot.
pub struct Subtask {
    id: Uuid,
    name: String,
    kind: String,
    body: Box<dyn Executable>,
    status: StatusCell,
    log: Arc<dyn LogSink>,
    working_dir: PathBuf,
    result: Option<TaskResult>,
}

impl std::fmt::Debug for Subtask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subtask")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("status", &self.status.get())
            .finish_non_exhaustive()
    }
}

impl Subtask {
    /// Create a subtask around `body`, logging into `log`.
    pub fn new(
        body: impl Executable,
        log: Arc<dyn LogSink>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self::from_boxed(Box::new(body), log, working_dir.into())
    }

    pub(crate) fn from_boxed(
        body: Box<dyn Executable>,
        log: Arc<dyn LogSink>,
        working_dir: PathBuf,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: body.name(),
            kind: body.kind().to_string(),
            body,
            status: StatusCell::new(),
            log,
            working_dir,
            result: None,
        }
    }

    pub const fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn status(&self) -> TaskStatus {
        self.status.get()
    }

    pub(crate) fn status_cell(&self) -> StatusCell {
        self.status.clone()
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub const fn result(&self) -> Option<&TaskResult> {
        self.result.as_ref()
    }

    pub const fn take_result(&mut self) -> Option<TaskResult> {
        self.result.take()
    }

    /// Settings declared by the body, if any.
    pub fn declared_settings(&self) -> Option<Settings> {
        self.body.settings()
    }

    /// Serialisable state, excluding the log sink.
    pub fn state(&self) -> SubtaskState {
        SubtaskState {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind.clone(),
            status: self.status.get(),
            working_dir: self.working_dir.clone(),
        }
    }

    /// Append an info record to this subtask's log sink.
    pub fn log(&self, message: impl Into<String>) {
        self.log
            .append(LogRecord::new(LogLevel::Info, self.name.as_str(), message));
    }

    /// Run the body in the current thread with no settings.
    pub fn run(&mut self) -> Result<bool, TaskError> {
        self.execute(&Settings::new(), None)
    }

    /// Run the body, driving the status cell through WORKING to its
    /// terminal state and capturing any non-null result.
    pub fn execute(
        &mut self,
        settings: &Settings,
        cancel: Option<&CancellationToken>,
    ) -> Result<bool, TaskError> {
        if !self.status.advance(TaskStatus::Working) {
            return Err(TaskError::msg(format!(
                "subtask {} already ran (status {})",
                self.name,
                self.status.get()
            )));
        }
        debug!(task = %self.name, id = %self.id, "Subtask started");

        let mut ctx = WorkContext::new(
            &self.name,
            self.log.as_ref(),
            &self.working_dir,
            settings,
            cancel,
        );
        let outcome = self.body.work(&mut ctx);
        let data = ctx.result.take();

        if let Some(data) = data
            && !data.is_null()
        {
            self.result = Some(TaskResult::new(self.kind.as_str(), data));
        }

        let terminal = match outcome {
            Ok(true) => TaskStatus::Success,
            Ok(false) | Err(_) => TaskStatus::Failed,
        };
        self.status.advance(terminal);
        debug!(task = %self.name, status = %terminal, "Subtask finished");
        outcome
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::log::BufferLog;
    use serde_json::json;

    struct Fixed {
        ok: bool,
        data: Value,
    }

    impl Executable for Fixed {
        fn kind(&self) -> &str {
            "fixed"
        }

        fn work(&mut self, ctx: &mut WorkContext<'_>) -> Result<bool, TaskError> {
            ctx.info("working");
            ctx.set_result(self.data.clone());
            Ok(self.ok)
        }
    }

    struct Broken;

    impl Executable for Broken {
        fn kind(&self) -> &str {
            "broken"
        }

        fn work(&mut self, _ctx: &mut WorkContext<'_>) -> Result<bool, TaskError> {
            Err(TaskError::msg("disk on fire"))
        }
    }

    fn subtask(body: impl Executable) -> (Subtask, BufferLog) {
        let log = BufferLog::new();
        (Subtask::new(body, Arc::new(log.clone()), "/tmp"), log)
    }

    #[test]
    fn success_with_result() {
        let (mut task, log) = subtask(Fixed {
            ok: true,
            data: json!({"md5": "abc"}),
        });
        assert_eq!(task.status(), TaskStatus::Idle);
        assert!(task.run().unwrap());
        assert_eq!(task.status(), TaskStatus::Success);

        let result = task.result().unwrap();
        assert_eq!(result.source(), "fixed");
        assert_eq!(result.data()["md5"], "abc");
        assert_eq!(log.records()[0].source, "fixed");
    }

    #[test]
    fn success_without_result_is_valid() {
        let (mut task, _log) = subtask(Fixed {
            ok: true,
            data: Value::Null,
        });
        assert!(task.run().unwrap());
        assert_eq!(task.status(), TaskStatus::Success);
        assert!(task.result().is_none());
    }

    #[test]
    fn false_marks_failed() {
        let (mut task, _log) = subtask(Fixed {
            ok: false,
            data: Value::Null,
        });
        assert!(!task.run().unwrap());
        assert_eq!(task.status(), TaskStatus::Failed);
    }

    #[test]
    fn error_marks_failed_and_propagates() {
        let (mut task, _log) = subtask(Broken);
        let err = task.run().unwrap_err();
        assert_eq!(err.to_string(), "disk on fire");
        assert_eq!(task.status(), TaskStatus::Failed);
    }

    #[test]
    fn second_run_is_rejected() {
        let (mut task, _log) = subtask(Fixed {
            ok: true,
            data: Value::Null,
        });
        task.run().unwrap();
        assert!(task.run().is_err());
        assert_eq!(task.status(), TaskStatus::Success);
    }

    #[test]
    fn state_excludes_log_and_serialises() {
        let (task, _log) = subtask(Broken);
        let state = serde_json::to_value(task.state()).unwrap();
        assert_eq!(state["kind"], "broken");
        assert_eq!(state["status"], "idle");
        assert!(state.get("log").is_none());
    }
}
